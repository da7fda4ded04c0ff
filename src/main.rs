use anyhow::{Context, Result};
use log::info;

use avsync_player::app::VideoPlayerApp;
use avsync_player::core::PlayerConfig;
use avsync_player::player::PlaybackManager;

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        // 过滤掉 wgpu_hal 和 wgpu_core 的警告日志，减少日志噪音
        .filter_module("wgpu_hal", log::LevelFilter::Error)
        .filter_module("wgpu_core", log::LevelFilter::Error)
        .init();

    let mut args = std::env::args().skip(1);
    let input = match args.next() {
        Some(input) => input,
        None => rfd::FileDialog::new()
            .add_filter("媒体文件", &["mp4", "mkv", "avi", "mov", "flv", "webm", "ts", "mp3", "flac", "wav"])
            .pick_file()
            .map(|path| path.to_string_lossy().into_owned())
            .context("用法: avsync_player <文件或URL> [配置.json]")?,
    };
    let config = match args.next() {
        Some(path) => PlayerConfig::from_json_file(&path)
            .with_context(|| format!("加载配置文件 {} 失败", path))?,
        None => PlayerConfig::default(),
    };
    let (width, height) = (config.default_width, config.default_height);

    info!("🎬 avsync_player 启动: {}", input);
    let mut manager = PlaybackManager::new(config).context("FFmpeg 初始化失败")?;
    manager.open_url(&input)?;

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([width as f32, height as f32])
            .with_title(input.clone()),
        renderer: eframe::Renderer::Wgpu,
        ..Default::default()
    };

    eframe::run_native(
        "avsync_player",
        options,
        Box::new(move |cc| Box::new(VideoPlayerApp::new(cc, manager, input))),
    )
    .map_err(|e| anyhow::anyhow!("应用启动失败: {}", e))?;

    Ok(())
}
