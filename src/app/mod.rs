use egui::{Context, FontData, FontDefinitions, FontFamily, Key, Ui};
use log::{error, info, warn};
use std::path::Path;
use std::time::Duration;

use crate::core::{MediaKind, PlaybackState};
use crate::player::manager::PlaybackManager;
use crate::player::PlayerEvent;
use crate::renderer::egui_video_renderer::EguiVideoRenderer;

/// 音量键每次调整的分贝数
const VOLUME_STEP_DB: f64 = 0.75;
/// 上下方向键的 seek 步长（秒）
const LONG_SEEK: f64 = 60.0;
/// 没有章节时 PageUp/PageDown 的 seek 步长（秒）
const PAGE_SEEK: f64 = 600.0;

pub struct VideoPlayerApp {
    /// 播放管理器
    manager: PlaybackManager,

    /// egui 视频渲染器
    renderer: EguiVideoRenderer,

    /// 当前打开的文件或 URL
    current: String,

    /// 信息面板可见性
    info_panel_visible: bool,

    /// 最近一次会话错误
    last_error: Option<String>,
}

impl VideoPlayerApp {
    pub fn new(cc: &eframe::CreationContext<'_>, manager: PlaybackManager, current: String) -> Self {
        info!("🎮 初始化 VideoPlayerApp");
        Self::setup_chinese_fonts(&cc.egui_ctx);
        Self::setup_window_theme(&cc.egui_ctx);
        Self {
            manager,
            renderer: EguiVideoRenderer::new(cc.egui_ctx.clone()),
            current,
            info_panel_visible: false,
            last_error: None,
        }
    }

    /// 深色背景
    fn setup_window_theme(ctx: &Context) {
        let mut style = (*ctx.style()).clone();
        style.visuals.dark_mode = true;
        style.visuals.window_fill = egui::Color32::from_rgb(29, 29, 29);
        style.visuals.panel_fill = egui::Color32::BLACK;
        ctx.set_style(style);
    }

    /// 配置中文字体支持
    fn setup_chinese_fonts(ctx: &Context) {
        let mut fonts = FontDefinitions::default();

        #[cfg(target_os = "windows")]
        let candidates = ["C:/Windows/Fonts/msyh.ttc", "C:/Windows/Fonts/simhei.ttf"];
        #[cfg(target_os = "macos")]
        let candidates = [
            "/System/Library/Fonts/PingFang.ttc",
            "/System/Library/Fonts/STHeiti Light.ttc",
        ];
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        let candidates = [
            "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
            "/usr/share/fonts/truetype/wqy/wqy-microhei.ttc",
        ];

        let loaded = candidates
            .iter()
            .filter(|path| Path::new(path).exists())
            .find_map(|path| match std::fs::read(path) {
                Ok(data) => Some((path, data)),
                Err(e) => {
                    warn!("⚠️ 无法读取字体文件 {}: {}", path, e);
                    None
                }
            });
        match loaded {
            Some((path, data)) => {
                fonts
                    .font_data
                    .insert("chinese_font".to_owned(), FontData::from_owned(data));
                for family in [FontFamily::Proportional, FontFamily::Monospace] {
                    if let Some(list) = fonts.families.get_mut(&family) {
                        list.insert(0, "chinese_font".to_owned());
                    }
                }
                info!("✅ 成功加载中文字体: {}", path);
            }
            None => warn!("⚠️ 未找到可用的中文字体文件，中文可能显示为方块"),
        }
        ctx.set_fonts(fonts);
    }

    /// 处理读取线程发来的会话事件
    fn handle_events(&mut self, ctx: &Context) {
        while let Some(event) = self.manager.poll_event() {
            match event {
                PlayerEvent::StreamOpened { kind, index } => {
                    info!("📺 已打开 {} 流 #{}", kind.as_str(), index)
                }
                PlayerEvent::StreamClosed { kind, index } => {
                    info!("已关闭 {} 流 #{}", kind.as_str(), index)
                }
                PlayerEvent::EndOfStream => info!("🏁 播放结束: {}", self.current),
                PlayerEvent::Error(message) => {
                    error!("❌ 播放失败: {}", message);
                    self.last_error = Some(message);
                }
                PlayerEvent::Exited => {
                    if self.manager.config().autoexit || self.last_error.is_some() {
                        ctx.send_viewport_cmd(egui::ViewportCommand::Close);
                    }
                }
            }
        }
    }

    /// 处理键盘输入
    fn handle_keyboard_input(&mut self, ctx: &Context) {
        let pressed: Vec<Key> = ctx.input(|i| {
            i.events
                .iter()
                .filter_map(|event| match event {
                    egui::Event::Key {
                        key, pressed: true, ..
                    } => Some(*key),
                    _ => None,
                })
                .collect()
        });

        let seek_interval = self.manager.config().seek_interval;
        for key in pressed {
            match key {
                Key::Q | Key::Escape => ctx.send_viewport_cmd(egui::ViewportCommand::Close),
                Key::F => self.manager.toggle_fullscreen(&mut self.renderer),
                Key::P | Key::Space => self.manager.toggle_pause(),
                Key::M => {
                    let muted = self.manager.toggle_mute();
                    info!("🔇 静音: {}", muted);
                }
                Key::Num9 => self.manager.update_volume(-1, VOLUME_STEP_DB),
                Key::Num0 => self.manager.update_volume(1, VOLUME_STEP_DB),
                Key::S => self.manager.step_to_next_frame(),
                Key::A => self.manager.cycle_stream(MediaKind::Audio),
                Key::V => self.manager.cycle_stream(MediaKind::Video),
                Key::T => self.manager.cycle_stream(MediaKind::Subtitle),
                Key::C => {
                    for kind in MediaKind::ALL {
                        self.manager.cycle_stream(kind);
                    }
                }
                Key::W => self.manager.toggle_display_mode(),
                Key::ArrowLeft => self.manager.seek_relative(-seek_interval),
                Key::ArrowRight => self.manager.seek_relative(seek_interval),
                Key::ArrowUp => self.manager.seek_relative(LONG_SEEK),
                Key::ArrowDown => self.manager.seek_relative(-LONG_SEEK),
                Key::PageUp | Key::PageDown => {
                    let incr = if key == Key::PageUp { 1 } else { -1 };
                    let has_chapters = self
                        .manager
                        .media_info()
                        .map_or(false, |info| !info.chapters.is_empty());
                    if has_chapters {
                        self.manager.seek_chapter(incr);
                    } else {
                        self.manager.seek_relative(incr as f64 * PAGE_SEEK);
                    }
                }
                Key::Tab => self.info_panel_visible = !self.info_panel_visible,
                _ => {}
            }
        }
    }

    /// 渲染视频区域：双击全屏，右键按横向位置跳转
    fn render_video_area(&mut self, ui: &mut Ui) {
        let area = ui.available_rect_before_wrap();
        self.renderer
            .set_viewport(area.width().max(1.0) as u32, area.height().max(1.0) as u32);
        self.renderer.paint(ui, area);

        let response = ui.interact(area, ui.id().with("video_area"), egui::Sense::click());
        if response.double_clicked() {
            self.manager.toggle_fullscreen(&mut self.renderer);
        } else if response.secondary_clicked() {
            let duration = self.manager.media_info().and_then(|info| info.duration);
            if let (Some(pos), Some(duration)) = (response.interact_pointer_pos(), duration) {
                let frac = ((pos.x - area.left()) / area.width().max(1.0)).clamp(0.0, 1.0) as f64;
                info!(
                    "🎯 跳到 {:.0}% ({} / {})",
                    frac * 100.0,
                    format_time(frac * duration),
                    format_time(duration)
                );
                self.manager.seek_to(frac * duration);
            }
        }
    }

    /// 渲染信息面板
    fn render_info_panel(&self, ctx: &Context) {
        if !self.info_panel_visible {
            return;
        }
        let status = self.manager.status();
        let info = self.manager.media_info();

        egui::Window::new("Media Info")
            .anchor(egui::Align2::LEFT_TOP, egui::Vec2::new(10.0, 10.0))
            .resizable(false)
            .collapsible(true)
            .frame(egui::Frame::window(&ctx.style()).fill(egui::Color32::from_black_alpha(200)))
            .show(ctx, |ui| {
                let line = |ui: &mut Ui, text: String| {
                    ui.label(
                        egui::RichText::new(text)
                            .size(12.0)
                            .color(egui::Color32::WHITE),
                    );
                };
                // 只显示文件名，避免路径中的中文字符乱码
                let name = Path::new(&self.current)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(&self.current);
                line(ui, format!("File: {}", name));
                if let Some(info) = &info {
                    line(ui, format!("Format: {}", info.format_name));
                    for stream in &info.streams {
                        line(
                            ui,
                            format!(
                                "#{} {} {} {}",
                                stream.index,
                                stream.kind.as_str(),
                                stream.codec_name,
                                stream.language.as_deref().unwrap_or("")
                            ),
                        );
                    }
                }
                ui.separator();
                let state = match status.state {
                    PlaybackState::Idle => "idle",
                    PlaybackState::Opening => "opening",
                    PlaybackState::Playing => "playing",
                    PlaybackState::Paused => "paused",
                    PlaybackState::Stopped => "stopped",
                    PlaybackState::Error => "error",
                };
                line(
                    ui,
                    format!(
                        "{} {} / {}",
                        state,
                        format_time(status.position),
                        status.duration.map_or("--:--".to_string(), format_time)
                    ),
                );
                line(
                    ui,
                    format!(
                        "Volume: {}{}",
                        status.volume,
                        if status.muted { " (muted)" } else { "" }
                    ),
                );
                line(
                    ui,
                    format!(
                        "Drops: {} early / {} late",
                        status.frame_drops_early, status.frame_drops_late
                    ),
                );
                line(
                    ui,
                    format!(
                        "Queues: v={} a={} s={} ({} KB)",
                        status.buffer.video_packets,
                        status.buffer.audio_packets,
                        status.buffer.subtitle_packets,
                        status.buffer.queued_bytes / 1024
                    ),
                );
                let render = self.renderer.stats();
                line(
                    ui,
                    format!(
                        "Rendered: {} frames, {} uploads",
                        render.frames_presented, render.texture_updates
                    ),
                );
                if let Some(message) = &self.last_error {
                    line(ui, format!("Error: {}", message));
                }
            });
    }
}

impl eframe::App for VideoPlayerApp {
    fn update(&mut self, ctx: &Context, _frame: &mut eframe::Frame) {
        self.handle_events(ctx);
        self.handle_keyboard_input(ctx);

        let remaining = self.manager.refresh(&mut self.renderer);

        egui::CentralPanel::default()
            .frame(egui::Frame::none())
            .show(ctx, |ui| {
                self.render_video_area(ui);
            });
        self.render_info_panel(ctx);

        ctx.request_repaint_after(Duration::from_secs_f64(remaining.max(0.0)));
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        info!("🔚 VideoPlayerApp 退出");
        self.manager.close();
        self.renderer.cleanup();
    }
}

/// 格式化时间显示
fn format_time(seconds: f64) -> String {
    let total_seconds = seconds.max(0.0) as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}
