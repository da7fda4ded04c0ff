use crate::core::{MediaKind, Result, ShowMode, SyncType};
use log::info;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// 包队列总字节上限（15 MiB）
pub const MAX_QUEUE_SIZE: usize = 15 * 1024 * 1024;
/// 每条流“足够”的最少包数
pub const MIN_FRAMES: usize = 25;

/// 每种媒体期望打开的流序号（None 表示自动选择最佳流）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WantedStreams {
    pub video: Option<usize>,
    pub audio: Option<usize>,
    pub subtitle: Option<usize>,
}

impl WantedStreams {
    pub fn get(&self, kind: MediaKind) -> Option<usize> {
        match kind {
            MediaKind::Video => self.video,
            MediaKind::Audio => self.audio,
            MediaKind::Subtitle => self.subtitle,
        }
    }
}

/// 播放器配置
///
/// 打开媒体时构造一次，之后以 `Arc` 只读共享给读取线程、解码线程和音频回调。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub av_sync_type: SyncType,
    pub show_mode: ShowMode,
    /// 循环次数，0 表示无限循环
    pub loop_count: u32,
    /// 播放结束后自动退出
    pub autoexit: bool,
    /// 落后时丢帧，None 表示视频不是主时钟时自动启用
    pub framedrop: Option<bool>,
    /// 不限制缓冲，None 表示实时流自动启用
    pub infinite_buffer: Option<bool>,
    /// 起播位置（秒）
    pub start_time: Option<f64>,
    /// 只播放这么长（秒）
    pub duration: Option<f64>,
    /// 按字节 seek，None 表示由容器决定
    pub seek_by_bytes: Option<bool>,
    /// 左右方向键的 seek 步长（秒）
    pub seek_interval: f64,
    pub audio_disable: bool,
    pub video_disable: bool,
    pub subtitle_disable: bool,
    pub wanted_streams: WantedStreams,
    /// 解码帧时间戳来源：None = best effort，Some(true) = 帧 pts，Some(false) = 包 dts
    pub decoder_reorder_pts: Option<bool>,
    pub max_queue_size: usize,
    pub min_frames: usize,
    /// 初始音量 0 - 100
    pub startup_volume: u8,
    /// 波形显示的刷新间隔（秒）
    pub rdftspeed: f64,
    /// 按显示矩阵自动旋转画面
    pub autorotate: bool,
    pub default_width: u32,
    pub default_height: u32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            av_sync_type: SyncType::AudioMaster,
            show_mode: ShowMode::Video,
            loop_count: 1,
            autoexit: false,
            framedrop: None,
            infinite_buffer: None,
            start_time: None,
            duration: None,
            seek_by_bytes: None,
            seek_interval: 10.0,
            audio_disable: false,
            video_disable: false,
            subtitle_disable: false,
            wanted_streams: WantedStreams::default(),
            decoder_reorder_pts: None,
            max_queue_size: MAX_QUEUE_SIZE,
            min_frames: MIN_FRAMES,
            startup_volume: 100,
            rdftspeed: 0.02,
            autorotate: true,
            default_width: 640,
            default_height: 480,
        }
    }
}

impl PlayerConfig {
    /// 从 JSON 文件加载配置，缺省字段使用默认值
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        info!("📄 已加载配置文件: {}", path.display());
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_disabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Video => self.video_disable,
            MediaKind::Audio => self.audio_disable,
            MediaKind::Subtitle => self.subtitle_disable,
        }
    }

    /// 初始音量映射到 0..=128
    pub fn startup_volume_level(&self) -> u8 {
        let percent = self.startup_volume.min(100) as u32;
        (percent * SDL_MIX_MAXVOLUME as u32 / 100) as u8
    }
}

/// 最大音量
pub const SDL_MIX_MAXVOLUME: u8 = 128;
