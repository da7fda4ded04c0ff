use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置解析错误: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("无法打开媒体源: {0}")]
    OpenError(String),

    /// 底层 IO 已出错，继续读取没有意义
    #[error("媒体源读取失败: {0}")]
    SourceIoError(String),

    #[error("没有可播放的媒体流")]
    NoStreams,

    #[error("无法打开 {kind} 流 #{index}: {reason}")]
    StreamOpenError {
        kind: &'static str,
        index: usize,
        reason: String,
    },

    #[error("渲染错误: {0}")]
    RenderError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("队列已中止")]
    Aborted,

    #[error("其他错误: {0}")]
    Other(String),

    #[error("Anyhow 错误: {0}")]
    AnyhowError(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
