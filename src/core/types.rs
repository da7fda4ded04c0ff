use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 媒体源类型
#[derive(Debug, Clone)]
pub enum MediaSource {
    /// 本地文件路径
    LocalFile(PathBuf),

    /// 网络流 URL
    NetworkStream {
        url: String,
        protocol: StreamProtocol,
    },
}

impl MediaSource {
    /// 从 URL 字符串解析媒体源
    pub fn from_url(url: &str) -> Self {
        let protocol = if url.starts_with("rtsp://") {
            Some(StreamProtocol::RTSP)
        } else if url.starts_with("rtmp://") {
            Some(StreamProtocol::RTMP)
        } else if url.starts_with("rtp:") {
            Some(StreamProtocol::RTP)
        } else if url.starts_with("udp:") {
            Some(StreamProtocol::UDP)
        } else if url.ends_with(".m3u8") || url.contains("/hls/") {
            Some(StreamProtocol::HLS)
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Some(StreamProtocol::HTTP)
        } else {
            None
        };

        match protocol {
            Some(protocol) => MediaSource::NetworkStream {
                url: url.to_string(),
                protocol,
            },
            // 默认当作本地文件
            None => MediaSource::LocalFile(PathBuf::from(url)),
        }
    }

    /// 判断是否为网络流
    pub fn is_network_stream(&self) -> bool {
        matches!(self, MediaSource::NetworkStream { .. })
    }

    /// 实时流：数据按发送端节奏到达，不能随意缓冲
    pub fn is_realtime(&self) -> bool {
        matches!(
            self,
            MediaSource::NetworkStream {
                protocol: StreamProtocol::RTSP | StreamProtocol::RTP | StreamProtocol::UDP,
                ..
            }
        )
    }

    pub fn locator(&self) -> String {
        match self {
            MediaSource::LocalFile(path) => path.to_string_lossy().to_string(),
            MediaSource::NetworkStream { url, .. } => url.clone(),
        }
    }
}

/// 流媒体协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    /// RTSP - 实时流协议（监控摄像头）
    RTSP,
    /// RTMP - 实时消息协议（直播流）
    RTMP,
    /// RTP 裸流
    RTP,
    /// UDP 组播/单播
    UDP,
    /// HLS - HTTP Live Streaming
    HLS,
    /// HTTP - 普通 HTTP 流
    HTTP,
}

impl StreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::RTSP => "RTSP",
            StreamProtocol::RTMP => "RTMP",
            StreamProtocol::RTP => "RTP",
            StreamProtocol::UDP => "UDP",
            StreamProtocol::HLS => "HLS",
            StreamProtocol::HTTP => "HTTP",
        }
    }
}

/// 媒体流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
}

impl MediaKind {
    pub const ALL: [MediaKind; 3] = [MediaKind::Video, MediaKind::Audio, MediaKind::Subtitle];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Subtitle => "subtitle",
        }
    }
}

/// 有理数（时间基、宽高比）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn to_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    pub fn is_valid(self) -> bool {
        self.num != 0 && self.den != 0
    }
}

impl Default for Rational {
    /// 0/1 表示未知
    fn default() -> Self {
        Rational::new(0, 1)
    }
}

/// 微秒时间基
pub const TIME_BASE_Q: Rational = Rational::new(1, 1_000_000);

/// 把 `value` 从 `from` 时间基换算到 `to` 时间基（四舍五入，远离零）
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return 0;
    }
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let half = den / 2;
    let r = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    r.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

impl PixelFormat {
    /// 单平面打包格式的每像素字节数（平面格式返回 None）
    pub fn packed_bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::RGBA => Some(4),
            PixelFormat::RGB => Some(3),
            PixelFormat::YUV420P | PixelFormat::NV12 => None,
        }
    }
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32 => 4,
            SampleFormat::I16 => 2,
        }
    }
}

/// 视频帧数据（像素缓冲）
#[derive(Debug, Clone, Default)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: Option<PixelFormat>,
    pub data: Vec<u8>, // CPU 内存数据
}

/// 音频帧数据（已转换为输出设备格式的交错采样）
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub data: Vec<f32>, // 统一使用 f32 格式
}

impl AudioFrame {
    /// 每声道采样数
    pub fn nb_samples(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels as usize
        }
    }
}

/// 位图字幕区域，RGBA，坐标相对字幕画布
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubtitleBitmap {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// 字幕帧数据
#[derive(Debug, Clone, Default)]
pub struct SubtitleFrame {
    pub text: String,          // 字幕文本
    pub start_display: f64,    // 相对 pts 的开始显示时间（秒）
    pub end_display: f64,      // 相对 pts 的结束显示时间（秒）
    pub bitmaps: Vec<SubtitleBitmap>,
    /// 位图坐标所在的画布大小，(0, 0) 表示与视频画面一致
    pub canvas: (u32, u32),
}

impl SubtitleFrame {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.bitmaps.is_empty()
    }
}

/// 帧队列槽位中的负载
#[derive(Debug, Clone, Default)]
pub enum FramePayload {
    #[default]
    Empty,
    Picture(VideoFrame),
    Audio(AudioFrame),
    Subtitle(SubtitleFrame),
}

/// 主时钟选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    AudioMaster,
    VideoMaster,
    ExternalClock,
}

impl Default for SyncType {
    fn default() -> Self {
        SyncType::AudioMaster
    }
}

/// 显示模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowMode {
    /// 不显示（纯音频）
    None,
    /// 显示视频
    Video,
    /// 显示音频波形
    Waves,
}

impl Default for ShowMode {
    fn default() -> Self {
        ShowMode::Video
    }
}

/// 音频输出参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioParams {
    pub freq: u32,
    pub channels: u16,
    pub format: SampleFormat,
    /// 一个采样帧（所有声道）的字节数
    pub frame_size: usize,
    pub bytes_per_sec: usize,
}

impl AudioParams {
    pub fn new(freq: u32, channels: u16, format: SampleFormat) -> Self {
        let frame_size = channels as usize * format.bytes_per_sample();
        Self {
            freq,
            channels,
            format,
            frame_size,
            bytes_per_sec: frame_size * freq as usize,
        }
    }
}

/// 单条媒体流的描述
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub index: usize,
    pub kind: MediaKind,
    pub time_base: Rational,
    /// 流起始时间（time_base 单位）
    pub start_time: Option<i64>,
    pub codec_name: String,
    pub language: Option<String>,
    /// 音频文件中的封面图
    pub attached_pic: bool,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_rate: Option<Rational>,
    /// 显示矩阵中的旋转角度（度）
    pub rotation: f64,
}

/// 章节
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Chapter {
    pub start: f64, // 秒
    pub end: f64,
}

/// 媒体信息
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub url: String,
    pub format_name: String,
    pub duration: Option<f64>,   // 总时长（秒）
    pub start_time: Option<f64>, // 起始时间（秒）
    pub bit_rate: i64,
    pub streams: Vec<StreamInfo>,
    pub chapters: Vec<Chapter>,
    pub realtime: bool,
    /// 容器允许时间戳跳变（如 MPEG-TS）
    pub ts_discontinuous: bool,
    /// 按字节 seek 比按时间更可靠
    pub prefers_byte_seek: bool,
}

impl MediaInfo {
    pub fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }
}

/// 一次 seek 请求
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    /// 目标位置：按时间时为微秒，按字节时为字节偏移
    pub target: i64,
    /// 相对位移（同单位），决定允许的 seek 区间
    pub rel: i64,
    pub by_bytes: bool,
}

impl SeekRequest {
    /// 允许的 seek 区间 `[min, max]`
    pub fn bounds(&self) -> (i64, i64) {
        let min = if self.rel > 0 {
            self.target - self.rel + 2
        } else {
            i64::MIN
        };
        let max = if self.rel < 0 {
            self.target - self.rel - 2
        } else {
            i64::MAX
        };
        (min, max)
    }
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Opening,
    Playing,
    Paused,
    Stopped,
    Error,
}

/// 缓冲状态信息（用于监控和调试）
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStatus {
    pub video_packets: usize,
    pub audio_packets: usize,
    pub subtitle_packets: usize,
    pub video_frames: usize,
    pub audio_frames: usize,
    /// 所有包队列的总字节数
    pub queued_bytes: usize,
}

/// 播放器状态信息
#[derive(Debug, Clone, Serialize)]
pub struct PlayerState {
    pub state: PlaybackState,
    pub position: f64,         // 当前位置（秒）
    pub duration: Option<f64>, // 总时长（秒）
    pub volume: u8,            // 0 - 128
    pub muted: bool,
    pub frame_drops_early: u64,
    pub frame_drops_late: u64,
    pub buffer: BufferStatus,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            position: 0.0,
            duration: None,
            volume: 128,
            muted: false,
            frame_drops_early: 0,
            frame_drops_late: 0,
            buffer: BufferStatus::default(),
        }
    }
}
