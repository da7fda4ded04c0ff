use crate::core::{AudioParams, MediaInfo, MediaKind, Result, SeekRequest};
use crate::player::codec::DecodeBackend;

/// 压缩数据包（可跨线程传递）
#[derive(Debug, Clone, Default)]
pub struct MediaPacket {
    pub stream_index: usize,
    pub data: Vec<u8>,
    /// 以所属流的 time_base 为单位
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    /// 在源中的字节偏移，未知为 -1
    pub pos: i64,
    pub key: bool,
}

impl MediaPacket {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 优先 pts，缺失时用 dts
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }
}

/// Demuxer 数据源抽象接口
///
/// 这个 trait 定义了所有 Demuxer 实现必须提供的方法
/// 不同的媒体源（本地文件、网络流、内存流等）可以实现这个接口
pub trait DemuxerSource: Send {
    /// 获取媒体信息
    fn media_info(&self) -> &MediaInfo;

    /// 读取下一个媒体包
    ///
    /// 返回：
    /// - Ok(Some(packet)): 成功读取一个包
    /// - Ok(None): 到达文件末尾
    /// - Err(PlayerError::SourceIoError): IO 已损坏，读取线程报告错误后退出
    /// - Err(e): 其他读取错误（读取线程会短暂休眠后重试）
    fn read_packet(&mut self) -> Result<Option<MediaPacket>>;

    /// 按请求的区间 seek
    fn seek(&mut self, request: &SeekRequest) -> Result<()>;

    /// 暂停/恢复网络读取，返回 false 表示源不支持
    fn set_paused(&mut self, _paused: bool) -> bool {
        false
    }

    /// 为某种媒体挑选最佳流
    ///
    /// `wanted` 为用户指定的流，`related` 为已选中的相关流（字幕跟随音频或视频）。
    fn best_stream(
        &self,
        kind: MediaKind,
        wanted: Option<usize>,
        _related: Option<usize>,
    ) -> Option<usize> {
        let streams = &self.media_info().streams;
        if let Some(index) = wanted {
            return streams
                .iter()
                .find(|s| s.index == index && s.kind == kind)
                .map(|s| s.index);
        }
        streams.iter().find(|s| s.kind == kind).map(|s| s.index)
    }

    /// 封面图数据包
    fn attached_picture(&self, _stream_index: usize) -> Option<MediaPacket> {
        None
    }

    /// 为指定流创建解码器；音频解码器输出会被转换到 `audio_target`
    fn open_decoder(
        &self,
        stream_index: usize,
        audio_target: Option<AudioParams>,
    ) -> Result<Box<dyn DecodeBackend>>;

    /// 当前读取到的字节位置
    fn byte_position(&self) -> i64 {
        -1
    }

    /// 是否支持 seek
    fn is_seekable(&self) -> bool {
        true
    }

    /// 获取描述信息（用于调试）
    fn description(&self) -> String;
}
