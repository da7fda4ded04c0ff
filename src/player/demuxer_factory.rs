use crate::core::{MediaSource, Result};
use crate::player::demuxer::FfmpegDemuxer;
use crate::player::demuxer_source::DemuxerSource;
use log::info;

/// 数据源工厂
///
/// 打开媒体源可能很慢（网络流要探测、握手），所以由读取线程调用，不阻塞 UI。
pub trait SourceFactory: Send + Sync {
    fn open(&self, source: &MediaSource) -> Result<Box<dyn DemuxerSource>>;
}

/// 基于 FFmpeg 的工厂
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegSourceFactory;

impl SourceFactory for FfmpegSourceFactory {
    fn open(&self, source: &MediaSource) -> Result<Box<dyn DemuxerSource>> {
        match source {
            MediaSource::LocalFile(path) => info!("📁 创建本地文件 Demuxer: {}", path.display()),
            MediaSource::NetworkStream { url, protocol } => {
                info!("🌐 创建网络流 Demuxer: {} ({})", url, protocol.as_str())
            }
        }
        Ok(Box::new(FfmpegDemuxer::open(source)?))
    }
}
