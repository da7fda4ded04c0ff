// 播放器核心模块

pub mod audio_callback;
pub mod audio_output;
pub mod codec;
pub mod decoder;
pub mod demuxer;
pub mod demuxer_factory;
pub mod demuxer_source;
pub mod demuxer_thread;
pub mod ffmpeg_codec;
pub mod filter;
pub mod frame_queue;
pub mod manager;
pub mod packet_queue;
pub mod refresh;
pub mod shared;
pub mod sync;

#[cfg(test)]
pub mod testing;

pub use audio_output::{AudioBackend, AudioDevice, CpalAudioBackend};
pub use demuxer::FfmpegDemuxer;
pub use demuxer_factory::{FfmpegSourceFactory, SourceFactory};
pub use demuxer_source::{DemuxerSource, MediaPacket};
pub use manager::{AudioBackendFactory, PlaybackManager};
pub use shared::{PlayerEvent, PlayerShared};

/// 日志前缀：进程号和线程号
pub(crate) fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", std::process::id(), std::thread::current().id())
}
