// 音视频同步播放引擎

pub mod app;
pub mod core;
pub mod player;
pub mod renderer;
