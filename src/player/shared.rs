use crate::core::{AudioParams, MediaInfo, MediaKind, PlayerConfig, ShowMode, SyncType};
use crate::player::frame_queue::{
    FrameQueue, SAMPLE_QUEUE_SIZE, SUBPICTURE_QUEUE_SIZE, VIDEO_PICTURE_QUEUE_SIZE,
};
use crate::player::packet_queue::{ContinueReadSignal, PacketQueue};
use crate::player::sync::{resolve_master, SyncClocks};
use crossbeam::atomic::AtomicCell;
use crossbeam_channel::Sender;
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// 波形显示用的采样环大小
pub const SAMPLE_ARRAY_SIZE: usize = 8 * 65536;

/// 会话事件（发往 GUI/CLI）
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    StreamOpened { kind: MediaKind, index: usize },
    StreamClosed { kind: MediaKind, index: usize },
    /// 播放到结尾（每次会话只发一次）
    EndOfStream,
    /// 会话级错误，播放已停止
    Error(String),
    /// 读取线程退出
    Exited,
}

/// 某一类媒体的流选择状态及其队列
pub struct StreamSlot {
    pub kind: MediaKind,
    pub packets: Arc<PacketQueue>,
    pub frames: Arc<FrameQueue>,
    /// 解码器已输出完毕的 serial，0 表示未结束
    pub finished: Arc<AtomicI32>,
    index: AtomicI32,
    last_index: AtomicI32,
    attached_pic: AtomicBool,
}

impl StreamSlot {
    fn new(kind: MediaKind) -> Self {
        let packets = Arc::new(PacketQueue::new(kind.as_str()));
        let (capacity, keep_last) = match kind {
            MediaKind::Video => (VIDEO_PICTURE_QUEUE_SIZE, true),
            MediaKind::Audio => (SAMPLE_QUEUE_SIZE, true),
            MediaKind::Subtitle => (SUBPICTURE_QUEUE_SIZE, false),
        };
        let frames = Arc::new(FrameQueue::new(packets.clone(), capacity, keep_last));
        Self {
            kind,
            packets,
            frames,
            finished: Arc::new(AtomicI32::new(0)),
            index: AtomicI32::new(-1),
            last_index: AtomicI32::new(-1),
            attached_pic: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> Option<usize> {
        usize::try_from(self.index.load(Ordering::Acquire)).ok()
    }

    pub fn is_open(&self) -> bool {
        self.index().is_some()
    }

    /// 最近一次打开的流（用于流切换）
    pub fn last_index(&self) -> Option<usize> {
        usize::try_from(self.last_index.load(Ordering::Acquire)).ok()
    }

    pub fn is_attached_pic(&self) -> bool {
        self.attached_pic.load(Ordering::Acquire)
    }

    pub(crate) fn mark_open(&self, index: usize, attached_pic: bool) {
        self.finished.store(0, Ordering::Release);
        self.attached_pic.store(attached_pic, Ordering::Release);
        self.last_index.store(index as i32, Ordering::Release);
        self.index.store(index as i32, Ordering::Release);
    }

    pub(crate) fn mark_closed(&self) {
        self.index.store(-1, Ordering::Release);
        self.attached_pic.store(false, Ordering::Release);
    }

    /// 字幕切换到“关闭”后从头开始轮换
    pub(crate) fn forget_last(&self) {
        self.last_index.store(-1, Ordering::Release);
    }

    /// 解码器已为当前这一代数据输出完毕
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire) == self.packets.serial()
    }
}

/// 波形显示的采样环，由音频回调写入
pub struct SampleRing {
    data: Vec<f32>,
    index: usize,
    channels: u16,
    /// 最近一次回调的时刻
    pub last_write_time: f64,
    /// 最近一次回调结束时尚未送出的采样帧
    pub pending_frames: usize,
}

impl Default for SampleRing {
    fn default() -> Self {
        Self {
            data: vec![0.0; SAMPLE_ARRAY_SIZE],
            index: 0,
            channels: 1,
            last_write_time: 0.0,
            pending_frames: 0,
        }
    }
}

impl SampleRing {
    pub fn push(&mut self, samples: &[f32], channels: u16) {
        self.channels = channels.max(1);
        for &sample in samples {
            self.data[self.index] = sample;
            self.index = (self.index + 1) % SAMPLE_ARRAY_SIZE;
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// 取写入位置之前 `delay_frames` 帧开始的 `width` 帧，按声道拆开
    pub fn window(&self, delay_frames: usize, width: usize) -> Vec<Vec<f32>> {
        let channels = self.channels as usize;
        let back = (delay_frames * channels) % SAMPLE_ARRAY_SIZE;
        let start = (self.index + SAMPLE_ARRAY_SIZE - back) % SAMPLE_ARRAY_SIZE;
        (0..channels)
            .map(|ch| {
                (0..width)
                    .map(|x| self.data[(start + ch + x * channels) % SAMPLE_ARRAY_SIZE])
                    .collect()
            })
            .collect()
    }
}

/// 一次播放会话中各线程共享的状态
///
/// 跨线程的标志都封装在这里，由读取线程、解码线程、音频回调和刷新调度共同持有。
pub struct PlayerShared {
    pub config: Arc<PlayerConfig>,
    pub video: StreamSlot,
    pub audio: StreamSlot,
    pub subtitle: StreamSlot,
    pub clocks: SyncClocks,
    pub continue_read: Arc<ContinueReadSignal>,
    /// 当前帧应当开始显示的时刻
    pub frame_timer: AtomicCell<f64>,
    /// 音频设备实际参数（设备打开后才有）
    pub audio_target: AtomicCell<Option<AudioParams>>,
    pub samples: Mutex<SampleRing>,
    paused: AtomicBool,
    step: AtomicBool,
    muted: AtomicBool,
    volume: AtomicU8,
    force_refresh: AtomicBool,
    max_frame_duration: AtomicCell<f64>,
    realtime: AtomicBool,
    show_mode: AtomicCell<ShowMode>,
    audio_hw_buf_size: AtomicUsize,
    frame_drops_early: AtomicU64,
    frame_drops_late: AtomicU64,
    media_info: Mutex<Option<Arc<MediaInfo>>>,
    byte_position: AtomicCell<i64>,
    seek_by_bytes: AtomicBool,
    events: Sender<PlayerEvent>,
}

impl PlayerShared {
    pub fn new(config: Arc<PlayerConfig>, events: Sender<PlayerEvent>) -> Self {
        let video = StreamSlot::new(MediaKind::Video);
        let audio = StreamSlot::new(MediaKind::Audio);
        let subtitle = StreamSlot::new(MediaKind::Subtitle);
        let clocks = SyncClocks::new(audio.packets.serial_handle(), video.packets.serial_handle());
        Self {
            volume: AtomicU8::new(config.startup_volume_level()),
            show_mode: AtomicCell::new(config.show_mode),
            config,
            video,
            audio,
            subtitle,
            clocks,
            continue_read: Arc::new(ContinueReadSignal::new()),
            frame_timer: AtomicCell::new(0.0),
            audio_target: AtomicCell::new(None),
            samples: Mutex::new(SampleRing::default()),
            paused: AtomicBool::new(false),
            step: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            max_frame_duration: AtomicCell::new(3600.0),
            realtime: AtomicBool::new(false),
            audio_hw_buf_size: AtomicUsize::new(0),
            frame_drops_early: AtomicU64::new(0),
            frame_drops_late: AtomicU64::new(0),
            media_info: Mutex::new(None),
            byte_position: AtomicCell::new(-1),
            seek_by_bytes: AtomicBool::new(false),
            events,
        }
    }

    pub fn slot(&self, kind: MediaKind) -> &StreamSlot {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
            MediaKind::Subtitle => &self.subtitle,
        }
    }

    pub fn slots(&self) -> [&StreamSlot; 3] {
        [&self.video, &self.audio, &self.subtitle]
    }

    /// 按实际打开的流退化后的主时钟类型
    pub fn master_sync_type(&self) -> SyncType {
        resolve_master(
            self.config.av_sync_type,
            self.video.is_open(),
            self.audio.is_open(),
        )
    }

    pub fn master_clock_at(&self, now: f64) -> f64 {
        self.clocks.master_at(self.master_sync_type(), now)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// 暂停/恢复
    ///
    /// 恢复时把暂停期间流逝的时间补进 frame_timer，并在当前值上重新锚定视频和外部时钟。
    pub fn toggle_pause_at(&self, now: f64) {
        let paused = self.is_paused();
        if paused {
            let video = &self.clocks.video;
            self.frame_timer
                .store(self.frame_timer.load() + now - video.last_updated());
            video.set_at(video.get_at(now), video.serial(), now);
        }
        let external = &self.clocks.external;
        external.set_at(external.get_at(now), external.serial(), now);
        self.paused.store(!paused, Ordering::Release);
        self.clocks.set_paused(!paused);
        debug!("⏯️ 暂停状态切换: {}", !paused);
    }

    /// 单帧步进：暂停中先恢复，显示一帧后自动再暂停
    pub fn step_to_next_frame_at(&self, now: f64) {
        if self.is_paused() {
            self.toggle_pause_at(now);
        }
        self.step.store(true, Ordering::Release);
    }

    pub fn is_stepping(&self) -> bool {
        self.step.load(Ordering::Acquire)
    }

    pub(crate) fn clear_step(&self) {
        self.step.store(false, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn toggle_mute(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::AcqRel)
    }

    /// 0..=128
    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume
            .store(volume.min(crate::core::SDL_MIX_MAXVOLUME), Ordering::Release);
    }

    pub fn request_refresh(&self) {
        self.force_refresh.store(true, Ordering::Release);
    }

    pub fn is_refresh_forced(&self) -> bool {
        self.force_refresh.load(Ordering::Acquire)
    }

    pub(crate) fn clear_refresh(&self) {
        self.force_refresh.store(false, Ordering::Release);
    }

    /// 超过该时长的帧间隔视为时间戳跳变
    pub fn max_frame_duration(&self) -> f64 {
        self.max_frame_duration.load()
    }

    pub(crate) fn set_max_frame_duration(&self, value: f64) {
        self.max_frame_duration.store(value);
    }

    pub fn is_realtime(&self) -> bool {
        self.realtime.load(Ordering::Acquire)
    }

    pub(crate) fn set_realtime(&self, realtime: bool) {
        self.realtime.store(realtime, Ordering::Release);
    }

    pub fn show_mode(&self) -> ShowMode {
        self.show_mode.load()
    }

    pub fn set_show_mode(&self, mode: ShowMode) {
        self.show_mode.store(mode);
    }

    /// 设备缓冲字节数
    pub fn audio_hw_buf_size(&self) -> usize {
        self.audio_hw_buf_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_audio_hw_buf_size(&self, size: usize) {
        self.audio_hw_buf_size.store(size, Ordering::Release);
    }

    pub fn record_early_drop(&self) {
        self.frame_drops_early.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_drop(&self) {
        self.frame_drops_late.fetch_add(1, Ordering::Relaxed);
    }

    /// (提前丢弃, 延迟丢弃)
    pub fn frame_drops(&self) -> (u64, u64) {
        (
            self.frame_drops_early.load(Ordering::Relaxed),
            self.frame_drops_late.load(Ordering::Relaxed),
        )
    }

    /// 是否启用丢帧（None 表示视频不是主时钟时启用）
    pub fn framedrop_enabled(&self) -> bool {
        match self.config.framedrop {
            Some(enabled) => enabled,
            None => self.master_sync_type() != SyncType::VideoMaster,
        }
    }

    /// 读取线程打开数据源后才有
    pub fn media_info(&self) -> Option<Arc<MediaInfo>> {
        self.media_info.lock().clone()
    }

    pub(crate) fn set_media_info(&self, info: MediaInfo) {
        *self.media_info.lock() = Some(Arc::new(info));
    }

    /// 读取线程最近的字节位置，未知为 -1
    pub fn byte_position(&self) -> i64 {
        self.byte_position.load()
    }

    pub(crate) fn set_byte_position(&self, pos: i64) {
        self.byte_position.store(pos);
    }

    pub fn seek_by_bytes(&self) -> bool {
        self.seek_by_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn set_seek_by_bytes(&self, by_bytes: bool) {
        self.seek_by_bytes.store(by_bytes, Ordering::Release);
    }

    pub fn emit(&self, event: PlayerEvent) {
        if self.events.send(event).is_err() {
            debug!("事件接收端已关闭");
        }
    }
}
