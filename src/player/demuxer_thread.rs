use crate::core::{
    wall_time, AudioParams, MediaInfo, MediaKind, MediaSource, PlayerConfig, PlayerError, Result,
    SampleFormat, SeekRequest, ShowMode, StreamInfo,
};
use crate::player::audio_callback::AudioPullCallback;
use crate::player::audio_output::{AudioBackend, AudioDevice};
use crate::player::decoder::{audio_worker, subtitle_worker, video_worker, Decoder, DecoderHandle};
use crate::player::demuxer_factory::SourceFactory;
use crate::player::demuxer_source::{DemuxerSource, MediaPacket};
use crate::player::filter::build_video_filter;
use crate::player::log_ctx;
use crate::player::shared::{PlayerEvent, PlayerShared, StreamSlot};
use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 缓冲已满、到达结尾或读取出错时的等待间隔
const READ_WAIT: Duration = Duration::from_millis(10);

/// 读取线程命令
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReaderCommand {
    /// 多个待处理的 seek 只执行最后一个
    Seek(SeekRequest),
    CycleStream(MediaKind),
    Stop,
}

/// 流轮换的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTarget {
    Stream(usize),
    /// 关闭字幕
    Off,
}

/// 从 `last_index` 之后按容器顺序找下一条同类流
///
/// 字幕越过最后一条流时切到“关闭”，其它类型回绕到开头；
/// 回到起点说明没有别的候选，返回 None。没有声道或采样率的音频流不参与轮换。
pub fn cycle_target(info: &MediaInfo, kind: MediaKind, last_index: Option<usize>) -> Option<CycleTarget> {
    let nb_streams = info.streams.len();
    let mut index = last_index;
    for _ in 0..=nb_streams {
        let mut next = index.map_or(0, |i| i + 1);
        if next >= nb_streams {
            if kind == MediaKind::Subtitle {
                return Some(CycleTarget::Off);
            }
            if last_index.is_none() {
                return None;
            }
            next = 0;
        }
        if Some(next) == last_index {
            return None;
        }
        index = Some(next);

        let Some(stream) = info.stream(next) else {
            continue;
        };
        if stream.kind != kind {
            continue;
        }
        if kind == MediaKind::Audio && (stream.sample_rate == 0 || stream.channels == 0) {
            continue;
        }
        return Some(CycleTarget::Stream(next));
    }
    None
}

/// 启动读取线程
///
/// 数据源在线程内打开，打开失败时发出 `Error` 事件；线程结束时总是发出 `Exited`。
pub fn spawn(
    shared: Arc<PlayerShared>,
    factory: Arc<dyn SourceFactory>,
    source: MediaSource,
    audio_backend: Box<dyn AudioBackend>,
    commands: Receiver<ReaderCommand>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("read_thread".to_string())
        .spawn(move || {
            info!("{} 📖 读取线程启动: {}", log_ctx(), source.locator());
            let opened = factory
                .open(&source)
                .and_then(|demuxer| Reader::open(shared.clone(), demuxer, audio_backend, commands));
            match opened {
                Ok(mut reader) => reader.run(),
                Err(e) => {
                    error!("{} ❌ 打开 {} 失败: {}", log_ctx(), source.locator(), e);
                    shared.emit(PlayerEvent::Error(e.to_string()));
                }
            }
            shared.emit(PlayerEvent::Exited);
            info!("{} 🛑 读取线程退出", log_ctx());
        })
        .map_err(PlayerError::from)
}

/// 一条已打开的流
struct Component {
    index: usize,
    decoder: DecoderHandle,
    /// 只有音频流持有设备
    device: Option<Box<dyn AudioDevice>>,
}

/// 读取线程状态
///
/// 拥有数据源、音频后端和所有解码线程，是唯一打开/关闭流的地方。
struct Reader {
    shared: Arc<PlayerShared>,
    source: Box<dyn DemuxerSource>,
    audio_backend: Box<dyn AudioBackend>,
    commands: Receiver<ReaderCommand>,
    components: HashMap<MediaKind, Component>,
    pending_seek: Option<SeekRequest>,
    queue_attachments: bool,
    infinite_buffer: bool,
    eof: bool,
    end_reported: bool,
    last_paused: bool,
    /// 剩余循环次数，0 表示无限
    loops_left: u32,
}

impl Reader {
    fn open(
        shared: Arc<PlayerShared>,
        source: Box<dyn DemuxerSource>,
        audio_backend: Box<dyn AudioBackend>,
        commands: Receiver<ReaderCommand>,
    ) -> Result<Self> {
        let loops_left = shared.config.loop_count;
        let mut reader = Self {
            shared,
            source,
            audio_backend,
            commands,
            components: HashMap::new(),
            pending_seek: None,
            queue_attachments: true,
            infinite_buffer: false,
            eof: false,
            end_reported: false,
            last_paused: false,
            loops_left,
        };
        reader.prepare()?;
        Ok(reader)
    }

    fn prepare(&mut self) -> Result<()> {
        let info = self.source.media_info().clone();
        let config = self.shared.config.clone();
        info!(
            "{} 📋 {} [{}] 时长 {:?} 秒, {} 条流, {} 个章节",
            log_ctx(),
            info.url,
            info.format_name,
            info.duration,
            info.streams.len(),
            info.chapters.len()
        );

        self.shared
            .set_max_frame_duration(if info.ts_discontinuous { 10.0 } else { 3600.0 });
        self.shared
            .set_seek_by_bytes(config.seek_by_bytes.unwrap_or(info.prefers_byte_seek));
        self.shared.set_realtime(info.realtime);
        self.infinite_buffer = config.infinite_buffer.unwrap_or(info.realtime);
        self.shared.set_media_info(info.clone());

        if let Some(start) = config.start_time {
            let mut target = (start * 1e6) as i64;
            if let Some(stream_start) = info.start_time {
                target += (stream_start * 1e6) as i64;
            }
            let request = SeekRequest {
                target,
                rel: 0,
                by_bytes: false,
            };
            if let Err(e) = self.source.seek(&request) {
                warn!("{} ⚠️ 无法定位到起播位置 {:.3}: {}", log_ctx(), start, e);
            }
        }

        let pick = |kind: MediaKind, related: Option<usize>| {
            if config.is_disabled(kind) {
                return None;
            }
            self.source
                .best_stream(kind, config.wanted_streams.get(kind), related)
        };
        let video = pick(MediaKind::Video, None);
        let audio = pick(MediaKind::Audio, video);
        let subtitle = pick(MediaKind::Subtitle, audio.or(video));

        if self.shared.show_mode() == ShowMode::Video && video.is_none() {
            self.shared.set_show_mode(ShowMode::Waves);
        }

        for (kind, index) in [
            (MediaKind::Audio, audio),
            (MediaKind::Video, video),
            (MediaKind::Subtitle, subtitle),
        ] {
            let Some(index) = index else {
                continue;
            };
            if let Err(e) = self.open_component(kind, index) {
                warn!("{} ⚠️ {} 流 #{} 打开失败: {}", log_ctx(), kind.as_str(), index, e);
            }
        }

        if !self.shared.video.is_open() && !self.shared.audio.is_open() {
            return Err(PlayerError::NoStreams);
        }
        Ok(())
    }

    fn open_component(&mut self, kind: MediaKind, index: usize) -> Result<()> {
        let stream_error = |reason: String| PlayerError::StreamOpenError {
            kind: kind.as_str(),
            index,
            reason,
        };
        let stream = self
            .source
            .media_info()
            .stream(index)
            .filter(|s| s.kind == kind)
            .cloned()
            .ok_or_else(|| stream_error("流不存在".to_string()))?;
        let shared = self.shared.clone();
        let config = shared.config.clone();
        let slot = shared.slot(kind);

        let mut device = None;
        let mut audio_target = None;
        if kind == MediaKind::Audio {
            let wanted = AudioParams::new(stream.sample_rate, stream.channels, SampleFormat::F32);
            let callback = AudioPullCallback::new(shared.clone()).into_callback();
            let opened = self.audio_backend.open(wanted, callback)?;
            let params = opened.params();
            shared.audio_target.store(Some(params));
            shared.set_audio_hw_buf_size(opened.hw_buffer_size());
            audio_target = Some(params);
            device = Some(opened);
        }

        let started = self.start_decoder(slot, &stream, audio_target, &config);
        let mut decoder = match started {
            Ok(decoder) => decoder,
            Err(e) => {
                if kind == MediaKind::Audio {
                    shared.audio_target.store(None);
                }
                return Err(stream_error(e.to_string()));
            }
        };
        if let Some(device) = device.as_mut() {
            if let Err(e) = device.resume() {
                decoder.abort();
                shared.audio_target.store(None);
                return Err(e);
            }
        }

        slot.mark_open(index, stream.attached_pic);
        if kind == MediaKind::Video && stream.attached_pic {
            self.queue_attachments = true;
        }
        self.components.insert(
            kind,
            Component {
                index,
                decoder,
                device,
            },
        );
        info!(
            "{} ✅ 已打开 {} 流 #{} ({})",
            log_ctx(),
            kind.as_str(),
            index,
            stream.codec_name
        );
        shared.emit(PlayerEvent::StreamOpened { kind, index });
        Ok(())
    }

    fn start_decoder(
        &self,
        slot: &StreamSlot,
        stream: &StreamInfo,
        audio_target: Option<AudioParams>,
        config: &PlayerConfig,
    ) -> Result<DecoderHandle> {
        let backend = self.source.open_decoder(stream.index, audio_target)?;
        let mut decoder = Decoder::new(
            slot.kind,
            backend,
            slot.packets.clone(),
            slot.finished.clone(),
            self.shared.continue_read.clone(),
            stream.time_base,
        )
        .with_reorder_pts(config.decoder_reorder_pts);
        if slot.kind == MediaKind::Audio && !self.source.is_seekable() {
            decoder = decoder.with_start_pts(stream.start_time, stream.time_base);
        }

        let shared = self.shared.clone();
        let packets = slot.packets.clone();
        let frames = slot.frames.clone();
        match slot.kind {
            MediaKind::Video => {
                let filter = build_video_filter(config, stream);
                let stream = stream.clone();
                DecoderHandle::start(decoder, packets, frames, move |d| {
                    video_worker(d, shared, stream, filter)
                })
            }
            MediaKind::Audio => {
                DecoderHandle::start(decoder, packets, frames, move |d| audio_worker(d, shared))
            }
            MediaKind::Subtitle => {
                let stream = stream.clone();
                DecoderHandle::start(decoder, packets, frames, move |d| {
                    subtitle_worker(d, shared, stream)
                })
            }
        }
    }

    /// 先停解码线程再关设备
    fn close_component(&mut self, kind: MediaKind) {
        let Some(mut component) = self.components.remove(&kind) else {
            return;
        };
        component.decoder.abort();
        drop(component.device.take());
        if kind == MediaKind::Audio {
            self.shared.audio_target.store(None);
        }
        self.shared.slot(kind).mark_closed();
        info!("{} 已关闭 {} 流 #{}", log_ctx(), kind.as_str(), component.index);
        self.shared.emit(PlayerEvent::StreamClosed {
            kind,
            index: component.index,
        });
    }

    fn close_all(&mut self) {
        for kind in [MediaKind::Audio, MediaKind::Video, MediaKind::Subtitle] {
            self.close_component(kind);
        }
    }

    fn run(&mut self) {
        loop {
            if !self.handle_commands() {
                break;
            }

            let paused = self.shared.is_paused();
            if paused != self.last_paused {
                self.last_paused = paused;
                if !self.source.set_paused(paused) {
                    debug!("数据源不支持暂停读取");
                }
            }
            if paused && self.source.media_info().format_name == "rtsp" {
                // rtsp 暂停期间读包会一直阻塞
                thread::sleep(READ_WAIT);
                continue;
            }

            if let Some(request) = self.pending_seek.take() {
                self.seek(request);
            }
            if self.queue_attachments {
                self.queue_attached_picture();
            }

            if !self.infinite_buffer && self.buffers_full() {
                self.shared.continue_read.wait_timeout(READ_WAIT);
                continue;
            }

            if !paused && self.playback_finished() {
                if self.take_loop() {
                    let start = self.shared.config.start_time.unwrap_or(0.0);
                    info!("{} 🔁 循环播放，回到 {:.3}", log_ctx(), start);
                    self.pending_seek = Some(SeekRequest {
                        target: (start * 1e6) as i64,
                        rel: 0,
                        by_bytes: false,
                    });
                    continue;
                }
                if !self.end_reported {
                    self.end_reported = true;
                    info!("{} 🏁 播放结束", log_ctx());
                    self.shared.emit(PlayerEvent::EndOfStream);
                    if self.shared.config.autoexit {
                        break;
                    }
                }
            }

            match self.source.read_packet() {
                Ok(Some(packet)) => {
                    self.eof = false;
                    self.shared.set_byte_position(self.source.byte_position());
                    self.route(packet);
                }
                Ok(None) => {
                    if !self.eof {
                        info!("{} 📄 读到文件末尾", log_ctx());
                        for slot in self.shared.slots() {
                            if let Some(index) = slot.index() {
                                let _ = slot.packets.put_null(index);
                            }
                        }
                        self.eof = true;
                    }
                    self.shared.continue_read.wait_timeout(READ_WAIT);
                }
                Err(PlayerError::SourceIoError(message)) => {
                    error!("{} ❌ 媒体源 IO 错误，停止读取: {}", log_ctx(), message);
                    self.shared.emit(PlayerEvent::Error(message));
                    break;
                }
                Err(e) => {
                    warn!("{} ⚠️ 读取数据包失败: {}", log_ctx(), e);
                    self.shared.continue_read.wait_timeout(READ_WAIT);
                }
            }
        }
        self.close_all();
    }

    /// 处理所有待处理命令，收到 Stop 或通道关闭时返回 false
    fn handle_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(ReaderCommand::Seek(request)) => {
                    if self.pending_seek.replace(request).is_some() {
                        debug!("合并 seek 请求 -> {:?}", request);
                    }
                }
                Ok(ReaderCommand::CycleStream(kind)) => self.cycle_stream(kind),
                Ok(ReaderCommand::Stop) => {
                    info!("{} ⏹ 读取线程收到停止命令", log_ctx());
                    return false;
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn seek(&mut self, request: SeekRequest) {
        let (min, max) = request.bounds();
        debug!(
            "⏩ seek 到 {} ({}), 区间 [{}, {}]",
            request.target,
            if request.by_bytes { "字节" } else { "微秒" },
            min,
            max
        );
        match self.source.seek(&request) {
            Err(e) => error!("{} ❌ {}: seek 失败: {}", log_ctx(), self.source.description(), e),
            Ok(()) => {
                for slot in self.shared.slots() {
                    if slot.is_open() {
                        slot.packets.flush();
                        let _ = slot.packets.put_flush_marker();
                    }
                }
                let external = &self.shared.clocks.external;
                if request.by_bytes {
                    external.set(f64::NAN, 0);
                } else {
                    external.set(request.target as f64 / 1e6, 0);
                }
            }
        }
        self.queue_attachments = true;
        self.eof = false;
        self.end_reported = false;
        if self.shared.is_paused() {
            self.shared.step_to_next_frame_at(wall_time());
        }
    }

    /// 封面图后面紧跟结束哨兵，解码线程输出一帧后即结束
    fn queue_attached_picture(&mut self) {
        self.queue_attachments = false;
        let video = &self.shared.video;
        let Some(index) = video.index() else {
            return;
        };
        if !video.is_attached_pic() {
            return;
        }
        if let Some(packet) = self.source.attached_picture(index) {
            let _ = video.packets.put(packet);
        }
        let _ = video.packets.put_null(index);
    }

    fn buffers_full(&self) -> bool {
        let slots = self.shared.slots();
        let total: usize = slots.iter().map(|slot| slot.packets.size()).sum();
        total > self.shared.config.max_queue_size
            || slots.iter().all(|slot| self.has_enough_packets(slot))
    }

    fn has_enough_packets(&self, slot: &StreamSlot) -> bool {
        let Some(index) = slot.index() else {
            return true;
        };
        if slot.packets.is_aborted() || slot.is_attached_pic() {
            return true;
        }
        let stats = slot.packets.stats();
        let tb = self
            .source
            .media_info()
            .stream(index)
            .map_or(0.0, |s| s.time_base.to_f64());
        stats.nb_packets > self.shared.config.min_frames
            && (stats.duration == 0 || tb * stats.duration as f64 > 1.0)
    }

    /// 音视频解码线程都已输出完当前这一代数据，且帧队列已播完
    fn playback_finished(&self) -> bool {
        let done = |slot: &StreamSlot| {
            !slot.is_open() || (slot.is_finished() && slot.frames.remaining() == 0)
        };
        done(&self.shared.audio) && done(&self.shared.video)
    }

    fn take_loop(&mut self) -> bool {
        match self.loops_left {
            0 => true,
            1 => false,
            _ => {
                self.loops_left -= 1;
                self.loops_left != 0
            }
        }
    }

    fn in_play_range(&self, packet: &MediaPacket) -> bool {
        let config = &self.shared.config;
        let Some(duration) = config.duration else {
            return true;
        };
        let (Some(ts), Some(stream)) = (
            packet.timestamp(),
            self.source.media_info().stream(packet.stream_index),
        ) else {
            return true;
        };
        let stream_start = stream.start_time.unwrap_or(0);
        (ts - stream_start) as f64 * stream.time_base.to_f64() - config.start_time.unwrap_or(0.0)
            <= duration
    }

    fn route(&self, packet: MediaPacket) {
        let shared = &self.shared;
        let index = Some(packet.stream_index);
        let in_range = self.in_play_range(&packet);
        let target = if !in_range {
            None
        } else if shared.audio.index() == index {
            Some(&shared.audio)
        } else if shared.video.index() == index && !shared.video.is_attached_pic() {
            Some(&shared.video)
        } else if shared.subtitle.index() == index {
            Some(&shared.subtitle)
        } else {
            None
        };
        if let Some(slot) = target {
            if slot.packets.put(packet).is_err() {
                debug!("{} 包队列已中止，丢弃数据包", slot.kind.as_str());
            }
        }
    }

    fn cycle_stream(&mut self, kind: MediaKind) {
        let slot = self.shared.slot(kind);
        let old = slot.index();
        let target = cycle_target(self.source.media_info(), kind, slot.last_index());
        let Some(target) = target else {
            debug!("没有可切换的 {} 流", kind.as_str());
            return;
        };
        info!(
            "{} 🔀 切换 {} 流: {:?} -> {:?}",
            log_ctx(),
            kind.as_str(),
            old,
            target
        );
        self.close_component(kind);
        match target {
            CycleTarget::Stream(index) => {
                if let Err(e) = self.open_component(kind, index) {
                    warn!("{} ⚠️ 切换到 {} 流 #{} 失败: {}", log_ctx(), kind.as_str(), index, e);
                }
            }
            CycleTarget::Off => self.shared.slot(kind).forget_last(),
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close_all();
    }
}
