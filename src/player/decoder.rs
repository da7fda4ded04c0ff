use crate::core::{
    rescale, wall_time, FramePayload, MediaKind, PlayerError, Rational, Result, StreamInfo,
    AV_NOSYNC_THRESHOLD,
};
use crate::player::codec::{DecodeBackend, DecodedFrame, ReceiveStatus, SendStatus};
use crate::player::filter::FrameFilter;
use crate::player::frame_queue::{FrameMeta, FrameQueue};
use crate::player::log_ctx;
use crate::player::packet_queue::{ContinueReadSignal, Packet, PacketGet, PacketQueue};
use crate::player::shared::PlayerShared;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// `decode_frame` 的结果
#[derive(Debug)]
pub enum DecodeOutcome {
    Frame(DecodedFrame),
    /// 当前这一代数据已全部输出
    Finished,
    /// 包队列已中止
    Aborted,
}

/// 单条流的解码状态机
///
/// 从包队列取包喂给解码原语，再把输出取回来。
/// 包队列 serial 变化（seek）时重置解码原语和时间戳推算状态。
pub struct Decoder {
    kind: MediaKind,
    backend: Box<dyn DecodeBackend>,
    queue: Arc<PacketQueue>,
    continue_read: Arc<ContinueReadSignal>,
    /// 当前处理的数据属于哪一代，-1 表示还没有取过包
    pkt_serial: i32,
    finished: Arc<AtomicI32>,
    /// 解码原语拒收、下次重发的包
    pending: Option<Packet>,
    /// None = best effort, Some(true) = 帧 pts, Some(false) = 包 dts
    reorder_pts: Option<bool>,
    /// 流的 time_base
    pkt_timebase: Rational,
    start_pts: Option<i64>,
    start_pts_tb: Rational,
    next_pts: Option<i64>,
    next_pts_tb: Rational,
}

impl Decoder {
    pub fn new(
        kind: MediaKind,
        backend: Box<dyn DecodeBackend>,
        queue: Arc<PacketQueue>,
        finished: Arc<AtomicI32>,
        continue_read: Arc<ContinueReadSignal>,
        pkt_timebase: Rational,
    ) -> Self {
        finished.store(0, Ordering::Release);
        Self {
            kind,
            backend,
            queue,
            continue_read,
            pkt_serial: -1,
            finished,
            pending: None,
            reorder_pts: None,
            pkt_timebase,
            start_pts: None,
            start_pts_tb: Rational::default(),
            next_pts: None,
            next_pts_tb: Rational::default(),
        }
    }

    pub fn with_reorder_pts(mut self, reorder_pts: Option<bool>) -> Self {
        self.reorder_pts = reorder_pts;
        self
    }

    /// 源不支持按时间定位时，音频时间戳从流起始时间开始推算
    pub fn with_start_pts(mut self, start_pts: Option<i64>, tb: Rational) -> Self {
        self.start_pts = start_pts;
        self.start_pts_tb = tb;
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn pkt_serial(&self) -> i32 {
        self.pkt_serial
    }

    pub fn description(&self) -> String {
        self.backend.description()
    }

    /// 取出下一帧
    pub fn decode_frame(&mut self) -> DecodeOutcome {
        loop {
            if self.queue.serial() == self.pkt_serial {
                loop {
                    if self.queue.is_aborted() {
                        return DecodeOutcome::Aborted;
                    }
                    match self.backend.receive_frame() {
                        Ok(ReceiveStatus::Frame(mut frame)) => {
                            self.fix_timestamps(&mut frame);
                            return DecodeOutcome::Frame(frame);
                        }
                        Ok(ReceiveStatus::Eof) => {
                            self.finished.store(self.pkt_serial, Ordering::Release);
                            self.backend.flush();
                            return DecodeOutcome::Finished;
                        }
                        Ok(ReceiveStatus::Again) => break,
                        Err(e) => {
                            warn!("{} 解码错误（已跳过）: {}", self.kind.as_str(), e);
                            break;
                        }
                    }
                }
            }

            let packet = match self.next_packet() {
                Some(packet) => packet,
                None => return DecodeOutcome::Aborted,
            };

            let input = match &packet {
                Packet::Data(pkt) => Some(pkt),
                Packet::Null { .. } => None,
                // serial 变化已在 next_packet 中处理
                Packet::Flush => continue,
            };
            match self.backend.send_packet(input) {
                Ok(SendStatus::Accepted) => {}
                Ok(SendStatus::Again) => {
                    error!(
                        "{} Receive_frame and send_packet both returned EAGAIN, which is an API violation.",
                        log_ctx()
                    );
                    self.pending = Some(packet);
                }
                Err(e) => warn!("{} 送入数据包失败（已跳过）: {}", self.kind.as_str(), e),
            }
        }
    }

    /// 取下一个属于当前这一代的包，队列中止返回 None
    fn next_packet(&mut self) -> Option<Packet> {
        loop {
            if self.queue.nb_packets() == 0 {
                self.continue_read.notify();
            }
            let packet = if let Some(packet) = self.pending.take() {
                packet
            } else {
                let old_serial = self.pkt_serial;
                let (packet, serial) = match self.queue.get(true) {
                    PacketGet::Packet { packet, serial } => (packet, serial),
                    PacketGet::Aborted | PacketGet::Empty => return None,
                };
                self.pkt_serial = serial;
                if old_serial != serial {
                    self.backend.flush();
                    self.finished.store(0, Ordering::Release);
                    self.next_pts = self.start_pts;
                    self.next_pts_tb = self.start_pts_tb;
                }
                packet
            };
            if self.queue.serial() == self.pkt_serial {
                return Some(packet);
            }
            // 旧一代的数据，丢弃
        }
    }

    fn fix_timestamps(&mut self, frame: &mut DecodedFrame) {
        match self.kind {
            MediaKind::Video => {
                frame.pts = match self.reorder_pts {
                    None => frame.best_effort,
                    Some(true) => frame.pts,
                    Some(false) => frame.pkt_dts,
                };
            }
            MediaKind::Audio => {
                let FramePayload::Audio(audio) = &frame.payload else {
                    return;
                };
                let tb = Rational::new(1, audio.sample_rate as i32);
                let nb_samples = audio.nb_samples() as i64;
                let source_tb = if frame.time_base.is_valid() {
                    frame.time_base
                } else {
                    self.pkt_timebase
                };
                frame.pts = match (frame.pts, self.next_pts) {
                    (Some(pts), _) => Some(rescale(pts, source_tb, tb)),
                    (None, Some(next)) => Some(rescale(next, self.next_pts_tb, tb)),
                    (None, None) => None,
                };
                frame.time_base = tb;
                if let Some(pts) = frame.pts {
                    self.next_pts = Some(pts + nb_samples);
                    self.next_pts_tb = tb;
                }
            }
            MediaKind::Subtitle => {}
        }
    }
}

/// 运行中的解码线程
pub struct DecoderHandle {
    kind: MediaKind,
    packets: Arc<PacketQueue>,
    frames: Arc<FrameQueue>,
    thread: Option<JoinHandle<()>>,
}

impl DecoderHandle {
    /// 启动包队列并在新线程中运行 `worker`
    pub fn start<F>(
        decoder: Decoder,
        packets: Arc<PacketQueue>,
        frames: Arc<FrameQueue>,
        worker: F,
    ) -> Result<Self>
    where
        F: FnOnce(Decoder) + Send + 'static,
    {
        let kind = decoder.kind();
        packets.start();
        let thread = thread::Builder::new()
            .name(format!("{}_decoder", kind.as_str()))
            .spawn(move || worker(decoder))
            .map_err(|e| {
                packets.abort();
                PlayerError::from(e)
            })?;
        Ok(Self {
            kind,
            packets,
            frames,
            thread: Some(thread),
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// 中止并回收解码线程
    ///
    /// 顺序：中止包队列，唤醒帧队列上的等待者，join，最后清空包队列。
    pub fn abort(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.packets.abort();
        self.frames.signal();
        if thread.join().is_err() {
            warn!("{} ⚠️ {} 解码线程异常退出", log_ctx(), self.kind.as_str());
        }
        self.packets.flush();
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

fn queue_frame(frames: &FrameQueue, meta: FrameMeta, payload: FramePayload) -> bool {
    match frames.acquire_writable() {
        Some(mut slot) => {
            slot.meta = meta;
            slot.payload = payload;
            frames.publish(slot);
            true
        }
        None => false,
    }
}

/// 视频解码线程
pub fn video_worker(
    mut decoder: Decoder,
    shared: Arc<PlayerShared>,
    stream: StreamInfo,
    mut filter: Box<dyn FrameFilter>,
) {
    info!("{} 🎬 视频解码线程启动: {} ({})", log_ctx(), decoder.description(), filter.name());
    let tb = stream.time_base.to_f64();
    let frame_duration = stream
        .frame_rate
        .filter(|r| r.is_valid())
        .map_or(0.0, |r| r.den as f64 / r.num as f64);

    loop {
        let mut frame = match decoder.decode_frame() {
            DecodeOutcome::Frame(frame) => frame,
            DecodeOutcome::Finished => continue,
            DecodeOutcome::Aborted => break,
        };
        let pts = frame.pts.map_or(f64::NAN, |pts| pts as f64 * tb);

        if should_drop_early(&shared, pts, decoder.pkt_serial()) {
            shared.record_early_drop();
            continue;
        }

        filter.process(&mut frame);
        let (width, height) = match &frame.payload {
            FramePayload::Picture(picture) => (picture.width, picture.height),
            _ => (stream.width, stream.height),
        };
        let meta = FrameMeta {
            serial: decoder.pkt_serial(),
            pts,
            duration: frame_duration,
            pos: frame.pos,
            width,
            height,
            sar: frame.sar,
            uploaded: false,
        };
        if !queue_frame(&shared.video.frames, meta, frame.payload) {
            break;
        }
    }
    info!("{} 🎬 视频解码线程结束", log_ctx());
}

/// 解码出的画面已经落后于主时钟时直接丢弃
fn should_drop_early(shared: &PlayerShared, pts: f64, pkt_serial: i32) -> bool {
    if pts.is_nan() || !shared.framedrop_enabled() {
        return false;
    }
    let diff = pts - shared.master_clock_at(wall_time());
    !diff.is_nan()
        && diff.abs() < AV_NOSYNC_THRESHOLD
        && diff < 0.0
        && pkt_serial == shared.clocks.video.serial()
        && shared.video.packets.nb_packets() > 0
}

/// 音频解码线程
pub fn audio_worker(mut decoder: Decoder, shared: Arc<PlayerShared>) {
    info!("{} 🔊 音频解码线程启动: {}", log_ctx(), decoder.description());
    loop {
        let frame = match decoder.decode_frame() {
            DecodeOutcome::Frame(frame) => frame,
            DecodeOutcome::Finished => continue,
            DecodeOutcome::Aborted => break,
        };
        let FramePayload::Audio(audio) = &frame.payload else {
            continue;
        };
        let duration = if audio.sample_rate > 0 {
            audio.nb_samples() as f64 / audio.sample_rate as f64
        } else {
            0.0
        };
        let meta = FrameMeta {
            serial: decoder.pkt_serial(),
            pts: frame.pts.map_or(f64::NAN, |pts| pts as f64 * frame.time_base.to_f64()),
            duration,
            pos: frame.pos,
            ..FrameMeta::default()
        };
        if !queue_frame(&shared.audio.frames, meta, frame.payload) {
            break;
        }
    }
    info!("{} 🔊 音频解码线程结束", log_ctx());
}

/// 字幕解码线程
pub fn subtitle_worker(mut decoder: Decoder, shared: Arc<PlayerShared>, stream: StreamInfo) {
    info!("{} 💬 字幕解码线程启动: {}", log_ctx(), decoder.description());
    loop {
        let frame = match decoder.decode_frame() {
            DecodeOutcome::Frame(frame) => frame,
            DecodeOutcome::Finished => continue,
            DecodeOutcome::Aborted => break,
        };
        let FramePayload::Subtitle(subtitle) = &frame.payload else {
            continue;
        };
        if subtitle.is_empty() {
            continue;
        }
        let meta = FrameMeta {
            serial: decoder.pkt_serial(),
            pts: frame.pts.map_or(0.0, |pts| pts as f64 * frame.time_base.to_f64()),
            duration: subtitle.end_display - subtitle.start_display,
            pos: frame.pos,
            width: stream.width,
            height: stream.height,
            ..FrameMeta::default()
        };
        debug!(
            "💬 字幕 pts={:.3}: {} ({} 个位图区域)",
            meta.pts,
            subtitle.text,
            subtitle.bitmaps.len()
        );
        if !queue_frame(&shared.subtitle.frames, meta, frame.payload) {
            break;
        }
    }
    info!("{} 💬 字幕解码线程结束", log_ctx());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AudioFrame, SampleFormat};
    use crate::player::demuxer_source::MediaPacket;
    use crate::player::testing::{ScriptedBackend, ScriptedStep};

    fn packet(pts: i64) -> MediaPacket {
        MediaPacket {
            stream_index: 0,
            data: vec![0; 16],
            pts: Some(pts),
            dts: Some(pts),
            duration: 1,
            pos: pts * 100,
            key: true,
        }
    }

    fn audio_frame(pts: Option<i64>, nb_samples: usize) -> DecodedFrame {
        DecodedFrame {
            pts,
            time_base: Rational::new(1, 1000),
            pos: -1,
            payload: FramePayload::Audio(AudioFrame {
                sample_rate: 48000,
                channels: 1,
                format: SampleFormat::F32,
                data: vec![0.0; nb_samples],
            }),
            ..DecodedFrame::default()
        }
    }

    fn decoder(kind: MediaKind, backend: ScriptedBackend) -> (Decoder, Arc<PacketQueue>) {
        let queue = Arc::new(PacketQueue::new("test"));
        queue.start();
        let decoder = Decoder::new(
            kind,
            Box::new(backend),
            queue.clone(),
            Arc::new(AtomicI32::new(0)),
            Arc::new(ContinueReadSignal::new()),
            Rational::new(1, 1000),
        );
        (decoder, queue)
    }

    fn expect_frame(outcome: DecodeOutcome) -> DecodedFrame {
        match outcome {
            DecodeOutcome::Frame(frame) => frame,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_audio_pts_synthesized_from_previous_frame() {
        let backend = ScriptedBackend::new(vec![
            ScriptedStep::Frame(audio_frame(Some(1000), 480)),
            ScriptedStep::Frame(audio_frame(None, 480)),
        ]);
        let (mut decoder, queue) = decoder(MediaKind::Audio, backend);
        queue.put(packet(0)).unwrap();
        queue.put(packet(1)).unwrap();

        let first = expect_frame(decoder.decode_frame());
        // 1000 ms -> 48000 采样
        assert_eq!(first.pts, Some(48000));
        assert_eq!(first.time_base, Rational::new(1, 48000));
        let second = expect_frame(decoder.decode_frame());
        assert_eq!(second.pts, Some(48480));
    }

    #[test]
    fn test_null_packet_drains_to_finished() {
        let backend = ScriptedBackend::new(vec![ScriptedStep::Frame(audio_frame(Some(0), 10))]);
        let finished = Arc::new(AtomicI32::new(0));
        let queue = Arc::new(PacketQueue::new("test"));
        queue.start();
        let mut decoder = Decoder::new(
            MediaKind::Audio,
            Box::new(backend),
            queue.clone(),
            finished.clone(),
            Arc::new(ContinueReadSignal::new()),
            Rational::new(1, 1000),
        );
        queue.put(packet(0)).unwrap();
        queue.put_null(0).unwrap();

        expect_frame(decoder.decode_frame());
        assert!(matches!(decoder.decode_frame(), DecodeOutcome::Finished));
        assert_eq!(finished.load(Ordering::SeqCst), queue.serial());
    }

    #[test]
    fn test_flush_marker_resets_backend_and_finished() {
        let backend = ScriptedBackend::new(vec![
            ScriptedStep::Frame(audio_frame(Some(0), 10)),
            ScriptedStep::Frame(audio_frame(Some(5000), 10)),
        ]);
        let flushes = backend.flush_counter();
        let (mut decoder, queue) = decoder(MediaKind::Audio, backend);
        queue.put(packet(0)).unwrap();
        expect_frame(decoder.decode_frame());
        let first_serial = decoder.pkt_serial();

        // seek：旧包被丢弃，新一代的包带新 serial
        queue.put(packet(1)).unwrap();
        queue.put_flush_marker().unwrap();
        queue.put(packet(2)).unwrap();
        let frame = expect_frame(decoder.decode_frame());
        assert_eq!(frame.pts, Some(5000 * 48));
        assert_eq!(decoder.pkt_serial(), first_serial + 1);
        assert!(flushes.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_rejected_packet_is_resent() {
        let backend = ScriptedBackend::new(vec![ScriptedStep::Frame(audio_frame(Some(0), 10))])
            .reject_first_send();
        let sent = backend.sent_counter();
        let (mut decoder, queue) = decoder(MediaKind::Audio, backend);
        queue.put(packet(7)).unwrap();

        expect_frame(decoder.decode_frame());
        // 第一次被拒收，第二次重发同一个包
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_abort_stops_decoder() {
        let (mut decoder, queue) = decoder(MediaKind::Audio, ScriptedBackend::new(vec![]));
        queue.abort();
        assert!(matches!(decoder.decode_frame(), DecodeOutcome::Aborted));
    }

    #[test]
    fn test_video_reorder_policy() {
        let frame = DecodedFrame {
            pts: Some(10),
            pkt_dts: Some(8),
            best_effort: Some(9),
            ..DecodedFrame::default()
        };
        let backend = ScriptedBackend::new(vec![ScriptedStep::Frame(frame)]);
        let (decoder, queue) = decoder(MediaKind::Video, backend);
        let mut decoder = decoder.with_reorder_pts(Some(false));
        queue.put(packet(0)).unwrap();
        assert_eq!(expect_frame(decoder.decode_frame()).pts, Some(8));
    }

    #[test]
    fn test_handle_abort_unblocks_worker_on_full_frame_queue() {
        let queue = Arc::new(PacketQueue::new("test"));
        let frames = Arc::new(FrameQueue::new(queue.clone(), 1, false));
        let decoder = Decoder::new(
            MediaKind::Audio,
            Box::new(ScriptedBackend::endless_audio()),
            queue.clone(),
            Arc::new(AtomicI32::new(0)),
            Arc::new(ContinueReadSignal::new()),
            Rational::new(1, 1000),
        );
        let worker_frames = frames.clone();
        let mut handle = DecoderHandle::start(decoder, queue.clone(), frames.clone(), move |mut dec| {
            loop {
                match dec.decode_frame() {
                    DecodeOutcome::Frame(frame) => {
                        let meta = FrameMeta::default();
                        if !queue_frame(&worker_frames, meta, frame.payload) {
                            break;
                        }
                    }
                    DecodeOutcome::Finished => continue,
                    DecodeOutcome::Aborted => break,
                }
            }
        })
        .unwrap();
        for pts in 0..4 {
            queue.put(packet(pts)).unwrap();
        }
        thread::sleep(std::time::Duration::from_millis(50));
        handle.abort();
        assert_eq!(queue.nb_packets(), 0);
        assert!(queue.is_aborted());
    }
}
