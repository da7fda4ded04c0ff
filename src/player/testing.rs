// 测试用的脚本化数据源、解码器、音频设备和渲染器

use crate::core::{
    rescale, AudioFrame, AudioParams, FramePayload, MediaInfo, MediaKind, MediaSource, PlayerError,
    PixelFormat, Rational, Result, SampleFormat, SeekRequest, StreamInfo, SubtitleFrame,
    VideoFrame, TIME_BASE_Q,
};
use crate::player::audio_output::{AudioBackend, AudioCallback, AudioDevice};
use crate::player::codec::{DecodeBackend, DecodedFrame, ReceiveStatus, SendStatus};
use crate::player::demuxer_factory::SourceFactory;
use crate::player::demuxer_source::{DemuxerSource, MediaPacket};
use crate::renderer::{DisplayRect, VideoRenderer};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub enum ScriptedStep {
    Frame(DecodedFrame),
}

enum Mode {
    /// 每次 send 依次吐出脚本中的一帧
    Steps(VecDeque<ScriptedStep>),
    /// 每个包生成一帧对应的输出
    Mirror {
        kind: MediaKind,
        time_base: Rational,
        audio: Option<AudioParams>,
    },
}

/// 脚本化的解码原语
pub struct ScriptedBackend {
    mode: Mode,
    ready: VecDeque<DecodedFrame>,
    draining: bool,
    reject_first: bool,
    sent: Arc<AtomicUsize>,
    flushes: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self::with_mode(Mode::Steps(steps.into()))
    }

    /// 每个包生成一个 10 ms 的单声道音频块
    pub fn endless_audio() -> Self {
        Self::mirror(
            MediaKind::Audio,
            Rational::new(1, 1000),
            Some(AudioParams::new(48000, 1, SampleFormat::F32)),
        )
    }

    pub fn mirror(kind: MediaKind, time_base: Rational, audio: Option<AudioParams>) -> Self {
        Self::with_mode(Mode::Mirror {
            kind,
            time_base,
            audio,
        })
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            ready: VecDeque::new(),
            draining: false,
            reject_first: false,
            sent: Arc::new(AtomicUsize::new(0)),
            flushes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 第一次 send 返回 Again
    pub fn reject_first_send(mut self) -> Self {
        self.reject_first = true;
        self
    }

    pub fn sent_counter(&self) -> Arc<AtomicUsize> {
        self.sent.clone()
    }

    pub fn flush_counter(&self) -> Arc<AtomicUsize> {
        self.flushes.clone()
    }
}

fn mirror_frame(
    kind: MediaKind,
    time_base: Rational,
    audio: Option<AudioParams>,
    pkt: &MediaPacket,
) -> DecodedFrame {
    let payload = match kind {
        MediaKind::Video => FramePayload::Picture(VideoFrame {
            width: 2,
            height: 2,
            format: Some(PixelFormat::RGBA),
            data: vec![pkt.pts.unwrap_or(0) as u8; 16],
        }),
        MediaKind::Audio => {
            let params = audio.unwrap_or_else(|| AudioParams::new(48000, 1, SampleFormat::F32));
            let nb = if pkt.duration > 0 {
                rescale(pkt.duration, time_base, Rational::new(1, params.freq as i32))
            } else {
                params.freq as i64 / 100
            };
            FramePayload::Audio(AudioFrame {
                sample_rate: params.freq,
                channels: params.channels,
                format: SampleFormat::F32,
                data: vec![0.1; nb.max(1) as usize * params.channels as usize],
            })
        }
        MediaKind::Subtitle => FramePayload::Subtitle(SubtitleFrame {
            text: format!("subtitle {}", pkt.pts.unwrap_or(0)),
            start_display: 0.0,
            end_display: pkt.duration as f64 * time_base.to_f64(),
            ..SubtitleFrame::default()
        }),
    };
    DecodedFrame {
        pts: pkt.pts,
        pkt_dts: pkt.dts,
        best_effort: pkt.pts.or(pkt.dts),
        time_base,
        pos: pkt.pos,
        sar: Rational::new(1, 1),
        payload,
    }
}

impl DecodeBackend for ScriptedBackend {
    fn send_packet(&mut self, packet: Option<&MediaPacket>) -> Result<SendStatus> {
        let Some(pkt) = packet else {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        };
        self.sent.fetch_add(1, Ordering::SeqCst);
        if self.reject_first {
            self.reject_first = false;
            return Ok(SendStatus::Again);
        }
        match &mut self.mode {
            Mode::Steps(steps) => {
                if let Some(ScriptedStep::Frame(frame)) = steps.pop_front() {
                    self.ready.push_back(frame);
                }
            }
            Mode::Mirror {
                kind,
                time_base,
                audio,
            } => self
                .ready
                .push_back(mirror_frame(*kind, *time_base, *audio, pkt)),
        }
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus> {
        Ok(match self.ready.pop_front() {
            Some(frame) => ReceiveStatus::Frame(frame),
            None if self.draining => ReceiveStatus::Eof,
            None => ReceiveStatus::Again,
        })
    }

    fn flush(&mut self) {
        self.ready.clear();
        self.draining = false;
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn description(&self) -> String {
        "scripted".to_string()
    }
}

pub fn stream(index: usize, kind: MediaKind, time_base: Rational) -> StreamInfo {
    StreamInfo {
        index,
        kind,
        time_base,
        start_time: Some(0),
        codec_name: "scripted".to_string(),
        language: None,
        attached_pic: false,
        width: if kind == MediaKind::Video { 2 } else { 0 },
        height: if kind == MediaKind::Video { 2 } else { 0 },
        sample_rate: if kind == MediaKind::Audio { 48000 } else { 0 },
        channels: if kind == MediaKind::Audio { 2 } else { 0 },
        frame_rate: (kind == MediaKind::Video).then(|| Rational::new(25, 1)),
        rotation: 0.0,
    }
}

/// 内存中的数据源：按时间顺序交错的包
pub struct ScriptedSource {
    info: MediaInfo,
    packets: Vec<MediaPacket>,
    position: usize,
    seeks: Arc<Mutex<Vec<SeekRequest>>>,
    /// 读到第几个包时开始出错
    fail_at: Option<usize>,
    /// 剩余的可恢复错误次数，用完后继续正常读取
    transient_failures: usize,
    /// IO 已损坏：之后每次读取都失败
    fatal: bool,
}

impl ScriptedSource {
    pub fn new(info: MediaInfo, packets: Vec<MediaPacket>) -> Self {
        Self {
            info,
            packets,
            position: 0,
            seeks: Arc::new(Mutex::new(Vec::new())),
            fail_at: None,
            transient_failures: 0,
            fatal: false,
        }
    }

    /// 视频流 #0 (25 fps, 1/1000) 和音频流 #1 (每包 20 ms, 1/1000)，时长 `seconds`
    pub fn av(seconds: f64) -> Self {
        let tb = Rational::new(1, 1000);
        let mut packets = Vec::new();
        let end_ms = (seconds * 1000.0) as i64;
        let mut pos = 0;
        for ms in (0..end_ms).step_by(20) {
            if ms % 40 == 0 {
                packets.push(MediaPacket {
                    stream_index: 0,
                    data: vec![0; 64],
                    pts: Some(ms),
                    dts: Some(ms),
                    duration: 40,
                    pos,
                    key: true,
                });
                pos += 64;
            }
            packets.push(MediaPacket {
                stream_index: 1,
                data: vec![0; 32],
                pts: Some(ms),
                dts: Some(ms),
                duration: 20,
                pos,
                key: true,
            });
            pos += 32;
        }
        let info = MediaInfo {
            url: "scripted://av".to_string(),
            format_name: "scripted".to_string(),
            duration: Some(seconds),
            start_time: Some(0.0),
            bit_rate: 0,
            streams: vec![
                stream(0, MediaKind::Video, tb),
                stream(1, MediaKind::Audio, tb),
            ],
            chapters: Vec::new(),
            realtime: false,
            ts_discontinuous: false,
            prefers_byte_seek: false,
        };
        Self::new(info, packets)
    }

    pub fn add_stream(&mut self, stream: StreamInfo) {
        self.info.streams.push(stream);
    }

    pub fn with_chapters(mut self, chapters: Vec<crate::core::Chapter>) -> Self {
        self.info.chapters = chapters;
        self
    }

    /// 在第 `at` 个包之前连续失败 `times` 次，之后恢复
    pub fn with_transient_errors(mut self, at: usize, times: usize) -> Self {
        self.fail_at = Some(at);
        self.transient_failures = times;
        self
    }

    /// 在第 `at` 个包处 IO 损坏
    pub fn with_io_error(mut self, at: usize) -> Self {
        self.fail_at = Some(at);
        self.fatal = true;
        self
    }

    pub fn seek_log(&self) -> Arc<Mutex<Vec<SeekRequest>>> {
        self.seeks.clone()
    }
}

impl DemuxerSource for ScriptedSource {
    fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        if self.fail_at == Some(self.position) {
            if self.fatal {
                return Err(PlayerError::SourceIoError("Input/output error".to_string()));
            }
            if self.transient_failures > 0 {
                self.transient_failures -= 1;
                return Err(PlayerError::Other("Resource temporarily unavailable".to_string()));
            }
        }
        let packet = self.packets.get(self.position).cloned();
        if packet.is_some() {
            self.position += 1;
        }
        Ok(packet)
    }

    fn seek(&mut self, request: &SeekRequest) -> Result<()> {
        self.seeks.lock().push(*request);
        let info = &self.info;
        self.position = self
            .packets
            .iter()
            .position(|pkt| {
                if request.by_bytes {
                    return pkt.pos >= request.target;
                }
                let tb = info
                    .stream(pkt.stream_index)
                    .map_or(Rational::new(1, 1000), |s| s.time_base);
                pkt.timestamp()
                    .map_or(false, |ts| rescale(ts, tb, TIME_BASE_Q) >= request.target)
            })
            .unwrap_or(self.packets.len());
        Ok(())
    }

    fn open_decoder(
        &self,
        stream_index: usize,
        audio_target: Option<AudioParams>,
    ) -> Result<Box<dyn DecodeBackend>> {
        let stream = self
            .info
            .stream(stream_index)
            .ok_or_else(|| crate::core::PlayerError::Other("no such stream".to_string()))?;
        Ok(Box::new(ScriptedBackend::mirror(
            stream.kind,
            stream.time_base,
            audio_target,
        )))
    }

    fn byte_position(&self) -> i64 {
        self.packets.get(self.position).map_or(-1, |p| p.pos)
    }

    fn description(&self) -> String {
        format!("ScriptedSource({})", self.info.url)
    }
}

/// 每次 open 克隆一份脚本源
pub struct ScriptedFactory {
    make: Box<dyn Fn() -> ScriptedSource + Send + Sync>,
}

impl ScriptedFactory {
    pub fn new(make: impl Fn() -> ScriptedSource + Send + Sync + 'static) -> Self {
        Self {
            make: Box::new(make),
        }
    }
}

impl SourceFactory for ScriptedFactory {
    fn open(&self, _source: &MediaSource) -> Result<Box<dyn DemuxerSource>> {
        Ok(Box::new((self.make)()))
    }
}

/// 由测试手动驱动回调的音频设备
#[derive(Clone, Default)]
pub struct FakeAudio {
    callback: Arc<Mutex<Option<AudioCallback>>>,
    opened: Arc<Mutex<Vec<AudioParams>>>,
    /// 设备只接受的声道数（None 表示全部接受）
    force_channels: Option<u16>,
}

impl FakeAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(channels: u16) -> Self {
        Self {
            force_channels: Some(channels),
            ..Self::default()
        }
    }

    pub fn backend(&self) -> Box<dyn AudioBackend> {
        Box::new(self.clone())
    }

    /// 拉取 `samples` 个交错采样；设备未打开时返回 None
    pub fn pump(&self, samples: usize) -> Option<Vec<f32>> {
        let mut guard = self.callback.lock();
        let callback = guard.as_mut()?;
        let mut out = vec![0.0; samples];
        callback(&mut out);
        Some(out)
    }

    pub fn is_open(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn opened(&self) -> Vec<AudioParams> {
        self.opened.lock().clone()
    }
}

impl AudioBackend for FakeAudio {
    fn open(&mut self, wanted: AudioParams, callback: AudioCallback) -> Result<Box<dyn AudioDevice>> {
        let channels = self.force_channels.unwrap_or(wanted.channels);
        let params = AudioParams::new(wanted.freq, channels, SampleFormat::F32);
        self.opened.lock().push(params);
        *self.callback.lock() = Some(callback);
        Ok(Box::new(FakeDevice {
            params,
            callback: self.callback.clone(),
        }))
    }
}

struct FakeDevice {
    params: AudioParams,
    callback: Arc<Mutex<Option<AudioCallback>>>,
}

impl AudioDevice for FakeDevice {
    fn params(&self) -> AudioParams {
        self.params
    }

    fn hw_buffer_size(&self) -> usize {
        // 10 ms
        self.params.bytes_per_sec / 100
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        *self.callback.lock() = None;
    }
}

/// 记录所有调用的渲染器
#[derive(Default)]
pub struct RecordingRenderer {
    pub uploads: Vec<VideoFrame>,
    pub presented: Vec<DisplayRect>,
    pub waveforms: usize,
    pub subtitle: Option<String>,
    pub subtitle_bitmaps: usize,
    pub subtitle_canvas: (u32, u32),
    /// 显示新字幕的次数
    pub subtitle_updates: usize,
    pub fullscreen: bool,
}

impl VideoRenderer for RecordingRenderer {
    fn upload_picture(&mut self, frame: &VideoFrame) -> Result<()> {
        self.uploads.push(frame.clone());
        Ok(())
    }

    fn set_subtitle(&mut self, subtitle: Option<&SubtitleFrame>) {
        self.subtitle = subtitle.map(|s| s.text.clone());
        self.subtitle_bitmaps = subtitle.map_or(0, |s| s.bitmaps.len());
        self.subtitle_canvas = subtitle.map_or((0, 0), |s| s.canvas);
        if subtitle.is_some() {
            self.subtitle_updates += 1;
        }
    }

    fn present(&mut self, rect: DisplayRect) -> Result<()> {
        self.presented.push(rect);
        Ok(())
    }

    fn present_waveform(&mut self, _channels: &[Vec<f32>]) -> Result<()> {
        self.waveforms += 1;
        Ok(())
    }

    fn viewport(&self) -> (u32, u32) {
        (640, 480)
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        self.fullscreen = fullscreen;
    }
}
