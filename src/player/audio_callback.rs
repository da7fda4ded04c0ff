use crate::core::{sync_clock_to_slave_at, wall_time, AudioParams, FramePayload, ShowMode, SDL_MIX_MAXVOLUME};
use crate::player::audio_output::AudioCallback;
use crate::player::shared::PlayerShared;
use crate::player::sync::AudioDriftCorrector;
use log::{trace, warn};
use std::sync::Arc;

/// 没有数据可播时输出的静音块大小（字节）
const AUDIO_MIN_BUFFER_BYTES: usize = 512;

/// 音频设备回调
///
/// 从采样队列取块填满设备缓冲，并在每次回调结束时按“已写出但还没播出”的数据量
/// 反推音频时钟。
pub struct AudioPullCallback {
    shared: Arc<PlayerShared>,
    /// 设备参数，第一次回调时从共享状态读取
    params: Option<AudioParams>,
    corrector: AudioDriftCorrector,
    /// 当前块（交错采样）
    buf: Vec<f32>,
    buf_index: usize,
    silent: bool,
    /// 当前块结束时刻的音频时间
    audio_clock: f64,
    audio_clock_serial: i32,
}

impl AudioPullCallback {
    /// 设备打开后、恢复播放前，读取线程会写入 `audio_target` 和设备缓冲大小
    pub fn new(shared: Arc<PlayerShared>) -> Self {
        Self {
            shared,
            params: None,
            corrector: AudioDriftCorrector::new(0.0),
            buf: Vec::new(),
            buf_index: 0,
            silent: true,
            audio_clock: f64::NAN,
            audio_clock_serial: -1,
        }
    }

    fn params(&mut self) -> Option<AudioParams> {
        if self.params.is_none() {
            let params = self.shared.audio_target.load()?;
            let threshold =
                self.shared.audio_hw_buf_size() as f64 / params.bytes_per_sec.max(1) as f64;
            self.corrector = AudioDriftCorrector::new(threshold);
            self.params = Some(params);
        }
        self.params
    }

    pub fn into_callback(mut self) -> AudioCallback {
        Box::new(move |out: &mut [f32]| self.fill_at(out, wall_time()))
    }

    /// 取下一块音频，暂停或没有可读的帧时返回 false
    fn decode_next(&mut self, params: AudioParams, now: f64) -> bool {
        if self.shared.is_paused() {
            return false;
        }
        let frames = &self.shared.audio.frames;
        loop {
            // 回调线程不能阻塞
            if frames.remaining() == 0 {
                return false;
            }
            let Some(mut slot) = frames.acquire_readable() else {
                return false;
            };
            let meta = slot.meta;
            let payload = std::mem::take(&mut slot.payload);
            drop(slot);
            frames.advance();

            if meta.serial != self.shared.audio.packets.serial() {
                continue;
            }
            let FramePayload::Audio(audio) = payload else {
                continue;
            };
            if audio.channels != params.channels {
                warn!(
                    "音频块声道数 {} 与设备 {} 不符，丢弃",
                    audio.channels, params.channels
                );
                continue;
            }

            let nb_samples = audio.nb_samples();
            let diff = self
                .shared
                .clocks
                .audio_diff_at(self.shared.master_sync_type(), now);
            let wanted = self
                .corrector
                .wanted_samples(nb_samples, diff, params.freq);

            self.audio_clock = if meta.pts.is_nan() {
                f64::NAN
            } else {
                meta.pts + nb_samples as f64 / audio.sample_rate.max(1) as f64
            };
            self.audio_clock_serial = meta.serial;
            self.buf = if wanted != nb_samples {
                trace!("音频补偿: {} -> {} 个采样", nb_samples, wanted);
                stretch_samples(&audio.data, audio.channels, wanted)
            } else {
                audio.data
            };
            return true;
        }
    }

    /// 填满一次设备缓冲
    pub fn fill_at(&mut self, out: &mut [f32], now: f64) {
        let Some(params) = self.params() else {
            out.fill(0.0);
            return;
        };
        let channels = params.channels.max(1) as usize;
        let show_waves = self.shared.show_mode() != ShowMode::Video;
        let mut written = 0;

        while written < out.len() {
            if self.buf_index >= self.buf.len() {
                if self.decode_next(params, now) {
                    self.silent = false;
                    if show_waves {
                        self.shared
                            .samples
                            .lock()
                            .push(&self.buf, params.channels);
                    }
                } else {
                    self.silent = true;
                    let frames = (AUDIO_MIN_BUFFER_BYTES / params.frame_size.max(1)).max(1);
                    self.buf.clear();
                    self.buf.resize(frames * channels, 0.0);
                }
                self.buf_index = 0;
            }

            let len = (self.buf.len() - self.buf_index).min(out.len() - written);
            let src = &self.buf[self.buf_index..self.buf_index + len];
            let dst = &mut out[written..written + len];
            let volume = self.shared.volume();
            if self.silent || self.shared.is_muted() || volume == 0 {
                dst.fill(0.0);
            } else if volume == SDL_MIX_MAXVOLUME {
                dst.copy_from_slice(src);
            } else {
                let gain = volume as f32 / SDL_MIX_MAXVOLUME as f32;
                for (d, s) in dst.iter_mut().zip(src) {
                    *d = s * gain;
                }
            }
            written += len;
            self.buf_index += len;
        }

        let pending = self.buf.len() - self.buf_index;
        {
            let mut ring = self.shared.samples.lock();
            ring.last_write_time = now;
            ring.pending_frames = pending / channels;
        }

        if !self.audio_clock.is_nan() {
            let write_buf_size = pending * params.format.bytes_per_sample();
            let hw_buf_size = self.shared.audio_hw_buf_size();
            let clocks = &self.shared.clocks;
            clocks.audio.set_at(
                self.audio_clock
                    - (2 * hw_buf_size + write_buf_size) as f64
                        / params.bytes_per_sec.max(1) as f64,
                self.audio_clock_serial,
                now,
            );
            sync_clock_to_slave_at(&clocks.external, &clocks.audio, now);
        }
    }
}

/// 把交错采样线性插值拉伸到 `wanted` 帧
pub fn stretch_samples(data: &[f32], channels: u16, wanted: usize) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    let nb = data.len() / ch;
    if nb == 0 || wanted == 0 {
        return Vec::new();
    }
    if wanted == nb {
        return data[..nb * ch].to_vec();
    }
    let step = if wanted > 1 {
        (nb - 1) as f64 / (wanted - 1) as f64
    } else {
        0.0
    };
    let mut out = Vec::with_capacity(wanted * ch);
    for i in 0..wanted {
        let pos = i as f64 * step;
        let i0 = (pos.floor() as usize).min(nb - 1);
        let i1 = (i0 + 1).min(nb - 1);
        let frac = (pos - i0 as f64) as f32;
        for c in 0..ch {
            let a = data[i0 * ch + c];
            let b = data[i1 * ch + c];
            out.push(a + (b - a) * frac);
        }
    }
    out
}
