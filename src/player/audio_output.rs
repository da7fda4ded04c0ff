use crate::core::{AudioParams, PlayerError, Result, SampleFormat};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Stream, StreamConfig, SupportedStreamConfigRange};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// 设备缓冲的最小采样帧数
pub const AUDIO_MIN_BUFFER_FRAMES: u32 = 512;
/// 每秒回调次数上限，用于估算设备缓冲大小
pub const AUDIO_MAX_CALLBACKS_PER_SEC: u32 = 30;

/// 声道数协商失败后依次尝试的下一个声道数（下标为当前声道数，最大取 7）
const NEXT_NB_CHANNELS: [u16; 8] = [0, 0, 1, 6, 2, 6, 4, 6];
/// 采样率回退表
const NEXT_SAMPLE_RATES: [u32; 5] = [0, 44100, 48000, 96000, 192000];

/// 音频拉取回调：用交错 f32 采样填满设备缓冲
pub type AudioCallback = Box<dyn FnMut(&mut [f32]) + Send>;

/// 已打开的音频设备（打开后处于暂停状态）
pub trait AudioDevice: Send {
    fn params(&self) -> AudioParams;

    /// 设备缓冲字节数
    fn hw_buffer_size(&self) -> usize;

    /// 开始拉取数据；设备随句柄一起释放
    fn resume(&mut self) -> Result<()>;
}

/// 音频后端
pub trait AudioBackend: Send {
    /// 按协商顺序打开设备，成功后回调由设备线程驱动
    fn open(&mut self, wanted: AudioParams, callback: AudioCallback) -> Result<Box<dyn AudioDevice>>;
}

/// 设备缓冲帧数：每秒不超过 30 次回调，至少 512 帧
pub fn audio_buffer_frames(freq: u32) -> u32 {
    let per_callback = (freq / AUDIO_MAX_CALLBACKS_PER_SEC).max(1);
    let log2 = 31 - per_callback.leading_zeros();
    AUDIO_MIN_BUFFER_FRAMES.max(2 << log2)
}

/// 协商顺序：同一采样率下声道数逐级回退，声道数用尽后换下一个更低的采样率
pub fn negotiation_ladder(channels: u16, freq: u32) -> Vec<(u16, u32)> {
    let mut ladder = Vec::new();
    if channels == 0 || freq == 0 {
        return ladder;
    }

    let mut rate_idx = NEXT_SAMPLE_RATES.len() - 1;
    while rate_idx > 0 && NEXT_SAMPLE_RATES[rate_idx] >= freq {
        rate_idx -= 1;
    }

    let mut rate = freq;
    loop {
        let mut ch = channels;
        while ch > 0 {
            ladder.push((ch, rate));
            ch = NEXT_NB_CHANNELS[(ch as usize).min(7)];
        }
        rate = NEXT_SAMPLE_RATES[rate_idx];
        if rate == 0 {
            break;
        }
        rate_idx -= 1;
    }
    ladder
}

/// 基于 cpal 的音频后端
#[derive(Debug, Default)]
pub struct CpalAudioBackend;

impl CpalAudioBackend {
    /// 检查配置是否兼容
    fn is_config_compatible(channels: u16, freq: u32, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range =
            freq >= supported.min_sample_rate().0 && freq <= supported.max_sample_rate().0;
        let channels_match = channels == supported.channels();
        rate_in_range && channels_match && supported.sample_format() == cpal::SampleFormat::F32
    }

    fn build_stream(
        device: &cpal::Device,
        config: &StreamConfig,
        callback: &Arc<Mutex<AudioCallback>>,
    ) -> std::result::Result<Stream, cpal::BuildStreamError> {
        let callback = callback.clone();
        device.build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                (callback.lock())(data);
            },
            move |err| {
                error!("音频流错误: {}", err);
            },
            None,
        )
    }
}

impl AudioBackend for CpalAudioBackend {
    fn open(&mut self, wanted: AudioParams, callback: AudioCallback) -> Result<Box<dyn AudioDevice>> {
        info!("初始化音频输出: {} Hz, {} 声道", wanted.freq, wanted.channels);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let supported: Vec<SupportedStreamConfigRange> = device
            .supported_output_configs()
            .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?
            .collect();

        let (channels, freq) = negotiation_ladder(wanted.channels, wanted.freq)
            .into_iter()
            .find(|&(ch, rate)| {
                supported
                    .iter()
                    .any(|range| Self::is_config_compatible(ch, rate, range))
            })
            .ok_or_else(|| {
                PlayerError::AudioError(format!(
                    "音频设备不支持任何可用配置 (原请求: {} Hz, {} 声道)",
                    wanted.freq, wanted.channels
                ))
            })?;
        if (channels, freq) != (wanted.channels, wanted.freq) {
            warn!(
                "⚠️  音频设备不支持 {} Hz, {} 声道配置，回退到 {} Hz, {} 声道",
                wanted.freq, wanted.channels, freq, channels
            );
        }

        let buffer_frames = audio_buffer_frames(freq);
        let mut config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(freq),
            buffer_size: BufferSize::Fixed(buffer_frames),
        };
        let callback = Arc::new(Mutex::new(callback));
        let stream = match Self::build_stream(&device, &config, &callback) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("固定缓冲 {} 帧失败 ({})，改用设备默认缓冲", buffer_frames, e);
                config.buffer_size = BufferSize::Default;
                Self::build_stream(&device, &config, &callback)
                    .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?
            }
        };
        stream
            .pause()
            .map_err(|e| PlayerError::AudioError(format!("暂停音频流失败: {}", e)))?;

        let params = AudioParams::new(freq, channels, SampleFormat::F32);
        info!(
            "✅ 音频设备已打开: {} Hz, {} 声道, 缓冲 {} 帧",
            freq, channels, buffer_frames
        );
        Ok(Box::new(CpalAudioDevice {
            stream,
            params,
            hw_buf_size: buffer_frames as usize * params.frame_size,
        }))
    }
}

/// cpal 输出流
pub struct CpalAudioDevice {
    stream: Stream,
    params: AudioParams,
    hw_buf_size: usize,
}

// cpal::Stream 本身不是 Send，但我们确保它只在读取线程中创建和销毁
unsafe impl Send for CpalAudioDevice {}

impl AudioDevice for CpalAudioDevice {
    fn params(&self) -> AudioParams {
        self.params
    }

    fn hw_buffer_size(&self) -> usize {
        self.hw_buf_size
    }

    fn resume(&mut self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;
        info!("音频输出已启动");
        Ok(())
    }
}

impl Drop for CpalAudioDevice {
    fn drop(&mut self) {
        info!("音频输出已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_frames() {
        assert_eq!(audio_buffer_frames(48000), 2048);
        assert_eq!(audio_buffer_frames(44100), 2048);
        assert_eq!(audio_buffer_frames(8000), 512);
        assert_eq!(audio_buffer_frames(192000), 8192);
    }

    #[test]
    fn test_ladder_stereo_48k() {
        assert_eq!(
            negotiation_ladder(2, 48000),
            vec![(2, 48000), (1, 48000), (2, 44100), (1, 44100)]
        );
    }

    #[test]
    fn test_ladder_surround_tries_fewer_channels() {
        let ladder = negotiation_ladder(6, 44100);
        assert_eq!(ladder, vec![(6, 44100), (4, 44100), (2, 44100), (1, 44100)]);
        // 44.1k 以下没有可回退的采样率
        assert_eq!(negotiation_ladder(2, 22050), vec![(2, 22050), (1, 22050)]);
    }

    #[test]
    fn test_ladder_high_rate_falls_back_through_table() {
        let rates: Vec<u32> = negotiation_ladder(1, 384000)
            .into_iter()
            .map(|(_, rate)| rate)
            .collect();
        assert_eq!(rates, vec![384000, 192000, 96000, 48000, 44100]);
    }
}
