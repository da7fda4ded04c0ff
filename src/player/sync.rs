use crate::core::{Clock, SyncType, AV_NOSYNC_THRESHOLD};
use crate::player::frame_queue::FrameMeta;
use log::trace;
use std::sync::atomic::AtomicI32;
use std::sync::Arc;

/// 同步阈值下限（秒）
pub const AV_SYNC_THRESHOLD_MIN: f64 = 0.04;
/// 同步阈值上限（秒）
pub const AV_SYNC_THRESHOLD_MAX: f64 = 0.1;
/// 帧时长超过该值时不再靠重复帧追赶
pub const AV_SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;

/// 音频差值滑动平均的样本数
pub const AUDIO_DIFF_AVG_NB: usize = 20;
/// 单次音频采样数修正的最大百分比
pub const SAMPLE_CORRECTION_PERCENT_MAX: usize = 10;

pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;

/// 根据实际打开的流决定主时钟
///
/// 视频主时钟在没有视频时退回音频，音频主时钟在没有音频时退回外部时钟。
pub fn resolve_master(preferred: SyncType, has_video: bool, has_audio: bool) -> SyncType {
    match preferred {
        SyncType::VideoMaster if has_video => SyncType::VideoMaster,
        SyncType::VideoMaster | SyncType::AudioMaster if has_audio => SyncType::AudioMaster,
        _ => SyncType::ExternalClock,
    }
}

/// 视频帧显示延迟的校正
///
/// `diff` 是视频时钟减主时钟，NaN 或超过 `max_frame_duration` 视为时间戳跳变，不校正。
pub fn target_delay(delay: f64, diff: f64, max_frame_duration: f64) -> f64 {
    let sync_threshold = AV_SYNC_THRESHOLD_MIN.max(AV_SYNC_THRESHOLD_MAX.min(delay));
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return delay;
    }
    if diff <= -sync_threshold {
        (delay + diff).max(0.0)
    } else if diff >= sync_threshold && delay > AV_SYNC_FRAMEDUP_THRESHOLD {
        delay + diff
    } else if diff >= sync_threshold {
        2.0 * delay
    } else {
        delay
    }
}

/// 相邻两帧之间的显示时长
pub fn vp_duration(current: &FrameMeta, next: &FrameMeta, max_frame_duration: f64) -> f64 {
    if current.serial != next.serial {
        return 0.0;
    }
    let duration = next.pts - current.pts;
    if duration.is_nan() || duration <= 0.0 || duration > max_frame_duration {
        current.duration
    } else {
        duration
    }
}

/// 外部时钟速度的下一步取值
///
/// `None` 表示对应的流没有打开。
pub fn next_external_clock_speed(
    speed: f64,
    video_packets: Option<usize>,
    audio_packets: Option<usize>,
) -> f64 {
    let low = |n: Option<usize>| n.map_or(false, |n| n <= EXTERNAL_CLOCK_MIN_FRAMES);
    let high = |n: Option<usize>| n.map_or(true, |n| n > EXTERNAL_CLOCK_MAX_FRAMES);

    if low(video_packets) || low(audio_packets) {
        EXTERNAL_CLOCK_SPEED_MIN.max(speed - EXTERNAL_CLOCK_SPEED_STEP)
    } else if high(video_packets) && high(audio_packets) {
        EXTERNAL_CLOCK_SPEED_MAX.min(speed + EXTERNAL_CLOCK_SPEED_STEP)
    } else if speed != 1.0 {
        speed + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - speed) / (1.0 - speed).abs()
    } else {
        speed
    }
}

/// 音频不是主时钟时，通过增减采样数追赶主时钟
pub struct AudioDriftCorrector {
    diff_cum: f64,
    diff_avg_coef: f64,
    diff_avg_count: usize,
    /// 设备缓冲对应的秒数，平均差值小于它时不修正
    diff_threshold: f64,
}

impl AudioDriftCorrector {
    pub fn new(diff_threshold: f64) -> Self {
        Self {
            diff_cum: 0.0,
            diff_avg_coef: (0.01f64.ln() / AUDIO_DIFF_AVG_NB as f64).exp(),
            diff_avg_count: 0,
            diff_threshold,
        }
    }

    pub fn reset(&mut self) {
        self.diff_cum = 0.0;
        self.diff_avg_count = 0;
    }

    /// 返回修正后的期望采样数
    ///
    /// `diff` 是音频时钟减主时钟（NaN 表示未知）。
    pub fn wanted_samples(&mut self, nb_samples: usize, diff: f64, freq: u32) -> usize {
        if diff.is_nan() || diff.abs() >= AV_NOSYNC_THRESHOLD {
            // 差值过大，多半是刚 seek 过：重置滑动平均
            self.reset();
            return nb_samples;
        }

        self.diff_cum = diff + self.diff_avg_coef * self.diff_cum;
        if self.diff_avg_count < AUDIO_DIFF_AVG_NB {
            // 样本还不够
            self.diff_avg_count += 1;
            return nb_samples;
        }

        let avg_diff = self.diff_cum * (1.0 - self.diff_avg_coef);
        if avg_diff.abs() < self.diff_threshold {
            return nb_samples;
        }

        let wanted = nb_samples as i64 + (diff * freq as f64) as i64;
        let min = (nb_samples * (100 - SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        let max = (nb_samples * (100 + SAMPLE_CORRECTION_PERCENT_MAX) / 100) as i64;
        let wanted = wanted.clamp(min, max) as usize;
        trace!(
            "diff={} adiff={} sample_diff={} apts_threshold={}",
            diff,
            avg_diff,
            wanted as i64 - nb_samples as i64,
            self.diff_threshold
        );
        wanted
    }
}

/// 三个同步时钟
pub struct SyncClocks {
    pub audio: Clock,
    pub video: Clock,
    pub external: Clock,
}

impl SyncClocks {
    /// 音视频时钟分别绑定到各自包队列的 serial
    pub fn new(audio_serial: Arc<AtomicI32>, video_serial: Arc<AtomicI32>) -> Self {
        Self {
            audio: Clock::new(Some(audio_serial)),
            video: Clock::new(Some(video_serial)),
            external: Clock::new(None),
        }
    }

    pub fn master(&self, sync: SyncType) -> &Clock {
        match sync {
            SyncType::VideoMaster => &self.video,
            SyncType::AudioMaster => &self.audio,
            SyncType::ExternalClock => &self.external,
        }
    }

    pub fn master_at(&self, sync: SyncType, now: f64) -> f64 {
        self.master(sync).get_at(now)
    }

    /// 视频帧的目标显示延迟
    pub fn compute_target_delay_at(
        &self,
        sync: SyncType,
        delay: f64,
        max_frame_duration: f64,
        now: f64,
    ) -> f64 {
        if sync == SyncType::VideoMaster {
            return delay;
        }
        let diff = self.video.get_at(now) - self.master_at(sync, now);
        let delay_out = target_delay(delay, diff, max_frame_duration);
        trace!("video: delay={:0.3} A-V={}", delay_out, -diff);
        delay_out
    }

    /// 音频时钟减主时钟；音频是主时钟时返回 NaN
    pub fn audio_diff_at(&self, sync: SyncType, now: f64) -> f64 {
        if sync == SyncType::AudioMaster {
            return f64::NAN;
        }
        self.audio.get_at(now) - self.master_at(sync, now)
    }

    /// 调整外部时钟速度
    pub fn check_external_clock_speed_at(
        &self,
        video_packets: Option<usize>,
        audio_packets: Option<usize>,
        now: f64,
    ) {
        let speed = self.external.speed();
        let next = next_external_clock_speed(speed, video_packets, audio_packets);
        if next != speed {
            self.external.set_speed_at(next, now);
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.audio.set_paused(paused);
        self.video.set_paused(paused);
        self.external.set_paused(paused);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pts: f64, duration: f64, serial: i32) -> FrameMeta {
        FrameMeta {
            pts,
            duration,
            serial,
            ..FrameMeta::default()
        }
    }

    #[test]
    fn test_target_delay_never_negative() {
        assert_eq!(target_delay(0.04, -0.2, 3600.0), 0.0);
    }

    #[test]
    fn test_target_delay_grows_by_diff_above_dup_threshold() {
        assert!((target_delay(0.12, 0.2, 3600.0) - 0.32).abs() < 1e-12);
    }

    #[test]
    fn test_target_delay_doubles_short_frames() {
        assert!((target_delay(0.04, 0.05, 3600.0) - 0.08).abs() < 1e-12);
        // 阈值内不动
        assert_eq!(target_delay(0.04, 0.01, 3600.0), 0.04);
    }

    #[test]
    fn test_target_delay_ignores_discontinuity() {
        assert_eq!(target_delay(0.04, 12.0, 10.0), 0.04);
        assert_eq!(target_delay(0.04, f64::NAN, 10.0), 0.04);
    }

    #[test]
    fn test_master_fallback() {
        assert_eq!(resolve_master(SyncType::VideoMaster, false, true), SyncType::AudioMaster);
        assert_eq!(resolve_master(SyncType::VideoMaster, false, false), SyncType::ExternalClock);
        assert_eq!(resolve_master(SyncType::AudioMaster, true, false), SyncType::ExternalClock);
        assert_eq!(resolve_master(SyncType::AudioMaster, true, true), SyncType::AudioMaster);
        assert_eq!(resolve_master(SyncType::ExternalClock, true, true), SyncType::ExternalClock);
    }

    #[test]
    fn test_vp_duration() {
        assert!((vp_duration(&meta(1.0, 0.04, 1), &meta(1.05, 0.04, 1), 10.0) - 0.05).abs() < 1e-12);
        // 时间戳倒退时退回帧自身时长
        assert_eq!(vp_duration(&meta(1.0, 0.04, 1), &meta(0.5, 0.04, 1), 10.0), 0.04);
        assert_eq!(vp_duration(&meta(1.0, 0.04, 1), &meta(1.04, 0.04, 2), 10.0), 0.0);
    }

    #[test]
    fn test_audio_correction_waits_for_average_and_clamps() {
        let mut corrector = AudioDriftCorrector::new(0.05);
        for _ in 0..AUDIO_DIFF_AVG_NB {
            assert_eq!(corrector.wanted_samples(1000, 0.2, 48000), 1000);
        }
        // 平均值已足够，修正量被限制在 10%
        assert_eq!(corrector.wanted_samples(1000, 0.2, 48000), 1100);
        assert_eq!(corrector.wanted_samples(1000, -0.2, 48000), 900);
    }

    #[test]
    fn test_audio_correction_resets_on_discontinuity() {
        let mut corrector = AudioDriftCorrector::new(0.05);
        for _ in 0..=AUDIO_DIFF_AVG_NB {
            corrector.wanted_samples(1000, 0.2, 48000);
        }
        assert_eq!(corrector.wanted_samples(1000, 15.0, 48000), 1000);
        // 重新累积
        assert_eq!(corrector.wanted_samples(1000, 0.2, 48000), 1000);
    }

    #[test]
    fn test_external_clock_speed_steps() {
        let slower = next_external_clock_speed(1.0, Some(1), Some(50));
        assert!((slower - 0.999).abs() < 1e-12);
        let faster = next_external_clock_speed(1.0, Some(20), None);
        assert!((faster - 1.001).abs() < 1e-12);
        assert_eq!(next_external_clock_speed(1.010, Some(20), Some(20)), 1.010);
        assert_eq!(next_external_clock_speed(0.900, Some(0), Some(20)), 0.900);
        // 中间水位：向 1.0 回归
        let relaxed = next_external_clock_speed(0.95, Some(5), Some(5));
        assert!((relaxed - 0.951).abs() < 1e-12);
        assert_eq!(next_external_clock_speed(1.0, Some(5), Some(5)), 1.0);
    }

    #[test]
    fn test_compute_target_delay_uses_master_clock() {
        let audio_serial = Arc::new(AtomicI32::new(1));
        let video_serial = Arc::new(AtomicI32::new(1));
        let clocks = SyncClocks::new(audio_serial, video_serial);
        clocks.audio.set_at(10.0, 1, 0.0);
        clocks.video.set_at(9.8, 1, 0.0);
        let delay = clocks.compute_target_delay_at(SyncType::AudioMaster, 0.04, 10.0, 0.0);
        assert_eq!(delay, 0.0);
        // 视频为主时钟时不校正
        let delay = clocks.compute_target_delay_at(SyncType::VideoMaster, 0.04, 10.0, 0.0);
        assert_eq!(delay, 0.04);
    }
}
