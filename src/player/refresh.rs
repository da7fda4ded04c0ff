use crate::core::{sync_clock_to_slave_at, wall_time, FramePayload, MediaKind, ShowMode, SyncType};
use crate::player::frame_queue::{Frame, FrameMeta};
use crate::player::shared::PlayerShared;
use crate::player::sync::{vp_duration, AV_SYNC_THRESHOLD_MAX};
use crate::renderer::{calculate_display_rect, VideoRenderer};
use log::{debug, warn};
use std::sync::Arc;

/// 默认轮询间隔（秒）
pub const REFRESH_RATE: f64 = 0.01;

/// 状态行的最小输出间隔（秒）
const STATUS_INTERVAL: f64 = 1.0;

/// 在显示模式之间轮换，跳过没有对应流的模式
pub fn next_show_mode(current: ShowMode, has_video: bool, has_audio: bool) -> ShowMode {
    const CYCLE: [ShowMode; 2] = [ShowMode::Video, ShowMode::Waves];
    let usable = |mode: ShowMode| match mode {
        ShowMode::Video => has_video,
        _ => has_audio,
    };
    let start = CYCLE.iter().position(|m| *m == current).unwrap_or(CYCLE.len() - 1);
    (1..=CYCLE.len())
        .map(|step| CYCLE[(start + step) % CYCLE.len()])
        .find(|mode| usable(*mode))
        .unwrap_or(current)
}

/// 视频刷新调度
///
/// 运行在 UI 线程，每次调用返回距离下次必须刷新的秒数。
pub struct RefreshScheduler {
    shared: Arc<PlayerShared>,
    last_vis_time: f64,
    last_status_time: f64,
    last_waveform: Vec<Vec<f32>>,
    /// 已交给渲染器的字幕 (serial, pts)；外层 None 表示还没有同步过
    subtitle_shown: Option<Option<(i32, f64)>>,
}

impl RefreshScheduler {
    pub fn new(shared: Arc<PlayerShared>) -> Self {
        Self {
            shared,
            last_vis_time: 0.0,
            last_status_time: 0.0,
            last_waveform: Vec::new(),
            subtitle_shown: None,
        }
    }

    pub fn refresh(&mut self, renderer: &mut dyn VideoRenderer) -> f64 {
        self.refresh_at(renderer, wall_time())
    }

    pub fn refresh_at(&mut self, renderer: &mut dyn VideoRenderer, now: f64) -> f64 {
        let mut remaining = REFRESH_RATE;
        let shared = self.shared.clone();
        if shared.show_mode() != ShowMode::None
            && (!shared.is_paused() || shared.is_refresh_forced())
        {
            self.video_refresh_at(renderer, now, &mut remaining);
        }
        remaining
    }

    fn video_refresh_at(&mut self, renderer: &mut dyn VideoRenderer, now: f64, remaining: &mut f64) {
        let shared = self.shared.clone();
        let video = &shared.video;

        if !shared.is_paused()
            && shared.master_sync_type() == SyncType::ExternalClock
            && shared.is_realtime()
        {
            let packets = |kind: MediaKind| {
                let slot = shared.slot(kind);
                slot.is_open().then(|| slot.packets.nb_packets())
            };
            shared.clocks.check_external_clock_speed_at(
                packets(MediaKind::Video),
                packets(MediaKind::Audio),
                now,
            );
        }

        if shared.show_mode() != ShowMode::Video && shared.audio.is_open() {
            let rdftspeed = shared.config.rdftspeed;
            if shared.is_refresh_forced() || self.last_vis_time + rdftspeed < now {
                self.display(renderer, now);
                self.last_vis_time = now;
            }
            *remaining = remaining.min(self.last_vis_time + rdftspeed - now);
        }

        if video.is_open() {
            self.advance_video(now, remaining);
            if shared.is_refresh_forced()
                && shared.show_mode() == ShowMode::Video
                && video.frames.rindex_shown()
            {
                self.display(renderer, now);
            }
        }
        shared.clear_refresh();
        self.log_status(now);
    }

    /// 按主时钟决定是否切到下一帧
    fn advance_video(&mut self, now: f64, remaining: &mut f64) {
        let shared = self.shared.clone();
        let frames = &shared.video.frames;
        let serial = shared.video.packets.serial();
        let max_frame_duration = shared.max_frame_duration();

        loop {
            if frames.remaining() == 0 {
                // 队列里没有可显示的画面
                return;
            }
            let last = frames.peek_last_shown();
            let current = frames.peek_current();

            if current.serial != serial {
                frames.advance();
                continue;
            }
            if last.serial != current.serial {
                shared.frame_timer.store(now);
            }
            if shared.is_paused() {
                return;
            }

            let last_duration = vp_duration(&last, &current, max_frame_duration);
            let delay = shared.clocks.compute_target_delay_at(
                shared.master_sync_type(),
                last_duration,
                max_frame_duration,
                now,
            );

            let mut frame_timer = shared.frame_timer.load();
            if now < frame_timer + delay {
                *remaining = remaining.min(frame_timer + delay - now);
                return;
            }

            frame_timer += delay;
            if delay > 0.0 && now - frame_timer > AV_SYNC_THRESHOLD_MAX {
                frame_timer = now;
            }
            shared.frame_timer.store(frame_timer);

            if !current.pts.is_nan() {
                let clocks = &shared.clocks;
                clocks.video.set_at(current.pts, current.serial, now);
                sync_clock_to_slave_at(&clocks.external, &clocks.video, now);
            }

            if frames.remaining() > 1 {
                let next = frames.peek_next();
                let duration = vp_duration(&current, &next, max_frame_duration);
                if !shared.is_stepping()
                    && shared.framedrop_enabled()
                    && now > frame_timer + duration
                {
                    shared.record_late_drop();
                    frames.advance();
                    continue;
                }
            }

            if shared.subtitle.is_open() {
                self.retire_subtitles();
            }

            frames.advance();
            shared.request_refresh();

            if shared.is_stepping() && !shared.is_paused() {
                shared.toggle_pause_at(now);
            }
            return;
        }
    }

    /// 可见字幕变化时通知渲染器；位图画布未知时按画面大小
    fn sync_subtitle(&mut self, renderer: &mut dyn VideoRenderer, picture: &FrameMeta) {
        let subs = &self.shared.subtitle;
        let mut visible = None;
        if subs.is_open() && subs.frames.remaining() > 0 {
            visible = subs.frames.with_current(|sp| match &sp.payload {
                FramePayload::Subtitle(s) if picture.pts >= sp.meta.pts + s.start_display => {
                    Some((sp.meta.serial, sp.meta.pts))
                }
                _ => None,
            });
        }
        if self.subtitle_shown == Some(visible) {
            return;
        }
        self.subtitle_shown = Some(visible);
        if visible.is_none() {
            renderer.set_subtitle(None);
            return;
        }
        subs.frames.with_current(|sp| {
            if let FramePayload::Subtitle(s) = &sp.payload {
                if s.canvas == (0, 0) && !s.bitmaps.is_empty() {
                    let mut overlay = s.clone();
                    overlay.canvas = (picture.width, picture.height);
                    renderer.set_subtitle(Some(&overlay));
                } else {
                    renderer.set_subtitle(Some(s));
                }
            }
        });
    }

    /// 丢弃已经过期的字幕
    fn retire_subtitles(&self) {
        let shared = &self.shared;
        let frames = &shared.subtitle.frames;
        let serial = shared.subtitle.packets.serial();
        let video_pts = shared.clocks.video.pts();

        while frames.remaining() > 0 {
            let (current, _, end) = frames.with_current(subtitle_window);
            let next_start = if frames.remaining() > 1 {
                let (next, start, _) = frames.with_next(subtitle_window);
                Some(next.pts + start)
            } else {
                None
            };

            let expired = current.serial != serial
                || video_pts > current.pts + end
                || next_start.map_or(false, |start| video_pts > start);
            if !expired {
                break;
            }
            frames.advance();
        }
    }

    fn display(&mut self, renderer: &mut dyn VideoRenderer, now: f64) {
        let shared = self.shared.clone();
        let result = if shared.audio.is_open() && shared.show_mode() != ShowMode::Video {
            self.display_waveform(renderer, now)
        } else if shared.video.is_open() {
            self.display_picture(renderer)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            warn!("显示失败: {}", e);
        }
    }

    fn display_picture(&mut self, renderer: &mut dyn VideoRenderer) -> crate::core::Result<()> {
        let shared = self.shared.clone();
        let frames = &shared.video.frames;
        let picture = frames.peek_last_shown();
        self.sync_subtitle(renderer, &picture);

        if !picture.uploaded {
            frames.with_last_shown(|frame| -> crate::core::Result<()> {
                if let FramePayload::Picture(p) = &frame.payload {
                    renderer.upload_picture(p)?;
                    frame.meta.uploaded = true;
                }
                Ok(())
            })?;
        }

        let (width, height) = renderer.viewport();
        let rect = calculate_display_rect(width, height, picture.width, picture.height, picture.sar);
        renderer.present(rect)
    }

    fn display_waveform(&mut self, renderer: &mut dyn VideoRenderer, now: f64) -> crate::core::Result<()> {
        let shared = &self.shared;
        if !shared.is_paused() || self.last_waveform.is_empty() {
            let freq = shared.audio_target.load().map_or(0, |p| p.freq) as f64;
            let width = renderer.viewport().0.max(1) as i64;
            let ring = shared.samples.lock();
            // 找到正在播放的那一段采样
            let mut delay = ring.pending_frames as i64;
            if ring.last_write_time > 0.0 {
                delay -= ((now - ring.last_write_time) * freq) as i64;
            }
            delay += 2 * width;
            if delay < width {
                delay = width;
            }
            self.last_waveform = ring.window(delay as usize, width as usize);
        }
        renderer.present_waveform(&self.last_waveform)
    }

    /// 每秒最多一次的状态行
    fn log_status(&mut self, now: f64) {
        if now - self.last_status_time < STATUS_INTERVAL {
            return;
        }
        self.last_status_time = now;
        let shared = &self.shared;
        let clocks = &shared.clocks;
        let master = shared.master_clock_at(now);
        let (label, diff) = match (shared.audio.is_open(), shared.video.is_open()) {
            (true, true) => ("A-V", clocks.audio.get_at(now) - clocks.video.get_at(now)),
            (false, true) => ("M-V", master - clocks.video.get_at(now)),
            (true, false) => ("M-A", master - clocks.audio.get_at(now)),
            (false, false) => ("   ", 0.0),
        };
        let (early, late) = shared.frame_drops();
        debug!(
            "{:7.2} {}:{:7.3} fd={:4} aq={:5}KB vq={:5}KB sq={:5}B",
            master,
            label,
            diff,
            early + late,
            shared.audio.packets.size() / 1024,
            shared.video.packets.size() / 1024,
            shared.subtitle.packets.size()
        );
    }
}

/// 字幕帧的 (元数据, 开始偏移, 结束偏移)
fn subtitle_window(frame: &mut Frame) -> (FrameMeta, f64, f64) {
    match &frame.payload {
        FramePayload::Subtitle(s) => (frame.meta, s.start_display, s.end_display),
        _ => (frame.meta, 0.0, 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        AudioParams, PixelFormat, PlayerConfig, Rational, SampleFormat, SubtitleBitmap,
        SubtitleFrame, VideoFrame,
    };
    use crate::player::frame_queue::FrameQueue;
    use crate::player::testing::RecordingRenderer;
    use crossbeam_channel::unbounded;

    fn shared_with(config: PlayerConfig) -> Arc<PlayerShared> {
        let (tx, _rx) = unbounded();
        let shared = Arc::new(PlayerShared::new(Arc::new(config), tx));
        shared.video.packets.start();
        shared.video.mark_open(0, false);
        shared
    }

    fn has_room(frames: &FrameQueue) -> bool {
        frames.remaining_count() < frames.capacity()
    }

    fn push_picture(frames: &FrameQueue, pts: f64, serial: i32) {
        let mut slot = frames.acquire_writable().expect("queue aborted");
        slot.meta = FrameMeta {
            serial,
            pts,
            duration: 0.04,
            width: 2,
            height: 2,
            sar: Rational::new(1, 1),
            ..FrameMeta::default()
        };
        slot.payload = FramePayload::Picture(VideoFrame {
            width: 2,
            height: 2,
            format: Some(PixelFormat::RGBA),
            data: vec![0; 16],
        });
        frames.publish(slot);
    }

    #[test]
    fn test_show_mode_cycle() {
        assert_eq!(next_show_mode(ShowMode::Video, true, true), ShowMode::Waves);
        assert_eq!(next_show_mode(ShowMode::Waves, true, true), ShowMode::Video);
        assert_eq!(next_show_mode(ShowMode::Video, true, false), ShowMode::Video);
        assert_eq!(next_show_mode(ShowMode::Waves, false, true), ShowMode::Waves);
    }

    #[test]
    fn test_audio_master_steady_state() {
        let shared = shared_with(PlayerConfig::default());
        shared.audio.packets.start();
        shared.audio.mark_open(1, false);
        let video_serial = shared.video.packets.serial();
        let audio_serial = shared.audio.packets.serial();
        let frames = &shared.video.frames;

        let mut scheduler = RefreshScheduler::new(shared.clone());
        let mut renderer = RecordingRenderer::default();
        let mut next_pts = 0.0;
        let mut now = 0.0;
        while now < 2.0 {
            // 音频时钟随墙上时间前进
            shared.clocks.audio.set_at(now, audio_serial, now);
            while has_room(frames) {
                push_picture(frames, next_pts, video_serial);
                next_pts += 0.04;
            }

            let remaining = scheduler.refresh_at(&mut renderer, now);
            assert!(remaining <= REFRESH_RATE + 1e-12);

            if now > 0.5 {
                let diff = shared.clocks.video.get_at(now) - shared.clocks.audio.get_at(now);
                assert!(diff.abs() < 0.1, "t={:.3} A-V={:.3}", now, diff);
            }
            now += 0.005;
        }
        assert!(renderer.presented.len() > 40);
        assert!(!renderer.uploads.is_empty());
    }

    #[test]
    fn test_stale_serial_frames_are_skipped() {
        let shared = shared_with(PlayerConfig {
            av_sync_type: SyncType::VideoMaster,
            ..PlayerConfig::default()
        });
        let frames = &shared.video.frames;
        push_picture(frames, 7.0, shared.video.packets.serial());
        shared.video.packets.put_flush_marker().unwrap();
        let serial = shared.video.packets.serial();
        push_picture(frames, 1.0, serial);

        let mut scheduler = RefreshScheduler::new(shared.clone());
        let mut renderer = RecordingRenderer::default();
        for step in 0..20 {
            scheduler.refresh_at(&mut renderer, step as f64 * 0.01);
        }
        assert_eq!(shared.clocks.video.pts(), 1.0);
        assert_eq!(shared.clocks.video.serial(), serial);
    }

    #[test]
    fn test_frame_step_pauses_again() {
        let shared = shared_with(PlayerConfig {
            av_sync_type: SyncType::VideoMaster,
            ..PlayerConfig::default()
        });
        let serial = shared.video.packets.serial();
        push_picture(&shared.video.frames, 0.0, serial);
        push_picture(&shared.video.frames, 0.04, serial);

        shared.toggle_pause_at(0.0);
        shared.step_to_next_frame_at(0.0);
        assert!(!shared.is_paused());

        let mut scheduler = RefreshScheduler::new(shared.clone());
        let mut renderer = RecordingRenderer::default();
        let mut now = 0.0;
        while !shared.is_paused() && now < 1.0 {
            scheduler.refresh_at(&mut renderer, now);
            now += 0.01;
        }
        assert!(shared.is_paused());
        assert_eq!(renderer.presented.len(), 1);
    }

    #[test]
    fn test_bitmap_subtitle_sent_once_with_picture_canvas() {
        let shared = shared_with(PlayerConfig {
            av_sync_type: SyncType::VideoMaster,
            ..PlayerConfig::default()
        });
        shared.subtitle.packets.start();
        shared.subtitle.mark_open(2, false);
        push_picture(&shared.video.frames, 1.0, shared.video.packets.serial());

        let subs = &shared.subtitle.frames;
        let mut slot = subs.acquire_writable().unwrap();
        slot.meta = FrameMeta {
            serial: shared.subtitle.packets.serial(),
            pts: 0.5,
            ..FrameMeta::default()
        };
        slot.payload = FramePayload::Subtitle(SubtitleFrame {
            start_display: 0.0,
            end_display: 10.0,
            bitmaps: vec![SubtitleBitmap {
                x: 0,
                y: 1,
                width: 2,
                height: 1,
                data: vec![255; 8],
            }],
            ..SubtitleFrame::default()
        });
        subs.publish(slot);

        let mut scheduler = RefreshScheduler::new(shared.clone());
        let mut renderer = RecordingRenderer::default();
        for step in 0..20 {
            shared.request_refresh();
            scheduler.refresh_at(&mut renderer, step as f64 * 0.01);
        }
        assert!(renderer.presented.len() > 1);
        assert_eq!(renderer.subtitle_updates, 1);
        assert_eq!(renderer.subtitle_bitmaps, 1);
        // 画布未知时沿用视频画面大小
        assert_eq!(renderer.subtitle_canvas, (2, 2));
    }

    #[test]
    fn test_expired_subtitles_retired() {
        let shared = shared_with(PlayerConfig::default());
        shared.subtitle.packets.start();
        shared.subtitle.mark_open(2, false);
        let subs = &shared.subtitle.frames;
        let serial = shared.subtitle.packets.serial();
        for (pts, end) in [(0.0, 1.0), (5.0, 1.0)] {
            let mut slot = subs.acquire_writable().unwrap();
            slot.meta = FrameMeta {
                serial,
                pts,
                ..FrameMeta::default()
            };
            slot.payload = FramePayload::Subtitle(SubtitleFrame {
                text: format!("at {}", pts),
                start_display: 0.0,
                end_display: end,
                ..SubtitleFrame::default()
            });
            subs.publish(slot);
        }

        shared
            .clocks
            .video
            .set_at(2.0, shared.video.packets.serial(), 0.0);
        let scheduler = RefreshScheduler::new(shared.clone());
        scheduler.retire_subtitles();
        assert_eq!(subs.remaining(), 1);
        assert_eq!(subs.peek_current().pts, 5.0);
    }

    #[test]
    fn test_waveform_refresh_rate_capped() {
        let shared = shared_with(PlayerConfig {
            show_mode: ShowMode::Waves,
            ..PlayerConfig::default()
        });
        shared.audio.packets.start();
        shared.audio.mark_open(1, false);
        shared
            .audio_target
            .store(Some(AudioParams::new(48000, 2, SampleFormat::F32)));

        let mut scheduler = RefreshScheduler::new(shared.clone());
        let mut renderer = RecordingRenderer::default();
        scheduler.refresh_at(&mut renderer, 1.0);
        let remaining = scheduler.refresh_at(&mut renderer, 1.005);
        assert_eq!(renderer.waveforms, 1);
        assert!(remaining <= shared.config.rdftspeed);
        scheduler.refresh_at(&mut renderer, 1.05);
        assert_eq!(renderer.waveforms, 2);
    }
}
