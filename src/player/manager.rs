use crate::core::{
    wall_time, BufferStatus, Chapter, MediaInfo, MediaKind, MediaSource, PlaybackState,
    PlayerConfig, PlayerState, Result, SeekRequest, SDL_MIX_MAXVOLUME,
};
use crate::player::audio_output::{AudioBackend, CpalAudioBackend};
use crate::player::demuxer_factory::{FfmpegSourceFactory, SourceFactory};
use crate::player::demuxer_thread::{self, ReaderCommand};
use crate::player::log_ctx;
use crate::player::refresh::{next_show_mode, RefreshScheduler, REFRESH_RATE};
use crate::player::shared::{PlayerEvent, PlayerShared};
use crate::renderer::VideoRenderer;
use crossbeam_channel::{unbounded, Receiver, Sender};
use ffmpeg_next as ffmpeg;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::JoinHandle;

/// 码率未知时按字节 seek 的每秒字节数
const DEFAULT_BYTES_PER_SEC: f64 = 180_000.0;

/// 每次打开新会话时创建一个音频后端
pub type AudioBackendFactory = Arc<dyn Fn() -> Box<dyn AudioBackend> + Send + Sync>;

/// 按分贝步进调节音量
///
/// 换算回 0..=128 后如果没有变化，至少朝 `sign` 方向走一格。
pub fn next_volume(current: u8, sign: i32, step_db: f64) -> u8 {
    let max = SDL_MIX_MAXVOLUME as f64;
    let level = if current > 0 {
        20.0 * (current as f64 / max).log10()
    } else {
        -1000.0
    };
    let stepped = (max * 10f64.powf((level + sign as f64 * step_db) / 20.0)).round() as i64;
    let next = if stepped == current as i64 {
        current as i64 + sign as i64
    } else {
        stepped
    };
    next.clamp(0, SDL_MIX_MAXVOLUME as i64) as u8
}

/// 相对当前章节跳 `incr` 章，返回目标章节的起点（秒）
///
/// 早于第一章时视为在第 -1 章，越过最后一章时不跳。
pub fn chapter_seek_target(chapters: &[Chapter], position: f64, incr: i32) -> Option<f64> {
    let current = chapters
        .iter()
        .rposition(|chapter| chapter.start <= position)
        .map_or(-1, |i| i as i64);
    let target = (current + incr as i64).max(0) as usize;
    chapters.get(target).map(|chapter| chapter.start)
}

/// 一次打开的媒体
struct Session {
    shared: Arc<PlayerShared>,
    commands: Sender<ReaderCommand>,
    events: Receiver<PlayerEvent>,
    reader: Option<JoinHandle<()>>,
    scheduler: RefreshScheduler,
    /// 最近一次 seek 的目标（微秒或字节），时钟无效时作为当前位置
    last_seek_target: i64,
    ended: bool,
    exited: bool,
    error: Option<String>,
}

impl Session {
    fn send(&self, command: ReaderCommand) {
        if self.commands.send(command).is_err() {
            warn!("{} ⚠️ 读取线程已退出，忽略命令 {:?}", log_ctx(), command);
        }
        self.shared.continue_read.notify();
    }

    fn seek(&mut self, request: SeekRequest) {
        self.last_seek_target = request.target;
        self.send(ReaderCommand::Seek(request));
    }

    /// 主时钟位置（秒），时钟无效时退回到最近的 seek 目标
    fn position_at(&self, now: f64) -> f64 {
        let pos = self.shared.master_clock_at(now);
        if pos.is_nan() && !self.shared.seek_by_bytes() {
            self.last_seek_target as f64 / 1e6
        } else {
            pos
        }
    }
}

/// 播放管理器 - 整体控制播放流程
///
/// 持有当前会话，把 UI 的操作翻译成共享状态上的修改或发给读取线程的命令。
pub struct PlaybackManager {
    config: Arc<PlayerConfig>,
    sources: Arc<dyn SourceFactory>,
    audio_backends: AudioBackendFactory,
    session: Option<Session>,
    fullscreen: bool,
}

impl PlaybackManager {
    /// 使用 FFmpeg 解封装和 cpal 音频输出
    pub fn new(config: PlayerConfig) -> Result<Self> {
        ffmpeg::init()?;
        info!("{} 🎮 创建播放管理器...", log_ctx());
        Ok(Self::with_backends(
            config,
            Arc::new(FfmpegSourceFactory),
            Arc::new(|| Box::new(CpalAudioBackend) as Box<dyn AudioBackend>),
        ))
    }

    pub fn with_backends(
        config: PlayerConfig,
        sources: Arc<dyn SourceFactory>,
        audio_backends: AudioBackendFactory,
    ) -> Self {
        Self {
            config: Arc::new(config),
            sources,
            audio_backends,
            session: None,
            fullscreen: false,
        }
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// 打开媒体源，先关闭当前会话
    ///
    /// 数据源在读取线程中打开，结果通过 `StreamOpened` / `Error` 事件通知。
    pub fn open(&mut self, source: MediaSource) -> Result<()> {
        self.close();
        info!("{} 🎬 打开: {}", log_ctx(), source.locator());

        let (events_tx, events) = unbounded();
        let shared = Arc::new(PlayerShared::new(self.config.clone(), events_tx));
        let (commands, commands_rx) = unbounded();
        let reader = demuxer_thread::spawn(
            shared.clone(),
            self.sources.clone(),
            source,
            (self.audio_backends)(),
            commands_rx,
        )?;
        self.session = Some(Session {
            scheduler: RefreshScheduler::new(shared.clone()),
            shared,
            commands,
            events,
            reader: Some(reader),
            last_seek_target: 0,
            ended: false,
            exited: false,
            error: None,
        });
        Ok(())
    }

    pub fn open_url(&mut self, url: &str) -> Result<()> {
        self.open(MediaSource::from_url(url))
    }

    /// 停止读取线程并回收所有解码线程和音频设备
    pub fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        info!("{} ⏹️  停止播放", log_ctx());
        let _ = session.commands.send(ReaderCommand::Stop);
        session.shared.continue_read.notify();
        if let Some(reader) = session.reader.take() {
            if reader.join().is_err() {
                warn!("{} ⚠️ 读取线程异常退出", log_ctx());
            }
        }
        info!("{} ✅ 停止播放完成，所有线程已清理", log_ctx());
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn media_info(&self) -> Option<Arc<MediaInfo>> {
        self.session.as_ref()?.shared.media_info()
    }

    pub fn toggle_pause(&mut self) {
        if let Some(session) = &self.session {
            session.shared.toggle_pause_at(wall_time());
            session.shared.clear_step();
        }
    }

    /// 返回切换后是否静音
    pub fn toggle_mute(&mut self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |session| session.shared.toggle_mute())
    }

    pub fn update_volume(&mut self, sign: i32, step_db: f64) {
        if let Some(session) = &self.session {
            let shared = &session.shared;
            let volume = next_volume(shared.volume(), sign, step_db);
            shared.set_volume(volume);
            debug!("🔊 音量 {}/{}", volume, SDL_MIX_MAXVOLUME);
        }
    }

    pub fn step_to_next_frame(&mut self) {
        if let Some(session) = &self.session {
            session.shared.step_to_next_frame_at(wall_time());
        }
    }

    /// 跳到媒体时间线上的绝对位置（秒，从媒体起点算起）
    pub fn seek_to(&mut self, seconds: f64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let start = session
            .shared
            .media_info()
            .and_then(|info| info.start_time)
            .unwrap_or(0.0);
        info!("{} 🎯 Seek 到: {:.3} 秒", log_ctx(), seconds);
        session.seek(SeekRequest {
            target: ((seconds.max(0.0) + start) * 1e6) as i64,
            rel: 0,
            by_bytes: false,
        });
    }

    /// 相对当前位置前后跳 `incr` 秒
    ///
    /// 按字节 seek 时以最后显示的帧在文件中的位置为起点，按码率把秒数换算成字节。
    pub fn seek_relative(&mut self, incr: f64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let shared = session.shared.clone();
        let info = shared.media_info();

        let request = if shared.seek_by_bytes() {
            let mut pos = -1;
            if shared.video.is_open() {
                pos = shared.video.frames.last_position();
            }
            if pos < 0 && shared.audio.is_open() {
                pos = shared.audio.frames.last_position();
            }
            if pos < 0 {
                pos = shared.byte_position();
            }
            let bit_rate = info.as_ref().map_or(0, |info| info.bit_rate);
            let bytes = if bit_rate > 0 {
                incr * bit_rate as f64 / 8.0
            } else {
                incr * DEFAULT_BYTES_PER_SEC
            };
            SeekRequest {
                target: pos + bytes as i64,
                rel: bytes as i64,
                by_bytes: true,
            }
        } else {
            let mut pos = session.position_at(wall_time()) + incr;
            if let Some(start) = info.as_ref().and_then(|info| info.start_time) {
                if pos < start {
                    pos = start;
                }
            }
            SeekRequest {
                target: (pos * 1e6) as i64,
                rel: (incr * 1e6) as i64,
                by_bytes: false,
            }
        };
        info!(
            "{} ⏩ 相对 seek {:+.1} 秒 -> {} ({})",
            log_ctx(),
            incr,
            request.target,
            if request.by_bytes { "字节" } else { "微秒" }
        );
        session.seek(request);
    }

    pub fn seek_chapter(&mut self, incr: i32) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(info) = session.shared.media_info() else {
            return;
        };
        if info.chapters.is_empty() {
            return;
        }
        let position = session.position_at(wall_time());
        let Some(target) = chapter_seek_target(&info.chapters, position, incr) else {
            return;
        };
        info!("{} 📑 跳到章节起点 {:.3} 秒", log_ctx(), target);
        session.seek(SeekRequest {
            target: (target * 1e6) as i64,
            rel: 0,
            by_bytes: false,
        });
    }

    pub fn cycle_stream(&mut self, kind: MediaKind) {
        if let Some(session) = &self.session {
            session.send(ReaderCommand::CycleStream(kind));
        }
    }

    /// 在视频画面和音频波形之间切换
    pub fn toggle_display_mode(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let shared = &session.shared;
        let current = shared.show_mode();
        let next = next_show_mode(current, shared.video.is_open(), shared.audio.is_open());
        if next != current {
            info!("{} 🖼️ 显示模式 {:?} -> {:?}", log_ctx(), current, next);
            shared.set_show_mode(next);
            shared.request_refresh();
        }
    }

    pub fn toggle_fullscreen(&mut self, renderer: &mut dyn VideoRenderer) {
        self.fullscreen = !self.fullscreen;
        renderer.set_fullscreen(self.fullscreen);
        if let Some(session) = &self.session {
            session.shared.request_refresh();
        }
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    /// 驱动一次画面刷新，返回距离下次必须刷新的秒数
    pub fn refresh(&mut self, renderer: &mut dyn VideoRenderer) -> f64 {
        match self.session.as_mut() {
            Some(session) => session.scheduler.refresh(renderer),
            None => REFRESH_RATE,
        }
    }

    /// 取出一个会话事件
    pub fn poll_event(&mut self) -> Option<PlayerEvent> {
        let session = self.session.as_mut()?;
        let event = session.events.try_recv().ok()?;
        match &event {
            PlayerEvent::EndOfStream => session.ended = true,
            PlayerEvent::Error(message) => session.error = Some(message.clone()),
            PlayerEvent::Exited => session.exited = true,
            PlayerEvent::StreamOpened { .. } | PlayerEvent::StreamClosed { .. } => {}
        }
        Some(event)
    }

    pub fn status(&self) -> PlayerState {
        let Some(session) = &self.session else {
            return PlayerState {
                volume: self.config.startup_volume_level(),
                ..PlayerState::default()
            };
        };
        let shared = &session.shared;
        let info = shared.media_info();
        let state = if session.error.is_some() {
            PlaybackState::Error
        } else if info.is_none() {
            PlaybackState::Opening
        } else if session.exited || session.ended {
            PlaybackState::Stopped
        } else if shared.is_paused() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        };

        let position = session.position_at(wall_time());
        let (frame_drops_early, frame_drops_late) = shared.frame_drops();
        PlayerState {
            state,
            position: if position.is_nan() { 0.0 } else { position },
            duration: info.and_then(|info| info.duration),
            volume: shared.volume(),
            muted: shared.is_muted(),
            frame_drops_early,
            frame_drops_late,
            buffer: BufferStatus {
                video_packets: shared.video.packets.nb_packets(),
                audio_packets: shared.audio.packets.nb_packets(),
                subtitle_packets: shared.subtitle.packets.nb_packets(),
                video_frames: shared.video.frames.remaining(),
                audio_frames: shared.audio.frames.remaining(),
                queued_bytes: shared.slots().iter().map(|slot| slot.packets.size()).sum(),
            },
        }
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        self.close();
    }
}
