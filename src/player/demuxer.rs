use crate::core::{
    AudioParams, Chapter, MediaInfo, MediaKind, MediaSource, PlayerError, Rational, Result,
    SeekRequest, StreamInfo,
};
use crate::player::codec::DecodeBackend;
use crate::player::demuxer_source::{DemuxerSource, MediaPacket};
use crate::player::ffmpeg_codec::{FfmpegAudioBackend, FfmpegSubtitleBackend, FfmpegVideoBackend};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::{format, media};
use log::{debug, info, warn};
use std::ptr;

/// 检查容器格式标志位
fn has_flag(flags: i32, flag: u32) -> bool {
    (flags as i64) & (flag as i64) != 0
}

fn to_rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn media_type(kind: MediaKind) -> ffi::AVMediaType {
    match kind {
        MediaKind::Video => ffi::AVMediaType::AVMEDIA_TYPE_VIDEO,
        MediaKind::Audio => ffi::AVMediaType::AVMEDIA_TYPE_AUDIO,
        MediaKind::Subtitle => ffi::AVMediaType::AVMEDIA_TYPE_SUBTITLE,
    }
}

/// 把显示矩阵的逆时针角度换算成顺时针，归一到 [0, 360)
pub fn normalize_rotation(counter_clockwise: f64) -> f64 {
    let theta = -counter_clockwise;
    let theta = theta - 360.0 * (theta / 360.0 + 0.9 / 360.0).floor();
    if theta.abs() < 1e-9 {
        0.0
    } else {
        theta
    }
}

/// 基于 FFmpeg 的解封装器
pub struct FfmpegDemuxer {
    input_ctx: format::context::Input,
    media_info: MediaInfo,
    source_path: String,
}

// AVFormatContext 只在读取线程里使用
unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    /// 打开媒体源
    pub fn open(source: &MediaSource) -> Result<Self> {
        let path = source.locator();
        info!("正在打开: {}", path);

        let mut options = ffmpeg::Dictionary::new();
        // MPEG-TS 中扫描全部 PMT，避免漏掉后出现的节目
        options.set("scan_all_pmts", "1");

        if let MediaSource::NetworkStream { protocol, .. } = source {
            info!("🌐 检测到网络流 ({})，应用网络选项", protocol.as_str());

            // discardcorrupt: 丢弃损坏的帧
            options.set("fflags", "+discardcorrupt");
            options.set("analyzeduration", "5000000");
            options.set("probesize", "10000000");

            // 网络超时设置
            options.set("timeout", "15000000");
            options.set("rw_timeout", "8000000");
            options.set("buffer_size", "8388608");

            options.set("reconnect", "1");
            options.set("reconnect_streamed", "1");
            options.set("reconnect_delay_max", "4");

            if path.contains(".m3u8") {
                info!("🎬 HLS 流检测，应用 HLS 选项");
                options.set("live_start_index", "-1");
                options.set("max_reload", "10");
                options.set("http_persistent", "1");
            }
        }

        let input_ctx = format::input_with_dictionary(&path, options)
            .map_err(|e| PlayerError::OpenError(format!("{}: {}", path, e)))?;

        let mut demuxer = Self {
            input_ctx,
            media_info: MediaInfo::default(),
            source_path: path,
        };
        demuxer.media_info = demuxer.extract_media_info(source);

        info!(
            "📦 容器: {}, 时长: {:?} 秒, {} 条流, {} 个章节",
            demuxer.media_info.format_name,
            demuxer.media_info.duration,
            demuxer.media_info.streams.len(),
            demuxer.media_info.chapters.len()
        );
        Ok(demuxer)
    }

    fn format_flags(&self) -> i32 {
        unsafe { (*(*self.input_ctx.as_ptr()).iformat).flags }
    }

    /// 提取媒体信息（内部使用）
    fn extract_media_info(&self, source: &MediaSource) -> MediaInfo {
        let format_name = self.input_ctx.format().name().to_string();
        let flags = self.format_flags();

        let duration = self.input_ctx.duration();
        let duration = (duration != ffi::AV_NOPTS_VALUE && duration > 0)
            .then(|| duration as f64 / ffi::AV_TIME_BASE as f64);
        let start_time = unsafe { (*self.input_ctx.as_ptr()).start_time };
        let start_time = (start_time != ffi::AV_NOPTS_VALUE)
            .then(|| start_time as f64 / ffi::AV_TIME_BASE as f64);

        let streams = self
            .input_ctx
            .streams()
            .filter_map(|stream| self.stream_info(&stream))
            .collect::<Vec<_>>();

        let chapters = self
            .input_ctx
            .chapters()
            .map(|chapter| {
                let tb = to_rational(chapter.time_base()).to_f64();
                Chapter {
                    start: chapter.start() as f64 * tb,
                    end: chapter.end() as f64 * tb,
                }
            })
            .collect();

        let realtime = source.is_realtime()
            || matches!(format_name.as_str(), "rtp" | "rtsp" | "sdp")
            || self.source_path.starts_with("rtp:")
            || self.source_path.starts_with("udp:");

        let ts_discontinuous = has_flag(flags, ffi::AVFMT_TS_DISCONT);
        let prefers_byte_seek = !has_flag(flags, ffi::AVFMT_NO_BYTE_SEEK)
            && ts_discontinuous
            && format_name != "ogg";

        MediaInfo {
            url: self.source_path.clone(),
            format_name,
            duration,
            start_time,
            bit_rate: self.input_ctx.bit_rate(),
            streams,
            chapters,
            realtime,
            ts_discontinuous,
            prefers_byte_seek,
        }
    }

    fn stream_info(&self, stream: &format::stream::Stream) -> Option<StreamInfo> {
        let params = stream.parameters();
        let kind = match params.medium() {
            media::Type::Video => MediaKind::Video,
            media::Type::Audio => MediaKind::Audio,
            media::Type::Subtitle => MediaKind::Subtitle,
            _ => return None,
        };
        let (width, height, sample_rate, channels) = unsafe {
            let par = &*params.as_ptr();
            (
                par.width.max(0) as u32,
                par.height.max(0) as u32,
                par.sample_rate.max(0) as u32,
                par.ch_layout.nb_channels.max(0) as u16,
            )
        };
        let start_time = stream.start_time();

        let frame_rate = if kind == MediaKind::Video {
            let rate = unsafe {
                ffi::av_guess_frame_rate(
                    self.input_ctx.as_ptr() as *mut _,
                    stream.as_ptr() as *mut _,
                    ptr::null_mut(),
                )
            };
            (rate.num > 0 && rate.den > 0).then(|| Rational::new(rate.num, rate.den))
        } else {
            None
        };

        let mut rotation = 0.0;
        for side_data in stream.side_data() {
            if side_data.kind() == ffmpeg::codec::packet::side_data::Type::DisplayMatrix
                && side_data.data().len() >= 9 * std::mem::size_of::<i32>()
            {
                let angle = unsafe {
                    ffi::av_display_rotation_get(side_data.data().as_ptr() as *const i32)
                };
                if angle.is_finite() {
                    rotation = normalize_rotation(angle);
                }
            }
        }

        let info = StreamInfo {
            index: stream.index(),
            kind,
            time_base: to_rational(stream.time_base()),
            start_time: (start_time != ffi::AV_NOPTS_VALUE).then_some(start_time),
            codec_name: params.id().name().to_string(),
            language: stream.metadata().get("language").map(str::to_owned),
            attached_pic: stream
                .disposition()
                .contains(format::stream::Disposition::ATTACHED_PIC),
            width,
            height,
            sample_rate,
            channels,
            frame_rate,
            rotation,
        };
        debug!(
            "流 #{} {}: {} {}x{} {}Hz/{}ch 旋转 {}°",
            info.index,
            kind.as_str(),
            info.codec_name,
            info.width,
            info.height,
            info.sample_rate,
            info.channels,
            info.rotation
        );
        Some(info)
    }

    /// AVIOContext 记录的错误码，0 表示没有出错
    fn io_error(&self) -> i32 {
        unsafe {
            let pb = (*self.input_ctx.as_ptr()).pb;
            if pb.is_null() {
                0
            } else {
                (*pb).error
            }
        }
    }

    fn eof_reached(&self) -> bool {
        unsafe {
            let pb = (*self.input_ctx.as_ptr()).pb;
            !pb.is_null() && (*pb).eof_reached != 0
        }
    }
}

impl DemuxerSource for FfmpegDemuxer {
    fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input_ctx) {
            Ok(()) => {}
            Err(e) => {
                let code = self.io_error();
                if code != 0 {
                    return Err(PlayerError::SourceIoError(format!(
                        "{} ({})",
                        ffmpeg::Error::from(code),
                        e
                    )));
                }
                if e == ffmpeg::Error::Eof || self.eof_reached() {
                    return Ok(None);
                }
                return Err(e.into());
            }
        }
        Ok(Some(MediaPacket {
            stream_index: packet.stream(),
            data: packet.data().map(|d| d.to_vec()).unwrap_or_default(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            pos: packet.position() as i64,
            key: packet.is_key(),
        }))
    }

    fn seek(&mut self, request: &SeekRequest) -> Result<()> {
        let (min, max) = request.bounds();
        let flags = if request.by_bytes {
            ffi::AVSEEK_FLAG_BYTE as i32
        } else {
            0
        };
        let ret = unsafe {
            ffi::avformat_seek_file(
                self.input_ctx.as_mut_ptr(),
                -1,
                min,
                request.target,
                max,
                flags,
            )
        };
        if ret < 0 {
            return Err(ffmpeg::Error::from(ret).into());
        }
        // seek 后清除 EOF 标志，允许继续读取
        unsafe {
            let pb = (*self.input_ctx.as_ptr()).pb;
            if !pb.is_null() {
                (*pb).eof_reached = 0;
            }
        }
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) -> bool {
        let ret = unsafe {
            if paused {
                ffi::av_read_pause(self.input_ctx.as_mut_ptr())
            } else {
                ffi::av_read_play(self.input_ctx.as_mut_ptr())
            }
        };
        ret >= 0
    }

    fn best_stream(
        &self,
        kind: MediaKind,
        wanted: Option<usize>,
        related: Option<usize>,
    ) -> Option<usize> {
        let ret = unsafe {
            ffi::av_find_best_stream(
                self.input_ctx.as_ptr() as *mut _,
                media_type(kind),
                wanted.map(|i| i as i32).unwrap_or(-1),
                related.map(|i| i as i32).unwrap_or(-1),
                ptr::null_mut(),
                0,
            )
        };
        (ret >= 0).then_some(ret as usize)
    }

    fn attached_picture(&self, stream_index: usize) -> Option<MediaPacket> {
        let stream = self.input_ctx.stream(stream_index)?;
        let pkt = unsafe { &(*stream.as_ptr()).attached_pic };
        if pkt.data.is_null() || pkt.size <= 0 {
            return None;
        }
        let data = unsafe { std::slice::from_raw_parts(pkt.data, pkt.size as usize) }.to_vec();
        Some(MediaPacket {
            stream_index,
            data,
            pts: (pkt.pts != ffi::AV_NOPTS_VALUE).then_some(pkt.pts),
            dts: (pkt.dts != ffi::AV_NOPTS_VALUE).then_some(pkt.dts),
            duration: pkt.duration,
            pos: pkt.pos,
            key: true,
        })
    }

    fn open_decoder(
        &self,
        stream_index: usize,
        audio_target: Option<AudioParams>,
    ) -> Result<Box<dyn DecodeBackend>> {
        let stream = self
            .input_ctx
            .stream(stream_index)
            .ok_or_else(|| PlayerError::Other(format!("流 #{} 不存在", stream_index)))?;
        let kind = self
            .media_info
            .stream(stream_index)
            .map(|s| s.kind)
            .ok_or_else(|| PlayerError::Other(format!("流 #{} 类型不支持", stream_index)))?;

        let backend: Box<dyn DecodeBackend> = match kind {
            MediaKind::Video => Box::new(FfmpegVideoBackend::from_stream(&stream)?),
            MediaKind::Audio => {
                let target = audio_target.ok_or_else(|| PlayerError::StreamOpenError {
                    kind: kind.as_str(),
                    index: stream_index,
                    reason: "音频设备参数未知".to_string(),
                })?;
                Box::new(FfmpegAudioBackend::from_stream(&stream, target)?)
            }
            MediaKind::Subtitle => Box::new(FfmpegSubtitleBackend::from_stream(&stream)?),
        };
        Ok(backend)
    }

    fn byte_position(&self) -> i64 {
        unsafe {
            let pb = (*self.input_ctx.as_ptr()).pb;
            if pb.is_null() {
                return -1;
            }
            let buffered = (*pb).buf_end.offset_from((*pb).buf_ptr) as i64;
            (*pb).pos - buffered
        }
    }

    fn is_seekable(&self) -> bool {
        let flags = self.format_flags();
        let no_search = has_flag(flags, ffi::AVFMT_NOBINSEARCH)
            || has_flag(flags, ffi::AVFMT_NOGENSEARCH)
            || has_flag(flags, ffi::AVFMT_NO_BYTE_SEEK);
        let has_read_seek = unsafe { (*(*self.input_ctx.as_ptr()).iformat).read_seek.is_some() };
        if no_search && !has_read_seek {
            warn!("容器 {} 不支持 seek", self.media_info.format_name);
            return false;
        }
        true
    }

    fn description(&self) -> String {
        format!("FfmpegDemuxer({})", self.source_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_normalization() {
        // 显示矩阵给出逆时针角度
        assert_eq!(normalize_rotation(-90.0), 90.0);
        assert_eq!(normalize_rotation(90.0), 270.0);
        assert_eq!(normalize_rotation(180.0), 180.0);
        assert_eq!(normalize_rotation(0.0), 0.0);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let source = MediaSource::from_url("/nonexistent/definitely_missing.mkv");
        match FfmpegDemuxer::open(&source) {
            Err(PlayerError::OpenError(msg)) => assert!(msg.contains("definitely_missing")),
            Err(other) => panic!("意外的错误类型: {}", other),
            Ok(_) => panic!("不应该打开成功"),
        }
    }
}
