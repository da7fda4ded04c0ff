use crate::core::{
    AudioFrame, AudioParams, FramePayload, PixelFormat, Rational, Result, SampleFormat,
    SubtitleBitmap, SubtitleFrame, VideoFrame, TIME_BASE_Q,
};
use crate::player::codec::{DecodeBackend, DecodedFrame, ReceiveStatus, SendStatus};
use crate::player::demuxer_source::MediaPacket;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi::AVSubtitleType;
use ffmpeg_next::{codec, format, software, util};
use log::{debug, warn};
use std::collections::VecDeque;
use std::ffi::CStr;
use std::ptr;

/// 结束时间未知的字幕默认显示 3 秒
const DEFAULT_SUBTITLE_DURATION_MS: u32 = 3000;

fn to_rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn timestamp(value: i64) -> Option<i64> {
    (value != ffmpeg::ffi::AV_NOPTS_VALUE).then_some(value)
}

/// 把跨线程传递的包还原成 FFmpeg 包
fn to_ffmpeg_packet(pkt: &MediaPacket) -> ffmpeg::Packet {
    let mut packet = ffmpeg::Packet::copy(&pkt.data);
    packet.set_stream(pkt.stream_index);
    packet.set_pts(pkt.pts);
    packet.set_dts(pkt.dts);
    packet.set_duration(pkt.duration);
    packet.set_position(pkt.pos as isize);
    if pkt.key {
        packet.set_flags(ffmpeg::packet::Flags::KEY);
    }
    packet
}

/// 按流参数创建解码上下文
fn open_context(stream: &format::stream::Stream) -> Result<codec::context::Context> {
    let mut context = codec::context::Context::from_parameters(stream.parameters())?;
    unsafe {
        (*context.as_mut_ptr()).pkt_timebase = stream.time_base().into();
    }
    Ok(context)
}

fn send(decoder: &mut codec::decoder::Opened, packet: Option<&MediaPacket>) -> Result<SendStatus> {
    let result = match packet {
        Some(pkt) => decoder.send_packet(&to_ffmpeg_packet(pkt)),
        None => decoder.send_eof(),
    };
    match result {
        Ok(()) => Ok(SendStatus::Accepted),
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
            Ok(SendStatus::Again)
        }
        // 已经在排空模式
        Err(ffmpeg::Error::Eof) => Ok(SendStatus::Accepted),
        Err(e) => Err(e.into()),
    }
}

/// 软件视频解码（输出 RGBA）
pub struct FfmpegVideoBackend {
    decoder: codec::decoder::Video,
    scaler: Option<(software::scaling::Context, util::format::Pixel, u32, u32)>,
    time_base: Rational,
    stream_sar: Rational,
    codec_name: String,
}

// SwsContext 本身不是 Send，但我们确保只在单个线程中使用它
// 这是安全的，因为每个解码器实例只会在一个线程中使用
unsafe impl Send for FfmpegVideoBackend {}

impl FfmpegVideoBackend {
    pub fn from_stream(stream: &format::stream::Stream) -> Result<Self> {
        let decoder = open_context(stream)?.decoder().video()?;
        let codec_name = decoder
            .codec()
            .map(|c| c.name().to_string())
            .unwrap_or_default();
        debug!(
            "视频解码器: {} {}x{}, 格式: {:?}",
            codec_name,
            decoder.width(),
            decoder.height(),
            decoder.format()
        );
        let stream_sar = unsafe { (*stream.as_ptr()).sample_aspect_ratio };
        Ok(Self {
            decoder,
            scaler: None,
            time_base: to_rational(stream.time_base()),
            stream_sar: Rational::new(stream_sar.num, stream_sar.den),
            codec_name,
        })
    }

    /// 转换帧格式为 RGBA
    fn convert_frame(&mut self, frame: &util::frame::Video) -> Result<VideoFrame> {
        let width = frame.width();
        let height = frame.height();
        let format = frame.format();

        let rebuild = match &self.scaler {
            Some((_, f, w, h)) => *f != format || *w != width || *h != height,
            None => true,
        };
        if rebuild {
            debug!("🔧 初始化像素转换: {:?} {}x{} → RGBA", format, width, height);
            let scaler = software::scaling::Context::get(
                format,
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?;
            self.scaler = Some((scaler, format, width, height));
        }

        let mut rgba_frame = util::frame::Video::empty();
        if let Some((scaler, ..)) = self.scaler.as_mut() {
            scaler.run(frame, &mut rgba_frame)?;
        }

        // 复制数据到连续内存
        let row_size = width as usize * 4;
        let mut data = vec![0u8; row_size * height as usize];
        let stride = rgba_frame.stride(0);
        let frame_data = rgba_frame.data(0);
        for y in 0..height as usize {
            let src_offset = y * stride;
            let dst_offset = y * row_size;
            data[dst_offset..dst_offset + row_size]
                .copy_from_slice(&frame_data[src_offset..src_offset + row_size]);
        }

        Ok(VideoFrame {
            width,
            height,
            format: Some(PixelFormat::RGBA),
            data,
        })
    }
}

impl DecodeBackend for FfmpegVideoBackend {
    fn send_packet(&mut self, packet: Option<&MediaPacket>) -> Result<SendStatus> {
        send(&mut self.decoder, packet)
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus> {
        let mut decoded = util::frame::Video::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(ReceiveStatus::Again)
            }
            Err(ffmpeg::Error::Eof) => return Ok(ReceiveStatus::Eof),
            Err(e) => return Err(e.into()),
        }

        let (pkt_dts, pos) = unsafe {
            let raw = decoded.as_ptr();
            (timestamp((*raw).pkt_dts), (*raw).pkt_pos)
        };
        let frame_sar = to_rational(decoded.aspect_ratio());
        let sar = if frame_sar.is_valid() {
            frame_sar
        } else {
            self.stream_sar
        };
        let picture = self.convert_frame(&decoded)?;
        Ok(ReceiveStatus::Frame(DecodedFrame {
            pts: decoded.pts(),
            pkt_dts,
            best_effort: decoded.timestamp(),
            time_base: self.time_base,
            pos,
            sar,
            payload: FramePayload::Picture(picture),
        }))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn description(&self) -> String {
        format!("软件解码 ({})", self.codec_name)
    }
}

/// 音频解码，输出转换为设备参数（f32 交错）
pub struct FfmpegAudioBackend {
    decoder: codec::decoder::Audio,
    resampler: Option<(software::resampling::Context, util::format::Sample, u64, u32)>,
    time_base: Rational,
    target: AudioParams,
    codec_name: String,
}

unsafe impl Send for FfmpegAudioBackend {}

impl FfmpegAudioBackend {
    pub fn from_stream(stream: &format::stream::Stream, target: AudioParams) -> Result<Self> {
        let decoder = open_context(stream)?.decoder().audio()?;
        let codec_name = decoder
            .codec()
            .map(|c| c.name().to_string())
            .unwrap_or_default();
        debug!(
            "音频解码器: {} {} Hz, {} 声道 → 目标: {} Hz, {} 声道",
            codec_name,
            decoder.rate(),
            decoder.channels(),
            target.freq,
            target.channels
        );
        Ok(Self {
            decoder,
            resampler: None,
            time_base: to_rational(stream.time_base()),
            target,
            codec_name,
        })
    }

    /// 转换音频帧为 f32 格式（声道转换和重采样）
    fn convert_frame(&mut self, frame: &util::frame::Audio) -> Result<AudioFrame> {
        let source_rate = frame.rate();
        let source_format = frame.format();
        let mut source_layout = frame.channel_layout();
        if source_layout.is_empty() {
            source_layout = util::channel_layout::ChannelLayout::default(frame.channels() as i32);
        }

        let rebuild = match &self.resampler {
            Some((_, f, l, r)) => *f != source_format || *l != source_layout.bits() || *r != source_rate,
            None => true,
        };
        if rebuild {
            debug!(
                "🔧 初始化音频重采样器: {}Hz/{}ch → {}Hz/{}ch",
                source_rate,
                frame.channels(),
                self.target.freq,
                self.target.channels
            );
            let resampler = software::resampling::Context::get(
                source_format,
                source_layout,
                source_rate,
                util::format::Sample::F32(util::format::sample::Type::Packed),
                util::channel_layout::ChannelLayout::default(self.target.channels as i32),
                self.target.freq,
            )?;
            self.resampler = Some((resampler, source_format, source_layout.bits(), source_rate));
        }

        let mut resampled = util::frame::Audio::empty();
        if let Some((resampler, ..)) = self.resampler.as_mut() {
            resampler.run(frame, &mut resampled)?;
        }

        let data_size = resampled.samples() * self.target.channels as usize;
        let frame_data = resampled.data(0);
        let available = frame_data.len() / std::mem::size_of::<f32>();
        let count = data_size.min(available);
        let samples =
            unsafe { std::slice::from_raw_parts(frame_data.as_ptr() as *const f32, count) };

        Ok(AudioFrame {
            sample_rate: self.target.freq,
            channels: self.target.channels,
            format: SampleFormat::F32,
            data: samples.to_vec(),
        })
    }
}

impl DecodeBackend for FfmpegAudioBackend {
    fn send_packet(&mut self, packet: Option<&MediaPacket>) -> Result<SendStatus> {
        send(&mut self.decoder, packet)
    }

    fn receive_frame(&mut self) -> Result<ReceiveStatus> {
        let mut decoded = util::frame::Audio::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(ReceiveStatus::Again)
            }
            Err(ffmpeg::Error::Eof) => return Ok(ReceiveStatus::Eof),
            Err(e) => return Err(e.into()),
        }
        let pos = unsafe { (*decoded.as_ptr()).pkt_pos };
        let audio = self.convert_frame(&decoded)?;
        Ok(ReceiveStatus::Frame(DecodedFrame {
            pts: decoded.pts(),
            pkt_dts: None,
            best_effort: decoded.timestamp(),
            time_base: self.time_base,
            pos,
            sar: Rational::default(),
            payload: FramePayload::Audio(audio),
        }))
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }

    fn description(&self) -> String {
        format!("音频解码 ({})", self.codec_name)
    }
}

/// 字幕解码（文本、ASS 和调色板位图）
///
/// 字幕解码是一次调用出结果，解出的字幕先存起来，由 `receive_frame` 取走。
/// 位图区域经 swscale 从 PAL8 转成 RGBA。
pub struct FfmpegSubtitleBackend {
    decoder: codec::decoder::Subtitle,
    ready: VecDeque<DecodedFrame>,
    draining: bool,
    codec_name: String,
    sub_convert: *mut ffmpeg::ffi::SwsContext,
}

unsafe impl Send for FfmpegSubtitleBackend {}

impl FfmpegSubtitleBackend {
    pub fn from_stream(stream: &format::stream::Stream) -> Result<Self> {
        let decoder = open_context(stream)?.decoder().subtitle()?;
        let codec_name = decoder
            .codec()
            .map(|c| c.name().to_string())
            .unwrap_or_default();
        debug!("字幕解码器初始化: {}", codec_name);
        Ok(Self {
            decoder,
            ready: VecDeque::new(),
            draining: false,
            codec_name,
            sub_convert: ptr::null_mut(),
        })
    }

    /// 位图坐标所在的画布，即解码器的宽高
    fn canvas(&self) -> (u32, u32) {
        let (width, height) = unsafe {
            let ctx = self.decoder.as_ptr();
            ((*ctx).width, (*ctx).height)
        };
        (width.max(0) as u32, height.max(0) as u32)
    }

    /// 调色板位图转 RGBA
    fn convert_bitmap(&mut self, rect: &ffmpeg::ffi::AVSubtitleRect) -> Option<SubtitleBitmap> {
        if rect.w <= 0 || rect.h <= 0 || rect.data[0].is_null() || rect.data[1].is_null() {
            return None;
        }
        let (width, height) = (rect.w as u32, rect.h as u32);
        let mut data = vec![0u8; width as usize * height as usize * 4];
        unsafe {
            self.sub_convert = ffmpeg::ffi::sws_getCachedContext(
                self.sub_convert,
                rect.w,
                rect.h,
                ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_PAL8,
                rect.w,
                rect.h,
                ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_RGBA,
                ffmpeg::ffi::SWS_BICUBIC as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null(),
            );
            if self.sub_convert.is_null() {
                warn!("无法创建位图字幕转换上下文 {}x{}", width, height);
                return None;
            }
            let dst = [data.as_mut_ptr(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut()];
            let dst_linesize = [rect.w * 4, 0, 0, 0];
            ffmpeg::ffi::sws_scale(
                self.sub_convert,
                rect.data.as_ptr() as *const *const u8,
                rect.linesize.as_ptr(),
                0,
                rect.h,
                dst.as_ptr(),
                dst_linesize.as_ptr(),
            );
        }
        Some(SubtitleBitmap {
            x: rect.x,
            y: rect.y,
            width,
            height,
            data,
        })
    }

    fn convert(&mut self, subtitle: &mut ffmpeg::codec::subtitle::Subtitle, pos: i64) -> Option<DecodedFrame> {
        let mut text = String::new();
        let mut bitmaps = Vec::new();
        for rect in subtitle.rects() {
            unsafe {
                let raw = rect.as_ptr();
                match (*raw).type_ {
                    AVSubtitleType::SUBTITLE_TEXT => {
                        if !(*raw).text.is_null() {
                            text.push_str(&CStr::from_ptr((*raw).text).to_string_lossy());
                            text.push('\n');
                        }
                    }
                    AVSubtitleType::SUBTITLE_ASS => {
                        if !(*raw).ass.is_null() {
                            let line = CStr::from_ptr((*raw).ass).to_string_lossy();
                            text.push_str(ass_dialogue_text(&line));
                            text.push('\n');
                        }
                    }
                    AVSubtitleType::SUBTITLE_BITMAP => {
                        if let Some(bitmap) = self.convert_bitmap(&*raw) {
                            bitmaps.push(bitmap);
                        }
                    }
                    _ => {}
                }
            }
        }

        let start = subtitle.start();
        let mut end = subtitle.end();
        if end <= start {
            end = start + DEFAULT_SUBTITLE_DURATION_MS;
        }
        let pts = subtitle.pts();

        // ✅ 必须释放 FFmpeg subtitle，否则泄漏
        unsafe {
            ffmpeg::ffi::avsubtitle_free(subtitle.as_mut_ptr());
        }

        let text = clean_subtitle_text(&text);
        if text.is_empty() && bitmaps.is_empty() {
            return None;
        }
        Some(DecodedFrame {
            pts,
            pkt_dts: None,
            best_effort: pts,
            time_base: TIME_BASE_Q,
            pos,
            sar: Rational::default(),
            payload: FramePayload::Subtitle(SubtitleFrame {
                text,
                start_display: start as f64 / 1000.0,
                end_display: end as f64 / 1000.0,
                bitmaps,
                canvas: self.canvas(),
            }),
        })
    }
}

impl DecodeBackend for FfmpegSubtitleBackend {
    fn send_packet(&mut self, packet: Option<&MediaPacket>) -> Result<SendStatus> {
        let Some(pkt) = packet else {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        };
        let mut subtitle = ffmpeg::codec::subtitle::Subtitle::new();
        match self.decoder.decode(&to_ffmpeg_packet(pkt), &mut subtitle) {
            Ok(true) => {
                if let Some(frame) = self.convert(&mut subtitle, pkt.pos) {
                    self.ready.push_back(frame);
                }
                Ok(SendStatus::Accepted)
            }
            Ok(false) => Ok(SendStatus::Accepted),
            Err(e) => {
                warn!("字幕解码失败: {}", e);
                Err(e.into())
            }
        }
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
        self.decoder.flush();
    }

    fn description(&self) -> String {
        format!("字幕解码 ({})", self.codec_name)
    }
}

impl Drop for FfmpegSubtitleBackend {
    fn drop(&mut self) {
        if !self.sub_convert.is_null() {
            unsafe { ffmpeg::ffi::sws_freeContext(self.sub_convert) };
        }
    }
}

/// ASS 对话行的正文（前 8 个字段是 ReadOrder,Layer,Style,Name,MarginL,MarginR,MarginV,Effect）
fn ass_dialogue_text(line: &str) -> &str {
    line.splitn(9, ',').nth(8).unwrap_or(line)
}

/// 清理字幕文本：移除 ASS 标签、格式化换行
///
/// 支持的清理功能：
/// - 移除 ASS/SSA 标签（如 {\an8}, {\pos(100,200)}, {\r} 等）
/// - 移除简单 HTML 标签（<i>, <b>, <font ...>）
/// - 处理换行符（\N, \n）
/// - 规范化空白字符
pub fn clean_subtitle_text(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_ass_tag = false;

    while let Some(ch) = chars.next() {
        match ch {
            '{' => in_ass_tag = true,
            '}' => in_ass_tag = false,
            _ if in_ass_tag => {}
            '<' => {
                // 可能是简单标签 <i>, <b>, <u>, <font> 等
                let mut tag = String::from(ch);
                let mut found_tag = false;
                while let Some(&next) = chars.peek() {
                    if next == '>' {
                        chars.next();
                        found_tag = true;
                        break;
                    } else if next.is_ascii_alphanumeric()
                        || next.is_whitespace()
                        || matches!(next, '/' | '=' | '"' | '#')
                    {
                        tag.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !found_tag {
                    // 不是标签，原样保留
                    result.push_str(&tag);
                }
            }
            '\\' => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    result.push('\n');
                }
                Some('h') => {
                    chars.next();
                    result.push(' ');
                }
                _ => result.push(ch),
            },
            '\r' => {}
            _ => result.push(ch),
        }
    }

    result
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_ass_tags_and_breaks() {
        assert_eq!(
            clean_subtitle_text("{\\an8}Hello\\Nworld"),
            "Hello\nworld"
        );
    }

    #[test]
    fn test_clean_html_tags() {
        assert_eq!(
            clean_subtitle_text("<i>Italic</i> and <font color=\"#fff\">color</font>"),
            "Italic and color"
        );
        // 不成对的尖括号保留
        assert_eq!(clean_subtitle_text("a < b"), "a < b");
    }

    #[test]
    fn test_clean_blank_lines() {
        assert_eq!(clean_subtitle_text("  one \r\n\n\n two  "), "one\ntwo");
    }

    #[test]
    fn test_ass_dialogue_fields_stripped() {
        assert_eq!(ass_dialogue_text("0,0,Default,,0,0,0,,Hi, there"), "Hi, there");
        assert_eq!(ass_dialogue_text("plain"), "plain");
    }
}
