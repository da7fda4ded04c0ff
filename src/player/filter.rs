use crate::core::{FramePayload, PixelFormat, PlayerConfig, StreamInfo, VideoFrame};
use crate::player::codec::DecodedFrame;
use log::{debug, warn};

/// 解码输出与帧队列之间的可选处理阶段
///
/// 打开视频流时按配置选定，解码线程对每一帧调用一次。
pub trait FrameFilter: Send {
    fn process(&mut self, frame: &mut DecodedFrame);

    fn name(&self) -> &'static str;
}

/// 不做任何处理
pub struct Passthrough;

impl FrameFilter for Passthrough {
    fn process(&mut self, _frame: &mut DecodedFrame) {}

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// 按显示矩阵旋转 RGBA 画面
pub struct AutoRotate {
    /// 顺时针旋转的 90 度次数（1..=3）
    quarter_turns: u8,
}

impl AutoRotate {
    /// 角度不是 90 的整数倍（误差 1 度内）时返回 None
    pub fn from_rotation(degrees: f64) -> Option<Self> {
        let theta = degrees.rem_euclid(360.0);
        let quarter_turns = [(90.0, 1u8), (180.0, 2), (270.0, 3)]
            .iter()
            .find(|(angle, _)| (theta - angle).abs() < 1.0)
            .map(|(_, turns)| *turns)?;
        Some(Self { quarter_turns })
    }

    pub fn quarter_turns(&self) -> u8 {
        self.quarter_turns
    }

    fn rotate(&self, src: &VideoFrame) -> Option<VideoFrame> {
        if src.format != Some(PixelFormat::RGBA) {
            return None;
        }
        let (w, h) = (src.width as usize, src.height as usize);
        if src.data.len() < w * h * 4 {
            return None;
        }
        let (dw, dh) = if self.quarter_turns == 2 { (w, h) } else { (h, w) };
        let mut data = vec![0u8; w * h * 4];
        for dy in 0..dh {
            for dx in 0..dw {
                let (sx, sy) = match self.quarter_turns {
                    1 => (dy, h - 1 - dx),
                    2 => (w - 1 - dx, h - 1 - dy),
                    _ => (w - 1 - dy, dx),
                };
                let s = (sy * w + sx) * 4;
                let d = (dy * dw + dx) * 4;
                data[d..d + 4].copy_from_slice(&src.data[s..s + 4]);
            }
        }
        Some(VideoFrame {
            width: dw as u32,
            height: dh as u32,
            format: src.format,
            data,
        })
    }
}

impl FrameFilter for AutoRotate {
    fn process(&mut self, frame: &mut DecodedFrame) {
        let FramePayload::Picture(picture) = &frame.payload else {
            return;
        };
        match self.rotate(picture) {
            Some(rotated) => {
                if self.quarter_turns != 2 {
                    frame.sar = crate::core::Rational::new(frame.sar.den, frame.sar.num);
                }
                frame.payload = FramePayload::Picture(rotated);
            }
            None => warn!("⚠️ 无法旋转画面（仅支持 RGBA）"),
        }
    }

    fn name(&self) -> &'static str {
        match self.quarter_turns {
            1 => "rotate90",
            2 => "rotate180",
            _ => "rotate270",
        }
    }
}

/// 为视频流选择处理阶段
pub fn build_video_filter(config: &PlayerConfig, stream: &StreamInfo) -> Box<dyn FrameFilter> {
    if config.autorotate {
        if let Some(rotate) = AutoRotate::from_rotation(stream.rotation) {
            debug!("🔄 视频流 #{} 启用自动旋转: {}", stream.index, rotate.name());
            return Box::new(rotate);
        }
    }
    Box::new(Passthrough)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Rational;

    /// 2x1 图像：左红右绿
    fn red_green() -> DecodedFrame {
        DecodedFrame {
            sar: Rational::new(4, 3),
            payload: FramePayload::Picture(VideoFrame {
                width: 2,
                height: 1,
                format: Some(PixelFormat::RGBA),
                data: vec![255, 0, 0, 255, 0, 255, 0, 255],
            }),
            ..DecodedFrame::default()
        }
    }

    fn picture(frame: &DecodedFrame) -> &VideoFrame {
        match &frame.payload {
            FramePayload::Picture(p) => p,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_rotation_angle_matching() {
        assert!(AutoRotate::from_rotation(0.0).is_none());
        assert!(AutoRotate::from_rotation(45.0).is_none());
        assert_eq!(AutoRotate::from_rotation(90.4).unwrap().quarter_turns(), 1);
        assert_eq!(AutoRotate::from_rotation(-90.0).unwrap().quarter_turns(), 3);
        assert_eq!(AutoRotate::from_rotation(540.0).unwrap().quarter_turns(), 2);
    }

    #[test]
    fn test_rotate_clockwise_swaps_geometry() {
        let mut frame = red_green();
        AutoRotate::from_rotation(90.0).unwrap().process(&mut frame);
        let p = picture(&frame);
        assert_eq!((p.width, p.height), (1, 2));
        // 顺时针 90 度后左边的红色到了上方
        assert_eq!(&p.data[0..4], &[255, 0, 0, 255]);
        assert_eq!(&p.data[4..8], &[0, 255, 0, 255]);
        assert_eq!(frame.sar, Rational::new(3, 4));
    }

    #[test]
    fn test_rotate_counter_clockwise_and_half_turn() {
        let mut frame = red_green();
        AutoRotate::from_rotation(270.0).unwrap().process(&mut frame);
        let p = picture(&frame);
        assert_eq!((p.width, p.height), (1, 2));
        assert_eq!(&p.data[0..4], &[0, 255, 0, 255]);

        let mut frame = red_green();
        AutoRotate::from_rotation(180.0).unwrap().process(&mut frame);
        let p = picture(&frame);
        assert_eq!((p.width, p.height), (2, 1));
        assert_eq!(&p.data[0..4], &[0, 255, 0, 255]);
        assert_eq!(frame.sar, Rational::new(4, 3));
    }
}
