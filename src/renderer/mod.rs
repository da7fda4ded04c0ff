// 渲染模块

pub mod egui_video_renderer;

pub use egui_video_renderer::EguiVideoRenderer;

use crate::core::{Rational, Result, SubtitleBitmap, SubtitleFrame, VideoFrame};

/// 画面在窗口中的显示区域（像素）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// 渲染后端接口
///
/// 刷新调度在 UI 线程中调用，实现不需要是 Send。
pub trait VideoRenderer {
    /// 上传一帧 RGBA 画面
    fn upload_picture(&mut self, frame: &VideoFrame) -> Result<()>;

    /// 当前显示的字幕，None 表示清除
    ///
    /// 只在可见字幕变化时调用，位图区域可以在这里一次性上传。
    fn set_subtitle(&mut self, subtitle: Option<&SubtitleFrame>);

    /// 在 `rect` 中显示最近上传的画面
    fn present(&mut self, rect: DisplayRect) -> Result<()>;

    /// 显示音频波形，每个声道一组采样
    fn present_waveform(&mut self, channels: &[Vec<f32>]) -> Result<()>;

    /// 可用的显示区域大小
    fn viewport(&self) -> (u32, u32);

    fn set_fullscreen(&mut self, fullscreen: bool);
}

/// 按采样宽高比把画面居中放进窗口，宽高取偶数
pub fn calculate_display_rect(
    screen_width: u32,
    screen_height: u32,
    pic_width: u32,
    pic_height: u32,
    sar: Rational,
) -> DisplayRect {
    let mut aspect_ratio = if sar.num == 0 || sar.den == 0 {
        0.0
    } else {
        sar.to_f64()
    };
    if aspect_ratio <= 0.0 {
        aspect_ratio = 1.0;
    }
    aspect_ratio *= pic_width.max(1) as f64 / pic_height.max(1) as f64;

    let mut height = screen_height as i64;
    let mut width = ((height as f64 * aspect_ratio).round() as i64) & !1;
    if width > screen_width as i64 {
        width = screen_width as i64;
        height = ((width as f64 / aspect_ratio).round() as i64) & !1;
    }
    let x = (screen_width as i64 - width) / 2;
    let y = (screen_height as i64 - height) / 2;
    DisplayRect {
        x: x as i32,
        y: y as i32,
        w: width.max(1) as i32,
        h: height.max(1) as i32,
    }
}

/// 位图字幕区域在窗口中的位置
///
/// 先把区域裁剪到画布内，再按画面显示区域与画布的比例缩放。
/// 返回目标区域和裁剪后保留的纹理比例 (u, v)；裁剪后为空时返回 None。
pub fn place_subtitle_bitmap(
    bitmap: &SubtitleBitmap,
    canvas: (u32, u32),
    display: DisplayRect,
) -> Option<(DisplayRect, (f32, f32))> {
    let (canvas_w, canvas_h) = (canvas.0 as i32, canvas.1 as i32);
    if canvas_w <= 0 || canvas_h <= 0 || bitmap.width == 0 || bitmap.height == 0 {
        return None;
    }
    let x = bitmap.x.clamp(0, canvas_w);
    let y = bitmap.y.clamp(0, canvas_h);
    let w = (bitmap.width as i32).clamp(0, canvas_w - x);
    let h = (bitmap.height as i32).clamp(0, canvas_h - y);
    if w == 0 || h == 0 {
        return None;
    }

    let xratio = display.w as f64 / canvas_w as f64;
    let yratio = display.h as f64 / canvas_h as f64;
    let target = DisplayRect {
        x: display.x + (x as f64 * xratio) as i32,
        y: display.y + (y as f64 * yratio) as i32,
        w: (w as f64 * xratio) as i32,
        h: (h as f64 * yratio) as i32,
    };
    let uv = (
        w as f32 / bitmap.width as f32,
        h as f32 / bitmap.height as f32,
    );
    Some((target, uv))
}
