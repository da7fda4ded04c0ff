use egui::{Color32, ColorImage, Pos2, Rect, Stroke, TextureHandle, TextureOptions, Ui, Vec2};
use log::{debug, info};

use crate::core::{PixelFormat, PlayerError, Result, SubtitleBitmap, SubtitleFrame, VideoFrame};
use crate::renderer::{place_subtitle_bitmap, DisplayRect, VideoRenderer};

/// egui 视频渲染器
///
/// 刷新调度把画面、字幕和波形交给它，UI 每帧调用 `paint` 画出来。
pub struct EguiVideoRenderer {
    ctx: egui::Context,
    /// egui 纹理句柄
    texture: Option<TextureHandle>,
    texture_size: (u32, u32),
    /// 最近一次 present 的区域（相对视频区域左上角）
    rect: Option<DisplayRect>,
    subtitle: Option<String>,
    /// 位图字幕：纹理、区域位置（不含像素数据）
    subtitle_bitmaps: Vec<(TextureHandle, SubtitleBitmap)>,
    subtitle_canvas: (u32, u32),
    waveform: Option<Vec<Vec<f32>>>,
    viewport: (u32, u32),
    fullscreen: bool,
    stats: RenderStats,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RenderStats {
    pub frames_presented: u64,
    pub texture_updates: u64,
}

impl EguiVideoRenderer {
    pub fn new(ctx: egui::Context) -> Self {
        info!("🎨 初始化 EguiVideoRenderer");
        Self {
            ctx,
            texture: None,
            texture_size: (0, 0),
            rect: None,
            subtitle: None,
            subtitle_bitmaps: Vec::new(),
            subtitle_canvas: (0, 0),
            waveform: None,
            viewport: (640, 480),
            fullscreen: false,
            stats: RenderStats::default(),
        }
    }

    /// 由 UI 在布局后更新可用区域
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = (width.max(1), height.max(1));
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// 把当前内容画进 `area`
    pub fn paint(&self, ui: &mut Ui, area: Rect) {
        let painter = ui.painter_at(area);
        painter.rect_filled(area, 0.0, Color32::BLACK);

        if let Some(channels) = &self.waveform {
            let lane = area.height() / channels.len().max(1) as f32;
            for (ch, samples) in channels.iter().enumerate() {
                let center = area.top() + lane * (ch as f32 + 0.5);
                let step = area.width() / samples.len().max(1) as f32;
                let points: Vec<Pos2> = samples
                    .iter()
                    .enumerate()
                    .map(|(x, s)| {
                        Pos2::new(
                            area.left() + x as f32 * step,
                            center - s.clamp(-1.0, 1.0) * lane * 0.5,
                        )
                    })
                    .collect();
                painter.add(egui::Shape::line(points, Stroke::new(1.0, Color32::WHITE)));
            }
        } else if let (Some(texture), Some(rect)) = (&self.texture, self.rect) {
            let min = area.min + Vec2::new(rect.x as f32, rect.y as f32);
            let target = Rect::from_min_size(min, Vec2::new(rect.w as f32, rect.h as f32));
            painter.image(
                texture.id(),
                target,
                Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0)),
                Color32::WHITE,
            );

            for (texture, bitmap) in &self.subtitle_bitmaps {
                let Some((place, (u, v))) =
                    place_subtitle_bitmap(bitmap, self.subtitle_canvas, rect)
                else {
                    continue;
                };
                let min = area.min + Vec2::new(place.x as f32, place.y as f32);
                painter.image(
                    texture.id(),
                    Rect::from_min_size(min, Vec2::new(place.w as f32, place.h as f32)),
                    Rect::from_min_max(Pos2::ZERO, Pos2::new(u, v)),
                    Color32::WHITE,
                );
            }
        }

        if let Some(text) = &self.subtitle {
            painter.text(
                Pos2::new(area.center().x, area.bottom() - 40.0),
                egui::Align2::CENTER_BOTTOM,
                text,
                egui::FontId::proportional(24.0),
                Color32::WHITE,
            );
        }
    }

    /// 清理资源
    pub fn cleanup(&mut self) {
        info!("🧹 清理 EguiVideoRenderer 资源");
        self.texture = None;
        self.rect = None;
        self.subtitle = None;
        self.subtitle_bitmaps.clear();
        self.waveform = None;
    }
}

impl VideoRenderer for EguiVideoRenderer {
    fn upload_picture(&mut self, frame: &VideoFrame) -> Result<()> {
        if frame.format != Some(PixelFormat::RGBA) {
            return Err(PlayerError::RenderError(format!(
                "不支持的像素格式: {:?}",
                frame.format
            )));
        }
        let expected = frame.width as usize * frame.height as usize * 4;
        if frame.data.len() < expected {
            return Err(PlayerError::RenderError(format!(
                "帧数据不完整: {} < {}",
                frame.data.len(),
                expected
            )));
        }
        let image = ColorImage::from_rgba_unmultiplied(
            [frame.width as usize, frame.height as usize],
            &frame.data[..expected],
        );
        match &mut self.texture {
            Some(texture) => texture.set(image, TextureOptions::LINEAR),
            None => {
                info!("🆕 创建视频纹理: {}x{}", frame.width, frame.height);
                self.texture = Some(self.ctx.load_texture(
                    "video_frame",
                    image,
                    TextureOptions::LINEAR,
                ));
            }
        }
        if self.texture_size != (frame.width, frame.height) {
            debug!("📐 视频尺寸变化: {}x{}", frame.width, frame.height);
            self.texture_size = (frame.width, frame.height);
        }
        self.stats.texture_updates += 1;
        Ok(())
    }

    fn set_subtitle(&mut self, subtitle: Option<&SubtitleFrame>) {
        self.subtitle = subtitle
            .map(|s| s.text.clone())
            .filter(|text| !text.is_empty());
        self.subtitle_bitmaps.clear();
        let Some(subtitle) = subtitle else {
            return;
        };
        self.subtitle_canvas = subtitle.canvas;
        for (i, bitmap) in subtitle.bitmaps.iter().enumerate() {
            let size = [bitmap.width as usize, bitmap.height as usize];
            if bitmap.data.len() < size[0] * size[1] * 4 {
                debug!("位图字幕数据不完整，跳过区域 #{}", i);
                continue;
            }
            let image = ColorImage::from_rgba_unmultiplied(size, &bitmap.data[..size[0] * size[1] * 4]);
            let texture = self.ctx.load_texture(
                format!("subtitle_{}", i),
                image,
                TextureOptions::LINEAR,
            );
            let placement = SubtitleBitmap {
                x: bitmap.x,
                y: bitmap.y,
                width: bitmap.width,
                height: bitmap.height,
                data: Vec::new(),
            };
            self.subtitle_bitmaps.push((texture, placement));
        }
        self.ctx.request_repaint();
    }

    fn present(&mut self, rect: DisplayRect) -> Result<()> {
        self.rect = Some(rect);
        self.waveform = None;
        self.stats.frames_presented += 1;
        self.ctx.request_repaint();
        Ok(())
    }

    fn present_waveform(&mut self, channels: &[Vec<f32>]) -> Result<()> {
        self.waveform = Some(channels.to_vec());
        self.ctx.request_repaint();
        Ok(())
    }

    fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    fn set_fullscreen(&mut self, fullscreen: bool) {
        self.fullscreen = fullscreen;
        self.ctx
            .send_viewport_cmd(egui::ViewportCommand::Fullscreen(fullscreen));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(width: u32, height: u32) -> VideoFrame {
        VideoFrame {
            width,
            height,
            format: Some(PixelFormat::RGBA),
            data: vec![128; (width * height * 4) as usize],
        }
    }

    fn bitmap(x: i32, width: u32, height: u32, bytes: usize) -> SubtitleBitmap {
        SubtitleBitmap {
            x,
            y: 0,
            width,
            height,
            data: vec![255; bytes],
        }
    }

    #[test]
    fn test_stats_count_uploads_and_presents() {
        let mut renderer = EguiVideoRenderer::new(egui::Context::default());
        renderer.upload_picture(&rgba(4, 2)).unwrap();
        renderer.upload_picture(&rgba(4, 2)).unwrap();
        renderer
            .present(DisplayRect { x: 0, y: 0, w: 4, h: 2 })
            .unwrap();

        let stats = renderer.stats();
        assert_eq!(stats.texture_updates, 2);
        assert_eq!(stats.frames_presented, 1);

        let mut yuv = rgba(4, 2);
        yuv.format = Some(PixelFormat::YUV420P);
        assert!(renderer.upload_picture(&yuv).is_err());
        assert_eq!(renderer.stats().texture_updates, 2);
    }

    #[test]
    fn test_bitmap_subtitle_uploaded_as_textures() {
        let mut renderer = EguiVideoRenderer::new(egui::Context::default());
        let subtitle = SubtitleFrame {
            bitmaps: vec![
                bitmap(0, 2, 1, 8),
                bitmap(10, 2, 2, 16),
                // 数据不完整
                bitmap(20, 4, 4, 8),
            ],
            canvas: (720, 576),
            ..SubtitleFrame::default()
        };
        renderer.set_subtitle(Some(&subtitle));
        assert_eq!(renderer.subtitle_bitmaps.len(), 2);
        assert_eq!(renderer.subtitle_canvas, (720, 576));
        assert!(renderer.subtitle_bitmaps.iter().all(|(_, b)| b.data.is_empty()));
        assert_eq!(renderer.subtitle_bitmaps[1].1.x, 10);
        assert_eq!(renderer.subtitle, None);

        let text = SubtitleFrame {
            text: "你好".to_string(),
            ..SubtitleFrame::default()
        };
        renderer.set_subtitle(Some(&text));
        assert!(renderer.subtitle_bitmaps.is_empty());
        assert_eq!(renderer.subtitle.as_deref(), Some("你好"));

        renderer.set_subtitle(None);
        assert_eq!(renderer.subtitle, None);
    }
}
