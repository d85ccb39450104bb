//! Frame annotation (face boxes and identity labels) and JPEG encoding.

use crate::types::BoundingBox;
use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageResult, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BOX_THICKNESS: i32 = 2;
/// Gap between the top of the face box and the label baseline.
const LABEL_OFFSET: i32 = 10;
const LABEL_PX: f32 = 22.0;
const BAR_HEIGHT: u32 = 24;

/// Draws face boxes and labels onto RGB frames.
///
/// Text needs a TrueType font. Without one, each label is shown as a
/// colored bar only.
pub struct Annotator {
    font: Option<FontVec>,
    scale: PxScale,
}

impl std::fmt::Debug for Annotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Annotator")
            .field("has_font", &self.font.is_some())
            .finish_non_exhaustive()
    }
}

impl Annotator {
    /// Build an annotator, loading the label font from `font_path` if given.
    /// A font that fails to load is logged and ignored.
    pub fn new(font_path: Option<&Path>) -> Self {
        let font = font_path.and_then(|path| {
            let loaded = std::fs::read(path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|e| e.to_string()));
            match loaded {
                Ok(font) => {
                    tracing::info!(path = %path.display(), "label font loaded");
                    Some(font)
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "label font unavailable; drawing boxes only");
                    None
                }
            }
        });
        Self { font, scale: PxScale::from(LABEL_PX) }
    }

    pub fn without_font() -> Self {
        Self { font: None, scale: PxScale::from(LABEL_PX) }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw a box around `face` and `label` just above it.
    /// `known` selects green (enrolled identity) or red (`Unknown`).
    pub fn draw_face(&self, frame: &mut RgbImage, face: &BoundingBox, label: &str, known: bool) {
        let color = if known { KNOWN_COLOR } else { UNKNOWN_COLOR };
        let Some(rect) = clamp_rect(frame, face.x, face.y, face.width, face.height) else {
            return;
        };

        for inset in 0..BOX_THICKNESS {
            let w = rect.width() as i32 - 2 * inset;
            let h = rect.height() as i32 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let r = Rect::at(rect.left() + inset, rect.top() + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(frame, r, color);
        }

        let (text_w, text_h) = match &self.font {
            Some(font) => text_size(self.scale, font, label),
            None => (rect.width(), BAR_HEIGHT),
        };
        let bar_top = (rect.top() - LABEL_OFFSET - text_h as i32).max(0);
        let bar_w = text_w.max(1).min(frame.width().saturating_sub(rect.left().max(0) as u32));
        if bar_w > 0 {
            draw_filled_rect_mut(
                frame,
                Rect::at(rect.left(), bar_top).of_size(bar_w, text_h.max(1)),
                color,
            );
        }
        if let Some(font) = &self.font {
            draw_text_mut(frame, TEXT_COLOR, rect.left(), bar_top, self.scale, font, label);
        }
    }
}

/// Intersect a float box with the frame; `None` when nothing is visible.
fn clamp_rect(frame: &RgbImage, x: f32, y: f32, w: f32, h: f32) -> Option<Rect> {
    let (fw, fh) = (frame.width() as f32, frame.height() as f32);
    let left = x.max(0.0);
    let top = y.max(0.0);
    let right = (x + w).min(fw);
    let bottom = (y + h).min(fh);
    if right - left < 1.0 || bottom - top < 1.0 {
        return None;
    }
    Some(
        Rect::at(left as i32, top as i32)
            .of_size((right - left) as u32, (bottom - top) as u32),
    )
}

/// Encode an RGB frame as baseline JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(frame.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).write_image(
        frame.as_raw(),
        frame.width(),
        frame.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}
