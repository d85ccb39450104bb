//! Detection + encoding in one pass over a frame.

use crate::detector::{DetectorError, DetectorOptions, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::resize;
use crate::types::{BoundingBox, DetectedFace, LumaImage};
use std::path::Path;
use thiserror::Error;

/// Default detection downsample factor (a quarter of the frame size per side).
pub const DEFAULT_DETECT_SCALE: f32 = 0.25;

const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Anything that can turn a grayscale frame into located, encoded faces.
pub trait FaceEncoder {
    /// Locate every face in `frame` and compute its encoding, strongest first.
    /// Boxes are in `frame` coordinates.
    fn encode_faces(&mut self, frame: &LumaImage<'_>) -> Result<Vec<DetectedFace>, PipelineError>;
}

/// SCRFD + ArcFace pipeline.
///
/// Detection runs on a copy of the frame downscaled by `detect_scale`;
/// boxes and landmarks are mapped back up and encodings are extracted from
/// the full-resolution frame.
#[derive(Debug)]
pub struct FacePipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    detect_scale: f32,
}

impl FacePipeline {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer, detect_scale: f32) -> Self {
        let detect_scale = if detect_scale > 0.0 && detect_scale <= 1.0 {
            detect_scale
        } else {
            tracing::warn!(detect_scale, "detect scale out of range (0, 1]; using full resolution");
            1.0
        };
        Self { detector, recognizer, detect_scale }
    }

    /// Load both models from `model_dir` using their standard file names.
    pub fn load(model_dir: &Path, detect_scale: f32) -> Result<Self, PipelineError> {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);

        let detector =
            FaceDetector::load_with(&scrfd.to_string_lossy(), DetectorOptions::default())?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;
        Ok(Self::new(detector, recognizer, detect_scale))
    }

    pub fn detect_scale(&self) -> f32 {
        self.detect_scale
    }
}

/// Map boxes detected on a `small` frame onto the `full` frame it came from.
fn upscale_boxes(boxes: Vec<BoundingBox>, small: (u32, u32), full: (u32, u32)) -> Vec<BoundingBox> {
    let sx = full.0 as f32 / small.0 as f32;
    let sy = full.1 as f32 / small.1 as f32;
    boxes.into_iter().map(|b| b.scaled_xy(sx, sy)).collect()
}

impl FaceEncoder for FacePipeline {
    fn encode_faces(&mut self, frame: &LumaImage<'_>) -> Result<Vec<DetectedFace>, PipelineError> {
        let boxes = if self.detect_scale < 1.0 {
            let (small, w, h) = resize::downscale(frame, self.detect_scale);
            let found = self.detector.detect(&LumaImage::new(&small, w, h))?;
            upscale_boxes(found, (w, h), (frame.width, frame.height))
        } else {
            self.detector.detect(frame)?
        };

        boxes
            .into_iter()
            .map(|bbox| {
                let embedding = self.recognizer.extract(frame, &bbox)?;
                Ok(DetectedFace { bbox, embedding })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_cover(w: u32, h: u32) -> BoundingBox {
        BoundingBox {
            x: 0.0, y: 0.0, width: w as f32, height: h as f32, confidence: 0.9,
            landmarks: Some([(w as f32, h as f32); 5]),
        }
    }

    #[test]
    fn test_upscale_boxes_maps_each_axis() {
        // 563 * 0.25 rounds to 141, so the y ratio is not exactly 4.
        let data = vec![0u8; 1000 * 563];
        let frame = LumaImage::new(&data, 1000, 563);
        let (_, w, h) = resize::downscale(&frame, DEFAULT_DETECT_SCALE);
        assert_eq!((w, h), (250, 141));

        let mapped = upscale_boxes(vec![full_cover(w, h)], (w, h), (1000, 563));
        let b = &mapped[0];
        assert!((b.x + b.width - 1000.0).abs() < 1e-3);
        assert!((b.y + b.height - 563.0).abs() < 1e-3);
        let (lx, ly) = b.landmarks.unwrap()[2];
        assert!((lx - 1000.0).abs() < 1e-3 && (ly - 563.0).abs() < 1e-3);
    }

    #[test]
    fn test_upscale_boxes_identity_when_unscaled() {
        let mapped = upscale_boxes(vec![full_cover(64, 48)], (64, 48), (64, 48));
        assert_eq!((mapped[0].width, mapped[0].height), (64.0, 48.0));
    }
}
