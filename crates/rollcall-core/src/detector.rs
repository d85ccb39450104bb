//! SCRFD face detector via ONNX Runtime.
//!
//! The frame is letterboxed into the square network input, the three
//! anchor-free stride heads are decoded, and overlapping candidates are
//! removed with greedy non-maximum suppression.

use crate::resize;
use crate::types::{BoundingBox, LumaImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Tunables for [`FaceDetector`].
#[derive(Debug, Clone, Copy)]
pub struct DetectorOptions {
    /// Minimum anchor score kept before NMS.
    pub confidence_threshold: f32,
    /// IoU above which the weaker of two candidates is suppressed.
    pub nms_threshold: f32,
    pub intra_threads: usize,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            intra_threads: 2,
        }
    }
}

/// Mapping between frame coordinates and the letterboxed network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    inner_w: usize,
    inner_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let inner_w = ((width as f32 * scale).round() as usize).min(target);
        let inner_h = ((height as f32 * scale).round() as usize).min(target);
        Self {
            scale,
            pad_x: (target - inner_w) as f32 / 2.0,
            pad_y: (target - inner_h) as f32 / 2.0,
            inner_w,
            inner_h,
        }
    }

    /// Network-input point back to frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    stride: usize,
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    options: DetectorOptions,
    heads: [StrideHead; 3],
}

impl std::fmt::Debug for FaceDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceDetector")
            .field("options", &self.options)
            .field("heads", &self.heads)
            .finish_non_exhaustive()
    }
}

impl FaceDetector {
    /// Load the SCRFD ONNX model with default options.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        Self::load_with(model_path, DetectorOptions::default())
    }

    pub fn load_with(model_path: &str, options: DetectorOptions) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(options.intra_threads)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps for 3 strides), model has {}",
                output_names.len()
            )));
        }

        let heads = resolve_heads(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, ?heads, "loaded SCRFD model");

        Ok(Self { session, options, heads })
    }

    /// Detect faces in a grayscale frame, strongest first.
    pub fn detect(&mut self, frame: &LumaImage<'_>) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width == 0 || frame.height == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(frame.width as usize, frame.height as usize, SCRFD_INPUT_SIZE);
        let input = input_tensor(frame, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for head in &self.heads {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {}: {e}", head.stride))
                    })
            };
            let scores = extract(head.score, "scores")?;
            let boxes = extract(head.bbox, "boxes")?;
            let kps = extract(head.kps, "landmarks")?;

            candidates.extend(decode_head(
                head.stride,
                scores,
                boxes,
                kps,
                &letterbox,
                self.options.confidence_threshold,
            ));
        }

        let faces = non_max_suppression(candidates, self.options.nms_threshold);
        tracing::trace!(count = faces.len(), "faces detected");
        Ok(faces)
    }
}

/// Build the NCHW input: letterboxed, normalized, grayscale replicated to 3 channels.
fn input_tensor(frame: &LumaImage<'_>, lb: &Letterbox) -> Array4<f32> {
    let resized = resize::bilinear(frame, lb.inner_w, lb.inner_h);
    let x0 = lb.pad_x.floor() as usize;
    let y0 = lb.pad_y.floor() as usize;

    // Padding is filled with the mean, which normalizes to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for y in 0..lb.inner_h {
        for x in 0..lb.inner_w {
            let v = (resized[y * lb.inner_w + x] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y0 + y, x0 + x]] = v;
            }
        }
    }
    tensor
}

/// Map output tensors to stride heads, by name when the export uses
/// `score_8`/`bbox_8`/`kps_8` style names and positionally otherwise
/// (`[0-2]` scores, `[3-5]` boxes, `[6-8]` landmarks).
fn resolve_heads(names: &[String]) -> [StrideHead; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<StrideHead>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideHead {
                stride,
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match by_name {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => std::array::from_fn(|i| StrideHead {
            stride: SCRFD_STRIDES[i],
            score: i,
            bbox: i + 3,
            kps: i + 6,
        }),
    }
}

/// Decode every anchor of one stride head whose score clears `threshold`.
fn decode_head(
    stride: usize,
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    lb: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * s;
            let ay = (cell / grid) as f32 * s;

            let d = boxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = lb.unmap(ax - d[0] * s, ay - d[1] * s);
            let (x2, y2) = lb.unmap(ax + d[2] * s, ay + d[3] * s);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| lb.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS: keep candidates strongest-first, dropping any that overlap a
/// kept box by more than `iou_threshold`.
fn non_max_suppression(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let ix = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let iy = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = ix * iy;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}
