use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Label drawn on faces that do not match any gallery entry.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Multiply every coordinate (box and landmarks) by `factor`.
    pub fn scaled(&self, factor: f32) -> BoundingBox {
        self.scaled_xy(factor, factor)
    }

    /// Scale x coordinates by `sx` and y coordinates by `sy`.
    ///
    /// Used to map a detection made on a downsampled frame back onto the
    /// full-resolution frame, whose axes may not shrink by the same ratio
    /// once the small frame's dimensions are rounded.
    pub fn scaled_xy(&self, sx: f32, sy: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * sx, ly * sy))),
        }
    }
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled identity: the reference encoding computed from a labeled image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    /// Identity label, taken from the reference image's file stem.
    pub identity: String,
    pub embedding: Embedding,
    /// Reference image the embedding was computed from.
    pub source: PathBuf,
}

/// A face found in a frame together with its encoding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Borrowed 8-bit grayscale frame.
#[derive(Debug, Clone, Copy)]
pub struct LumaImage<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> LumaImage<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Self {
        Self { data, width, height }
    }
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best match [-1, 1].
    pub similarity: f32,
    /// Identity of the matched entry (if any).
    pub identity: Option<String>,
}

impl MatchResult {
    /// Label to display for this result: the identity, or `Unknown`.
    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_IDENTITY)
    }
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Always iterates every gallery entry and reports the most similar one.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, query: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let sim = query.similarity(&entry.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                identity: Some(gallery[idx].identity.clone()),
            },
            _ => MatchResult {
                matched: false,
                similarity: if best_sim == f32::NEG_INFINITY { 0.0 } else { best_sim },
                identity: None,
            },
        }
    }
}
