//! Enrolled gallery, built once from a directory of labeled reference images.
//!
//! Each `jpg`/`jpeg`/`png` file contributes one entry whose identity is the
//! file stem (`known_faces/alice.jpg` enrolls `alice`). Files that cannot be
//! decoded or contain no face are skipped, never fatal.

use crate::pipeline::{FaceEncoder, PipelineError};
use crate::types::{Embedding, GalleryEntry, LumaImage, MatchResult, Matcher};
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read gallery directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding failed: {0}")]
    Pipeline(#[from] PipelineError),
}

/// A reference image that did not produce a gallery entry.
#[derive(Debug, Clone)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    /// Build the gallery from every reference image in `dir`, in file name order.
    ///
    /// Inference errors abort the load; per-image decode failures and
    /// faceless images are reported in the returned skip list.
    pub fn load_dir<E: FaceEncoder + ?Sized>(
        dir: &Path,
        encoder: &mut E,
    ) -> Result<(Self, Vec<SkippedImage>), GalleryError> {
        let read = std::fs::read_dir(dir).map_err(|source| GalleryError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = read
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_reference_image(p))
            .collect();
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        let mut skipped = Vec::new();

        for path in paths {
            let Some(identity) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned)
            else {
                skipped.push(SkippedImage { path, reason: "file name is not valid UTF-8".into() });
                continue;
            };

            let luma = match decode_luma(&path) {
                Ok(luma) => luma,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping undecodable reference image");
                    skipped.push(SkippedImage { path, reason: format!("decode failed: {e}") });
                    continue;
                }
            };

            let frame = LumaImage::new(luma.as_raw(), luma.width(), luma.height());
            let faces = encoder.encode_faces(&frame)?;
            let Some(face) = faces.into_iter().next() else {
                tracing::warn!(path = %path.display(), "no face found in reference image");
                skipped.push(SkippedImage { path, reason: "no face detected".into() });
                continue;
            };

            tracing::debug!(identity = %identity, confidence = face.bbox.confidence, "enrolled");
            entries.push(GalleryEntry { identity, embedding: face.embedding, source: path });
        }

        tracing::info!(
            dir = %dir.display(),
            enrolled = entries.len(),
            skipped = skipped.len(),
            "gallery loaded"
        );
        Ok((Self { entries }, skipped))
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct identity labels in enrollment order.
    pub fn identities(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !seen.contains(&entry.identity.as_str()) {
                seen.push(&entry.identity);
            }
        }
        seen
    }

    pub fn identify<M: Matcher + ?Sized>(
        &self,
        query: &Embedding,
        matcher: &M,
        threshold: f32,
    ) -> MatchResult {
        matcher.compare(query, &self.entries, threshold)
    }
}

/// Decode by content rather than trusting the extension's case or accuracy.
fn decode_luma(path: &Path) -> Result<image::GrayImage, image::ImageError> {
    let reader = image::ImageReader::open(path)?.with_guessed_format()?;
    Ok(reader.decode()?.to_luma8())
}

fn is_reference_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|x| ext.eq_ignore_ascii_case(x)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, CosineMatcher, DetectedFace};

    /// Encodes a frame as a single face whose embedding is the frame's mean
    /// brightness, or no face when the frame is black.
    struct BrightnessEncoder;

    impl FaceEncoder for BrightnessEncoder {
        fn encode_faces(&mut self, frame: &LumaImage<'_>) -> Result<Vec<DetectedFace>, PipelineError> {
            let mean = frame.data.iter().map(|&p| p as f32).sum::<f32>() / frame.data.len() as f32;
            if mean == 0.0 {
                return Ok(Vec::new());
            }
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x: 0.0, y: 0.0, width: frame.width as f32, height: frame.height as f32,
                    confidence: 1.0, landmarks: None,
                },
                embedding: Embedding { values: vec![mean, 255.0 - mean], model_version: None },
            }])
        }
    }

    fn write_image(dir: &Path, name: &str, value: u8) {
        image::GrayImage::from_pixel(8, 8, image::Luma([value]))
            .save_with_format(dir.join(name), image::ImageFormat::Png)
            .unwrap();
    }

    #[test]
    fn test_load_dir_labels_by_stem_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "bob.png", 200);
        write_image(dir.path(), "alice.PNG", 40);
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let (gallery, skipped) = Gallery::load_dir(dir.path(), &mut BrightnessEncoder).unwrap();
        assert_eq!(gallery.identities(), vec!["alice", "bob"]);
        assert!(skipped.is_empty());
        assert!(gallery.entries()[0].source.ends_with("alice.PNG"));
    }

    #[test]
    fn test_load_dir_skips_faceless_and_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "carol.png", 120);
        write_image(dir.path(), "blank.png", 0);
        std::fs::write(dir.path().join("broken.jpg"), b"\xff\xd8garbage").unwrap();

        let (gallery, skipped) = Gallery::load_dir(dir.path(), &mut BrightnessEncoder).unwrap();
        assert_eq!(gallery.len(), 1);
        let mut reasons: Vec<_> = skipped
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        reasons.sort();
        assert_eq!(reasons, vec!["blank.png", "broken.jpg"]);
    }

    #[test]
    fn test_load_dir_missing_directory() {
        let err = Gallery::load_dir(Path::new("/nonexistent/known_faces"), &mut BrightnessEncoder)
            .unwrap_err();
        assert!(matches!(err, GalleryError::Directory { .. }));
    }

    #[test]
    fn test_identify_against_loaded_gallery() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "dark.png", 30);
        write_image(dir.path(), "light.png", 230);
        let (gallery, _) = Gallery::load_dir(dir.path(), &mut BrightnessEncoder).unwrap();

        let query = Embedding { values: vec![225.0, 30.0], model_version: None };
        let result = gallery.identify(&query, &CosineMatcher, 0.9);
        assert_eq!(result.identity.as_deref(), Some("light"));
    }

    #[test]
    fn test_empty_gallery_never_matches() {
        let gallery = Gallery::default();
        assert!(gallery.is_empty());
        let query = Embedding { values: vec![1.0, 0.0], model_version: None };
        assert!(!gallery.identify(&query, &CosineMatcher, 0.0).matched);
    }
}
