//! rollcall-core: face detection, recognition and gallery matching.
//!
//! Uses SCRFD for face detection and ArcFace for encodings, both running via
//! ONNX Runtime on the CPU, plus the enrolled gallery and frame annotation.

pub mod alignment;
pub mod annotate;
pub mod detector;
pub mod gallery;
pub mod pipeline;
pub mod recognizer;
pub mod resize;
pub mod types;

pub use annotate::{encode_jpeg, Annotator};
pub use detector::FaceDetector;
pub use gallery::{Gallery, GalleryError, SkippedImage};
pub use pipeline::{FaceEncoder, FacePipeline, PipelineError};
pub use recognizer::FaceRecognizer;
pub use types::{
    BoundingBox, CosineMatcher, DetectedFace, Embedding, GalleryEntry, LumaImage, MatchResult,
    Matcher, UNKNOWN_IDENTITY,
};

/// Default directory searched for the ONNX models.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/rollcall/models")
}
