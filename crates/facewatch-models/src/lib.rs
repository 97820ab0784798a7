//! facewatch-models: ONNX Runtime backends for face detection and matching.
//!
//! SCRFD provides [`facewatch_core::FaceDetector`]; ArcFace provides
//! [`facewatch_core::IdentityMatcher`].

use std::path::PathBuf;

pub mod detector;
pub mod recognizer;

pub use detector::{DetectorError, ScrfdDetector};
pub use recognizer::{ArcFaceMatcher, RecognizerError};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/facewatch/models`, falling back
/// to `~/.local/share/facewatch/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("facewatch")
        .join("models")
}
