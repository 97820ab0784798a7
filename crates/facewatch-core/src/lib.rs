//! facewatch-core: frame-to-identity recognition pipeline.
//!
//! Decodes camera-native frames (packed BGRA, NV21) to RGB, corrects sensor
//! orientation, crops detected faces and matches them against a registry of
//! known identities. Face detection and embedding are supplied through the
//! [`FaceDetector`] and [`IdentityMatcher`] traits.

pub mod crop;
pub mod frame;
pub mod orientation;
pub mod pipeline;
pub mod types;

pub use crop::{crop, CropError};
pub use frame::{decode, DecodeError, PixelFormat, RasterImage, RawFrame};
pub use orientation::{rotate, RotationPolicy};
pub use pipeline::{FrameSource, PipelineConfig, PipelineError, RecognitionPipeline};
pub use types::{
    accepts, nearest_identity, BoundingBox, DetectionError, Embedding, FaceDetector,
    IdentityMatcher, IdentityRecord, MatchResult, RecognitionOutcome, DEFAULT_THRESHOLD,
};
