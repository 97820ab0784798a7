use crate::frame::RasterImage;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Default maximum accepted embedding distance.
pub const DEFAULT_THRESHOLD: f32 = 0.8;

/// Distance reported when no valid comparison was possible.
pub const UNAVAILABLE_DISTANCE: f32 = -1.0;

/// Bounding box for a detected face, in image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Box without confidence or landmarks, as supplied by callers that
    /// already ran their own detector.
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
            confidence: 1.0,
            landmarks: None,
        }
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    /// Euclidean distance between two embeddings, or `None` when their
    /// dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }

    /// Scale to unit L2 norm. Zero vectors are left untouched.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
        self
    }
}

/// A known user with a precomputed reference embedding.
///
/// Equality and hashing consider `id` only, so the same identity reached
/// through several faces collapses to one entry in a set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub name: String,
    pub embedding: Embedding,
    #[serde(default)]
    pub created_at: String,
}

impl IdentityRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            embedding,
            created_at: String::new(),
        }
    }
}

impl PartialEq for IdentityRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for IdentityRecord {}

impl Hash for IdentityRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Best registry entry for one face and its distance.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub identity: Option<IdentityRecord>,
    /// Non-negative embedding distance, or negative when no valid
    /// comparison was possible.
    pub distance: f32,
}

impl MatchResult {
    pub fn new(identity: IdentityRecord, distance: f32) -> Self {
        Self {
            identity: Some(identity),
            distance,
        }
    }

    /// Sentinel result: comparison was not possible for this face.
    pub fn unavailable() -> Self {
        Self {
            identity: None,
            distance: UNAVAILABLE_DISTANCE,
        }
    }

    pub fn is_available(&self) -> bool {
        self.distance >= 0.0
    }
}

/// Acceptance law for a single face: `0 <= distance < threshold`.
///
/// The lower bound is what keeps the unavailable sentinel from ever being
/// accepted, whatever the threshold.
pub fn accepts(distance: f32, threshold: f32) -> bool {
    distance >= 0.0 && distance < threshold
}

/// Result of one recognition call.
#[derive(Debug, Clone, Default)]
pub struct RecognitionOutcome {
    /// Identities accepted in this frame, one entry per identity.
    pub matched: HashSet<IdentityRecord>,
    /// Distance of the most recently processed face, even on a miss.
    pub last_distance: Option<f32>,
    pub any_match: bool,
}

impl RecognitionOutcome {
    /// Names of the matched identities, sorted for stable display.
    pub fn matched_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.matched.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("face detector unavailable: {0}")]
    Unavailable(String),
    #[error("face detection failed: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Produces face bounding boxes for an upright raster.
pub trait FaceDetector {
    fn detect(&mut self, image: &RasterImage) -> Result<Vec<BoundingBox>, DetectionError>;
}

/// Finds the registry entry closest to a cropped face.
///
/// A matcher that cannot compare (no embedding, empty registry, backend
/// failure) returns [`MatchResult::unavailable`] instead of an error.
pub trait IdentityMatcher {
    fn best_match(&mut self, face: &RasterImage, registry: &[IdentityRecord]) -> MatchResult;

    /// Free backend resources. Called once by the owning pipeline.
    fn release(&mut self) {}
}

/// Search a registry for the record closest to `probe` by Euclidean distance.
///
/// Every record is visited. Records whose embedding dimension differs from
/// the probe are skipped. Returns the unavailable sentinel when nothing was
/// comparable.
pub fn nearest_identity(probe: &Embedding, registry: &[IdentityRecord]) -> MatchResult {
    let mut best: Option<(usize, f32)> = None;

    for (i, record) in registry.iter().enumerate() {
        let Some(distance) = probe.euclidean_distance(&record.embedding) else {
            tracing::debug!(
                id = %record.id,
                probe_dim = probe.values.len(),
                record_dim = record.embedding.values.len(),
                "skipping identity with mismatched embedding dimension"
            );
            continue;
        };
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((i, distance));
        }
    }

    match best {
        Some((idx, distance)) => MatchResult::new(registry[idx].clone(), distance),
        None => MatchResult::unavailable(),
    }
}
