//! ArcFace identity matcher via ONNX Runtime.
//!
//! Embeds a cropped face with the w600k_r50 ArcFace model and returns the
//! registry entry at the smallest Euclidean distance.

use facewatch_core::{
    nearest_identity, Embedding, IdentityMatcher, IdentityRecord, MatchResult, RasterImage,
};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface and place in models/)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model session already released")]
    Released,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct ArcFaceMatcher {
    /// `None` once released.
    session: Option<Session>,
}

impl ArcFaceMatcher {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session: Some(session) })
    }

    /// Compute the L2-normalized embedding of a cropped face.
    pub fn embed(&mut self, face: &RasterImage) -> Result<Embedding, RecognizerError> {
        let session = self.session.as_mut().ok_or(RecognizerError::Released)?;
        let input = preprocess(face);

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: raw.to_vec(),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        }
        .normalized())
    }
}

impl IdentityMatcher for ArcFaceMatcher {
    fn best_match(&mut self, face: &RasterImage, registry: &[IdentityRecord]) -> MatchResult {
        if registry.is_empty() {
            return MatchResult::unavailable();
        }
        match self.embed(face) {
            Ok(probe) => nearest_identity(&probe, registry),
            Err(err) => {
                tracing::warn!(error = %err, "embedding failed; face cannot be compared");
                MatchResult::unavailable()
            }
        }
    }

    fn release(&mut self) {
        if self.session.take().is_some() {
            tracing::info!("ArcFace session released");
        }
    }
}

/// Resize a face crop to 112×112 and normalize it into an NCHW RGB tensor.
fn preprocess(face: &RasterImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    let resized = imageops::resize(face, size as u32, size as u32, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = (value as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}
