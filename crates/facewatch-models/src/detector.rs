//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an upright RGB raster into the 640×640 model input, decodes
//! the three anchor-free stride heads and suppresses overlapping boxes.

use facewatch_core::{BoundingBox, DetectionError, FaceDetector, RasterImage};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_REQUIRED_OUTPUTS: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface and place in models/)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<DetectorError> for DetectionError {
    fn from(err: DetectorError) -> Self {
        DetectionError::Failed(Box::new(err))
    }
}

/// Scale and padding applied when fitting a frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, input: usize) -> Self {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (input as f32 - new_w) / 2.0,
            pad_y: (input as f32 - new_h) / 2.0,
        }
    }

    /// Map a point from model input space back to frame space.
    fn to_frame(self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions of one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

pub struct ScrfdDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
    confidence_threshold: f32,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < SCRFD_REQUIRED_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires {SCRFD_REQUIRED_OUTPUTS} outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let outputs = discover_outputs(&output_names);
        tracing::debug!(?outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            outputs,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
        })
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn run(&mut self, image: &RasterImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image, SCRFD_INPUT_SIZE);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.outputs.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(head.score, "scores")?;
            let bboxes = extract(head.bbox, "bboxes")?;
            let kps = extract(head.kps, "kps")?;

            candidates.extend(decode_stride(
                StrideTensors { scores, bboxes, kps },
                stride,
                SCRFD_INPUT_SIZE,
                letterbox,
                self.confidence_threshold,
            ));
        }

        let kept = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = kept.len(), "SCRFD detections");
        Ok(kept)
    }
}

impl FaceDetector for ScrfdDetector {
    /// Detect faces, most confident first.
    fn detect(&mut self, image: &RasterImage) -> Result<Vec<BoundingBox>, DetectionError> {
        Ok(self.run(image)?)
    }
}

/// Letterbox an RGB raster into a normalized NCHW tensor.
fn preprocess(image: &RasterImage, input: usize) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let letterbox = Letterbox::fit(width, height, input);

    let new_w = ((width as f32 * letterbox.scale).round() as u32).clamp(1, input as u32);
    let new_h = ((height as f32 * letterbox.scale).round() as u32).clamp(1, input as u32);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding is filled with the mean so it normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, input, input));
    let x0 = letterbox.pad_x.floor() as usize;
    let y0 = letterbox.pad_y.floor() as usize;

    for y in 0..input {
        for x in 0..input {
            let inside = y >= y0 && y < y0 + new_h as usize && x >= x0 && x < x0 + new_w as usize;
            for c in 0..3 {
                let pixel = if inside {
                    resized.get_pixel((x - x0) as u32, (y - y0) as u32).0[c] as f32
                } else {
                    SCRFD_MEAN
                };
                tensor[[0, c, y, x]] = (pixel - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Map output names to stride heads.
///
/// Exports named `score_8`, `bbox_16`, `kps_32`, ... are mapped by name in any
/// order; anything else falls back to positional `[scores ×3, bboxes ×3, kps ×3]`.
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride)?,
            })
        })
        .collect();

    match named.and_then(|heads| <[StrideOutputs; 3]>::try_from(heads).ok()) {
        Some(heads) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            heads
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideOutputs { score: i, bbox: i + 3, kps: i + 6 })
        }
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode the candidates of one stride head above `threshold`.
fn decode_stride(
    t: StrideTensors<'_>,
    stride: usize,
    input: usize,
    letterbox: Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *t.scores.get(idx)?;
            if score <= threshold {
                return None;
            }

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * step;
            let ay = (cell / grid) as f32 * step;

            let d = t.bboxes.get(idx * 4..idx * 4 + 4)?;
            let (left, top) = letterbox.to_frame(ax - d[0] * step, ay - d[1] * step);
            let (right, bottom) = letterbox.to_frame(ax + d[2] * step, ay + d[3] * step);

            let landmarks = t.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.to_frame(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step))
            });

            Some(BoundingBox {
                left,
                top,
                width: right - left,
                height: bottom - top,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.left.max(b.left);
    let y1 = a.top.max(b.top);
    let x2 = (a.left + a.width).min(b.left + b.width);
    let y2 = (a.top + a.height).min(b.top + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 { inter / union } else { 0.0 }
}
