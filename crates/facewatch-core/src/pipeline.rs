//! Frame-to-identity recognition pipeline.
//!
//! One call decodes and rotates a frame, crops every detected face, asks the
//! [`IdentityMatcher`] for the closest registry entry and accumulates the
//! faces whose distance falls under the threshold. Faces are processed
//! sequentially on the calling thread; the caller is expected to keep at
//! most one call in flight per pipeline.

use crate::crop::{self, CropError};
use crate::frame::{self, DecodeError, RasterImage, RawFrame};
use crate::orientation::{self, RotationPolicy};
use crate::types::{
    accepts, BoundingBox, DetectionError, FaceDetector, IdentityMatcher, IdentityRecord,
    RecognitionOutcome, DEFAULT_THRESHOLD,
};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("frame decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error("pipeline has been disposed")]
    Disposed,
}

/// Construction parameters for a [`RecognitionPipeline`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Maximum accepted distance (exclusive).
    pub threshold: f32,
    /// Camera sensor mounting angle in degrees.
    pub sensor_orientation: i32,
    /// Initial device rotation compensation in degrees.
    pub rotation_compensation: i32,
    pub rotation_policy: RotationPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            sensor_orientation: 0,
            rotation_compensation: 0,
            rotation_policy: RotationPolicy::SensorOnly,
        }
    }
}

/// Input image for one recognition call.
pub enum FrameSource<'a> {
    Raw(RawFrame<'a>),
    Decoded(RasterImage),
}

impl<'a> From<RawFrame<'a>> for FrameSource<'a> {
    fn from(frame: RawFrame<'a>) -> Self {
        Self::Raw(frame)
    }
}

impl From<RasterImage> for FrameSource<'_> {
    fn from(image: RasterImage) -> Self {
        Self::Decoded(image)
    }
}

pub struct RecognitionPipeline<M: IdentityMatcher> {
    matcher: M,
    registry: Vec<IdentityRecord>,
    config: PipelineConfig,
    last_distance: Option<f32>,
    last_recognized: Option<IdentityRecord>,
    accumulator: HashSet<IdentityRecord>,
    disposed: bool,
}

impl<M: IdentityMatcher> RecognitionPipeline<M> {
    pub fn new(matcher: M, registry: Vec<IdentityRecord>, config: PipelineConfig) -> Self {
        tracing::info!(
            identities = registry.len(),
            threshold = config.threshold,
            sensor_orientation = config.sensor_orientation,
            rotation_compensation = config.rotation_compensation,
            policy = ?config.rotation_policy,
            "recognition pipeline created"
        );
        Self {
            matcher,
            registry,
            config,
            last_distance: None,
            last_recognized: None,
            accumulator: HashSet::new(),
            disposed: false,
        }
    }

    /// Decode and rotate a frame to the upright raster faces are cropped from.
    pub fn prepare(&self, source: FrameSource<'_>) -> Result<RasterImage, PipelineError> {
        let image = match source {
            FrameSource::Raw(raw) => frame::decode(&raw)?,
            FrameSource::Decoded(image) => image,
        };
        Ok(orientation::rotate(image, self.rotation_angle() as f32))
    }

    /// Match the faces under `boxes` in a frame.
    ///
    /// Boxes are in the coordinates of the orientation-corrected image.
    /// A face whose box falls outside the image is skipped; the others
    /// are still processed.
    pub fn recognize_faces(
        &mut self,
        source: FrameSource<'_>,
        boxes: &[BoundingBox],
    ) -> Result<RecognitionOutcome, PipelineError> {
        self.ensure_live()?;
        self.accumulator.clear();
        let image = self.prepare(source)?;
        Ok(self.match_faces(&image, boxes))
    }

    /// Run `detector` on the corrected frame, then match every detected face.
    pub fn recognize_frame(
        &mut self,
        source: FrameSource<'_>,
        detector: &mut dyn FaceDetector,
    ) -> Result<RecognitionOutcome, PipelineError> {
        self.ensure_live()?;
        self.accumulator.clear();
        let image = self.prepare(source)?;
        let boxes = detector.detect(&image)?;
        Ok(self.match_faces(&image, &boxes))
    }

    fn match_faces(&mut self, image: &RasterImage, boxes: &[BoundingBox]) -> RecognitionOutcome {
        for (index, bbox) in boxes.iter().enumerate() {
            let face = match crop::crop(image, bbox) {
                Ok(face) => face,
                Err(err @ CropError::OutOfBounds { .. }) => {
                    tracing::warn!(face = index, error = %err, "skipping face");
                    continue;
                }
            };

            let result = self.matcher.best_match(&face, &self.registry);
            self.last_distance = Some(result.distance);

            if !result.is_available() {
                tracing::debug!(face = index, "no valid comparison for face");
                continue;
            }

            match result.identity {
                Some(identity) if accepts(result.distance, self.config.threshold) => {
                    tracing::debug!(
                        face = index,
                        id = %identity.id,
                        name = %identity.name,
                        distance = result.distance,
                        "face recognized"
                    );
                    self.last_recognized = Some(identity.clone());
                    self.accumulator.insert(identity);
                }
                _ => {
                    tracing::debug!(face = index, distance = result.distance, "face not recognized");
                }
            }
        }

        RecognitionOutcome {
            matched: self.accumulator.clone(),
            last_distance: self.last_distance,
            any_match: !self.accumulator.is_empty(),
        }
    }

    /// Release matcher resources. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.accumulator.clear();
        self.matcher.release();
        tracing::info!("recognition pipeline disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Angle applied to the next frame under the configured policy.
    pub fn rotation_angle(&self) -> i32 {
        self.config
            .rotation_policy
            .angle(self.config.sensor_orientation, self.config.rotation_compensation)
    }

    pub fn set_rotation_compensation(&mut self, degrees: i32) {
        self.config.rotation_compensation = degrees;
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.config.threshold = threshold;
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    /// Add or replace (by id) an identity.
    pub fn register(&mut self, record: IdentityRecord) {
        match self.registry.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record,
            None => self.registry.push(record),
        }
    }

    /// Remove an identity by id, returning it if present.
    pub fn remove(&mut self, id: &str) -> Option<IdentityRecord> {
        let pos = self.registry.iter().position(|r| r.id == id)?;
        Some(self.registry.remove(pos))
    }

    pub fn registry(&self) -> &[IdentityRecord] {
        &self.registry
    }

    /// Distance of the most recently matched face in any call so far.
    pub fn last_distance(&self) -> Option<f32> {
        self.last_distance
    }

    /// Identity most recently accepted in any call so far.
    pub fn last_recognized(&self) -> Option<&IdentityRecord> {
        self.last_recognized.as_ref()
    }

    fn ensure_live(&self) -> Result<(), PipelineError> {
        if self.disposed {
            Err(PipelineError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl<M: IdentityMatcher> Drop for RecognitionPipeline<M> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::types::{Embedding, MatchResult};
    use image::Rgb;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Replays scripted (registry index, distance) answers, one per face.
    struct ScriptedMatcher {
        answers: VecDeque<(usize, f32)>,
        calls: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        seen_sizes: Vec<(u32, u32)>,
    }

    impl ScriptedMatcher {
        fn new(answers: &[(usize, f32)]) -> Self {
            Self {
                answers: answers.iter().copied().collect(),
                calls: Arc::new(AtomicUsize::new(0)),
                releases: Arc::new(AtomicUsize::new(0)),
                seen_sizes: Vec::new(),
            }
        }
    }

    impl IdentityMatcher for ScriptedMatcher {
        fn best_match(&mut self, face: &RasterImage, registry: &[IdentityRecord]) -> MatchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_sizes.push(face.dimensions());
            match self.answers.pop_front() {
                Some((idx, distance)) if distance >= 0.0 => {
                    MatchResult::new(registry[idx].clone(), distance)
                }
                Some((_, distance)) => MatchResult { identity: None, distance },
                None => MatchResult::unavailable(),
            }
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FixedDetector(Vec<BoundingBox>);

    impl FaceDetector for FixedDetector {
        fn detect(&mut self, _image: &RasterImage) -> Result<Vec<BoundingBox>, DetectionError> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl FaceDetector for FailingDetector {
        fn detect(&mut self, _image: &RasterImage) -> Result<Vec<BoundingBox>, DetectionError> {
            Err(DetectionError::Unavailable("model not loaded".into()))
        }
    }

    fn registry() -> Vec<IdentityRecord> {
        let e = |v: f32| Embedding { values: vec![v, 0.0], model_version: None };
        vec![IdentityRecord::new("alice", "Alice", e(1.0)), IdentityRecord::new("bob", "Bob", e(-1.0))]
    }

    fn frame() -> RasterImage {
        RasterImage::from_pixel(64, 48, Rgb([90, 90, 90]))
    }

    fn face_box() -> BoundingBox {
        BoundingBox::new(8.0, 8.0, 16.0, 16.0)
    }

    fn pipeline(answers: &[(usize, f32)]) -> RecognitionPipeline<ScriptedMatcher> {
        RecognitionPipeline::new(ScriptedMatcher::new(answers), registry(), PipelineConfig::default())
    }

    #[test]
    fn test_alice_recognized_under_threshold() {
        let mut p = pipeline(&[(0, 0.3)]);
        let outcome = p.recognize_faces(frame().into(), &[face_box()]).unwrap();
        assert!(outcome.any_match);
        assert_eq!(outcome.matched_names(), vec!["Alice"]);
        assert_eq!(outcome.last_distance, Some(0.3));
        assert_eq!(p.last_recognized().map(|r| r.name.as_str()), Some("Alice"));
    }

    #[test]
    fn test_alice_rejected_over_threshold() {
        let mut p = pipeline(&[(0, 0.95)]);
        let outcome = p.recognize_faces(frame().into(), &[face_box()]).unwrap();
        assert!(!outcome.any_match);
        assert!(outcome.matched.is_empty());
        assert_eq!(outcome.last_distance, Some(0.95));
    }

    #[test]
    fn test_threshold_law() {
        let cases = [(0.0, 0.8, true), (0.8, 0.8, false), (-0.01, 1.0, false), (0.5, 1.0, true)];
        for (distance, threshold, expected) in cases {
            let mut p = pipeline(&[(0, distance)]);
            p.set_threshold(threshold);
            let outcome = p.recognize_faces(frame().into(), &[face_box()]).unwrap();
            assert_eq!(outcome.any_match, expected, "d={distance} t={threshold}");
        }
    }

    #[test]
    fn test_same_identity_twice_collapses() {
        let mut p = pipeline(&[(0, 0.2), (0, 0.4)]);
        let boxes = [face_box(), BoundingBox::new(30.0, 10.0, 20.0, 20.0)];
        let outcome = p.recognize_faces(frame().into(), &boxes).unwrap();
        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.last_distance, Some(0.4));
    }

    #[test]
    fn test_two_identities_in_one_frame() {
        let mut p = pipeline(&[(0, 0.2), (1, 0.5), (1, 0.9)]);
        let boxes = [face_box(), face_box(), face_box()];
        let outcome = p.recognize_faces(frame().into(), &boxes).unwrap();
        assert_eq!(outcome.matched_names(), vec!["Alice", "Bob"]);
        // Last face missed but still drives the feedback distance
        assert_eq!(outcome.last_distance, Some(0.9));
    }

    #[test]
    fn test_out_of_bounds_face_skipped_others_processed() {
        let mut p = pipeline(&[(1, 0.1)]);
        let boxes = [BoundingBox::new(50.0, 40.0, 30.0, 30.0), face_box()];
        let outcome = p.recognize_faces(frame().into(), &boxes).unwrap();
        assert_eq!(outcome.matched_names(), vec!["Bob"]);
        assert_eq!(p.matcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.matcher.seen_sizes, vec![(16, 16)]);
    }

    #[test]
    fn test_unavailable_match_never_accepted() {
        let mut p = pipeline(&[(0, -1.0)]);
        p.set_threshold(f32::MAX);
        let outcome = p.recognize_faces(frame().into(), &[face_box()]).unwrap();
        assert!(!outcome.any_match);
        assert_eq!(outcome.last_distance, Some(-1.0));
    }

    #[test]
    fn test_outcome_is_fresh_each_call() {
        let mut p = pipeline(&[(0, 0.1), (0, 0.9)]);
        assert!(p.recognize_faces(frame().into(), &[face_box()]).unwrap().any_match);
        let second = p.recognize_faces(frame().into(), &[face_box()]).unwrap();
        assert!(!second.any_match);
        assert!(second.matched.is_empty());
        // Identity of the earlier hit is still reported as last recognized.
        assert_eq!(p.last_recognized().map(|r| r.id.as_str()), Some("alice"));
    }

    #[test]
    fn test_no_faces_keeps_last_distance() {
        let mut p = pipeline(&[(0, 0.42)]);
        p.recognize_faces(frame().into(), &[face_box()]).unwrap();
        let outcome = p.recognize_faces(frame().into(), &[]).unwrap();
        assert!(!outcome.any_match);
        assert!(outcome.matched.is_empty());
        assert_eq!(outcome.last_distance, Some(0.42));
    }

    #[test]
    fn test_no_faces_before_any_distance() {
        let mut p = pipeline(&[]);
        let outcome = p.recognize_faces(frame().into(), &[]).unwrap();
        assert_eq!(outcome.last_distance, None);
    }

    #[test]
    fn test_unsupported_raw_format_is_frame_fatal_only() {
        let mut p = pipeline(&[(0, 0.1)]);
        let data = vec![0u8; 64];
        let raw = RawFrame::new(&data, 4, 4, PixelFormat::Other(0x32315659));
        let err = p.recognize_faces(raw.into(), &[face_box()]).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(DecodeError::UnsupportedFormat(0x32315659))));

        // Pipeline still serves the next frame.
        let outcome = p.recognize_faces(frame().into(), &[face_box()]).unwrap();
        assert!(outcome.any_match);
    }

    #[test]
    fn test_raw_frame_decoded_and_rotated() {
        let config = PipelineConfig {
            sensor_orientation: 90,
            rotation_compensation: 180,
            rotation_policy: RotationPolicy::Compensated,
            ..PipelineConfig::default()
        };
        let mut p = RecognitionPipeline::new(ScriptedMatcher::new(&[(0, 0.1)]), registry(), config);
        assert_eq!(p.rotation_angle(), 270);

        // 8x4 NV21, neutral chroma
        let mut data = vec![128u8; 32];
        data.extend_from_slice(&[128u8; 16]);
        let raw = RawFrame::new(&data, 8, 4, PixelFormat::Nv21);
        // After a quarter turn the frame is 4 wide and 8 tall.
        let outcome = p.recognize_faces(raw.into(), &[BoundingBox::new(0.0, 0.0, 4.0, 8.0)]).unwrap();
        assert!(outcome.any_match);

        p.set_rotation_compensation(0);
        assert_eq!(p.rotation_angle(), 90);
    }

    #[test]
    fn test_recognize_frame_uses_detector() {
        let mut p = pipeline(&[(1, 0.3)]);
        let mut detector = FixedDetector(vec![face_box()]);
        let outcome = p.recognize_frame(frame().into(), &mut detector).unwrap();
        assert_eq!(outcome.matched_names(), vec!["Bob"]);
    }

    #[test]
    fn test_detector_failure_is_frame_fatal() {
        let mut p = pipeline(&[(0, 0.1)]);
        let err = p.recognize_frame(frame().into(), &mut FailingDetector).unwrap_err();
        assert!(matches!(err, PipelineError::Detection(_)));
    }

    #[test]
    fn test_dispose_idempotent() {
        let mut p = pipeline(&[]);
        let releases = p.matcher.releases.clone();
        p.dispose();
        p.dispose();
        assert!(p.is_disposed());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        drop(p);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_without_any_recognition() {
        let p = pipeline(&[]);
        let releases = p.matcher.releases.clone();
        drop(p);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recognize_after_dispose_fails() {
        let mut p = pipeline(&[(0, 0.1)]);
        p.dispose();
        let err = p.recognize_faces(frame().into(), &[face_box()]).unwrap_err();
        assert!(matches!(err, PipelineError::Disposed));
    }

    #[test]
    fn test_register_replaces_by_id_and_remove() {
        let mut p = pipeline(&[]);
        let e = Embedding { values: vec![0.0, 1.0], model_version: None };
        p.register(IdentityRecord::new("alice", "Alice B.", e.clone()));
        p.register(IdentityRecord::new("carol", "Carol", e));
        assert_eq!(p.registry().len(), 3);
        assert_eq!(p.registry()[0].name, "Alice B.");
        assert_eq!(p.remove("bob").map(|r| r.name), Some("Bob".to_string()));
        assert!(p.remove("bob").is_none());
        assert_eq!(p.registry().len(), 2);
    }
}
