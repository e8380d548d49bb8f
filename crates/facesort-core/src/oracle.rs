//! Detector/encoder boundary.
//!
//! [`FaceOracle`] is the contract the pipeline depends on: regions for an
//! image at a given tier, and one embedding per region. Zero faces is a
//! normal `Ok(vec![])`; a failed call is always an `Err`.

use crate::detector::{DetectorError, FaceDetector};
use crate::fast_detector::{FastDetectorError, FastFaceDetector};
use crate::matcher;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, DetectedFace, DetectorTier, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

pub const FAST_MODEL_FILE: &str = "seeta_fd_frontal_v1.0.bin";
pub const ACCURATE_MODEL_FILE: &str = "det_10g.onnx";
pub const ENCODER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Cosine similarity at which two ArcFace embeddings show the same person.
pub const ARCFACE_MATCH_COSINE: f32 = 0.40;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("fast detector: {0}")]
    FastDetector(#[from] FastDetectorError),
    #[error("accurate detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("encoder: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0} detector tier is not loaded")]
    TierUnavailable(DetectorTier),
    #[error("encoder returned {got} embeddings for {expected} regions")]
    EmbeddingCount { expected: usize, got: usize },
}

/// Face detection and encoding capability, in two quality tiers.
///
/// Implementations must be deterministic per call: the same image and tier
/// yield the same regions and embeddings.
pub trait FaceOracle {
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        tier: DetectorTier,
    ) -> Result<Vec<BoundingBox>, OracleError>;

    /// One embedding per region, in region order.
    fn encode_faces(
        &mut self,
        image: &RgbImage,
        regions: &[BoundingBox],
    ) -> Result<Vec<Embedding>, OracleError>;

    fn detect_and_encode(
        &mut self,
        image: &RgbImage,
        tier: DetectorTier,
    ) -> Result<Vec<DetectedFace>, OracleError> {
        let regions = self.detect_faces(image, tier)?;
        if regions.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self.encode_faces(image, &regions)?;
        if embeddings.len() != regions.len() {
            return Err(OracleError::EmbeddingCount {
                expected: regions.len(),
                got: embeddings.len(),
            });
        }
        Ok(regions
            .into_iter()
            .zip(embeddings)
            .map(|(region, embedding)| DetectedFace { region, embedding })
            .collect())
    }
}

/// Scale applied to unit-length ArcFace embeddings before matching.
///
/// For unit vectors `|a - b| = sqrt(2 - 2 cos)`. Scaling both sides by
/// `DEFAULT_TOLERANCE / sqrt(2 - 2 * ARCFACE_MATCH_COSINE)` makes the default
/// Euclidean tolerance accept exactly the pairs at or above that cosine. A
/// custom tolerance `t` accepts cosines of at least `1 - (t / scale)^2 / 2`.
pub fn arcface_distance_scale() -> f32 {
    matcher::DEFAULT_TOLERANCE / (2.0 - 2.0 * ARCFACE_MATCH_COSINE).sqrt()
}

fn to_match_space(mut embedding: Embedding) -> Embedding {
    let scale = arcface_distance_scale();
    embedding.values.iter_mut().for_each(|v| *v *= scale);
    embedding
}

/// Production oracle: SeetaFace (fast), SCRFD (accurate), ArcFace (encoder).
pub struct OnnxOracle {
    fast: FastFaceDetector,
    accurate: Option<FaceDetector>,
    recognizer: FaceRecognizer,
}

impl OnnxOracle {
    /// Load models from `model_dir`. The SCRFD model is only loaded when
    /// `with_accurate` is set, since single-pass runs never use it.
    pub fn load(model_dir: &Path, with_accurate: bool) -> Result<Self, OracleError> {
        let fast = FastFaceDetector::load(&model_dir.join(FAST_MODEL_FILE))?;
        let accurate = if with_accurate {
            Some(FaceDetector::load(&model_dir.join(ACCURATE_MODEL_FILE))?)
        } else {
            None
        };
        let recognizer = FaceRecognizer::load(&model_dir.join(ENCODER_MODEL_FILE))?;
        Ok(Self {
            fast,
            accurate,
            recognizer,
        })
    }

    /// Model paths this oracle would load from `model_dir`.
    pub fn model_paths(model_dir: &Path, with_accurate: bool) -> Vec<PathBuf> {
        let mut files = vec![FAST_MODEL_FILE, ENCODER_MODEL_FILE];
        if with_accurate {
            files.push(ACCURATE_MODEL_FILE);
        }
        files.into_iter().map(|f| model_dir.join(f)).collect()
    }
}

impl FaceOracle for OnnxOracle {
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        tier: DetectorTier,
    ) -> Result<Vec<BoundingBox>, OracleError> {
        let started = Instant::now();
        let faces = match tier {
            DetectorTier::Fast => self.fast.detect(image),
            DetectorTier::Accurate => self
                .accurate
                .as_mut()
                .ok_or(OracleError::TierUnavailable(tier))?
                .detect(image)?,
        };
        tracing::debug!(
            %tier,
            faces = faces.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "detect"
        );
        Ok(faces)
    }

    /// ArcFace embeddings, rescaled onto the matcher's distance scale.
    fn encode_faces(
        &mut self,
        image: &RgbImage,
        regions: &[BoundingBox],
    ) -> Result<Vec<Embedding>, OracleError> {
        regions
            .iter()
            .map(|face| Ok(to_match_space(self.recognizer.extract(image, face)?)))
            .collect()
    }
}
