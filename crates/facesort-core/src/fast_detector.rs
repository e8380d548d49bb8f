//! Fast-tier face detector: SeetaFace funnel cascade via `rustface`.
//!
//! Runs on the luminance plane, favours speed over recall on hard poses,
//! and returns boxes without landmarks.

use crate::preprocess;
use crate::types::BoundingBox;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

const MIN_FACE_SIZE: u32 = 20;
const SCORE_THRESHOLD: f64 = 2.0;
const PYRAMID_SCALE_FACTOR: f32 = 0.8;
const SLIDE_WINDOW_STEP: u32 = 4;

#[derive(Error, Debug)]
pub enum FastDetectorError {
    #[error("model file not found: {0}; download seeta_fd_frontal_v1.0.bin")]
    ModelNotFound(String),
    #[error("failed to load SeetaFace model {path}: {reason}")]
    ModelLoad { path: String, reason: String },
}

/// SeetaFace-based face detector.
pub struct FastFaceDetector {
    detector: Box<dyn rustface::Detector>,
}

impl FastFaceDetector {
    /// Load the SeetaFace frontal model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, FastDetectorError> {
        if !model_path.exists() {
            return Err(FastDetectorError::ModelNotFound(model_path.display().to_string()));
        }
        let path = model_path.to_string_lossy();

        let mut detector =
            rustface::create_detector(&path).map_err(|e| FastDetectorError::ModelLoad {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        detector.set_min_face_size(MIN_FACE_SIZE);
        detector.set_score_thresh(SCORE_THRESHOLD);
        detector.set_pyramid_scale_factor(PYRAMID_SCALE_FACTOR);
        detector.set_slide_window_step(SLIDE_WINDOW_STEP, SLIDE_WINDOW_STEP);

        tracing::info!(path = %model_path.display(), "loaded SeetaFace model");
        Ok(Self { detector })
    }

    /// Detect faces, sorted by descending score.
    pub fn detect(&mut self, image: &RgbImage) -> Vec<BoundingBox> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let gray = preprocess::luminance(image);
        let faces = self.detector.detect(&rustface::ImageData::new(&gray, width, height));

        let mut boxes: Vec<BoundingBox> = faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                BoundingBox {
                    x: bbox.x() as f32,
                    y: bbox.y() as f32,
                    width: bbox.width() as f32,
                    height: bbox.height() as f32,
                    confidence: face.score() as f32,
                    landmarks: None,
                }
            })
            .collect();
        boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        boxes
    }
}
