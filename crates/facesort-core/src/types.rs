use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    /// Only the accurate tier produces them.
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Intersection-over-Union with another box, 0.0 for degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        let inter_w = (right - self.x.max(other.x)).max(0.0);
        let inter_h = (bottom - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.width * self.height + other.width * other.height - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A face found in a candidate image together with its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// One known identity: the reference file it came from and its face embedding.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceIdentity {
    source: String,
    embedding: Embedding,
}

impl ReferenceIdentity {
    /// Returns `None` for an empty embedding; such identities are never stored.
    pub fn new(source: impl Into<String>, embedding: Embedding) -> Option<Self> {
        if embedding.is_empty() {
            return None;
        }
        Some(Self {
            source: source.into(),
            embedding,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }
}

#[derive(Error, Debug)]
#[error("no valid face embeddings found in the reference images")]
pub struct NoReferenceFaces;

/// Immutable, non-empty set of reference identities built once per run.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    identities: Vec<ReferenceIdentity>,
}

impl ReferenceSet {
    pub fn new(identities: Vec<ReferenceIdentity>) -> Result<Self, NoReferenceFaces> {
        if identities.is_empty() {
            return Err(NoReferenceFaces);
        }
        Ok(Self { identities })
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Always false: construction rejects an empty set.
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceIdentity> {
        self.identities.iter()
    }

    pub fn embeddings(&self) -> impl Iterator<Item = &Embedding> {
        self.identities.iter().map(ReferenceIdentity::embedding)
    }
}

/// Terminal classification of a candidate image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Matched,
    Unmatched,
}

impl fmt::Display for MatchDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchDecision::Matched => write!(f, "matched"),
            MatchDecision::Unmatched => write!(f, "unmatched"),
        }
    }
}

/// Detector quality/latency tier.
///
/// `Accurate` is typically an order of magnitude slower than `Fast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorTier {
    Fast,
    Accurate,
}

impl DetectorTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorTier::Fast => "fast",
            DetectorTier::Accurate => "accurate",
        }
    }
}

impl fmt::Display for DetectorTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(DetectorTier::Fast),
            "accurate" => Ok(DetectorTier::Accurate),
            _ => Err(ParseEnumError(s.to_string())),
        }
    }
}

/// How candidates flow through the detector tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineMode {
    /// Strategy B, fast tier, decide once.
    SinglePass,
    /// Strategy A, fast tier, then the accurate tier for anything not matched.
    #[default]
    Cascade,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::SinglePass => "single-pass",
            PipelineMode::Cascade => "cascade",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "single-pass" | "single" => Ok(PipelineMode::SinglePass),
            "cascade" | "two-stage" => Ok(PipelineMode::Cascade),
            _ => Err(ParseEnumError(s.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unrecognized value: {0}")]
pub struct ParseEnumError(String);
