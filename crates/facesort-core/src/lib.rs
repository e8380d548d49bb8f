//! facesort-core: sort photos by whether they contain a known face.
//!
//! Reference images are encoded into a [`ReferenceSet`]; candidates are
//! preprocessed, run through a fast SeetaFace tier and, in cascade mode, an
//! accurate SCRFD tier, encoded with ArcFace and matched by Euclidean
//! distance. The [`cascade::CascadeController`] routes every candidate to the
//! matched or unmatched folder, or leaves it in place when it fails.

pub mod alignment;
pub mod cascade;
pub mod detector;
pub mod discovery;
pub mod fast_detector;
pub mod matcher;
pub mod oracle;
pub mod preprocess;
pub mod recognizer;
pub mod reference;
pub mod router;
pub mod types;

pub use cascade::{CandidateReport, CascadeController, PipelineConfig, RunSummary};
pub use oracle::{FaceOracle, OnnxOracle};
pub use preprocess::{PreprocessConfig, PreprocessStrategy};
pub use router::{FsRouter, Router};
pub use types::{
    BoundingBox, DetectedFace, DetectorTier, Embedding, MatchDecision, PipelineMode,
    ReferenceIdentity, ReferenceSet,
};
