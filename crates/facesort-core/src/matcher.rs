//! Euclidean tolerance matching against the reference set.

use crate::types::{Embedding, ReferenceSet};

/// Maximum embedding distance for two faces to count as the same identity.
pub const DEFAULT_TOLERANCE: f32 = 0.48;

/// Euclidean distance between two embeddings.
///
/// Embeddings of different lengths come from different models and are never
/// comparable; their distance is infinite.
pub fn distance(a: &Embedding, b: &Embedding) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.values
        .iter()
        .zip(b.values.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Distance to the closest reference.
pub fn nearest_distance(embedding: &Embedding, references: &ReferenceSet) -> Option<f32> {
    references
        .embeddings()
        .map(|r| distance(embedding, r))
        .min_by(f32::total_cmp)
}

/// True iff some reference lies within `tolerance`.
pub fn is_match(embedding: &Embedding, references: &ReferenceSet, tolerance: f32) -> bool {
    references
        .embeddings()
        .any(|r| distance(embedding, r) <= tolerance)
}

/// True iff any face of the image matches; stops at the first match.
pub fn image_matches<'a, I>(embeddings: I, references: &ReferenceSet, tolerance: f32) -> bool
where
    I: IntoIterator<Item = &'a Embedding>,
{
    embeddings
        .into_iter()
        .any(|e| is_match(e, references, tolerance))
}
