//! Builds the reference set from labeled reference images.

use crate::oracle::{FaceOracle, OracleError};
use crate::preprocess::{self, PreprocessConfig, PreprocessStrategy};
use crate::types::{DetectorTier, NoReferenceFaces, ReferenceIdentity, ReferenceSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Preprocessing applied to every reference image.
pub const REFERENCE_STRATEGY: PreprocessStrategy = PreprocessStrategy::SharpenEqualize;
/// Detector tier used for every reference image.
pub const REFERENCE_TIER: DetectorTier = DetectorTier::Fast;

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error(transparent)]
    NoReferenceFaces(#[from] NoReferenceFaces),
    #[error("oracle failed on reference {path}: {source}")]
    Oracle {
        path: PathBuf,
        #[source]
        source: OracleError,
    },
}

/// Encode one identity per reference image.
///
/// Images that fail to decode or contain no face are logged and skipped.
/// When several faces are found only the first, in detector order, is kept.
/// Fails if no identity survives or if the oracle itself fails.
pub fn build_reference_set<O: FaceOracle + ?Sized>(
    oracle: &mut O,
    paths: &[PathBuf],
    config: &PreprocessConfig,
) -> Result<ReferenceSet, ReferenceError> {
    let mut identities = Vec::with_capacity(paths.len());

    for path in paths {
        let name = file_label(path);
        let image = match preprocess::load_image(path) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(
                    reference = %name,
                    error = %e,
                    "skipping unreadable reference image"
                );
                continue;
            }
        };

        let enhanced = REFERENCE_STRATEGY.apply(&image, config);
        let faces = oracle
            .detect_and_encode(&enhanced, REFERENCE_TIER)
            .map_err(|source| ReferenceError::Oracle {
                path: path.clone(),
                source,
            })?;

        let Some(first) = faces.into_iter().next() else {
            tracing::warn!(reference = %name, "no face found in reference image");
            continue;
        };

        match ReferenceIdentity::new(name.clone(), first.embedding) {
            Some(identity) => {
                tracing::info!(
                    reference = %name,
                    confidence = first.region.confidence,
                    "loaded reference face"
                );
                identities.push(identity);
            }
            None => tracing::warn!(reference = %name, "encoder returned an empty embedding"),
        }
    }

    let set = ReferenceSet::new(identities)?;
    tracing::info!(count = set.len(), "reference faces loaded");
    Ok(set)
}

pub(crate) fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};
    use image::{Rgb, RgbImage};

    /// Face count and embedding are keyed on image width; the oracle records calls.
    #[derive(Default)]
    struct WidthOracle {
        calls: Vec<(u32, DetectorTier)>,
        fail: bool,
    }

    impl FaceOracle for WidthOracle {
        fn detect_faces(
            &mut self,
            image: &RgbImage,
            tier: DetectorTier,
        ) -> Result<Vec<BoundingBox>, OracleError> {
            self.calls.push((image.width(), tier));
            if self.fail {
                return Err(OracleError::TierUnavailable(tier));
            }
            let count = match image.width() {
                10 => 0,
                20 => 2,
                _ => 1,
            };
            Ok((0..count)
                .map(|i| BoundingBox {
                    x: i as f32,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 1.0,
                    landmarks: None,
                })
                .collect())
        }

        fn encode_faces(
            &mut self,
            image: &RgbImage,
            regions: &[BoundingBox],
        ) -> Result<Vec<Embedding>, OracleError> {
            Ok(regions
                .iter()
                .map(|r| Embedding::new(vec![image.width() as f32, r.x]))
                .collect())
        }
    }

    fn write_image(dir: &Path, name: &str, width: u32) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(width, 8, Rgb([90, 90, 90])).save(&path).unwrap();
        path
    }

    #[test]
    fn test_keeps_first_face_and_skips_faceless() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write_image(dir.path(), "none.png", 10),
            write_image(dir.path(), "two.png", 20),
            write_image(dir.path(), "one.png", 30),
        ];

        let mut oracle = WidthOracle::default();
        let set = build_reference_set(&mut oracle, &paths, &PreprocessConfig::default()).unwrap();

        assert_eq!(set.len(), 2);
        let identities: Vec<_> = set.iter().collect();
        assert_eq!(identities[0].source(), "two.png");
        // First detected face (x = 0), not the second.
        assert_eq!(identities[0].embedding().values, vec![20.0, 0.0]);
        assert_eq!(identities[1].source(), "one.png");
        assert!(oracle.calls.iter().all(|&(_, tier)| tier == DetectorTier::Fast));
    }

    #[test]
    fn test_empty_result_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![write_image(dir.path(), "none.png", 10)];
        let mut oracle = WidthOracle::default();
        let result = build_reference_set(&mut oracle, &paths, &PreprocessConfig::default());
        assert!(matches!(result, Err(ReferenceError::NoReferenceFaces(_))));

        let result = build_reference_set(&mut oracle, &[], &PreprocessConfig::default());
        assert!(matches!(result, Err(ReferenceError::NoReferenceFaces(_))));
    }

    #[test]
    fn test_undecodable_reference_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.jpg");
        std::fs::write(&broken, b"not an image").unwrap();
        let paths = vec![broken, write_image(dir.path(), "ok.png", 30)];

        let mut oracle = WidthOracle::default();
        let set = build_reference_set(&mut oracle, &paths, &PreprocessConfig::default()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(oracle.calls.len(), 1);
    }

    #[test]
    fn test_oracle_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![write_image(dir.path(), "one.png", 30)];
        let mut oracle = WidthOracle {
            fail: true,
            ..Default::default()
        };
        let result = build_reference_set(&mut oracle, &paths, &PreprocessConfig::default());
        assert!(matches!(result, Err(ReferenceError::Oracle { .. })));
    }
}
