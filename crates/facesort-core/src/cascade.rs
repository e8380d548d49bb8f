//! Candidate classification: single-pass or two-stage detector cascade.
//!
//! In cascade mode every candidate first runs through the fast tier. Only
//! an affirmative match is final after pass 1; everything else (no face, or
//! faces that matched nothing) is held in a pending list and re-evaluated
//! exactly once with the accurate tier after pass 1 has finished. Pass 2 is
//! terminal. Candidates that fail at any point stay where they are.

use crate::matcher;
use crate::oracle::{FaceOracle, OracleError};
use crate::preprocess::{self, DecodeError, PreprocessConfig, PreprocessStrategy};
use crate::reference::file_label;
use crate::router::{RouteError, Router};
use crate::types::{DetectorTier, MatchDecision, PipelineMode, ReferenceSet};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Preprocessing strategy and detector tier for one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub strategy: PreprocessStrategy,
    pub tier: DetectorTier,
}

pub const SINGLE_PASS_STAGE: Stage = Stage {
    strategy: PreprocessStrategy::DenoiseEqualize,
    tier: DetectorTier::Fast,
};
pub const CASCADE_FAST_STAGE: Stage = Stage {
    strategy: PreprocessStrategy::SharpenEqualize,
    tier: DetectorTier::Fast,
};
pub const CASCADE_ACCURATE_STAGE: Stage = Stage {
    strategy: PreprocessStrategy::SharpenEqualize,
    tier: DetectorTier::Accurate,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub mode: PipelineMode,
    pub tolerance: f32,
    pub preprocess: PreprocessConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::default(),
            tolerance: matcher::DEFAULT_TOLERANCE,
            preprocess: PreprocessConfig::default(),
        }
    }
}

/// Result of one evaluation pass over a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Matched,
    /// No face detected (`faces == 0`) or no detected face within tolerance.
    NotYetMatched { faces: usize },
}

#[derive(Error, Debug)]
pub enum CandidateError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("oracle: {0}")]
    Oracle(#[from] OracleError),
    #[error("route: {0}")]
    Route(#[from] RouteError),
}

/// What happened to one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateReport {
    pub file: String,
    pub decision: Option<MatchDecision>,
    /// Tier that produced the final decision.
    pub tier: Option<DetectorTier>,
    pub destination: Option<PathBuf>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: PipelineMode,
    pub references: usize,
    pub matched: usize,
    pub unmatched: usize,
    /// Candidates sent on to the accurate tier.
    pub escalated: usize,
    /// Candidates left in the source directory after an error.
    pub skipped: usize,
    pub reports: Vec<CandidateReport>,
}

impl RunSummary {
    fn new(mode: PipelineMode, references: usize) -> Self {
        Self {
            mode,
            references,
            matched: 0,
            unmatched: 0,
            escalated: 0,
            skipped: 0,
            reports: Vec::new(),
        }
    }
}

/// Drives preprocessing, detection, matching and routing over the candidates.
pub struct CascadeController<O, R> {
    oracle: O,
    router: R,
    references: ReferenceSet,
    config: PipelineConfig,
}

impl<O: FaceOracle, R: Router> CascadeController<O, R> {
    pub fn new(oracle: O, router: R, references: ReferenceSet, config: PipelineConfig) -> Self {
        Self {
            oracle,
            router,
            references,
            config,
        }
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Decode, preprocess, detect, encode and match one candidate.
    pub fn evaluate(&mut self, path: &Path, stage: Stage) -> Result<StageOutcome, CandidateError> {
        let image = preprocess::load_image(path)?;
        let enhanced = stage.strategy.apply(&image, &self.config.preprocess);
        drop(image);

        let started = Instant::now();
        let faces = self.oracle.detect_and_encode(&enhanced, stage.tier)?;
        let matched = matcher::image_matches(
            faces.iter().map(|f| &f.embedding),
            &self.references,
            self.config.tolerance,
        );

        tracing::debug!(
            file = %file_label(path),
            tier = %stage.tier,
            faces = faces.len(),
            nearest = ?faces
                .iter()
                .filter_map(|f| matcher::nearest_distance(&f.embedding, &self.references))
                .min_by(f32::total_cmp),
            matched,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "evaluated candidate"
        );

        Ok(if matched {
            StageOutcome::Matched
        } else {
            StageOutcome::NotYetMatched { faces: faces.len() }
        })
    }

    /// Classify and route every candidate according to the configured mode.
    pub fn run(&mut self, candidates: &[PathBuf]) -> RunSummary {
        let mut summary = RunSummary::new(self.config.mode, self.references.len());
        tracing::info!(
            mode = %self.config.mode,
            candidates = candidates.len(),
            references = self.references.len(),
            "processing candidates"
        );

        match self.config.mode {
            PipelineMode::SinglePass => self.run_single_pass(candidates, &mut summary),
            PipelineMode::Cascade => self.run_cascade(candidates, &mut summary),
        }

        tracing::info!(
            matched = summary.matched,
            unmatched = summary.unmatched,
            escalated = summary.escalated,
            skipped = summary.skipped,
            "sorting complete"
        );
        summary
    }

    fn run_single_pass(&mut self, candidates: &[PathBuf], summary: &mut RunSummary) {
        let tier = SINGLE_PASS_STAGE.tier;
        for path in candidates {
            match self.evaluate(path, SINGLE_PASS_STAGE) {
                Ok(StageOutcome::Matched) => {
                    self.finalize(path, MatchDecision::Matched, tier, summary)
                }
                Ok(StageOutcome::NotYetMatched { faces }) => {
                    if faces == 0 {
                        tracing::info!(file = %file_label(path), "no faces detected");
                    }
                    self.finalize(path, MatchDecision::Unmatched, tier, summary)
                }
                Err(e) => skip(path, e, summary),
            }
        }
    }

    fn run_cascade(&mut self, candidates: &[PathBuf], summary: &mut RunSummary) {
        let mut pending: Vec<&PathBuf> = Vec::new();

        for path in candidates {
            match self.evaluate(path, CASCADE_FAST_STAGE) {
                Ok(StageOutcome::Matched) => {
                    self.finalize(path, MatchDecision::Matched, DetectorTier::Fast, summary)
                }
                Ok(StageOutcome::NotYetMatched { faces }) => {
                    tracing::debug!(
                        file = %file_label(path),
                        faces,
                        "not matched by fast tier, escalating"
                    );
                    pending.push(path);
                }
                Err(e) => skip(path, e, summary),
            }
        }

        summary.escalated = pending.len();
        if pending.is_empty() {
            return;
        }
        tracing::info!(
            count = pending.len(),
            "re-checking unmatched candidates with the accurate tier"
        );

        let tier = CASCADE_ACCURATE_STAGE.tier;
        for path in pending {
            match self.evaluate(path, CASCADE_ACCURATE_STAGE) {
                Ok(StageOutcome::Matched) => {
                    self.finalize(path, MatchDecision::Matched, tier, summary)
                }
                Ok(StageOutcome::NotYetMatched { .. }) => {
                    self.finalize(path, MatchDecision::Unmatched, tier, summary)
                }
                Err(e) => skip(path, e, summary),
            }
        }
    }

    fn finalize(
        &mut self,
        path: &Path,
        decision: MatchDecision,
        tier: DetectorTier,
        summary: &mut RunSummary,
    ) {
        let file = file_label(path);
        match self.router.route(path, decision) {
            Ok(destination) => {
                match decision {
                    MatchDecision::Matched => {
                        summary.matched += 1;
                        tracing::info!(%file, %tier, "match found");
                    }
                    MatchDecision::Unmatched => {
                        summary.unmatched += 1;
                        tracing::info!(%file, %tier, "no match");
                    }
                }
                summary.reports.push(CandidateReport {
                    file,
                    decision: Some(decision),
                    tier: Some(tier),
                    destination: Some(destination),
                    error: None,
                });
            }
            Err(e) => skip(path, CandidateError::Route(e), summary),
        }
    }
}

fn skip(path: &Path, error: CandidateError, summary: &mut RunSummary) {
    let file = file_label(path);
    tracing::warn!(%file, error = %error, "could not process candidate, leaving it in place");
    summary.skipped += 1;
    summary.reports.push(CandidateReport {
        file,
        decision: None,
        tier: None,
        destination: None,
        error: Some(error.to_string()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::FsRouter;
    use crate::types::{BoundingBox, Embedding, ReferenceIdentity};
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    // Candidate behaviour is keyed on image width, which preprocessing preserves.
    const NEAR: u32 = 10; // one face at 0.30 from the reference, both tiers
    const FAR: u32 = 12; // one face at 0.60, both tiers
    const HIDDEN: u32 = 14; // fast tier finds nothing, accurate finds a face at 0.10
    const EMPTY: u32 = 16; // no face in either tier
    const FLAKY: u32 = 18; // fast tier finds nothing, accurate tier errors
    const CROWD: u32 = 20; // two faces: 0.90 and 0.20

    #[derive(Default)]
    struct ScriptedOracle {
        calls: Vec<(u32, DetectorTier)>,
    }

    impl ScriptedOracle {
        fn calls_for(&self, width: u32) -> Vec<DetectorTier> {
            self.calls
                .iter()
                .filter(|(w, _)| *w == width)
                .map(|(_, t)| *t)
                .collect()
        }
    }

    fn face_at(distance: f32) -> BoundingBox {
        BoundingBox {
            x: distance,
            y: 0.0,
            width: 4.0,
            height: 4.0,
            confidence: 0.9,
            landmarks: None,
        }
    }

    impl FaceOracle for ScriptedOracle {
        fn detect_faces(
            &mut self,
            image: &RgbImage,
            tier: DetectorTier,
        ) -> Result<Vec<BoundingBox>, OracleError> {
            self.calls.push((image.width(), tier));
            let distances: Vec<f32> = match (image.width(), tier) {
                (NEAR, _) => vec![0.30],
                (FAR, _) => vec![0.60],
                (HIDDEN, DetectorTier::Accurate) => vec![0.10],
                (FLAKY, DetectorTier::Accurate) => {
                    return Err(OracleError::TierUnavailable(tier))
                }
                (CROWD, _) => vec![0.90, 0.20],
                _ => vec![],
            };
            Ok(distances.into_iter().map(face_at).collect())
        }

        fn encode_faces(
            &mut self,
            _: &RgbImage,
            regions: &[BoundingBox],
        ) -> Result<Vec<Embedding>, OracleError> {
            // The scripted distance sits on the first axis; the reference is the origin.
            Ok(regions
                .iter()
                .map(|r| Embedding::new(vec![r.x, 0.0]))
                .collect())
        }
    }

    /// In-memory log sink for asserting on emitted events.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("source")).unwrap();
            Self { dir }
        }

        fn source(&self) -> PathBuf {
            self.dir.path().join("source")
        }

        fn matched(&self) -> PathBuf {
            self.dir.path().join("sorted")
        }

        fn unmatched(&self) -> PathBuf {
            self.dir.path().join("unmatched")
        }

        fn add(&self, name: &str, width: u32) -> PathBuf {
            let path = self.source().join(name);
            RgbImage::from_fn(width, 8, |x, y| {
                Rgb([(x * 20) as u8, (y * 30) as u8, 100])
            })
            .save(&path)
            .unwrap();
            path
        }

        fn add_corrupt(&self, name: &str) -> PathBuf {
            let path = self.source().join(name);
            std::fs::write(&path, b"\xff\xd8 truncated garbage").unwrap();
            path
        }

        fn controller(&self, mode: PipelineMode) -> CascadeController<ScriptedOracle, FsRouter> {
            let origin = Embedding::new(vec![0.0, 0.0]);
            let reference = ReferenceIdentity::new("me.jpg", origin).unwrap();
            let references = ReferenceSet::new(vec![reference]).unwrap();
            let router = FsRouter::new(self.matched(), self.unmatched()).unwrap();
            let config = PipelineConfig {
                mode,
                ..Default::default()
            };
            CascadeController::new(ScriptedOracle::default(), router, references, config)
        }

        fn names_in(&self, dir: &Path) -> HashSet<String> {
            std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        }

        fn run(&self, mode: PipelineMode, files: &[(&str, u32)]) -> (RunSummary, ScriptedOracle) {
            let paths: Vec<PathBuf> = files
                .iter()
                .map(|&(name, width)| self.add(name, width))
                .collect();
            let mut controller = self.controller(mode);
            let summary = controller.run(&paths);
            let oracle = ScriptedOracle {
                calls: controller.oracle().calls.clone(),
            };
            (summary, oracle)
        }
    }

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stage_plan() {
        assert_eq!(
            SINGLE_PASS_STAGE.strategy,
            PreprocessStrategy::DenoiseEqualize
        );
        assert_eq!(
            CASCADE_FAST_STAGE,
            Stage {
                strategy: PreprocessStrategy::SharpenEqualize,
                tier: DetectorTier::Fast,
            }
        );
        assert_eq!(CASCADE_ACCURATE_STAGE.tier, DetectorTier::Accurate);
        assert_eq!(CASCADE_ACCURATE_STAGE.strategy, CASCADE_FAST_STAGE.strategy);
    }

    #[test]
    fn test_near_face_matches_in_both_modes() {
        for mode in [PipelineMode::SinglePass, PipelineMode::Cascade] {
            let fx = Fixture::new();
            let (summary, oracle) = fx.run(mode, &[("a.png", NEAR)]);
            assert_eq!(summary.matched, 1, "{mode}");
            assert_eq!(fx.names_in(&fx.matched()), names(&["a.png"]), "{mode}");
            assert_eq!(oracle.calls_for(NEAR), vec![DetectorTier::Fast], "{mode}");
        }
    }

    #[test]
    fn test_far_face_single_pass_is_unmatched_without_escalation() {
        let fx = Fixture::new();
        let files = [("b.png", FAR), ("e.png", EMPTY)];
        let (summary, oracle) = fx.run(PipelineMode::SinglePass, &files);
        assert_eq!(summary.unmatched, 2);
        assert_eq!(summary.escalated, 0);
        assert_eq!(fx.names_in(&fx.unmatched()), names(&["b.png", "e.png"]));
        assert!(oracle.calls.iter().all(|(_, t)| *t == DetectorTier::Fast));
    }

    #[test]
    fn test_far_face_cascade_escalates_then_unmatched() {
        let fx = Fixture::new();
        let (summary, oracle) = fx.run(PipelineMode::Cascade, &[("b.png", FAR)]);
        assert_eq!(
            oracle.calls_for(FAR),
            vec![DetectorTier::Fast, DetectorTier::Accurate]
        );
        assert_eq!(summary.escalated, 1);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.reports[0].tier, Some(DetectorTier::Accurate));
        assert_eq!(fx.names_in(&fx.unmatched()), names(&["b.png"]));
    }

    #[test]
    fn test_accurate_tier_rescues_missed_face() {
        let fx = Fixture::new();
        let files = [("h.png", HIDDEN), ("e.png", EMPTY)];
        let (summary, oracle) = fx.run(PipelineMode::Cascade, &files);
        let both_tiers = vec![DetectorTier::Fast, DetectorTier::Accurate];
        assert_eq!(oracle.calls_for(HIDDEN), both_tiers);
        assert_eq!(oracle.calls_for(EMPTY), both_tiers);
        assert_eq!(fx.names_in(&fx.matched()), names(&["h.png"]));
        assert_eq!(fx.names_in(&fx.unmatched()), names(&["e.png"]));
        assert_eq!(summary.escalated, 2);
    }

    #[test]
    fn test_pass_one_match_is_never_reevaluated() {
        let fx = Fixture::new();
        let files = [("a.png", NEAR), ("b.png", FAR), ("c.png", CROWD)];
        let (_, oracle) = fx.run(PipelineMode::Cascade, &files);
        assert_eq!(oracle.calls_for(NEAR), vec![DetectorTier::Fast]);
        assert_eq!(oracle.calls_for(CROWD), vec![DetectorTier::Fast]);
        assert_eq!(
            oracle.calls_for(FAR),
            vec![DetectorTier::Fast, DetectorTier::Accurate]
        );
    }

    #[test]
    fn test_pass_one_completes_before_pass_two() {
        let fx = Fixture::new();
        let files = [("b.png", FAR), ("a.png", NEAR), ("e.png", EMPTY)];
        let (_, oracle) = fx.run(PipelineMode::Cascade, &files);
        let tiers: Vec<DetectorTier> = oracle.calls.iter().map(|(_, t)| *t).collect();
        assert_eq!(
            tiers,
            vec![
                DetectorTier::Fast,
                DetectorTier::Fast,
                DetectorTier::Fast,
                DetectorTier::Accurate,
                DetectorTier::Accurate,
            ]
        );
    }

    #[test]
    fn test_corrupt_candidate_stays_in_source_with_warning() {
        let fx = Fixture::new();
        let corrupt = fx.add_corrupt("c.jpg");
        let good = fx.add("a.png", NEAR);
        let mut controller = fx.controller(PipelineMode::Cascade);

        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let candidates = [corrupt.clone(), good];
        let summary = tracing::subscriber::with_default(subscriber, || controller.run(&candidates));

        assert!(corrupt.exists());
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.escalated, 0, "decode failures are not escalated");
        let report = summary.reports.iter().find(|r| r.file == "c.jpg").unwrap();
        assert!(report.decision.is_none());
        assert!(report.error.is_some());
        // The oracle never saw the corrupt file.
        assert_eq!(controller.oracle().calls.len(), 1);

        let output = logs.contents();
        let warnings: Vec<&str> = output.lines().filter(|l| l.contains("WARN")).collect();
        assert_eq!(warnings.len(), 1, "{output}");
        assert!(warnings[0].contains("c.jpg"), "{output}");
        assert!(warnings[0].contains("leaving it in place"), "{output}");
    }

    #[test]
    fn test_accurate_tier_failure_leaves_file_in_source() {
        let fx = Fixture::new();
        let files = [("f.png", FLAKY), ("b.png", FAR)];
        let (summary, _) = fx.run(PipelineMode::Cascade, &files);
        assert!(fx.source().join("f.png").exists());
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.unmatched, 1);
    }

    #[test]
    fn test_every_file_ends_in_exactly_one_place() {
        for mode in [PipelineMode::SinglePass, PipelineMode::Cascade] {
            let fx = Fixture::new();
            let files = [
                ("a.png", NEAR),
                ("b.png", FAR),
                ("h.png", HIDDEN),
                ("e.png", EMPTY),
                ("f.png", FLAKY),
                ("c.png", CROWD),
            ];
            let mut paths: Vec<PathBuf> = files.iter().map(|&(n, w)| fx.add(n, w)).collect();
            paths.push(fx.add_corrupt("x.jpg"));

            let mut controller = fx.controller(mode);
            let summary = controller.run(&paths);

            let matched = fx.names_in(&fx.matched());
            let unmatched = fx.names_in(&fx.unmatched());
            let source = fx.names_in(&fx.source());

            assert!(matched.is_disjoint(&unmatched), "{mode}");
            assert!(matched.is_disjoint(&source), "{mode}");
            assert!(unmatched.is_disjoint(&source), "{mode}");
            let total = matched.len() + unmatched.len() + source.len();
            assert_eq!(total, paths.len(), "{mode}");
            assert_eq!(summary.matched, matched.len(), "{mode}");
            assert_eq!(summary.unmatched, unmatched.len(), "{mode}");
            assert_eq!(summary.skipped, source.len(), "{mode}");
            assert_eq!(summary.reports.len(), paths.len(), "{mode}");
            assert_eq!(summary.references, controller.references().len(), "{mode}");
        }
    }

    #[test]
    fn test_evaluate_reports_face_count() {
        let fx = Fixture::new();
        let far = fx.add("b.png", FAR);
        let empty = fx.add("e.png", EMPTY);
        let mut controller = fx.controller(PipelineMode::SinglePass);

        assert_eq!(
            controller.evaluate(&far, SINGLE_PASS_STAGE).unwrap(),
            StageOutcome::NotYetMatched { faces: 1 }
        );
        assert_eq!(
            controller.evaluate(&empty, SINGLE_PASS_STAGE).unwrap(),
            StageOutcome::NotYetMatched { faces: 0 }
        );
        // Evaluation alone never moves files.
        assert!(far.exists() && empty.exists());
    }

    #[test]
    fn test_tolerance_is_configurable() {
        let fx = Fixture::new();
        let far = fx.add("b.png", FAR);
        let mut controller = fx.controller(PipelineMode::SinglePass);
        controller.config.tolerance = 0.65;
        assert_eq!(
            controller.evaluate(&far, SINGLE_PASS_STAGE).unwrap(),
            StageOutcome::Matched
        );
    }
}
