use anyhow::{bail, Context, Result};
use facesort_core::cascade::PipelineConfig;
use facesort_core::preprocess::{
    PreprocessConfig, DEFAULT_CLAHE_CLIP_LIMIT, DEFAULT_CLAHE_TILES, DEFAULT_SHARPEN_FACTOR,
};
use facesort_core::{matcher, PipelineMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Run configuration: defaults, then an optional TOML file, then
/// `FACESORT_*` environment variables. CLI flags are applied last by `main`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Candidate images to sort.
    pub source_dir: PathBuf,
    /// Destination for candidates containing a known face.
    pub matched_dir: PathBuf,
    /// Destination for everything else.
    pub unmatched_dir: PathBuf,
    /// Labeled images of the people to look for.
    pub reference_dir: PathBuf,
    /// Directory holding the SeetaFace, SCRFD and ArcFace model files.
    pub model_dir: PathBuf,
    pub mode: PipelineMode,
    /// Maximum embedding distance for a match.
    pub tolerance: f32,
    pub sharpen_factor: f32,
    pub clahe_clip_limit: f32,
    /// CLAHE grid size per axis.
    pub clahe_tiles: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("source_images"),
            matched_dir: PathBuf::from("sorted_images"),
            unmatched_dir: PathBuf::from("unmatched_images"),
            reference_dir: PathBuf::from("reference_images"),
            model_dir: PathBuf::from("models"),
            mode: PipelineMode::default(),
            tolerance: matcher::DEFAULT_TOLERANCE,
            sharpen_factor: DEFAULT_SHARPEN_FACTOR,
            clahe_clip_limit: DEFAULT_CLAHE_CLIP_LIMIT,
            clahe_tiles: DEFAULT_CLAHE_TILES,
        }
    }
}

impl Config {
    /// Defaults overlaid by `file` (if any) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Overlay `FACESORT_*` variables resolved through `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        for (key, dir) in [
            ("FACESORT_SOURCE_DIR", &mut self.source_dir),
            ("FACESORT_MATCHED_DIR", &mut self.matched_dir),
            ("FACESORT_UNMATCHED_DIR", &mut self.unmatched_dir),
            ("FACESORT_REFERENCE_DIR", &mut self.reference_dir),
            ("FACESORT_MODEL_DIR", &mut self.model_dir),
        ] {
            if let Some(value) = var(key) {
                *dir = PathBuf::from(value);
            }
        }

        env_parse(&var, "FACESORT_MODE", &mut self.mode);
        env_parse(&var, "FACESORT_TOLERANCE", &mut self.tolerance);
        env_parse(&var, "FACESORT_SHARPEN_FACTOR", &mut self.sharpen_factor);
        env_parse(&var, "FACESORT_CLAHE_CLIP_LIMIT", &mut self.clahe_clip_limit);
        env_parse(&var, "FACESORT_CLAHE_TILES", &mut self.clahe_tiles);
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            bail!("tolerance must be a non-negative number, got {}", self.tolerance);
        }
        if !self.sharpen_factor.is_finite() {
            bail!("sharpen_factor must be finite, got {}", self.sharpen_factor);
        }
        if !self.clahe_clip_limit.is_finite() || self.clahe_clip_limit <= 0.0 {
            bail!("clahe_clip_limit must be positive, got {}", self.clahe_clip_limit);
        }
        if self.clahe_tiles == 0 {
            bail!("clahe_tiles must be at least 1");
        }
        Ok(())
    }

    pub fn preprocess(&self) -> PreprocessConfig {
        PreprocessConfig {
            sharpen_factor: self.sharpen_factor,
            clahe_clip_limit: self.clahe_clip_limit,
            clahe_tiles: self.clahe_tiles,
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            mode: self.mode,
            tolerance: self.tolerance,
            preprocess: self.preprocess(),
        }
    }
}

fn env_parse<T: FromStr>(var: impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else { return };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring invalid environment value"),
    }
}
