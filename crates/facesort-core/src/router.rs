//! Moves classified files into their destination directories.

use crate::types::MatchDecision;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("could not create destination {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} has no file name")]
    NoFileName(PathBuf),
    #[error("could not move {from} to {to}: {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Relocates a candidate according to its final decision.
pub trait Router {
    /// Move `path` to the destination for `decision`, returning the new path.
    fn route(&mut self, path: &Path, decision: MatchDecision) -> Result<PathBuf, RouteError>;
}

/// Filesystem router with one directory per decision.
#[derive(Debug, Clone)]
pub struct FsRouter {
    matched_dir: PathBuf,
    unmatched_dir: PathBuf,
}

impl FsRouter {
    /// Create both destination directories if absent.
    pub fn new(
        matched_dir: impl Into<PathBuf>,
        unmatched_dir: impl Into<PathBuf>,
    ) -> Result<Self, RouteError> {
        let router = Self {
            matched_dir: matched_dir.into(),
            unmatched_dir: unmatched_dir.into(),
        };
        for dir in [&router.matched_dir, &router.unmatched_dir] {
            std::fs::create_dir_all(dir).map_err(|source| RouteError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(router)
    }

    pub fn destination_dir(&self, decision: MatchDecision) -> &Path {
        match decision {
            MatchDecision::Matched => &self.matched_dir,
            MatchDecision::Unmatched => &self.unmatched_dir,
        }
    }
}

impl Router for FsRouter {
    fn route(&mut self, path: &Path, decision: MatchDecision) -> Result<PathBuf, RouteError> {
        let name = path
            .file_name()
            .ok_or_else(|| RouteError::NoFileName(path.to_path_buf()))?;
        let target = free_path(&self.destination_dir(decision).join(name));

        move_file(path, &target).map_err(|source| RouteError::Move {
            from: path.to_path_buf(),
            to: target.clone(),
            source,
        })?;
        Ok(target)
    }
}

/// `target` itself, or `stem (n).ext` for the first free `n`.
fn free_path(target: &Path) -> PathBuf {
    if !target.exists() {
        return target.to_path_buf();
    }
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = target.extension().map(|e| e.to_string_lossy().into_owned());
    (1..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            target.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| target.to_path_buf())
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !from.is_file() {
                return Err(rename_err);
            }
            tracing::debug!(
                from = %from.display(),
                error = %rename_err,
                "rename failed, copying instead"
            );
            std::fs::copy(from, to)?;
            if let Err(e) = std::fs::remove_file(from) {
                // Leave exactly one copy behind.
                let _ = std::fs::remove_file(to);
                return Err(e);
            }
            Ok(())
        }
    }
}
