//! Error types for the registry, deployment and sync engines.
//!
//! Library code returns [`Error`]; the binary converts it into
//! [`anyhow::Error`] at the command boundary. Variants that need a decision
//! from the caller (conflicts, duplicates) carry enough context to render an
//! actionable message.

use std::path::PathBuf;

use thiserror::Error;

use crate::platform::Platform;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration '{name}' not found")]
    NotFound { name: String },

    #[error("configuration '{name}' already exists")]
    DuplicateName { name: String },

    #[error("invalid configuration name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error(
        "'{name}' already has a {platform} path ({}), refusing to replace it with {}",
        existing.display(),
        requested.display()
    )]
    PathConflict {
        name: String,
        platform: Platform,
        existing: PathBuf,
        requested: PathBuf,
    },

    #[error("'{name}' has no path for {platform}")]
    PlatformNotFound { name: String, platform: Platform },

    #[error("cannot remove the {platform} path: it is the last platform of '{name}'")]
    LastPlatformRemoval { name: String, platform: Platform },

    #[error("'{name}' has no source path for {platform}")]
    NoSourceForPlatform { name: String, platform: Platform },

    #[error("repository copy of '{name}' is missing at {}", path.display())]
    MissingRepoCopy { name: String, path: PathBuf },

    #[error("permission denied: {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("{} already exists and differs from the managed copy of '{name}'", target.display())]
    TargetConflict { name: String, target: PathBuf },

    #[error("no repository at {}", path.display())]
    Uninitialized { path: PathBuf },

    #[error("merge conflicts in {} file(s): {}", paths.len(), display_paths(paths))]
    MergeConflict {
        /// Registry entries touched by the conflicting files.
        entries: Vec<String>,
        /// Conflicting paths, repository-relative.
        paths: Vec<PathBuf>,
    },

    #[error("{operation} failed: {message}")]
    NetworkFailure { operation: String, message: String },

    #[error("{operation} rejected by the remote: {message}")]
    Rejected { operation: String, message: String },

    #[error("remote '{remote}' is not configured")]
    NoRemote { remote: String },

    #[error("git {operation} failed: {message}")]
    Vcs { operation: String, message: String },

    #[error("registry index {}: {message}", path.display())]
    Index { path: PathBuf, message: String },

    #[error("settings {}: {message}", path.display())]
    Settings { path: PathBuf, message: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Wrap an I/O error, promoting `PermissionDenied` to its own variant.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied { path }
        } else {
            Error::Io { path, source }
        }
    }

    /// True for conflicts the caller can retry with an explicit resolution flag.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::TargetConflict { .. } | Error::MergeConflict { .. } | Error::PathConflict { .. }
        )
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Extension for attaching a path to `std::io::Result`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
