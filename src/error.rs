//! Error types for tps-builder.
//!
//! Every variant is fatal to a run. Nothing in the library retries or
//! recovers locally; the binary reports the error and exits with status 1.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a dependency build run.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to extract '{}': {reason}", archive.display())]
    Extraction { archive: PathBuf, reason: String },

    #[error("archive '{file}' does not follow the '<library>-<version>.<extension>' naming convention")]
    InvalidArchiveName { file: String },

    #[error("toolchain unavailable: {reason}")]
    ToolchainUnavailable { reason: String },

    #[error("[{command}] - command failed with exit code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("no artifact matches '{pattern}' in '{}'", dir.display())]
    MissingArtifact { pattern: String, dir: PathBuf },

    #[error("invalid configuration '{}': {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("workspace is locked by another run: {}", path.display())]
    WorkspaceLocked { path: PathBuf },
}

impl BuildError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn toolchain(reason: impl Into<String>) -> Self {
        BuildError::ToolchainUnavailable {
            reason: reason.into(),
        }
    }
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Attach context to `std::io::Result` values, in the spirit of
/// `anyhow::Context` but producing a typed [`BuildError::Io`].
pub trait IoContext<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| BuildError::io(f(), source))
    }
}
