//! Error types for dockhand.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for dockhand operations.
pub type Result<T> = std::result::Result<T, DockhandError>;

/// Main error type for dockhand.
#[derive(Error, Debug)]
pub enum DockhandError {
    // Configuration errors: reported before the runtime is touched.
    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Invalid manifest at {path:?}: {reason}")]
    ManifestParse { path: PathBuf, reason: String },

    #[error("Invalid build file at {path:?} (line {line}): {reason}")]
    BuildFileParse { path: PathBuf, line: usize, reason: String },

    // Runtime errors
    #[error("Container runtime unavailable: {reason}")]
    RuntimeUnavailable { reason: String },

    #[error("Transient runtime failure: {reason}")]
    TransientRuntime { reason: String },

    #[error("Network failure: {reason}")]
    Network { reason: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("Runtime command `{command}` failed: {stderr}")]
    RuntimeCommand { command: String, stderr: String },

    // Installation errors
    #[error("Dependency install for service '{service}' exited with code {exit_code}")]
    InstallFailed { service: String, exit_code: i32 },

    // File system errors
    #[error("File read error: {path:?}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Snapshot store errors
    #[error("Snapshot store error: {reason}")]
    Snapshot { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DockhandError {
    /// True for the recognized transient runtime failure class, which earns
    /// exactly one automatic retry at the point of occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(self, DockhandError::TransientRuntime { .. })
    }

    /// True for recognized connectivity failures during image pull.
    pub fn is_network(&self) -> bool {
        matches!(self, DockhandError::Network { .. })
    }

    /// True when the error only says a resource is already absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DockhandError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = DockhandError::TransientRuntime { reason: "i/o timeout".into() };
        assert!(err.is_transient());
        assert!(!err.is_network());

        let err = DockhandError::Network { reason: "tls handshake timeout".into() };
        assert!(err.is_network());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_found_classification() {
        let err = DockhandError::NotFound { what: "volume web-modules".into() };
        assert!(err.is_not_found());
    }
}
