use std::{io, path::PathBuf, result::Result as StdResult};
use thiserror::Error;

/// Custom Result type for oebuild operations.
pub type Result<T> = StdResult<T, OebuildError>;

/// Oebuild-specific error types
#[derive(Error, Debug)]
pub enum OebuildError {
    /// The current directory is not inside an oebuild workspace.
    #[error("Not in an oebuild workspace (no {sentinel} directory found above {start:?})")]
    WorkspaceNotFound {
        /// Directory the search started from.
        start: PathBuf,
        /// Name of the sentinel directory that was looked for.
        sentinel: &'static str,
    },

    /// A template, descriptor or workspace config is missing a field or is inconsistent.
    #[error("Config error in '{field}': {message}")]
    ConfigError {
        /// The offending field, file or identifier.
        field: String,
        /// Human-readable error description.
        message: String,
    },

    /// A feature template does not support the selected platform.
    #[error("Feature '{feature}' does not support platform '{platform}' (supported: {support})")]
    FeatureMismatch {
        /// Name of the feature template.
        feature: String,
        /// Name of the selected platform.
        platform: String,
        /// The feature's declared support set.
        support: String,
    },

    /// A git operation failed.
    #[error("Git error: {0}")]
    VcsError(String),

    /// A container runtime operation failed.
    #[error("Container error: {0}")]
    ContainerError(String),

    /// The declared nativesdk directory or its environment setup file is absent.
    #[error(
        "nativesdk not found at {path:?}; download the openEuler nativesdk and pass it with -n"
    )]
    NativesdkNotExist {
        /// Directory that was expected to contain the nativesdk.
        path: PathBuf,
    },

    /// The nativesdk setup file does not point inside the declared directory.
    #[error("nativesdk at {path:?} is not valid: {message}; reinstall it or pass another -n")]
    NativesdkNotValid {
        /// Directory that was declared as the nativesdk root.
        path: PathBuf,
        /// Human-readable error description.
        message: String,
    },

    /// The operation was cancelled by the user.
    #[error("Aborted by user")]
    UserAborted,

    /// The user's build command exited with a non-zero status.
    #[error("Command exited with status code: {code}")]
    CommandExit {
        /// The process exit status code.
        code: i32,
    },

    /// A structured document could not be parsed or serialized.
    #[error("Document error in {path:?}: {message}")]
    DocumentError {
        /// Path of the document.
        path: PathBuf,
        /// Human-readable error description.
        message: String,
    },

    /// An underlying I/O operation failed.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl OebuildError {
    /// Return the recommended process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandExit { code } => *code,
            Self::UserAborted => 0,
            Self::ConfigError { .. } | Self::FeatureMismatch { .. } => 2,
            Self::VcsError(_) => 3,
            Self::ContainerError(_) => 4,
            Self::NativesdkNotExist { .. } | Self::NativesdkNotValid { .. } => 5,
            _ => 1,
        }
    }

    /// Shorthand for a [`OebuildError::ConfigError`].
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Map an `anyhow` git failure into a [`OebuildError::VcsError`].
pub fn vcs_error(error: &anyhow::Error) -> OebuildError {
    OebuildError::VcsError(format!("{error:#}"))
}

/// Map an `anyhow` runtime failure into a [`OebuildError::ContainerError`].
pub fn container_error(error: &anyhow::Error) -> OebuildError {
    OebuildError::ContainerError(format!("{error:#}"))
}
