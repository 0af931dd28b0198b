//! Common error types for Skiff.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`SkiffError`].
pub type SkiffResult<T> = Result<T, SkiffError>;

/// Errors surfaced by the lifecycle manager and its collaborators.
///
/// Guest-level failures (a non-zero exit, a permission error inside the
/// container) are never represented here; they are recorded as exit codes.
#[derive(Error, Diagnostic, Debug)]
pub enum SkiffError {
    /// Malformed or contradictory run request.
    #[error("Invalid run request: {message}")]
    #[diagnostic(code(skiff::validation))]
    Validation {
        /// What was wrong with the request.
        message: String,
    },

    /// Invalid container name.
    #[error("Invalid container name: {name}")]
    #[diagnostic(
        code(skiff::container::invalid_name),
        help("Container names must match [a-zA-Z0-9][a-zA-Z0-9_.-]* and be at most 128 characters")
    )]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Isolation configuration could not be constructed.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(skiff::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// The container process could not be launched.
    #[error("Failed to start container {id}: {reason}")]
    #[diagnostic(
        code(skiff::container::start_failed),
        help("The container was left in the dead state; inspect it for the recorded error")
    )]
    StartFailure {
        /// The container that failed to start.
        id: String,
        /// Why the launch failed.
        reason: String,
    },

    /// Operation incompatible with the container's current state.
    #[error("Conflict: {message}")]
    #[diagnostic(code(skiff::container::conflict))]
    Conflict {
        /// The error message.
        message: String,
    },

    /// Container not found.
    #[error("container {id}: not found")]
    #[diagnostic(code(skiff::container::not_found))]
    ContainerNotFound {
        /// The id or name that was looked up.
        id: String,
    },

    /// Image not found.
    #[error("image {reference}: not found")]
    #[diagnostic(
        code(skiff::image::not_found),
        help("Images are resolved from the local image store under <root>/images")
    )]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(skiff::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(skiff::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(skiff::unsupported),
        help("Container isolation requires Linux")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(skiff::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

/// Coarse classification of [`SkiffError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was rejected before any resource was allocated.
    Validation,
    /// The isolation configuration could not be built.
    Config,
    /// The process could not be launched.
    StartFailure,
    /// The operation does not fit the container's state.
    Conflict,
    /// Unknown container or image.
    NotFound,
    /// Anything else (I/O, serialization, bugs).
    Internal,
}

impl SkiffError {
    /// Build a [`SkiffError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Build a [`SkiffError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Build a [`SkiffError::Conflict`].
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Build a [`SkiffError::ContainerNotFound`].
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::ContainerNotFound { id: id.into() }
    }

    /// Build a [`SkiffError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::InvalidName { .. } => ErrorKind::Validation,
            Self::Config { .. } => ErrorKind::Config,
            Self::StartFailure { .. } => ErrorKind::StartFailure,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::ContainerNotFound { .. } | Self::ImageNotFound { .. } => ErrorKind::NotFound,
            Self::Io(_) | Self::Serialization(_) | Self::Unsupported { .. } | Self::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<serde_json::Error> for SkiffError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
