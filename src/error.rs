//! Error taxonomy for overlay management and builds.
//!
//! Most functions in this crate return [`anyhow::Result`] and attach
//! context as errors travel upward. The variants here are the failures a
//! caller may want to match on; they are raised inside an `anyhow::Error`
//! and recovered with `downcast_ref::<OverlayError>()`.

use std::path::PathBuf;

/// Boxed source error carried by render failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// Missing or unparseable node or global configuration.
    #[error("configuration error in '{path}': {message}")]
    Config { path: PathBuf, message: String },

    #[error("overlay name contains illegal characters: '{0}'")]
    InvalidName(String),

    #[error("overlay does not exist: {0}")]
    NotFound(String),

    #[error("overlay already exists: {0}")]
    AlreadyExists(String),

    #[error("cannot delete a distribution overlay: {0}")]
    DistributionDelete(String),

    #[error("file does not exist within overlay: {overlay}:{member}")]
    MemberNotFound { overlay: String, member: String },

    #[error("a file with that name already exists in the overlay: {overlay}:{member}")]
    MemberExists { overlay: String, member: String },

    #[error("at least one overlay is needed to build for node '{0}'")]
    NoOverlays(String),

    /// Template lookup/render failure, tagged with the node and source file.
    #[error("could not render template '{file}' for node '{node}'")]
    Render {
        node: String,
        file: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("could not include '{path}'")]
    Include {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One or more targets in a batch failed; successful targets were published.
    #[error("{} overlay build target(s) failed: {}", failed.len(), failed.join(", "))]
    BatchFailed { failed: Vec<String> },
}
