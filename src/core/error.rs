//! Error types for the pipeline core.
//!
//! Every failure that crosses a component boundary is a typed variant here;
//! executor failures are converted into structured results at the engine
//! boundary and never surface as raw errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the project store and stage registry.
#[derive(Debug, Error)]
pub enum Error {
    /// A stage name that is not one of the five known stages.
    #[error("unknown stage name: {0}")]
    UnknownStage(String),

    /// A loaded record failed structural validation (missing stage keys,
    /// empty id or name).
    #[error("invalid project record: {0}")]
    InvalidRecord(String),

    /// The project directory skeleton could not be created.
    #[error("failed to create project structure at {path}")]
    CreateStructure {
        /// Directory that could not be created
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The project directory could not be removed.
    #[error("failed to remove project directory at {path}")]
    RemoveStructure {
        /// Directory that could not be removed
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The on-disk snapshot could not be read or written.
    #[error("failed to persist project snapshot at {path}")]
    Snapshot {
        /// Snapshot file path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The snapshot could not be encoded or decoded.
    #[error("failed to encode project snapshot")]
    Encode(#[from] serde_json::Error),

    /// The requested project does not exist.
    #[error("project {0} not found")]
    ProjectNotFound(String),
}

/// Convenience result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
