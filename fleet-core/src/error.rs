//! Error types for fleet-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ObjectClass, ObjectId};

/// All errors that can arise from object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse store file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.fleet/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// A version bump was requested for an id the store has never seen.
    #[error("object {id} not found")]
    ObjectNotFound { id: ObjectId },

    /// A new version tried to change the class of an existing object.
    #[error("object {id} is a {existing}, refusing to store it as a {requested}")]
    ClassMismatch {
        id: ObjectId,
        existing: ObjectClass,
        requested: ObjectClass,
    },
}
