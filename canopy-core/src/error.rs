use thiserror::Error;

use canopy_model::{KeyPath, PathError, StoreError};

/// Errors surfaced by the tree.
#[derive(Error, Debug, Clone)]
pub enum TreeError {
    #[error("not found: {0}")]
    NotFound(KeyPath),

    #[error("already exists: {0}")]
    AlreadyExists(KeyPath),

    #[error("precondition failed for {0}")]
    PreconditionFailed(KeyPath),

    #[error("directory not empty: {0}")]
    NotEmpty(KeyPath),

    #[error("{path}: expected a {expected}")]
    TypeMismatch {
        path: KeyPath,
        expected: &'static str,
    },

    #[error("{0} is not loaded; resolve it first")]
    NotLoaded(KeyPath),

    #[error("cannot decode value at {path}: {reason}")]
    Decode { path: KeyPath, reason: String },

    #[error("type already registered for pattern {0:?}")]
    DuplicateType(String),

    #[error("env entry already present for {0}")]
    DuplicateEnv(&'static str),

    #[error("cannot delete the mount root")]
    RootDeletion,

    #[error("observer at {path} failed: {reason}")]
    ObserverFault { path: KeyPath, reason: String },

    #[error("watcher stopped: {0}")]
    WatchStopped(String),

    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for TreeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => TreeError::NotFound(path),
            StoreError::AlreadyExists(path) => TreeError::AlreadyExists(path),
            StoreError::PreconditionFailed(path) => TreeError::PreconditionFailed(path),
            StoreError::NotEmpty(path) => TreeError::NotEmpty(path),
            other => TreeError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TreeError>;
