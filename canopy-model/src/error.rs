use thiserror::Error;

use crate::path::KeyPath;

/// Malformed path input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path {0:?} is not absolute")]
    NotAbsolute(String),

    #[error("path {0:?} contains an empty segment")]
    EmptySegment(String),

    #[error("path segment {0:?} contains a separator")]
    SeparatorInSegment(String),
}

/// Failures reported by the backing key-value store.
///
/// The first five map onto etcd-v2 style protocol errors; everything the
/// transport itself produces is folded into [`StoreError::Transport`].
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(KeyPath),

    #[error("key already exists: {0}")]
    AlreadyExists(KeyPath),

    #[error("precondition failed for {0}")]
    PreconditionFailed(KeyPath),

    #[error("directory not empty: {0}")]
    NotEmpty(KeyPath),

    #[error("not a directory: {0}")]
    NotDir(KeyPath),

    #[error("transport error: {0}")]
    Transport(String),
}
