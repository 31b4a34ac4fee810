use crate::path::KeyPath;

/// A node as returned by the store's read/write/delete calls.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StoreNode {
    pub key: KeyPath,
    pub value: Option<String>,
    pub dir: bool,
    pub modified: u64,
    pub created: u64,
    /// Remaining time-to-live in whole seconds.
    pub ttl: Option<u64>,
    /// The store's global index at response time. Watch streams are
    /// started from here to avoid missing events after an initial read.
    pub index: u64,
    /// Fetched children; one level for shallow reads, the whole subtree
    /// for recursive ones.
    pub nodes: Vec<StoreNode>,
}

impl StoreNode {
    /// Find a direct child by name.
    pub fn child(&self, name: &str) -> Option<&StoreNode> {
        self.nodes.iter().find(|n| n.key.name() == Some(name))
    }

    /// Last segment of the node's key.
    pub fn name(&self) -> Option<&str> {
        self.key.name()
    }
}

/// TTL change carried by a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TtlUpdate {
    /// Expire the entry after this many seconds.
    Set(u64),
    /// The "empty TTL": remove any expiry from the entry.
    Clear,
}

/// Options for a store write.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WriteOptions {
    /// `Some(true)`: the key must exist. `Some(false)`: it must not.
    pub prev_exist: Option<bool>,
    /// Conditional write: fails unless the key's current modified index
    /// matches.
    pub prev_index: Option<u64>,
    /// Conditional write: fails unless the key's current value matches.
    pub prev_value: Option<String>,
    pub ttl: Option<TtlUpdate>,
    /// Create/refresh a directory instead of a leaf.
    pub dir: bool,
    /// Create a new child with a store-assigned monotonic name; the
    /// result's key carries the assigned name as its last segment.
    pub append: bool,
}

impl WriteOptions {
    pub fn with_prev_index(index: u64) -> Self {
        Self {
            prev_index: Some(index),
            ..Self::default()
        }
    }

    pub fn directory() -> Self {
        Self {
            dir: true,
            ..Self::default()
        }
    }
}

/// Options for a store delete.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeleteOptions {
    pub prev_index: Option<u64>,
    pub prev_value: Option<String>,
    pub dir: bool,
    pub recursive: bool,
}
