//! The store client seam.
//!
//! The tree never talks to a concrete backend; everything it needs is
//! expressed through [`StoreClient`]. Implementations wrap whatever
//! transport the deployment uses and are free to be shared between
//! multiple mounted trees.

use async_trait::async_trait;
use futures::stream::BoxStream;

use canopy_model::{ChangeEvent, DeleteOptions, KeyPath, StoreError, StoreNode, WriteOptions};

/// Client for a hierarchical key-value store with indexed modifications
/// and a change-event stream.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Read a key, optionally with its whole subtree.
    async fn read(&self, key: &KeyPath, recursive: bool) -> Result<StoreNode, StoreError>;

    /// Create or update a key. `value` is `None` for directories.
    async fn write(
        &self,
        key: &KeyPath,
        value: Option<String>,
        opts: WriteOptions,
    ) -> Result<StoreNode, StoreError>;

    /// Delete a key.
    async fn delete(&self, key: &KeyPath, opts: DeleteOptions) -> Result<StoreNode, StoreError>;

    /// Stream change events under `key`, starting at `from_index`.
    ///
    /// Events must arrive in non-decreasing `modified` order. The stream
    /// ends (or yields an error) only when watching has failed for good.
    fn watch(
        &self,
        key: &KeyPath,
        from_index: u64,
        recursive: bool,
    ) -> BoxStream<'static, Result<ChangeEvent, StoreError>>;
}
