//! A live, typed, observable in-memory mirror of a watched subtree of a
//! hierarchical key-value store.
//!
//! [`Tree::mount`] reads a store subtree and keeps an in-memory node
//! tree in sync with it: a background watcher applies the store's
//! change events in index order, writes issued through the tree are
//! serialised and echoed back by the watcher, and observers registered
//! on any node fire once per coalesced burst of changes with
//! added/removed child summaries. Subtrees load lazily through
//! placeholders, and a pattern registry decides which node type (value
//! codec, priority, preload needs) each path materialises as.
//!
//! The store itself stays behind the [`StoreClient`] trait; anything
//! exposing indexed reads, conditional writes, and an ordered change
//! stream can back a tree.

pub mod env;
pub mod error;
pub mod registry;
pub mod store;

mod notify;
mod root;
mod tree;
mod watcher;

pub use canopy_model as model;

pub use env::Env;
pub use error::{Result, TreeError};
pub use notify::NodeUpdate;
pub use registry::{Codec, NodeType, Preload, SlotKind, TypeKind, TypeRegistry, types};
pub use root::{Tree, TreeOptions};
pub use store::StoreClient;
pub use tree::{
    DirNode, LeafNode, Node, NodeKind, SetOptions, SetValue, Subscription, TagFilter,
};
