//! Public node handles.
//!
//! Handles are cheap `(Arc<Shared>, id)` pairs; the node records
//! themselves live in the arena. A handle to a node that has since been
//! deleted reports `NotFound`. Handles held across a placeholder
//! resolution transparently follow the forwarding stub to the resolved
//! node.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::Stream;

use canopy_model::{
    DeleteOptions, KeyPath, StoreError, TtlUpdate, Value, WriteOptions, path::split_rel,
};

use crate::error::{Result, TreeError};
use crate::notify::{self, NodeUpdate, ObserverFn};
use crate::registry::{TypeKind, TypeRegistry};
use crate::root;
use crate::tree::{NodeBody, NodeId, NodeKind, Shared, TreeState, ext_del_node, loader, tagged};

/// Handle to any node of a mounted tree.
#[derive(Clone)]
pub struct Node {
    pub(crate) shared: Arc<Shared>,
    pub(crate) id: NodeId,
    pub(crate) path: KeyPath,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("path", &self.path).finish()
    }
}

/// Filter for [`DirNode::tagged`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagFilter {
    /// Any entry whose name starts with the tag sentinel.
    Any,
    /// Entries with exactly this (sentinel-prefixed) name.
    Named(String),
}

/// A value accepted by the recursive directory write operations: either
/// a single leaf value or a map creating/updating a subtree.
#[derive(Clone, Debug)]
pub enum SetValue {
    Value(Value),
    Map(BTreeMap<String, SetValue>),
}

impl From<Value> for SetValue {
    fn from(value: Value) -> Self {
        SetValue::Value(value)
    }
}

impl From<&str> for SetValue {
    fn from(value: &str) -> Self {
        SetValue::Value(value.into())
    }
}

impl From<String> for SetValue {
    fn from(value: String) -> Self {
        SetValue::Value(value.into())
    }
}

impl From<i64> for SetValue {
    fn from(value: i64) -> Self {
        SetValue::Value(value.into())
    }
}

impl From<f64> for SetValue {
    fn from(value: f64) -> Self {
        SetValue::Value(value.into())
    }
}

impl From<bool> for SetValue {
    fn from(value: bool) -> Self {
        SetValue::Value(value.into())
    }
}

impl From<BTreeMap<String, SetValue>> for SetValue {
    fn from(map: BTreeMap<String, SetValue>) -> Self {
        SetValue::Map(map)
    }
}

impl TryFrom<&serde_json::Value> for SetValue {
    type Error = TreeError;

    fn try_from(value: &serde_json::Value) -> Result<Self> {
        use serde_json::Value as Json;
        Ok(match value {
            Json::String(s) => SetValue::Value(Value::Str(s.clone())),
            Json::Bool(b) => SetValue::Value(Value::Bool(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SetValue::Value(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    SetValue::Value(Value::Float(f))
                } else {
                    return Err(TreeError::Decode {
                        path: KeyPath::root(),
                        reason: format!("unrepresentable number {n}"),
                    });
                }
            }
            Json::Object(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), SetValue::try_from(v)?);
                }
                SetValue::Map(out)
            }
            Json::Null | Json::Array(_) => {
                return Err(TreeError::Decode {
                    path: KeyPath::root(),
                    reason: "only scalars and objects map onto tree entries".to_owned(),
                });
            }
        })
    }
}

/// Options for [`DirNode::set_opts`].
#[derive(Clone, Debug)]
pub struct SetOptions {
    /// Wait until the watcher has observed the write.
    pub sync: bool,
    /// Overwrite existing leaves; `false` only fills in missing entries.
    pub replace: bool,
    /// TTL in seconds stamped on written leaves.
    pub ttl: Option<u64>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            sync: true,
            replace: true,
            ttl: None,
        }
    }
}

/// Observer registration; dropping it unsubscribes.
pub struct Subscription {
    shared: Weak<Shared>,
    node: NodeId,
    id: u64,
    detached: bool,
}

impl Subscription {
    /// Keep the observer registered for the lifetime of the node.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock().unwrap();
            // Follow the forward in case the node was a placeholder that
            // has since resolved and carried the observer over.
            let node = state.deref(self.node);
            if let Some(node) = state.nodes.get_mut(&node) {
                node.observers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("detached", &self.detached)
            .finish()
    }
}

impl Node {
    pub(crate) fn from_state(shared: &Arc<Shared>, state: &TreeState, id: NodeId) -> Node {
        let path = state
            .nodes
            .get(&id)
            .map(|n| n.path.clone())
            .unwrap_or_default();
        Node {
            shared: shared.clone(),
            id,
            path,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TreeState> {
        self.shared.state.lock().unwrap()
    }

    fn read<R>(&self, f: impl FnOnce(&crate::tree::NodeData) -> R) -> Result<R> {
        let state = self.lock();
        let id = state.deref(self.id);
        state
            .nodes
            .get(&id)
            .map(f)
            .ok_or_else(|| TreeError::NotFound(self.path.clone()))
    }

    pub fn path(&self) -> &KeyPath {
        &self.path
    }

    pub fn name(&self) -> Option<&str> {
        self.path.name()
    }

    pub fn kind(&self) -> Result<NodeKind> {
        self.read(|n| n.kind())
    }

    pub fn modified_index(&self) -> Result<u64> {
        self.read(|n| n.modified)
    }

    pub fn created_index(&self) -> Result<Option<u64>> {
        self.read(|n| n.created)
    }

    /// Remaining TTL in seconds, computed locally; may go negative while
    /// the expiry event is still in flight.
    pub fn remaining_ttl(&self) -> Result<Option<f64>> {
        self.read(|n| n.remaining_ttl())
    }

    /// Whether no observer call is pending for this node.
    pub fn is_ready(&self) -> bool {
        self.read(|n| n.later.is_clean()).unwrap_or(true)
    }

    /// Wait until no observer call is pending.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = {
            let state = self.lock();
            let id = state.deref(self.id);
            match state.nodes.get(&id) {
                Some(node) => node.ready.subscribe(),
                None => return Ok(()),
            }
        };
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Coalescing delay in effect for this node.
    pub fn update_delay(&self) -> Result<Duration> {
        let state = self.lock();
        let id = state.deref(self.id);
        if state.nodes.contains_key(&id) {
            Ok(state.effective_delay(id))
        } else {
            Err(TreeError::NotFound(self.path.clone()))
        }
    }

    /// Override the coalescing delay for this node and its descendants.
    pub fn set_update_delay(&self, delay: Duration) -> Result<()> {
        let mut state = self.lock();
        let id = state.deref(self.id);
        state
            .nodes
            .get_mut(&id)
            .map(|n| n.delay_override = Some(delay))
            .ok_or_else(|| TreeError::NotFound(self.path.clone()))
    }

    /// Register an observer. Directory observers that register while the
    /// node is quiescent receive one synchronous call with every current
    /// child listed as added.
    ///
    /// The callback runs under the tree lock: read the [`NodeUpdate`],
    /// do not call back into the tree. Returning an `Err` stops the
    /// watcher, as a crashed observer leaves the mirror unsupervised.
    pub fn observe<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&NodeUpdate) -> Result<()> + Send + Sync + 'static,
    {
        let callback: ObserverFn = Arc::new(callback);
        let mut state = self.lock();
        let id = state.deref(self.id);
        let Some(node) = state.nodes.get(&id) else {
            return Err(TreeError::NotFound(self.path.clone()));
        };
        if node.later.is_clean() {
            if let NodeBody::Dir { children, .. } = &node.body {
                let update = NodeUpdate {
                    path: node.path.clone(),
                    kind: node.kind(),
                    is_new: Some(!node.fired),
                    value: None,
                    added: children.keys().cloned().collect(),
                    removed: Default::default(),
                    modified: node.modified,
                };
                callback(&update)?;
            }
        }
        let obs_id = state.next_observer();
        if let Some(node) = state.nodes.get_mut(&id) {
            node.observers.push((obs_id, callback));
        }
        Ok(Subscription {
            shared: Arc::downgrade(&self.shared),
            node: id,
            id: obs_id,
            detached: false,
        })
    }

    /// Run every pending observer in this subtree now, without waiting
    /// for coalescing timers.
    pub fn force_updated(&self) {
        let mut state = self.lock();
        let id = state.deref(self.id);
        notify::force_updated(&self.shared, &mut state, id, false);
    }

    /// Drain pending writes and wait until the watcher has applied
    /// `upto` (default: the last index written through this tree).
    pub async fn wait(&self, upto: Option<u64>) -> Result<u64> {
        root::wait_applied(&self.shared, upto).await
    }

    /// Resolve this node, loading it from the store if it is still a
    /// placeholder. Never returns a placeholder.
    pub async fn resolve(&self) -> Result<Node> {
        let id = {
            let state = self.lock();
            let id = state.deref(self.id);
            match state.nodes.get(&id) {
                None => return Err(TreeError::NotFound(self.path.clone())),
                Some(node) if node.kind() != NodeKind::Placeholder => {
                    return Ok(Node::from_state(&self.shared, &state, id));
                }
                Some(_) => id,
            }
        };
        let resolved = loader::resolve(&self.shared, id).await?;
        let state = self.lock();
        Ok(Node::from_state(&self.shared, &state, resolved))
    }

    /// Child lookup. On directories this returns the loaded child; on
    /// placeholders it produces a nested placeholder.
    pub fn get(&self, name: &str) -> Result<Node> {
        let mut state = self.lock();
        let id = state.deref(self.id);
        let kind = state
            .nodes
            .get(&id)
            .map(|n| n.kind())
            .ok_or_else(|| TreeError::NotFound(self.path.clone()))?;
        let child = match kind {
            NodeKind::Dir => state
                .nodes
                .get(&id)
                .and_then(|n| n.children())
                .and_then(|c| c.get(name).copied())
                .ok_or_else(|| TreeError::NotFound(self.path.child(name)))?,
            NodeKind::Placeholder => {
                let root_path = self.shared.root_path.clone();
                state.placeholder_child(id, name, &root_path)
            }
            NodeKind::Leaf => {
                return Err(TreeError::TypeMismatch {
                    path: self.path.clone(),
                    expected: "directory",
                });
            }
        };
        Ok(Node::from_state(&self.shared, &state, child))
    }

    pub fn as_dir(&self) -> Result<DirNode> {
        match self.kind()? {
            NodeKind::Dir => Ok(DirNode(self.clone())),
            NodeKind::Placeholder => Err(TreeError::NotLoaded(self.path.clone())),
            NodeKind::Leaf => Err(TreeError::TypeMismatch {
                path: self.path.clone(),
                expected: "directory",
            }),
        }
    }

    pub fn as_leaf(&self) -> Result<LeafNode> {
        match self.kind()? {
            NodeKind::Leaf => Ok(LeafNode(self.clone())),
            NodeKind::Placeholder => Err(TreeError::NotLoaded(self.path.clone())),
            NodeKind::Dir => Err(TreeError::TypeMismatch {
                path: self.path.clone(),
                expected: "leaf",
            }),
        }
    }

    /// Refresh this node's TTL.
    pub async fn set_ttl(&self, ttl: u64, sync: bool) -> Result<u64> {
        self.write_ttl(TtlUpdate::Set(ttl), sync).await
    }

    /// Remove this node's TTL (writes the empty TTL).
    pub async fn clear_ttl(&self, sync: bool) -> Result<u64> {
        self.write_ttl(TtlUpdate::Clear, sync).await
    }

    async fn write_ttl(&self, ttl: TtlUpdate, sync: bool) -> Result<u64> {
        let (kind, modified, encoded) = self.read(|n| {
            let encoded = match &n.body {
                NodeBody::Leaf { value } => n
                    .ty
                    .codec()
                    .map(|codec| (codec.encode)(value))
                    .transpose()
                    .map_err(|reason| TreeError::Decode {
                        path: n.path.clone(),
                        reason,
                    }),
                _ => Ok(None),
            };
            (n.kind(), n.modified, encoded)
        })?;
        let encoded = encoded?;
        let opts = WriteOptions {
            prev_exist: Some(true),
            prev_index: (kind == NodeKind::Leaf).then_some(modified),
            ttl: Some(ttl),
            dir: kind == NodeKind::Dir,
            ..WriteOptions::default()
        };
        let result = root::store_write(&self.shared, self.path.clone(), encoded, opts).await?;
        if sync {
            root::wait_applied(&self.shared, Some(result.modified)).await?;
        }
        Ok(result.modified)
    }
}

/// Handle to a directory node.
#[derive(Clone)]
pub struct DirNode(Node);

impl fmt::Debug for DirNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirNode").field("path", &self.0.path).finish()
    }
}

/// Handle to a leaf node.
#[derive(Clone)]
pub struct LeafNode(Node);

impl fmt::Debug for LeafNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafNode")
            .field("path", &self.0.path)
            .finish()
    }
}

impl std::ops::Deref for DirNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.0
    }
}

impl std::ops::Deref for LeafNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.0
    }
}

impl LeafNode {
    /// The decoded value.
    pub fn value(&self) -> Result<Value> {
        self.read(|n| match &n.body {
            NodeBody::Leaf { value } => Ok(value.clone()),
            _ => Err(TreeError::TypeMismatch {
                path: n.path.clone(),
                expected: "leaf",
            }),
        })?
    }

    /// Write a new value. The write is conditional on the leaf's current
    /// modification index, so losing a race against a concurrent writer
    /// surfaces as `PreconditionFailed`.
    pub async fn set(&self, value: impl Into<Value>, sync: bool) -> Result<u64> {
        self.set_with_ttl(value, None, sync).await
    }

    pub async fn set_with_ttl(
        &self,
        value: impl Into<Value>,
        ttl: Option<u64>,
        sync: bool,
    ) -> Result<u64> {
        let value = value.into();
        let (modified, encoded) = self.read(|n| {
            let codec = n.ty.codec().copied();
            (n.modified, codec)
        })?;
        let codec = encoded.ok_or_else(|| TreeError::TypeMismatch {
            path: self.path.clone(),
            expected: "leaf",
        })?;
        let encoded = (codec.encode)(&value).map_err(|reason| TreeError::Decode {
            path: self.path.clone(),
            reason,
        })?;
        let opts = WriteOptions {
            prev_index: Some(modified),
            ttl: ttl.map(TtlUpdate::Set),
            ..WriteOptions::default()
        };
        let result =
            root::store_write(&self.shared, self.path.clone(), Some(encoded), opts).await?;
        if sync {
            root::wait_applied(&self.shared, Some(result.modified)).await?;
        }
        Ok(result.modified)
    }

    /// Delete this leaf, conditional on its current modification index.
    pub async fn delete(&self, sync: bool) -> Result<u64> {
        let modified = self.read(|n| n.modified)?;
        let opts = DeleteOptions {
            prev_index: Some(modified),
            ..DeleteOptions::default()
        };
        let result = root::store_delete(&self.shared, self.path.clone(), opts).await?;
        if sync {
            root::wait_applied(&self.shared, Some(result.modified)).await?;
        }
        Ok(result.modified)
    }
}

impl DirNode {
    pub(crate) fn from_node(node: Node) -> DirNode {
        DirNode(node)
    }

    pub fn node(&self) -> &Node {
        &self.0
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.read(|n| match n.children() {
            Some(children) => children.keys().cloned().collect(),
            None => Vec::new(),
        })
    }

    pub fn entries(&self) -> Result<Vec<(String, Node)>> {
        let state = self.lock();
        let id = state.deref(self.id);
        let node = state
            .nodes
            .get(&id)
            .ok_or_else(|| TreeError::NotFound(self.path.clone()))?;
        let mut out = Vec::new();
        if let Some(children) = node.children() {
            for (name, child) in children {
                out.push((name.clone(), Node::from_state(&self.shared, &state, *child)));
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize> {
        self.read(|n| n.children().map(BTreeMap::len).unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        self.read(|n| {
            n.children()
                .map(|c| c.contains_key(name))
                .unwrap_or(false)
        })
    }

    /// Child lookup that does not create placeholders.
    pub fn try_get(&self, name: &str) -> Option<Node> {
        let state = self.lock();
        let id = state.deref(self.id);
        let child = state
            .nodes
            .get(&id)
            .and_then(|n| n.children())
            .and_then(|c| c.get(name).copied())?;
        Some(Node::from_state(&self.shared, &state, child))
    }

    /// Decoded value of a leaf child.
    pub fn value_of(&self, name: &str) -> Result<Value> {
        self.get(name)?.as_leaf()?.value()
    }

    /// Synchronous path lookup. Fails with `NotLoaded` when an
    /// intermediate directory has not been materialised yet.
    pub fn lookup(&self, rel: &str) -> Result<Node> {
        let segments = split_rel(rel)?;
        let state = self.lock();
        let mut id = state.deref(self.id);
        for (i, seg) in segments.iter().enumerate() {
            let node = state
                .nodes
                .get(&id)
                .ok_or_else(|| TreeError::NotFound(self.path.clone()))?;
            match node.kind() {
                NodeKind::Placeholder => return Err(TreeError::NotLoaded(node.path.clone())),
                NodeKind::Leaf => {
                    return Err(TreeError::TypeMismatch {
                        path: node.path.clone(),
                        expected: "directory",
                    });
                }
                NodeKind::Dir => {}
            }
            id = node
                .children()
                .and_then(|c| c.get(seg).copied())
                .map(|c| state.deref(c))
                .ok_or_else(|| {
                    TreeError::NotFound(self.path.join(segments[..=i].iter().map(String::as_str)))
                })?;
        }
        Ok(Node::from_state(&self.shared, &state, id))
    }

    /// Path lookup that resolves placeholders along the way.
    pub async fn fetch(&self, rel: &str) -> Result<Node> {
        let segments = split_rel(rel)?;
        let mut node = self.0.clone().resolve().await?;
        for seg in &segments {
            node = node.get(seg)?.resolve().await?;
        }
        Ok(node)
    }

    /// Find or create a subdirectory.
    ///
    /// `create = Some(true)` insists on creating it (`AlreadyExists`
    /// otherwise), `Some(false)` insists on finding it (`NotFound`
    /// otherwise), `None` takes either.
    pub async fn subdir(&self, rel: &str, create: Option<bool>) -> Result<DirNode> {
        match self.fetch(rel).await {
            Ok(node) => {
                if create == Some(true) {
                    return Err(TreeError::AlreadyExists(node.path.clone()));
                }
                node.as_dir()
            }
            Err(TreeError::NotFound(_)) if create != Some(false) => {
                let segments = split_rel(rel)?;
                let path = self.path.join(segments.iter().map(String::as_str));
                let opts = WriteOptions {
                    prev_exist: Some(false),
                    dir: true,
                    ..WriteOptions::default()
                };
                let modified =
                    match root::store_write(&self.shared, path.clone(), None, opts).await {
                        Ok(result) => result.modified,
                        // Lost a creation race; the directory is there.
                        Err(TreeError::AlreadyExists(_)) if create.is_none() => {
                            self.shared.client.read(&path, false).await
                                .map_err(TreeError::from)?
                                .modified
                        }
                        Err(err) => return Err(err),
                    };
                root::wait_applied(&self.shared, Some(modified)).await?;
                self.fetch(rel).await?.as_dir()
            }
            Err(err) => Err(err),
        }
    }

    /// Create or update the entry `key`.
    ///
    /// A [`SetValue::Map`] recursively creates/updates a subtree; no
    /// entries are deleted. Writing a map over an existing leaf (or a
    /// scalar over an existing directory) is a type error.
    pub async fn set(&self, key: &str, value: impl Into<SetValue>, sync: bool) -> Result<u64> {
        self.set_opts(
            key,
            value.into(),
            &SetOptions {
                sync,
                ..SetOptions::default()
            },
        )
        .await
    }

    pub async fn set_opts(&self, key: &str, value: SetValue, opts: &SetOptions) -> Result<u64> {
        let modified = self.set_inner(key, value, opts).await?;
        if opts.sync && modified > 0 {
            root::wait_applied(&self.shared, Some(modified)).await?;
        }
        Ok(modified)
    }

    fn set_inner<'a>(
        &'a self,
        key: &'a str,
        value: SetValue,
        opts: &'a SetOptions,
    ) -> futures::future::BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let existing = {
                let state = self.lock();
                let id = state.deref(self.id);
                state
                    .nodes
                    .get(&id)
                    .and_then(|n| n.children())
                    .and_then(|c| c.get(key).copied())
                    .and_then(|c| {
                        let c = state.deref(c);
                        state.nodes.get(&c).map(|n| (c, n.kind()))
                    })
            };
            let child_opts = SetOptions {
                sync: false,
                ..opts.clone()
            };
            match existing {
                None => self.create_subtree(vec![key.to_owned()], value, opts).await,
                Some((child, NodeKind::Placeholder)) => {
                    let resolved = loader::resolve(&self.shared, child).await?;
                    let node = {
                        let state = self.lock();
                        Node::from_state(&self.shared, &state, resolved)
                    };
                    match node.kind()? {
                        NodeKind::Dir => {
                            DirNode(node).set_map(value, &child_opts).await
                        }
                        _ => {
                            let leaf = node.as_leaf()?;
                            set_leaf(&leaf, value, &child_opts).await
                        }
                    }
                }
                Some((child, NodeKind::Leaf)) => {
                    let leaf = {
                        let state = self.lock();
                        LeafNode(Node::from_state(&self.shared, &state, child))
                    };
                    set_leaf(&leaf, value, &child_opts).await
                }
                Some((child, NodeKind::Dir)) => {
                    let dir = {
                        let state = self.lock();
                        DirNode(Node::from_state(&self.shared, &state, child))
                    };
                    dir.set_map(value, &child_opts).await
                }
            }
        })
    }

    async fn set_map(&self, value: SetValue, opts: &SetOptions) -> Result<u64> {
        let SetValue::Map(entries) = value else {
            return Err(TreeError::TypeMismatch {
                path: self.path.clone(),
                expected: "leaf",
            });
        };
        let mut modified = 0;
        for (key, value) in entries {
            modified = self.set_inner(&key, value, opts).await?;
        }
        Ok(modified)
    }

    /// Write a subtree that does not exist locally yet, straight to the
    /// store. The watcher materialises it when the events echo back.
    fn create_subtree<'a>(
        &'a self,
        rel: Vec<String>,
        value: SetValue,
        opts: &'a SetOptions,
    ) -> futures::future::BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            match value {
                SetValue::Map(entries) if entries.is_empty() => {
                    let path = self.path.join(rel.iter().map(String::as_str));
                    let result = root::store_write(
                        &self.shared,
                        path,
                        None,
                        WriteOptions::directory(),
                    )
                    .await?;
                    Ok(result.modified)
                }
                SetValue::Map(entries) => {
                    let mut modified = 0;
                    for (key, value) in entries {
                        let mut rel = rel.clone();
                        rel.push(key);
                        modified = self.create_subtree(rel, value, opts).await?;
                    }
                    Ok(modified)
                }
                SetValue::Value(value) => {
                    let encoded = {
                        let state = self.lock();
                        let id = state.deref(self.id);
                        let ty = state.resolve_type(id, &rel, TypeKind::Leaf);
                        let codec = ty.codec().ok_or_else(|| TreeError::TypeMismatch {
                            path: self.path.clone(),
                            expected: "leaf",
                        })?;
                        (codec.encode)(&value).map_err(|reason| TreeError::Decode {
                            path: self.path.join(rel.iter().map(String::as_str)),
                            reason,
                        })?
                    };
                    let path = self.path.join(rel.iter().map(String::as_str));
                    let write_opts = WriteOptions {
                        ttl: opts.ttl.map(TtlUpdate::Set),
                        ..WriteOptions::default()
                    };
                    let result =
                        root::store_write(&self.shared, path, Some(encoded), write_opts).await?;
                    Ok(result.modified)
                }
            }
        })
    }

    /// Batched [`DirNode::set`]; only the final write is awaited.
    pub async fn update<I>(&self, entries: I, sync: bool) -> Result<Option<u64>>
    where
        I: IntoIterator<Item = (String, SetValue)>,
    {
        let mut modified = None;
        for (key, value) in entries {
            modified = Some(
                self.set_opts(
                    &key,
                    value,
                    &SetOptions {
                        sync: false,
                        ..SetOptions::default()
                    },
                )
                .await?,
            );
        }
        if sync {
            if let Some(modified) = modified {
                root::wait_applied(&self.shared, Some(modified)).await?;
            }
        }
        Ok(modified)
    }

    /// Append a new entry under a store-assigned monotonic name.
    /// Returns the assigned name and the final modification index.
    pub async fn push(&self, value: impl Into<SetValue>, sync: bool) -> Result<(String, u64)> {
        let (name, modified) = match value.into() {
            SetValue::Value(value) => {
                let encoded = {
                    let state = self.lock();
                    let id = state.deref(self.id);
                    let ty = state.resolve_type(id, &["0".to_owned()], TypeKind::Leaf);
                    let codec = ty.codec().ok_or_else(|| TreeError::TypeMismatch {
                        path: self.path.clone(),
                        expected: "leaf",
                    })?;
                    (codec.encode)(&value).map_err(|reason| TreeError::Decode {
                        path: self.path.clone(),
                        reason,
                    })?
                };
                let opts = WriteOptions {
                    append: true,
                    ..WriteOptions::default()
                };
                let result =
                    root::store_write(&self.shared, self.path.clone(), Some(encoded), opts)
                        .await?;
                let name = result
                    .key
                    .name()
                    .ok_or_else(|| {
                        TreeError::Store(StoreError::Transport(
                            "append result carries no key".to_owned(),
                        ))
                    })?
                    .to_owned();
                (name, result.modified)
            }
            SetValue::Map(entries) => {
                let opts = WriteOptions {
                    append: true,
                    dir: true,
                    ..WriteOptions::default()
                };
                let result =
                    root::store_write(&self.shared, self.path.clone(), None, opts).await?;
                let name = result
                    .key
                    .name()
                    .ok_or_else(|| {
                        TreeError::Store(StoreError::Transport(
                            "append result carries no key".to_owned(),
                        ))
                    })?
                    .to_owned();
                let mut modified = result.modified;
                for (key, value) in entries {
                    modified = self
                        .create_subtree(
                            vec![name.clone(), key],
                            value,
                            &SetOptions {
                                sync: false,
                                ..SetOptions::default()
                            },
                        )
                        .await?;
                }
                (name, modified)
            }
        };
        if sync {
            root::wait_applied(&self.shared, Some(modified)).await?;
        }
        Ok((name, modified))
    }

    /// Delete the child `key`.
    ///
    /// `recursive = Some(false)` refuses to delete non-empty
    /// directories, `Some(true)` deletes loaded children depth-first
    /// before asking the store for a recursive delete, `None` hands the
    /// whole decision to the store.
    pub async fn remove(&self, key: &str, recursive: Option<bool>, sync: bool) -> Result<u64> {
        let child = {
            let state = self.lock();
            let id = state.deref(self.id);
            let child = state
                .nodes
                .get(&id)
                .and_then(|n| n.children())
                .and_then(|c| c.get(key).copied())
                .ok_or_else(|| TreeError::NotFound(self.path.child(key)))?;
            let child = state.deref(child);
            Node::from_state(&self.shared, &state, child)
        };
        let modified = delete_node(&child, recursive).await?;
        if sync {
            root::wait_applied(&self.shared, Some(modified)).await?;
        }
        Ok(modified)
    }

    /// Delete this directory itself.
    pub async fn delete_self(&self, recursive: Option<bool>, sync: bool) -> Result<u64> {
        if self.read(|n| n.parent.is_none())? {
            return Err(TreeError::RootDeletion);
        }
        let modified = delete_node(&self.0, recursive).await?;
        if sync {
            root::wait_applied(&self.shared, Some(modified)).await?;
        }
        Ok(modified)
    }

    /// Lazy traversal of descendant tag entries. Tag entries themselves
    /// are never descended into.
    pub fn tagged(
        &self,
        filter: TagFilter,
        depth: usize,
    ) -> impl Stream<Item = Result<Node>> + Send + 'static {
        tagged::stream(self.clone(), filter, depth)
    }

    /// Install a registry consulted first for children of this
    /// directory.
    pub fn set_local_types(&self, types: Arc<TypeRegistry>) -> Result<()> {
        let mut state = self.lock();
        let id = state.deref(self.id);
        match state.nodes.get_mut(&id).map(|n| &mut n.body) {
            Some(NodeBody::Dir { local_types, .. }) => {
                *local_types = Some(types);
                Ok(())
            }
            _ => Err(TreeError::NotFound(self.path.clone())),
        }
    }
}

async fn set_leaf(leaf: &LeafNode, value: SetValue, opts: &SetOptions) -> Result<u64> {
    let SetValue::Value(value) = value else {
        return Err(TreeError::TypeMismatch {
            path: leaf.path.clone(),
            expected: "directory",
        });
    };
    if !opts.replace {
        return leaf.modified_index();
    }
    leaf.set_with_ttl(value, opts.ttl, false).await
}

/// Delete a node of any kind via the store, mirroring the local state
/// for placeholders (which the watcher cannot notify us about if the
/// store never knew the key).
fn delete_node<'a>(
    node: &'a Node,
    recursive: Option<bool>,
) -> futures::future::BoxFuture<'a, Result<u64>> {
    Box::pin(async move {
        match node.kind()? {
            NodeKind::Leaf => {
                let leaf = LeafNode(node.clone());
                leaf.delete(false).await
            }
            NodeKind::Dir => {
                if recursive == Some(true) {
                    let children = {
                        let state = node.shared.state.lock().unwrap();
                        let id = state.deref(node.id);
                        state
                            .nodes
                            .get(&id)
                            .and_then(|n| n.children())
                            .map(|c| {
                                c.values()
                                    .map(|child| {
                                        Node::from_state(&node.shared, &state, state.deref(*child))
                                    })
                                    .collect::<Vec<_>>()
                            })
                            .unwrap_or_default()
                    };
                    for child in children {
                        if child.kind().is_ok() {
                            delete_node(&child, recursive).await?;
                        }
                    }
                }
                let opts = DeleteOptions {
                    dir: true,
                    recursive: recursive != Some(false),
                    ..DeleteOptions::default()
                };
                let result =
                    root::store_delete(&node.shared, node.path.clone(), opts).await?;
                Ok(result.modified)
            }
            NodeKind::Placeholder => {
                // Drop the local stand-in first; the store delete echoes
                // back only if the key really existed.
                {
                    let mut state = node.shared.state.lock().unwrap();
                    let id = state.deref(node.id);
                    if state
                        .nodes
                        .get(&id)
                        .is_some_and(|n| n.kind() == NodeKind::Placeholder)
                    {
                        ext_del_node(&node.shared, &mut state, id);
                    }
                }
                let opts = DeleteOptions {
                    dir: true,
                    recursive: recursive != Some(false),
                    ..DeleteOptions::default()
                };
                let result =
                    root::store_delete(&node.shared, node.path.clone(), opts).await?;
                Ok(result.modified)
            }
        }
    })
}
