//! The node arena and its structural primitives.
//!
//! All nodes of a mounted tree live in one [`TreeState`] behind a single
//! mutex; handles address them by id. In-memory walks and notification
//! bookkeeping therefore happen atomically with respect to every other
//! operation, which is what the coalescing state machine relies on.
//! Parent and root references are ids, never ownership.

pub(crate) mod loader;
mod node;
mod tagged;

pub use node::{DirNode, LeafNode, Node, SetOptions, SetValue, Subscription, TagFilter};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use canopy_model::{KeyPath, TAG_SENTINEL, Value};

use crate::env::Env;
use crate::notify::{self, Later, LaterWanted, ObserverFn};
use crate::registry::{NodeType, TypeKind, TypeRegistry, types};
use crate::root::Pump;
use crate::store::StoreClient;
use crate::watcher::WatchSync;

pub(crate) type NodeId = u64;

/// What a node currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    Leaf,
    /// Known to exist but not loaded yet.
    Placeholder,
}

/// Kind-specific node payload.
pub(crate) enum NodeBody {
    Dir {
        children: BTreeMap<String, NodeId>,
        /// Child names discovered since the last observer call.
        added: BTreeSet<String>,
        /// Child names dropped since the last observer call.
        removed: BTreeSet<String>,
        /// Per-directory registry overriding all other type sources.
        local_types: Option<Arc<TypeRegistry>>,
    },
    Leaf {
        value: Value,
    },
    Placeholder {
        children: BTreeMap<String, NodeId>,
        /// Set once resolved; stale handles follow this forward.
        resolved: Option<NodeId>,
    },
}

impl NodeBody {
    pub(crate) fn empty_dir() -> Self {
        NodeBody::Dir {
            children: BTreeMap::new(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            local_types: None,
        }
    }

    pub(crate) fn placeholder() -> Self {
        NodeBody::Placeholder {
            children: BTreeMap::new(),
            resolved: None,
        }
    }
}

pub(crate) struct NodeData {
    pub(crate) parent: Option<NodeId>,
    pub(crate) name: String,
    pub(crate) path: KeyPath,
    pub(crate) ty: Arc<NodeType>,
    pub(crate) body: NodeBody,
    /// Last store modification index applied to this node.
    pub(crate) modified: u64,
    /// Creation index of the current incarnation.
    pub(crate) created: Option<u64>,
    /// TTL in seconds as of `stamp`.
    pub(crate) ttl: Option<u64>,
    pub(crate) stamp: Instant,
    pub(crate) later: Later,
    pub(crate) pending_seq: u64,
    pub(crate) later_wanted: LaterWanted,
    pub(crate) propagate: bool,
    /// Observers have been called at least once.
    pub(crate) fired: bool,
    pub(crate) deleted: bool,
    pub(crate) ready: watch::Sender<bool>,
    pub(crate) observers: Vec<(u64, ObserverFn)>,
    /// Serialises placeholder resolution under this node.
    pub(crate) resolve_lock: Arc<tokio::sync::Mutex<()>>,
    pub(crate) delay_override: Option<Duration>,
    /// Placeholder this node was resolved from, for stub cleanup.
    pub(crate) origin: Option<NodeId>,
}

impl NodeData {
    pub(crate) fn kind(&self) -> NodeKind {
        match &self.body {
            NodeBody::Dir { .. } => NodeKind::Dir,
            NodeBody::Leaf { .. } => NodeKind::Leaf,
            NodeBody::Placeholder { .. } => NodeKind::Placeholder,
        }
    }

    pub(crate) fn children(&self) -> Option<&BTreeMap<String, NodeId>> {
        match &self.body {
            NodeBody::Dir { children, .. } | NodeBody::Placeholder { children, .. } => {
                Some(children)
            }
            NodeBody::Leaf { .. } => None,
        }
    }

    /// Remaining TTL in seconds; negative once the expiry event is due
    /// but not yet observed.
    pub(crate) fn remaining_ttl(&self) -> Option<f64> {
        self.ttl
            .map(|ttl| ttl as f64 - self.stamp.elapsed().as_secs_f64())
    }
}

/// Everything a mounted tree owns.
pub(crate) struct Shared {
    pub(crate) state: Mutex<TreeState>,
    pub(crate) client: Arc<dyn StoreClient>,
    pub(crate) root_path: KeyPath,
    pub(crate) env: Env,
    pub(crate) static_mode: bool,
    pub(crate) pump: Pump,
    pub(crate) sync: WatchSync,
}

pub(crate) struct TreeState {
    pub(crate) nodes: HashMap<NodeId, NodeData>,
    pub(crate) root: NodeId,
    pub(crate) update_delay: Duration,
    pub(crate) last_mod: u64,
    next_node: NodeId,
    next_observer: u64,
    next_epoch: u64,
}

impl TreeState {
    pub(crate) fn new(update_delay: Duration) -> Self {
        Self {
            nodes: HashMap::new(),
            root: 0,
            update_delay,
            last_mod: 0,
            next_node: 0,
            next_observer: 0,
            next_epoch: 0,
        }
    }

    pub(crate) fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    pub(crate) fn next_observer(&mut self) -> u64 {
        self.next_observer += 1;
        self.next_observer
    }

    /// Create a node record; the caller attaches it to its parent.
    pub(crate) fn new_node(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        ty: Arc<NodeType>,
        body: NodeBody,
        root_path: &KeyPath,
    ) -> NodeId {
        self.next_node += 1;
        let id = self.next_node;
        let path = match parent.and_then(|p| self.nodes.get(&p)) {
            Some(parent) => parent.path.child(name),
            None => root_path.clone(),
        };
        let propagate = ty
            .propagate()
            .unwrap_or_else(|| !name.starts_with(TAG_SENTINEL));
        let (ready, _) = watch::channel(true);
        self.nodes.insert(
            id,
            NodeData {
                parent,
                name: name.to_owned(),
                path,
                ty,
                body,
                modified: 0,
                created: None,
                ttl: None,
                stamp: Instant::now(),
                later: Later::Clean,
                pending_seq: 0,
                later_wanted: LaterWanted::default(),
                propagate,
                fired: false,
                deleted: false,
                ready,
                observers: Vec::new(),
                resolve_lock: Arc::new(tokio::sync::Mutex::new(())),
                delay_override: None,
                origin: None,
            },
        );
        id
    }

    /// Put `child` into its parent's map. `announce` records the name in
    /// the parent's `added` accumulator (skipped when the child merely
    /// replaces a placeholder of the same name).
    pub(crate) fn attach(&mut self, parent: NodeId, name: &str, child: NodeId, announce: bool) {
        let Some(parent) = self.nodes.get_mut(&parent) else {
            return;
        };
        match &mut parent.body {
            NodeBody::Dir {
                children, added, ..
            } => {
                let previous = children.insert(name.to_owned(), child);
                if announce && previous.is_none() {
                    added.insert(name.to_owned());
                }
            }
            NodeBody::Placeholder { children, .. } => {
                children.insert(name.to_owned(), child);
            }
            NodeBody::Leaf { .. } => unreachable!("leaf cannot hold children"),
        }
    }

    /// Get-or-create the placeholder child `name` of `parent`.
    pub(crate) fn placeholder_child(
        &mut self,
        parent: NodeId,
        name: &str,
        root_path: &KeyPath,
    ) -> NodeId {
        if let Some(existing) = self
            .nodes
            .get(&parent)
            .and_then(|p| p.children())
            .and_then(|c| c.get(name))
        {
            return *existing;
        }
        let announce = matches!(
            self.nodes.get(&parent).map(|p| p.kind()),
            Some(NodeKind::Dir)
        );
        let id = self.new_node(
            Some(parent),
            name,
            types::dir(),
            NodeBody::placeholder(),
            root_path,
        );
        self.attach(parent, name, id, announce);
        id
    }

    /// Follow resolved-placeholder forwards.
    pub(crate) fn deref(&self, mut id: NodeId) -> NodeId {
        loop {
            match self.nodes.get(&id) {
                Some(NodeData {
                    body:
                        NodeBody::Placeholder {
                            resolved: Some(next),
                            ..
                        },
                    ..
                }) => id = *next,
                _ => return id,
            }
        }
    }

    pub(crate) fn child_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&id)
            .and_then(|n| n.children())
            .map(|c| c.values().copied().collect())
            .unwrap_or_default()
    }

    /// Coalescing delay for a node: nearest override up the chain, else
    /// the tree default.
    pub(crate) fn effective_delay(&self, id: NodeId) -> Duration {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            if let Some(delay) = node.delay_override {
                return delay;
            }
            cursor = node.parent;
        }
        self.update_delay
    }

    /// Decide the type for a prospective child.
    ///
    /// Walks the override chain: first the directory's local registry,
    /// then the descriptor's scoped registry, then (while directories
    /// inherit) the parent with the path prefixed by the directory's own
    /// name. Falls back to the built-in defaults.
    pub(crate) fn resolve_type(
        &self,
        dir: NodeId,
        rel: &[String],
        kind: TypeKind,
    ) -> Arc<NodeType> {
        let mut id = dir;
        let mut rel = rel.to_vec();
        loop {
            let Some(node) = self.nodes.get(&id) else {
                break;
            };
            if let NodeBody::Dir {
                local_types: Some(reg),
                ..
            } = &node.body
            {
                if let Some(ty) = reg.lookup(&rel, kind) {
                    return ty;
                }
            }
            if let Some(reg) = node.ty.scoped() {
                if let Some(ty) = reg.lookup(&rel, kind) {
                    return ty;
                }
            }
            let Some(parent) = node.parent else {
                break;
            };
            let inherit = node
                .ty
                .inherit()
                .unwrap_or_else(|| !node.name.starts_with(TAG_SENTINEL));
            if !inherit {
                break;
            }
            rel.insert(0, node.name.clone());
            id = parent;
        }
        match kind {
            TypeKind::Dir => types::dir(),
            TypeKind::Leaf => types::string(),
        }
    }
}

/// Announce a freshly inserted real node: schedule its first observer
/// call and, for non-propagating (tag) entries, mark the parent directly.
pub(crate) fn after_insert(shared: &Arc<Shared>, state: &mut TreeState, id: NodeId, seq: u64) {
    notify::updated(shared, state, id, seq, false);
    let Some(node) = state.nodes.get(&id) else {
        return;
    };
    if !node.propagate {
        if let Some(parent) = node.parent {
            notify::updated(shared, state, parent, seq, false);
        }
    }
}

/// Remove a subtree the way the watcher sees deletions: children first,
/// each detachment firing deletion observers and feeding the parent's
/// `removed` accumulator.
pub(crate) fn ext_delete(shared: &Arc<Shared>, state: &mut TreeState, id: NodeId) {
    for child in state.child_ids(id) {
        ext_delete(shared, state, child);
    }
    ext_del_node(shared, state, id);
}

/// Detach one node from its parent and run its deletion notification.
pub(crate) fn ext_del_node(shared: &Arc<Shared>, state: &mut TreeState, id: NodeId) {
    let Some((parent, name, kind)) = state
        .nodes
        .get(&id)
        .map(|n| (n.parent, n.name.clone(), n.kind()))
    else {
        return;
    };
    let mut parent_seq = None;
    if let Some(pid) = parent {
        if let Some(parent) = state.nodes.get_mut(&pid) {
            match &mut parent.body {
                NodeBody::Dir {
                    children, removed, ..
                } => {
                    children.remove(&name);
                    removed.insert(name.clone());
                    if kind == NodeKind::Placeholder {
                        // Placeholders carry no deletion notification of
                        // their own; mark the parent here instead.
                        parent_seq = Some(parent.modified);
                    }
                }
                NodeBody::Placeholder { children, .. } => {
                    children.remove(&name);
                }
                NodeBody::Leaf { .. } => {}
            }
        }
    }
    if kind == NodeKind::Placeholder {
        state.nodes.remove(&id);
        if let (Some(pid), Some(seq)) = (parent, parent_seq) {
            notify::updated(shared, state, pid, seq, false);
        }
        return;
    }
    notify::node_deleted(shared, state, id);
    if let Some(node) = state.nodes.remove(&id) {
        // Drop the forwarding stub chain this node grew out of.
        let mut origin = node.origin;
        while let Some(stub) = origin {
            origin = state.nodes.remove(&stub).and_then(|n| n.origin);
        }
    }
}
