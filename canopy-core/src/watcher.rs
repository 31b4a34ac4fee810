//! The background event pipeline.
//!
//! A single task consumes the store's change stream and applies events
//! to the tree in index order, under the tree mutex, so observers always
//! see whole events. `last_seen` advances per applied event and feeds
//! the `wait` barrier. Any failure stops the watcher for good: the tree
//! freezes at the last applied index and mutating calls fail fast.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use canopy_model::ChangeEvent;

use crate::error::{Result, TreeError};
use crate::notify;
use crate::registry::{Preload, TypeKind};
use crate::tree::{
    NodeBody, NodeId, NodeKind, Shared, TreeState, after_insert, ext_del_node, ext_delete,
};

use std::time::Instant;
use tokio::sync::watch;

/// Watcher-side shared state: the sync barrier and the stop latch.
pub(crate) struct WatchSync {
    pub(crate) last_seen: watch::Sender<u64>,
    pub(crate) stop_flag: watch::Sender<bool>,
    pub(crate) cause: Mutex<Option<TreeError>>,
    pub(crate) cancel: CancellationToken,
    /// False in snapshot (static) mode: no watcher runs and the sync
    /// barrier is a no-op.
    pub(crate) enabled: bool,
}

impl WatchSync {
    pub(crate) fn new(enabled: bool, start_index: u64) -> Self {
        let (last_seen, _) = watch::channel(start_index);
        let (stop_flag, _) = watch::channel(false);
        Self {
            last_seen,
            stop_flag,
            cause: Mutex::new(None),
            cancel: CancellationToken::new(),
            enabled,
        }
    }
}

impl Shared {
    /// Record the stop cause and wake everything blocked on the watcher.
    /// The first cause wins; later calls are no-ops.
    pub(crate) fn stop_watch(&self, cause: TreeError) {
        {
            let mut slot = self.sync.cause.lock().unwrap();
            if slot.is_some() {
                return;
            }
            info!(%cause, "watcher stopping");
            *slot = Some(cause);
        }
        let _ = self.sync.stop_flag.send_replace(true);
        self.sync.cancel.cancel();
    }

    /// The error mutating calls and `wait` report once stopped.
    pub(crate) fn stop_error(&self) -> Option<TreeError> {
        if !*self.sync.stop_flag.borrow() {
            return None;
        }
        let cause = self.sync.cause.lock().unwrap();
        Some(TreeError::WatchStopped(
            cause
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "stopped".to_owned()),
        ))
    }

    /// Whether the watcher is alive (false in static mode).
    pub(crate) fn is_running(&self) -> bool {
        self.sync.enabled && !*self.sync.stop_flag.borrow()
    }
}

/// Start the watch task at `from_index` (exclusive).
pub(crate) fn spawn(shared: &Arc<Shared>, from_index: u64) -> JoinHandle<()> {
    let mut stream = shared
        .client
        .watch(&shared.root_path, from_index + 1, true);
    let cancel = shared.sync.cancel.clone();
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        info!(from_index, "watcher started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(shared) = weak.upgrade() {
                        shared.stop_watch(TreeError::WatchStopped("tree closed".to_owned()));
                    }
                    break;
                }
                event = stream.next() => event,
            };
            let Some(shared) = weak.upgrade() else {
                break;
            };
            match event {
                Some(Ok(event)) => {
                    let index = event.modified;
                    if let Err(err) = apply(&shared, event) {
                        warn!(%err, "event application failed");
                        shared.stop_watch(err);
                        break;
                    }
                    let _ = shared.sync.last_seen.send_replace(index);
                    if !shared.is_running() {
                        // An observer fault surfaced while applying.
                        break;
                    }
                }
                Some(Err(err)) => {
                    shared.stop_watch(err.into());
                    break;
                }
                None => {
                    shared.stop_watch(TreeError::WatchStopped(
                        "event stream ended".to_owned(),
                    ));
                    break;
                }
            }
        }
        info!("watcher ended");
    })
}

/// Apply one event to the tree.
fn apply(shared: &Arc<Shared>, event: ChangeEvent) -> Result<()> {
    let rel = event
        .key
        .strip_prefix(&shared.root_path)
        .ok_or_else(|| {
            TreeError::WatchStopped(format!(
                "event for {} outside watch root {}",
                event.key, shared.root_path
            ))
        })?
        .to_vec();
    let mut state = shared.state.lock().unwrap();
    debug!(key = %event.key, action = ?event.action, index = event.modified, "applying event");
    if event.action.is_removal() {
        apply_removal(shared, &mut state, &event, &rel)
    } else {
        apply_set(shared, &mut state, &event, &rel)
    }
}

fn apply_removal(
    shared: &Arc<Shared>,
    state: &mut TreeState,
    event: &ChangeEvent,
    rel: &[String],
) -> Result<()> {
    if rel.is_empty() {
        // The watch root itself went away; the mirror has nothing left
        // to mirror.
        return Err(TreeError::WatchStopped("watch root deleted".to_owned()));
    }
    // Walk loaded nodes only: a removal below an unloaded subtree is
    // covered by the fresh read a later resolution performs.
    let mut current = state.root;
    for segment in &rel[..rel.len() - 1] {
        let Some(next) = state
            .nodes
            .get(&current)
            .and_then(|n| n.children())
            .and_then(|c| c.get(segment).copied())
        else {
            return Ok(());
        };
        current = state.deref(next);
    }
    let name = &rel[rel.len() - 1];
    let Some(target) = state
        .nodes
        .get(&current)
        .and_then(|n| n.children())
        .and_then(|c| c.get(name).copied())
    else {
        return Ok(());
    };
    let target = state.deref(target);
    if let (Some(prev_created), Some(created)) = (
        event.prev_created,
        state.nodes.get(&target).and_then(|n| n.created),
    ) {
        if prev_created != created {
            debug!(key = %event.key, "removal for a different incarnation; dropped");
            return Ok(());
        }
    }
    ext_delete(shared, state, target);
    Ok(())
}

fn apply_set(
    shared: &Arc<Shared>,
    state: &mut TreeState,
    event: &ChangeEvent,
    rel: &[String],
) -> Result<()> {
    if rel.is_empty() {
        // TTL refresh or attribute update on the watch root itself.
        if let Some(node) = state.nodes.get_mut(&state.root) {
            if event.modified > node.modified {
                node.modified = event.modified;
                node.ttl = event.ttl;
                node.stamp = Instant::now();
                let root = state.root;
                notify::updated(shared, state, root, event.modified, false);
            }
        }
        return Ok(());
    }

    // Walk to the parent, conjuring placeholders for ancestors the tree
    // has not seen yet.
    let mut current = state.root;
    for segment in &rel[..rel.len() - 1] {
        let existing = state
            .nodes
            .get(&current)
            .and_then(|n| n.children())
            .and_then(|c| c.get(segment).copied())
            .map(|c| state.deref(c));
        let next = match existing.and_then(|c| state.nodes.get(&c).map(|n| (c, n.kind()))) {
            Some((child, NodeKind::Dir | NodeKind::Placeholder)) => child,
            Some((child, NodeKind::Leaf)) => {
                // Our copy is stale: the store has a directory here now.
                let stale_mod = state.nodes.get(&child).map(|n| n.modified).unwrap_or(0);
                if event.modified <= stale_mod {
                    return Ok(());
                }
                ext_del_node(shared, state, child);
                let root_path = shared.root_path.clone();
                state.placeholder_child(current, segment, &root_path)
            }
            None => {
                let root_path = shared.root_path.clone();
                state.placeholder_child(current, segment, &root_path)
            }
        };
        current = next;
    }

    let name = &rel[rel.len() - 1];
    let existing = state
        .nodes
        .get(&current)
        .and_then(|n| n.children())
        .and_then(|c| c.get(name).copied())
        .map(|c| state.deref(c));
    let existing = existing.and_then(|c| state.nodes.get(&c).map(|n| (c, n.kind())));

    match existing {
        Some((id, NodeKind::Placeholder)) => {
            // Not loaded yet; keep the indices fresh so later loads can
            // spot stale reads, and let the pending-notification state
            // reflect that something underneath changed.
            let Some(node) = state.nodes.get_mut(&id) else {
                return Ok(());
            };
            if event.modified <= node.modified {
                return Ok(());
            }
            node.modified = event.modified;
            if node.created.is_none() {
                node.created = event.created;
            }
            node.ttl = event.ttl;
            node.stamp = Instant::now();
            notify::updated(shared, state, id, event.modified, false);
            Ok(())
        }
        Some((id, kind)) if (kind == NodeKind::Dir) == event.dir => {
            apply_to_existing(shared, state, id, event)
        }
        Some((id, _)) => {
            // Kind flip: the old incarnation is gone.
            let stale_mod = state.nodes.get(&id).map(|n| n.modified).unwrap_or(0);
            if event.modified <= stale_mod {
                return Ok(());
            }
            ext_del_node(shared, state, id);
            create_from_event(shared, state, current, name, event)
        }
        None => create_from_event(shared, state, current, name, event),
    }
}

fn apply_to_existing(
    shared: &Arc<Shared>,
    state: &mut TreeState,
    id: NodeId,
    event: &ChangeEvent,
) -> Result<()> {
    let recreated = matches!(
        (state.nodes.get(&id).and_then(|n| n.created), event.created),
        (Some(old), Some(new)) if old != new
    );
    if recreated {
        let (old, new) = (
            state.nodes.get(&id).and_then(|n| n.created).unwrap_or(0),
            event.created.unwrap_or(0),
        );
        if new < old {
            debug!(key = %event.key, "late event for a previous incarnation; dropped");
            return Ok(());
        }
        // Deleted and recreated while we looked away: the old subtree
        // is gone.
        info!(key = %event.key, old, new, "entry was recreated");
        for child in state.child_ids(id) {
            ext_delete(shared, state, child);
        }
        if let Some(node) = state.nodes.get_mut(&id) {
            node.created = event.created;
        }
    }
    let Some(node) = state.nodes.get_mut(&id) else {
        return Ok(());
    };
    if node.created.is_none() {
        node.created = event.created;
    }
    if event.modified <= node.modified {
        debug!(key = %event.key, have = node.modified, got = event.modified,
            "late event dropped");
        return Ok(());
    }
    node.modified = event.modified;
    node.ttl = event.ttl;
    node.stamp = Instant::now();
    if let NodeBody::Leaf { value } = &mut node.body {
        let ty = node.ty.clone();
        let raw = event.value.as_deref().unwrap_or_default();
        let codec = ty.codec().ok_or_else(|| TreeError::TypeMismatch {
            path: event.key.clone(),
            expected: "leaf",
        })?;
        *value = (codec.decode)(raw).map_err(|reason| TreeError::Decode {
            path: event.key.clone(),
            reason,
        })?;
    }
    notify::updated(shared, state, id, event.modified, false);
    Ok(())
}

fn create_from_event(
    shared: &Arc<Shared>,
    state: &mut TreeState,
    parent: NodeId,
    name: &str,
    event: &ChangeEvent,
) -> Result<()> {
    let kind = if event.dir {
        TypeKind::Dir
    } else {
        TypeKind::Leaf
    };
    let ty = state.resolve_type(parent, std::slice::from_ref(&name.to_owned()), kind);
    if event.dir && ty.preload() != Preload::None {
        // The descriptor needs store data we cannot fetch inside event
        // application; a placeholder defers the load to first resolve.
        let root_path = shared.root_path.clone();
        let id = state.placeholder_child(parent, name, &root_path);
        if let Some(node) = state.nodes.get_mut(&id) {
            node.modified = event.modified;
            node.created = event.created;
            node.ttl = event.ttl;
            node.stamp = Instant::now();
        }
        notify::updated(shared, state, id, event.modified, false);
        return Ok(());
    }

    let body = if event.dir {
        NodeBody::empty_dir()
    } else {
        let codec = ty.codec().ok_or_else(|| TreeError::TypeMismatch {
            path: event.key.clone(),
            expected: "leaf",
        })?;
        let raw = event.value.as_deref().unwrap_or_default();
        let value = (codec.decode)(raw).map_err(|reason| TreeError::Decode {
            path: event.key.clone(),
            reason,
        })?;
        NodeBody::Leaf { value }
    };
    let announce = matches!(
        state.nodes.get(&parent).map(|n| n.kind()),
        Some(NodeKind::Dir)
    );
    let id = state.new_node(Some(parent), name, ty, body, &shared.root_path);
    if let Some(node) = state.nodes.get_mut(&id) {
        node.modified = event.modified;
        node.created = event.created;
        node.ttl = event.ttl;
        node.stamp = Instant::now();
    }
    state.attach(parent, name, id, announce);
    after_insert(shared, state, id, event.modified);
    Ok(())
}
