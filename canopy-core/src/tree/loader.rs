//! Lazy materialisation of placeholders and directory fills.
//!
//! Resolution serialises on the parent's async lock: concurrent awaits
//! of the same placeholder converge on one store read, and a cancelled
//! await leaves the placeholder in place. The placeholder is removed
//! from its parent only on success or a definitive not-found.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::debug;

use canopy_model::{StoreError, StoreNode};

use crate::error::{Result, TreeError};
use crate::notify;
use crate::registry::{NodeType, Preload, TypeKind};
use crate::tree::{
    NodeBody, NodeId, NodeKind, Shared, TreeState, after_insert, ext_del_node, ext_delete,
};

/// How much of a directory's subtree a fill materialises.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FillMode {
    /// Recursive data is present; build everything.
    Full,
    /// Build everything, reading one directory level at a time.
    Eager,
    /// Build leaves, leave subdirectories as placeholders.
    Lazy,
}

impl FillMode {
    pub(crate) fn from_immediate(immediate: Option<bool>) -> Self {
        match immediate {
            Some(true) => FillMode::Full,
            Some(false) => FillMode::Eager,
            None => FillMode::Lazy,
        }
    }
}

/// Resolve a placeholder into a real node, loading it from the store.
/// Returns the resolved node's id; concurrent calls converge.
pub(crate) fn resolve(shared: &Arc<Shared>, id: NodeId) -> BoxFuture<'_, Result<NodeId>> {
    Box::pin(async move {
        let (parent_id, name, path, parent_kind) = {
            let state = shared.state.lock().unwrap();
            let id = state.deref(id);
            let Some(node) = state.nodes.get(&id) else {
                return Err(TreeError::NotFound(shared.root_path.clone()));
            };
            if node.kind() != NodeKind::Placeholder {
                return Ok(id);
            }
            let Some(parent) = node.parent else {
                return Err(TreeError::NotFound(node.path.clone()));
            };
            let parent_kind = state
                .nodes
                .get(&parent)
                .map(|n| n.kind())
                .ok_or_else(|| TreeError::NotFound(node.path.clone()))?;
            (parent, node.name.clone(), node.path.clone(), parent_kind)
        };

        // A placeholder under a placeholder: materialise the parent
        // first, then retry against the resolved directory.
        let parent_id = if parent_kind == NodeKind::Placeholder {
            resolve(shared, parent_id).await?
        } else {
            parent_id
        };

        let parent_lock = {
            let state = shared.state.lock().unwrap();
            state
                .nodes
                .get(&parent_id)
                .map(|n| n.resolve_lock.clone())
                .ok_or_else(|| TreeError::NotFound(path.clone()))?
        };
        let _guard = parent_lock.lock().await;

        // Re-check under the lock: someone may have resolved it, or the
        // watcher may have replaced or dropped the entry meanwhile.
        let placeholder = {
            let state = shared.state.lock().unwrap();
            let entry = state
                .nodes
                .get(&parent_id)
                .and_then(|n| n.children())
                .and_then(|c| c.get(&name).copied())
                .ok_or_else(|| TreeError::NotFound(path.clone()))?;
            let entry = state.deref(entry);
            match state.nodes.get(&entry).map(|n| n.kind()) {
                Some(NodeKind::Placeholder) => entry,
                Some(_) => return Ok(entry),
                None => return Err(TreeError::NotFound(path.clone())),
            }
        };

        debug!(%path, "resolving placeholder");
        let pre = match shared.client.read(&path, false).await {
            Ok(pre) => pre,
            Err(StoreError::NotFound(_)) => {
                let mut state = shared.state.lock().unwrap();
                let still = state
                    .nodes
                    .get(&placeholder)
                    .is_some_and(|n| n.kind() == NodeKind::Placeholder);
                if still {
                    ext_del_node(shared, &mut state, placeholder);
                }
                return Err(TreeError::NotFound(path));
            }
            Err(err) => return Err(err.into()),
        };

        let kind = if pre.dir { TypeKind::Dir } else { TypeKind::Leaf };
        let ty = {
            let state = shared.state.lock().unwrap();
            state.resolve_type(parent_id, std::slice::from_ref(&name), kind)
        };
        let pre = if pre.dir && ty.preload() == Preload::Recursive {
            shared.client.read(&path, true).await.map_err(TreeError::from)?
        } else {
            pre
        };

        let new_id = {
            let mut state = shared.state.lock().unwrap();
            build_real(shared, &mut state, parent_id, &name, ty.clone(), &pre, false)?
        };
        if pre.dir {
            let mode = if ty.preload() == Preload::Recursive {
                FillMode::Full
            } else {
                FillMode::Lazy
            };
            fill_dir(shared, new_id, pre.nodes, mode).await?;
        }
        Ok(new_id)
    })
}

/// Build (or refresh) the child `name` of `parent` from store data.
///
/// Replaces placeholders by transplanting their observers and children
/// onto the new node; refreshes existing nodes of the same kind in
/// place, treating a changed creation index as delete-and-recreate;
/// replaces nodes of the other kind outright.
pub(crate) fn build_real(
    shared: &Arc<Shared>,
    state: &mut TreeState,
    parent: NodeId,
    name: &str,
    ty: Arc<NodeType>,
    src: &StoreNode,
    announce: bool,
) -> Result<NodeId> {
    let existing = state
        .nodes
        .get(&parent)
        .and_then(|n| n.children())
        .and_then(|c| c.get(name).copied())
        .map(|c| state.deref(c));
    let existing = existing.and_then(|c| state.nodes.get(&c).map(|n| (c, n.kind())));

    let id = match existing {
        Some((id, kind))
            if (kind == NodeKind::Dir) == src.dir && kind != NodeKind::Placeholder =>
        {
            refresh_in_place(shared, state, id, src)?;
            id
        }
        Some((id, NodeKind::Placeholder)) => {
            transplant(shared, state, parent, name, ty, src, id)?
        }
        Some((id, _)) => {
            // The store replaced a leaf with a directory or vice versa.
            ext_del_node(shared, state, id);
            create_fresh(shared, state, parent, name, ty, src)?
        }
        None => create_fresh(shared, state, parent, name, ty, src)?,
    };

    if announce {
        if let Some(node) = state.nodes.get_mut(&parent) {
            if let NodeBody::Dir { added, .. } = &mut node.body {
                added.insert(name.to_owned());
            }
        }
    }
    Ok(id)
}

fn decode_value(ty: &NodeType, src: &StoreNode) -> Result<canopy_model::Value> {
    let codec = ty.codec().ok_or_else(|| TreeError::TypeMismatch {
        path: src.key.clone(),
        expected: "leaf",
    })?;
    let raw = src.value.as_deref().unwrap_or_default();
    (codec.decode)(raw).map_err(|reason| TreeError::Decode {
        path: src.key.clone(),
        reason,
    })
}

fn create_fresh(
    shared: &Arc<Shared>,
    state: &mut TreeState,
    parent: NodeId,
    name: &str,
    ty: Arc<NodeType>,
    src: &StoreNode,
) -> Result<NodeId> {
    let body = if src.dir {
        NodeBody::empty_dir()
    } else {
        NodeBody::Leaf {
            value: decode_value(&ty, src)?,
        }
    };
    let id = state.new_node(Some(parent), name, ty, body, &shared.root_path);
    if let Some(node) = state.nodes.get_mut(&id) {
        node.modified = src.modified;
        node.created = Some(src.created);
        node.ttl = src.ttl;
        node.stamp = Instant::now();
    }
    state.attach(parent, name, id, false);
    after_insert(shared, state, id, src.modified);
    Ok(id)
}

/// Apply newer store data onto an existing node of the same kind.
fn refresh_in_place(
    shared: &Arc<Shared>,
    state: &mut TreeState,
    id: NodeId,
    src: &StoreNode,
) -> Result<()> {
    let recreated = {
        let Some(node) = state.nodes.get(&id) else {
            return Ok(());
        };
        matches!(node.created, Some(created) if created < src.created)
    };
    if recreated {
        // The previous incarnation was deleted behind our back; its
        // subtree is gone with it.
        for child in state.child_ids(id) {
            ext_delete(shared, state, child);
        }
    }
    let Some(node) = state.nodes.get_mut(&id) else {
        return Ok(());
    };
    if src.modified <= node.modified && !recreated {
        return Ok(());
    }
    if recreated {
        node.created = Some(src.created);
    }
    if src.modified > node.modified {
        node.modified = src.modified;
        node.ttl = src.ttl;
        node.stamp = Instant::now();
        if let NodeBody::Leaf { value } = &mut node.body {
            *value = decode_value(&node.ty.clone(), src)?;
        }
        notify::updated(shared, state, id, src.modified, false);
    }
    Ok(())
}

/// Replace a placeholder with the real node, carrying its observers and
/// child placeholders over.
fn transplant(
    shared: &Arc<Shared>,
    state: &mut TreeState,
    parent: NodeId,
    name: &str,
    ty: Arc<NodeType>,
    src: &StoreNode,
    placeholder: NodeId,
) -> Result<NodeId> {
    let body = if src.dir {
        NodeBody::empty_dir()
    } else {
        NodeBody::Leaf {
            value: decode_value(&ty, src)?,
        }
    };
    let id = state.new_node(Some(parent), name, ty, body, &shared.root_path);

    let (children, observers) = match state.nodes.get_mut(&placeholder) {
        Some(stub) => {
            let children = match &mut stub.body {
                NodeBody::Placeholder { children, .. } => std::mem::take(children),
                _ => Default::default(),
            };
            (children, std::mem::take(&mut stub.observers))
        }
        None => Default::default(),
    };

    if let Some(node) = state.nodes.get_mut(&id) {
        node.modified = src.modified;
        node.created = Some(src.created);
        node.ttl = src.ttl;
        node.stamp = Instant::now();
        node.observers = observers;
        node.origin = Some(placeholder);
    }

    if src.dir {
        // Adopt the placeholder's children, reseating their parent
        // pointers before the new node becomes reachable.
        let mut adopted_real = Vec::new();
        for (child_name, child_id) in &children {
            if let Some(child) = state.nodes.get_mut(child_id) {
                child.parent = Some(id);
                if child.kind() != NodeKind::Placeholder {
                    adopted_real.push(child_name.clone());
                }
            }
        }
        if let Some(node) = state.nodes.get_mut(&id) {
            if let NodeBody::Dir {
                children: slot,
                added,
                ..
            } = &mut node.body
            {
                added.extend(adopted_real);
                *slot = children;
            }
        }
    } else {
        // The placeholder guessed wrong: what it shadowed is a leaf, so
        // speculative nested placeholders point at nothing.
        for child_id in children.values() {
            state.nodes.remove(child_id);
        }
    }

    if let Some(stub) = state.nodes.get_mut(&placeholder) {
        if let NodeBody::Placeholder { resolved, .. } = &mut stub.body {
            *resolved = Some(id);
        }
    }
    state.attach(parent, name, id, false);
    after_insert(shared, state, id, src.modified);
    Ok(id)
}

/// Materialise a directory's children from store data.
///
/// Children are processed in batches of descending descriptor priority;
/// between batches every pending notification in the directory is
/// force-fired and awaited, so high-priority children are fully
/// announced before lower-priority ones load.
pub(crate) fn fill_dir(
    shared: &Arc<Shared>,
    dir: NodeId,
    children: Vec<StoreNode>,
    mode: FillMode,
) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let mut plan: Vec<(StoreNode, Arc<NodeType>)> = {
            let state = shared.state.lock().unwrap();
            children
                .into_iter()
                .filter_map(|child| {
                    let name = child.name()?.to_owned();
                    let kind = if child.dir {
                        TypeKind::Dir
                    } else {
                        TypeKind::Leaf
                    };
                    let ty = state.resolve_type(dir, &[name], kind);
                    Some((child, ty))
                })
                .collect()
        };
        plan.sort_by(|a, b| {
            b.1.pri()
                .cmp(&a.1.pri())
                .then_with(|| a.0.key.cmp(&b.0.key))
        });

        let mut index = 0;
        while index < plan.len() {
            let pri = plan[index].1.pri();
            let mut end = index;
            while end < plan.len() && plan[end].1.pri() == pri {
                end += 1;
            }
            for entry in &plan[index..end] {
                let (src, ty) = entry;
                let Some(name) = src.name().map(str::to_owned) else {
                    continue;
                };
                if !src.dir {
                    let mut state = shared.state.lock().unwrap();
                    build_real(shared, &mut state, dir, &name, ty.clone(), src, true)?;
                    continue;
                }
                match (mode, ty.preload()) {
                    (FillMode::Full, _) => {
                        let id = {
                            let mut state = shared.state.lock().unwrap();
                            build_real(shared, &mut state, dir, &name, ty.clone(), src, true)?
                        };
                        fill_dir(shared, id, src.nodes.clone(), FillMode::Full).await?;
                    }
                    (FillMode::Eager, _) => {
                        let id = {
                            let mut state = shared.state.lock().unwrap();
                            build_real(shared, &mut state, dir, &name, ty.clone(), src, true)?
                        };
                        let pre = shared
                            .client
                            .read(&src.key, false)
                            .await
                            .map_err(TreeError::from)?;
                        fill_dir(shared, id, pre.nodes, FillMode::Eager).await?;
                    }
                    (FillMode::Lazy, Preload::None) => {
                        let mut state = shared.state.lock().unwrap();
                        let root_path = shared.root_path.clone();
                        state.placeholder_child(dir, &name, &root_path);
                        if let Some(node) = state.nodes.get_mut(&dir) {
                            if let NodeBody::Dir { added, .. } = &mut node.body {
                                added.insert(name.clone());
                            }
                        }
                    }
                    (FillMode::Lazy, Preload::Value) => {
                        let pre = shared
                            .client
                            .read(&src.key, false)
                            .await
                            .map_err(TreeError::from)?;
                        let id = {
                            let mut state = shared.state.lock().unwrap();
                            build_real(shared, &mut state, dir, &name, ty.clone(), &pre, true)?
                        };
                        fill_dir(shared, id, pre.nodes, FillMode::Lazy).await?;
                    }
                    (FillMode::Lazy, Preload::Recursive) => {
                        let pre = shared
                            .client
                            .read(&src.key, true)
                            .await
                            .map_err(TreeError::from)?;
                        let id = {
                            let mut state = shared.state.lock().unwrap();
                            build_real(shared, &mut state, dir, &name, ty.clone(), &pre, true)?
                        };
                        fill_dir(shared, id, pre.nodes, FillMode::Full).await?;
                    }
                }
            }
            index = end;
            if index < plan.len() {
                {
                    let mut state = shared.state.lock().unwrap();
                    notify::force_updated(shared, &mut state, dir, false);
                }
                await_ready(shared, dir).await;
            }
        }

        if mode == FillMode::Full {
            drop_stale_placeholders(shared, dir, &plan);
        }
        Ok(())
    })
}

/// After a full fill, adopted placeholders that the store no longer
/// lists point at deleted keys; drop them quietly.
fn drop_stale_placeholders(shared: &Arc<Shared>, dir: NodeId, plan: &[(StoreNode, Arc<NodeType>)]) {
    let names: BTreeSet<&str> = plan.iter().filter_map(|(c, _)| c.name()).collect();
    let mut state = shared.state.lock().unwrap();
    let stale: Vec<(String, NodeId)> = state
        .nodes
        .get(&dir)
        .and_then(|n| n.children())
        .map(|children| {
            children
                .iter()
                .filter(|(name, id)| {
                    !names.contains(name.as_str())
                        && state
                            .nodes
                            .get(id)
                            .is_some_and(|n| n.kind() == NodeKind::Placeholder)
                })
                .map(|(name, id)| (name.clone(), *id))
                .collect()
        })
        .unwrap_or_default();
    for (name, id) in stale {
        if let Some(node) = state.nodes.get_mut(&dir) {
            if let NodeBody::Dir { children, .. } = &mut node.body {
                children.remove(&name);
            }
        }
        state.nodes.remove(&id);
    }
}

pub(crate) async fn await_ready(shared: &Arc<Shared>, id: NodeId) {
    let mut rx = {
        let state = shared.state.lock().unwrap();
        match state.nodes.get(&id) {
            Some(node) => node.ready.subscribe(),
            None => return,
        }
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
