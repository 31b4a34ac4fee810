//! Update coalescing and observer dispatch.
//!
//! Every node is in one of three notification states: clean, timer-armed
//! (a single-shot delay is pending), or blocked on N descendants that
//! still have to fire. A node is never timer-armed and blocked at once,
//! and its `ready` signal is asserted exactly when it is clean. Timers
//! are spawned sleep tasks guarded by an epoch so a cancelled timer that
//! already woke up cannot fire stale.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use canopy_model::{KeyPath, Value};

use crate::error::TreeError;
use crate::tree::{NodeBody, NodeData, NodeId, NodeKind, Shared, TreeState};

/// Notification state of a node.
pub(crate) enum Later {
    Clean,
    Timer { epoch: u64, handle: JoinHandle<()> },
    Blocked(u32),
}

impl Later {
    pub(crate) fn is_clean(&self) -> bool {
        matches!(self, Later::Clean)
    }
}

/// Bookkeeping for the delayed-notifier warning.
#[derive(Default)]
pub(crate) struct LaterWanted {
    since: Option<Instant>,
    silenced: bool,
}

/// Snapshot handed to update hooks and observers.
///
/// Observers run under the tree lock and must not call back into the
/// tree; everything they usually need is in here.
#[derive(Clone, Debug)]
pub struct NodeUpdate {
    pub path: KeyPath,
    pub kind: NodeKind,
    /// `Some(true)` on the first call, `Some(false)` afterwards, `None`
    /// when the node is being deleted.
    pub is_new: Option<bool>,
    /// Decoded value for leaves.
    pub value: Option<Value>,
    /// Child names added since the previous call (directories).
    pub added: BTreeSet<String>,
    /// Child names removed since the previous call (directories).
    pub removed: BTreeSet<String>,
    /// The node's last modification index.
    pub modified: u64,
}

pub(crate) type ObserverFn = Arc<dyn Fn(&NodeUpdate) -> crate::error::Result<()> + Send + Sync>;

enum Step {
    /// Stay as-is (already waiting); maybe warn about starvation.
    Wait,
    /// (Re-)arm the coalescing timer; `escalate` blocks the ancestors.
    Arm { escalate: bool },
}

/// Schedule an observer call for `id`.
///
/// `child_done` marks the internal "a blocked child has fired" signal;
/// external updates pass `false`.
pub(crate) fn updated(
    shared: &Arc<Shared>,
    state: &mut TreeState,
    id: NodeId,
    seq: u64,
    child_done: bool,
) {
    let delay = state.effective_delay(id);
    let step = {
        let Some(node) = state.nodes.get_mut(&id) else {
            return;
        };
        debug!(path = %node.path, seq, child_done, "update scheduled");
        if node.later_wanted.since.is_none() {
            node.later_wanted.since = Some(Instant::now());
        }
        if seq > node.pending_seq {
            node.pending_seq = seq;
        }
        match &mut node.later {
            Later::Blocked(k) => {
                if child_done {
                    debug_assert!(*k > 0);
                    *k -= 1;
                    if *k > 0 {
                        Step::Wait
                    } else {
                        // Last blocked child fired. The ancestors were
                        // blocked when this node left the clean state,
                        // so arming must not block them again.
                        node.later = Later::Clean;
                        Step::Arm { escalate: false }
                    }
                } else {
                    Step::Wait
                }
            }
            Later::Timer { .. } => Step::Arm { escalate: false },
            Later::Clean => {
                debug_assert!(!child_done, "child-finished signal on a clean node");
                Step::Arm {
                    escalate: node.propagate,
                }
            }
        }
    };

    let escalate = match step {
        Step::Wait => {
            check_later(state, id, delay);
            return;
        }
        Step::Arm { escalate } => escalate,
    };
    if let Some(node) = state.nodes.get_mut(&id) {
        cancel_timer(node);
    }
    arm_timer(shared, state, id, delay);
    if !escalate {
        return;
    }

    // Block ancestors until one is found that is already blocked (or
    // does not propagate). A timer-armed ancestor blocked its own chain
    // when its timer was armed, so conversion stops the walk there.
    let mut cursor = state.nodes.get(&id).and_then(|n| n.parent);
    while let Some(pid) = cursor {
        let pdelay = state.effective_delay(pid);
        let (stop, propagate, grandparent) = {
            let Some(parent) = state.nodes.get_mut(&pid) else {
                return;
            };
            let _ = parent.ready.send_replace(false);
            let stop = match &mut parent.later {
                Later::Blocked(k) => {
                    *k += 1;
                    true
                }
                Later::Timer { .. } => {
                    cancel_timer(parent);
                    parent.later = Later::Blocked(1);
                    true
                }
                Later::Clean => {
                    parent.later = Later::Blocked(1);
                    false
                }
            };
            (stop, parent.propagate, parent.parent)
        };
        if stop {
            check_later(state, pid, pdelay);
            return;
        }
        if !propagate {
            return;
        }
        cursor = grandparent;
    }
}

fn cancel_timer(node: &mut NodeData) {
    if let Later::Timer { .. } = node.later {
        if let Later::Timer { handle, .. } = std::mem::replace(&mut node.later, Later::Clean) {
            handle.abort();
        }
    }
}

fn arm_timer(shared: &Arc<Shared>, state: &mut TreeState, id: NodeId, delay: Duration) {
    let epoch = state.next_epoch();
    let weak = Arc::downgrade(shared);
    let handle = tokio::spawn(async move {
        sleep(delay).await;
        if let Some(shared) = weak.upgrade() {
            fire_timer(&shared, id, epoch);
        }
    });
    let Some(node) = state.nodes.get_mut(&id) else {
        handle.abort();
        return;
    };
    let _ = node.ready.send_replace(false);
    node.later = Later::Timer { epoch, handle };
}

/// Timer task entry point.
pub(crate) fn fire_timer(shared: &Arc<Shared>, id: NodeId, epoch: u64) {
    let mut state = shared.state.lock().unwrap();
    let live = matches!(
        state.nodes.get(&id),
        Some(node) if matches!(node.later, Later::Timer { epoch: e, .. } if e == epoch)
    );
    if live {
        run_update(shared, &mut state, id, false);
    }
}

/// Fire the node's observers now and unblock the parent chain.
pub(crate) fn run_update(shared: &Arc<Shared>, state: &mut TreeState, id: NodeId, forced: bool) {
    let (seq, parent, propagate) = {
        let Some(node) = state.nodes.get_mut(&id) else {
            return;
        };
        cancel_timer(node);
        (node.pending_seq, node.parent, node.propagate)
    };
    call_observers(shared, state, id);
    let Some(node) = state.nodes.get_mut(&id) else {
        return;
    };
    let _ = node.ready.send_replace(true);
    if forced || !propagate {
        return;
    }
    if let Some(parent) = parent {
        updated(shared, state, parent, seq, true);
    }
}

/// Drain every pending notification in the subtree, children first,
/// without waiting for timers.
pub(crate) fn force_updated(shared: &Arc<Shared>, state: &mut TreeState, id: NodeId, sub: bool) {
    let blocked = {
        let Some(node) = state.nodes.get_mut(&id) else {
            return;
        };
        match node.later {
            Later::Clean => return,
            Later::Blocked(_) => {
                node.later = Later::Clean;
                true
            }
            Later::Timer { .. } => {
                cancel_timer(node);
                false
            }
        }
    };
    if blocked {
        for child in state.child_ids(id) {
            force_updated(shared, state, child, true);
        }
    }
    run_update(shared, state, id, sub);
}

/// Deletion notification: called when a node has been detached from its
/// parent. Observers run synchronously with `is_new = None`.
pub(crate) fn node_deleted(shared: &Arc<Shared>, state: &mut TreeState, id: NodeId) {
    let (seq, parent, child_done, fired) = {
        let Some(node) = state.nodes.get_mut(&id) else {
            return;
        };
        let seq = node.modified;
        let had_later = !node.later.is_clean();
        node.deleted = true;
        cancel_timer(node);
        let _ = node.ready.send_replace(true);
        (
            seq,
            node.parent,
            node.propagate && had_later,
            node.fired,
        )
    };
    if fired {
        call_observers(shared, state, id);
    }
    if let Some(parent) = parent {
        updated(shared, state, parent, seq, child_done);
    }
}

/// Swap the directory accumulators into a snapshot and invoke the update
/// hook plus every observer in registration order. The first failure is
/// reported to the root, which stops the watcher.
pub(crate) fn call_observers(shared: &Arc<Shared>, state: &mut TreeState, id: NodeId) {
    let (update, hook, observers) = {
        let Some(node) = state.nodes.get_mut(&id) else {
            return;
        };
        node.later_wanted = LaterWanted::default();
        let (added, removed) = match &mut node.body {
            NodeBody::Dir { added, removed, .. } => {
                (std::mem::take(added), std::mem::take(removed))
            }
            _ => (BTreeSet::new(), BTreeSet::new()),
        };
        let update = NodeUpdate {
            path: node.path.clone(),
            kind: node.kind(),
            is_new: if node.deleted { None } else { Some(!node.fired) },
            value: match &node.body {
                NodeBody::Leaf { value } => Some(value.clone()),
                _ => None,
            },
            added,
            removed,
            modified: node.modified,
        };
        let hook = node.ty.update_hook().cloned();
        let observers: Vec<ObserverFn> = node.observers.iter().map(|(_, f)| f.clone()).collect();
        if !node.deleted {
            node.fired = true;
        }
        (update, hook, observers)
    };

    let mut failure = None;
    if let Some(hook) = hook {
        if let Err(err) = hook(&update) {
            failure = Some(err);
        }
    }
    if failure.is_none() {
        for observer in observers {
            if let Err(err) = observer(&update) {
                failure = Some(err);
                break;
            }
        }
    }
    if let Some(err) = failure {
        error!(path = %update.path, %err, "observer failed; stopping watch");
        shared.stop_watch(TreeError::ObserverFault {
            path: update.path.clone(),
            reason: err.to_string(),
        });
    }
}

/// Warn once when a node's pending notification has been starved for
/// more than ten coalescing windows.
fn check_later(state: &mut TreeState, id: NodeId, delay: Duration) {
    let Some(node) = state.nodes.get_mut(&id) else {
        return;
    };
    if node.later_wanted.silenced {
        return;
    }
    let Some(since) = node.later_wanted.since else {
        node.later_wanted.since = Some(Instant::now());
        return;
    };
    if since.elapsed() < delay * 10 {
        return;
    }
    warn!(path = %node.path, "notifier delayed");
    node.later_wanted.silenced = true;
}
