//! Mounting, the write pump, and the sync barrier.
//!
//! All writes issued through the tree are serialised by a FIFO pump, so
//! the store sees them in program order and conditional-write indices
//! stay predictable. `wait` first drains the pump, then blocks until
//! the watcher has applied the requested index.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tracing::debug;

use canopy_model::{DeleteOptions, KeyPath, StoreError, StoreNode, WriteOptions};

use crate::env::Env;
use crate::error::{Result, TreeError};
use crate::notify;
use crate::registry::{TypeKind, TypeRegistry, types};
use crate::store::StoreClient;
use crate::tree::{DirNode, Node, NodeBody, Shared, TreeState, loader};
use crate::watcher::{self, WatchSync};

/// Mount-time configuration.
pub struct TreeOptions {
    root_path: KeyPath,
    immediate: Option<bool>,
    static_mode: bool,
    create: Option<bool>,
    update_delay: Duration,
    types: TypeRegistry,
    env: Env,
}

impl TreeOptions {
    /// Options for mounting `root_path` (an absolute store path).
    pub fn new(root_path: &str) -> Result<Self> {
        Ok(Self {
            root_path: KeyPath::parse(root_path)?,
            immediate: Some(true),
            static_mode: false,
            create: None,
            update_delay: Duration::from_secs(1),
            types: TypeRegistry::new(),
            env: Env::new(),
        })
    }

    /// Initial load policy: `Some(true)` one recursive fetch (default),
    /// `Some(false)` an eager walk of shallow fetches, `None` a lazy
    /// placeholder tree.
    pub fn immediate(mut self, immediate: Option<bool>) -> Self {
        self.immediate = immediate;
        self
    }

    /// Snapshot mode: no watcher is started and the tree never changes.
    pub fn static_mode(mut self, static_mode: bool) -> Self {
        self.static_mode = static_mode;
        self
    }

    /// `Some(true)` requires creating the root, `Some(false)` requires
    /// it to exist, `None` (default) takes either.
    pub fn create(mut self, create: Option<bool>) -> Self {
        self.create = create;
        self
    }

    /// Observer coalescing window (default one second).
    pub fn update_delay(mut self, delay: Duration) -> Self {
        self.update_delay = delay;
        self
    }

    /// Type registry mounted at the root.
    pub fn types(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    /// Per-tree context bag, immutable after mounting.
    pub fn env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }
}

impl fmt::Debug for TreeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeOptions")
            .field("root_path", &self.root_path)
            .field("immediate", &self.immediate)
            .field("static_mode", &self.static_mode)
            .field("create", &self.create)
            .field("update_delay", &self.update_delay)
            .finish()
    }
}

/// A mounted, live mirror of a store subtree.
#[derive(Clone)]
pub struct Tree {
    shared: Arc<Shared>,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("root_path", &self.shared.root_path)
            .field("running", &self.shared.is_running())
            .finish()
    }
}

impl Tree {
    /// Read the mounted subtree and start mirroring it.
    pub async fn mount(client: Arc<dyn StoreClient>, options: TreeOptions) -> Result<Tree> {
        let TreeOptions {
            root_path,
            immediate,
            static_mode,
            create,
            update_delay,
            types: registry,
            env,
        } = options;
        let recursive = immediate == Some(true);
        let dir_opts = WriteOptions {
            prev_exist: Some(false),
            dir: true,
            ..WriteOptions::default()
        };
        let pre = match create {
            Some(true) => {
                client
                    .write(&root_path, None, dir_opts)
                    .await
                    .map_err(TreeError::from)?;
                client
                    .read(&root_path, recursive)
                    .await
                    .map_err(TreeError::from)?
            }
            Some(false) => client
                .read(&root_path, recursive)
                .await
                .map_err(TreeError::from)?,
            None => match client.read(&root_path, recursive).await {
                Ok(pre) => pre,
                Err(StoreError::NotFound(_)) => {
                    match client.write(&root_path, None, dir_opts).await {
                        // Lost a creation race; either way it exists now.
                        Ok(_) | Err(StoreError::AlreadyExists(_)) => {}
                        Err(err) => return Err(err.into()),
                    }
                    client
                        .read(&root_path, recursive)
                        .await
                        .map_err(TreeError::from)?
                }
                Err(err) => return Err(err.into()),
            },
        };
        if !pre.dir {
            return Err(TreeError::TypeMismatch {
                path: root_path,
                expected: "directory",
            });
        }

        let registry = Arc::new(registry);
        let (pump, jobs) = Pump::new();
        let shared = Arc::new(Shared {
            state: Mutex::new(TreeState::new(update_delay)),
            client,
            root_path,
            env,
            static_mode,
            pump,
            sync: WatchSync::new(!static_mode, pre.index),
        });
        let _pump_task = tokio::spawn(run_pump(Arc::downgrade(&shared), jobs));

        let root = {
            let mut state = shared.state.lock().unwrap();
            let root_ty = registry
                .lookup(&[], TypeKind::Dir)
                .unwrap_or_else(types::dir);
            let root_path = shared.root_path.clone();
            let root = state.new_node(None, "", root_ty, NodeBody::empty_dir(), &root_path);
            state.root = root;
            if let Some(node) = state.nodes.get_mut(&root) {
                node.modified = pre.modified;
                node.created = Some(pre.created);
                node.ttl = pre.ttl;
                if let NodeBody::Dir { local_types, .. } = &mut node.body {
                    *local_types = Some(registry.clone());
                }
            }
            root
        };
        loader::fill_dir(
            &shared,
            root,
            pre.nodes,
            loader::FillMode::from_immediate(immediate),
        )
        .await?;
        {
            let mut state = shared.state.lock().unwrap();
            notify::updated(&shared, &mut state, root, pre.modified, false);
        }
        if !static_mode {
            let _watch_task = watcher::spawn(&shared, pre.index);
        }
        Ok(Tree { shared })
    }

    /// The mounted directory.
    pub fn root(&self) -> DirNode {
        let state = self.shared.state.lock().unwrap();
        let root = state.root;
        DirNode::from_node(Node::from_state(&self.shared, &state, root))
    }

    /// Drain pending writes, then wait until the watcher has applied
    /// `upto` (default: the largest index written through this tree).
    /// Surfaces the first error of a queued background task.
    pub async fn wait(&self, upto: Option<u64>) -> Result<u64> {
        wait_applied(&self.shared, upto).await
    }

    /// Queue an arbitrary write task behind the pump. Its error, if any,
    /// surfaces at the next [`Tree::wait`] and halts further tasks until
    /// consumed there.
    pub fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = Result<u64>> + Send + 'static,
    {
        if let Some(err) = self.shared.stop_error() {
            return Err(err);
        }
        enqueue(&self.shared, Box::pin(task), false)
    }

    /// Stop watching. Pending and subsequent waits fail with
    /// `WatchStopped`; the tree stays readable at its last state.
    pub fn close(&self) {
        self.shared
            .stop_watch(TreeError::WatchStopped("tree closed".to_owned()));
    }

    /// Whether the watcher is alive. Always false in static mode.
    pub fn running(&self) -> bool {
        self.shared.is_running()
    }

    /// Whether the tree has stopped mirroring (or never did).
    pub fn stopped(&self) -> bool {
        !self.shared.is_running()
    }

    pub fn env(&self) -> &Env {
        &self.shared.env
    }

    /// Largest modification index written through this tree.
    pub fn last_mod(&self) -> u64 {
        self.shared.state.lock().unwrap().last_mod
    }

    pub fn update_delay(&self) -> Duration {
        self.shared.state.lock().unwrap().update_delay
    }
}

/// FIFO write-task pump.
pub(crate) struct Pump {
    tx: mpsc::UnboundedSender<PumpJob>,
    pending: watch::Sender<usize>,
    error: Mutex<Option<TreeError>>,
    resume: Notify,
}

struct PumpJob {
    fut: BoxFuture<'static, Result<u64>>,
    /// Someone awaits this job's outcome; an error must not park the
    /// pump.
    consumed: bool,
}

impl Pump {
    fn new() -> (Pump, mpsc::UnboundedReceiver<PumpJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0);
        (
            Pump {
                tx,
                pending,
                error: Mutex::new(None),
                resume: Notify::new(),
            },
            rx,
        )
    }
}

fn enqueue(shared: &Arc<Shared>, fut: BoxFuture<'static, Result<u64>>, consumed: bool) -> Result<()> {
    shared.pump.pending.send_modify(|n| *n += 1);
    if shared.pump.tx.send(PumpJob { fut, consumed }).is_err() {
        shared.pump.pending.send_modify(|n| *n -= 1);
        return Err(TreeError::WatchStopped("task pump stopped".to_owned()));
    }
    Ok(())
}

async fn run_pump(weak: Weak<Shared>, mut jobs: mpsc::UnboundedReceiver<PumpJob>) {
    while let Some(job) = jobs.recv().await {
        let result = job.fut.await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if let Ok(modified) = &result {
            let mut state = shared.state.lock().unwrap();
            if *modified > state.last_mod {
                state.last_mod = *modified;
            }
        }
        match result {
            Err(err) if !job.consumed => {
                debug!(%err, "queued task failed; pump parked until wait()");
                *shared.pump.error.lock().unwrap() = Some(err);
                shared.pump.pending.send_modify(|n| *n -= 1);
                loop {
                    shared.pump.resume.notified().await;
                    if shared.pump.error.lock().unwrap().is_none() {
                        break;
                    }
                }
            }
            _ => {
                shared.pump.pending.send_modify(|n| *n -= 1);
            }
        }
    }
}

fn take_pump_error(shared: &Arc<Shared>) -> Option<TreeError> {
    let err = shared.pump.error.lock().unwrap().take();
    if err.is_some() {
        shared.pump.resume.notify_one();
    }
    err
}

/// Issue a store write through the pump.
pub(crate) async fn store_write(
    shared: &Arc<Shared>,
    key: KeyPath,
    value: Option<String>,
    opts: WriteOptions,
) -> Result<StoreNode> {
    if let Some(err) = shared.stop_error() {
        return Err(err);
    }
    let (tx, rx) = oneshot::channel();
    let client = shared.client.clone();
    let fut = async move {
        let result = client.write(&key, value, opts).await.map_err(TreeError::from);
        let outcome = result.as_ref().map(|n| n.modified).map_err(Clone::clone);
        let _ = tx.send(result);
        outcome
    };
    enqueue(shared, Box::pin(fut), true)?;
    rx.await
        .map_err(|_| TreeError::WatchStopped("task pump stopped".to_owned()))?
}

/// Issue a store delete through the pump.
pub(crate) async fn store_delete(
    shared: &Arc<Shared>,
    key: KeyPath,
    opts: DeleteOptions,
) -> Result<StoreNode> {
    if let Some(err) = shared.stop_error() {
        return Err(err);
    }
    let (tx, rx) = oneshot::channel();
    let client = shared.client.clone();
    let fut = async move {
        let result = client.delete(&key, opts).await.map_err(TreeError::from);
        let outcome = result.as_ref().map(|n| n.modified).map_err(Clone::clone);
        let _ = tx.send(result);
        outcome
    };
    enqueue(shared, Box::pin(fut), true)?;
    rx.await
        .map_err(|_| TreeError::WatchStopped("task pump stopped".to_owned()))?
}

/// The `wait` barrier: pump drained, then `last_seen >= upto`.
pub(crate) async fn wait_applied(shared: &Arc<Shared>, upto: Option<u64>) -> Result<u64> {
    let mut pending = shared.pump.pending.subscribe();
    loop {
        if let Some(err) = take_pump_error(shared) {
            return Err(err);
        }
        if *pending.borrow_and_update() == 0 {
            break;
        }
        if pending.changed().await.is_err() {
            break;
        }
    }
    if let Some(err) = take_pump_error(shared) {
        return Err(err);
    }

    let target = match upto {
        Some(target) => target,
        None => shared.state.lock().unwrap().last_mod,
    };
    if !shared.sync.enabled {
        return Ok(target);
    }
    let mut seen = shared.sync.last_seen.subscribe();
    let mut stopped = shared.sync.stop_flag.subscribe();
    loop {
        if *stopped.borrow_and_update() {
            return Err(shared
                .stop_error()
                .unwrap_or_else(|| TreeError::WatchStopped("stopped".to_owned())));
        }
        if *seen.borrow_and_update() >= target {
            return Ok(target);
        }
        tokio::select! {
            changed = seen.changed() => {
                if changed.is_err() {
                    return Err(TreeError::WatchStopped("stopped".to_owned()));
                }
            }
            _ = stopped.changed() => {}
        }
    }
}
