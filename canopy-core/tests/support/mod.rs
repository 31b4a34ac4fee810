//! In-memory store used by the integration tests.
//!
//! Implements just enough of an etcd-v2 style backend: hierarchical
//! keys, one monotonic index, conditional writes, append names, TTL
//! expiry, and watch streams that replay history from a start index
//! before going live.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use canopy_core::StoreClient;
use canopy_core::model::{
    Action, ChangeEvent, DeleteOptions, KeyPath, StoreError, StoreNode, TtlUpdate, WriteOptions,
};

#[derive(Clone)]
struct Entry {
    value: Option<String>,
    dir: bool,
    modified: u64,
    created: u64,
    ttl: Option<u64>,
}

struct Inner {
    entries: BTreeMap<KeyPath, Entry>,
    index: u64,
    history: Vec<ChangeEvent>,
}

pub struct MemStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ChangeEvent>,
    reads: AtomicUsize,
    weak: Mutex<Weak<MemStore>>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        let mut entries = BTreeMap::new();
        entries.insert(
            KeyPath::root(),
            Entry {
                value: None,
                dir: true,
                modified: 0,
                created: 0,
                ttl: None,
            },
        );
        let (events, _) = broadcast::channel(1024);
        let store = Arc::new(Self {
            inner: Mutex::new(Inner {
                entries,
                index: 0,
                history: Vec::new(),
            }),
            events,
            reads: AtomicUsize::new(0),
            weak: Mutex::new(Weak::new()),
        });
        *store.weak.lock().unwrap() = Arc::downgrade(&store);
        store
    }

    /// Populate the store without watch events, as pre-existing data.
    pub fn seed(&self, entries: &[(&str, &str)]) {
        let mut inner = self.inner.lock().unwrap();
        for (key, value) in entries {
            let key = KeyPath::parse(key).expect("seed key");
            inner.index += 1;
            let index = inner.index;
            ensure_parents(&mut inner, &key, index);
            inner.entries.insert(
                key,
                Entry {
                    value: Some((*value).to_owned()),
                    dir: false,
                    modified: index,
                    created: index,
                    ttl: None,
                },
            );
        }
    }

    /// Number of `read` calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn index(&self) -> u64 {
        self.inner.lock().unwrap().index
    }

    /// Raw stored string for a key, bypassing the client interface.
    pub fn raw_value(&self, key: &str) -> Option<String> {
        let key = KeyPath::parse(key).expect("key");
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&key)
            .and_then(|e| e.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        let key = KeyPath::parse(key).expect("key");
        self.inner.lock().unwrap().entries.contains_key(&key)
    }

    fn emit(&self, inner: &mut Inner, event: ChangeEvent) {
        inner.history.push(event.clone());
        let _ = self.events.send(event);
    }

    fn spawn_expiry(&self, key: KeyPath, modified: u64, secs: u64) {
        let weak = self.weak.lock().unwrap().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            let Some(store) = weak.upgrade() else {
                return;
            };
            let mut inner = store.inner.lock().unwrap();
            let Some(entry) = inner.entries.get(&key) else {
                return;
            };
            if entry.modified != modified {
                // Refreshed or rewritten since; this timer is stale.
                return;
            }
            let entry = entry.clone();
            inner.index += 1;
            let index = inner.index;
            remove_subtree(&mut inner, &key);
            let event = ChangeEvent {
                action: Action::Expire,
                key: key.clone(),
                value: None,
                dir: entry.dir,
                modified: index,
                created: None,
                ttl: None,
                prev_created: Some(entry.created),
            };
            store.emit(&mut inner, event);
        });
    }

    /// Top-level result: always lists direct children; grandchildren
    /// only on recursive reads.
    fn node_of(&self, inner: &Inner, key: &KeyPath, entry: &Entry, recursive: bool) -> StoreNode {
        StoreNode {
            key: key.clone(),
            value: entry.value.clone(),
            dir: entry.dir,
            modified: entry.modified,
            created: entry.created,
            ttl: entry.ttl,
            index: inner.index,
            nodes: if entry.dir {
                children_of(inner, key)
                    .into_iter()
                    .map(|(k, e)| self.child_node(inner, &k, &e, recursive))
                    .collect()
            } else {
                Vec::new()
            },
        }
    }

    fn child_node(&self, inner: &Inner, key: &KeyPath, entry: &Entry, recursive: bool) -> StoreNode {
        StoreNode {
            key: key.clone(),
            value: entry.value.clone(),
            dir: entry.dir,
            modified: entry.modified,
            created: entry.created,
            ttl: entry.ttl,
            index: inner.index,
            nodes: if entry.dir && recursive {
                children_of(inner, key)
                    .into_iter()
                    .map(|(k, e)| self.child_node(inner, &k, &e, true))
                    .collect()
            } else {
                Vec::new()
            },
        }
    }
}

fn children_of(inner: &Inner, key: &KeyPath) -> Vec<(KeyPath, Entry)> {
    inner
        .entries
        .iter()
        .filter(|(k, _)| k.parent().as_ref() == Some(key))
        .map(|(k, e)| (k.clone(), e.clone()))
        .collect()
}

fn ensure_parents(inner: &mut Inner, key: &KeyPath, index: u64) {
    let mut ancestors = Vec::new();
    let mut cursor = key.parent();
    while let Some(p) = cursor {
        if inner.entries.contains_key(&p) {
            break;
        }
        cursor = p.parent();
        ancestors.push(p);
    }
    for p in ancestors.into_iter().rev() {
        inner.entries.insert(
            p,
            Entry {
                value: None,
                dir: true,
                modified: index,
                created: index,
                ttl: None,
            },
        );
    }
}

fn remove_subtree(inner: &mut Inner, key: &KeyPath) {
    inner
        .entries
        .retain(|k, _| !(k == key || k.starts_with(key) && k.len() > key.len()));
}

fn leaf_ancestor(inner: &Inner, key: &KeyPath) -> bool {
    let mut cursor = key.parent();
    while let Some(p) = cursor {
        if let Some(entry) = inner.entries.get(&p) {
            if !entry.dir {
                return true;
            }
        }
        cursor = p.parent();
    }
    false
}

#[async_trait]
impl StoreClient for MemStore {
    async fn read(&self, key: &KeyPath, recursive: bool) -> Result<StoreNode, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(self.node_of(&inner, key, &entry.clone(), recursive))
    }

    async fn write(
        &self,
        key: &KeyPath,
        value: Option<String>,
        opts: WriteOptions,
    ) -> Result<StoreNode, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = if opts.append {
            match inner.entries.get(key) {
                Some(entry) if !entry.dir => return Err(StoreError::NotDir(key.clone())),
                _ => {}
            }
            key.child(&format!("{:020}", inner.index + 1))
        } else {
            key.clone()
        };
        if leaf_ancestor(&inner, &key) {
            return Err(StoreError::NotDir(key.clone()));
        }
        let existing = inner.entries.get(&key).cloned();
        if let Some(prev_exist) = opts.prev_exist {
            if prev_exist && existing.is_none() {
                return Err(StoreError::NotFound(key.clone()));
            }
            if !prev_exist && existing.is_some() {
                return Err(StoreError::AlreadyExists(key.clone()));
            }
        }
        if let Some(prev_index) = opts.prev_index {
            match &existing {
                None => return Err(StoreError::NotFound(key.clone())),
                Some(entry) if entry.modified != prev_index => {
                    return Err(StoreError::PreconditionFailed(key.clone()));
                }
                Some(_) => {}
            }
        }
        if let Some(prev_value) = &opts.prev_value {
            match &existing {
                None => return Err(StoreError::NotFound(key.clone())),
                Some(entry) if entry.value.as_deref() != Some(prev_value.as_str()) => {
                    return Err(StoreError::PreconditionFailed(key.clone()));
                }
                Some(_) => {}
            }
        }
        let conditional = opts.prev_exist == Some(true)
            || opts.prev_index.is_some()
            || opts.prev_value.is_some();
        if let Some(entry) = &existing {
            if entry.dir != opts.dir {
                return Err(StoreError::NotDir(key.clone()));
            }
            // Unconditional overwrite of a directory is not a thing;
            // refresh it with prev_exist instead.
            if entry.dir && !conditional {
                return Err(StoreError::NotDir(key.clone()));
            }
        }

        inner.index += 1;
        let index = inner.index;
        ensure_parents(&mut inner, &key, index);
        let created = match &existing {
            // Conditional updates keep the incarnation; a plain set
            // replaces it.
            Some(entry) if conditional => entry.created,
            _ => index,
        };
        let ttl = match opts.ttl {
            Some(TtlUpdate::Set(secs)) => Some(secs),
            Some(TtlUpdate::Clear) | None => None,
        };
        let action = if opts.append || opts.prev_exist == Some(false) {
            Action::Create
        } else if opts.prev_index.is_some() || opts.prev_value.is_some() {
            Action::CompareAndSwap
        } else if opts.prev_exist == Some(true) {
            Action::Update
        } else {
            Action::Set
        };
        let entry = Entry {
            value: if opts.dir { None } else { value },
            dir: opts.dir,
            modified: index,
            created,
            ttl,
        };
        inner.entries.insert(key.clone(), entry.clone());
        let event = ChangeEvent {
            action,
            key: key.clone(),
            value: entry.value.clone(),
            dir: entry.dir,
            modified: index,
            created: Some(created),
            ttl,
            prev_created: existing.map(|e| e.created),
        };
        self.emit(&mut inner, event);
        if let Some(secs) = ttl {
            self.spawn_expiry(key.clone(), index, secs);
        }
        Ok(self.node_of(&inner, &key, &entry, false))
    }

    async fn delete(&self, key: &KeyPath, opts: DeleteOptions) -> Result<StoreNode, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if let Some(prev_index) = opts.prev_index {
            if entry.modified != prev_index {
                return Err(StoreError::PreconditionFailed(key.clone()));
            }
        }
        if let Some(prev_value) = &opts.prev_value {
            if entry.value.as_deref() != Some(prev_value.as_str()) {
                return Err(StoreError::PreconditionFailed(key.clone()));
            }
        }
        if entry.dir && !opts.recursive && !children_of(&inner, key).is_empty() {
            return Err(StoreError::NotEmpty(key.clone()));
        }
        inner.index += 1;
        let index = inner.index;
        remove_subtree(&mut inner, key);
        let action = if opts.prev_index.is_some() || opts.prev_value.is_some() {
            Action::CompareAndDelete
        } else {
            Action::Delete
        };
        let event = ChangeEvent {
            action,
            key: key.clone(),
            value: None,
            dir: entry.dir,
            modified: index,
            created: None,
            ttl: None,
            prev_created: Some(entry.created),
        };
        self.emit(&mut inner, event);
        Ok(StoreNode {
            key: key.clone(),
            value: None,
            dir: entry.dir,
            modified: index,
            created: entry.created,
            ttl: None,
            index,
            nodes: Vec::new(),
        })
    }

    fn watch(
        &self,
        key: &KeyPath,
        from_index: u64,
        _recursive: bool,
    ) -> BoxStream<'static, Result<ChangeEvent, StoreError>> {
        let prefix = key.clone();
        let (backlog, rx) = {
            let inner = self.inner.lock().unwrap();
            let backlog: Vec<ChangeEvent> = inner
                .history
                .iter()
                .filter(|e| e.modified >= from_index && e.key.starts_with(&prefix))
                .cloned()
                .collect();
            // Subscribe under the same lock that serialises `emit`, so
            // nothing can slip between backlog and live stream.
            (backlog, self.events.subscribe())
        };
        // Indices are globally monotonic, so anything at or below the
        // backlog's tail is a duplicate on the live side.
        let seen = backlog.last().map(|e| e.modified).unwrap_or(0);
        let live = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event) => {
                if event.modified > seen && event.key.starts_with(&prefix) {
                    Some(Ok(event))
                } else {
                    None
                }
            }
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                Some(Err(StoreError::Transport(format!("watch lagged by {n}"))))
            }
        });
        Box::pin(tokio_stream::iter(backlog.into_iter().map(Ok)).chain(live))
    }
}

/// Wait (up to `timeout`) until `predicate` holds, polling.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
