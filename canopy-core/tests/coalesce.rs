//! Observer coalescing: one call per burst, correct added/removed
//! summaries, propagation order, and force-fire.

mod support;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopy_core::model::Value;
use canopy_core::{NodeUpdate, StoreClient, Tree, TreeOptions};

use support::{MemStore, eventually};

const DELAY: Duration = Duration::from_millis(300);

async fn mount(store: &Arc<MemStore>, path: &str) -> Tree {
    let client: Arc<dyn StoreClient> = store.clone();
    Tree::mount(
        client,
        TreeOptions::new(path).unwrap().update_delay(DELAY),
    )
    .await
    .expect("mount")
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<NodeUpdate>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(
        self: &Arc<Self>,
    ) -> impl Fn(&NodeUpdate) -> canopy_core::Result<()> + Send + Sync + 'static {
        let recorder = self.clone();
        move |update| {
            recorder.calls.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    fn calls(&self) -> Vec<NodeUpdate> {
        self.calls.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn a_burst_of_writes_coalesces_into_one_call() {
    let store = MemStore::new();
    let tree = mount(&store, "/t").await;
    let root = tree.root();
    root.node().ready().await.unwrap();

    let dir_calls = Recorder::new();
    let _dir_sub = root.node().observe(dir_calls.record()).unwrap();

    // Three synced writes, all well inside one coalescing window.
    root.set("a", "1", true).await.unwrap();
    let leaf_calls = Recorder::new();
    let _leaf_sub = root
        .lookup("a")
        .unwrap()
        .observe(leaf_calls.record())
        .unwrap();
    root.set("b", "2", true).await.unwrap();
    root.set("a", "3", true).await.unwrap();

    root.node().ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let burst: Vec<NodeUpdate> = dir_calls
        .calls()
        .into_iter()
        .filter(|u| !u.added.is_empty())
        .collect();
    assert_eq!(burst.len(), 1, "one call for the whole burst: {burst:?}");
    let expected: BTreeSet<String> = ["a".to_owned(), "b".to_owned()].into();
    assert_eq!(burst[0].added, expected);
    assert!(burst[0].removed.is_empty());

    let leaf = leaf_calls.calls();
    assert_eq!(leaf.len(), 1, "leaf fired once: {leaf:?}");
    assert_eq!(leaf[0].value, Some(Value::Str("3".into())));
}

#[tokio::test]
async fn writing_the_same_value_twice_fires_once() {
    let store = MemStore::new();
    store.seed(&[("/t/k", "v")]);
    let tree = mount(&store, "/t").await;
    let root = tree.root();
    root.node().ready().await.unwrap();
    let leaf = root.lookup("k").unwrap();
    leaf.ready().await.unwrap();

    let calls = Recorder::new();
    let _sub = leaf.observe(calls.record()).unwrap();

    let handle = leaf.as_leaf().unwrap();
    handle.set("same", true).await.unwrap();
    handle.set("same", true).await.unwrap();
    leaf.ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.calls().len(), 1, "idempotent writes coalesce");
}

#[tokio::test]
async fn one_burst_fires_every_ancestor_once_bottom_up() {
    let store = MemStore::new();
    store.seed(&[("/t/a/b/leaf", "0")]);
    let tree = mount(&store, "/t").await;
    let root = tree.root();
    for path in ["a", "a/b", "a/b/leaf"] {
        root.lookup(path).unwrap().ready().await.unwrap();
    }
    root.node().ready().await.unwrap();

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut subs = Vec::new();
    for label in ["a/b/leaf", "a/b", "a", "root"] {
        let node = if label == "root" {
            root.node().clone()
        } else {
            root.lookup(label).unwrap()
        };
        let order = order.clone();
        let name = label.to_owned();
        subs.push(
            node.observe(move |update| {
                if update.is_new == Some(false) && update.added.is_empty() {
                    order.lock().unwrap().push(name.clone());
                }
                Ok(())
            })
            .unwrap(),
        );
    }

    root.lookup("a/b/leaf")
        .unwrap()
        .as_leaf()
        .unwrap()
        .set("1", true)
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(3), || order.lock().unwrap().len() >= 4).await,
        "all ancestors fired: {:?}",
        order.lock().unwrap()
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let order = order.lock().unwrap();
    assert_eq!(
        *order,
        ["a/b/leaf", "a/b", "a", "root"],
        "exactly one call each, deepest first"
    );
    drop(subs);
}

#[tokio::test]
async fn force_updated_drains_without_waiting() {
    let store = MemStore::new();
    let tree = mount(&store, "/t").await;
    let root = tree.root();
    root.node().ready().await.unwrap();

    let calls = Recorder::new();
    let _sub = root.node().observe(calls.record()).unwrap();

    root.set("x", "1", true).await.unwrap();
    assert!(!root.node().is_ready(), "burst pending");
    root.node().force_updated();
    assert!(root.node().is_ready(), "force drained the subtree");
    let burst: Vec<_> = calls
        .calls()
        .into_iter()
        .filter(|u| u.added.contains("x"))
        .collect();
    assert_eq!(burst.len(), 1);
}

#[tokio::test]
async fn quiescent_directory_observers_get_a_synchronous_snapshot() {
    let store = MemStore::new();
    store.seed(&[("/t/a", "1"), ("/t/b", "2")]);
    let tree = mount(&store, "/t").await;
    let root = tree.root();
    root.node().ready().await.unwrap();

    let calls = Recorder::new();
    let _sub = root.node().observe(calls.record()).unwrap();
    let calls = calls.calls();
    assert_eq!(calls.len(), 1, "synchronous initial call");
    let expected: BTreeSet<String> = ["a".to_owned(), "b".to_owned()].into();
    assert_eq!(calls[0].added, expected);
}

#[tokio::test]
async fn dropping_the_subscription_unsubscribes() {
    let store = MemStore::new();
    let tree = mount(&store, "/t").await;
    let root = tree.root();
    root.node().ready().await.unwrap();

    let calls = Recorder::new();
    let sub = root.node().observe(calls.record()).unwrap();
    let before = calls.calls().len();
    drop(sub);

    root.set("x", "1", true).await.unwrap();
    root.node().ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.calls().len(), before, "no calls after unsubscribe");
}

#[tokio::test]
async fn update_delay_overrides_inherit_downwards() {
    let store = MemStore::new();
    store.seed(&[("/t/fast/k", "0")]);
    let client: Arc<dyn StoreClient> = store.clone();
    // A deliberately huge default delay; the subtree override shrinks it.
    let tree = Tree::mount(
        client,
        TreeOptions::new("/t")
            .unwrap()
            .update_delay(Duration::from_secs(30)),
    )
    .await
    .unwrap();
    let root = tree.root();
    let fast = root.lookup("fast").unwrap();
    fast.set_update_delay(Duration::from_millis(50)).unwrap();

    let calls = Recorder::new();
    let leaf = root.lookup("fast/k").unwrap();
    let _sub = leaf.observe(calls.record()).unwrap();

    leaf.as_leaf().unwrap().set("1", true).await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), || !calls.calls().is_empty()).await,
        "inherited override let the leaf fire fast"
    );
}
