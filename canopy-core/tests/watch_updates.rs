//! Watcher-driven mirroring: external writes, deep inserts, deletions,
//! and re-creations flowing back into the tree.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopy_core::model::{DeleteOptions, KeyPath, WriteOptions};
use canopy_core::{NodeKind, StoreClient, Tree, TreeOptions};

use support::{MemStore, eventually};

async fn mount(store: &Arc<MemStore>, path: &str) -> Tree {
    let client: Arc<dyn StoreClient> = store.clone();
    Tree::mount(
        client,
        TreeOptions::new(path)
            .unwrap()
            .update_delay(Duration::from_millis(100)),
    )
    .await
    .expect("mount")
}

async fn external_set(store: &Arc<MemStore>, key: &str, value: &str) -> u64 {
    let key: KeyPath = key.parse().unwrap();
    store
        .write(&key, Some(value.to_owned()), WriteOptions::default())
        .await
        .unwrap()
        .modified
}

#[tokio::test]
async fn external_writes_are_mirrored() {
    let store = MemStore::new();
    store.seed(&[("/t/x", "1")]);
    let tree = mount(&store, "/t").await;
    let root = tree.root();

    let modified = external_set(&store, "/t/new", "v").await;
    tree.wait(Some(modified)).await.unwrap();
    assert_eq!(root.value_of("new").unwrap(), *"v");

    let modified = external_set(&store, "/t/x", "updated").await;
    tree.wait(Some(modified)).await.unwrap();
    assert_eq!(root.value_of("x").unwrap(), *"updated");
}

#[tokio::test]
async fn mirror_matches_store_after_a_burst() {
    let store = MemStore::new();
    let tree = mount(&store, "/t").await;
    let root = tree.root();

    let mut last = 0;
    for (key, value) in [
        ("/t/a", "1"),
        ("/t/b/c", "2"),
        ("/t/a", "3"),
        ("/t/b/d", "4"),
        ("/t/e/f/g", "5"),
    ] {
        last = external_set(&store, key, value).await;
    }
    tree.wait(Some(last)).await.unwrap();

    assert_eq!(root.value_of("a").unwrap(), *"3");
    assert_eq!(
        root.fetch("b/c").await.unwrap().as_leaf().unwrap().value().unwrap(),
        *"2"
    );
    assert_eq!(
        root.fetch("b/d").await.unwrap().as_leaf().unwrap().value().unwrap(),
        *"4"
    );
    assert_eq!(
        root.fetch("e/f/g").await.unwrap().as_leaf().unwrap().value().unwrap(),
        *"5"
    );
}

#[tokio::test]
async fn deep_inserts_appear_as_placeholder_ancestors() {
    let store = MemStore::new();
    let tree = mount(&store, "/t").await;
    let root = tree.root();

    let modified = external_set(&store, "/t/x/y/z", "1").await;
    tree.wait(Some(modified)).await.unwrap();

    let x = root.get("x").unwrap();
    assert_eq!(x.kind().unwrap(), NodeKind::Placeholder);
    let z = root.fetch("x/y/z").await.unwrap();
    assert_eq!(z.as_leaf().unwrap().value().unwrap(), *"1");
}

#[tokio::test]
async fn deletion_notifies_the_ancestor_chain_in_order() {
    let store = MemStore::new();
    store.seed(&[("/t/a/b/c", "v")]);
    let tree = mount(&store, "/t").await;
    let root = tree.root();

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let removed_at_b: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let mut subs = Vec::new();
    for (path, label) in [("a/b", "a/b"), ("a", "a"), ("", "root")] {
        let node = if path.is_empty() {
            root.node().clone()
        } else {
            root.lookup(path).unwrap()
        };
        let order = order.clone();
        let removed = removed_at_b.clone();
        let label = label.to_owned();
        let track_removed = path == "a/b";
        subs.push(
            node.observe(move |update| {
                // The deletion burst is the only quiescent-state call
                // with nothing newly added.
                if update.is_new == Some(false) && update.added.is_empty() {
                    order.lock().unwrap().push(label.clone());
                }
                if track_removed {
                    removed.lock().unwrap().extend(update.removed.iter().cloned());
                }
                Ok(())
            })
            .unwrap(),
        );
    }

    let key: KeyPath = "/t/a/b/c".parse().unwrap();
    store.delete(&key, DeleteOptions::default()).await.unwrap();

    assert!(
        eventually(Duration::from_secs(3), || {
            order.lock().unwrap().len() >= 3
        })
        .await,
        "all three observers fired: {:?}",
        order.lock().unwrap()
    );
    let order = order.lock().unwrap();
    let b = order.iter().position(|p| p == "a/b").unwrap();
    let a = order.iter().position(|p| p == "a").unwrap();
    let r = order.iter().position(|p| p == "root").unwrap();
    assert!(b < a && a < r, "causal order bottom-up: {order:?}");
    assert!(removed_at_b.lock().unwrap().contains(&"c".to_owned()));
    drop(subs);
}

#[tokio::test]
async fn recreated_entries_drop_the_old_subtree() {
    let store = MemStore::new();
    store.seed(&[("/t/k/old", "1")]);
    let tree = mount(&store, "/t").await;
    let root = tree.root();
    let first_created = root.lookup("k").unwrap().created_index().unwrap();

    let key: KeyPath = "/t/k".parse().unwrap();
    store
        .delete(
            &key,
            DeleteOptions {
                dir: true,
                recursive: true,
                ..DeleteOptions::default()
            },
        )
        .await
        .unwrap();
    let modified = external_set(&store, "/t/k/new", "2").await;
    tree.wait(Some(modified)).await.unwrap();

    let k = root.fetch("k").await.unwrap().as_dir().unwrap();
    assert_ne!(Some(first_created), k.created_index().ok());
    assert!(k.try_get("old").is_none(), "old incarnation's child is gone");
    assert_eq!(k.value_of("new").unwrap(), *"2");
}

#[tokio::test]
async fn expired_leaves_vanish() {
    let store = MemStore::new();
    let tree = mount(&store, "/t").await;
    let root = tree.root();
    root.set_opts(
        "temp",
        "v".into(),
        &canopy_core::SetOptions {
            ttl: Some(1),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(root.contains("temp").unwrap());

    assert!(
        eventually(Duration::from_secs(4), || {
            !root.contains("temp").unwrap_or(false)
        })
        .await,
        "expiry event removed the leaf"
    );
    assert!(!store.contains("/t/temp"));
}
