//! Type registry behavior end to end: codecs, wildcards, scoped
//! registries, preload requirements, and priority ordering.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopy_core::model::Value;
use canopy_core::{
    NodeKind, NodeType, Preload, StoreClient, Tree, TreeOptions, TypeRegistry, types,
};

use support::MemStore;

async fn mount_typed(store: &Arc<MemStore>, path: &str, registry: TypeRegistry) -> Tree {
    let client: Arc<dyn StoreClient> = store.clone();
    Tree::mount(client, TreeOptions::new(path).unwrap().types(registry))
        .await
        .expect("mount")
}

#[tokio::test]
async fn integer_leaf_decodes_and_encodes() {
    let store = MemStore::new();
    store.seed(&[("/t/n", "42")]);
    let mut registry = TypeRegistry::new();
    registry.register("n", types::int()).unwrap();
    let tree = mount_typed(&store, "/t", registry).await;

    let leaf = tree.root().lookup("n").unwrap().as_leaf().unwrap();
    assert_eq!(leaf.value().unwrap(), Value::Int(42));

    leaf.set(Value::Int(7), true).await.unwrap();
    assert_eq!(store.raw_value("/t/n").as_deref(), Some("7"));
    assert_eq!(leaf.value().unwrap(), Value::Int(7));

    // The codec refuses values of the wrong shape before writing.
    assert!(leaf.set("not a number", false).await.is_err());
}

#[tokio::test]
async fn glob_pattern_types_all_descendants() {
    let store = MemStore::new();
    store.seed(&[("/t/flag", "0"), ("/t/deep/er/flag", "on"), ("/t/other", "1")]);
    let mut registry = TypeRegistry::new();
    registry.register("**/flag", types::boolean()).unwrap();
    let tree = mount_typed(&store, "/t", registry).await;
    let root = tree.root();

    assert_eq!(root.value_of("flag").unwrap(), Value::Bool(false));
    assert_eq!(
        root.lookup("deep/er/flag").unwrap().as_leaf().unwrap().value().unwrap(),
        Value::Bool(true)
    );
    assert_eq!(root.value_of("other").unwrap(), *"1");
}

#[tokio::test]
async fn boolean_string_codec_writes_words() {
    let store = MemStore::new();
    store.seed(&[("/t/flag", "false")]);
    let mut registry = TypeRegistry::new();
    registry.register("flag", types::boolean_str()).unwrap();
    let tree = mount_typed(&store, "/t", registry).await;

    let leaf = tree.root().lookup("flag").unwrap().as_leaf().unwrap();
    assert_eq!(leaf.value().unwrap(), Value::Bool(false));
    leaf.set(Value::Bool(true), true).await.unwrap();
    assert_eq!(store.raw_value("/t/flag").as_deref(), Some("true"));
}

#[tokio::test]
async fn scoped_registry_types_children_of_a_typed_dir() {
    let store = MemStore::new();
    store.seed(&[("/t/here/my_value", "10"), ("/t/here/other", "x")]);
    let mut scoped = TypeRegistry::new();
    scoped.register("my_value", types::int()).unwrap();
    let mut registry = TypeRegistry::new();
    registry
        .register(
            "here",
            Arc::new(NodeType::dir("section").with_scoped_types(Arc::new(scoped))),
        )
        .unwrap();
    let tree = mount_typed(&store, "/t", registry).await;
    let here = tree.root().lookup("here").unwrap().as_dir().unwrap();
    assert_eq!(here.value_of("my_value").unwrap(), Value::Int(10));
    // Not covered by the scoped registry: falls through to defaults.
    assert_eq!(here.value_of("other").unwrap(), *"x");
}

#[tokio::test]
async fn recursive_preload_materialises_the_subtree_on_resolve() {
    let store = MemStore::new();
    store.seed(&[("/t/a/b/c", "ok")]);
    let mut registry = TypeRegistry::new();
    registry
        .register(
            "a",
            Arc::new(NodeType::dir("bundle").with_preload(Preload::Recursive)),
        )
        .unwrap();
    let client: Arc<dyn StoreClient> = store.clone();
    let tree = Tree::mount(
        client,
        TreeOptions::new("/t").unwrap().immediate(None).types(registry),
    )
    .await
    .unwrap();
    let root = tree.root();

    let a = root.get("a").unwrap();
    assert_eq!(a.kind().unwrap(), NodeKind::Placeholder);
    let a = a.resolve().await.unwrap().as_dir().unwrap();
    // One resolve pulled the whole subtree: the deep leaf is reachable
    // without further loads.
    let c = a.lookup("b/c").expect("no placeholders below");
    assert_eq!(c.as_leaf().unwrap().value().unwrap(), *"ok");
}

#[tokio::test]
async fn value_preload_materialises_during_parent_fill() {
    let store = MemStore::new();
    store.seed(&[("/t/a/x", "1"), ("/t/a/sub/y", "2"), ("/t/plain/z", "3")]);
    let mut registry = TypeRegistry::new();
    registry
        .register(
            "a",
            Arc::new(NodeType::dir("eager").with_preload(Preload::Value)),
        )
        .unwrap();
    let client: Arc<dyn StoreClient> = store.clone();
    let tree = Tree::mount(
        client,
        TreeOptions::new("/t").unwrap().immediate(None).types(registry),
    )
    .await
    .unwrap();
    let root = tree.root();

    // The descriptor demanded first-level data, so `a` is a real
    // directory straight after the lazy mount, its leaves loaded and
    // its subdirectories still lazy.
    let a = root.get("a").unwrap();
    assert_eq!(a.kind().unwrap(), NodeKind::Dir);
    let a = a.as_dir().unwrap();
    assert_eq!(a.value_of("x").unwrap(), *"1");
    assert_eq!(a.get("sub").unwrap().kind().unwrap(), NodeKind::Placeholder);

    // An untyped sibling stays a plain placeholder.
    assert_eq!(root.get("plain").unwrap().kind().unwrap(), NodeKind::Placeholder);
}

#[tokio::test]
async fn priority_orders_child_materialisation() {
    let store = MemStore::new();
    store.seed(&[("/t/high/x", "1"), ("/t/low/y", "2")]);
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut registry = TypeRegistry::new();
    for (name, pri) in [("high", 10), ("low", 0)] {
        let order = order.clone();
        registry
            .register(
                name,
                Arc::new(
                    NodeType::dir(name).with_pri(pri).with_update_hook(Arc::new(
                        move |update: &canopy_core::NodeUpdate| {
                            order.lock().unwrap().push(update.path.to_string());
                            Ok(())
                        },
                    )),
                ),
            )
            .unwrap();
    }
    let tree = mount_typed(&store, "/t", registry).await;
    tree.root().force_updated();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let order = order.lock().unwrap();
    let high = order.iter().position(|p| p == "/t/high");
    let low = order.iter().position(|p| p == "/t/low");
    assert!(high.is_some() && low.is_some(), "both hooks fired: {order:?}");
    assert!(high < low, "high priority fired first: {order:?}");
}

#[tokio::test]
async fn local_types_override_for_new_children() {
    let store = MemStore::new();
    store.seed(&[("/t/d/seed", "0")]);
    let tree = mount_typed(&store, "/t", TypeRegistry::new()).await;
    let dir = tree.root().lookup("d").unwrap().as_dir().unwrap();

    let mut local = TypeRegistry::new();
    local.register("k", types::int()).unwrap();
    dir.set_local_types(Arc::new(local)).unwrap();

    let key = "/t/d/k".parse().unwrap();
    let result = store
        .write(&key, Some("5".to_owned()), Default::default())
        .await
        .unwrap();
    tree.wait(Some(result.modified)).await.unwrap();
    assert_eq!(dir.value_of("k").unwrap(), Value::Int(5));
}
