//! Path-pattern registry driving node type decisions.
//!
//! The registry is a trie over path segments with two wildcard forms:
//! `*` matches exactly one segment, `**` matches any run of trailing
//! segments (and stays live once entered). Each trie node carries up to
//! two descriptors, one per node kind, so the same pattern can resolve
//! differently for directories and leaves. Lookup specificity is
//! literal > `*` > `**`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use canopy_model::{Value, path::split_rel};

use crate::error::{Result, TreeError};
use crate::notify::NodeUpdate;

/// Node kind a descriptor applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Leaf,
    Dir,
}

/// Registration slot selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    Leaf,
    Dir,
    Both,
}

/// How much store data a node of this type needs before it can be
/// materialised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Preload {
    /// The entry itself is enough.
    #[default]
    None,
    /// The first-level value must be fetched first.
    Value,
    /// The full subtree must be fetched first.
    Recursive,
}

/// String codec for leaf values.
#[derive(Clone, Copy)]
pub struct Codec {
    pub decode: fn(&str) -> std::result::Result<Value, String>,
    pub encode: fn(&Value) -> std::result::Result<String, String>,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Codec")
    }
}

/// Hook invoked before registered observers whenever a node of this type
/// fires a notification. An `Err` stops the watcher, like a failing
/// observer.
pub type UpdateHook = Arc<dyn Fn(&NodeUpdate) -> Result<()> + Send + Sync>;

/// A node type descriptor: everything the tree needs to know to
/// instantiate and service entries matched by a pattern.
#[derive(Clone)]
pub struct NodeType {
    name: String,
    kind: TypeKind,
    pri: i32,
    preload: Preload,
    codec: Option<Codec>,
    scoped: Option<Arc<TypeRegistry>>,
    inherit: Option<bool>,
    propagate: Option<bool>,
    update_hook: Option<UpdateHook>,
}

impl NodeType {
    /// A directory descriptor.
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Dir,
            pri: 0,
            preload: Preload::None,
            codec: None,
            scoped: None,
            inherit: None,
            propagate: None,
            update_hook: None,
        }
    }

    /// A leaf descriptor with the given value codec.
    pub fn leaf(name: impl Into<String>, codec: Codec) -> Self {
        Self {
            codec: Some(codec),
            kind: TypeKind::Leaf,
            ..Self::dir(name)
        }
    }

    /// Materialisation order among siblings; higher fires first.
    pub fn with_pri(mut self, pri: i32) -> Self {
        self.pri = pri;
        self
    }

    pub fn with_preload(mut self, preload: Preload) -> Self {
        self.preload = preload;
        self
    }

    /// Registry consulted for children of directories of this type,
    /// before the parent chain.
    pub fn with_scoped_types(mut self, types: Arc<TypeRegistry>) -> Self {
        self.scoped = Some(types);
        self
    }

    /// Override whether unresolved child types are delegated to the
    /// parent directory (default: yes, except for tag entries).
    pub fn with_inherit(mut self, inherit: bool) -> Self {
        self.inherit = Some(inherit);
        self
    }

    /// Override update propagation to the parent (default: on, except
    /// for tag entries).
    pub fn with_propagate(mut self, propagate: bool) -> Self {
        self.propagate = Some(propagate);
        self
    }

    pub fn with_update_hook(mut self, hook: UpdateHook) -> Self {
        self.update_hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn pri(&self) -> i32 {
        self.pri
    }

    pub fn preload(&self) -> Preload {
        self.preload
    }

    pub(crate) fn codec(&self) -> Option<&Codec> {
        self.codec.as_ref()
    }

    pub(crate) fn scoped(&self) -> Option<&Arc<TypeRegistry>> {
        self.scoped.as_ref()
    }

    pub(crate) fn inherit(&self) -> Option<bool> {
        self.inherit
    }

    pub(crate) fn propagate(&self) -> Option<bool> {
        self.propagate
    }

    pub(crate) fn update_hook(&self) -> Option<&UpdateHook> {
        self.update_hook.as_ref()
    }
}

impl fmt::Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("pri", &self.pri)
            .field("preload", &self.preload)
            .finish()
    }
}

/// Built-in descriptors.
pub mod types {
    use once_cell::sync::Lazy;

    use super::*;

    fn decode_string(s: &str) -> std::result::Result<Value, String> {
        Ok(Value::Str(s.to_owned()))
    }

    fn encode_string(v: &Value) -> std::result::Result<String, String> {
        match v {
            Value::Str(s) => Ok(s.clone()),
            other => Err(format!("expected a string, got {}", other.kind())),
        }
    }

    fn decode_int(s: &str) -> std::result::Result<Value, String> {
        s.parse::<i64>()
            .map(Value::Int)
            .map_err(|e| format!("{s:?} is not an integer: {e}"))
    }

    fn encode_int(v: &Value) -> std::result::Result<String, String> {
        match v {
            Value::Int(i) => Ok(i.to_string()),
            other => Err(format!("expected an integer, got {}", other.kind())),
        }
    }

    fn decode_float(s: &str) -> std::result::Result<Value, String> {
        s.parse::<f64>()
            .map(Value::Float)
            .map_err(|e| format!("{s:?} is not a float: {e}"))
    }

    fn encode_float(v: &Value) -> std::result::Result<String, String> {
        match v {
            Value::Float(x) => Ok(x.to_string()),
            Value::Int(i) => Ok((*i as f64).to_string()),
            other => Err(format!("expected a float, got {}", other.kind())),
        }
    }

    fn decode_bool(s: &str) -> std::result::Result<Value, String> {
        if let Ok(n) = s.parse::<i64>() {
            return Ok(Value::Bool(n != 0));
        }
        match s.to_ascii_lowercase().as_str() {
            "true" | "on" => Ok(Value::Bool(true)),
            "false" | "off" => Ok(Value::Bool(false)),
            _ => Err(format!("{s:?} is not a boolean")),
        }
    }

    fn encode_bool(v: &Value) -> std::result::Result<String, String> {
        match v {
            Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_owned()),
            other => Err(format!("expected a boolean, got {}", other.kind())),
        }
    }

    fn encode_bool_str(v: &Value) -> std::result::Result<String, String> {
        match v {
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(format!("expected a boolean, got {}", other.kind())),
        }
    }

    pub const STRING_CODEC: Codec = Codec {
        decode: decode_string,
        encode: encode_string,
    };
    pub const INT_CODEC: Codec = Codec {
        decode: decode_int,
        encode: encode_int,
    };
    pub const FLOAT_CODEC: Codec = Codec {
        decode: decode_float,
        encode: encode_float,
    };
    pub const BOOL_CODEC: Codec = Codec {
        decode: decode_bool,
        encode: encode_bool,
    };
    pub const BOOL_STR_CODEC: Codec = Codec {
        decode: decode_bool,
        encode: encode_bool_str,
    };

    static STRING: Lazy<Arc<NodeType>> =
        Lazy::new(|| Arc::new(NodeType::leaf("string", STRING_CODEC)));
    static INT: Lazy<Arc<NodeType>> = Lazy::new(|| Arc::new(NodeType::leaf("int", INT_CODEC)));
    static FLOAT: Lazy<Arc<NodeType>> =
        Lazy::new(|| Arc::new(NodeType::leaf("float", FLOAT_CODEC)));
    static BOOL: Lazy<Arc<NodeType>> = Lazy::new(|| Arc::new(NodeType::leaf("bool", BOOL_CODEC)));
    static BOOL_STR: Lazy<Arc<NodeType>> =
        Lazy::new(|| Arc::new(NodeType::leaf("bool-str", BOOL_STR_CODEC)));
    static DIR: Lazy<Arc<NodeType>> = Lazy::new(|| Arc::new(NodeType::dir("dir")));

    /// Plain string leaf; the default for untyped leaves.
    pub fn string() -> Arc<NodeType> {
        STRING.clone()
    }

    pub fn int() -> Arc<NodeType> {
        INT.clone()
    }

    pub fn float() -> Arc<NodeType> {
        FLOAT.clone()
    }

    /// Boolean leaf written back as `0`/`1`.
    pub fn boolean() -> Arc<NodeType> {
        BOOL.clone()
    }

    /// Boolean leaf written back as `false`/`true`.
    pub fn boolean_str() -> Arc<NodeType> {
        BOOL_STR.clone()
    }

    /// Plain directory; the default for untyped directories.
    pub fn dir() -> Arc<NodeType> {
        DIR.clone()
    }
}

/// Trie of (pattern, kind) → descriptor registrations.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    literal: HashMap<String, TypeRegistry>,
    star: Option<Box<TypeRegistry>>,
    glob: Option<Box<TypeRegistry>>,
    leaf: Option<Arc<NodeType>>,
    dir: Option<Arc<NodeType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_empty(&self) -> bool {
        self.literal.is_empty()
            && self.star.is_none()
            && self.glob.is_none()
            && self.leaf.is_none()
            && self.dir.is_none()
    }

    /// Child trie node for one pattern segment, created on demand.
    pub fn step(&mut self, segment: &str) -> &mut TypeRegistry {
        match segment {
            "*" => self.star.get_or_insert_default(),
            "**" => self.glob.get_or_insert_default(),
            _ => self.literal.entry(segment.to_owned()).or_default(),
        }
    }

    fn walk(&mut self, pattern: &str) -> Result<&mut TypeRegistry> {
        let mut node = self;
        for seg in split_rel(pattern)? {
            node = node.step(&seg);
        }
        Ok(node)
    }

    /// Install a descriptor at a relative pattern (`"a/*/b"`, `""` for
    /// this registry's own root). The slot is chosen by the descriptor's
    /// kind; registering the same (pattern, kind) twice is an error.
    pub fn register(&mut self, pattern: &str, ty: Arc<NodeType>) -> Result<()> {
        let slot = match ty.kind() {
            TypeKind::Leaf => SlotKind::Leaf,
            TypeKind::Dir => SlotKind::Dir,
        };
        self.register_kind(pattern, slot, ty)
    }

    /// Install a descriptor into an explicit slot (or both).
    pub fn register_kind(
        &mut self,
        pattern: &str,
        slot: SlotKind,
        ty: Arc<NodeType>,
    ) -> Result<()> {
        let node = self.walk(pattern)?;
        let dup = || TreeError::DuplicateType(pattern.to_owned());
        match slot {
            SlotKind::Leaf => {
                if node.leaf.is_some() {
                    return Err(dup());
                }
                node.leaf = Some(ty);
            }
            SlotKind::Dir => {
                if node.dir.is_some() {
                    return Err(dup());
                }
                node.dir = Some(ty);
            }
            SlotKind::Both => {
                if node.leaf.is_some() || node.dir.is_some() {
                    return Err(dup());
                }
                node.leaf = Some(ty.clone());
                node.dir = Some(ty);
            }
        }
        Ok(())
    }

    /// Attach a prebuilt registry below a pattern. The target position
    /// must be unoccupied.
    pub fn mount(&mut self, pattern: &str, types: TypeRegistry) -> Result<()> {
        let node = self.walk(pattern)?;
        if !node.is_empty() {
            return Err(TreeError::DuplicateType(pattern.to_owned()));
        }
        *node = types;
        Ok(())
    }

    fn slot(&self, kind: TypeKind) -> Option<&Arc<NodeType>> {
        match kind {
            TypeKind::Leaf => self.leaf.as_ref(),
            TypeKind::Dir => self.dir.as_ref(),
        }
    }

    /// Resolve a relative path against the registered patterns.
    ///
    /// Wildcard expansion keeps every live trie position, ordered most
    /// specific first; the first terminal position with a descriptor for
    /// `kind` wins.
    pub fn lookup(&self, path: &[String], kind: TypeKind) -> Option<Arc<NodeType>> {
        // (node, entered-via-**) pairs; a ** node self-loops on any
        // further segment.
        let mut states: Vec<(&TypeRegistry, bool)> = Vec::new();
        push_state(&mut states, self, false);
        for seg in path {
            let mut next: Vec<(&TypeRegistry, bool)> = Vec::new();
            for &(node, via_glob) in &states {
                if let Some(child) = node.literal.get(seg) {
                    push_state(&mut next, child, false);
                }
                if let Some(child) = &node.star {
                    push_state(&mut next, child, false);
                }
                if via_glob {
                    push_state(&mut next, node, true);
                }
            }
            if next.is_empty() {
                return None;
            }
            states = next;
        }
        states
            .iter()
            .find_map(|(node, _)| node.slot(kind).cloned())
    }

    /// Enumerate all registrations as (pattern, kind, descriptor).
    pub fn registrations(&self) -> Vec<(String, TypeKind, Arc<NodeType>)> {
        let mut out = Vec::new();
        self.collect("", &mut out);
        out
    }

    fn collect(&self, prefix: &str, out: &mut Vec<(String, TypeKind, Arc<NodeType>)>) {
        if let Some(ty) = &self.dir {
            out.push((prefix.to_owned(), TypeKind::Dir, ty.clone()));
        }
        if let Some(ty) = &self.leaf {
            out.push((prefix.to_owned(), TypeKind::Leaf, ty.clone()));
        }
        let join = |seg: &str| {
            if prefix.is_empty() {
                seg.to_owned()
            } else {
                format!("{prefix}/{seg}")
            }
        };
        let mut names: Vec<_> = self.literal.keys().collect();
        names.sort();
        for name in names {
            self.literal[name].collect(&join(name), out);
        }
        if let Some(star) = &self.star {
            star.collect(&join("*"), out);
        }
        if let Some(glob) = &self.glob {
            glob.collect(&join("**"), out);
        }
    }
}

/// Push `node` and, with lower priority, its `**` closure.
fn push_state<'a>(states: &mut Vec<(&'a TypeRegistry, bool)>, node: &'a TypeRegistry, via_glob: bool) {
    if states.iter().any(|(n, _)| std::ptr::eq(*n, node)) {
        return;
    }
    states.push((node, via_glob));
    if let Some(glob) = &node.glob {
        push_state(states, glob, true);
    }
}
