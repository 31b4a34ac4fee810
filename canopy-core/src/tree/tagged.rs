//! Lazy traversal of tag entries.

use async_stream::try_stream;
use futures::Stream;

use canopy_model::TAG_SENTINEL;

use crate::error::Result;
use crate::tree::{DirNode, Node, NodeKind, TagFilter};

/// Depth-first stream over descendant tag entries, resolving
/// placeholders along the way. Tag entries are yielded, never descended
/// into; `depth` (when non-zero) limits how many levels down a match
/// may sit.
pub(crate) fn stream(
    dir: DirNode,
    filter: TagFilter,
    depth: usize,
) -> impl Stream<Item = Result<Node>> + Send + 'static {
    try_stream! {
        let mut stack: Vec<(Node, usize)> = vec![(dir.node().clone(), 0)];
        while let Some((node, level)) = stack.pop() {
            let node = node.resolve().await?;
            let Ok(node) = node.as_dir() else {
                continue;
            };
            let level = level + 1;
            for (name, child) in node.entries()? {
                let matched = match &filter {
                    TagFilter::Any => name.starts_with(TAG_SENTINEL),
                    TagFilter::Named(tag) => name == *tag,
                };
                if matched {
                    if depth == 0 || depth == level {
                        let resolved = child.resolve().await?;
                        yield resolved;
                    }
                } else if name.starts_with(TAG_SENTINEL) {
                    continue;
                } else if depth > 0 && depth <= level {
                    continue;
                } else if matches!(child.kind(), Ok(NodeKind::Dir | NodeKind::Placeholder)) {
                    stack.push((child, level));
                }
            }
        }
    }
}
