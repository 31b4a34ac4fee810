use std::fmt;
use std::str::FromStr;

use crate::error::PathError;

/// Sentinel prefix marking a tag entry. Tag entries hold metadata and do
/// not propagate updates to their parent directory.
pub const TAG_SENTINEL: char = ':';

/// An absolute path into the mirrored keyspace.
///
/// A path is an ordered sequence of non-empty segments; the empty
/// sequence is the root. The textual form uses `/` separators and a
/// mandatory leading `/` (`"/"` is the root).
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    /// The root path (no segments).
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse an absolute path. Rejects missing leading `/` and empty
    /// segments (`//`, trailing `/` on non-root paths).
    pub fn parse(s: &str) -> Result<Self, PathError> {
        let Some(rest) = s.strip_prefix('/') else {
            return Err(PathError::NotAbsolute(s.to_owned()));
        };
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for seg in rest.split('/') {
            if seg.is_empty() {
                return Err(PathError::EmptySegment(s.to_owned()));
            }
            segments.push(seg.to_owned());
        }
        Ok(Self { segments })
    }

    /// Build a path from pre-split segments. Segments must be non-empty
    /// and free of separators.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        for seg in segments {
            let seg = seg.into();
            if seg.is_empty() {
                return Err(PathError::EmptySegment(String::new()));
            }
            if seg.contains('/') {
                return Err(PathError::SeparatorInSegment(seg));
            }
            out.push(seg);
        }
        Ok(Self { segments: out })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment, if any.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Everything but the last segment; `None` for the root.
    pub fn parent(&self) -> Option<KeyPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(KeyPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Extend with a single segment.
    pub fn child(&self, segment: &str) -> KeyPath {
        let mut segments = self.segments.clone();
        segments.push(segment.to_owned());
        KeyPath { segments }
    }

    /// Extend with a run of segments.
    pub fn join<'a, I: IntoIterator<Item = &'a str>>(&self, rest: I) -> KeyPath {
        let mut segments = self.segments.clone();
        segments.extend(rest.into_iter().map(str::to_owned));
        KeyPath { segments }
    }

    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.segments.len() >= prefix.segments.len()
            && self.segments[..prefix.segments.len()] == prefix.segments[..]
    }

    /// Segments below `prefix`, or `None` if `self` is not under it.
    pub fn strip_prefix(&self, prefix: &KeyPath) -> Option<&[String]> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(&self.segments[prefix.segments.len()..])
    }

    /// Whether the terminal segment is a tag entry.
    pub fn is_tag(&self) -> bool {
        self.name().is_some_and(|n| n.starts_with(TAG_SENTINEL))
    }
}

/// Split a relative slash-separated path (`"a/b"`) into segments.
/// An empty string yields no segments.
pub fn split_rel(path: &str) -> Result<Vec<String>, PathError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if path.starts_with('/') {
        return Err(PathError::NotAbsolute(path.to_owned()));
    }
    let mut out = Vec::new();
    for seg in path.split('/') {
        if seg.is_empty() {
            return Err(PathError::EmptySegment(path.to_owned()));
        }
        out.push(seg.to_owned());
    }
    Ok(out)
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPath({self})")
    }
}

impl FromStr for KeyPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for KeyPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for KeyPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
