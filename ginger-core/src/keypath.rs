//! Key paths: ordered segment lists that address documents, collections and
//! sequences.
//!
//! ```text
//!   zoo / 42 / animals / 7
//!   ─┬─   ─┬   ───┬───   ┬
//!  bucket  id   bucket   id
//! ```
//!
//! An odd-length path names a container (the last segment is a bucket), an
//! even-length path names a document (the last segment is an id).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered list of string segments addressing a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    /// Key path from segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse a `/` separated path. Empty segments are dropped.
    pub fn parse(path: &str) -> Self {
        Self::new(path.split('/').filter(|s| !s.is_empty()))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the path addresses a single document.
    pub fn is_document(&self) -> bool {
        !self.0.is_empty() && self.0.len() % 2 == 0
    }

    /// Room key used by the hub: segments joined with `:`.
    pub fn room_key(&self) -> String {
        self.0.join(":")
    }

    /// The innermost bucket named by this path.
    pub fn bucket(&self) -> Option<&str> {
        match self.0.len() {
            0 => None,
            n if n % 2 == 1 => Some(&self.0[n - 1]),
            n => Some(&self.0[n - 2]),
        }
    }

    /// The document id, for document paths.
    pub fn id(&self) -> Option<&str> {
        if self.is_document() {
            self.0.last().map(String::as_str)
        } else {
            None
        }
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Everything but the last segment.
    pub fn parent(&self) -> Option<KeyPath> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// This path with one more segment.
    pub fn child(&self, segment: impl Into<String>) -> KeyPath {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn concat(&self, other: &KeyPath) -> KeyPath {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        Self(segments)
    }

    /// Whether `prefix` is a leading run of segments.
    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn contains_segment(&self, segment: &str) -> bool {
        self.0.iter().any(|s| s == segment)
    }

    /// Replace every segment equal to `old` with `new`.
    /// Returns true if anything changed.
    pub fn rewrite_segment(&mut self, old: &str, new: &str) -> bool {
        let mut changed = false;
        for segment in self.0.iter_mut().filter(|s| s.as_str() == old) {
            *segment = new.to_string();
            changed = true;
        }
        changed
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

impl From<Vec<String>> for KeyPath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl<const N: usize> From<[&str; N]> for KeyPath {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let kp = KeyPath::parse("/zoo/42/animals/");
        assert_eq!(kp.segments(), &["zoo", "42", "animals"]);
        assert_eq!(kp.to_string(), "zoo/42/animals");
        assert_eq!(kp.room_key(), "zoo:42:animals");
    }

    #[test]
    fn test_bucket_and_id() {
        let container = KeyPath::from(["zoo", "42", "animals"]);
        assert_eq!(container.bucket(), Some("animals"));
        assert_eq!(container.id(), None);
        assert!(!container.is_document());

        let doc = container.child("7");
        assert_eq!(doc.bucket(), Some("animals"));
        assert_eq!(doc.id(), Some("7"));
        assert!(doc.is_document());
        assert_eq!(doc.parent(), Some(container));
    }

    #[test]
    fn test_rewrite_segment() {
        let mut kp = KeyPath::from(["parade", "tmp-1", "animals"]);
        assert!(kp.rewrite_segment("tmp-1", "p9"));
        assert_eq!(kp, KeyPath::from(["parade", "p9", "animals"]));
        assert!(!kp.rewrite_segment("tmp-1", "p9"));
    }

    #[test]
    fn test_serializes_as_array() {
        let kp = KeyPath::from(["a", "b"]);
        assert_eq!(serde_json::to_string(&kp).unwrap(), r#"["a","b"]"#);
        let back: KeyPath = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(back, kp);
        assert!(serde_json::from_str::<KeyPath>(r#""a/b""#).is_err());
    }

    #[test]
    fn test_prefix() {
        let owner = KeyPath::from(["zoo", "42"]);
        assert!(KeyPath::from(["zoo", "42", "animals"]).starts_with(&owner));
        assert!(!KeyPath::from(["zoo", "43"]).starts_with(&owner));
    }
}
