//! Hierarchical key paths identifying cached items.
use std::path::PathBuf;

use crate::error::CacheError;

/// A non-empty ordered sequence of path segments identifying a stored item.
///
/// Keys are opaque to the cache core: they are joined onto `root_path` as a
/// relative filesystem path, with an implementation-chosen suffix applied
/// per namespace (see [`crate::cache::codec::Codec`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Key(Vec<String>);

impl Key {
    pub fn new(segments: Vec<String>) -> Result<Self, CacheError> {
        if segments.is_empty() {
            return Err(CacheError::ProtocolError("key path must not be empty".into()));
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn to_path_buf(&self) -> PathBuf {
        self.0.iter().collect()
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_segments() {
        assert!(Key::new(vec![]).is_err());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = Key::new(vec!["a".into()]).unwrap();
        let b = Key::new(vec!["b".into()]).unwrap();
        assert!(a < b);
    }
}
