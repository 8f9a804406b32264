//! The process-wide object cache.
//!
//! Every `ls-tree` result this crate ever parses is kept here, keyed by
//! tree hash, so that two [`crate::tree::TreeNode`]s that happen to point at
//! the same tree object hydrate from memory on the second lookup instead of
//! re-invoking git. Entries are add-only: a tree object's contents are
//! immutable once named by its hash, so nothing ever needs to be evicted or
//! overwritten.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// The git hash of the empty tree object, constant across all repositories.
pub const EMPTY_TREE_HASH: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// One child entry as reported by `ls-tree`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub mode: String,
    pub kind: EntryKind,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Blob,
    Tree,
    Commit,
}

impl EntryKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blob" => Some(EntryKind::Blob),
            "tree" => Some(EntryKind::Tree),
            "commit" => Some(EntryKind::Commit),
            _ => None,
        }
    }
}

/// `tree hash -> (child name -> entry)`, shared across every `GitClient`
/// clone and every `TreeNode` that reads from it.
#[derive(Clone, Default)]
pub struct ObjectCache {
    inner: Arc<RwLock<HashMap<String, Arc<HashMap<String, CachedEntry>>>>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a tree's children, if already cached. The empty tree is
    /// always available without ever touching the map.
    pub fn get(&self, tree_hash: &str) -> Option<Arc<HashMap<String, CachedEntry>>> {
        if tree_hash == EMPTY_TREE_HASH {
            return Some(Arc::new(HashMap::new()));
        }
        self.inner.read().get(tree_hash).cloned()
    }

    /// Record a tree's children. A later call for the same hash overwrites
    /// rather than merges: git guarantees the content behind a hash never
    /// changes, so this only happens if a caller re-lists a tree it already
    /// listed, and the new listing is equivalent to the old one.
    pub fn insert(&self, tree_hash: String, entries: HashMap<String, CachedEntry>) -> Arc<HashMap<String, CachedEntry>> {
        if tree_hash == EMPTY_TREE_HASH {
            return Arc::new(HashMap::new());
        }
        let entries = Arc::new(entries);
        self.inner.write().insert(tree_hash, entries.clone());
        entries
    }

    pub fn contains(&self, tree_hash: &str) -> bool {
        tree_hash == EMPTY_TREE_HASH || self.inner.read().contains_key(tree_hash)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str) -> CachedEntry {
        CachedEntry {
            mode: "100644".to_owned(),
            kind: EntryKind::Blob,
            hash: hash.to_owned(),
        }
    }

    #[test]
    fn empty_tree_short_circuits_without_caching() {
        let cache = ObjectCache::new();
        let children = cache.get(EMPTY_TREE_HASH).expect("empty tree always resolves");
        assert!(children.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_then_get_round_trips() {
        let cache = ObjectCache::new();
        let mut entries = HashMap::new();
        entries.insert("a.txt".to_owned(), entry("deadbeef"));
        cache.insert("sometreehash".to_owned(), entries.clone());

        let fetched = cache.get("sometreehash").expect("just inserted");
        assert_eq!(fetched.get("a.txt"), entries.get("a.txt"));
    }

    #[test]
    fn uncached_hash_misses() {
        let cache = ObjectCache::new();
        assert!(cache.get("unknownhash").is_none());
        assert!(!cache.contains("unknownhash"));
    }
}
