//! The in-memory tree model: lazy hydration from `ls-tree`, a
//! copy-on-write overlay atop the hydrated base, and write-back through
//! the batched `mktree` worker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::Mutex;

use crate::batch::{MktreeEntry, ObjectType};
use crate::cache::{CachedEntry, EntryKind, EMPTY_TREE_HASH};
use crate::client::GitClient;
use crate::error::{GitError, Result};

/// An immutable handle to a blob object. Blob refs are cheap to clone and
/// are shared by reference across trees during merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRef {
    pub hash: String,
    pub mode: String,
}

impl BlobRef {
    pub fn new(hash: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            mode: mode.into(),
        }
    }

    /// Write `content` as a new blob object via `hash-object -w --stdin`
    /// and return a handle to it.
    pub async fn write(client: &Arc<GitClient>, content: &[u8], mode: &str) -> Result<Self> {
        let hash = client.hash_object_write_stdin(content).await?;
        Ok(Self {
            hash,
            mode: if mode.is_empty() { "100644".to_owned() } else { mode.to_owned() },
        })
    }
}

/// A child entry: either a subtree or a blob, distinguished by tag only.
#[derive(Clone)]
pub enum TreeEntry {
    Tree(Arc<TreeNode>),
    Blob(BlobRef),
}

impl TreeEntry {
    pub fn is_tree(&self) -> bool {
        matches!(self, TreeEntry::Tree(_))
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, TreeEntry::Blob(_))
    }

    pub fn as_tree(&self) -> Option<&Arc<TreeNode>> {
        match self {
            TreeEntry::Tree(t) => Some(t),
            TreeEntry::Blob(_) => None,
        }
    }

    pub fn as_blob(&self) -> Option<&BlobRef> {
        match self {
            TreeEntry::Blob(b) => Some(b),
            TreeEntry::Tree(_) => None,
        }
    }

    /// The entry's hash if it is stable right now: a blob's hash always is;
    /// a subtree's only is while it's clean. Used by the merge fast path
    /// and by write-back to decide whether a subtree can be referenced by
    /// hash instead of recursed into.
    pub async fn stable_hash(&self) -> Option<String> {
        match self {
            TreeEntry::Blob(b) => Some(b.hash.clone()),
            TreeEntry::Tree(t) => t.hash().await,
        }
    }
}

enum Overlay {
    Present(TreeEntry),
    Tombstone,
}

struct State {
    hash: Option<String>,
    dirty: bool,
    base_children: Option<BTreeMap<String, TreeEntry>>,
    children: BTreeMap<String, Overlay>,
}

/// A git tree object, lazily hydrated and copy-on-write: reads fall
/// through to a cached `baseChildren` listing, writes accumulate in an
/// overlay map (tombstones for deletions) until `write()` flushes them.
pub struct TreeNode {
    client: Arc<GitClient>,
    state: Mutex<State>,
    // Serializes whole `write()` calls on this node: `state` alone isn't
    // enough, since `write()` needs to release it between reading the
    // overlay and committing the new hash (it recurses into children and
    // calls out to the batch builder in between). Held for the entire
    // call so two concurrent `write()`s can't both pass the dirty check
    // before either commits.
    write_lock: Mutex<()>,
}

impl TreeNode {
    /// A node identified by an existing (possibly unhydrated) hash.
    pub fn new(client: Arc<GitClient>, hash: Option<String>) -> Arc<Self> {
        let dirty = hash.is_none();
        Arc::new(Self {
            client,
            state: Mutex::new(State {
                hash,
                dirty,
                base_children: None,
                children: BTreeMap::new(),
            }),
            write_lock: Mutex::new(()),
        })
    }

    /// A fresh, dirty, empty tree — used when a merge needs somewhere to
    /// speculatively write filtered content before deciding whether to
    /// attach it.
    pub fn new_empty(client: Arc<GitClient>) -> Arc<Self> {
        Self::new(client, None)
    }

    pub fn client(&self) -> &Arc<GitClient> {
        &self.client
    }

    /// The object-store hash, or `None` while dirty. Never triggers an
    /// implicit write; callers must call `write()` to force one.
    pub async fn hash(&self) -> Option<String> {
        let state = self.state.lock().await;
        if state.dirty {
            None
        } else {
            state.hash.clone()
        }
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    pub async fn mark_dirty(&self) {
        self.state.lock().await.dirty = true;
    }

    /// Hydrate with recursive `-r -t` preload (the default for top-level
    /// reads and merges).
    pub async fn hydrate(&self) -> Result<()> {
        self.hydrate_preload(true).await
    }

    /// Hydrate `base_children` if not already done. `preload` controls
    /// whether the `ls-tree` call is recursive (`-r -t`), which also warms
    /// the object cache for every interior subtree it reports.
    pub async fn hydrate_preload(&self, preload: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.base_children.is_some() {
            return Ok(());
        }
        let hash = match &state.hash {
            None => {
                state.base_children = Some(BTreeMap::new());
                return Ok(());
            }
            Some(h) if h == EMPTY_TREE_HASH => {
                state.base_children = Some(BTreeMap::new());
                return Ok(());
            }
            Some(h) => h.clone(),
        };

        if let Some(cached) = self.client.object_cache().get(&hash) {
            state.base_children = Some(cached_to_children(&self.client, &cached));
            return Ok(());
        }

        let text = self.client.ls_tree_raw(&hash, preload).await?;
        let lines: Vec<ParsedLine> = text
            .lines()
            .filter(|l| !l.is_empty())
            .map(parse_ls_tree_line)
            .collect::<Result<_>>()?;

        if preload {
            for (parent_hash, children) in group_by_parent(&hash, &lines) {
                self.client.object_cache().insert(parent_hash, children);
            }
        } else {
            let mut children = HashMap::new();
            for line in &lines {
                children.insert(
                    line.name.clone(),
                    CachedEntry {
                        mode: line.mode.clone(),
                        kind: line.kind,
                        hash: line.hash.clone(),
                    },
                );
            }
            self.client.object_cache().insert(hash.clone(), children);
        }

        let root = self
            .client
            .object_cache()
            .get(&hash)
            .expect("just populated this hash");
        state.base_children = Some(cached_to_children(&self.client, &root));
        Ok(())
    }

    /// The overlay view: `base_children` with `children` layered on top,
    /// tombstones removing base entries.
    pub async fn children(&self) -> Result<BTreeMap<String, TreeEntry>> {
        self.hydrate().await?;
        let state = self.state.lock().await;
        let mut out = state.base_children.clone().unwrap_or_default();
        for (name, overlay) in &state.children {
            match overlay {
                Overlay::Present(entry) => {
                    out.insert(name.clone(), entry.clone());
                }
                Overlay::Tombstone => {
                    out.remove(name);
                }
            }
        }
        Ok(out)
    }

    /// Insert or replace an overlay entry, marking this node dirty.
    pub async fn set_child(&self, name: &str, entry: TreeEntry) {
        let mut state = self.state.lock().await;
        state.children.insert(name.to_owned(), Overlay::Present(entry));
        state.dirty = true;
    }

    /// Tombstone a visible child, marking this node dirty. A no-op if the
    /// name isn't currently visible.
    pub async fn delete_child(&self, name: &str) -> Result<()> {
        let visible = self.children().await?.contains_key(name);
        if visible {
            let mut state = self.state.lock().await;
            state.children.insert(name.to_owned(), Overlay::Tombstone);
            state.dirty = true;
        }
        Ok(())
    }

    /// Walk `path` (`.` for the receiver, `/`-separated otherwise),
    /// hydrating intermediates on demand. With `create`, missing segments
    /// are inserted as fresh empty subtrees and every ancestor along the
    /// walk is marked dirty. Returns the full ancestor-plus-leaf stack.
    pub async fn subtree_stack(
        self: &Arc<Self>,
        path: &str,
        create: bool,
    ) -> Result<Option<Vec<Arc<TreeNode>>>> {
        if path == "." {
            return Ok(Some(vec![self.clone()]));
        }
        let mut stack = vec![self.clone()];
        let mut current = self.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let existing = current.children().await?.get(segment).cloned();
            match existing {
                Some(TreeEntry::Tree(child)) => {
                    stack.push(child.clone());
                    current = child;
                }
                Some(TreeEntry::Blob(_)) => return Ok(None),
                None => {
                    if !create {
                        return Ok(None);
                    }
                    let child = TreeNode::new_empty(current.client.clone());
                    current.set_child(segment, TreeEntry::Tree(child.clone())).await;
                    for ancestor in &stack {
                        ancestor.mark_dirty().await;
                    }
                    stack.push(child.clone());
                    current = child;
                }
            }
        }
        Ok(Some(stack))
    }

    /// Convenience over [`Self::subtree_stack`] returning just the leaf.
    pub async fn get_subtree(self: &Arc<Self>, path: &str, create: bool) -> Result<Option<Arc<TreeNode>>> {
        Ok(self.subtree_stack(path, create).await?.map(|stack| stack.last().unwrap().clone()))
    }

    /// No-op if not dirty. Otherwise recursively writes dirty subtrees,
    /// submits the resulting entries to the batched tree builder, and
    /// folds the overlay into `base_children`. Calling this concurrently
    /// on the same node is serialized by an internal per-node lock rather
    /// than left as caller discipline.
    pub async fn write(self: &Arc<Self>) -> Result<String> {
        let _write_guard = self.write_lock.lock().await;

        {
            let state = self.state.lock().await;
            if !state.dirty {
                return Ok(state.hash.clone().expect("clean tree always has a hash"));
            }
        }

        let children = self.children().await?;
        let mut entries = Vec::new();
        for (name, entry) in &children {
            match entry {
                TreeEntry::Blob(blob) => {
                    entries.push(MktreeEntry {
                        mode: if blob.mode.is_empty() { "100644".to_owned() } else { blob.mode.clone() },
                        object_type: ObjectType::Blob,
                        hash: blob.hash.clone(),
                        name: name.clone(),
                    });
                }
                TreeEntry::Tree(child) => {
                    let child_hash = child.write().await?;
                    if child_hash == EMPTY_TREE_HASH {
                        continue;
                    }
                    entries.push(MktreeEntry {
                        mode: "040000".to_owned(),
                        object_type: ObjectType::Tree,
                        hash: child_hash,
                        name: name.clone(),
                    });
                }
            }
        }

        let new_hash = if entries.is_empty() {
            EMPTY_TREE_HASH.to_owned()
        } else {
            self.client.batch_tree_builder().await?.build(&entries).await?
        };

        let mut state = self.state.lock().await;
        let mut base = state.base_children.take().unwrap_or_default();
        for (name, overlay) in std::mem::take(&mut state.children) {
            match overlay {
                Overlay::Present(entry) => {
                    base.insert(name, entry);
                }
                Overlay::Tombstone => {
                    base.remove(&name);
                }
            }
        }
        state.base_children = Some(base);
        state.hash = Some(new_hash.clone());
        state.dirty = false;
        Ok(new_hash)
    }
}

pub(crate) struct ParsedLine {
    pub(crate) mode: String,
    pub(crate) kind: EntryKind,
    pub(crate) hash: String,
    pub(crate) name: String,
}

lazy_static! {
    static ref LS_TREE_LINE: Regex =
        Regex::new(r"^([0-7]{6}) (blob|tree|commit) ([0-9a-f]{40})\t(.*)$").unwrap();
}

pub(crate) fn parse_ls_tree_line(line: &str) -> Result<ParsedLine> {
    let caps = LS_TREE_LINE.captures(line).ok_or_else(|| GitError::Parse {
        what: "ls-tree line",
        text: line.to_owned(),
    })?;
    let kind = EntryKind::parse(&caps[2]).ok_or_else(|| GitError::Parse {
        what: "ls-tree entry type",
        text: line.to_owned(),
    })?;
    Ok(ParsedLine {
        mode: caps[1].to_owned(),
        kind,
        hash: caps[3].to_owned(),
        name: caps[4].to_owned(),
    })
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// Group a flat `-r -t` listing by the hash of the tree each entry belongs
/// to, so one recursive `ls-tree` call can warm the cache for every
/// interior subtree it touched.
fn group_by_parent(root_hash: &str, lines: &[ParsedLine]) -> HashMap<String, HashMap<String, CachedEntry>> {
    let mut dir_hash: HashMap<&str, &str> = HashMap::new();
    dir_hash.insert("", root_hash);
    for line in lines {
        if line.kind == EntryKind::Tree {
            dir_hash.insert(&line.name, &line.hash);
        }
    }

    lines
        .iter()
        .map(|line| {
            let (parent, name) = split_parent(&line.name);
            let parent_hash = dir_hash.get(parent).copied().unwrap_or(root_hash).to_owned();
            (
                parent_hash,
                (
                    name.to_owned(),
                    CachedEntry {
                        mode: line.mode.clone(),
                        kind: line.kind,
                        hash: line.hash.clone(),
                    },
                ),
            )
        })
        .into_group_map()
        .into_iter()
        .map(|(hash, entries)| (hash, entries.into_iter().collect()))
        .collect()
}

fn cached_to_children(client: &Arc<GitClient>, cached: &HashMap<String, CachedEntry>) -> BTreeMap<String, TreeEntry> {
    cached
        .iter()
        .map(|(name, entry)| {
            let value = match entry.kind {
                EntryKind::Tree => TreeEntry::Tree(TreeNode::new(client.clone(), Some(entry.hash.clone()))),
                EntryKind::Blob | EntryKind::Commit => {
                    TreeEntry::Blob(BlobRef::new(entry.hash.clone(), entry.mode.clone()))
                }
            };
            (name.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ls_tree_line() {
        let line = "100644 blob bc0c330151d9a2ca8d87d1ff914b87f152036b19\tkitten.jpg";
        let parsed = parse_ls_tree_line(line).unwrap();
        assert_eq!(parsed.mode, "100644");
        assert_eq!(parsed.kind, EntryKind::Blob);
        assert_eq!(parsed.hash, "bc0c330151d9a2ca8d87d1ff914b87f152036b19");
        assert_eq!(parsed.name, "kitten.jpg");
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(parse_ls_tree_line("not a valid line").is_err());
    }

    #[test]
    fn groups_preload_entries_by_parent_tree_hash() {
        let lines = vec![
            ParsedLine {
                mode: "040000".into(),
                kind: EntryKind::Tree,
                hash: "subtreehash".into(),
                name: "src".into(),
            },
            ParsedLine {
                mode: "100644".into(),
                kind: EntryKind::Blob,
                hash: "blobhash".into(),
                name: "src/main.c".into(),
            },
            ParsedLine {
                mode: "100644".into(),
                kind: EntryKind::Blob,
                hash: "readmehash".into(),
                name: "README.md".into(),
            },
        ];
        let groups = group_by_parent("roothash", &lines);
        assert_eq!(groups.get("roothash").unwrap().len(), 2); // src, README.md
        assert_eq!(groups.get("subtreehash").unwrap().len(), 1); // main.c
        assert!(groups.get("subtreehash").unwrap().contains_key("main.c"));
    }

    #[tokio::test]
    async fn writes_a_nested_tree_and_hydrates_it_back_from_hash() {
        let repo = crate::test_support::TempRepo::new().await.unwrap();
        let root = TreeNode::new_empty(repo.client.clone());

        let readme = BlobRef::write(&repo.client, b"hello\n", "100644").await.unwrap();
        root.set_child("README.md", TreeEntry::Blob(readme)).await;

        let src = root.get_subtree("src", true).await.unwrap().unwrap();
        let main_c = BlobRef::write(&repo.client, b"int main() {}\n", "100644").await.unwrap();
        src.set_child("main.c", TreeEntry::Blob(main_c)).await;

        let hash = root.write().await.unwrap();
        assert!(crate::client::GitClient::is_hash(&hash));
        assert!(!root.is_dirty().await);

        let rehydrated = TreeNode::new(repo.client.clone(), Some(hash));
        let children = rehydrated.children().await.unwrap();
        assert!(children.contains_key("README.md"));
        let src_back = children.get("src").unwrap().as_tree().unwrap().clone();
        assert!(src_back.children().await.unwrap().contains_key("main.c"));
    }

    #[tokio::test]
    async fn write_is_a_no_op_when_not_dirty() {
        let repo = crate::test_support::TempRepo::new().await.unwrap();
        let root = TreeNode::new_empty(repo.client.clone());
        let blob = BlobRef::write(&repo.client, b"x\n", "100644").await.unwrap();
        root.set_child("x.txt", TreeEntry::Blob(blob)).await;

        let first = root.write().await.unwrap();
        let second = root.write().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn concurrent_writes_on_the_same_node_are_serialized() {
        // Both calls race to write the same dirty node; the per-node write
        // lock must ensure only one of them actually performs the commit
        // while the other observes the already-clean result, rather than
        // both reading the dirty overlay and racing to set `state.hash`.
        let repo = crate::test_support::TempRepo::new().await.unwrap();
        let root = TreeNode::new_empty(repo.client.clone());
        let blob = BlobRef::write(&repo.client, b"y\n", "100644").await.unwrap();
        root.set_child("y.txt", TreeEntry::Blob(blob)).await;

        let a = root.clone();
        let b = root.clone();
        let (hash_a, hash_b) = tokio::join!(async move { a.write().await }, async move { b.write().await });
        assert_eq!(hash_a.unwrap(), hash_b.unwrap());
        assert!(!root.is_dirty().await);
    }

    #[tokio::test]
    async fn delete_child_removes_a_hydrated_entry() {
        let repo = crate::test_support::TempRepo::new().await.unwrap();
        let root = TreeNode::new_empty(repo.client.clone());
        let blob = BlobRef::write(&repo.client, b"z\n", "100644").await.unwrap();
        root.set_child("z.txt", TreeEntry::Blob(blob)).await;
        let hash = root.write().await.unwrap();

        let rehydrated = TreeNode::new(repo.client.clone(), Some(hash));
        rehydrated.delete_child("z.txt").await.unwrap();
        assert!(!rehydrated.children().await.unwrap().contains_key("z.txt"));
    }
}
