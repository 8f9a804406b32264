//! `TreeSnapshot`: a flat `path -> entry` view of a tree-ish, and the
//! inverse operation of building a `TreeNode` hierarchy back up from one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::cache::EntryKind;
use crate::client::GitClient;
use crate::error::Result;
use crate::tree::{parse_ls_tree_line, BlobRef, TreeEntry, TreeNode};

/// One flattened tree entry, keyed by its full path from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEntry {
    pub mode: String,
    pub kind: EntryKind,
    pub hash: String,
}

/// Read a tree-ish into a flat `path -> entry` mapping via
/// `ls-tree --full-tree -r`.
pub async fn read(client: &Arc<GitClient>, treeish: &str) -> Result<BTreeMap<String, FlatEntry>> {
    let text = client.ls_tree_full_tree_recursive(treeish).await?;
    let mut flat = BTreeMap::new();
    for line in text.lines().filter(|l| !l.is_empty()) {
        let parsed = parse_ls_tree_line(line)?;
        flat.insert(
            parsed.name,
            FlatEntry {
                mode: parsed.mode,
                kind: parsed.kind,
                hash: parsed.hash,
            },
        );
    }
    Ok(flat)
}

/// Build a `TreeNode` hierarchy from a flat mapping, interning intermediate
/// directories as they're encountered while walking each path.
pub async fn build(client: &Arc<GitClient>, flat: &BTreeMap<String, FlatEntry>) -> Arc<TreeNode> {
    let root = TreeNode::new_empty(client.clone());
    let mut interned: HashMap<String, Arc<TreeNode>> = HashMap::new();

    for (path, entry) in flat {
        let mut segments = path.split('/').peekable();
        let mut current = root.clone();
        let mut current_path = String::new();
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                let leaf = match entry.kind {
                    EntryKind::Tree => TreeEntry::Tree(TreeNode::new(client.clone(), Some(entry.hash.clone()))),
                    EntryKind::Blob | EntryKind::Commit => {
                        TreeEntry::Blob(BlobRef::new(entry.hash.clone(), entry.mode.clone()))
                    }
                };
                current.set_child(segment, leaf).await;
            } else {
                let next_path = if current_path.is_empty() {
                    segment.to_owned()
                } else {
                    format!("{current_path}/{segment}")
                };
                current = match interned.get(&next_path) {
                    Some(existing) => existing.clone(),
                    None => {
                        let node = TreeNode::new_empty(client.clone());
                        current.set_child(segment, TreeEntry::Tree(node.clone())).await;
                        interned.insert(next_path.clone(), node.clone());
                        node
                    }
                };
                current_path = next_path;
            }
        }
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{GitClient, GitClientConfig};

    fn test_client() -> Arc<GitClient> {
        Arc::new(GitClient::new(GitClientConfig::default()))
    }

    #[tokio::test]
    async fn builds_nested_tree_from_flat_mapping() {
        let client = test_client();
        let mut flat = BTreeMap::new();
        flat.insert(
            "README.md".to_owned(),
            FlatEntry { mode: "100644".into(), kind: EntryKind::Blob, hash: "a".repeat(40) },
        );
        flat.insert(
            "src/main.c".to_owned(),
            FlatEntry { mode: "100644".into(), kind: EntryKind::Blob, hash: "b".repeat(40) },
        );

        let root = build(&client, &flat).await;
        let children = root.children().await.unwrap();
        assert!(children.contains_key("README.md"));
        let src = children.get("src").unwrap().as_tree().unwrap().clone();
        let src_children = src.children().await.unwrap();
        assert!(src_children.contains_key("main.c"));
    }

    #[tokio::test]
    async fn round_trips_through_write_and_read() {
        // Pure in-memory shape check: builds a hierarchy from a flat
        // mapping without touching a real hash, so nothing here is
        // actually writable. See `writes_and_reads_back_against_a_real_repository`
        // below for the full write/read round trip against a real repo.
        let client = test_client();
        let mut flat = BTreeMap::new();
        flat.insert(
            "a/b/c.txt".to_owned(),
            FlatEntry { mode: "100644".into(), kind: EntryKind::Blob, hash: "c".repeat(40) },
        );
        let root = build(&client, &flat).await;
        let a = root.children().await.unwrap().get("a").unwrap().as_tree().unwrap().clone();
        let b = a.children().await.unwrap().get("b").unwrap().as_tree().unwrap().clone();
        assert!(b.children().await.unwrap().contains_key("c.txt"));
    }

    #[tokio::test]
    async fn writes_and_reads_back_against_a_real_repository() {
        let repo = crate::test_support::TempRepo::new().await.unwrap();
        let mut flat = BTreeMap::new();

        let nested = BlobRef::write(&repo.client, b"nested\n", "100644").await.unwrap();
        flat.insert(
            "a/b/c.txt".to_owned(),
            FlatEntry { mode: nested.mode.clone(), kind: EntryKind::Blob, hash: nested.hash.clone() },
        );
        let readme = BlobRef::write(&repo.client, b"hello\n", "100644").await.unwrap();
        flat.insert(
            "README.md".to_owned(),
            FlatEntry { mode: readme.mode.clone(), kind: EntryKind::Blob, hash: readme.hash.clone() },
        );

        let root = build(&repo.client, &flat).await;
        let tree_hash = root.write().await.unwrap();

        let read_back = read(&repo.client, &tree_hash).await.unwrap();
        assert_eq!(read_back.get("README.md").unwrap().hash, readme.hash);
        assert_eq!(read_back.get("a/b/c.txt").unwrap().hash, nested.hash);
    }
}
