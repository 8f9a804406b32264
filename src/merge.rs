//! Recursive filtered tree merge.

use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use tokio_util::sync::CancellationToken;

use crate::error::{GitError, Result};
use crate::tree::{TreeEntry, TreeNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Overlay,
    Replace,
}

struct Matcher {
    pattern: glob::Pattern,
    negate: bool,
}

/// Compiled glob filter plus merge semantics, built once per `merge` call.
pub struct MergeOptions {
    matchers: Vec<Matcher>,
    disabled: bool,
    pub mode: MergeMode,
}

impl MergeOptions {
    /// `files` is a list of glob patterns; a leading `!` marks negation.
    /// An empty list, or the literal single pattern `"**"`, disables
    /// filtering entirely (every child is included).
    pub fn new(files: &[String], mode: MergeMode) -> Result<Self> {
        let disabled = files.is_empty() || (files.len() == 1 && files[0] == "**");
        let mut matchers = Vec::new();
        if !disabled {
            for raw in files {
                let (negate, pat) = match raw.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, raw.as_str()),
                };
                let pattern = glob::Pattern::new(pat)
                    .map_err(|e| GitError::BadArgument(format!("invalid glob pattern \"{raw}\": {e}")))?;
                matchers.push(Matcher { pattern, negate });
            }
        }
        Ok(Self { matchers, disabled, mode })
    }

    fn any_negations(&self) -> bool {
        self.matchers.iter().any(|m| m.negate)
    }

    /// Evaluate one child's path against every matcher in order. A
    /// negation matcher that *fails* to match excludes the child outright;
    /// a positive matcher that matches sets `matched`.
    fn evaluate(&self, child_path: &str) -> Eval {
        if self.disabled {
            return Eval { matched: true, excluded: false };
        }
        let mut matched = false;
        for m in &self.matchers {
            let is_match = m.pattern.matches(child_path);
            if is_match && !m.negate {
                matched = true;
            }
            if !is_match && m.negate {
                return Eval { matched, excluded: true };
            }
        }
        Eval { matched, excluded: false }
    }
}

struct Eval {
    matched: bool,
    excluded: bool,
}

fn child_match_path(base_path: &str, name: &str, is_tree: bool) -> String {
    let joined = child_base_path(base_path, name);
    if is_tree {
        format!("{joined}/")
    } else {
        joined
    }
}

fn child_base_path(base_path: &str, name: &str) -> String {
    if base_path == "." {
        name.to_owned()
    } else {
        format!("{base_path}/{name}")
    }
}

/// Merge `input` onto `target` in place under `options`. Hydrates both
/// sides (with recursive preload) before walking.
pub async fn merge(
    target: &Arc<TreeNode>,
    input: &Arc<TreeNode>,
    options: MergeOptions,
    cancel: Option<CancellationToken>,
) -> Result<()> {
    let options = Arc::new(options);
    merge_boxed(target.clone(), input.clone(), options, ".".to_owned(), true, cancel).await?;
    Ok(())
}

fn merge_boxed(
    target: Arc<TreeNode>,
    input: Arc<TreeNode>,
    options: Arc<MergeOptions>,
    base_path: String,
    preload: bool,
    cancel: Option<CancellationToken>,
) -> BoxFuture<'static, Result<bool>> {
    Box::pin(merge_inner(target, input, options, base_path, preload, cancel))
}

enum PendingJob {
    /// A speculative merge into a fresh subtree: attach only if it ends up
    /// dirty. Used when the child itself doesn't match the filter but
    /// something under it might.
    AttachIfDirty {
        name: String,
        fresh: Arc<TreeNode>,
        fut: BoxFuture<'static, Result<bool>>,
    },
    /// A merge into a subtree that is already attached (by reference or
    /// because it was just created): just propagate dirtiness upward.
    PropagateOnly { fut: BoxFuture<'static, Result<bool>> },
}

async fn merge_inner(
    target: Arc<TreeNode>,
    input: Arc<TreeNode>,
    options: Arc<MergeOptions>,
    base_path: String,
    preload: bool,
    cancel: Option<CancellationToken>,
) -> Result<bool> {
    if let Some(token) = &cancel {
        if token.is_cancelled() {
            return Err(GitError::BadArgument("tree merge was cancelled".to_owned()));
        }
    }

    target.hydrate_preload(preload).await?;
    input.hydrate_preload(preload).await?;

    let input_children = input.children().await?;
    let target_children = target.children().await?;
    let negations_possible = options.any_negations();

    let mut became_dirty = false;
    let mut jobs: Vec<PendingJob> = Vec::new();

    for (name, input_entry) in input_children.iter() {
        let is_input_tree = input_entry.is_tree();
        let target_entry = target_children.get(name).cloned();

        // Step 2: fast path — identical, already-clean content.
        if let Some(te) = &target_entry {
            if te.is_tree() == is_input_tree {
                let target_hash = te.stable_hash().await;
                if target_hash.is_some() && target_hash == input_entry.stable_hash().await {
                    continue;
                }
            }
        }

        let child_path = child_match_path(&base_path, name, is_input_tree);
        let eval = options.evaluate(&child_path);

        if eval.excluded {
            continue;
        }
        if !eval.matched && !is_input_tree {
            continue;
        }
        let pending_child_match = is_input_tree && (!eval.matched || negations_possible);

        if !is_input_tree {
            let blob = input_entry.as_blob().expect("checked is_blob above").clone();
            target.set_child(name, TreeEntry::Blob(blob)).await;
            became_dirty = true;
            continue;
        }

        let input_child = input_entry.as_tree().expect("checked is_tree above").clone();
        let next_base = child_base_path(&base_path, name);
        let target_is_tree_already = target_entry.as_ref().is_some_and(|e| e.is_tree());

        if target_entry.is_none() || !target_is_tree_already || options.mode == MergeMode::Replace {
            if pending_child_match {
                let fresh = TreeNode::new_empty(target.client().clone());
                let fut = merge_boxed(
                    fresh.clone(),
                    input_child.clone(),
                    options.clone(),
                    next_base,
                    preload,
                    cancel.clone(),
                );
                jobs.push(PendingJob::AttachIfDirty { name: name.clone(), fresh, fut });
            } else if let Some(stable_hash) = input_child.hash().await {
                let reference = TreeNode::new(target.client().clone(), Some(stable_hash));
                target.set_child(name, TreeEntry::Tree(reference)).await;
                became_dirty = true;
            } else {
                let fresh = TreeNode::new_empty(target.client().clone());
                target.set_child(name, TreeEntry::Tree(fresh.clone())).await;
                became_dirty = true;
                let fut = merge_boxed(fresh, input_child.clone(), options.clone(), next_base, preload, cancel.clone());
                jobs.push(PendingJob::PropagateOnly { fut });
            }
        } else {
            let existing = target_entry.unwrap().as_tree().expect("checked is_tree above").clone();
            let fut = merge_boxed(existing, input_child.clone(), options.clone(), next_base, preload, cancel.clone());
            jobs.push(PendingJob::PropagateOnly { fut });
        }
    }

    let mut attach_futs = Vec::new();
    let mut propagate_futs = Vec::new();
    for job in jobs {
        match job {
            PendingJob::AttachIfDirty { name, fresh, fut } => attach_futs.push((name, fresh, fut)),
            PendingJob::PropagateOnly { fut } => propagate_futs.push(fut),
        }
    }

    let attach_results = join_all(attach_futs.into_iter().map(|(name, fresh, fut)| async move {
        let dirty = fut.await?;
        Ok::<_, GitError>((name, fresh, dirty))
    }))
    .await;
    for result in attach_results {
        let (name, fresh, dirty) = result?;
        if dirty {
            target.set_child(&name, TreeEntry::Tree(fresh)).await;
            became_dirty = true;
        }
    }

    for result in join_all(propagate_futs).await {
        if result? {
            became_dirty = true;
        }
    }

    if options.mode == MergeMode::Replace {
        let target_children_after = target.children().await?;
        for name in target_children_after.keys() {
            if !input_children.contains_key(name) {
                target.delete_child(name).await?;
                became_dirty = true;
            }
        }
    }

    if became_dirty {
        target.mark_dirty().await;
    }

    Ok(became_dirty)
}
