//! A programmatic client for the git content-addressable object store,
//! driving the installed `git` binary as a subprocess.
//!
//! [`client::GitClient`] is the entry point: a stateful facade bound to an
//! optional repository location that exposes a generic [`process::ExecSpec`]-driven
//! `exec`, a family of thin subcommand wrappers, and ownership of the
//! persistent [`batch::BatchedTreeBuilder`]. [`tree::TreeNode`] is the
//! in-memory, lazily-hydrated, copy-on-write tree model; [`merge`]
//! implements filtered recursive merges between two trees.

pub mod batch;
pub mod cache;
pub mod client;
pub mod encode;
pub mod error;
pub mod merge;
pub mod process;
pub mod snapshot;
#[cfg(test)]
pub mod test_support;
pub mod tree;

pub use client::{GitClient, GitClientConfig};
pub use encode::{GitOptions, OptionValue};
pub use error::{GitError, Result};
pub use merge::{merge as merge_trees, MergeMode, MergeOptions};
pub use process::{ArgToken, ExecResult, SpawnHandle};
pub use tree::{BlobRef, TreeEntry, TreeNode};
