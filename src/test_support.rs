//! Test-only fixture: a throwaway git repository for integration tests.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::client::{GitClient, GitClientConfig};

/// An initialized, empty repository in a fresh temp directory, torn down on
/// drop, with a [`GitClient`] already bound to it.
pub struct TempRepo {
    dir: TempDir,
    pub client: Arc<GitClient>,
}

impl TempRepo {
    pub async fn new() -> anyhow::Result<Self> {
        let dir = TempDir::with_prefix("git-treeclient-fixture-").expect("couldn't make tempdir");
        let config = GitClientConfig {
            work_tree: Some(dir.path().to_path_buf()),
            git_dir: Some(dir.path().join(".git")),
            ..GitClientConfig::default()
        };
        let client = Arc::new(GitClient::new(config));
        client.run("init", Vec::new()).await?;
        Ok(Self { dir, client })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
