//! The stateful facade: binds an optional git-dir/work-tree/index-file,
//! owns the process executor and the batched tree builder, and
//! synthesizes thin per-subcommand wrappers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use semver::{Version, VersionReq};
use tokio::sync::{Mutex, OnceCell};

use crate::batch::BatchedTreeBuilder;
use crate::cache::ObjectCache;
use crate::encode::GitOptions;
use crate::error::{GitError, Result};
use crate::process::{self, ArgToken, ExecResult, ExecSpec};

/// Constructor-level configuration. Not file-backed: this crate's own
/// settings are always passed as plain arguments.
#[derive(Debug, Clone)]
pub struct GitClientConfig {
    pub git_binary: PathBuf,
    pub git_dir: Option<PathBuf>,
    pub work_tree: Option<PathBuf>,
    pub index_file: Option<PathBuf>,
    pub max_captured_bytes: usize,
    pub batch_idle_timeout: Duration,
}

impl Default for GitClientConfig {
    fn default() -> Self {
        Self {
            git_binary: PathBuf::from("git"),
            git_dir: None,
            work_tree: None,
            index_file: None,
            max_captured_bytes: 5 * 1024 * 1024,
            batch_idle_timeout: Duration::from_secs(1),
        }
    }
}

/// Stateful client bound to an optional repository location. Owns the
/// object cache and lazily starts the batched `mktree` worker on first
/// tree write.
pub struct GitClient {
    config: GitClientConfig,
    object_cache: ObjectCache,
    version_cell: OnceCell<String>,
    batch: Mutex<Option<Arc<BatchedTreeBuilder>>>,
}

lazy_static! {
    static ref HASH_RE: Regex = Regex::new("^[0-9a-f]{40}$").unwrap();
    static ref VERSION_RE: Regex = Regex::new(r"git version (\d+(?:\.\d+)*)").unwrap();
}

impl GitClient {
    pub fn new(config: GitClientConfig) -> Self {
        Self {
            config,
            object_cache: ObjectCache::new(),
            version_cell: OnceCell::new(),
            batch: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GitClientConfig {
        &self.config
    }

    pub fn object_cache(&self) -> &ObjectCache {
        &self.object_cache
    }

    /// The generic entry point: `args` may interleave positional tokens
    /// and option groups; `$`-prefixed keys inside any option group are
    /// executor controls rather than git options.
    pub async fn exec(&self, subcommand: &str, args: Vec<ArgToken>) -> Result<ExecResult> {
        let mut controls = Vec::new();
        let mut git_args = Vec::with_capacity(args.len());
        for token in args {
            match token {
                ArgToken::Positional(s) => git_args.push(ArgToken::Positional(s)),
                ArgToken::Options(opts) => {
                    let (git_opts, these_controls) = opts.partition_executor_controls();
                    controls.extend(these_controls);
                    git_args.push(ArgToken::Options(git_opts));
                }
            }
        }

        let mut spec = ExecSpec::from_controls(controls)?;
        if spec.git_dir.is_none() {
            spec.git_dir = self.config.git_dir.clone();
        }
        if spec.work_tree.is_none() {
            spec.work_tree = self.config.work_tree.clone();
        }
        if spec.index_file.is_none() {
            spec.index_file = self.config.index_file.clone();
        }

        let argv = process::build_argv(subcommand, &git_args, &spec);
        let git_binary = self.config.git_binary.as_os_str();

        if spec.shell {
            let out = process::run_shell(git_binary, argv, spec.cwd.as_deref(), &spec, self.config.max_captured_bytes).await?;
            Ok(ExecResult::Captured(out))
        } else if spec.spawn {
            let handle = process::SpawnHandle::new(git_binary, argv, spec.cwd.as_deref(), &spec).await?;
            if spec.wait {
                handle.wait_success().await?;
                Ok(ExecResult::Waited)
            } else {
                Ok(ExecResult::Spawned(handle))
            }
        } else {
            let out = process::capture(git_binary, argv, spec.cwd.as_deref(), &spec, self.config.max_captured_bytes).await?;
            Ok(ExecResult::Captured(out))
        }
    }

    /// Capture-mode convenience for the many thin subcommand wrappers:
    /// runs `exec` and unwraps the captured text.
    pub async fn run(&self, subcommand: &str, args: Vec<ArgToken>) -> Result<String> {
        match self.exec(subcommand, args).await? {
            ExecResult::Captured(Some(text)) => Ok(text),
            ExecResult::Captured(None) => Ok(String::new()),
            ExecResult::Spawned(_) | ExecResult::Waited => {
                unreachable!("run() never sets $spawn or $shell controls")
            }
        }
    }

    pub fn is_hash(s: &str) -> bool {
        HASH_RE.is_match(s)
    }

    pub async fn get_tree_hash(&self, treeish: &str) -> Result<String> {
        self.run(
            "rev-parse",
            vec![
                ArgToken::Options(GitOptions::new().push("verify", true)),
                ArgToken::pos(format!("{treeish}^{{tree}}")),
            ],
        )
        .await
    }

    /// `ls-tree <hash>`, optionally `-r -t` for recursive preload.
    pub async fn ls_tree_raw(&self, hash: &str, preload: bool) -> Result<String> {
        let mut opts = GitOptions::new();
        if preload {
            opts = opts.push("r", true).push("t", true);
        }
        self.run("ls-tree", vec![ArgToken::Options(opts), ArgToken::pos(hash.to_owned())]).await
    }

    /// `ls-tree --full-tree -r <treeish>`, used by `TreeSnapshot::read`.
    pub async fn ls_tree_full_tree_recursive(&self, treeish: &str) -> Result<String> {
        let opts = GitOptions::new().push("full-tree", true).push("r", true);
        self.run("ls-tree", vec![ArgToken::Options(opts), ArgToken::pos(treeish.to_owned())]).await
    }

    /// `hash-object -w --stdin`, run in spawn mode so `content` can be
    /// streamed through stdin rather than held on the command line.
    pub async fn hash_object_write_stdin(&self, content: &[u8]) -> Result<String> {
        let opts = GitOptions::new().push("w", true).push("stdin", true);
        let default_spec = ExecSpec::default();
        let argv = process::build_argv("hash-object", &[ArgToken::Options(opts)], &default_spec);
        let handle =
            process::SpawnHandle::new(self.config.git_binary.as_os_str(), argv, None, &default_spec).await?;
        handle
            .capture_output_trimmed(Some(content))
            .await
            .map_err(|failure| GitError::Subprocess {
                command: "git hash-object -w --stdin".to_owned(),
                code: failure.code,
                stderr: failure.error,
                stdout: Some(failure.output),
            })
    }

    /// `git version` output, memoized for the lifetime of this client.
    pub async fn version(&self) -> Result<&str> {
        self.version_cell
            .get_or_try_init(|| async {
                let text = self.run("version", Vec::new()).await?;
                parse_git_version(&text)
            })
            .await
            .map(String::as_str)
    }

    pub async fn satisfies_version(&self, requirement: &str) -> Result<bool> {
        let version_str = self.version().await?.to_owned();
        let req = VersionReq::parse(requirement)
            .map_err(|e| GitError::BadArgument(format!("invalid version requirement \"{requirement}\": {e}")))?;
        let version = Version::parse(&normalize_semver(&version_str)).map_err(|_| GitError::Parse {
            what: "git version as semver",
            text: version_str.clone(),
        })?;
        Ok(req.matches(&version))
    }

    pub async fn require_version(&self, requirement: &str) -> Result<()> {
        if self.satisfies_version(requirement).await? {
            Ok(())
        } else {
            let version_str = self.version().await?.to_owned();
            Err(GitError::BadArgument(format!(
                "git {version_str} does not satisfy required version \"{requirement}\""
            )))
        }
    }

    /// Read a flat-file `key=value` config set, skipping blank and
    /// `#`-comment lines.
    pub fn read_config_set(path: &Path) -> Result<Vec<(String, String)>> {
        let text = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.push((key.to_owned(), value.to_owned()));
            }
        }
        Ok(entries)
    }

    /// Write a flat-file `key=value` config set, deterministically sorted
    /// by key.
    pub fn write_config_set(path: &Path, entries: &[(String, String)]) -> Result<()> {
        let mut sorted = entries.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut text = sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("\n");
        text.push('\n');
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Lazily start (or return the already-running) batched `mktree`
    /// worker.
    pub async fn batch_tree_builder(&self) -> Result<Arc<BatchedTreeBuilder>> {
        let mut guard = self.batch.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }
        let builder = Arc::new(BatchedTreeBuilder::new(
            self.config.git_binary.clone(),
            self.config.git_dir.clone(),
            self.config.work_tree.clone(),
            self.config.batch_idle_timeout,
        ));
        *guard = Some(builder.clone());
        Ok(builder)
    }

    /// Terminate the batch worker, if one was ever started.
    pub async fn cleanup(&self) {
        if let Some(builder) = self.batch.lock().await.take() {
            builder.cleanup().await;
        }
    }
}

impl Drop for GitClient {
    fn drop(&mut self) {
        // Async cleanup can't run in `Drop`; the batch child's
        // `kill_on_drop` still reaps it, but callers should prefer an
        // explicit `cleanup().await` before dropping a client that did
        // any tree writes.
        log::debug!("GitClient dropped without an explicit cleanup() call");
    }
}

fn parse_git_version(text: &str) -> Result<String> {
    VERSION_RE
        .captures(text)
        .map(|caps| caps[1].to_owned())
        .ok_or_else(|| GitError::Parse {
            what: "git version string",
            text: text.to_owned(),
        })
}

/// `git --version` sometimes reports more than three components (e.g.
/// `2.34.1.windows.1`); `semver::Version` requires exactly three.
fn normalize_semver(version: &str) -> String {
    let mut parts: Vec<&str> = version.split('.').take(3).collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_40_hex_hashes() {
        assert!(GitClient::is_hash(&"a".repeat(40)));
        assert!(!GitClient::is_hash("not-a-hash"));
        assert!(!GitClient::is_hash(&"a".repeat(39)));
    }

    #[test]
    fn parses_git_version_string() {
        assert_eq!(parse_git_version("git version 2.34.1").unwrap(), "2.34.1");
    }

    #[test]
    fn normalizes_extended_version_strings_for_semver() {
        assert_eq!(normalize_semver("2.34.1.windows.1"), "2.34.1");
        assert_eq!(normalize_semver("2.7"), "2.7.0");
    }

    #[test]
    fn config_set_round_trips_sorted_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config-set");
        let entries = vec![
            ("zebra".to_owned(), "1".to_owned()),
            ("alpha".to_owned(), "2".to_owned()),
        ];
        GitClient::write_config_set(&path, &entries).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "alpha=2\nzebra=1\n");

        let read_back = GitClient::read_config_set(&path).unwrap();
        assert_eq!(read_back, vec![("alpha".to_owned(), "2".to_owned()), ("zebra".to_owned(), "1".to_owned())]);
    }

    #[test]
    fn config_set_skips_blank_and_comment_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config-set");
        std::fs::write(&path, "# a comment\n\nkey=value\n").unwrap();
        assert_eq!(
            GitClient::read_config_set(&path).unwrap(),
            vec![("key".to_owned(), "value".to_owned())]
        );
    }

    #[tokio::test]
    async fn reports_a_real_git_version() {
        let repo = crate::test_support::TempRepo::new().await.unwrap();
        let version = repo.client.version().await.unwrap();
        assert!(version.chars().next().unwrap().is_ascii_digit());
        assert!(repo.client.satisfies_version(">=1.0.0").await.unwrap());
    }

    #[tokio::test]
    async fn writes_and_reads_back_a_blob_against_a_real_repository() {
        let repo = crate::test_support::TempRepo::new().await.unwrap();
        let hash = repo.client.hash_object_write_stdin(b"hello\n").await.unwrap();
        assert!(GitClient::is_hash(&hash));

        let out = repo
            .client
            .run("cat-file", vec![ArgToken::Options(GitOptions::new().push("p", true)), ArgToken::pos(hash)])
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn exec_streams_spawned_stdout_through_the_on_stdout_control() {
        let repo = crate::test_support::TempRepo::new().await.unwrap();
        repo.client.hash_object_write_stdin(b"content\n").await.unwrap();

        let lines = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let collected = lines.clone();
        let callback: crate::process::LineCallback =
            std::sync::Arc::new(move |line: &str| collected.lock().push(line.to_owned()));
        let on_stdout = crate::encode::OptionValue::Callback(callback);

        let controls = GitOptions::new()
            .push("$spawn", true)
            .push("$wait", true)
            .push("$onStdout", on_stdout);
        let result = repo
            .client
            .exec("version", vec![ArgToken::Options(controls)])
            .await
            .unwrap();
        assert!(matches!(result, ExecResult::Waited));
        assert_eq!(lines.lock().len(), 1);
        assert!(lines.lock()[0].starts_with("git version"));
    }
}
