//! Error types for this crate.
//!
//! [`GitError`] is the single error type returned by every fallible public
//! API. It uses rich enum variants so callers can match on specific failure
//! modes (a non-zero git exit, a malformed option, a dead batch worker)
//! without parsing error message text.

use thiserror::Error;

/// Errors produced by driving the git binary or by the in-memory tree model.
#[derive(Debug, Error)]
pub enum GitError {
    /// `git` exited with a non-zero status.
    #[error("`{command}` exited with code {code:?}: {stderr}")]
    Subprocess {
        /// The command line that was run, for diagnostics.
        command: String,
        /// Exit code, or `None` if the process was killed by a signal.
        code: Option<i32>,
        /// Captured stderr, trimmed.
        stderr: String,
        /// Captured stdout, when available.
        stdout: Option<String>,
    },

    /// The git binary itself could not be spawned (not found, permission denied, ...).
    #[error("failed to execute `{command}`: {source}")]
    Exec {
        /// The command that failed to start.
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A caller-supplied option or argument was malformed.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The persistent `mktree --batch` worker died while a request was outstanding.
    #[error("mktree --batch worker failed: exit code {code:?}: {stderr}")]
    BatchFailure {
        /// Exit code of the batch worker child, if it exited normally.
        code: Option<i32>,
        /// Captured stderr from the batch worker.
        stderr: String,
        /// Whatever partial stdout had been buffered for the failed request.
        stdout: String,
    },

    /// Git's output did not match the format this crate expects to parse.
    #[error("failed to parse {what}: {text:?}")]
    Parse {
        /// What we were trying to parse (e.g. `"ls-tree line"`).
        what: &'static str,
        /// The offending text.
        text: String,
    },

    /// Captured output exceeded the configured limit.
    #[error("output exceeded {limit} byte limit")]
    OutputTooLarge {
        /// The configured limit, in bytes.
        limit: usize,
    },

    /// An I/O error occurred (file system, pipe, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GitError>;
