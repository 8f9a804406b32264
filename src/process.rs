//! The process executor: runs one git invocation in capture, spawn, or
//! shell mode, with line-streaming callbacks and a process-count
//! semaphore to protect against file-descriptor exhaustion under wide
//! merge fan-out.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::process::CommandExt as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{OnceCell, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;

use crate::encode::{GitOptions, OptionValue};
use crate::error::{GitError, Result};

/// Default cap on how many git children may be alive at once, mirroring the
/// process-group-isolated spawn ceiling already used in this codebase for
/// the same reason: avoid running out of file descriptors under fan-out.
const DEFAULT_MAX_CONCURRENT_PROCESSES: usize = 64;

static COMMAND_SEM: std::sync::OnceLock<Semaphore> = std::sync::OnceLock::new();

fn command_semaphore() -> &'static Semaphore {
    COMMAND_SEM.get_or_init(|| Semaphore::new(DEFAULT_MAX_CONCURRENT_PROCESSES))
}

/// A line callback: invoked once per newline-delimited line of stdout/stderr.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One argv element: either a bare positional, or an option group to encode
/// in place. Interleaving these lets callers control argv order precisely,
/// e.g. putting `--` before a pathspec.
#[derive(Debug, Clone)]
pub enum ArgToken {
    Positional(String),
    Options(GitOptions),
}

impl ArgToken {
    pub fn pos(s: impl Into<String>) -> Self {
        ArgToken::Positional(s.into())
    }
}

/// Decoded executor controls for one invocation: the `$`-prefixed keys
/// split out of an options map by
/// [`GitOptions::partition_executor_controls`] before encoding.
#[derive(Clone)]
pub struct ExecSpec {
    pub spawn: bool,
    pub shell: bool,
    pub null_on_error: bool,
    pub passthrough: bool,
    pub wait: bool,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub preserve_env: bool,
    pub git_dir: Option<PathBuf>,
    pub work_tree: Option<PathBuf>,
    pub index_file: Option<PathBuf>,
    pub on_stdout: Option<LineCallback>,
    pub on_stderr: Option<LineCallback>,
}

impl Default for ExecSpec {
    fn default() -> Self {
        Self {
            spawn: false,
            shell: false,
            null_on_error: false,
            passthrough: false,
            wait: false,
            cwd: None,
            env: Vec::new(),
            preserve_env: true,
            git_dir: None,
            work_tree: None,
            index_file: None,
            on_stdout: None,
            on_stderr: None,
        }
    }
}

impl ExecSpec {
    /// Build an `ExecSpec` from the `$`-prefixed control entries split out of
    /// an options map. Unknown controls are a [`GitError::BadArgument`].
    pub fn from_controls(controls: Vec<(String, OptionValue)>) -> Result<Self> {
        let mut spec = ExecSpec::default();
        for (key, value) in controls {
            match key.as_str() {
                "spawn" => spec.spawn = as_bool(&key, &value)?,
                "shell" => spec.shell = as_bool(&key, &value)?,
                "nullOnError" => spec.null_on_error = as_bool(&key, &value)?,
                "passthrough" => spec.passthrough = as_bool(&key, &value)?,
                "wait" => spec.wait = as_bool(&key, &value)?,
                "preserveEnv" => spec.preserve_env = as_bool(&key, &value)?,
                "cwd" => spec.cwd = Some(PathBuf::from(as_text(&key, &value)?)),
                "gitDir" => spec.git_dir = Some(PathBuf::from(as_text(&key, &value)?)),
                "workTree" => spec.work_tree = Some(PathBuf::from(as_text(&key, &value)?)),
                "indexFile" => spec.index_file = Some(PathBuf::from(as_text(&key, &value)?)),
                "env" => spec.env = as_env_list(&value)?,
                "onStdout" => spec.on_stdout = Some(as_callback(&key, value)?),
                "onStderr" => spec.on_stderr = Some(as_callback(&key, value)?),
                other => {
                    return Err(GitError::BadArgument(format!(
                        "unknown executor control \"${other}\""
                    )))
                }
            }
        }
        Ok(spec)
    }

    pub fn on_stdout(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stdout = Some(Arc::new(f));
        self
    }

    pub fn on_stderr(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stderr = Some(Arc::new(f));
        self
    }
}

fn as_callback(key: &str, value: OptionValue) -> Result<LineCallback> {
    match value {
        OptionValue::Callback(f) => Ok(f),
        other => Err(GitError::BadArgument(format!(
            "executor control \"${key}\" expects a callback, got {other:?}"
        ))),
    }
}

fn as_bool(key: &str, value: &OptionValue) -> Result<bool> {
    match value {
        OptionValue::Bool(b) => Ok(*b),
        OptionValue::Null => Ok(false),
        other => Err(GitError::BadArgument(format!(
            "executor control \"${key}\" expects a boolean, got {other:?}"
        ))),
    }
}

fn as_text(key: &str, value: &OptionValue) -> Result<String> {
    match value {
        OptionValue::Text(s) => Ok(s.clone()),
        other => Err(GitError::BadArgument(format!(
            "executor control \"${key}\" expects a string, got {other:?}"
        ))),
    }
}

fn as_env_list(value: &OptionValue) -> Result<Vec<(String, String)>> {
    let OptionValue::List(items) = value else {
        return Err(GitError::BadArgument(
            "executor control \"$env\" expects a list of \"KEY=VALUE\" entries".to_owned(),
        ));
    };
    items
        .iter()
        .map(|item| {
            let OptionValue::Text(entry) = item else {
                return Err(GitError::BadArgument(
                    "\"$env\" entries must be strings".to_owned(),
                ));
            };
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .ok_or_else(|| {
                    GitError::BadArgument(format!("\"$env\" entry \"{entry}\" missing \"=\""))
                })
        })
        .collect()
}

/// Outcome of [`crate::client::GitClient::exec`].
pub enum ExecResult {
    /// Capture or shell mode: the trimmed stdout, or `None` if
    /// `nullOnError` suppressed a non-zero exit.
    Captured(Option<String>),
    /// Spawn mode: a live process handle.
    Spawned(SpawnHandle),
    /// Spawn mode with `wait` set: the invocation already ran to completion.
    Waited,
}

/// Compose the full argv for one invocation: global options, subcommand,
/// then the caller's tokens in the order given.
pub fn build_argv(subcommand: &str, args: &[ArgToken], spec: &ExecSpec) -> Vec<String> {
    let mut argv = Vec::new();
    if let Some(git_dir) = &spec.git_dir {
        argv.push(format!("--git-dir={}", git_dir.display()));
    }
    if let Some(work_tree) = &spec.work_tree {
        argv.push(format!("--work-tree={}", work_tree.display()));
    }
    argv.push(subcommand.to_owned());
    for token in args {
        match token {
            ArgToken::Positional(s) => argv.push(s.clone()),
            ArgToken::Options(opts) => argv.extend(opts.encode()),
        }
    }
    argv
}

fn build_env(spec: &ExecSpec) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = if spec.preserve_env {
        std::env::vars().collect()
    } else {
        HashMap::new()
    };
    if let Some(index_file) = &spec.index_file {
        env.insert("GIT_INDEX_FILE".to_owned(), index_file.display().to_string());
    }
    for (k, v) in &spec.env {
        env.insert(k.clone(), v.clone());
    }
    env
}

fn command_line(git_binary: &OsStr, argv: &[String]) -> String {
    let mut parts = vec![git_binary.to_string_lossy().into_owned()];
    parts.extend(argv.iter().cloned());
    parts.join(" ")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Run one invocation in capture mode (used directly for capture, and for
/// shell mode, which differs only in how argv is constructed).
pub async fn capture(
    git_binary: &OsStr,
    argv: Vec<String>,
    cwd: Option<&std::path::Path>,
    spec: &ExecSpec,
    max_captured_bytes: usize,
) -> Result<Option<String>> {
    let permit = command_semaphore()
        .acquire()
        .await
        .expect("command semaphore never closed");
    let env = build_env(spec);
    let mut cmd = Command::new(git_binary);
    cmd.args(&argv).envs(&env).kill_on_drop(true);
    // Separate process group so a Ctrl-C on our terminal doesn't also signal
    // the child; we reap it ourselves via kill_on_drop/wait.
    cmd.process_group(0);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| GitError::Exec {
        command: command_line(git_binary, &argv),
        source: e,
    })?;
    // `_permit` stays alive for the rest of this function, so the slot is
    // only released once the child has been waited on below.
    let _permit = permit;

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        read_capped(&mut stdout, &mut stdout_buf, max_captured_bytes).await?;
    }
    if let Some(mut stderr) = child.stderr.take() {
        read_capped(&mut stderr, &mut stderr_buf, max_captured_bytes).await?;
    }
    let status = child.wait().await.map_err(GitError::Io)?;

    if status.success() {
        let stdout = String::from_utf8_lossy(&stdout_buf).trim_end().to_owned();
        Ok(Some(stdout))
    } else if spec.null_on_error {
        Ok(None)
    } else {
        Err(GitError::Subprocess {
            command: command_line(git_binary, &argv),
            code: status.code(),
            stderr: String::from_utf8_lossy(&stderr_buf).trim().to_owned(),
            stdout: Some(String::from_utf8_lossy(&stdout_buf).into_owned()),
        })
    }
}

async fn read_capped(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await.map_err(GitError::Io)?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > max_bytes {
            return Err(GitError::OutputTooLarge { limit: max_bytes });
        }
    }
}

/// Run one invocation via the platform shell: command and argv are joined
/// into a single string.
pub async fn run_shell(
    git_binary: &OsStr,
    argv: Vec<String>,
    cwd: Option<&std::path::Path>,
    spec: &ExecSpec,
    max_captured_bytes: usize,
) -> Result<Option<String>> {
    let mut parts = vec![shell_quote(&git_binary.to_string_lossy())];
    parts.extend(argv.iter().map(|s| shell_quote(s)));
    let script = parts.join(" ");

    let permit = command_semaphore()
        .acquire()
        .await
        .expect("command semaphore never closed");
    let env = build_env(spec);
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&script).envs(&env).kill_on_drop(true);
    cmd.process_group(0);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| GitError::Exec {
        command: script.clone(),
        source: e,
    })?;
    let _permit = permit;

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    if let Some(mut stdout) = child.stdout.take() {
        read_capped(&mut stdout, &mut stdout_buf, max_captured_bytes).await?;
    }
    if let Some(mut stderr) = child.stderr.take() {
        read_capped(&mut stderr, &mut stderr_buf, max_captured_bytes).await?;
    }
    let status = child.wait().await.map_err(GitError::Io)?;

    if status.success() {
        Ok(Some(String::from_utf8_lossy(&stdout_buf).trim_end().to_owned()))
    } else if spec.null_on_error {
        Ok(None)
    } else {
        Err(GitError::Subprocess {
            command: script,
            code: status.code(),
            stderr: String::from_utf8_lossy(&stderr_buf).trim().to_owned(),
            stdout: Some(String::from_utf8_lossy(&stdout_buf).into_owned()),
        })
    }
}

/// Spawn-mode live process handle. Line callbacks and
/// `passthrough` logging are serviced by background tasks started at
/// construction time; `capture_output`/`capture_output_trimmed` are
/// memoized so repeated calls don't re-drain the pipes.
pub struct SpawnHandle {
    command_desc: String,
    _permit: SemaphorePermit<'static>,
    child: SyncMutex<Option<Child>>,
    stdin: SyncMutex<Option<ChildStdin>>,
    stdout_buf: Arc<SyncMutex<Vec<u8>>>,
    stderr_buf: Arc<SyncMutex<Vec<u8>>>,
    stdout_task: SyncMutex<Option<JoinHandle<()>>>,
    stderr_task: SyncMutex<Option<JoinHandle<()>>>,
    captured: OnceCell<std::result::Result<String, CaptureFailure>>,
}

#[derive(Debug, Clone)]
pub struct CaptureFailure {
    pub output: String,
    pub code: Option<i32>,
    pub error: String,
}

impl SpawnHandle {
    pub async fn new(
        git_binary: &OsStr,
        argv: Vec<String>,
        cwd: Option<&std::path::Path>,
        spec: &ExecSpec,
    ) -> Result<Self> {
        let permit = command_semaphore()
            .acquire()
            .await
            .expect("command semaphore never closed");
        let env = build_env(spec);
        let mut cmd = Command::new(git_binary);
        cmd.args(&argv).envs(&env).kill_on_drop(true);
        cmd.process_group(0);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let command_desc = command_line(git_binary, &argv);
        let mut child = cmd.spawn().map_err(|e| GitError::Exec {
            command: command_desc.clone(),
            source: e,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_buf = Arc::new(SyncMutex::new(Vec::new()));
        let stderr_buf = Arc::new(SyncMutex::new(Vec::new()));

        let stdout_task = stdout.map(|r| {
            spawn_line_reader(r, stdout_buf.clone(), spec.on_stdout.clone(), spec.passthrough, false)
        });
        let stderr_task = stderr.map(|r| {
            spawn_line_reader(r, stderr_buf.clone(), spec.on_stderr.clone(), spec.passthrough, true)
        });

        Ok(Self {
            command_desc,
            _permit: permit,
            child: SyncMutex::new(Some(child)),
            stdin: SyncMutex::new(stdin),
            stdout_buf,
            stderr_buf,
            stdout_task: SyncMutex::new(stdout_task),
            stderr_task: SyncMutex::new(stderr_task),
            captured: OnceCell::new(),
        })
    }

    /// Write to the child's stdin without closing it.
    pub async fn write_stdin(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock();
        if let Some(stdin) = guard.as_mut() {
            stdin.write_all(bytes).await.map_err(GitError::Io)?;
        }
        Ok(())
    }

    /// Close stdin, signalling EOF to the child.
    pub fn close_stdin(&self) {
        *self.stdin.lock() = None;
    }

    /// Write `input` (if any), close stdin, and resolve to full stdout on a
    /// clean exit. Memoized: subsequent calls return the same result.
    pub async fn capture_output(&self, input: Option<&[u8]>) -> std::result::Result<String, CaptureFailure> {
        if let Some(bytes) = input {
            let _ = self.write_stdin(bytes).await;
        }
        self.close_stdin();
        self.captured
            .get_or_init(|| async { self.drain_and_wait().await })
            .await
            .clone()
    }

    /// Same as [`Self::capture_output`] but with trailing whitespace trimmed.
    pub async fn capture_output_trimmed(
        &self,
        input: Option<&[u8]>,
    ) -> std::result::Result<String, CaptureFailure> {
        self.capture_output(input)
            .await
            .map(|s| s.trim_end().to_owned())
    }

    /// Close stdin and wait for exit, resolving to `Ok(())` on a clean exit.
    pub async fn wait_success(&self) -> Result<()> {
        self.close_stdin();
        match self.drain_and_wait().await {
            Ok(_) => Ok(()),
            Err(failure) => Err(GitError::Subprocess {
                command: self.command_desc.clone(),
                code: failure.code,
                stderr: failure.error,
                stdout: Some(failure.output),
            }),
        }
    }

    async fn drain_and_wait(&self) -> std::result::Result<String, CaptureFailure> {
        if let Some(task) = self.stdout_task.lock().take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.lock().take() {
            let _ = task.await;
        }
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Ok(String::from_utf8_lossy(&self.stdout_buf.lock()).into_owned());
        };
        let status = match child.wait().await {
            Ok(s) => s,
            Err(e) => {
                return Err(CaptureFailure {
                    output: String::from_utf8_lossy(&self.stdout_buf.lock()).into_owned(),
                    code: None,
                    error: e.to_string(),
                })
            }
        };
        let stdout = String::from_utf8_lossy(&self.stdout_buf.lock()).into_owned();
        if status.success() {
            Ok(stdout)
        } else {
            Err(CaptureFailure {
                output: stdout,
                code: status.code(),
                error: String::from_utf8_lossy(&self.stderr_buf.lock()).trim().to_owned(),
            })
        }
    }
}

fn spawn_line_reader(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    buf: Arc<SyncMutex<Vec<u8>>>,
    callback: Option<LineCallback>,
    passthrough: bool,
    is_stderr: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    {
                        let mut guard = buf.lock();
                        guard.extend_from_slice(line.as_bytes());
                        guard.push(b'\n');
                    }
                    if let Some(cb) = &callback {
                        cb(&line);
                    }
                    if passthrough {
                        if is_stderr {
                            log::warn!("{line}");
                        } else {
                            log::info!("{line}");
                        }
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    log::debug!("error reading child output: {e}");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_controls_rejects_unknown_key() {
        let err = ExecSpec::from_controls(vec![("bogus".to_owned(), OptionValue::Bool(true))]).unwrap_err();
        assert!(matches!(err, GitError::BadArgument(_)));
    }

    #[test]
    fn from_controls_rejects_non_callback_value_for_on_stdout() {
        let err = ExecSpec::from_controls(vec![("onStdout".to_owned(), OptionValue::Bool(true))]).unwrap_err();
        assert!(matches!(err, GitError::BadArgument(_)));
    }

    #[test]
    fn from_controls_wires_on_stdout_and_on_stderr_callbacks() {
        let stdout_lines: Arc<SyncMutex<Vec<String>>> = Arc::new(SyncMutex::new(Vec::new()));
        let stderr_lines: Arc<SyncMutex<Vec<String>>> = Arc::new(SyncMutex::new(Vec::new()));
        let out_clone = stdout_lines.clone();
        let err_clone = stderr_lines.clone();
        let on_stdout: LineCallback = Arc::new(move |line: &str| out_clone.lock().push(line.to_owned()));
        let on_stderr: LineCallback = Arc::new(move |line: &str| err_clone.lock().push(line.to_owned()));

        let spec = ExecSpec::from_controls(vec![
            ("onStdout".to_owned(), OptionValue::Callback(on_stdout)),
            ("onStderr".to_owned(), OptionValue::Callback(on_stderr)),
        ])
        .unwrap();

        spec.on_stdout.as_ref().expect("onStdout wired")("hello");
        spec.on_stderr.as_ref().expect("onStderr wired")("world");
        assert_eq!(*stdout_lines.lock(), vec!["hello".to_owned()]);
        assert_eq!(*stderr_lines.lock(), vec!["world".to_owned()]);
    }

    /// Exercises the full path a real `$onStdout` control takes: decoded by
    /// `from_controls`, then actually consumed by a spawned child's line
    /// reader, streaming each line as it arrives rather than only at exit.
    #[tokio::test]
    async fn spawn_mode_streams_real_child_stdout_through_on_stdout_control() {
        let lines: Arc<SyncMutex<Vec<String>>> = Arc::new(SyncMutex::new(Vec::new()));
        let collected = lines.clone();
        let on_stdout: LineCallback = Arc::new(move |line: &str| collected.lock().push(line.to_owned()));

        let spec = ExecSpec::from_controls(vec![(
            "onStdout".to_owned(),
            OptionValue::Callback(on_stdout),
        )])
        .unwrap();

        let argv = vec!["-c".to_owned(), "printf 'one\\ntwo\\n'".to_owned()];
        let handle = SpawnHandle::new(OsStr::new("sh"), argv, None, &spec).await.unwrap();
        handle.wait_success().await.unwrap();
        assert_eq!(*lines.lock(), vec!["one".to_owned(), "two".to_owned()]);
    }

    #[tokio::test]
    async fn capture_mode_runs_real_subprocess_and_trims_stdout() {
        let spec = ExecSpec::default();
        let argv = vec!["hello world".to_owned()];
        let out = capture(OsStr::new("echo"), argv, None, &spec, 1024).await.unwrap();
        assert_eq!(out.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn capture_mode_surfaces_nonzero_exit_as_subprocess_error() {
        let spec = ExecSpec::default();
        let argv = vec!["1".to_owned()];
        let err = capture(OsStr::new("false"), argv, None, &spec, 1024).await.unwrap_err();
        match err {
            GitError::Subprocess { code, .. } => assert_eq!(code, Some(1)),
            other => panic!("expected Subprocess error, got {other:?}"),
        }
    }
}
