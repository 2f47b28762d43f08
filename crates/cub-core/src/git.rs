//! Thin adapter over the `git` binary.
//!
//! Every other module reaches git through [`GitPlumbing`]; nothing else in the
//! crate spawns processes. The adapter favours plumbing commands
//! (`hash-object`, `mktree`, `commit-tree`, `update-ref`, ...) that operate on
//! the object database and refs without touching the index or working tree.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::string::FromUtf8Error;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const BLOB_MODE: &str = "100644";
const TREE_MODE: &str = "040000";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git command returned non-zero exit ({command}) status={status:?}: {}", .stderr.trim())]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("git command timed out after {timeout_secs}s ({command})")]
    Timeout { command: String, timeout_secs: u64 },
    #[error("git command output was not valid UTF-8 ({command}, {stream}): {source}")]
    NonUtf8Output {
        command: String,
        stream: &'static str,
        #[source]
        source: FromUtf8Error,
    },
    #[error("path is not inside a git repository: {}", .path.display())]
    NotARepository { path: PathBuf },
    #[error("invalid git output: {context}")]
    Parse { context: String },
}

impl GitError {
    /// Exit status of a failed command, if the command ran at all.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            GitError::CommandFailed { status, .. } => *status,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: String,
    pub kind: String,
    pub sha: String,
    pub name: String,
}

impl TreeEntry {
    pub fn blob(name: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            mode: BLOB_MODE.to_string(),
            kind: "blob".to_string(),
            sha: sha.into(),
            name: name.into(),
        }
    }

    pub fn tree(name: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            mode: TREE_MODE.to_string(),
            kind: "tree".to_string(),
            sha: sha.into(),
            name: name.into(),
        }
    }

    pub fn is_tree(&self) -> bool {
        self.kind == "tree"
    }
}

/// Result of trying a version-control-aware move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveAttempt {
    Moved,
    /// The source is not tracked by git; the caller should move it on disk.
    NeedsFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitPlumbing {
    binary: PathBuf,
    cwd: PathBuf,
    timeout: Duration,
}

impl GitPlumbing {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from("git"),
            cwd: cwd.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a git command and return its stdout.
    pub fn run<I, S>(&self, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.exec(collect_args(args), None)
    }

    /// Run a git command feeding `input` on stdin.
    pub fn run_with_input<I, S>(&self, args: I, input: &[u8]) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.exec(collect_args(args), Some(input))
    }

    fn exec(&self, args: Vec<OsString>, input: Option<&[u8]>) -> Result<String, GitError> {
        let rendered = render_command(&self.binary, &args);
        debug!(command = %rendered, cwd = %self.cwd.display(), "git");
        let io_err = |source: std::io::Error| GitError::Io {
            command: rendered.clone(),
            source,
        };

        // Captured through anonymous files so large outputs never fill a pipe
        // while we poll for exit.
        let mut stdout_file = tempfile::tempfile().map_err(io_err)?;
        let mut stderr_file = tempfile::tempfile().map_err(io_err)?;

        let mut command = Command::new(&self.binary);
        command
            .current_dir(&self.cwd)
            .args(&args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::from(stdout_file.try_clone().map_err(io_err)?))
            .stderr(Stdio::from(stderr_file.try_clone().map_err(io_err)?));

        let mut child = command.spawn().map_err(io_err)?;
        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes).map_err(io_err)?;
            }
        }

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().map_err(io_err)? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(GitError::Timeout {
                    command: rendered.clone(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = read_captured(&mut stdout_file).map_err(io_err)?;
        let stderr = read_captured(&mut stderr_file).map_err(io_err)?;
        let stdout = String::from_utf8(stdout).map_err(|source| GitError::NonUtf8Output {
            command: rendered.clone(),
            stream: "stdout",
            source,
        })?;
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        if !status.success() {
            return Err(GitError::CommandFailed {
                command: rendered,
                status: status.code(),
                stdout,
                stderr,
            });
        }
        Ok(stdout)
    }

    pub fn is_inside_repo(&self) -> bool {
        matches!(
            self.run(["rev-parse", "--is-inside-work-tree"]),
            Ok(out) if out.trim() == "true"
        )
    }

    pub fn show_toplevel(&self) -> Result<PathBuf, GitError> {
        match self.run(["rev-parse", "--show-toplevel"]) {
            Ok(out) => Ok(PathBuf::from(out.trim())),
            Err(GitError::CommandFailed { .. }) => Err(GitError::NotARepository {
                path: self.cwd.clone(),
            }),
            Err(err) => Err(err),
        }
    }

    /// Directory git runs hooks from (honours `core.hooksPath`).
    pub fn hooks_dir(&self) -> Result<PathBuf, GitError> {
        let raw = match self.run(["rev-parse", "--git-path", "hooks"]) {
            Ok(out) => out,
            Err(GitError::CommandFailed { .. }) => {
                return Err(GitError::NotARepository {
                    path: self.cwd.clone(),
                })
            }
            Err(err) => return Err(err),
        };
        let path = PathBuf::from(raw.trim());
        Ok(if path.is_absolute() {
            path
        } else {
            self.cwd.join(path)
        })
    }

    /// Resolve a revision to an object id; `None` when it does not resolve.
    pub fn ref_sha(&self, rev: &str) -> Result<Option<String>, GitError> {
        match self.run(["rev-parse", "--verify", "--quiet", rev]) {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(GitError::CommandFailed { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn ref_exists(&self, full_ref: &str) -> Result<bool, GitError> {
        Ok(self.ref_sha(full_ref)?.is_some())
    }

    /// Write `content` to the object database as a blob.
    pub fn hash_object(&self, content: &[u8]) -> Result<String, GitError> {
        let out = self.run_with_input(["hash-object", "-w", "--stdin"], content)?;
        Ok(out.trim().to_string())
    }

    pub fn mktree(&self, entries: &[TreeEntry]) -> Result<String, GitError> {
        let mut input = Vec::new();
        for entry in entries {
            input.extend_from_slice(
                format!("{} {} {}\t{}", entry.mode, entry.kind, entry.sha, entry.name).as_bytes(),
            );
            input.push(0);
        }
        let out = self.run_with_input(["mktree", "-z"], &input)?;
        Ok(out.trim().to_string())
    }

    pub fn ls_tree(&self, treeish: &str) -> Result<Vec<TreeEntry>, GitError> {
        let out = self.run(["ls-tree", "-z", treeish])?;
        out.split('\0')
            .filter(|record| !record.is_empty())
            .map(parse_tree_record)
            .collect()
    }

    pub fn tree_of(&self, commit: &str) -> Result<String, GitError> {
        let rev = format!("{commit}^{{tree}}");
        let out = self.run(["rev-parse", rev.as_str()])?;
        Ok(out.trim().to_string())
    }

    pub fn commit_tree(
        &self,
        tree: &str,
        parents: &[&str],
        message: &str,
    ) -> Result<String, GitError> {
        let mut args = vec!["commit-tree", tree];
        for parent in parents.iter().copied() {
            args.push("-p");
            args.push(parent);
        }
        args.push("-m");
        args.push(message);
        let out = self.run(args)?;
        Ok(out.trim().to_string())
    }

    /// Atomically point `full_ref` at `new`.
    ///
    /// `expected_old` of `Some("")` requires the ref not to exist yet;
    /// `Some(sha)` requires it to currently equal `sha`.
    pub fn update_ref(
        &self,
        full_ref: &str,
        new: &str,
        expected_old: Option<&str>,
    ) -> Result<(), GitError> {
        let mut args = vec!["update-ref", full_ref, new];
        if let Some(old) = expected_old {
            args.push(old);
        }
        self.run(args)?;
        Ok(())
    }

    /// Read `path` as it exists in `rev`; `None` if either does not exist.
    pub fn read_blob(&self, rev: &str, path: &str) -> Result<Option<String>, GitError> {
        let Some(sha) = self.ref_sha(&format!("{rev}:{path}"))? else {
            return Ok(None);
        };
        let out = self.run(["cat-file", "blob", sha.as_str()])?;
        Ok(Some(out))
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>, GitError> {
        match self.run(["merge-base", a, b]) {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(err) if err.exit_status() == Some(1) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        match self.run(["merge-base", "--is-ancestor", ancestor, descendant]) {
            Ok(_) => Ok(true),
            Err(err) if err.exit_status() == Some(1) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn fetch(&self, remote: &str, refspec: &str) -> Result<(), GitError> {
        self.run(["fetch", "--quiet", "--no-tags", remote, refspec])?;
        Ok(())
    }

    /// Push `refspec` without running local hooks.
    pub fn push(&self, remote: &str, refspec: &str) -> Result<(), GitError> {
        self.run(["push", "--quiet", "--no-verify", remote, refspec])?;
        Ok(())
    }

    /// Move a file with `git mv` when git tracks it.
    pub fn try_tracked_move(&self, from: &Path, to: &Path) -> Result<MoveAttempt, GitError> {
        let tracked = self.run([
            OsStr::new("ls-files"),
            OsStr::new("--error-unmatch"),
            OsStr::new("--"),
            from.as_os_str(),
        ]);
        match tracked {
            Ok(_) => {}
            Err(GitError::CommandFailed { .. }) => return Ok(MoveAttempt::NeedsFallback),
            Err(err) => return Err(err),
        }
        self.run([OsStr::new("mv"), OsStr::new("--"), from.as_os_str(), to.as_os_str()])?;
        Ok(MoveAttempt::Moved)
    }
}

fn collect_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .map(|arg| arg.as_ref().to_os_string())
        .collect()
}

fn read_captured(file: &mut File) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

fn parse_tree_record(record: &str) -> Result<TreeEntry, GitError> {
    let parse_err = || GitError::Parse {
        context: format!("unexpected ls-tree record: {record}"),
    };
    let (meta, name) = record.split_once('\t').ok_or_else(parse_err)?;
    let mut parts = meta.split_whitespace();
    let mode = parts.next().ok_or_else(parse_err)?;
    let kind = parts.next().ok_or_else(parse_err)?;
    let sha = parts.next().ok_or_else(parse_err)?;
    Ok(TreeEntry {
        mode: mode.to_string(),
        kind: kind.to_string(),
        sha: sha.to_string(),
        name: name.to_string(),
    })
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
