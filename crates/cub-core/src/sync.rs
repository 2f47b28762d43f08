//! Commits shared state to a dedicated branch that is never checked out.
//!
//! All writes go through git plumbing: the tracked content becomes a blob, the
//! blob is wrapped into trees leaf-to-root, a commit is created on top of the
//! current tip and the branch ref is moved with a compare-and-swap
//! `update-ref`. The index and the working tree are never touched, and a
//! failure before the ref move leaves only unreachable objects behind.

use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::git::{GitError, GitPlumbing, TreeEntry};
use crate::sync_state::{load_sync_state, save_sync_state, SyncState, SyncStateError};

pub const DEFAULT_SYNC_BRANCH: &str = "cub-sync";
pub const DEFAULT_REMOTE: &str = "origin";

const ROOT_COMMIT_MESSAGE: &str = "Initialize cub sync branch";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("Sync branch '{branch}' is not initialized (run `cub sync init`)")]
    NotInitialized { branch: String },
    #[error("Tracked file not found: {}", .path.display())]
    MissingTrackedFile { path: PathBuf },
    #[error("Sync state error: {0}")]
    State(#[from] SyncStateError),
    #[error("Sync IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which branch holds the shared state and where it is exchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub branch: String,
    pub remote: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            branch: DEFAULT_SYNC_BRANCH.to_string(),
            remote: DEFAULT_REMOTE.to_string(),
        }
    }
}

impl SyncSettings {
    pub fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    pub fn remote_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.remote, self.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InitOutcome {
    AlreadyInitialized { sha: String },
    FromRemote { sha: String },
    FromHead { sha: String },
    RootCommit { sha: String },
}

impl InitOutcome {
    pub fn sha(&self) -> &str {
        match self {
            InitOutcome::AlreadyInitialized { sha }
            | InitOutcome::FromRemote { sha }
            | InitOutcome::FromHead { sha }
            | InitOutcome::RootCommit { sha } => sha,
        }
    }
}

/// How the local sync branch relates to its remote-tracking counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchRelation {
    NoRemote,
    UpToDate,
    Ahead,
    Behind,
    Diverged,
}

impl BranchRelation {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchRelation::NoRemote => "no_remote",
            BranchRelation::UpToDate => "up_to_date",
            BranchRelation::Ahead => "ahead",
            BranchRelation::Behind => "behind",
            BranchRelation::Diverged => "diverged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub branch: String,
    pub tracked_file: String,
    pub initialized: bool,
    pub tip: Option<String>,
    pub remote_tip: Option<String>,
    pub relation: BranchRelation,
    pub last_commit_sha: Option<String>,
    pub last_content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FastForward {
    NoRemote,
    UpToDate,
    Advanced { from: String, to: String },
    AheadOfRemote,
    Diverged { local: String, remote: String },
}

#[derive(Debug, Clone)]
pub struct SyncService {
    git: GitPlumbing,
    settings: SyncSettings,
    tracked: String,
}

impl SyncService {
    /// `tracked` is the file's path relative to the repository root, using `/`.
    pub fn new(git: GitPlumbing, settings: SyncSettings, tracked: impl Into<String>) -> Self {
        let tracked = tracked.into();
        let tracked = tracked.trim_start_matches("./").to_string();
        Self {
            git,
            settings,
            tracked,
        }
    }

    pub fn git(&self) -> &GitPlumbing {
        &self.git
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn branch(&self) -> &str {
        &self.settings.branch
    }

    pub fn tracked(&self) -> &str {
        &self.tracked
    }

    pub fn tracked_path(&self) -> PathBuf {
        self.git.cwd().join(&self.tracked)
    }

    pub fn is_initialized(&self) -> bool {
        self.git.is_inside_repo()
            && matches!(self.git.ref_exists(&self.settings.branch_ref()), Ok(true))
    }

    pub fn initialize(&self) -> Result<InitOutcome, SyncError> {
        if !self.git.is_inside_repo() {
            return Err(GitError::NotARepository {
                path: self.git.cwd().to_path_buf(),
            }
            .into());
        }
        let branch_ref = self.settings.branch_ref();
        if let Some(sha) = self.git.ref_sha(&branch_ref)? {
            debug!(branch = %self.settings.branch, %sha, "sync branch already initialized");
            return Ok(InitOutcome::AlreadyInitialized { sha });
        }

        let outcome = if let Some(sha) = self.git.ref_sha(&self.settings.remote_ref())? {
            InitOutcome::FromRemote { sha }
        } else if let Some(sha) = self.git.ref_sha("HEAD")? {
            InitOutcome::FromHead { sha }
        } else {
            let empty_tree = self.git.mktree(&[])?;
            let sha = self.git.commit_tree(&empty_tree, &[], ROOT_COMMIT_MESSAGE)?;
            InitOutcome::RootCommit { sha }
        };

        // An empty expected value makes the ref creation fail if someone else
        // created the branch in the meantime.
        self.git.update_ref(&branch_ref, outcome.sha(), Some(""))?;
        info!(branch = %self.settings.branch, outcome = ?outcome, "initialized sync branch");

        let mut state = self.load_state()?;
        state.initialized = true;
        save_sync_state(self.git.cwd(), &mut state)?;
        Ok(outcome)
    }

    /// Commit the tracked file from the working tree.
    pub fn commit(&self, message: Option<&str>) -> Result<String, SyncError> {
        self.require_tip()?;
        let path = self.tracked_path();
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::MissingTrackedFile { path });
            }
            Err(err) => return Err(err.into()),
        };
        self.commit_content(&content, message)
    }

    /// Commit `content` as the tracked file, skipping the write when nothing changed.
    pub fn commit_content(&self, content: &[u8], message: Option<&str>) -> Result<String, SyncError> {
        let tip = self.require_tip()?;
        let content_hash = content_hash(content);
        let mut state = self.load_state()?;

        if state.last_content_hash.as_deref() == Some(content_hash.as_str())
            && state.last_commit_sha.as_deref() == Some(tip.as_str())
        {
            debug!(tracked = %self.tracked, sha = %tip, "content unchanged; reusing last commit");
            return Ok(tip);
        }

        let parent_tree = self.git.tree_of(&tip)?;
        let tree = self.tree_with(&parent_tree, &self.tracked, content)?;

        let sha = if tree == parent_tree {
            debug!(tracked = %self.tracked, sha = %tip, "tip already holds this content");
            tip
        } else {
            let default_message = format!("cub: update {}", self.tracked);
            let message = message.unwrap_or(&default_message);
            let commit = self.git.commit_tree(&tree, &[tip.as_str()], message)?;
            self.git
                .update_ref(&self.settings.branch_ref(), &commit, Some(&tip))?;
            info!(
                branch = %self.settings.branch,
                tracked = %self.tracked,
                sha = %commit,
                "committed to sync branch"
            );
            commit
        };

        state.record_commit(&sha, &content_hash);
        save_sync_state(self.git.cwd(), &mut state)?;
        Ok(sha)
    }

    /// `base_tree` with `path` replaced by `content`; other entries are kept.
    pub fn tree_with(&self, base_tree: &str, path: &str, content: &[u8]) -> Result<String, SyncError> {
        let blob = self.git.hash_object(content)?;
        let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
        Ok(self.build_tree(Some(base_tree), &segments, &blob)?)
    }

    /// Commit `tree` with both `remote` and the local tip as parents and move
    /// the branch onto it. The result fast-forwards from either side.
    pub fn commit_merge(&self, tree: &str, remote: &str, message: &str) -> Result<String, SyncError> {
        let local = self.require_tip()?;
        let commit = self
            .git
            .commit_tree(tree, &[remote, local.as_str()], message)?;
        self.git
            .update_ref(&self.settings.branch_ref(), &commit, Some(&local))?;
        info!(
            branch = %self.settings.branch,
            local = %local,
            remote = %remote,
            sha = %commit,
            "merged remote sync branch"
        );
        Ok(commit)
    }

    /// The tracked file as stored at the sync branch tip.
    pub fn read_tip(&self) -> Result<Option<String>, SyncError> {
        self.read_tip_path(&self.tracked)
    }

    pub fn read_tip_path(&self, path: &str) -> Result<Option<String>, SyncError> {
        self.require_tip()?;
        Ok(self.git.read_blob(&self.settings.branch_ref(), path)?)
    }

    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        let initialized = self.is_initialized();
        let tip = if initialized {
            self.git.ref_sha(&self.settings.branch_ref())?
        } else {
            None
        };
        let remote_tip = self.git.ref_sha(&self.settings.remote_ref())?;
        let relation = match (&tip, &remote_tip) {
            (Some(local), Some(remote)) => relation(&self.git, local, remote)?,
            _ => BranchRelation::NoRemote,
        };
        let state = self.load_state()?;
        Ok(SyncStatus {
            branch: self.settings.branch.clone(),
            tracked_file: self.tracked.clone(),
            initialized,
            tip,
            remote_tip,
            relation,
            last_commit_sha: state.last_commit_sha,
            last_content_hash: state.last_content_hash,
        })
    }

    /// Update the remote-tracking ref for the sync branch; returns its tip.
    pub fn fetch(&self) -> Result<Option<String>, SyncError> {
        let refspec = format!("+{}:{}", self.settings.branch_ref(), self.settings.remote_ref());
        self.git.fetch(&self.settings.remote, &refspec)?;
        Ok(self.git.ref_sha(&self.settings.remote_ref())?)
    }

    /// Push the sync branch; a non-fast-forward rejection surfaces as a git error.
    pub fn publish(&self) -> Result<String, SyncError> {
        let tip = self.require_tip()?;
        let branch_ref = self.settings.branch_ref();
        self.git
            .push(&self.settings.remote, &format!("{branch_ref}:{branch_ref}"))?;
        self.git
            .update_ref(&self.settings.remote_ref(), &tip, None)?;
        info!(branch = %self.settings.branch, remote = %self.settings.remote, sha = %tip, "published sync branch");
        Ok(tip)
    }

    /// Move the local branch to the remote-tracking tip when that is a fast-forward.
    pub fn fast_forward(&self) -> Result<FastForward, SyncError> {
        let local = self.require_tip()?;
        let Some(remote) = self.git.ref_sha(&self.settings.remote_ref())? else {
            return Ok(FastForward::NoRemote);
        };
        match relation(&self.git, &local, &remote)? {
            BranchRelation::UpToDate => Ok(FastForward::UpToDate),
            BranchRelation::Ahead => Ok(FastForward::AheadOfRemote),
            BranchRelation::Diverged => Ok(FastForward::Diverged { local, remote }),
            BranchRelation::Behind => {
                self.git
                    .update_ref(&self.settings.branch_ref(), &remote, Some(&local))?;
                info!(branch = %self.settings.branch, from = %local, to = %remote, "fast-forwarded sync branch");
                Ok(FastForward::Advanced {
                    from: local,
                    to: remote,
                })
            }
            BranchRelation::NoRemote => Ok(FastForward::NoRemote),
        }
    }

    fn require_tip(&self) -> Result<String, SyncError> {
        let not_initialized = || SyncError::NotInitialized {
            branch: self.settings.branch.clone(),
        };
        if !self.git.is_inside_repo() {
            return Err(not_initialized());
        }
        self.git
            .ref_sha(&self.settings.branch_ref())?
            .ok_or_else(not_initialized)
    }

    fn load_state(&self) -> Result<SyncState, SyncError> {
        Ok(load_sync_state(
            self.git.cwd(),
            &self.settings.branch,
            &self.tracked,
        )?)
    }

    /// Wrap `blob` into trees from the leaf up. `mktree` cannot take paths with
    /// separators, so each level is a tree holding the next one; entries the
    /// base tree already has at that level are carried over unchanged.
    fn build_tree(
        &self,
        base_tree: Option<&str>,
        segments: &[&str],
        blob: &str,
    ) -> Result<String, GitError> {
        let Some((name, rest)) = segments.split_first() else {
            return Err(GitError::Parse {
                context: "empty path in tree update".to_string(),
            });
        };
        let mut entries = match base_tree {
            Some(tree) => self.git.ls_tree(tree)?,
            None => Vec::new(),
        };
        let entry = if rest.is_empty() {
            TreeEntry::blob(*name, blob)
        } else {
            let child_base = entries
                .iter()
                .find(|entry| entry.name == *name && entry.is_tree())
                .map(|entry| entry.sha.clone());
            let child = self.build_tree(child_base.as_deref(), rest, blob)?;
            TreeEntry::tree(*name, child)
        };
        entries.retain(|existing| existing.name != *name);
        entries.push(entry);
        self.git.mktree(&entries)
    }
}

pub(crate) fn relation(
    git: &GitPlumbing,
    local: &str,
    remote: &str,
) -> Result<BranchRelation, GitError> {
    if local == remote {
        return Ok(BranchRelation::UpToDate);
    }
    if git.is_ancestor(remote, local)? {
        return Ok(BranchRelation::Ahead);
    }
    if git.is_ancestor(local, remote)? {
        return Ok(BranchRelation::Behind);
    }
    Ok(BranchRelation::Diverged)
}

pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
