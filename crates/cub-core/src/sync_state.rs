//! Local bookkeeping for the sync branch.
//!
//! One small JSON file per tracked path records the last commit written to
//! the sync branch and the hash of the content it carried. The files live
//! under `.cub/.sync-state/`, which ignores itself so they are never committed.
//! The same directory holds the clone's allocator id.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::project::{cub_dir, write_atomic};

const ALLOCATOR_ID_FILE: &str = "allocator-id";

#[derive(Debug, Error)]
pub enum SyncStateError {
    #[error("Failed to access sync state: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize sync state: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    pub branch_name: String,
    pub tracked_file_path: String,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub last_commit_sha: Option<String>,
    #[serde(default)]
    pub last_content_hash: Option<String>,
    /// RFC3339 timestamp of the last write.
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl SyncState {
    pub fn new(branch_name: impl Into<String>, tracked_file_path: impl Into<String>) -> Self {
        Self {
            branch_name: branch_name.into(),
            tracked_file_path: tracked_file_path.into(),
            initialized: false,
            last_commit_sha: None,
            last_content_hash: None,
            updated_at: None,
        }
    }

    pub fn record_commit(&mut self, commit_sha: &str, content_hash: &str) {
        self.initialized = true;
        self.last_commit_sha = Some(commit_sha.to_string());
        self.last_content_hash = Some(content_hash.to_string());
    }
}

pub fn sync_state_dir(root: &Path) -> PathBuf {
    cub_dir(root).join(".sync-state")
}

/// Create the state directory and its self-ignoring `.gitignore`.
pub fn ensure_sync_state_dir(root: &Path) -> Result<PathBuf, SyncStateError> {
    let dir = sync_state_dir(root);
    fs::create_dir_all(&dir)?;
    let ignore = dir.join(".gitignore");
    if !ignore.exists() {
        fs::write(&ignore, "*\n")?;
    }
    Ok(dir)
}

/// Identifier of this clone, written into allocation commits so that two
/// clones never produce the same commit for the same allocation.
pub fn allocator_id(root: &Path) -> Result<String, SyncStateError> {
    let path = sync_state_dir(root).join(ALLOCATOR_ID_FILE);
    match fs::read_to_string(&path) {
        Ok(raw) if !raw.trim().is_empty() => return Ok(raw.trim().to_string()),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    let id = ulid::Ulid::new().to_string();
    ensure_sync_state_dir(root)?;
    write_atomic(&path, format!("{id}\n").as_bytes())?;
    Ok(id)
}

pub fn sync_state_path(root: &Path, tracked_file_path: &str) -> PathBuf {
    let slug: String = tracked_file_path
        .trim_start_matches("./")
        .chars()
        .map(|ch| match ch {
            '/' | '\\' => '~',
            other => other,
        })
        .collect();
    sync_state_dir(root).join(format!("{slug}.json"))
}

/// Stored state for `tracked_file_path`, or a fresh record when none exists
/// (or when the stored record belongs to a different branch).
pub fn load_sync_state(
    root: &Path,
    branch_name: &str,
    tracked_file_path: &str,
) -> Result<SyncState, SyncStateError> {
    let path = sync_state_path(root, tracked_file_path);
    if !path.exists() {
        return Ok(SyncState::new(branch_name, tracked_file_path));
    }
    let raw = fs::read_to_string(&path)?;
    let state: SyncState = serde_json::from_str(&raw)?;
    if state.branch_name != branch_name {
        return Ok(SyncState::new(branch_name, tracked_file_path));
    }
    Ok(state)
}

pub fn save_sync_state(root: &Path, state: &mut SyncState) -> Result<PathBuf, SyncStateError> {
    ensure_sync_state_dir(root)?;
    state.updated_at = Some(chrono::Local::now().to_rfc3339());
    let path = sync_state_path(root, &state.tracked_file_path);
    write_atomic(&path, serde_json::to_string_pretty(state)?.as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_state_starts_fresh() {
        let temp = TempDir::new().expect("tempdir");
        let state = load_sync_state(temp.path(), "cub-sync", ".cub/tasks.jsonl").expect("load");
        assert!(!state.initialized);
        assert_eq!(state.last_commit_sha, None);
        assert_eq!(state.tracked_file_path, ".cub/tasks.jsonl");
    }

    #[test]
    fn save_and_reload_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        let mut state = SyncState::new("cub-sync", ".cub/tasks.jsonl");
        state.record_commit("abc123", "deadbeef");
        let path = save_sync_state(temp.path(), &mut state).expect("save");
        assert!(path.ends_with(".cub~tasks.jsonl.json"));
        assert!(sync_state_dir(temp.path()).join(".gitignore").is_file());

        let loaded = load_sync_state(temp.path(), "cub-sync", ".cub/tasks.jsonl").expect("load");
        assert_eq!(loaded, state);
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn allocator_id_is_stable_per_clone() {
        let first = TempDir::new().expect("tempdir");
        let second = TempDir::new().expect("tempdir");
        let id = allocator_id(first.path()).expect("id");
        assert_eq!(allocator_id(first.path()).expect("again"), id);
        assert_ne!(allocator_id(second.path()).expect("other clone"), id);
        assert!(sync_state_dir(first.path()).join(".gitignore").is_file());
    }

    #[test]
    fn state_for_other_branch_is_ignored() {
        let temp = TempDir::new().expect("tempdir");
        let mut state = SyncState::new("old-branch", "AGENTS.md");
        state.record_commit("abc123", "deadbeef");
        save_sync_state(temp.path(), &mut state).expect("save");

        let loaded = load_sync_state(temp.path(), "cub-sync", "AGENTS.md").expect("load");
        assert_eq!(loaded.branch_name, "cub-sync");
        assert_eq!(loaded.last_commit_sha, None);
    }
}
