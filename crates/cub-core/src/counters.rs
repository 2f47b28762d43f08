//! Project-wide counters stored on the sync branch.
//!
//! Each value is the next number to hand out. Allocation reads the file at the
//! branch tip, bumps one field and commits the result through the sync cycle.
//! Nothing serializes two clones allocating at once; the pre-push collision
//! check is what catches that. Every allocation commit names the clone that
//! made it, so two clones handing out the same number always diverge.
//!
//! A diverged branch is reconciled by merging the remote tip: the counters take
//! the larger value per field and the numbers both sides handed out are kept
//! locally as contested until no task uses them any more.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::git::{GitError, GitPlumbing};
use crate::project::{write_atomic, COUNTERS_PATH};
use crate::sync::{FastForward, SyncError, SyncService, SyncSettings};
use crate::sync_state::{allocator_id, ensure_sync_state_dir, sync_state_dir, SyncStateError};
use crate::tasks::UsedNumbers;

const CONTESTED_FILE: &str = "contested-counters.json";

#[derive(Debug, Error)]
pub enum CounterError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("Failed to parse counters at {rev}: {source}")]
    Parse {
        rev: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize counters: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("The {0} counter cannot be incremented further")]
    Overflow(CounterKind),
    #[error(transparent)]
    State(#[from] SyncStateError),
}

impl From<GitError> for CounterError {
    fn from(err: GitError) -> Self {
        CounterError::Sync(err.into())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    #[serde(default)]
    pub spec_number: u32,
    #[serde(default)]
    pub standalone_task_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    Spec,
    Standalone,
}

/// One number out of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CounterNumber {
    pub kind: CounterKind,
    pub number: u32,
}

impl CounterNumber {
    pub fn new(kind: CounterKind, number: u32) -> Self {
        Self { kind, number }
    }
}

impl std::fmt::Display for CounterNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} number {}", self.kind, self.number)
    }
}

impl std::fmt::Display for CounterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterKind::Spec => f.write_str("spec"),
            CounterKind::Standalone => f.write_str("standalone task"),
        }
    }
}

impl Counters {
    pub fn get(&self, kind: CounterKind) -> u32 {
        match kind {
            CounterKind::Spec => self.spec_number,
            CounterKind::Standalone => self.standalone_task_number,
        }
    }

    fn slot(&mut self, kind: CounterKind) -> &mut u32 {
        match kind {
            CounterKind::Spec => &mut self.spec_number,
            CounterKind::Standalone => &mut self.standalone_task_number,
        }
    }

    /// The larger value of each field.
    pub fn max(&self, other: &Counters) -> Counters {
        Counters {
            spec_number: self.spec_number.max(other.spec_number),
            standalone_task_number: self.standalone_task_number.max(other.standalone_task_number),
        }
    }
}

/// Numbers handed out on both sides since `base`: `[base, min(local, remote))`.
pub fn contested_numbers(
    base: &Counters,
    local: &Counters,
    remote: &Counters,
) -> BTreeSet<CounterNumber> {
    let mut contested = BTreeSet::new();
    for kind in [CounterKind::Spec, CounterKind::Standalone] {
        let shared_end = local.get(kind).min(remote.get(kind));
        for number in base.get(kind)..shared_end {
            contested.insert(CounterNumber::new(kind, number));
        }
    }
    contested
}

/// Counters stored at `rev`, or `None` when the file is absent there.
pub fn read_counters_at(git: &GitPlumbing, rev: &str) -> Result<Option<Counters>, CounterError> {
    let Some(raw) = git.read_blob(rev, COUNTERS_PATH)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| CounterError::Parse {
            rev: rev.to_string(),
            source,
        })
}

/// A sync service whose tracked file is the counters file.
pub fn counter_service(git: GitPlumbing, settings: SyncSettings) -> SyncService {
    SyncService::new(git, settings, COUNTERS_PATH)
}

pub fn allocate_spec_number(sync: &SyncService) -> Result<u32, CounterError> {
    allocate(sync, CounterKind::Spec)
}

pub fn allocate_standalone_number(sync: &SyncService) -> Result<u32, CounterError> {
    allocate(sync, CounterKind::Standalone)
}

fn allocate(sync: &SyncService, kind: CounterKind) -> Result<u32, CounterError> {
    let branch_ref = sync.settings().branch_ref();
    let current = match sync.read_tip_path(COUNTERS_PATH)? {
        Some(raw) => serde_json::from_str::<Counters>(&raw).map_err(|source| CounterError::Parse {
            rev: branch_ref.clone(),
            source,
        })?,
        None => Counters::default(),
    };

    let taken = current.get(kind);
    let mut next = current;
    *next.slot(kind) = taken.checked_add(1).ok_or(CounterError::Overflow(kind))?;

    let body = render_counters(&next)?;
    let allocator = allocator_id(sync.git().cwd())?;
    let message = format!("cub: allocate {kind} number {taken}\n\nCub-Allocator: {allocator}");
    let sha = sync.commit_content(body.as_bytes(), Some(&message))?;
    info!(kind = %kind, number = taken, sha = %sha, "allocated counter");
    Ok(taken)
}

fn render_counters(counters: &Counters) -> Result<String, CounterError> {
    let mut body = serde_json::to_string_pretty(counters).map_err(CounterError::Serialize)?;
    body.push('\n');
    Ok(body)
}

fn contested_path(root: &Path) -> PathBuf {
    sync_state_dir(root).join(CONTESTED_FILE)
}

/// Numbers recorded as contested by earlier reconciliations of this clone.
pub fn load_contested(root: &Path) -> Result<BTreeSet<CounterNumber>, CounterError> {
    let path = contested_path(root);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(SyncStateError::from(err).into()),
    };
    serde_json::from_str(&raw).map_err(|err| SyncStateError::from(err).into())
}

fn save_contested(root: &Path, contested: &BTreeSet<CounterNumber>) -> Result<(), CounterError> {
    let path = contested_path(root);
    if contested.is_empty() {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(SyncStateError::from(err).into()),
        }
        return Ok(());
    }
    ensure_sync_state_dir(root)?;
    let body = serde_json::to_string_pretty(contested).map_err(SyncStateError::from)?;
    write_atomic(&path, body.as_bytes()).map_err(SyncStateError::from)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reconcile {
    NoRemote,
    UpToDate,
    FastForwarded {
        from: String,
        to: String,
    },
    AheadOfRemote,
    Merged {
        sha: String,
        counters: Counters,
        contested: Vec<CounterNumber>,
    },
}

/// Bring the local sync branch up to the remote-tracking tip.
///
/// Fast-forwards when possible. A diverged branch gets a merge commit whose
/// tree is the remote's with the counters raised to the per-field maximum, so
/// the next publish is a fast-forward again. Numbers both sides allocated are
/// added to the contested set; entries `used` no longer references are dropped.
pub fn reconcile_with_remote(
    sync: &SyncService,
    used: &UsedNumbers,
) -> Result<Reconcile, CounterError> {
    let root = sync.git().cwd().to_path_buf();
    let mut contested = load_contested(&root)?;
    contested.retain(|number| used.contains(*number));

    let outcome = match sync.fast_forward()? {
        FastForward::NoRemote => Reconcile::NoRemote,
        FastForward::UpToDate => Reconcile::UpToDate,
        FastForward::AheadOfRemote => Reconcile::AheadOfRemote,
        FastForward::Advanced { from, to } => Reconcile::FastForwarded { from, to },
        FastForward::Diverged { local, remote } => {
            let git = sync.git();
            let base = match git.merge_base(&local, &remote)? {
                Some(base) => read_counters_at(git, &base)?.unwrap_or_default(),
                None => Counters::default(),
            };
            let local_counters = read_counters_at(git, &local)?.unwrap_or_default();
            let remote_counters = read_counters_at(git, &remote)?.unwrap_or_default();
            let merged = local_counters.max(&remote_counters);
            let fresh = contested_numbers(&base, &local_counters, &remote_counters);

            let tree = sync.tree_with(
                &git.tree_of(&remote)?,
                COUNTERS_PATH,
                render_counters(&merged)?.as_bytes(),
            )?;
            let settings = sync.settings();
            let message = format!(
                "cub: reconcile counters with {}/{}",
                settings.remote, settings.branch
            );
            let sha = sync.commit_merge(&tree, &remote, &message)?;
            if !fresh.is_empty() {
                warn!(numbers = ?fresh, "numbers allocated by this clone and the remote");
            }
            contested.extend(fresh.iter().copied());
            Reconcile::Merged {
                sha,
                counters: merged,
                contested: fresh.into_iter().collect(),
            }
        }
    };
    save_contested(&root, &contested)?;
    Ok(outcome)
}
