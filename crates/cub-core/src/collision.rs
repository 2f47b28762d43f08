//! Pre-push check for id numbers that another clone may have allocated too.
//!
//! The check only reads local state and the remote-tracking ref it refreshes.
//! Any failure along the way allows the push; the guard must never break a
//! push on its own account.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ResolvedConfig;
use crate::counters::{
    contested_numbers, load_contested, read_counters_at, CounterError, CounterKind, CounterNumber,
    Counters,
};
use crate::git::GitPlumbing;
use crate::project::{tasks_path, COUNTERS_PATH};
use crate::sync::{relation, BranchRelation, SyncError, SyncService, SyncSettings};
use crate::tasks::{scan_used_numbers, TaskError, UsedNumbers};

pub const SKIP_ENV: &str = "CUB_SKIP_COUNTER_CHECK";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushCheck {
    pub allow: bool,
    pub message: String,
}

impl PushCheck {
    pub fn allowed() -> Self {
        Self {
            allow: true,
            message: String::new(),
        }
    }

    fn blocked(message: String) -> Self {
        Self {
            allow: false,
            message,
        }
    }
}

/// Whether the check was switched off through the environment.
pub fn skip_requested() -> bool {
    std::env::var(SKIP_ENV)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Run the check for the project at `project_dir` using its configured sync settings.
pub fn verify_counters_before_push(project_dir: &Path) -> PushCheck {
    let config = match ResolvedConfig::load(project_dir) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "could not load config; using default sync settings");
            ResolvedConfig::default()
        }
    };
    let git = GitPlumbing::new(project_dir).with_timeout(config.git_timeout());
    check_counters(&git, &config.sync_settings(), &tasks_path(project_dir))
}

pub fn check_counters(git: &GitPlumbing, settings: &SyncSettings, tasks_file: &Path) -> PushCheck {
    match evaluate(git, settings, tasks_file) {
        Ok(Some(message)) => PushCheck::blocked(message),
        Ok(None) => PushCheck::allowed(),
        Err(err) => {
            warn!(error = %err, "counter check skipped");
            PushCheck::allowed()
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CheckError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Counters(#[from] CounterError),
    #[error(transparent)]
    Tasks(#[from] TaskError),
    #[error(transparent)]
    Git(#[from] crate::git::GitError),
}

fn evaluate(
    git: &GitPlumbing,
    settings: &SyncSettings,
    tasks_file: &Path,
) -> Result<Option<String>, CheckError> {
    let sync = SyncService::new(git.clone(), settings.clone(), COUNTERS_PATH);
    if !sync.is_initialized() {
        debug!(branch = %settings.branch, "sync branch not initialized; nothing to check");
        return Ok(None);
    }
    let local_ref = settings.branch_ref();
    let Some(local_tip) = git.ref_sha(&local_ref)? else {
        return Ok(None);
    };

    let remote_tip = match sync.fetch() {
        Ok(Some(tip)) => tip,
        Ok(None) => return Ok(None),
        Err(err) => {
            warn!(remote = %settings.remote, error = %err, "fetch failed; allowing push");
            return Ok(None);
        }
    };
    let Some(remote) = read_counters_at(git, &remote_tip)? else {
        debug!("remote has no counters file");
        return Ok(None);
    };
    let local = read_counters_at(git, &local_tip)?.unwrap_or_default();
    let used = scan_used_numbers(tasks_file)?;

    // Numbers handed out on both sides, either on the current divergence or
    // recorded by an earlier reconcile.
    let mut contested = load_contested(git.cwd())?;
    if relation(git, &local_tip, &remote_tip)? == BranchRelation::Diverged {
        let base = match git.merge_base(&local_tip, &remote_tip)? {
            Some(base) => read_counters_at(git, &base)?.unwrap_or_default(),
            None => Counters::default(),
        };
        contested.extend(contested_numbers(&base, &local, &remote));
    }
    contested.retain(|number| used.contains(*number));

    let mut unpublished = used_beyond_remote(&used, &remote);
    unpublished.retain(|number| !contested.contains(number));

    if contested.is_empty() && unpublished.is_empty() {
        return Ok(None);
    }
    Ok(Some(render_message(
        settings,
        &contested,
        &unpublished,
        &local,
        &remote,
    )))
}

/// Numbers in local use that the remote has not handed out yet.
fn used_beyond_remote(used: &UsedNumbers, remote: &Counters) -> BTreeSet<CounterNumber> {
    let spec = used
        .spec
        .range(remote.spec_number..)
        .map(|number| CounterNumber::new(CounterKind::Spec, *number));
    let standalone = used
        .standalone
        .range(remote.standalone_task_number..)
        .map(|number| CounterNumber::new(CounterKind::Standalone, *number));
    spec.chain(standalone).collect()
}

fn render_message(
    settings: &SyncSettings,
    contested: &BTreeSet<CounterNumber>,
    unpublished: &BTreeSet<CounterNumber>,
    local: &Counters,
    remote: &Counters,
) -> String {
    let mut message = String::from("cub: id counter collision detected; push blocked.\n\n");
    for number in contested {
        let _ = writeln!(message, "  - {number} was also allocated by another clone");
    }
    for number in unpublished {
        let _ = writeln!(
            message,
            "  - {number} is at or beyond the remote's next {} number ({})",
            number.kind,
            remote.get(number.kind)
        );
    }
    let _ = writeln!(
        message,
        "\nLocal counters:  spec_number={} standalone_task_number={}",
        local.spec_number, local.standalone_task_number
    );
    let _ = writeln!(
        message,
        "Remote counters: spec_number={} standalone_task_number={} ({}/{})",
        remote.spec_number, remote.standalone_task_number, settings.remote, settings.branch
    );
    let _ = write!(
        message,
        "\nTo resolve:\n\
         \x20 1. cub sync reconcile   (merge the remote counters into the local sync branch)\n\
         \x20 2. give every task that uses a number allocated by another clone a fresh id\n\
         \x20    from `cub id next-spec` / `cub id next-standalone`\n\
         \x20 3. cub sync publish, then retry the push\n\
         \nNumbers this clone allocated but never published only need step 3.\n\
         \nTo bypass this check: {SKIP_ENV}=1 git push, or git push --no-verify\n"
    );
    message
}
