use std::process::ExitCode;

use anyhow::{Context, Result};
use serde_json::json;

use cub_core::context::CubContext;
use cub_core::counters::{reconcile_with_remote, Reconcile};
use cub_core::managed::{AdoptOutcome, PullOutcome};
use cub_core::project::tasks_path;
use cub_core::sync::{FastForward, InitOutcome, SyncService};
use cub_core::tasks::scan_used_numbers;

use crate::{Output, SyncCommand};

fn tracked(ctx: &CubContext, file: Option<String>) -> SyncService {
    match file {
        Some(file) => SyncService::new(ctx.git.clone(), ctx.settings.clone(), file),
        None => ctx.task_sync(),
    }
}

fn short(sha: &str) -> &str {
    sha.get(..10).unwrap_or(sha)
}

pub(crate) fn run(ctx: &CubContext, command: SyncCommand, out: &Output) -> Result<ExitCode> {
    match command {
        SyncCommand::Init => {
            let outcome = ctx
                .task_sync()
                .initialize()
                .context("Failed to initialize sync branch")?;
            let branch = &ctx.settings.branch;
            out.emit(&outcome, || match &outcome {
                InitOutcome::AlreadyInitialized { sha } => {
                    format!("Sync branch {branch} already exists at {}", short(sha))
                }
                InitOutcome::FromRemote { sha } => format!(
                    "Created {branch} from {}/{branch} at {}",
                    ctx.settings.remote,
                    short(sha)
                ),
                InitOutcome::FromHead { sha } => {
                    format!("Created {branch} from HEAD at {}", short(sha))
                }
                InitOutcome::RootCommit { sha } => {
                    format!("Created {branch} with an empty root commit {}", short(sha))
                }
            })?;
        }
        SyncCommand::Status { file } => {
            let status = tracked(ctx, file).status()?;
            out.emit(&status, || {
                let mut lines = vec![
                    format!("branch:      {}", status.branch),
                    format!("tracked:     {}", status.tracked_file),
                    format!("initialized: {}", status.initialized),
                ];
                if let Some(tip) = &status.tip {
                    lines.push(format!("tip:         {tip}"));
                }
                if let Some(remote) = &status.remote_tip {
                    lines.push(format!("remote tip:  {remote}"));
                }
                lines.push(format!("relation:    {}", status.relation.as_str()));
                if let Some(last) = &status.last_commit_sha {
                    lines.push(format!("last commit: {last}"));
                }
                lines.join("\n")
            })?;
        }
        SyncCommand::Commit { file, message } => {
            let sync = tracked(ctx, file);
            let sha = sync
                .commit(message.as_deref())
                .with_context(|| format!("Failed to commit {}", sync.tracked()))?;
            out.emit(&json!({ "tracked": sync.tracked(), "commit": sha }), || {
                format!("Committed {} to {} at {}", sync.tracked(), sync.branch(), short(&sha))
            })?;
        }
        SyncCommand::Fetch => {
            let sync = ctx.task_sync();
            let remote_tip = sync.fetch().context("Failed to fetch sync branch")?;
            let ff = match remote_tip {
                Some(_) => sync.fast_forward()?,
                None => FastForward::NoRemote,
            };
            out.emit(&json!({ "remote_tip": remote_tip, "fast_forward": ff }), || match &ff {
                FastForward::NoRemote => "Remote has no sync branch".to_string(),
                FastForward::UpToDate => "Sync branch is up to date".to_string(),
                FastForward::Advanced { from, to } => {
                    format!("Fast-forwarded {} {}..{}", sync.branch(), short(from), short(to))
                }
                FastForward::AheadOfRemote => {
                    "Local sync branch is ahead of the remote (run `cub sync publish`)".to_string()
                }
                FastForward::Diverged { local, remote } => format!(
                    "Sync branch diverged from the remote (local {}, remote {}); run `cub sync reconcile`",
                    short(local),
                    short(remote)
                ),
            })?;
        }
        SyncCommand::Reconcile => {
            let sync = ctx.counter_sync();
            sync.fetch().context("Failed to fetch sync branch")?;
            let used = scan_used_numbers(&tasks_path(&ctx.root))?;
            let outcome =
                reconcile_with_remote(&sync, &used).context("Failed to reconcile sync branch")?;
            out.emit(&outcome, || match &outcome {
                Reconcile::NoRemote => "Remote has no sync branch".to_string(),
                Reconcile::UpToDate => "Sync branch is up to date".to_string(),
                Reconcile::FastForwarded { from, to } => {
                    format!("Fast-forwarded {} {}..{}", sync.branch(), short(from), short(to))
                }
                Reconcile::AheadOfRemote => {
                    "Local sync branch is ahead of the remote (run `cub sync publish`)".to_string()
                }
                Reconcile::Merged {
                    sha,
                    counters,
                    contested,
                } => {
                    let mut text = format!(
                        "Merged {}/{} into {} at {} (spec_number={} standalone_task_number={})",
                        ctx.settings.remote,
                        ctx.settings.branch,
                        ctx.settings.branch,
                        short(sha),
                        counters.spec_number,
                        counters.standalone_task_number
                    );
                    if !contested.is_empty() {
                        let numbers: Vec<String> =
                            contested.iter().map(ToString::to_string).collect();
                        text.push_str(&format!(
                            "\nAllocated by both clones; give tasks using these a fresh id: {}",
                            numbers.join(", ")
                        ));
                    }
                    text
                }
            })?;
        }
        SyncCommand::Publish => {
            let sha = ctx.task_sync().publish().context("Failed to publish sync branch")?;
            out.emit(
                &json!({ "remote": ctx.settings.remote, "branch": ctx.settings.branch, "commit": sha }),
                || {
                    format!(
                        "Published {} to {} at {}",
                        ctx.settings.branch,
                        ctx.settings.remote,
                        short(&sha)
                    )
                },
            )?;
        }
        SyncCommand::Pull => {
            let outcome = ctx.managed().pull()?;
            out.emit(&outcome, || match &outcome {
                PullOutcome::Updated { count } => format!("Updated {count} managed section(s)"),
                PullOutcome::Conflicted { tags } => format!(
                    "Conflicting managed sections, nothing changed: {}",
                    tags.join(", ")
                ),
            })?;
            if matches!(outcome, PullOutcome::Conflicted { .. }) {
                return Ok(ExitCode::from(2));
            }
        }
        SyncCommand::Push { message } => {
            let report = ctx.managed().push(message.as_deref())?;
            out.emit(&report, || match &report.commit {
                None => "No managed sections; nothing to push".to_string(),
                Some(sha) => format!(
                    "Pushed {} managed section(s) from {} at {}",
                    report.written,
                    report.document,
                    short(sha)
                ),
            })?;
        }
        SyncCommand::AdoptDoc => {
            let outcome = ctx.managed().adopt_document()?;
            out.emit(&outcome, || match &outcome {
                AdoptOutcome::AlreadyPrimary => "AGENTS.md already in place".to_string(),
                AdoptOutcome::NoDocument => "No agent document found".to_string(),
                AdoptOutcome::Moved { from, to, tracked } => {
                    let how = if *tracked { "git mv" } else { "rename" };
                    format!("Moved {from} to {to} ({how})")
                }
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_truncates_long_shas_only() {
        assert_eq!(short("0123456789abcdef"), "0123456789");
        assert_eq!(short("abc"), "abc");
    }
}
