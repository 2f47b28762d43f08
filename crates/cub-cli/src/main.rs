use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;

use cub_core::context::CubContext;
use cub_core::ids::{EpicId, PlanId, SpecId};

mod hook_cmd;
mod id_cmd;
mod logging;
mod sync_cmd;
mod version;

#[derive(Parser)]
#[command(name = "cub", version = version::FULL, about = "Git-backed coordination for cub projects")]
struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Shared state on the sync branch
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    /// Allocate, generate and inspect ids
    Id {
        #[command(subcommand)]
        command: IdCommand,
    },
    /// Git hook integration
    Hook {
        #[command(subcommand)]
        command: HookCommand,
    },
    /// Print version information
    Version,
}

#[derive(Subcommand)]
pub(crate) enum SyncCommand {
    /// Create the sync branch if it does not exist
    Init,
    /// Show the sync branch state for a tracked file
    Status {
        /// Tracked file, relative to the project root
        #[arg(long)]
        file: Option<String>,
    },
    /// Commit a tracked file to the sync branch
    Commit {
        #[arg(long)]
        file: Option<String>,
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Fetch the remote sync branch and fast-forward to it when possible
    Fetch,
    /// Push the sync branch to the remote
    Publish,
    /// Fetch and merge a diverged remote sync branch, keeping the larger counters
    Reconcile,
    /// Merge managed sections from the sync branch into the local document
    Pull,
    /// Commit the local document's managed sections to the sync branch
    Push {
        #[arg(short, long)]
        message: Option<String>,
    },
    /// Rename CLAUDE.md or .cub/agent.md to AGENTS.md
    AdoptDoc,
}

#[derive(Subcommand)]
pub(crate) enum IdCommand {
    /// Allocate the next spec id
    NextSpec,
    /// Allocate the next standalone task id
    NextStandalone,
    /// Next free plan id under a spec
    NextPlan { spec: SpecId },
    /// Next free epic id under a plan
    NextEpic { plan: PlanId },
    /// Next task id under an epic
    NextTask { epic: EpicId },
    /// Classify and normalize an id
    Parse { id: String },
}

#[derive(Subcommand)]
pub(crate) enum HookCommand {
    /// Install the pre-push collision check
    Install {
        /// Replace a pre-push hook not written by cub (a backup is kept)
        #[arg(long)]
        force: bool,
    },
    /// Run the collision check (invoked by git)
    PrePush {
        /// Arguments git passes to the hook
        #[arg(hide = true, num_args = 0..)]
        args: Vec<String>,
    },
}

pub(crate) struct Output {
    json: bool,
}

impl Output {
    pub(crate) fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

fn start_dir(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => std::env::current_dir().context("Failed to read current directory"),
    }
}

pub(crate) fn load_context(root: Option<PathBuf>) -> Result<CubContext> {
    let start = start_dir(root)?;
    CubContext::discover(&start)
        .with_context(|| format!("Failed to resolve project at {}", start.display()))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let out = Output { json: cli.json };

    match cli.command {
        Some(Command::Sync { command }) => {
            let ctx = load_context(cli.root)?;
            sync_cmd::run(&ctx, command, &out)
        }
        Some(Command::Id { command }) => id_cmd::run(cli.root, command, &out),
        Some(Command::Hook { command }) => {
            let ctx = load_context(cli.root)?;
            hook_cmd::run(&ctx, command, &out)
        }
        Some(Command::Version) => {
            out.emit(
                &serde_json::json!({
                    "name": "cub",
                    "version": cub_core::version(),
                    "build": version::FULL,
                }),
                || format!("cub {}", version::FULL),
            )?;
            Ok(ExitCode::SUCCESS)
        }
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(ExitCode::SUCCESS)
        }
    }
}
