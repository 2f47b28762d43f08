use std::process::ExitCode;

use anyhow::{Context, Result};

use cub_core::collision::{skip_requested, verify_counters_before_push, SKIP_ENV};
use cub_core::context::CubContext;
use cub_core::hooks::{install_pre_push_hook, HookInstall};

use crate::{HookCommand, Output};

pub(crate) fn run(ctx: &CubContext, command: HookCommand, out: &Output) -> Result<ExitCode> {
    match command {
        HookCommand::Install { force } => {
            let outcome =
                install_pre_push_hook(&ctx.git, force).context("Failed to install pre-push hook")?;
            out.emit(&outcome, || match &outcome {
                HookInstall::Installed { path } => format!("Installed {}", path.display()),
                HookInstall::Updated { path } => format!("Updated {}", path.display()),
                HookInstall::Replaced { path, backup } => format!(
                    "Installed {} (previous hook saved to {})",
                    path.display(),
                    backup.display()
                ),
            })?;
            Ok(ExitCode::SUCCESS)
        }
        HookCommand::PrePush { args: _ } => {
            if skip_requested() {
                tracing::info!("{SKIP_ENV} set; skipping counter check");
                return Ok(ExitCode::SUCCESS);
            }
            let check = verify_counters_before_push(&ctx.root);
            if check.allow {
                return Ok(ExitCode::SUCCESS);
            }
            eprintln!("{}", check.message);
            Ok(ExitCode::FAILURE)
        }
    }
}
