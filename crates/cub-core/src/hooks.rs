use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::git::{GitError, GitPlumbing};

/// Line that marks a hook script as ours.
pub const HOOK_MARKER: &str = "# installed by cub: id counter collision check";

const PRE_PUSH_SCRIPT: &str = "#!/bin/sh\n\
# installed by cub: id counter collision check\n\
exec cub hook pre-push \"$@\"\n";

#[derive(Debug, Error)]
pub enum HookError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("Hook IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{} exists and was not installed by cub (use --force to replace it)", .0.display())]
    Foreign(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HookInstall {
    Installed { path: PathBuf },
    Updated { path: PathBuf },
    Replaced { path: PathBuf, backup: PathBuf },
}

/// Write the pre-push hook. A hook we did not write is kept unless `force`,
/// in which case it is backed up next to the new one.
pub fn install_pre_push_hook(git: &GitPlumbing, force: bool) -> Result<HookInstall, HookError> {
    let dir = git.hooks_dir()?;
    fs::create_dir_all(&dir)?;
    let path = dir.join("pre-push");

    let outcome = match fs::read_to_string(&path) {
        Ok(existing) if existing.contains(HOOK_MARKER) => HookInstall::Updated { path: path.clone() },
        Ok(_) if !force => return Err(HookError::Foreign(path)),
        Ok(_) => {
            let backup = dir.join("pre-push.pre-cub");
            fs::copy(&path, &backup)?;
            HookInstall::Replaced {
                path: path.clone(),
                backup,
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            HookInstall::Installed { path: path.clone() }
        }
        Err(err) => return Err(err.into()),
    };

    fs::write(&path, PRE_PUSH_SCRIPT)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }
    info!(path = %path.display(), "installed pre-push hook");
    Ok(outcome)
}
