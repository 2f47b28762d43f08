//! Everything one invocation needs, resolved once and passed down.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, ConfigSource, ResolvedConfig};
use crate::counters::{allocate_spec_number, allocate_standalone_number, counter_service, CounterError};
use crate::git::{GitError, GitPlumbing};
use crate::ids::{validate_project, IdError, SpecId, StandaloneTaskId};
use crate::managed::ManagedSectionEngine;
use crate::project::{find_project_root, tasks_path, TASKS_PATH};
use crate::sync::{SyncService, SyncSettings};
use crate::tasks::JsonlTaskBackend;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("No project found at or above {}", .0.display())]
    NoProject(PathBuf),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error("Configured project slug is not usable in ids: {0}")]
    Id(#[from] IdError),
}

#[derive(Debug, Clone)]
pub struct CubContext {
    pub root: PathBuf,
    pub git: GitPlumbing,
    pub settings: SyncSettings,
    pub project: String,
    pub project_source: ConfigSource,
}

impl CubContext {
    /// Resolve the project around `start`. Inside a git repository the
    /// repository top level is the root.
    pub fn discover(start: &Path) -> Result<Self, ContextError> {
        let git = GitPlumbing::new(start);
        let root = if git.is_inside_repo() {
            git.show_toplevel()?
        } else {
            find_project_root(start).ok_or_else(|| ContextError::NoProject(start.to_path_buf()))?
        };
        Self::at_root(root)
    }

    pub fn at_root(root: PathBuf) -> Result<Self, ContextError> {
        let config = ResolvedConfig::load(&root)?;
        let (project, project_source) = config.project_with_source(&root);
        let git = GitPlumbing::new(&root).with_timeout(config.git_timeout());
        let settings = config.sync_settings();
        debug!(
            root = %root.display(),
            project = %project,
            source = project_source.as_str(),
            branch = %settings.branch,
            "resolved project context"
        );
        Ok(Self {
            root,
            git,
            settings,
            project,
            project_source,
        })
    }

    /// Sync service for the task-state file.
    pub fn task_sync(&self) -> SyncService {
        SyncService::new(self.git.clone(), self.settings.clone(), TASKS_PATH)
    }

    pub fn counter_sync(&self) -> SyncService {
        counter_service(self.git.clone(), self.settings.clone())
    }

    pub fn managed(&self) -> ManagedSectionEngine {
        ManagedSectionEngine::new(self.git.clone(), self.settings.clone())
    }

    pub fn task_backend(&self) -> JsonlTaskBackend {
        JsonlTaskBackend::new(tasks_path(&self.root))
    }

    pub fn allocate_spec_id(&self) -> Result<SpecId, ContextError> {
        validate_project(&self.project)?;
        let number = allocate_spec_number(&self.counter_sync())?;
        Ok(SpecId::new(self.project.clone(), number)?)
    }

    pub fn allocate_standalone_id(&self) -> Result<StandaloneTaskId, ContextError> {
        validate_project(&self.project)?;
        let number = allocate_standalone_number(&self.counter_sync())?;
        Ok(StandaloneTaskId::new(self.project.clone(), number)?)
    }
}
