use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::git::DEFAULT_GIT_TIMEOUT;
use crate::project::default_project_slug;
use crate::sync::SyncSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CubConfig {
    /// Project slug used as the prefix of newly allocated ids (e.g. "cub").
    pub project: Option<String>,
    pub sync: Option<SyncConfig>,
    pub git: Option<GitConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Branch used as the shared data store.
    pub branch: Option<String>,
    /// Remote the sync branch is fetched from and published to.
    pub remote: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct GitConfig {
    pub timeout_secs: Option<u64>,
}

pub fn config_filename_candidates() -> [&'static str; 2] {
    [".cub.toml", ".cubrc"]
}

pub fn resolve_user_home_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    if let Ok(profile) = std::env::var("USERPROFILE") {
        let trimmed = profile.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    None
}

pub fn resolve_cub_home_dir() -> Option<PathBuf> {
    if let Ok(value) = std::env::var("CUB_HOME") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    resolve_user_home_dir().map(|home| home.join(".cub"))
}

pub fn global_config_path() -> Option<PathBuf> {
    resolve_cub_home_dir().map(|home| home.join("config.toml"))
}

/// Project config, or `None` when absent. A file that fails to parse is an error.
pub fn load_config(repo_root: &Path) -> Result<Option<CubConfig>, ConfigError> {
    for name in config_filename_candidates() {
        let path = repo_root.join(name);
        if path.is_file() {
            let text = fs::read_to_string(&path)?;
            return Ok(Some(toml::from_str::<CubConfig>(&text)?));
        }
    }
    Ok(None)
}

pub fn load_global_config() -> Result<Option<CubConfig>, ConfigError> {
    let Some(path) = global_config_path() else {
        return Ok(None);
    };
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    Ok(Some(toml::from_str::<CubConfig>(&text)?))
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Project,
    Global,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Project => "project",
            ConfigSource::Global => "global",
            ConfigSource::Default => "default",
        }
    }
}

/// Project and global config layered together; project values win.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    project: Option<CubConfig>,
    global: Option<CubConfig>,
}

impl ResolvedConfig {
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        Ok(Self {
            project: load_config(repo_root)?,
            global: load_global_config()?,
        })
    }

    fn lookup<T>(&self, pick: impl Fn(&CubConfig) -> Option<T>) -> Option<(T, ConfigSource)> {
        if let Some(value) = self.project.as_ref().and_then(&pick) {
            return Some((value, ConfigSource::Project));
        }
        self.global
            .as_ref()
            .and_then(&pick)
            .map(|value| (value, ConfigSource::Global))
    }

    pub fn project_with_source(&self, repo_root: &Path) -> (String, ConfigSource) {
        self.lookup(|config| non_empty(config.project.as_deref()))
            .unwrap_or_else(|| (default_project_slug(repo_root), ConfigSource::Default))
    }

    pub fn sync_settings(&self) -> SyncSettings {
        let defaults = SyncSettings::default();
        let branch = self
            .lookup(|config| non_empty(config.sync.as_ref()?.branch.as_deref()))
            .map(|(value, _)| value)
            .unwrap_or(defaults.branch);
        let remote = self
            .lookup(|config| non_empty(config.sync.as_ref()?.remote.as_deref()))
            .map(|(value, _)| value)
            .unwrap_or(defaults.remote);
        SyncSettings { branch, remote }
    }

    pub fn git_timeout(&self) -> Duration {
        self.lookup(|config| config.git.as_ref()?.timeout_secs)
            .filter(|(secs, _)| *secs > 0)
            .map(|(secs, _)| Duration::from_secs(secs))
            .unwrap_or(DEFAULT_GIT_TIMEOUT)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use tempfile::TempDir;

    fn with_env_lock<T>(f: impl FnOnce() -> T) -> T {
        let _guard = crate::test_env::lock();
        f()
    }

    struct EnvGuard {
        cub_home: Option<OsString>,
    }

    impl EnvGuard {
        fn capture() -> Self {
            Self {
                cub_home: std::env::var_os("CUB_HOME"),
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = self.cub_home.as_ref() {
                std::env::set_var("CUB_HOME", value);
            } else {
                std::env::remove_var("CUB_HOME");
            }
        }
    }

    #[test]
    fn read_project_config() {
        let temp = TempDir::new().expect("tempdir");
        let config = CubConfig {
            project: Some("demo".to_string()),
            sync: Some(SyncConfig {
                branch: Some("shared-state".to_string()),
                remote: None,
            }),
            git: Some(GitConfig {
                timeout_secs: Some(5),
            }),
        };
        fs::write(
            temp.path().join(".cub.toml"),
            "project = \"demo\"\n\n[sync]\nbranch = \"shared-state\"\n\n[git]\ntimeout_secs = 5\n",
        )
        .expect("write config");
        let loaded = load_config(temp.path())
            .expect("load config")
            .expect("config present");
        assert_eq!(loaded, config);
    }

    #[test]
    fn malformed_project_config_is_an_error() {
        let temp = TempDir::new().expect("tempdir");
        fs::write(temp.path().join(".cub.toml"), "project = [").expect("write");
        assert!(matches!(
            load_config(temp.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn resolution_prefers_project_over_global_then_default() {
        with_env_lock(|| {
            let _env = EnvGuard::capture();
            let repo = TempDir::new().expect("repo tempdir");
            let home = TempDir::new().expect("home tempdir");
            std::env::set_var("CUB_HOME", home.path());

            let resolved = ResolvedConfig::load(repo.path()).expect("resolve");
            let (_, source) = resolved.project_with_source(repo.path());
            assert_eq!(source, ConfigSource::Default);
            assert_eq!(resolved.sync_settings(), SyncSettings::default());
            assert_eq!(resolved.git_timeout(), DEFAULT_GIT_TIMEOUT);

            fs::write(
                home.path().join("config.toml"),
                "project = \"global-proj\"\n[sync]\nremote = \"upstream\"\n",
            )
            .expect("global config");
            let resolved = ResolvedConfig::load(repo.path()).expect("resolve");
            let (project, source) = resolved.project_with_source(repo.path());
            assert_eq!(project, "global-proj");
            assert_eq!(source, ConfigSource::Global);
            assert_eq!(resolved.sync_settings().remote, "upstream");

            fs::write(
                repo.path().join(".cub.toml"),
                "project = \"local\"\n[sync]\nbranch = \"team-sync\"\n",
            )
            .expect("project config");
            let resolved = ResolvedConfig::load(repo.path()).expect("resolve");
            let (project, source) = resolved.project_with_source(repo.path());
            assert_eq!(project, "local");
            assert_eq!(source, ConfigSource::Project);
            let settings = resolved.sync_settings();
            assert_eq!(settings.branch, "team-sync");
            // Remote still comes from the global layer.
            assert_eq!(settings.remote, "upstream");
        });
    }
}
