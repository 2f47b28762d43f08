use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::config_filename_candidates;

/// Directory holding cub's per-project files.
pub const CUB_DIR: &str = ".cub";
/// Task-state file, relative to the project root.
pub const TASKS_PATH: &str = ".cub/tasks.jsonl";
/// Counter file, relative to the project root (and to the sync branch tree).
pub const COUNTERS_PATH: &str = ".cub/counters.json";

pub fn cub_dir(root: &Path) -> PathBuf {
    root.join(CUB_DIR)
}

pub fn tasks_path(root: &Path) -> PathBuf {
    root.join(TASKS_PATH)
}

/// Walk up from `start` to the nearest directory that looks like a project root.
///
/// A directory qualifies when it has a cub config file, a `.cub/` directory or
/// a `.git` entry (directory or worktree file).
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    for candidate in start.ancestors() {
        let has_config = config_filename_candidates()
            .iter()
            .any(|name| candidate.join(name).is_file());
        if has_config || candidate.join(CUB_DIR).is_dir() || candidate.join(".git").exists() {
            return Some(candidate.to_path_buf());
        }
    }
    None
}

/// Derive a project slug from a directory name: lowercase, with anything
/// outside `[a-z0-9_-]` collapsed to `-`.
pub fn default_project_slug(root: &Path) -> String {
    let name = root
        .file_name()
        .and_then(|segment| segment.to_str())
        .unwrap_or("");
    let mut slug = String::new();
    for ch in name.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            slug.push(ch);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches(|c| c == '-' || c == '_').to_string();
    if slug.is_empty() {
        "cub".to_string()
    } else {
        slug
    }
}

/// Replace `path` with `content` so readers never observe a partial file.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn find_project_root_prefers_nearest_marker() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path().join("repo");
        let nested = root.join("src").join("deep");
        fs::create_dir_all(&nested).expect("nested");
        fs::create_dir_all(root.join(CUB_DIR)).expect("cub dir");

        let found = find_project_root(&nested).expect("root");
        assert_eq!(found, root.canonicalize().expect("canonical"));
    }

    #[test]
    fn find_project_root_accepts_config_file() {
        let temp = TempDir::new().expect("tempdir");
        let root = temp.path().join("configured");
        fs::create_dir_all(&root).expect("root");
        fs::write(root.join(".cub.toml"), "project = \"demo\"\n").expect("config");

        let found = find_project_root(&root).expect("root");
        assert_eq!(found, root.canonicalize().expect("canonical"));
    }

    #[test]
    fn default_project_slug_normalizes_directory_names() {
        assert_eq!(default_project_slug(Path::new("/work/Cub")), "cub");
        assert_eq!(default_project_slug(Path::new("/work/My Project.rs")), "my-project-rs");
        assert_eq!(default_project_slug(Path::new("/")), "cub");
    }

    #[test]
    fn write_atomic_replaces_content() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("nested").join("state.json");
        write_atomic(&path, b"one").expect("first write");
        write_atomic(&path, b"two").expect("second write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "two");
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .collect();
        assert_eq!(leftovers.len(), 1);
    }
}
