//! Marker-delimited sections of the shared agent document.
//!
//! ```text
//! <!-- BEGIN CUB MANAGED SECTION {tag} -->
//! <!-- sha256:{hex} -->
//! ...content...
//! <!-- END CUB MANAGED SECTION -->
//! ```
//!
//! Sections travel through the sync branch. Only the spans between markers are
//! ever rewritten; everything around them is preserved byte-for-byte.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::git::{GitPlumbing, MoveAttempt};
use crate::project::write_atomic;
use crate::sync::{content_hash, SyncError, SyncService, SyncSettings};

pub const PRIMARY_DOCUMENT: &str = "AGENTS.md";
pub const ALTERNATE_DOCUMENTS: [&str; 2] = ["CLAUDE.md", ".cub/agent.md"];

pub const BEGIN_MARKER_PREFIX: &str = "<!-- BEGIN CUB MANAGED SECTION ";
pub const END_MARKER: &str = "<!-- END CUB MANAGED SECTION -->";

#[derive(Debug, Error)]
pub enum ManagedError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("No shared document found (looked for AGENTS.md, CLAUDE.md, .cub/agent.md)")]
    NoLocalDocument,
    #[error("Managed document IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::git::GitError> for ManagedError {
    fn from(err: crate::git::GitError) -> Self {
        ManagedError::Sync(err.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedSection {
    pub tag: String,
    pub content: String,
    /// Hash carried by the `sha256` marker, if present.
    pub hash: Option<String>,
    /// Byte offset of the begin marker.
    pub start: usize,
    /// Byte offset just past the end marker.
    pub end: usize,
    pub raw: String,
}

impl ManagedSection {
    /// True when the hash marker is missing or no longer matches the content.
    pub fn is_edited(&self) -> bool {
        self.hash
            .as_deref()
            .map(|hash| hash != content_hash(self.content.as_bytes()))
            .unwrap_or(true)
    }
}

fn begin_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<!-- BEGIN CUB MANAGED SECTION (\S+) -->").expect("regex"))
}

fn hash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\A\r?\n?<!-- sha256:([0-9a-fA-F]+) -->").expect("regex"))
}

fn strip_leading_newline(text: &str) -> &str {
    text.strip_prefix("\r\n")
        .or_else(|| text.strip_prefix('\n'))
        .unwrap_or(text)
}

fn strip_trailing_newline(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}

/// Every matched begin/end pair in `text`, keyed by tag. The first occurrence
/// of a tag wins; a begin marker without an end before the next begin is skipped.
pub fn parse_managed_sections(text: &str) -> BTreeMap<String, ManagedSection> {
    let begins: Vec<_> = begin_re().captures_iter(text).collect();
    let mut sections = BTreeMap::new();
    for (idx, caps) in begins.iter().enumerate() {
        let (Some(whole), Some(tag)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let limit = begins
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map(|next| next.start())
            .unwrap_or(text.len());
        let Some(end_rel) = text[whole.end()..limit].find(END_MARKER) else {
            debug!(tag = tag.as_str(), "unterminated managed section");
            continue;
        };
        let end_marker_start = whole.end() + end_rel;
        let end = end_marker_start + END_MARKER.len();

        let mut body = &text[whole.end()..end_marker_start];
        let mut hash = None;
        if let Some(hash_caps) = hash_re().captures(body) {
            if let (Some(hash_line), Some(value)) = (hash_caps.get(0), hash_caps.get(1)) {
                hash = Some(value.as_str().to_ascii_lowercase());
                body = &body[hash_line.end()..];
            }
        }
        let content = strip_trailing_newline(strip_leading_newline(body)).to_string();

        sections
            .entry(tag.as_str().to_string())
            .or_insert_with(|| ManagedSection {
                tag: tag.as_str().to_string(),
                content,
                hash,
                start: whole.start(),
                end,
                raw: text[whole.start()..end].to_string(),
            });
    }
    sections
}

/// Replace each addressed tag's span in `base` with the section's raw text.
/// Tags missing from `base` are appended at the end.
pub fn inject_managed_sections(base: &str, sections: &BTreeMap<String, ManagedSection>) -> String {
    let existing = parse_managed_sections(base);
    let mut spans: Vec<(&ManagedSection, &ManagedSection)> = Vec::new();
    let mut appended: Vec<&ManagedSection> = Vec::new();
    for (tag, section) in sections {
        match existing.get(tag) {
            Some(current) => spans.push((current, section)),
            None => appended.push(section),
        }
    }
    spans.sort_by_key(|(current, _)| current.start);

    let mut out = String::with_capacity(base.len());
    let mut cursor = 0;
    for (current, replacement) in spans {
        out.push_str(&base[cursor..current.start]);
        out.push_str(&replacement.raw);
        cursor = current.end;
    }
    out.push_str(&base[cursor..]);

    for section in appended {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&section.raw);
        out.push('\n');
    }
    out
}

/// Tags present on both sides whose hash markers both exist and differ.
pub fn detect_conflicts(local: &str, remote: &str) -> BTreeSet<String> {
    let local = parse_managed_sections(local);
    let remote = parse_managed_sections(remote);
    local
        .iter()
        .filter_map(|(tag, ours)| {
            let theirs = remote.get(tag)?;
            match (&ours.hash, &theirs.hash) {
                (Some(a), Some(b)) if a != b => Some(tag.clone()),
                _ => None,
            }
        })
        .collect()
}

pub fn render_managed_section(tag: &str, content: &str) -> String {
    format!(
        "{BEGIN_MARKER_PREFIX}{tag} -->\n<!-- sha256:{} -->\n{content}\n{END_MARKER}",
        content_hash(content.as_bytes())
    )
}

fn restamp(section: &ManagedSection) -> ManagedSection {
    let raw = render_managed_section(&section.tag, &section.content);
    ManagedSection {
        hash: Some(content_hash(section.content.as_bytes())),
        end: section.start + raw.len(),
        raw,
        ..section.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PullOutcome {
    Updated { count: usize },
    Conflicted { tags: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub document: String,
    pub written: usize,
    pub restamped: Vec<String>,
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdoptOutcome {
    AlreadyPrimary,
    Moved { from: String, to: String, tracked: bool },
    NoDocument,
}

#[derive(Debug, Clone)]
pub struct ManagedSectionEngine {
    git: GitPlumbing,
    settings: SyncSettings,
}

impl ManagedSectionEngine {
    pub fn new(git: GitPlumbing, settings: SyncSettings) -> Self {
        Self { git, settings }
    }

    fn root(&self) -> &Path {
        self.git.cwd()
    }

    fn candidates() -> impl Iterator<Item = &'static str> {
        std::iter::once(PRIMARY_DOCUMENT).chain(ALTERNATE_DOCUMENTS)
    }

    /// Relative path of the local document, primary name first.
    pub fn local_document(&self) -> Option<&'static str> {
        Self::candidates().find(|name| self.root().join(name).is_file())
    }

    fn sync_for(&self, document: &str) -> SyncService {
        SyncService::new(self.git.clone(), self.settings.clone(), document)
    }

    fn remote_document(&self, sync: &SyncService) -> Result<Option<String>, SyncError> {
        for name in Self::candidates() {
            if let Some(text) = sync.read_tip_path(name)? {
                return Ok(Some(text));
            }
        }
        Ok(None)
    }

    /// Bring remote section content into the local document unless any tag conflicts.
    pub fn pull(&self) -> Result<PullOutcome, ManagedError> {
        let primary = self.sync_for(PRIMARY_DOCUMENT);
        if !primary.is_initialized() {
            return Err(SyncError::NotInitialized {
                branch: self.settings.branch.clone(),
            }
            .into());
        }
        let document = self.local_document().ok_or(ManagedError::NoLocalDocument)?;
        let path = self.root().join(document);
        let local = fs::read_to_string(&path)?;
        let Some(remote) = self.remote_document(&primary)? else {
            debug!("no shared document on sync branch");
            return Ok(PullOutcome::Updated { count: 0 });
        };

        let conflicts = detect_conflicts(&local, &remote);
        if !conflicts.is_empty() {
            info!(tags = ?conflicts, "managed section conflict; local document left unchanged");
            return Ok(PullOutcome::Conflicted {
                tags: conflicts.into_iter().collect(),
            });
        }

        let remote_sections = parse_managed_sections(&remote);
        let merged = inject_managed_sections(&local, &remote_sections);
        if merged != local {
            write_atomic(&path, merged.as_bytes())?;
        }
        info!(document, count = remote_sections.len(), "pulled managed sections");
        Ok(PullOutcome::Updated {
            count: remote_sections.len(),
        })
    }

    /// Commit the local document to the sync branch. Sections whose content no
    /// longer matches their hash marker are restamped in place first.
    pub fn push(&self, message: Option<&str>) -> Result<PushReport, ManagedError> {
        let document = self.local_document().ok_or(ManagedError::NoLocalDocument)?;
        let sync = self.sync_for(document);
        if !sync.is_initialized() {
            return Err(SyncError::NotInitialized {
                branch: self.settings.branch.clone(),
            }
            .into());
        }
        let path = self.root().join(document);
        let local = fs::read_to_string(&path)?;
        let sections = parse_managed_sections(&local);
        if sections.is_empty() {
            debug!(document, "no managed sections; nothing to push");
            return Ok(PushReport {
                document: document.to_string(),
                written: 0,
                restamped: Vec::new(),
                commit: None,
            });
        }

        let mut restamped = Vec::new();
        let outgoing: BTreeMap<String, ManagedSection> = sections
            .into_iter()
            .map(|(tag, section)| {
                if section.is_edited() {
                    restamped.push(tag.clone());
                    (tag, restamp(&section))
                } else {
                    (tag, section)
                }
            })
            .collect();
        if !restamped.is_empty() {
            let updated = inject_managed_sections(&local, &outgoing);
            write_atomic(&path, updated.as_bytes())?;
        }

        let default_message = format!("cub: update managed sections in {document}");
        let sha = sync.commit(Some(message.unwrap_or(&default_message)))?;
        Ok(PushReport {
            document: document.to_string(),
            written: outgoing.len(),
            restamped,
            commit: Some(sha),
        })
    }

    /// Rename an alternate-named document to the primary name.
    pub fn adopt_document(&self) -> Result<AdoptOutcome, ManagedError> {
        if self.root().join(PRIMARY_DOCUMENT).is_file() {
            return Ok(AdoptOutcome::AlreadyPrimary);
        }
        let Some(from) = ALTERNATE_DOCUMENTS
            .into_iter()
            .find(|name| self.root().join(name).is_file())
        else {
            return Ok(AdoptOutcome::NoDocument);
        };
        let source = PathBuf::from(from);
        let target = PathBuf::from(PRIMARY_DOCUMENT);
        let tracked = match self.git.try_tracked_move(&source, &target)? {
            MoveAttempt::Moved => true,
            MoveAttempt::NeedsFallback => {
                fs::rename(self.root().join(&source), self.root().join(&target))?;
                false
            }
        };
        info!(from, to = PRIMARY_DOCUMENT, tracked, "adopted shared document");
        Ok(AdoptOutcome::Moved {
            from: from.to_string(),
            to: PRIMARY_DOCUMENT.to_string(),
            tracked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{init_repo, run_git};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn doc(sections: &[(&str, &str)]) -> String {
        let mut out = String::from("# Agents\n\nIntro text.\n\n");
        for (tag, content) in sections {
            out.push_str(&render_managed_section(tag, content));
            out.push_str("\n\nBetween sections.\n\n");
        }
        out
    }

    fn engine(root: &Path) -> ManagedSectionEngine {
        ManagedSectionEngine::new(GitPlumbing::new(root), SyncSettings::default())
    }

    fn initialized(root: &Path) -> ManagedSectionEngine {
        init_repo(root, true);
        SyncService::new(GitPlumbing::new(root), SyncSettings::default(), PRIMARY_DOCUMENT)
            .initialize()
            .expect("init");
        engine(root)
    }

    #[test]
    fn parse_reads_tag_hash_content_and_offsets() {
        let text = doc(&[("claude-v1", "Line one\nLine two")]);
        let sections = parse_managed_sections(&text);
        let section = sections.get("claude-v1").expect("section");
        assert_eq!(section.content, "Line one\nLine two");
        assert_eq!(
            section.hash.as_deref(),
            Some(content_hash(b"Line one\nLine two").as_str())
        );
        assert_eq!(&text[section.start..section.end], section.raw);
        assert!(section.raw.starts_with(BEGIN_MARKER_PREFIX));
        assert!(section.raw.ends_with(END_MARKER));
        assert!(!section.is_edited());
    }

    #[test]
    fn parse_skips_unmatched_markers() {
        let text = format!(
            "{BEGIN_MARKER_PREFIX}orphan -->\nno end here\n{}\n{END_MARKER}\n{END_MARKER}\n",
            render_managed_section("ok", "body").replace(END_MARKER, "")
        );
        let sections = parse_managed_sections(&text);
        assert_eq!(sections.keys().collect::<Vec<_>>(), vec!["ok"]);
        assert!(parse_managed_sections("<!-- END CUB MANAGED SECTION -->").is_empty());
        assert!(parse_managed_sections("").is_empty());
    }

    #[test]
    fn sections_without_hash_marker_parse() {
        let text = format!("{BEGIN_MARKER_PREFIX}plain -->\nhello\n{END_MARKER}\n");
        let section = parse_managed_sections(&text).remove("plain").expect("section");
        assert_eq!(section.content, "hello");
        assert_eq!(section.hash, None);
        assert!(section.is_edited());
    }

    #[test]
    fn inject_preserves_surrounding_bytes() {
        let base = doc(&[("a", "old a"), ("b", "old b")]);
        let remote = parse_managed_sections(&doc(&[("b", "new b")]));
        let merged = inject_managed_sections(&base, &remote);

        let expected = base.replace(
            &render_managed_section("b", "old b"),
            &render_managed_section("b", "new b"),
        );
        assert_eq!(merged, expected);
    }

    #[test]
    fn inject_appends_missing_tags() {
        let base = "# Title\nNo sections yet.";
        let remote = parse_managed_sections(&doc(&[("fresh", "content")]));
        let merged = inject_managed_sections(base, &remote);
        assert!(merged.starts_with("# Title\nNo sections yet.\n\n"));
        assert!(merged.ends_with(&format!("{}\n", render_managed_section("fresh", "content"))));
        assert_eq!(
            parse_managed_sections(&merged)
                .get("fresh")
                .map(|s| s.content.as_str()),
            Some("content")
        );
    }

    #[test]
    fn conflicts_need_hashes_on_both_sides() {
        let local = doc(&[("a", "one"), ("b", "same"), ("c", "x")]);
        let remote = doc(&[("a", "two"), ("b", "same")]);
        assert_eq!(
            detect_conflicts(&local, &remote),
            BTreeSet::from(["a".to_string()])
        );

        let unhashed = format!("{BEGIN_MARKER_PREFIX}a -->\nlocal edit\n{END_MARKER}\n");
        assert!(detect_conflicts(&unhashed, &remote).is_empty());
        assert!(detect_conflicts(&remote, &unhashed).is_empty());
    }

    #[test]
    fn render_round_trips_trailing_newlines() {
        for content in ["", "x", "x\n", "a\n\nb\n\n"] {
            let text = render_managed_section("t", content);
            let section = parse_managed_sections(&text).remove("t").expect("section");
            assert_eq!(section.content, content);
            assert!(!section.is_edited());
        }
    }

    #[test]
    fn pull_requires_initialized_branch_and_document() {
        let temp = TempDir::new().expect("tempdir");
        init_repo(temp.path(), true);
        assert!(matches!(
            engine(temp.path()).pull(),
            Err(ManagedError::Sync(SyncError::NotInitialized { .. }))
        ));

        let engine = initialized(&temp.path().join("inner"));
        assert!(matches!(engine.pull(), Err(ManagedError::NoLocalDocument)));
    }

    #[test]
    fn pull_without_remote_document_is_a_noop() {
        let temp = TempDir::new().expect("tempdir");
        let engine = initialized(temp.path());
        let text = doc(&[("a", "mine")]);
        fs::write(temp.path().join(PRIMARY_DOCUMENT), &text).expect("write");
        assert_eq!(engine.pull().expect("pull"), PullOutcome::Updated { count: 0 });
        assert_eq!(
            fs::read_to_string(temp.path().join(PRIMARY_DOCUMENT)).expect("read"),
            text
        );
    }

    #[test]
    fn pull_injects_remote_sections_or_reports_conflicts() {
        let temp = TempDir::new().expect("tempdir");
        let engine = initialized(temp.path());
        let sync = SyncService::new(
            GitPlumbing::new(temp.path()),
            SyncSettings::default(),
            PRIMARY_DOCUMENT,
        );
        sync.commit_content(doc(&[("a", "remote a")]).as_bytes(), None)
            .expect("seed remote");

        let path = temp.path().join(PRIMARY_DOCUMENT);
        let local = format!("Local header\n{BEGIN_MARKER_PREFIX}a -->\nstale\n{END_MARKER}\nLocal footer\n");
        fs::write(&path, &local).expect("write");
        assert_eq!(engine.pull().expect("pull"), PullOutcome::Updated { count: 1 });
        let pulled = fs::read_to_string(&path).expect("read");
        assert!(pulled.starts_with("Local header\n"));
        assert!(pulled.ends_with("\nLocal footer\n"));
        assert_eq!(
            parse_managed_sections(&pulled)["a"].content,
            "remote a"
        );

        let conflicting = doc(&[("a", "diverged locally")]);
        fs::write(&path, &conflicting).expect("write");
        assert_eq!(
            engine.pull().expect("pull"),
            PullOutcome::Conflicted {
                tags: vec!["a".to_string()]
            }
        );
        assert_eq!(fs::read_to_string(&path).expect("read"), conflicting);
    }

    #[test]
    fn push_with_no_sections_writes_nothing() {
        let temp = TempDir::new().expect("tempdir");
        let engine = initialized(temp.path());
        fs::write(temp.path().join(PRIMARY_DOCUMENT), "# Just prose\n").expect("write");
        let report = engine.push(None).expect("push");
        assert_eq!(report.written, 0);
        assert_eq!(report.commit, None);
        assert_eq!(
            run_git(temp.path(), &["rev-list", "--count", "refs/heads/cub-sync"]),
            "1"
        );
    }

    #[test]
    fn push_restamps_edited_sections() {
        let temp = TempDir::new().expect("tempdir");
        let engine = initialized(temp.path());
        let path = temp.path().join(PRIMARY_DOCUMENT);
        let text = format!("{BEGIN_MARKER_PREFIX}notes -->\nunhashed\n{END_MARKER}\n");
        fs::write(&path, text).expect("write");

        let report = engine.push(None).expect("push");
        assert_eq!(report.written, 1);
        assert_eq!(report.restamped, vec!["notes".to_string()]);
        let local = fs::read_to_string(&path).expect("read");
        assert_eq!(
            local,
            format!("{}\n", render_managed_section("notes", "unhashed"))
        );
        let shared = run_git(
            temp.path(),
            &["show", "refs/heads/cub-sync:AGENTS.md"],
        );
        assert_eq!(shared, local.trim_end());
    }

    #[test]
    fn push_commits_the_whole_local_document() {
        let temp = TempDir::new().expect("tempdir");
        let engine = initialized(temp.path());
        let sync = SyncService::new(
            GitPlumbing::new(temp.path()),
            SyncSettings::default(),
            PRIMARY_DOCUMENT,
        );
        sync.commit_content(b"# Stale shared copy\n", None)
            .expect("seed shared");

        let path = temp.path().join(PRIMARY_DOCUMENT);
        let text = doc(&[("rules", "Be brief.")]).replace("Intro text.", "Fresh prose.");
        fs::write(&path, &text).expect("write");
        let report = engine.push(None).expect("push");
        assert_eq!(report.restamped, Vec::<String>::new());

        let shared = sync.read_tip().expect("read tip").expect("document");
        assert_eq!(shared, text);
        assert!(!shared.contains("Stale shared copy"));
    }

    #[test]
    fn adopt_moves_alternate_document() {
        let temp = TempDir::new().expect("tempdir");
        init_repo(temp.path(), true);
        let engine = engine(temp.path());
        assert_eq!(engine.adopt_document().expect("adopt"), AdoptOutcome::NoDocument);

        fs::write(temp.path().join("CLAUDE.md"), "tracked doc\n").expect("write");
        run_git(temp.path(), &["add", "CLAUDE.md"]);
        run_git(temp.path(), &["commit", "-q", "-m", "add doc"]);
        assert_eq!(
            engine.adopt_document().expect("adopt"),
            AdoptOutcome::Moved {
                from: "CLAUDE.md".to_string(),
                to: PRIMARY_DOCUMENT.to_string(),
                tracked: true,
            }
        );
        let staged = run_git(temp.path(), &["diff", "--cached", "--name-status"]);
        assert!(staged.contains("AGENTS.md"), "{staged}");
        assert_eq!(engine.adopt_document().expect("adopt"), AdoptOutcome::AlreadyPrimary);
    }

    #[test]
    fn adopt_renames_untracked_document() {
        let temp = TempDir::new().expect("tempdir");
        init_repo(temp.path(), true);
        fs::create_dir_all(temp.path().join(".cub")).expect("dir");
        fs::write(temp.path().join(".cub/agent.md"), "draft\n").expect("write");
        let outcome = engine(temp.path()).adopt_document().expect("adopt");
        assert_eq!(
            outcome,
            AdoptOutcome::Moved {
                from: ".cub/agent.md".to_string(),
                to: PRIMARY_DOCUMENT.to_string(),
                tracked: false,
            }
        );
        assert_eq!(
            fs::read_to_string(temp.path().join(PRIMARY_DOCUMENT)).expect("read"),
            "draft\n"
        );
    }
}
