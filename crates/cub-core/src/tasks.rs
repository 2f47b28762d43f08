//! Task-state file access and hierarchical id generation.

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::counters::{CounterKind, CounterNumber};
use crate::ids::{AnyId, EpicId, IdError, PlanId, SpecId, TaskId};
use crate::sequence::{next_epic_char, next_plan_letter, SequenceError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task state IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Tasks(#[from] TaskError),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error("Task numbers under {0} are exhausted")]
    TaskNumberOverflow(EpicId),
}

/// One line of the task-state file. Only `id` is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn parsed_id(&self) -> Option<AnyId> {
        AnyId::parse(&self.id)
    }
}

/// Source of task records.
pub trait TaskBackend {
    fn records(&self) -> Result<Vec<TaskRecord>, TaskError>;

    fn parsed_ids(&self) -> Result<Vec<AnyId>, TaskError> {
        Ok(self
            .records()?
            .iter()
            .filter_map(TaskRecord::parsed_id)
            .collect())
    }
}

/// Tasks stored one JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlTaskBackend {
    path: PathBuf,
}

impl JsonlTaskBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TaskBackend for JsonlTaskBackend {
    fn records(&self) -> Result<Vec<TaskRecord>, TaskError> {
        read_task_records(&self.path)
    }
}

/// All well-formed records in `path`; a missing file reads as empty and
/// malformed lines are skipped.
pub fn read_task_records(path: &Path) -> Result<Vec<TaskRecord>, TaskError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<TaskRecord>(trimmed) {
            Ok(record) => records.push(record),
            Err(err) => debug!(path = %path.display(), line = idx + 1, error = %err, "skipping malformed task record"),
        }
    }
    Ok(records)
}

/// Spec and standalone numbers referenced by the task-state file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsedNumbers {
    pub spec: BTreeSet<u32>,
    pub standalone: BTreeSet<u32>,
}

impl UsedNumbers {
    pub fn max_spec(&self) -> Option<u32> {
        self.spec.last().copied()
    }

    pub fn max_standalone(&self) -> Option<u32> {
        self.standalone.last().copied()
    }

    pub fn contains(&self, number: CounterNumber) -> bool {
        match number.kind {
            CounterKind::Spec => self.spec.contains(&number.number),
            CounterKind::Standalone => self.standalone.contains(&number.number),
        }
    }

    fn record(&mut self, id: &AnyId) {
        if let Some(spec) = id.spec() {
            self.spec.insert(spec.number());
        }
        if let Some(number) = id.standalone_number() {
            self.standalone.insert(number);
        }
    }
}

/// Stream `path` and collect every spec/standalone number its ids use.
pub fn scan_used_numbers(path: &Path) -> Result<UsedNumbers, TaskError> {
    let mut used = UsedNumbers::default();
    if !path.exists() {
        return Ok(used);
    }
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        let Ok(record) = serde_json::from_str::<TaskRecord>(line.trim()) else {
            continue;
        };
        if let Some(id) = record.parsed_id() {
            used.record(&id);
        }
    }
    Ok(used)
}

pub fn next_plan_id(spec: &SpecId, backend: &dyn TaskBackend) -> Result<PlanId, GenerateError> {
    let used: HashSet<char> = backend
        .parsed_ids()?
        .iter()
        .filter_map(|id| match id {
            AnyId::Plan(plan) => Some(plan),
            AnyId::Epic(epic) => Some(epic.plan()),
            AnyId::Task(task) => Some(task.epic().plan()),
            _ => None,
        })
        .filter(|plan| plan.spec() == spec)
        .map(PlanId::letter)
        .collect();
    Ok(PlanId::new(spec.clone(), next_plan_letter(&used)?)?)
}

pub fn next_epic_id(plan: &PlanId, backend: &dyn TaskBackend) -> Result<EpicId, GenerateError> {
    let used: HashSet<char> = backend
        .parsed_ids()?
        .iter()
        .filter_map(|id| match id {
            AnyId::Epic(epic) => Some(epic),
            AnyId::Task(task) => Some(task.epic()),
            _ => None,
        })
        .filter(|epic| epic.plan() == plan)
        .map(EpicId::char)
        .collect();
    Ok(EpicId::new(plan.clone(), next_epic_char(&used)?)?)
}

pub fn next_task_id(epic: &EpicId, backend: &dyn TaskBackend) -> Result<TaskId, GenerateError> {
    let max = backend
        .parsed_ids()?
        .iter()
        .filter_map(|id| match id {
            AnyId::Task(task) if task.epic() == epic => Some(task.number()),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    let number = max
        .checked_add(1)
        .ok_or_else(|| GenerateError::TaskNumberOverflow(epic.clone()))?;
    Ok(TaskId::new(epic.clone(), number)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    struct FixedBackend(Vec<&'static str>);

    impl TaskBackend for FixedBackend {
        fn records(&self) -> Result<Vec<TaskRecord>, TaskError> {
            Ok(self.0.iter().map(|id| TaskRecord::new(*id)).collect())
        }
    }

    fn write_tasks(temp: &TempDir, body: &str) -> PathBuf {
        let path = temp.path().join(".cub").join("tasks.jsonl");
        fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        fs::write(&path, body).expect("write tasks");
        path
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let temp = TempDir::new().expect("tempdir");
        let path = write_tasks(
            &temp,
            "{\"id\":\"cub-054A-0.1\",\"title\":\"First\"}\nnot json\n\n{\"title\":\"no id\"}\n{\"id\":\"cub-s017\"}\n",
        );
        let records = read_task_records(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "cub-054A-0.1");
        assert_eq!(
            records[0].extra.get("title"),
            Some(&serde_json::Value::from("First"))
        );
    }

    #[test]
    fn scan_collects_spec_and_standalone_numbers() {
        let temp = TempDir::new().expect("tempdir");
        let path = write_tasks(
            &temp,
            concat!(
                "{\"id\":\"cub-054A-0.1\"}\n",
                "{\"id\":\"cub-012\"}\n",
                "{\"id\":\"cub-060B\"}\n",
                "{\"id\":\"cub-s017\"}\n",
                "{\"id\":\"cub-s003\"}\n",
                "{\"id\":\"free-form\"}\n",
                "garbage\n",
            ),
        );
        let used = scan_used_numbers(&path).expect("scan");
        assert_eq!(used.spec, BTreeSet::from([12, 54, 60]));
        assert_eq!(used.max_spec(), Some(60));
        assert_eq!(used.max_standalone(), Some(17));
    }

    #[test]
    fn scan_of_missing_file_is_empty() {
        let temp = TempDir::new().expect("tempdir");
        let used = scan_used_numbers(&temp.path().join("absent.jsonl")).expect("scan");
        assert_eq!(used, UsedNumbers::default());
        assert_eq!(used.max_spec(), None);
    }

    #[test]
    fn generators_fill_from_sibling_sets() {
        let backend = FixedBackend(vec![
            "cub-054A",
            "cub-054B-0",
            "cub-054B-0.1",
            "cub-054B-0.4",
            "cub-054B-1.2",
            "cub-055A",
            "cub-055C",
        ]);
        let spec = SpecId::parse("cub-054").expect("spec");
        assert_eq!(
            next_plan_id(&spec, &backend).expect("plan").to_string(),
            "cub-054C"
        );
        let other = SpecId::parse("cub-055").expect("spec");
        assert_eq!(
            next_plan_id(&other, &backend).expect("plan").to_string(),
            "cub-055B"
        );

        let plan = PlanId::parse("cub-054B").expect("plan");
        assert_eq!(
            next_epic_id(&plan, &backend).expect("epic").to_string(),
            "cub-054B-2"
        );
        let fresh_plan = PlanId::parse("cub-054Z").expect("plan");
        assert_eq!(
            next_epic_id(&fresh_plan, &backend).expect("epic").to_string(),
            "cub-054Z-0"
        );

        let epic = EpicId::parse("cub-054B-0").expect("epic");
        assert_eq!(
            next_task_id(&epic, &backend).expect("task").to_string(),
            "cub-054B-0.5"
        );
        let empty_epic = EpicId::parse("cub-054A-0").expect("epic");
        assert_eq!(
            next_task_id(&empty_epic, &backend).expect("task").to_string(),
            "cub-054A-0.1"
        );
    }

    #[test]
    fn jsonl_backend_reads_records_with_extra_fields() {
        let temp = TempDir::new().expect("tempdir");
        let path = write_tasks(
            &temp,
            "{\"id\":\"cub-001A-0.1\",\"status\":\"open\"}\n{\"id\":\"cub-001A-0.2\"}\n",
        );
        let backend = JsonlTaskBackend::new(path);
        let epic = EpicId::parse("cub-001A-0").expect("epic");
        assert_eq!(
            next_task_id(&epic, &backend).expect("task").to_string(),
            "cub-001A-0.3"
        );
        let records = backend.records().expect("records");
        assert_eq!(
            records[0].extra.get("status"),
            Some(&serde_json::Value::from("open"))
        );
    }
}
