//! Hierarchical work-item identifiers.
//!
//! ```text
//! SpecId            cub-054
//! PlanId            cub-054A
//! EpicId            cub-054A-0
//! TaskId            cub-054A-0.1
//! StandaloneTaskId  cub-s017
//! ```
//!
//! Every type is an immutable value built through a validating constructor
//! or parser; out-of-domain input is rejected, never clamped.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sequence::{is_epic_char, is_plan_letter};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("Invalid project slug '{0}': expected lowercase letters, digits, '-' or '_' starting with a letter or digit")]
    InvalidProject(String),
    #[error("Invalid plan letter '{0}': expected exactly one of A-Z, a-z, 0-9")]
    InvalidPlanLetter(String),
    #[error("Invalid epic char '{0}': expected exactly one of 0-9, a-z, A-Z")]
    InvalidEpicChar(String),
    #[error("Invalid task number {0}: task numbers start at 1")]
    InvalidTaskNumber(u32),
    #[error("Cannot parse '{input}' as a {kind} id")]
    Malformed { kind: &'static str, input: String },
}

/// Check that `project` can prefix an id.
pub fn validate_project(project: &str) -> Result<(), IdError> {
    let mut chars = project.chars();
    let valid_start = chars
        .next()
        .map(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
        .unwrap_or(false);
    let valid_rest = chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_');
    if valid_start && valid_rest {
        Ok(())
    } else {
        Err(IdError::InvalidProject(project.to_string()))
    }
}

/// Parse a zero-padded number, accepting only its canonical rendering.
fn parse_padded(digits: &str) -> Option<u32> {
    if digits.len() < 3 || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let number = digits.parse::<u32>().ok()?;
    (format!("{number:03}") == digits).then_some(number)
}

fn single_char(value: &str) -> Option<char> {
    let mut chars = value.chars();
    let ch = chars.next()?;
    chars.next().is_none().then_some(ch)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpecId {
    project: String,
    number: u32,
}

impl SpecId {
    pub fn new(project: impl Into<String>, number: u32) -> Result<Self, IdError> {
        let project = project.into();
        validate_project(&project)?;
        Ok(Self { project, number })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn parse(input: &str) -> Result<Self, IdError> {
        let malformed = || IdError::Malformed {
            kind: "spec",
            input: input.to_string(),
        };
        let (project, digits) = input.rsplit_once('-').ok_or_else(malformed)?;
        let number = parse_padded(digits).ok_or_else(malformed)?;
        Self::new(project, number).map_err(|_| malformed())
    }
}

impl fmt::Display for SpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.project, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlanId {
    spec: SpecId,
    letter: char,
}

impl PlanId {
    pub fn new(spec: SpecId, letter: char) -> Result<Self, IdError> {
        if !is_plan_letter(letter) {
            return Err(IdError::InvalidPlanLetter(letter.to_string()));
        }
        Ok(Self { spec, letter })
    }

    /// Build from a textual letter, which must be exactly one character.
    pub fn from_letter_str(spec: SpecId, letter: &str) -> Result<Self, IdError> {
        let ch = single_char(letter).ok_or_else(|| IdError::InvalidPlanLetter(letter.to_string()))?;
        Self::new(spec, ch)
    }

    pub fn spec(&self) -> &SpecId {
        &self.spec
    }

    pub fn letter(&self) -> char {
        self.letter
    }

    pub fn parse(input: &str) -> Result<Self, IdError> {
        let malformed = || IdError::Malformed {
            kind: "plan",
            input: input.to_string(),
        };
        let letter = input.chars().last().ok_or_else(malformed)?;
        let spec_part = &input[..input.len() - letter.len_utf8()];
        let spec = SpecId::parse(spec_part).map_err(|_| malformed())?;
        Self::new(spec, letter).map_err(|_| malformed())
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.spec, self.letter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EpicId {
    plan: PlanId,
    ch: char,
}

impl EpicId {
    pub fn new(plan: PlanId, ch: char) -> Result<Self, IdError> {
        if !is_epic_char(ch) {
            return Err(IdError::InvalidEpicChar(ch.to_string()));
        }
        Ok(Self { plan, ch })
    }

    pub fn from_char_str(plan: PlanId, ch: &str) -> Result<Self, IdError> {
        let single = single_char(ch).ok_or_else(|| IdError::InvalidEpicChar(ch.to_string()))?;
        Self::new(plan, single)
    }

    pub fn plan(&self) -> &PlanId {
        &self.plan
    }

    pub fn spec(&self) -> &SpecId {
        self.plan.spec()
    }

    pub fn char(&self) -> char {
        self.ch
    }

    pub fn parse(input: &str) -> Result<Self, IdError> {
        let malformed = || IdError::Malformed {
            kind: "epic",
            input: input.to_string(),
        };
        let (plan_part, ch_part) = input.rsplit_once('-').ok_or_else(malformed)?;
        let ch = single_char(ch_part).ok_or_else(malformed)?;
        let plan = PlanId::parse(plan_part).map_err(|_| malformed())?;
        Self::new(plan, ch).map_err(|_| malformed())
    }
}

impl fmt::Display for EpicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.plan, self.ch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    epic: EpicId,
    number: u32,
}

impl TaskId {
    pub fn new(epic: EpicId, number: u32) -> Result<Self, IdError> {
        if number == 0 {
            return Err(IdError::InvalidTaskNumber(number));
        }
        Ok(Self { epic, number })
    }

    pub fn epic(&self) -> &EpicId {
        &self.epic
    }

    pub fn spec(&self) -> &SpecId {
        self.epic.spec()
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn parse(input: &str) -> Result<Self, IdError> {
        let malformed = || IdError::Malformed {
            kind: "task",
            input: input.to_string(),
        };
        let (epic_part, number_part) = input.rsplit_once('.').ok_or_else(malformed)?;
        // Canonical form has no sign or leading zeros.
        if number_part.is_empty()
            || number_part.starts_with('0')
            || !number_part.chars().all(|ch| ch.is_ascii_digit())
        {
            return Err(malformed());
        }
        let number = number_part.parse::<u32>().map_err(|_| malformed())?;
        let epic = EpicId::parse(epic_part).map_err(|_| malformed())?;
        Self::new(epic, number).map_err(|_| malformed())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.epic, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StandaloneTaskId {
    project: String,
    number: u32,
}

impl StandaloneTaskId {
    pub fn new(project: impl Into<String>, number: u32) -> Result<Self, IdError> {
        let project = project.into();
        validate_project(&project)?;
        Ok(Self { project, number })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn parse(input: &str) -> Result<Self, IdError> {
        let malformed = || IdError::Malformed {
            kind: "standalone task",
            input: input.to_string(),
        };
        let (project, rest) = input.rsplit_once('-').ok_or_else(malformed)?;
        let digits = rest.strip_prefix('s').ok_or_else(malformed)?;
        let number = parse_padded(digits).ok_or_else(malformed)?;
        Self::new(project, number).map_err(|_| malformed())
    }
}

impl fmt::Display for StandaloneTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-s{:03}", self.project, self.number)
    }
}

macro_rules! string_conversions {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromStr for $ty {
                type Err = IdError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Self::parse(s)
                }
            }

            impl TryFrom<String> for $ty {
                type Error = IdError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    Self::parse(&value)
                }
            }

            impl From<$ty> for String {
                fn from(value: $ty) -> Self {
                    value.to_string()
                }
            }
        )*
    };
}

string_conversions!(SpecId, PlanId, EpicId, TaskId, StandaloneTaskId);

/// Any of the five id kinds, classified from a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AnyId {
    Spec(SpecId),
    Plan(PlanId),
    Epic(EpicId),
    Task(TaskId),
    Standalone(StandaloneTaskId),
}

impl AnyId {
    /// Classify `input`. A purely numeric suffix of four or more digits
    /// (`cub-1000`) is read as a spec id rather than a plan with a digit letter.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if let Ok(id) = TaskId::parse(input) {
            return Some(AnyId::Task(id));
        }
        if let Ok(id) = EpicId::parse(input) {
            return Some(AnyId::Epic(id));
        }
        if let Ok(id) = StandaloneTaskId::parse(input) {
            return Some(AnyId::Standalone(id));
        }
        if let Ok(id) = SpecId::parse(input) {
            return Some(AnyId::Spec(id));
        }
        PlanId::parse(input).ok().map(AnyId::Plan)
    }

    /// The spec this id belongs to; `None` for standalone tasks.
    pub fn spec(&self) -> Option<&SpecId> {
        match self {
            AnyId::Spec(id) => Some(id),
            AnyId::Plan(id) => Some(id.spec()),
            AnyId::Epic(id) => Some(id.spec()),
            AnyId::Task(id) => Some(id.spec()),
            AnyId::Standalone(_) => None,
        }
    }

    pub fn standalone_number(&self) -> Option<u32> {
        match self {
            AnyId::Standalone(id) => Some(id.number()),
            _ => None,
        }
    }
}

impl fmt::Display for AnyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyId::Spec(id) => id.fmt(f),
            AnyId::Plan(id) => id.fmt(f),
            AnyId::Epic(id) => id.fmt(f),
            AnyId::Task(id) => id.fmt(f),
            AnyId::Standalone(id) => id.fmt(f),
        }
    }
}
