//! Ordered character alphabets for plan letters and epic chars.

use std::collections::HashSet;

use thiserror::Error;

/// Plan letters in allocation order.
pub const PLAN_LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
/// Epic chars in allocation order.
pub const EPIC_CHARS: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("All {capacity} {kind} slots are in use")]
    Exhausted { kind: &'static str, capacity: usize },
}

pub fn is_plan_letter(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
}

pub fn is_epic_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
}

fn first_unused(alphabet: &str, used: &HashSet<char>, kind: &'static str) -> Result<char, SequenceError> {
    alphabet
        .chars()
        .find(|ch| !used.contains(ch))
        .ok_or(SequenceError::Exhausted {
            kind,
            capacity: alphabet.len(),
        })
}

/// First plan letter not in `used`. Gaps are filled before later letters.
pub fn next_plan_letter(used: &HashSet<char>) -> Result<char, SequenceError> {
    first_unused(PLAN_LETTERS, used, "plan letter")
}

pub fn next_epic_char(used: &HashSet<char>) -> Result<char, SequenceError> {
    first_unused(EPIC_CHARS, used, "epic char")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_letters_fill_uppercase_then_lowercase_then_digits() {
        assert_eq!(next_plan_letter(&HashSet::new()), Ok('A'));
        assert_eq!(next_plan_letter(&HashSet::from(['A', 'B'])), Ok('C'));
        assert_eq!(next_plan_letter(&HashSet::from(['A', 'C'])), Ok('B'));

        let upper: HashSet<char> = ('A'..='Z').collect();
        assert_eq!(next_plan_letter(&upper), Ok('a'));
        let letters: HashSet<char> = ('A'..='Z').chain('a'..='z').collect();
        assert_eq!(next_plan_letter(&letters), Ok('0'));
    }

    #[test]
    fn epic_chars_fill_digits_then_lowercase_then_uppercase() {
        assert_eq!(next_epic_char(&HashSet::new()), Ok('0'));
        let digits: HashSet<char> = ('0'..='9').collect();
        assert_eq!(next_epic_char(&digits), Ok('a'));
        let lower: HashSet<char> = ('0'..='9').chain('a'..='z').collect();
        assert_eq!(next_epic_char(&lower), Ok('A'));
    }

    #[test]
    fn full_alphabets_are_exhausted() {
        let all_plans: HashSet<char> = PLAN_LETTERS.chars().collect();
        assert_eq!(
            next_plan_letter(&all_plans),
            Err(SequenceError::Exhausted {
                kind: "plan letter",
                capacity: 62
            })
        );
        let all_epics: HashSet<char> = EPIC_CHARS.chars().collect();
        assert!(matches!(
            next_epic_char(&all_epics),
            Err(SequenceError::Exhausted { capacity: 62, .. })
        ));
    }

    #[test]
    fn unrelated_characters_do_not_consume_slots() {
        let used = HashSet::from(['-', 'é', '!']);
        assert_eq!(next_plan_letter(&used), Ok('A'));
        assert_eq!(next_epic_char(&used), Ok('0'));
        assert!(!is_plan_letter('-'));
        assert!(!is_epic_char('é'));
    }
}
