//! Care level ("Pflegegrad") and visit rhythm ("Besuchsrhythmus").
//!
//! The two fields determine each other: every care level has a fixed review interval. When an
//! export only carries one of them, the other one is filled in from the table and marked with
//! [`INFERRED_MARKER`] so the error classifier can tell supplied values from inferred ones.
use once_cell::sync::Lazy;
use regex::Regex;

pub const INFERRED_MARKER: char = '*';

static GRADE_AFTER_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)pflege\D{0,16}?([1-5])").expect("valid regex"));
static GRADE_BEFORE_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([1-5])\D{0,16}?pflege").expect("valid regex"));
static LEADING_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d+)").expect("valid regex"));

/// Review interval in months for a care level.
pub fn expected_rhythm_months(grade: u8) -> Option<u32> {
    match grade {
        1..=3 => Some(6),
        4 | 5 => Some(3),
        _ => None,
    }
}

/// Care level assumed for a customer of whom only the rhythm is known.
fn inferred_grade(months: u32) -> Option<u8> {
    match months {
        6 => Some(2),
        3 => Some(4),
        _ => None,
    }
}

/// Find a grade digit 1-5 next to the word "Pflege" in free text.
pub fn parse_care_grade(raw: &str) -> Option<u8> {
    GRADE_AFTER_WORD
        .captures(raw)
        .or_else(|| GRADE_BEFORE_WORD.captures(raw))
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Map rhythm text to a month count: half-yearly or quarterly.
pub fn parse_rhythm_months(raw: &str) -> Option<u32> {
    let lower = raw.to_lowercase();
    if lower.contains('6') || lower.contains("halb") {
        Some(6)
    } else if lower.contains('3') || lower.contains("viertel") {
        Some(3)
    } else {
        None
    }
}

pub fn care_level_label(grade: u8) -> String {
    format!("Pflegegrad {grade}")
}

pub fn rhythm_label(months: u32) -> String {
    format!("{months} Monate")
}

/// Canonicalize both fields, inferring the missing one when exactly one is usable.
pub fn normalize_care_and_rhythm(
    care_level: Option<&str>,
    rhythm: Option<&str>,
) -> (Option<String>, Option<String>) {
    let grade = care_level.and_then(parse_care_grade);
    let months = rhythm.and_then(parse_rhythm_months);

    match (grade, months) {
        (Some(grade), Some(months)) => (Some(care_level_label(grade)), Some(rhythm_label(months))),
        (Some(grade), None) => {
            let inferred = expected_rhythm_months(grade)
                .map(|months| format!("{}{INFERRED_MARKER}", rhythm_label(months)));
            (Some(care_level_label(grade)), inferred)
        }
        (None, Some(months)) => {
            let inferred = inferred_grade(months)
                .map(|grade| format!("{}{INFERRED_MARKER}", care_level_label(grade)));
            (inferred, Some(rhythm_label(months)))
        }
        (None, None) => (None, None),
    }
}

pub fn is_inferred(value: &str) -> bool {
    value.ends_with(INFERRED_MARKER)
}

/// Whether a (possibly inferred) care level and rhythm agree with the fixed table.
/// Values that cannot be read are not considered inconsistent.
pub fn is_consistent(care_level: &str, rhythm: &str) -> bool {
    let grade = parse_care_grade(care_level.trim_end_matches(INFERRED_MARKER));
    let months = LEADING_NUMBER
        .captures(rhythm.trim_end_matches(INFERRED_MARKER))
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok());

    match (grade.and_then(expected_rhythm_months), months) {
        (Some(expected), Some(months)) => expected == months,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_care_grade() {
        assert_eq!(parse_care_grade("Pflegegrad 3"), Some(3));
        assert_eq!(parse_care_grade("pflegegrad4"), Some(4));
        assert_eq!(parse_care_grade("PG 3 Pflege"), Some(3));
        assert_eq!(parse_care_grade("Pflegegrad"), None);
        assert_eq!(parse_care_grade("Grad 3"), None);
        assert_eq!(parse_care_grade("Pflegegrad 7"), None);
    }

    #[test]
    fn test_parse_rhythm_months() {
        assert_eq!(parse_rhythm_months("halbjährlich"), Some(6));
        assert_eq!(parse_rhythm_months("6 Monate"), Some(6));
        assert_eq!(parse_rhythm_months("vierteljährlich"), Some(3));
        assert_eq!(parse_rhythm_months("alle 3 Monate"), Some(3));
        assert_eq!(parse_rhythm_months("monatlich"), None);
    }

    #[test]
    fn test_both_supplied() {
        assert_eq!(
            normalize_care_and_rhythm(Some("Pflegegrad 2"), Some("halbjährlich")),
            (Some("Pflegegrad 2".to_owned()), Some("6 Monate".to_owned()))
        );
    }

    #[test]
    fn test_rhythm_inferred_from_care_level() {
        assert_eq!(
            normalize_care_and_rhythm(Some("Pflegegrad 4"), None),
            (Some("Pflegegrad 4".to_owned()), Some("3 Monate*".to_owned()))
        );
        assert_eq!(
            normalize_care_and_rhythm(Some("Pflegegrad 1"), Some("")),
            (Some("Pflegegrad 1".to_owned()), Some("6 Monate*".to_owned()))
        );
    }

    #[test]
    fn test_care_level_inferred_from_rhythm() {
        assert_eq!(
            normalize_care_and_rhythm(None, Some("vierteljährlich")),
            (Some("Pflegegrad 4*".to_owned()), Some("3 Monate".to_owned()))
        );
        assert_eq!(
            normalize_care_and_rhythm(Some("unbekannt"), Some("6 Monate")),
            (Some("Pflegegrad 2*".to_owned()), Some("6 Monate".to_owned()))
        );
    }

    #[test]
    fn test_neither_supplied() {
        assert_eq!(normalize_care_and_rhythm(None, None), (None, None));
        assert_eq!(
            normalize_care_and_rhythm(Some("keine Angabe"), Some("monatlich")),
            (None, None)
        );
    }

    #[test]
    fn test_is_consistent() {
        assert!(is_consistent("Pflegegrad 2", "6 Monate"));
        assert!(is_consistent("Pflegegrad 5", "3 Monate*"));
        assert!(!is_consistent("Pflegegrad 2", "3 Monate"));
        assert!(!is_consistent("Pflegegrad 4", "6 Monate"));
    }
}
