use once_cell::sync::Lazy;
use regex::Regex;

use super::capitalize;

static LETTER_HYPHEN_LETTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\p{L})\s*-\s*(\p{L})").expect("valid regex"));

/// Street (lazy), house number or range ("12", "68 - 70", "12/14") and an optional
/// single letter suffix.
static STREET_AND_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.*?)(\d+(?:\s*[-/]\s*\d+)?)(?:\s*([a-zA-Z]))?$").expect("valid regex")
});

static RANGE_DASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*-\s*").expect("valid regex"));
static RANGE_SLASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*/\s*").expect("valid regex"));

/// Spellings of "Straße", checked longest first.
const STREET_WORDS: [&str; 4] = ["strasse", "straße", "str.", "str"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreetParts {
    pub street: Option<String>,
    pub house_number: Option<String>,
    pub suffix: Option<String>,
}

/// Split a raw street line into street name, house number and suffix.
///
/// Whitespace around hyphens between letters is dropped, "strasse"/"str." spellings become
/// "Straße" and every word is title-cased. Input without a trailing house number cannot be
/// split and yields an all-empty result, which the error classifier later reports as a
/// changed address.
pub fn normalize_street(raw: &str) -> StreetParts {
    let collapsed = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(',', "");
    if collapsed.is_empty() {
        return StreetParts::default();
    }

    let joined = LETTER_HYPHEN_LETTER.replace_all(&collapsed, "$1-$2");

    let Some(captures) = STREET_AND_NUMBER.captures(&joined) else {
        return StreetParts::default();
    };

    let street = captures
        .get(1)
        .map(|m| canonical_street_name(m.as_str()))
        .filter(|street| !street.is_empty());
    let house_number = captures.get(2).map(|m| clean_house_number(m.as_str()));
    let suffix = captures.get(3).map(|m| m.as_str().to_lowercase());

    StreetParts {
        street,
        house_number,
        suffix,
    }
}

fn canonical_street_name(street: &str) -> String {
    street
        .trim()
        .trim_end_matches('.')
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .split('-')
                .map(canonical_street_segment)
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn canonical_street_segment(segment: &str) -> String {
    let lower = segment.to_lowercase();
    if STREET_WORDS.contains(&lower.as_str()) {
        return "Straße".to_owned();
    }

    for word in STREET_WORDS {
        if let Some(stem) = lower.strip_suffix(word) {
            let letters = stem.chars().rev().take(3).filter(|c| c.is_alphabetic());
            if letters.count() == 3 {
                return capitalize(&format!("{stem}straße"));
            }
        }
    }

    capitalize(&lower)
}

fn clean_house_number(house_number: &str) -> String {
    let lower = house_number.to_lowercase();
    let dashed = RANGE_DASH.replace_all(&lower, "-");
    let slashed = RANGE_SLASH.replace_all(&dashed, "/");
    slashed.split_whitespace().collect::<Vec<_>>().join(" ")
}
