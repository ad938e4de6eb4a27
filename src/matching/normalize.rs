// src/matching/normalize.rs
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::MatchError;

/// Word level replacements applied after punctuation is stripped.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("avenue", "ave"),
    ("boulevard", "blvd"),
    ("circle", "cir"),
    ("court", "ct"),
    ("drive", "dr"),
    ("highway", "hwy"),
    ("lane", "ln"),
    ("place", "pl"),
    ("road", "rd"),
    ("street", "st"),
    ("terrace", "ter"),
    ("northwest", "nw"),
    ("northeast", "ne"),
    ("southwest", "sw"),
    ("southeast", "se"),
    ("floor", "fl"),
];

// "po box", "p o box" and "p.o. box" (after stripping) all collapse to one token.
static PO_BOX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\bp ?o box\b").ok());

fn abbreviate(word: &str) -> &str {
    ABBREVIATIONS
        .iter()
        .find(|(long, _)| *long == word)
        .map_or(word, |(_, short)| *short)
}

/// Canonical form of a free-text street or name field.
///
/// Lower-cases, drops punctuation, collapses whitespace and applies the
/// abbreviation table. Never fails: garbage in yields (possibly empty) text out.
pub fn normalize(raw: &str) -> String {
    let stripped: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    let joined = stripped
        .split_whitespace()
        .map(abbreviate)
        .collect::<Vec<_>>()
        .join(" ");

    match PO_BOX.as_ref() {
        Some(re) => re.replace_all(&joined, "pobox").into_owned(),
        None => joined,
    }
}

/// Like [`normalize`] but without the address abbreviation table, for
/// person names and cities ("Court" is a surname, not a street suffix).
pub fn normalize_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Digits only, for phone numbers and zip codes.
pub fn normalize_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalized text that is known to be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedText(String);

impl NormalizedText {
    /// Normalizes `raw`, rejecting input that has nothing left to compare.
    pub fn parse(raw: &str) -> Result<Self, MatchError> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            Err(MatchError::Input(format!(
                "'{}' is empty after normalization",
                raw
            )))
        } else {
            Ok(NormalizedText(normalized))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
