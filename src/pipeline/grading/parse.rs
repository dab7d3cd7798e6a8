//! Grade parsing and confidence classification.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Confidence bands for OCR'd grades.
pub mod thresholds {
    /// At or above: grade accepted as read.
    pub const ACCEPT: f32 = 0.70;

    /// At or above (and below ACCEPT): grade written, flagged for review.
    pub const REVIEW: f32 = 0.40;
}

/// `8/10`, `7.5 / 10`, `9 out of 10`.
static FRACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,3}(?:\.\d{1,2})?)\s*(?:/|out\s+of)\s*(\d{1,3}(?:\.\d{1,2})?)\b").unwrap()
});

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3}(?:\.\d{1,2})?)\b").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedGrade {
    pub value: f64,
    pub denominator: Option<f64>,
    /// Distinct plausible grades seen in the text.
    pub candidates: usize,
    /// The text is nothing but the grade.
    pub whole_text: bool,
}

impl ParsedGrade {
    pub fn exceeds_denominator(&self) -> bool {
        self.denominator.is_some_and(|d| self.value > d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    Accepted,
    LowConfidence,
    NoGradeFound,
}

/// Exact banding: 0.7 and 0.4 belong to the upper band.
pub fn classify(confidence: f32) -> ConfidenceBand {
    if confidence >= thresholds::ACCEPT {
        ConfidenceBand::Accepted
    } else if confidence >= thresholds::REVIEW {
        ConfidenceBand::LowConfidence
    } else {
        ConfidenceBand::NoGradeFound
    }
}

fn char_before(text: &str, idx: usize) -> Option<char> {
    text[..idx].chars().next_back()
}

fn char_after(text: &str, idx: usize) -> Option<char> {
    text[idx..].chars().next()
}

/// Numbers glued to dates, times, ids or decimals are not grades.
fn is_isolated(text: &str, start: usize, end: usize) -> bool {
    let before = char_before(text, start);
    let after = char_after(text, end);
    let next_is_digit = text[end..].chars().nth(1).is_some_and(|c| c.is_ascii_digit());
    let prev_is_digit = start >= 2
        && text[..start]
            .chars()
            .rev()
            .nth(1)
            .is_some_and(|c| c.is_ascii_digit());

    !matches!(before, Some(':') | Some('-') | Some('#'))
        && !(matches!(before, Some('/') | Some('.') | Some(',')) && prev_is_digit)
        && !matches!(after, Some(':'))
        && !(matches!(after, Some('/') | Some('.') | Some(',') | Some('-')) && next_is_digit)
}

fn push_distinct(values: &mut Vec<f64>, v: f64) {
    if !values.iter().any(|x| (x - v).abs() < f64::EPSILON) {
        values.push(v);
    }
}

/// Find the grade in OCR text. Fractions win over bare numbers.
pub fn parse_grade(text: &str) -> Option<ParsedGrade> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut fractions: Vec<(f64, f64, usize, usize)> = Vec::new();
    for caps in FRACTION.captures_iter(trimmed) {
        let whole = caps.get(0)?;
        if !is_isolated(trimmed, whole.start(), whole.end()) {
            continue;
        }
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let denominator: f64 = caps.get(2)?.as_str().parse().ok()?;
        if denominator > 0.0 {
            fractions.push((value, denominator, whole.start(), whole.end()));
        }
    }

    if let Some(&(value, denominator, start, end)) = fractions.first() {
        let mut distinct = Vec::new();
        for (v, _, _, _) in &fractions {
            push_distinct(&mut distinct, *v);
        }
        return Some(ParsedGrade {
            value,
            denominator: Some(denominator),
            candidates: distinct.len(),
            whole_text: start == 0 && end == trimmed.len(),
        });
    }

    let mut numbers: Vec<(f64, usize, usize)> = Vec::new();
    for m in NUMBER.find_iter(trimmed) {
        if !is_isolated(trimmed, m.start(), m.end()) {
            continue;
        }
        if let Ok(value) = m.as_str().parse::<f64>() {
            numbers.push((value, m.start(), m.end()));
        }
    }
    let &(value, start, end) = numbers.first()?;
    let mut distinct = Vec::new();
    for (v, _, _) in &numbers {
        push_distinct(&mut distinct, *v);
    }
    // A trailing percent sign still counts as the whole text.
    let rest = trimmed[end..].trim();
    Some(ParsedGrade {
        value,
        denominator: None,
        candidates: distinct.len(),
        whole_text: start == 0 && (rest.is_empty() || rest == "%"),
    })
}

/// Confidence for backends without a native score, from how cleanly the
/// grade stood out in the text.
pub fn heuristic_confidence(parsed: Option<&ParsedGrade>) -> f32 {
    match parsed {
        None => 0.0,
        Some(p) if p.candidates > 1 => 0.45,
        Some(p) if p.denominator.is_some() => 0.9,
        Some(p) if p.whole_text => 0.8,
        Some(_) => 0.55,
    }
}
