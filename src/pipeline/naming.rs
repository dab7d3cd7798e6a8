//! NameResolver: maps D2L folder display names onto roster entries.
//!
//! Rules, first success wins:
//! 1. exact: normalized display name equals `first last`
//! 2. partial: display name contains both first and last name
//! 3. fuzzy: at least two shared name tokens (highest overlap wins)
//!
//! More than one winner within a rule is never resolved silently; the caller
//! gets the candidates back and must pick manually.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::archive::parse_folder_name;
use super::roster::{student_key, RosterEntry};

/// Minimum shared tokens for a fuzzy match.
pub const MIN_SHARED_TOKENS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Partial,
    Fuzzy,
    Unmatched,
}

impl MatchMethod {
    /// One-letter code used in watermarks.
    pub fn code(&self) -> char {
        match self {
            MatchMethod::Exact => 'E',
            MatchMethod::Partial => 'P',
            MatchMethod::Fuzzy => 'F',
            MatchMethod::Unmatched => 'U',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'E' => Some(MatchMethod::Exact),
            'P' => Some(MatchMethod::Partial),
            'F' => Some(MatchMethod::Fuzzy),
            'U' => Some(MatchMethod::Unmatched),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    /// Display name the rules ran against.
    pub raw_name: String,
    pub entry: Option<RosterEntry>,
    pub match_method: MatchMethod,
    /// Student keys tied for the match. Non-empty means manual resolution.
    pub ambiguous_candidates: Vec<String>,
    /// Resolved through the override table.
    pub manual: bool,
}

impl Resolution {
    fn unmatched(raw_name: &str) -> Self {
        Self {
            raw_name: raw_name.to_string(),
            entry: None,
            match_method: MatchMethod::Unmatched,
            ambiguous_candidates: Vec::new(),
            manual: false,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        !self.ambiguous_candidates.is_empty()
    }

    pub fn student_key(&self) -> Option<String> {
        self.entry.as_ref().map(RosterEntry::student_key)
    }
}

/// Lowercase and collapse whitespace.
pub fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Name tokens: split on whitespace and hyphens, punctuation trimmed.
pub fn tokens(name: &str) -> BTreeSet<String> {
    normalize(name)
        .split(|c: char| c.is_whitespace() || c == '-')
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Display name inside a D2L folder name, or the whole name.
pub fn display_name(raw_folder_name: &str) -> String {
    parse_folder_name(raw_folder_name)
        .map(|f| f.display_name)
        .unwrap_or_else(|| raw_folder_name.trim().to_string())
}

#[derive(Debug, Clone, Default)]
pub struct NameResolver {
    /// normalized display name -> student key
    overrides: HashMap<String, String>,
}

impl NameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a display name to a username, bypassing the matching rules.
    pub fn with_override(mut self, display_name: &str, username: &str) -> Self {
        self.overrides
            .insert(normalize(display_name), student_key(username));
        self
    }

    pub fn resolve(&self, raw_folder_name: &str, roster: &[RosterEntry]) -> Resolution {
        let raw = display_name(raw_folder_name);
        let norm = normalize(&raw);

        if let Some(key) = self.overrides.get(&norm) {
            match roster.iter().find(|e| &e.student_key() == key) {
                Some(entry) => {
                    return Resolution {
                        raw_name: raw,
                        entry: Some(entry.clone()),
                        match_method: MatchMethod::Exact,
                        ambiguous_candidates: Vec::new(),
                        manual: true,
                    }
                }
                None => tracing::warn!(
                    name = %raw,
                    username = %key,
                    "Override names a username not in the roster"
                ),
            }
        }

        let exact: Vec<&RosterEntry> = roster
            .iter()
            .filter(|e| normalize(&e.full_name()) == norm)
            .collect();
        if !exact.is_empty() {
            return pick(&raw, exact, MatchMethod::Exact);
        }

        let partial: Vec<&RosterEntry> = roster
            .iter()
            .filter(|e| {
                let first = normalize(&e.first_name);
                let last = normalize(&e.last_name);
                !first.is_empty() && !last.is_empty() && norm.contains(&first) && norm.contains(&last)
            })
            .collect();
        if !partial.is_empty() {
            return pick(&raw, partial, MatchMethod::Partial);
        }

        let raw_tokens = tokens(&raw);
        let scored: Vec<(usize, &RosterEntry)> = roster
            .iter()
            .map(|e| (tokens(&e.full_name()).intersection(&raw_tokens).count(), e))
            .filter(|(shared, _)| *shared >= MIN_SHARED_TOKENS)
            .collect();
        if let Some(best) = scored.iter().map(|(s, _)| *s).max() {
            let top = scored
                .into_iter()
                .filter(|(s, _)| *s == best)
                .map(|(_, e)| e)
                .collect();
            return pick(&raw, top, MatchMethod::Fuzzy);
        }

        Resolution::unmatched(&raw)
    }
}

fn pick(raw: &str, candidates: Vec<&RosterEntry>, method: MatchMethod) -> Resolution {
    if let [only] = candidates.as_slice() {
        return Resolution {
            raw_name: raw.to_string(),
            entry: Some((*only).clone()),
            match_method: method,
            ambiguous_candidates: Vec::new(),
            manual: false,
        };
    }
    let mut resolution = Resolution::unmatched(raw);
    resolution.ambiguous_candidates = candidates.iter().map(|e| e.student_key()).collect();
    resolution
}
