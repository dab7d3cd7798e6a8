//! SubmissionConsolidator: groups resolved folders per student.
//!
//! Output is one `StudentSubmissions` per roster entry, in roster order, so
//! page accounting stays 1:1 with the roster. Students without a usable PDF
//! become placeholders.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::Serialize;

use super::archive::RawEntry;
use super::naming::{MatchMethod, NameResolver};
use super::roster::RosterEntry;

pub const PLACEHOLDER_MARKER: &str = "PLACEHOLDER:NO_SUBMISSION";

/// One D2L folder after name resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionRecord {
    pub raw_folder_name: String,
    pub display_name: String,
    pub student_key: Option<String>,
    pub pdf_paths: Vec<String>,
    pub submitted_at: NaiveDateTime,
    pub match_method: MatchMethod,
    pub manual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentSubmissions {
    pub entry: RosterEntry,
    /// Weakest method among the student's folders.
    pub match_method: MatchMethod,
    /// Oldest first.
    pub submissions: Vec<SubmissionRecord>,
    pub latest_submitted_at: Option<NaiveDateTime>,
    pub placeholder: bool,
}

impl StudentSubmissions {
    pub fn student_key(&self) -> String {
        self.entry.student_key()
    }

    /// Every PDF in page order: folders oldest to newest, files by name.
    pub fn pdf_paths(&self) -> Vec<String> {
        self.submissions
            .iter()
            .flat_map(|s| s.pdf_paths.iter().cloned())
            .collect()
    }

    pub fn fuzzy_matched(&self) -> bool {
        self.match_method == MatchMethod::Fuzzy
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmbiguousSubmission {
    pub record: SubmissionRecord,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Consolidation {
    /// Roster order.
    pub students: Vec<StudentSubmissions>,
    pub unmatched: Vec<SubmissionRecord>,
    pub ambiguous: Vec<AmbiguousSubmission>,
    /// Keys with more than one submission folder.
    pub multiple_submissions: Vec<String>,
}

impl Consolidation {
    pub fn placeholders(&self) -> usize {
        self.students.iter().filter(|s| s.placeholder).count()
    }

    pub fn student(&self, key: &str) -> Option<&StudentSubmissions> {
        self.students.iter().find(|s| s.student_key() == key)
    }
}

fn strength(method: MatchMethod) -> u8 {
    match method {
        MatchMethod::Exact => 0,
        MatchMethod::Partial => 1,
        MatchMethod::Fuzzy => 2,
        MatchMethod::Unmatched => 3,
    }
}

pub fn consolidate(
    folders: &[RawEntry],
    roster: &[RosterEntry],
    resolver: &NameResolver,
) -> Consolidation {
    let mut result = Consolidation::default();
    let mut by_key: HashMap<String, Vec<SubmissionRecord>> = HashMap::new();

    for folder in folders {
        let resolution = resolver.resolve(&folder.folder_name, roster);
        let record = SubmissionRecord {
            raw_folder_name: folder.folder_name.clone(),
            display_name: folder.display_name.clone(),
            student_key: resolution.student_key(),
            pdf_paths: folder.pdf_paths.clone(),
            submitted_at: folder.submitted_at,
            match_method: resolution.match_method,
            manual: resolution.manual,
        };
        if let Some(key) = record.student_key.clone() {
            by_key.entry(key).or_default().push(record);
        } else if resolution.is_ambiguous() {
            result.ambiguous.push(AmbiguousSubmission {
                record,
                candidates: resolution.ambiguous_candidates,
            });
        } else {
            result.unmatched.push(record);
        }
    }

    for entry in roster {
        let key = entry.student_key();
        let mut submissions = by_key.remove(&key).unwrap_or_default();
        submissions.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.raw_folder_name.cmp(&b.raw_folder_name))
        });
        if submissions.len() > 1 {
            result.multiple_submissions.push(key.clone());
        }
        let match_method = submissions
            .iter()
            .map(|s| s.match_method)
            .max_by_key(|m| strength(*m))
            .unwrap_or(MatchMethod::Unmatched);
        let placeholder = submissions.iter().all(|s| s.pdf_paths.is_empty());

        result.students.push(StudentSubmissions {
            entry: entry.clone(),
            match_method,
            latest_submitted_at: submissions.iter().map(|s| s.submitted_at).max(),
            submissions,
            placeholder,
        });
    }

    tracing::info!(
        students = result.students.len(),
        placeholders = result.placeholders(),
        unmatched = result.unmatched.len(),
        ambiguous = result.ambiguous.len(),
        multiple = result.multiple_submissions.len(),
        "Submissions consolidated"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::archive::parse_folder_name;

    fn entry(username: &str, first: &str, last: &str, row: usize) -> RosterEntry {
        RosterEntry {
            org_defined_id: format!("#{row}"),
            username: format!("#{username}"),
            first_name: first.into(),
            last_name: last.into(),
            email: String::new(),
            grade_value: None,
            verify_flag: false,
            row_index: row,
        }
    }

    fn folder(name: &str, pdfs: &[&str]) -> RawEntry {
        let parsed = parse_folder_name(name).unwrap();
        RawEntry {
            folder_name: name.into(),
            display_name: parsed.display_name,
            submission_id: parsed.submission_id,
            submitted_at: parsed.submitted_at,
            relative_dir: format!("Lab/{name}"),
            pdf_paths: pdfs.iter().map(|p| format!("Lab/{name}/{p}")).collect(),
        }
    }

    #[test]
    fn groups_multiple_folders_oldest_first() {
        let roster = vec![entry("jdoe", "Jane", "Doe", 0)];
        let folders = vec![
            folder("2-1 - Jane Doe - Jan 6, 2024 900 AM", &["late.pdf"]),
            folder("1-1 - Jane Doe - Jan 5, 2024 900 AM", &["early.pdf"]),
        ];
        let c = consolidate(&folders, &roster, &NameResolver::new());
        let jane = c.student("jdoe").unwrap();
        assert_eq!(jane.submissions.len(), 2);
        assert!(jane.pdf_paths()[0].ends_with("early.pdf"));
        assert!(jane.pdf_paths()[1].ends_with("late.pdf"));
        assert_eq!(
            jane.latest_submitted_at,
            Some(folders[0].submitted_at)
        );
        assert_eq!(c.multiple_submissions, vec!["jdoe"]);
        assert!(!jane.placeholder);
    }

    #[test]
    fn roster_entries_without_folders_become_placeholders() {
        let roster = vec![
            entry("jdoe", "Jane", "Doe", 0),
            entry("bchan", "Bo", "Chan", 1),
        ];
        let folders = vec![folder("1-1 - Jane Doe - Jan 5, 2024 900 AM", &["a.pdf"])];
        let c = consolidate(&folders, &roster, &NameResolver::new());
        assert_eq!(c.students.len(), 2);
        assert_eq!(c.placeholders(), 1);
        let bo = c.student("bchan").unwrap();
        assert!(bo.placeholder);
        assert_eq!(bo.match_method, MatchMethod::Unmatched);
        assert!(bo.latest_submitted_at.is_none());
    }

    #[test]
    fn folder_without_pdf_is_placeholder_but_keeps_timestamp() {
        let roster = vec![entry("jdoe", "Jane", "Doe", 0)];
        let folders = vec![folder("1-1 - Jane Doe - Jan 5, 2024 900 AM", &[])];
        let c = consolidate(&folders, &roster, &NameResolver::new());
        let jane = c.student("jdoe").unwrap();
        assert!(jane.placeholder);
        assert!(jane.latest_submitted_at.is_some());
    }

    #[test]
    fn unmatched_and_ambiguous_are_excluded_not_dropped() {
        let roster = vec![
            entry("a", "Anne", "Carter-Lee", 0),
            entry("b", "Anne", "Carter-Ng", 1),
        ];
        let folders = vec![
            folder("1-1 - Anne Carter - Jan 5, 2024 900 AM", &["x.pdf"]),
            folder("2-2 - Zed Zulu - Jan 5, 2024 900 AM", &["y.pdf"]),
        ];
        let c = consolidate(&folders, &roster, &NameResolver::new());
        assert_eq!(c.students.len(), 2);
        assert_eq!(c.placeholders(), 2);
        assert_eq!(c.unmatched.len(), 1);
        assert_eq!(c.ambiguous.len(), 1);
        assert_eq!(c.ambiguous[0].candidates, vec!["a", "b"]);
    }

    #[test]
    fn weakest_method_wins() {
        let roster = vec![entry("ecarter", "Elizabeth Anne", "Carter", 0)];
        let folders = vec![
            folder("1-1 - Elizabeth Anne Carter - Jan 5, 2024 900 AM", &["a.pdf"]),
            folder("2-1 - Liz Anne Carter - Jan 6, 2024 900 AM", &["b.pdf"]),
        ];
        let c = consolidate(&folders, &roster, &NameResolver::new());
        assert!(c.students[0].fuzzy_matched());
    }
}
