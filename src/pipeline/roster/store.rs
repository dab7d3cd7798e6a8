//! RosterStore: owned state machine over the grade import CSV.
//!
//! `Unloaded → Loaded → ColumnsReconciled → GradesWritten → Persisted`.
//! Every mutation of the CSV goes through these transitions; other components
//! only read roster data via `entries()`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::csv::{parse_csv, write_csv, CsvDocument, LineEnding};
use super::persist::write_atomic;
use super::schema::{ImportFileSchema, END_OF_LINE_VALUE, VERIFY};
use super::RosterError;
use crate::config::RetrySettings;

/// Cell value written into the Verify column for rows needing review.
pub const VERIFY_MARK: &str = "Verify";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterState {
    Unloaded,
    Loaded,
    ColumnsReconciled,
    GradesWritten,
    Persisted,
}

/// How an existing grade column is treated when a new run writes grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeMode {
    /// Drop every existing grade column and start from one fresh column.
    Override,
    /// Keep non-blank grades; only fill blanks.
    KeepExisting,
}

/// Canonical student key: username without D2L's leading `#`, lowercased.
pub fn student_key(username: &str) -> String {
    username.trim().trim_start_matches('#').trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub org_defined_id: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub grade_value: Option<String>,
    pub verify_flag: bool,
    /// Position in the source CSV (0 = first data row).
    pub row_index: usize,
}

impl RosterEntry {
    pub fn student_key(&self) -> String {
        student_key(&self.username)
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
    }
}

/// One grade to apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeWrite {
    pub student_key: String,
    /// `None` leaves the cell blank.
    pub grade: Option<f64>,
    pub needs_verify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub grade_column: String,
    pub added_column: bool,
    pub removed_grade_columns: Vec<String>,
    pub removed_trailing: Vec<String>,
    pub repaired_rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteSummary {
    pub written: usize,
    /// Students whose non-blank grade was kept (KeepExisting mode).
    pub preserved: Vec<String>,
    /// Keys with no roster row.
    pub unknown: Vec<String>,
    pub verify_rows: usize,
    pub verify_column_added: bool,
}

pub fn format_grade(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let s = format!("{value:.2}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

pub struct RosterStore {
    state: RosterState,
    path: Option<PathBuf>,
    has_bom: bool,
    line_ending: LineEnding,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    schema: Option<ImportFileSchema>,
    index: HashMap<String, usize>,
    mode: Option<GradeMode>,
    grade_column: Option<usize>,
    retry: RetrySettings,
}

impl Default for RosterStore {
    fn default() -> Self {
        Self::new(RetrySettings::default())
    }
}

impl RosterStore {
    pub fn new(retry: RetrySettings) -> Self {
        Self {
            state: RosterState::Unloaded,
            path: None,
            has_bom: false,
            line_ending: LineEnding::Lf,
            header: Vec::new(),
            rows: Vec::new(),
            schema: None,
            index: HashMap::new(),
            mode: None,
            grade_column: None,
            retry,
        }
    }

    pub fn state(&self) -> RosterState {
        self.state
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema(&self) -> Option<&ImportFileSchema> {
        self.schema.as_ref()
    }

    fn require(&self, allowed: &[RosterState], operation: &'static str) -> Result<(), RosterError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RosterError::InvalidTransition {
                state: self.state,
                operation,
            })
        }
    }

    fn schema_ref(&self, operation: &'static str) -> Result<&ImportFileSchema, RosterError> {
        self.schema.as_ref().ok_or(RosterError::InvalidTransition {
            state: self.state,
            operation,
        })
    }

    // ─── Loaded ──────────────────────────────────────────────

    /// Parse the CSV at `path`. No file is modified.
    pub fn load(&mut self, path: &Path) -> Result<(), RosterError> {
        self.require(&[RosterState::Unloaded], "load")?;
        let text = std::fs::read_to_string(path)?;
        self.load_text(&text)?;
        self.path = Some(path.to_path_buf());
        tracing::info!(
            path = %path.display(),
            students = self.rows.len(),
            grade_columns = self.schema.as_ref().map(|s| s.grade_columns.len()).unwrap_or(0),
            "Roster loaded"
        );
        Ok(())
    }

    fn load_text(&mut self, text: &str) -> Result<(), RosterError> {
        let CsvDocument {
            mut records,
            has_bom,
            line_ending,
        } = parse_csv(text);
        if records.is_empty() {
            return Err(RosterError::Empty);
        }
        let header = records.remove(0);
        let schema = ImportFileSchema::resolve(&header)?;

        let rows: Vec<Vec<String>> = records
            .into_iter()
            .filter(|r| r.iter().any(|f| !f.trim().is_empty()))
            .collect();

        let mut index = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            let key = student_key(row.get(schema.username()).map(String::as_str).unwrap_or(""));
            if key.is_empty() {
                continue;
            }
            if index.insert(key.clone(), i).is_some() {
                return Err(RosterError::DuplicateUsername(key));
            }
        }

        self.has_bom = has_bom;
        self.line_ending = line_ending;
        self.header = header;
        self.rows = rows;
        self.schema = Some(schema);
        self.index = index;
        self.state = RosterState::Loaded;
        Ok(())
    }

    /// Roster entries in CSV row order.
    pub fn entries(&self) -> Vec<RosterEntry> {
        let Some(schema) = &self.schema else {
            return Vec::new();
        };
        let grade_col = self
            .grade_column
            .or_else(|| schema.grade_columns.last().copied());
        let cell = |row: &Vec<String>, idx: usize| row.get(idx).cloned().unwrap_or_default();

        self.rows
            .iter()
            .enumerate()
            .filter(|&(_, row)| !student_key(&cell(row, schema.username())).is_empty())
            .map(|(i, row)| RosterEntry {
                org_defined_id: cell(row, schema.identity[0]),
                username: cell(row, schema.identity[1]),
                first_name: cell(row, schema.identity[2]),
                last_name: cell(row, schema.identity[3]),
                email: cell(row, schema.identity[4]),
                grade_value: grade_col
                    .map(|c| cell(row, c))
                    .filter(|v| !v.trim().is_empty()),
                verify_flag: schema
                    .verify
                    .map(|c| !cell(row, c).trim().is_empty())
                    .unwrap_or(false),
                row_index: i,
            })
            .collect()
    }

    pub fn entry(&self, key: &str) -> Option<RosterEntry> {
        let row = *self.index.get(&student_key(key))?;
        self.entries().into_iter().find(|e| e.row_index == row)
    }

    // ─── ColumnsReconciled ───────────────────────────────────

    /// Repair leftovers from earlier runs and prepare the grade column.
    pub fn reconcile_columns(
        &mut self,
        grade_column_name: &str,
        mode: GradeMode,
    ) -> Result<ReconcileSummary, RosterError> {
        self.require(&[RosterState::Loaded], "reconcile columns")?;
        let schema = self.schema_ref("reconcile columns")?.clone();
        let mut summary = ReconcileSummary::default();

        // Anything after the indicator belongs to an earlier run (the Verify
        // column is recomputed for every run).
        let mut after: Vec<usize> = schema.trailing.clone();
        if let Some(v) = schema.verify {
            after.push(v);
        }
        summary.removed_trailing = after
            .iter()
            .filter(|&&idx| Some(idx) != schema.verify)
            .map(|&idx| self.header[idx].clone())
            .collect();
        self.remove_columns(&after);

        let width = self.header.len();
        for row in &mut self.rows {
            if row.len() != width {
                row.resize(width, String::new());
                summary.repaired_rows += 1;
            }
        }

        let mut schema = ImportFileSchema::resolve(&self.header)?;
        for row in &mut self.rows {
            if row[schema.indicator].trim().is_empty() {
                row[schema.indicator] = END_OF_LINE_VALUE.to_string();
            }
        }

        let target = match mode {
            GradeMode::Override => {
                summary.removed_grade_columns = schema
                    .grade_columns
                    .iter()
                    .map(|&idx| self.header[idx].clone())
                    .collect();
                let grade_cols = schema.grade_columns.clone();
                self.remove_columns(&grade_cols);
                schema = ImportFileSchema::resolve(&self.header)?;
                self.insert_column(schema.indicator, grade_column_name);
                summary.added_column = true;
                schema.indicator
            }
            GradeMode::KeepExisting => {
                let named = schema
                    .grade_columns
                    .iter()
                    .copied()
                    .find(|&idx| super::schema::header_matches(&self.header[idx], grade_column_name));
                match named.or_else(|| schema.grade_columns.last().copied()) {
                    Some(idx) => idx,
                    None => {
                        self.insert_column(schema.indicator, grade_column_name);
                        summary.added_column = true;
                        schema.indicator
                    }
                }
            }
        };

        let schema = ImportFileSchema::resolve(&self.header)?;
        summary.grade_column = self.header[target].clone();
        self.schema = Some(schema);
        self.grade_column = Some(target);
        self.mode = Some(mode);
        self.state = RosterState::ColumnsReconciled;

        tracing::info!(
            grade_column = %summary.grade_column,
            mode = ?mode,
            added = summary.added_column,
            removed_grade_columns = summary.removed_grade_columns.len(),
            removed_trailing = summary.removed_trailing.len(),
            repaired_rows = summary.repaired_rows,
            "Roster columns reconciled"
        );
        Ok(summary)
    }

    fn remove_columns(&mut self, columns: &[usize]) {
        let mut cols = columns.to_vec();
        cols.sort_unstable();
        cols.dedup();
        for &idx in cols.iter().rev() {
            if idx < self.header.len() {
                self.header.remove(idx);
            }
            for row in &mut self.rows {
                if idx < row.len() {
                    row.remove(idx);
                }
            }
        }
    }

    fn insert_column(&mut self, at: usize, name: &str) {
        self.header.insert(at, name.to_string());
        for row in &mut self.rows {
            let at = at.min(row.len());
            row.insert(at, String::new());
        }
    }

    // ─── GradesWritten ───────────────────────────────────────

    /// Apply grades. May be called more than once before persisting.
    pub fn write_grades(&mut self, writes: &[GradeWrite]) -> Result<WriteSummary, RosterError> {
        self.require(
            &[RosterState::ColumnsReconciled, RosterState::GradesWritten],
            "write grades",
        )?;
        let grade_col = self.grade_column.ok_or(RosterError::InvalidTransition {
            state: self.state,
            operation: "write grades",
        })?;
        let keep_existing = self.mode == Some(GradeMode::KeepExisting);
        let mut summary = WriteSummary::default();
        let mut verify_rows = Vec::new();

        for write in writes {
            let key = student_key(&write.student_key);
            let Some(&row_idx) = self.index.get(&key) else {
                summary.unknown.push(key);
                continue;
            };
            let row = &mut self.rows[row_idx];
            if keep_existing && !row[grade_col].trim().is_empty() {
                summary.preserved.push(key);
                continue;
            }
            if let Some(grade) = write.grade {
                row[grade_col] = format_grade(grade);
                summary.written += 1;
            }
            if write.needs_verify {
                verify_rows.push(row_idx);
            }
        }

        if !verify_rows.is_empty() {
            let indicator = self.schema_ref("write grades")?.indicator;
            let verify_col = match self.schema_ref("write grades")?.verify {
                Some(idx) => idx,
                None => {
                    self.insert_column(indicator + 1, VERIFY);
                    summary.verify_column_added = true;
                    indicator + 1
                }
            };
            for &row_idx in &verify_rows {
                self.rows[row_idx][verify_col] = VERIFY_MARK.to_string();
            }
            summary.verify_rows = verify_rows.len();
            self.schema = Some(ImportFileSchema::resolve(&self.header)?);
        }

        self.state = RosterState::GradesWritten;
        tracing::info!(
            written = summary.written,
            preserved = summary.preserved.len(),
            unknown = summary.unknown.len(),
            verify_rows = summary.verify_rows,
            "Grades applied to roster"
        );
        Ok(summary)
    }

    // ─── Persisted ───────────────────────────────────────────

    pub fn to_csv_string(&self) -> String {
        let mut records = Vec::with_capacity(self.rows.len() + 1);
        records.push(self.header.clone());
        records.extend(self.rows.iter().cloned());
        write_csv(&CsvDocument {
            records,
            has_bom: self.has_bom,
            line_ending: self.line_ending,
        })
    }

    /// Write the roster back to its original path. On `FileLocked` the state
    /// is unchanged and the call can be retried.
    pub fn persist(&mut self) -> Result<PathBuf, RosterError> {
        self.require(
            &[RosterState::ColumnsReconciled, RosterState::GradesWritten],
            "persist",
        )?;
        let path = self.path.clone().ok_or(RosterError::InvalidTransition {
            state: self.state,
            operation: "persist",
        })?;
        write_atomic(&path, self.to_csv_string().as_bytes(), &self.retry)?;
        self.state = RosterState::Persisted;
        tracing::info!(path = %path.display(), rows = self.rows.len(), "Roster persisted");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::roster::schema::{END_OF_LINE, VERIFY};

    const BASIC: &str = "OrgDefinedId,Username,First Name,Last Name,Email,End-of-Line Indicator\n\
                         #1001,#jdoe,Jane,Doe,jdoe@school.edu,#\n\
                         #1002,#asmith,Alan,Smith,asmith@school.edu,#\n\
                         #1003,#bchan,Bo,Chan,bchan@school.edu,#\n";

    const WITH_GRADES: &str = "OrgDefinedId,Username,First Name,Last Name,Email,Lab 1 Points Grade,End-of-Line Indicator,Verify,Junk\n\
                               #1001,#jdoe,Jane,Doe,jdoe@school.edu,7,#,Verify,x\n\
                               #1002,#asmith,Alan,Smith,asmith@school.edu,,#,,\n\
                               #1003,#bchan,Bo,Chan,bchan@school.edu,9.5\n";

    fn load(text: &str) -> (tempfile::TempDir, PathBuf, RosterStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.csv");
        std::fs::write(&path, text).unwrap();
        let mut store = RosterStore::new(RetrySettings::immediate(2));
        store.load(&path).unwrap();
        (dir, path, store)
    }

    fn write(key: &str, grade: Option<f64>, verify: bool) -> GradeWrite {
        GradeWrite {
            student_key: key.into(),
            grade,
            needs_verify: verify,
        }
    }

    #[test]
    fn load_builds_entries_in_row_order() {
        let (_dir, _path, store) = load(BASIC);
        assert_eq!(store.state(), RosterState::Loaded);
        let entries = store.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].student_key(), "jdoe");
        assert_eq!(entries[1].full_name(), "Alan Smith");
        assert_eq!(entries[2].row_index, 2);
        assert!(entries.iter().all(|e| e.grade_value.is_none()));
    }

    #[test]
    fn missing_email_fails_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.csv");
        let text = "OrgDefinedId,Username,First Name,Last Name,End-of-Line Indicator\n#1,#a,A,B,#\n";
        std::fs::write(&path, text).unwrap();

        let mut store = RosterStore::default();
        match store.load(&path) {
            Err(RosterError::MissingColumns(cols)) => assert_eq!(cols, vec!["Email"]),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(store.state(), RosterState::Unloaded);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }

    #[test]
    fn duplicate_usernames_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.csv");
        std::fs::write(
            &path,
            "OrgDefinedId,Username,First Name,Last Name,Email,End-of-Line Indicator\n\
             #1,#jdoe,Jane,Doe,a@x,#\n#2,#JDOE,J,Doe,b@x,#\n",
        )
        .unwrap();
        let mut store = RosterStore::default();
        assert!(matches!(
            store.load(&path),
            Err(RosterError::DuplicateUsername(_))
        ));
    }

    #[test]
    fn out_of_order_transitions_rejected() {
        let mut store = RosterStore::default();
        assert!(matches!(
            store.write_grades(&[]),
            Err(RosterError::InvalidTransition { state: RosterState::Unloaded, .. })
        ));
        let (_dir, _path, mut store) = load(BASIC);
        assert!(matches!(
            store.persist(),
            Err(RosterError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn override_replaces_grade_columns_and_drops_trailing() {
        let (_dir, _path, mut store) = load(WITH_GRADES);
        let summary = store
            .reconcile_columns("Lab 2 Points Grade", GradeMode::Override)
            .unwrap();

        assert!(summary.added_column);
        assert_eq!(summary.removed_grade_columns, vec!["Lab 1 Points Grade"]);
        assert_eq!(summary.removed_trailing, vec!["Junk"]);
        assert_eq!(summary.repaired_rows, 1);

        let schema = store.schema().unwrap();
        assert_eq!(schema.headers[5], "Lab 2 Points Grade");
        assert_eq!(schema.headers[6], END_OF_LINE);
        assert_eq!(schema.width(), 7);
        assert!(store.entries().iter().all(|e| e.grade_value.is_none()));
        assert!(store.entries().iter().all(|e| !e.verify_flag));
    }

    #[test]
    fn keep_existing_preserves_non_blank_grades() {
        let (_dir, _path, mut store) = load(WITH_GRADES);
        let before: Vec<_> = store.entries();
        store
            .reconcile_columns("Lab 1 Points Grade", GradeMode::KeepExisting)
            .unwrap();
        let summary = store
            .write_grades(&[
                write("jdoe", Some(3.0), false),
                write("asmith", Some(8.0), false),
                write("bchan", Some(1.0), true),
            ])
            .unwrap();

        assert_eq!(summary.written, 1);
        assert_eq!(summary.preserved, vec!["jdoe", "bchan"]);
        // Preserved rows are not flagged either
        assert_eq!(summary.verify_rows, 0);

        let after = store.entries();
        for (b, a) in before.iter().zip(after.iter()) {
            if b.grade_value.is_some() {
                assert_eq!(b.grade_value, a.grade_value);
            }
        }
        assert_eq!(store.entry("asmith").unwrap().grade_value.as_deref(), Some("8"));
    }

    #[test]
    fn keep_existing_adds_column_only_when_none_exists() {
        let (_dir, _path, mut store) = load(BASIC);
        let summary = store
            .reconcile_columns("Quiz Points Grade", GradeMode::KeepExisting)
            .unwrap();
        assert!(summary.added_column);
        assert_eq!(store.schema().unwrap().grade_columns, vec![5]);

        let (_dir, _path, mut store) = load(WITH_GRADES);
        let summary = store
            .reconcile_columns("Other Points Grade", GradeMode::KeepExisting)
            .unwrap();
        assert!(!summary.added_column);
        assert_eq!(summary.grade_column, "Lab 1 Points Grade");
    }

    #[test]
    fn verify_column_inserted_after_indicator() {
        let (_dir, _path, mut store) = load(BASIC);
        store
            .reconcile_columns("HW Points Grade", GradeMode::Override)
            .unwrap();
        let summary = store
            .write_grades(&[
                write("jdoe", Some(8.5), true),
                write("asmith", Some(10.0), false),
                write("ghost", Some(1.0), false),
            ])
            .unwrap();

        assert!(summary.verify_column_added);
        assert_eq!(summary.unknown, vec!["ghost"]);
        let schema = store.schema().unwrap();
        assert_eq!(schema.verify, Some(schema.indicator + 1));
        assert_eq!(schema.headers[schema.indicator + 1], VERIFY);

        let entries = store.entries();
        assert_eq!(entries[0].grade_value.as_deref(), Some("8.5"));
        assert!(entries[0].verify_flag);
        assert!(!entries[1].verify_flag);
    }

    #[test]
    fn no_verify_column_when_nothing_needs_review() {
        let (_dir, _path, mut store) = load(BASIC);
        store.reconcile_columns("HW", GradeMode::Override).unwrap();
        store.write_grades(&[write("jdoe", Some(5.0), false)]).unwrap();
        assert_eq!(store.schema().unwrap().verify, None);
    }

    #[test]
    fn persist_round_trips_through_disk() {
        let (_dir, path, mut store) = load(BASIC);
        store.reconcile_columns("HW Points Grade", GradeMode::Override).unwrap();
        store.write_grades(&[write("bchan", Some(6.0), true)]).unwrap();
        store.persist().unwrap();
        assert_eq!(store.state(), RosterState::Persisted);

        let mut reloaded = RosterStore::default();
        reloaded.load(&path).unwrap();
        let entry = reloaded.entry("#bchan").unwrap();
        assert_eq!(entry.grade_value.as_deref(), Some("6"));
        assert!(entry.verify_flag);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("OrgDefinedId,Username,First Name,Last Name,Email,HW Points Grade,End-of-Line Indicator,Verify\n"));
    }

    #[test]
    fn locked_persist_leaves_disk_unchanged_and_retry_succeeds() {
        let (dir, path, mut store) = load(BASIC);
        store.reconcile_columns("HW", GradeMode::Override).unwrap();
        store.write_grades(&[write("jdoe", Some(4.0), false)]).unwrap();

        let lock = dir.path().join(".~lock.roster.csv#");
        std::fs::write(&lock, "").unwrap();
        assert!(matches!(store.persist(), Err(RosterError::FileLocked { .. })));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), BASIC);
        assert_eq!(store.state(), RosterState::GradesWritten);

        std::fs::remove_file(&lock).unwrap();
        store.persist().unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains(",4,#"));
    }

    #[test]
    fn format_grade_trims_trailing_zeros() {
        assert_eq!(format_grade(8.0), "8");
        assert_eq!(format_grade(8.5), "8.5");
        assert_eq!(format_grade(7.25), "7.25");
        assert_eq!(format_grade(0.0), "0");
    }

    #[test]
    fn student_key_strips_hash_and_case() {
        assert_eq!(student_key(" #JDoe "), "jdoe");
        assert_eq!(student_key("plain"), "plain");
    }
}
