//! Orchestrator: runs the pipeline stages for one class.
//!
//! Operations:
//! - `process`: roster check, archive validation, backup, extraction,
//!   consolidation, combined PDF
//! - `extract`: OCR grades off the graded PDF into the roster CSV
//! - `split`: graded PDF back into submission files and the upload ZIP
//! - `clear`: archive the working files of a finished run
//! - `complete`: completion grading from submission timestamps
//!
//! Every operation returns a `StageResult`. Per-student problems become
//! events; only structural failures fail the stage. File-system mutations
//! run in sequence under `&mut self`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::Instrument;

use super::archive::{self, ArchiveError, ArchiveWarning};
use super::backup::{ArchivedItem, BackupError, BackupManager};
use super::combine::{self, CombineError, PageMap, SIDECAR_EXTENSION};
use super::consolidate::{consolidate, Consolidation};
use super::grading::{GradeError, GradeExtractionResult, GradeExtractor, GradeStatus};
use super::naming::NameResolver;
use super::report::RunReport;
use super::roster::{
    GradeMode, GradeWrite, ReconcileSummary, RosterEntry, RosterError, RosterStore, WriteSummary,
};
use super::split::{
    upload_zip_name, IndexFidelity, PageMapSource, SplitContext, SplitError, SplitOutcome,
    SplitRezipEngine, WatermarkOcr,
};
use crate::config::{self, ClassPaths, ConfigError, ConfigProvider, GraderSettings};
use crate::events::{codes, EventLog, EventSink, StageResult};

/// Appended to the assignment name for the combined PDF.
const COMBINED_SUFFIX: &str = " Combined";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Roster(#[from] RosterError),

    #[error(transparent)]
    Combine(#[from] CombineError),

    #[error(transparent)]
    Grade(#[from] GradeError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No roster CSV found in {}", .0.display())]
    NoRoster(PathBuf),

    #[error("No D2L download ZIP found in {}", .0.display())]
    NoDownload(PathBuf),

    #[error("Nothing has been processed yet: {} does not exist", .0.display())]
    NotProcessed(PathBuf),

    #[error("No completion points given and none configured")]
    NoCompletionPoints,
}

impl PipelineError {
    /// Event code reported when this error fails a stage.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Archive(ArchiveError::Malformed(_)) => codes::ERR_MALFORMED_ARCHIVE,
            Self::Roster(RosterError::MissingColumns(_)) => codes::ERR_MISSING_COLUMNS,
            Self::Roster(RosterError::FileLocked { .. })
            | Self::Backup(BackupError::Locked { .. })
            | Self::Split(SplitError::Backup(BackupError::Locked { .. })) => codes::ERR_FILE_LOCKED,
            _ => codes::ERR_STAGE_FAILED,
        }
    }

    pub fn data(&self) -> serde_json::Value {
        match self {
            Self::Roster(RosterError::MissingColumns(missing)) => json!({ "missing": missing }),
            Self::Roster(RosterError::FileLocked { path, attempts, .. }) => {
                json!({ "path": path, "attempts": attempts })
            }
            Self::Backup(BackupError::Locked { path, .. })
            | Self::Split(SplitError::Backup(BackupError::Locked { path, .. })) => {
                json!({ "path": path })
            }
            _ => serde_json::Value::Null,
        }
    }

    /// Safe to run the same operation again once the external lock is gone.
    pub fn is_retryable(&self) -> bool {
        self.code() == codes::ERR_FILE_LOCKED
    }
}

// ---------------------------------------------------------------------------
// Requests and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub assignment_name: String,
    pub source_zip: PathBuf,
    pub combined_pdf: PathBuf,
    pub page_map_path: PathBuf,
    pub page_map: PageMap,
    pub placeholders: usize,
    pub archived: Vec<ArchivedItem>,
    pub report: RunReport,
}

#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub grade_column: String,
    pub mode: GradeMode,
    /// Defaults to the combined PDF written by `process`.
    pub graded_pdf: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractOutcome {
    pub graded_pdf: PathBuf,
    pub page_map_source: PageMapSource,
    pub results: Vec<GradeExtractionResult>,
    pub columns: ReconcileSummary,
    pub written: WriteSummary,
    pub roster_path: PathBuf,
    pub report: RunReport,
}

/// Grades read off a graded PDF that have not reached the roster yet.
/// Kept in the processing folder so a retry after a locked roster skips OCR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingGrades {
    pub pdf_sha256: String,
    pub page_map_source: PageMapSource,
    pub results: Vec<GradeExtractionResult>,
}

impl PendingGrades {
    const FILE: &'static str = "pending_grades.json";

    pub fn path(processing: &Path) -> PathBuf {
        processing.join(archive::STATE_DIR).join(Self::FILE)
    }

    /// Saved grades for the PDF with this digest. A file left by another
    /// PDF, or one that no longer parses, is ignored.
    pub fn load_for(processing: &Path, pdf_sha256: &str) -> Option<Self> {
        let path = Self::path(processing);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<Self>(&bytes) {
            Ok(pending) if pending.pdf_sha256 == pdf_sha256 => Some(pending),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable pending grades");
                None
            }
        }
    }

    pub fn save(&self, processing: &Path) -> Result<(), PipelineError> {
        let path = Self::path(processing);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn discard(processing: &Path) {
        let path = Self::path(processing);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Could not remove pending grades");
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RezipOutcome {
    pub split: SplitOutcome,
    pub report: RunReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearOutcome {
    pub archived: Vec<ArchivedItem>,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub grade_column: String,
    pub mode: GradeMode,
    /// Falls back to `completion_points` from the settings.
    pub points: Option<f64>,
    /// Submissions whose newest folder is after this are flagged for review.
    pub due: Option<NaiveDateTime>,
    /// Read submissions from this download instead of the processing folder.
    pub source_zip: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub points: f64,
    pub graded: Vec<String>,
    pub late: Vec<String>,
    pub no_submission: Vec<String>,
    pub written: WriteSummary,
    pub roster_path: PathBuf,
    pub report: RunReport,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<downloads>/<Assignment> Combined.pdf`
pub fn combined_pdf_path(downloads: &Path, assignment: &str) -> PathBuf {
    downloads.join(format!("{assignment}{COMBINED_SUFFIX}.pdf"))
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn is_lock_file(name: &str) -> bool {
    name.starts_with("~$") || name.starts_with(".~lock.")
}

fn files_in(folder: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(folder) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files
}

/// The roster import CSV in `folder` (first by name, lock files ignored).
pub fn find_roster(folder: &Path) -> Result<PathBuf, PipelineError> {
    files_in(folder)
        .into_iter()
        .find(|p| has_extension(p, "csv") && !file_name(p).is_some_and(is_lock_file))
        .ok_or_else(|| PipelineError::NoRoster(folder.to_path_buf()))
}

/// Newest D2L download in `folder`; upload packages written earlier are skipped.
pub fn find_download(folder: &Path) -> Result<PathBuf, PipelineError> {
    let graded_suffix = upload_zip_name("");
    files_in(folder)
        .into_iter()
        .filter(|p| has_extension(p, "zip"))
        .filter(|p| !file_name(p).is_some_and(|n| n.ends_with(&graded_suffix)))
        .filter_map(|p| {
            let modified = p.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max()
        .map(|(_, p)| p)
        .ok_or_else(|| PipelineError::NoDownload(folder.to_path_buf()))
}

/// Combined PDFs and their sidecars in the downloads folder.
fn combined_artifacts(downloads: &Path) -> Vec<PathBuf> {
    let pdf_suffix = format!("{COMBINED_SUFFIX}.pdf");
    let sidecar_suffix = format!("{COMBINED_SUFFIX}.{SIDECAR_EXTENSION}");
    files_in(downloads)
        .into_iter()
        .filter(|p| {
            file_name(p).is_some_and(|n| n.ends_with(&pdf_suffix) || n.ends_with(&sidecar_suffix))
        })
        .collect()
}

fn processed_folder(paths: &ClassPaths) -> Result<PathBuf, PipelineError> {
    if paths.processing_folder.is_dir() {
        Ok(paths.processing_folder.clone())
    } else {
        Err(PipelineError::NotProcessed(paths.processing_folder.clone()))
    }
}

/// Sidecar written by `process`, if it is still readable.
fn saved_map(combined_pdf: &Path) -> Option<PageMap> {
    let path = PageMap::sidecar_path(combined_pdf);
    match PageMap::load(&path) {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable page map");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Event helpers
// ---------------------------------------------------------------------------

fn finish<T>(mut log: EventLog, result: Result<T, PipelineError>) -> StageResult<T> {
    match result {
        Ok(data) => StageResult::ok(log, data),
        Err(e) => {
            log.error(e.code(), e.to_string(), e.data());
            StageResult::failed(log)
        }
    }
}

fn log_archive_warnings(warnings: &[ArchiveWarning], log: &mut EventLog) {
    for warning in warnings {
        match warning {
            ArchiveWarning::NoPdfFound { folder_name } => log.warn(
                codes::WARN_NO_PDF_FOUND,
                format!("No PDF in '{folder_name}'; treated as no submission"),
                json!({ "folder": folder_name }),
            ),
            ArchiveWarning::UnrecognizedEntry { path } => log.warn(
                codes::WARN_UNRECOGNIZED_ENTRY,
                format!("'{path}' is outside any submission folder"),
                json!({ "path": path }),
            ),
        }
    }
}

fn log_consolidation(c: &Consolidation, log: &mut EventLog) {
    for record in &c.unmatched {
        log.error(
            codes::ERR_COULD_NOT_MATCH,
            format!("Could not match '{}' to a roster student", record.display_name),
            json!({ "folder": record.raw_folder_name, "name": record.display_name }),
        );
    }
    for ambiguous in &c.ambiguous {
        log.error(
            codes::ERR_AMBIGUOUS_MATCH,
            format!(
                "'{}' matches more than one roster student",
                ambiguous.record.display_name
            ),
            json!({
                "folder": ambiguous.record.raw_folder_name,
                "candidates": ambiguous.candidates,
            }),
        );
    }
    for student in c.students.iter().filter(|s| s.fuzzy_matched()) {
        let folders: Vec<&str> = student
            .submissions
            .iter()
            .map(|r| r.raw_folder_name.as_str())
            .collect();
        log.warn(
            codes::REVIEW_FUZZY_MATCH,
            format!("{} was matched by name similarity", student.entry.full_name()),
            json!({ "student": student.student_key(), "folders": folders }),
        );
    }
    for key in &c.multiple_submissions {
        let latest = c.student(key).and_then(|s| s.latest_submitted_at);
        log.info(
            codes::DUPLICATE_SUBMISSIONS,
            format!("{key} submitted more than once; all pages kept"),
            json!({ "student": key, "latest": latest }),
        );
    }
    let matched = c.students.len() - c.placeholders();
    log.info(
        codes::STUDENT_MATCHED,
        format!("{matched} of {} roster students have a submission", c.students.len()),
        json!({ "matched": matched, "placeholders": c.placeholders() }),
    );
}

fn log_results(results: &[GradeExtractionResult], log: &mut EventLog) {
    for r in results {
        let key = &r.student_key;
        if r.fallback_used {
            log.info(
                codes::OCR_FALLBACK_USED,
                format!(
                    "Grade for {key} read by fallback backend {}",
                    r.backend.as_deref().unwrap_or("?")
                ),
                json!({ "student": key, "backend": r.backend, "failed": r.ocr_errors }),
            );
        }
        let data = json!({
            "student": key,
            "page": r.page_index + 1,
            "grade": r.parsed_grade,
            "confidence": r.confidence,
            "text": r.raw_ocr_text,
        });
        match r.status {
            GradeStatus::OcrUnavailable => log.error(
                codes::ERR_OCR_UNAVAILABLE,
                format!("No OCR backend could read the grade for {key}"),
                json!({ "student": key, "errors": r.ocr_errors }),
            ),
            GradeStatus::LowConfidence => log.warn(
                codes::REVIEW_LOW_CONFIDENCE,
                format!("Check the grade read for {key}"),
                data,
            ),
            GradeStatus::NoGradeFound => log.warn(
                codes::REVIEW_NO_GRADE_FOUND,
                format!("No grade found on page {} for {key}", r.page_index + 1),
                data,
            ),
            GradeStatus::Accepted | GradeStatus::NoSubmission => {}
        }
        if r.flags.fuzzy_matched {
            log.warn(
                codes::REVIEW_FUZZY_MATCH,
                format!("{key} was matched by name similarity"),
                json!({ "student": key }),
            );
        }
    }
    let count = |status: GradeStatus| results.iter().filter(|r| r.status == status).count();
    log.info(
        codes::GRADES_EXTRACTED,
        format!(
            "{} grade(s) accepted of {} section(s)",
            count(GradeStatus::Accepted),
            results.len()
        ),
        json!({
            "accepted": count(GradeStatus::Accepted),
            "low_confidence": count(GradeStatus::LowConfidence),
            "no_grade_found": count(GradeStatus::NoGradeFound),
            "no_submission": count(GradeStatus::NoSubmission),
            "ocr_unavailable": count(GradeStatus::OcrUnavailable),
        }),
    );
}

fn log_reconcile(summary: &ReconcileSummary, log: &mut EventLog) {
    if !summary.removed_trailing.is_empty() || summary.repaired_rows > 0 {
        log.warn(
            codes::CORRUPT_COLUMNS_REMOVED,
            "Removed columns or repaired rows left by an earlier run",
            json!({
                "columns": summary.removed_trailing,
                "repaired_rows": summary.repaired_rows,
            }),
        );
    }
}

fn log_archived(item: &ArchivedItem, log: &mut EventLog) {
    log.info(
        codes::FOLDER_ARCHIVED,
        format!("Archived {}", item.original.display()),
        json!({ "from": item.original, "to": item.archived_to, "files": item.files }),
    );
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Arc<dyn ConfigProvider>,
    settings: GraderSettings,
    sink: Option<Arc<dyn EventSink>>,
    resolver: NameResolver,
    extractor: Option<Arc<GradeExtractor>>,
    archive_root: PathBuf,
}

impl Orchestrator {
    pub fn new(config: Arc<dyn ConfigProvider>, settings: GraderSettings) -> Self {
        Self {
            config,
            settings,
            sink: None,
            resolver: NameResolver::new(),
            extractor: None,
            archive_root: config::archive_dir(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Manual name overrides for this run.
    pub fn with_resolver(mut self, resolver: NameResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Use this extractor instead of one built from the OCR settings.
    pub fn with_extractor(mut self, extractor: Arc<GradeExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_archive_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.archive_root = root.into();
        self
    }

    fn event_log(&self) -> EventLog {
        match &self.sink {
            Some(sink) => EventLog::with_sink(Arc::clone(sink)),
            None => EventLog::new(),
        }
    }

    fn backup(&self) -> BackupManager {
        BackupManager::new(self.archive_root.clone(), self.settings.retry)
    }

    fn extractor(&mut self) -> Result<Arc<GradeExtractor>, GradeError> {
        if let Some(extractor) = &self.extractor {
            return Ok(Arc::clone(extractor));
        }
        let built = Arc::new(GradeExtractor::from_settings(&self.settings.ocr)?);
        tracing::info!(backends = ?built.backend_names(), "OCR backends ready");
        self.extractor = Some(Arc::clone(&built));
        Ok(built)
    }

    fn watermark_reader(&mut self) -> Option<WatermarkOcr> {
        match self.extractor() {
            Ok(extractor) => Some(WatermarkOcr::new(extractor.renderer(), extractor.ocr().clone())),
            Err(e) => {
                tracing::warn!(error = %e, "Watermark OCR unavailable");
                None
            }
        }
    }

    /// Load the roster; a bad roster stops the stage before anything changes.
    fn load_roster(&self, paths: &ClassPaths) -> Result<RosterStore, PipelineError> {
        let path = find_roster(&paths.roster_folder)?;
        let mut store = RosterStore::new(self.settings.retry);
        store.load(&path)?;
        Ok(store)
    }

    // ── process ──────────────────────────────────────────────

    /// Validate the download (`zip`, else the newest in the downloads
    /// folder), unpack it and build the combined PDF.
    pub fn process(&mut self, class: &str, zip: Option<&Path>) -> StageResult<ProcessOutcome> {
        let _span = tracing::info_span!("process", class = %class).entered();
        let mut log = self.event_log();
        let result = self.run_process(class, zip, &mut log);
        finish(log, result)
    }

    fn run_process(
        &mut self,
        class: &str,
        zip: Option<&Path>,
        log: &mut EventLog,
    ) -> Result<ProcessOutcome, PipelineError> {
        let paths = self.config.class_paths(class)?;
        let entries = self.load_roster(&paths)?.entries();
        let zip_path = match zip {
            Some(path) => path.to_path_buf(),
            None => find_download(&paths.downloads_folder)?,
        };

        let validation = archive::validate(&zip_path)?;
        log.info(
            codes::ARCHIVE_VALIDATED,
            format!(
                "'{}' has {} submission folder(s)",
                validation.assignment_name,
                validation.student_folders.len()
            ),
            json!({
                "assignment": validation.assignment_name,
                "folders": validation.student_folders.len(),
                "index_preserved": validation.index_html.is_some(),
            }),
        );
        log_archive_warnings(&validation.warnings, log);

        let combined_path = combined_pdf_path(&paths.downloads_folder, &validation.assignment_name);
        let backup = self.backup();
        let mut archived = Vec::new();
        for path in [
            paths.processing_folder.clone(),
            combined_path.clone(),
            PageMap::sidecar_path(&combined_path),
        ] {
            if let Some(item) = backup.archive(&path)? {
                log_archived(&item, log);
                archived.push(item);
            }
        }
        archive::extract_to(&zip_path, &paths.processing_folder)?;

        let consolidation = consolidate(&validation.student_folders, &entries, &self.resolver);
        log_consolidation(&consolidation, log);

        let combined = combine::build(&consolidation, &paths.processing_folder, &combined_path)?;
        for skipped in &combined.skipped {
            log.warn(
                codes::WARN_PDF_SKIPPED,
                format!("Skipped unreadable PDF {}", skipped.relative_path),
                json!({
                    "student": skipped.student_key,
                    "path": skipped.relative_path,
                    "reason": skipped.reason,
                }),
            );
        }
        log.info(
            codes::COMBINED_PDF_BUILT,
            format!(
                "Combined PDF has {} page(s) for {} student(s)",
                combined.page_map.total_pages,
                combined.page_map.entries.len()
            ),
            json!({
                "path": combined.path,
                "pages": combined.page_map.total_pages,
                "students": combined.page_map.entries.len(),
            }),
        );

        Ok(ProcessOutcome {
            assignment_name: validation.assignment_name,
            source_zip: zip_path,
            combined_pdf: combined.path,
            page_map_path: combined.sidecar,
            placeholders: combined.page_map.entries.iter().filter(|e| e.placeholder).count(),
            page_map: combined.page_map,
            archived,
            report: RunReport::from_events(log.events()),
        })
    }

    // ── extract ──────────────────────────────────────────────

    pub async fn extract(&mut self, class: &str, request: &ExtractRequest) -> StageResult<ExtractOutcome> {
        let span = tracing::info_span!("extract", class = %class);
        let mut log = self.event_log();
        let result = self.run_extract(class, request, &mut log).instrument(span).await;
        finish(log, result)
    }

    async fn run_extract(
        &mut self,
        class: &str,
        request: &ExtractRequest,
        log: &mut EventLog,
    ) -> Result<ExtractOutcome, PipelineError> {
        let paths = self.config.class_paths(class)?;
        let mut roster = self.load_roster(&paths)?;
        let entries = roster.entries();
        let processing = processed_folder(&paths)?;
        let folders = archive::scan_extracted(&processing)?;
        let combined = combined_pdf_path(&paths.downloads_folder, &folders.assignment_name);
        let graded = request.graded_pdf.clone().unwrap_or_else(|| combined.clone());
        let bytes = std::fs::read(&graded)?;
        let pdf_sha256 = archive::sha256_hex(&bytes);

        let (source, results) = match PendingGrades::load_for(&processing, &pdf_sha256) {
            Some(pending) => {
                log.info(
                    codes::GRADES_REUSED,
                    format!(
                        "Using {} grade(s) already read from this PDF",
                        pending.results.len()
                    ),
                    json!({ "path": PendingGrades::path(&processing) }),
                );
                (pending.page_map_source, pending.results)
            }
            None => {
                let (source, results) = self
                    .read_grades(&graded, bytes, &combined, &processing, &entries, log)
                    .await?;
                PendingGrades {
                    pdf_sha256,
                    page_map_source: source,
                    results: results.clone(),
                }
                .save(&processing)?;
                (source, results)
            }
        };
        log_results(&results, log);

        let columns = roster.reconcile_columns(&request.grade_column, request.mode)?;
        log_reconcile(&columns, log);
        let writes: Vec<GradeWrite> = results
            .iter()
            .filter(|r| r.status != GradeStatus::NoSubmission)
            .map(GradeExtractionResult::to_grade_write)
            .collect();
        let written = roster.write_grades(&writes)?;
        let roster_path = match roster.persist() {
            Ok(path) => path,
            Err(e) => {
                log.warn(
                    codes::GRADES_PENDING,
                    format!(
                        "{} grade(s) kept; run extract again once the roster is closed",
                        results.len()
                    ),
                    json!({ "path": PendingGrades::path(&processing), "results": &results }),
                );
                return Err(e.into());
            }
        };
        PendingGrades::discard(&processing);
        log.info(
            codes::ROSTER_SAVED,
            format!("Saved {} grade(s) to {}", written.written, roster_path.display()),
            json!({ "path": roster_path, "written": written.written, "verify_rows": written.verify_rows }),
        );

        Ok(ExtractOutcome {
            graded_pdf: graded,
            page_map_source: source,
            results,
            columns,
            written,
            roster_path,
            report: RunReport::from_events(log.events()),
        })
    }

    /// Resolve the page map and OCR every section of the graded PDF.
    async fn read_grades(
        &mut self,
        graded: &Path,
        bytes: Vec<u8>,
        combined: &Path,
        processing: &Path,
        entries: &[RosterEntry],
        log: &mut EventLog,
    ) -> Result<(PageMapSource, Vec<GradeExtractionResult>), PipelineError> {
        let extractor = self.extractor()?;
        let (map, source) = {
            let doc = lopdf::Document::load_mem(&bytes).map_err(GradeError::from)?;
            let backup = self.backup();
            let engine = SplitRezipEngine::new(&backup).with_watermark_ocr(WatermarkOcr::new(
                extractor.renderer(),
                extractor.ocr().clone(),
            ));
            let ctx = SplitContext {
                processing,
                roster: entries,
                resolver: &self.resolver,
            };
            engine.resolve_page_map(graded, &bytes, &doc, saved_map(combined), &ctx)?
        };
        if source == PageMapSource::Watermarks {
            log.warn(
                codes::PAGE_MAP_RECOVERED,
                "Page map rebuilt from section watermarks",
                json!({ "students": map.entries.len() }),
            );
        }

        let results = Arc::clone(&extractor)
            .extract_concurrent(Arc::new(bytes), map, self.settings.ocr.workers)
            .await?;
        Ok((source, results))
    }

    // ── split ────────────────────────────────────────────────

    /// Cut the graded PDF (default: the combined PDF) back into the
    /// submission files and write `<Assignment> Graded.zip` to downloads.
    pub fn split(&mut self, class: &str, graded_pdf: Option<&Path>) -> StageResult<RezipOutcome> {
        let _span = tracing::info_span!("split", class = %class).entered();
        let mut log = self.event_log();
        let result = self.run_split(class, graded_pdf, &mut log);
        finish(log, result)
    }

    fn run_split(
        &mut self,
        class: &str,
        graded_pdf: Option<&Path>,
        log: &mut EventLog,
    ) -> Result<RezipOutcome, PipelineError> {
        let paths = self.config.class_paths(class)?;
        let entries = self.load_roster(&paths)?.entries();
        let processing = processed_folder(&paths)?;
        let folders = archive::scan_extracted(&processing)?;
        let combined = combined_pdf_path(&paths.downloads_folder, &folders.assignment_name);
        let graded = graded_pdf.map(Path::to_path_buf).unwrap_or_else(|| combined.clone());

        let saved = saved_map(&combined);
        let reader = if saved.is_none() { self.watermark_reader() } else { None };
        let backup = self.backup();
        let mut engine = SplitRezipEngine::new(&backup);
        if let Some(reader) = reader {
            engine = engine.with_watermark_ocr(reader);
        }
        let ctx = SplitContext {
            processing: &processing,
            roster: &entries,
            resolver: &self.resolver,
        };
        let outcome = engine.split(&graded, saved, &ctx, &paths.downloads_folder)?;

        if outcome.page_map_source == PageMapSource::Watermarks {
            log.warn(
                codes::PAGE_MAP_RECOVERED,
                "Page map rebuilt from section watermarks",
                json!({ "students": outcome.students_written + outcome.placeholders_skipped }),
            );
        }
        if let Some(item) = &outcome.archived_previous {
            log_archived(item, log);
        }
        if outcome.index_fidelity == IndexFidelity::Regenerated {
            log.warn(
                codes::INDEX_REGENERATED,
                "index.html was regenerated; D2L may not accept the package",
                json!({ "zip": outcome.zip_path }),
            );
        }
        log.info(
            codes::UPLOAD_ZIP_WRITTEN,
            format!("Upload package written to {}", outcome.zip_path.display()),
            json!({
                "zip": outcome.zip_path,
                "files": outcome.files_zipped,
                "pdfs": outcome.pdfs_written.len(),
            }),
        );

        Ok(RezipOutcome {
            split: outcome,
            report: RunReport::from_events(log.events()),
        })
    }

    // ── clear ────────────────────────────────────────────────

    /// Move the processing folder and combined PDFs into the archive.
    pub fn clear(&mut self, class: &str) -> StageResult<ClearOutcome> {
        let _span = tracing::info_span!("clear", class = %class).entered();
        let mut log = self.event_log();
        let result = self.run_clear(class, &mut log);
        finish(log, result)
    }

    fn run_clear(&mut self, class: &str, log: &mut EventLog) -> Result<ClearOutcome, PipelineError> {
        let paths = self.config.class_paths(class)?;
        let mut targets = vec![paths.processing_folder.clone()];
        targets.extend(combined_artifacts(&paths.downloads_folder));

        let archived = self.backup().archive_all(&targets)?;
        for item in &archived {
            log_archived(item, log);
        }
        log.info(
            codes::PROCESSING_CLEARED,
            format!("Cleared {} item(s)", archived.len()),
            json!({ "archived": archived.len() }),
        );
        Ok(ClearOutcome { archived })
    }

    // ── complete ─────────────────────────────────────────────

    /// Full points for every student with a submission; late work is marked
    /// for review.
    pub fn complete(&mut self, class: &str, request: &CompletionRequest) -> StageResult<CompletionOutcome> {
        let _span = tracing::info_span!("complete", class = %class).entered();
        let mut log = self.event_log();
        let result = self.run_complete(class, request, &mut log);
        finish(log, result)
    }

    fn run_complete(
        &mut self,
        class: &str,
        request: &CompletionRequest,
        log: &mut EventLog,
    ) -> Result<CompletionOutcome, PipelineError> {
        let paths = self.config.class_paths(class)?;
        let mut roster = self.load_roster(&paths)?;
        let points = request
            .points
            .or(self.settings.completion_points)
            .ok_or(PipelineError::NoCompletionPoints)?;
        let entries = roster.entries();

        let folders = match &request.source_zip {
            Some(zip) => archive::validate(zip)?,
            None => archive::scan_extracted(&processed_folder(&paths)?)?,
        };
        log_archive_warnings(&folders.warnings, log);
        let consolidation = consolidate(&folders.student_folders, &entries, &self.resolver);
        log_consolidation(&consolidation, log);

        let mut writes = Vec::new();
        let mut graded = Vec::new();
        let mut late = Vec::new();
        let mut no_submission = Vec::new();
        for student in &consolidation.students {
            let key = student.student_key();
            if student.placeholder {
                no_submission.push(key);
                continue;
            }
            let is_late = match (request.due, student.latest_submitted_at) {
                (Some(due), Some(at)) => at > due,
                _ => false,
            };
            if is_late {
                log.warn(
                    codes::REVIEW_LATE_SUBMISSION,
                    format!("{key} submitted after the due date"),
                    json!({ "student": key, "submitted_at": student.latest_submitted_at, "due": request.due }),
                );
                late.push(key.clone());
            }
            writes.push(GradeWrite {
                student_key: key.clone(),
                grade: Some(points),
                needs_verify: is_late || student.fuzzy_matched(),
            });
            graded.push(key);
        }

        let columns = roster.reconcile_columns(&request.grade_column, request.mode)?;
        log_reconcile(&columns, log);
        let written = roster.write_grades(&writes)?;
        let roster_path = roster.persist()?;
        log.info(
            codes::COMPLETION_GRADED,
            format!("{} student(s) given {points} completion point(s)", written.written),
            json!({ "points": points, "graded": graded.len(), "late": late.len() }),
        );
        log.info(
            codes::ROSTER_SAVED,
            format!("Saved {} grade(s) to {}", written.written, roster_path.display()),
            json!({ "path": roster_path, "written": written.written, "verify_rows": written.verify_rows }),
        );

        Ok(CompletionOutcome {
            points,
            graded,
            late,
            no_submission,
            written,
            roster_path,
            report: RunReport::from_events(log.events()),
        })
    }
}
