//! Structured pipeline events and the typed stage result.
//!
//! Every orchestrator operation returns a `StageResult` carrying the events it
//! emitted. Presentation of those events (message catalog, UI) is the caller's
//! concern; here they are plain `{level, code, message, data}` records that are
//! also mirrored to `tracing`.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Event codes emitted by the pipeline.
pub mod codes {
    pub const ARCHIVE_VALIDATED: &str = "ARCHIVE_VALIDATED";
    pub const ERR_MALFORMED_ARCHIVE: &str = "ERR_MALFORMED_ARCHIVE";
    pub const WARN_NO_PDF_FOUND: &str = "WARN_NO_PDF_FOUND";
    pub const WARN_UNRECOGNIZED_ENTRY: &str = "WARN_UNRECOGNIZED_ENTRY";
    pub const WARN_PDF_SKIPPED: &str = "WARN_PDF_SKIPPED";
    pub const ERR_COULD_NOT_MATCH: &str = "ERR_COULD_NOT_MATCH";
    pub const ERR_AMBIGUOUS_MATCH: &str = "ERR_AMBIGUOUS_MATCH";
    pub const STUDENT_MATCHED: &str = "STUDENT_MATCHED";
    pub const DUPLICATE_SUBMISSIONS: &str = "DUPLICATE_SUBMISSIONS";
    pub const COMBINED_PDF_BUILT: &str = "COMBINED_PDF_BUILT";
    pub const ERR_MISSING_COLUMNS: &str = "ERR_MISSING_COLUMNS";
    pub const ERR_FILE_LOCKED: &str = "ERR_FILE_LOCKED";
    pub const ROSTER_SAVED: &str = "ROSTER_SAVED";
    pub const GRADES_PENDING: &str = "GRADES_PENDING";
    pub const GRADES_REUSED: &str = "GRADES_REUSED";
    pub const CORRUPT_COLUMNS_REMOVED: &str = "CORRUPT_COLUMNS_REMOVED";
    pub const GRADES_EXTRACTED: &str = "GRADES_EXTRACTED";
    pub const COMPLETION_GRADED: &str = "COMPLETION_GRADED";
    pub const REVIEW_LATE_SUBMISSION: &str = "REVIEW_LATE_SUBMISSION";
    pub const OCR_FALLBACK_USED: &str = "OCR_FALLBACK_USED";
    pub const ERR_OCR_UNAVAILABLE: &str = "ERR_OCR_UNAVAILABLE";
    pub const REVIEW_LOW_CONFIDENCE: &str = "REVIEW_LOW_CONFIDENCE";
    pub const REVIEW_NO_GRADE_FOUND: &str = "REVIEW_NO_GRADE_FOUND";
    pub const REVIEW_FUZZY_MATCH: &str = "REVIEW_FUZZY_MATCH";
    pub const PAGE_MAP_RECOVERED: &str = "PAGE_MAP_RECOVERED";
    pub const INDEX_REGENERATED: &str = "INDEX_REGENERATED";
    pub const UPLOAD_ZIP_WRITTEN: &str = "UPLOAD_ZIP_WRITTEN";
    pub const FOLDER_ARCHIVED: &str = "FOLDER_ARCHIVED";
    pub const PROCESSING_CLEARED: &str = "PROCESSING_CLEARED";
    pub const ERR_STAGE_FAILED: &str = "ERR_STAGE_FAILED";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: EventLevel,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

/// Receives events as they are emitted (UI bridge, file logger, ...).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LogEvent);
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LogEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Per-stage event collector. Mirrors each event to `tracing` and to an
/// optional external sink.
#[derive(Default)]
pub struct EventLog {
    events: Vec<LogEvent>,
    sink: Option<Arc<dyn EventSink>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn EventSink>) -> Self {
        Self {
            events: Vec::new(),
            sink: Some(sink),
        }
    }

    pub fn record(
        &mut self,
        level: EventLevel,
        code: &str,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        let event = LogEvent {
            level,
            code: code.to_string(),
            message: message.into(),
            data,
        };
        match level {
            EventLevel::Debug => tracing::debug!(code = %event.code, "{}", event.message),
            EventLevel::Info => tracing::info!(code = %event.code, "{}", event.message),
            EventLevel::Warn => tracing::warn!(code = %event.code, "{}", event.message),
            EventLevel::Error => tracing::error!(code = %event.code, "{}", event.message),
        }
        if let Some(sink) = &self.sink {
            sink.emit(&event);
        }
        self.events.push(event);
    }

    pub fn info(&mut self, code: &str, message: impl Into<String>, data: serde_json::Value) {
        self.record(EventLevel::Info, code, message, data);
    }

    pub fn warn(&mut self, code: &str, message: impl Into<String>, data: serde_json::Value) {
        self.record(EventLevel::Warn, code, message, data);
    }

    pub fn error(&mut self, code: &str, message: impl Into<String>, data: serde_json::Value) {
        self.record(EventLevel::Error, code, message, data);
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.events.iter().any(|e| e.code == code)
    }

    pub fn into_events(self) -> Vec<LogEvent> {
        self.events
    }
}

/// Typed result of one pipeline stage. Failures never escape as panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult<T> {
    pub success: bool,
    pub logs: Vec<LogEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> StageResult<T> {
    pub fn ok(log: EventLog, data: T) -> Self {
        Self {
            success: true,
            logs: log.into_events(),
            data: Some(data),
        }
    }

    pub fn failed(log: EventLog) -> Self {
        Self {
            success: false,
            logs: log.into_events(),
            data: None,
        }
    }

    /// Failure that still carries partial data (e.g. the run report).
    pub fn failed_with(log: EventLog, data: T) -> Self {
        Self {
            success: false,
            logs: log.into_events(),
            data: Some(data),
        }
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.logs.iter().any(|e| e.code == code)
    }
}
