//! End-of-run summary.
//!
//! Per-student problems never abort a run; they are sorted out of the event
//! stream into hard failures, items that need a human look, and warnings.

use serde::{Deserialize, Serialize};

use crate::events::{EventLevel, LogEvent};

/// Code prefix of events that ask for manual review rather than signal failure.
pub const REVIEW_PREFIX: &str = "REVIEW_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportItem {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student_key: Option<String>,
    pub message: String,
}

impl ReportItem {
    fn from_event(event: &LogEvent) -> Self {
        Self {
            code: event.code.clone(),
            student_key: event
                .data
                .get("student")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            message: event.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub hard_failures: Vec<ReportItem>,
    pub review_items: Vec<ReportItem>,
    pub warnings: Vec<ReportItem>,
}

impl RunReport {
    pub fn from_events(events: &[LogEvent]) -> Self {
        let mut report = Self::default();
        for event in events {
            if event.code.starts_with(REVIEW_PREFIX) {
                report.review_items.push(ReportItem::from_event(event));
                continue;
            }
            match event.level {
                EventLevel::Error => report.hard_failures.push(ReportItem::from_event(event)),
                EventLevel::Warn => report.warnings.push(ReportItem::from_event(event)),
                EventLevel::Debug | EventLevel::Info => {}
            }
        }
        report
    }

    pub fn is_clean(&self) -> bool {
        self.hard_failures.is_empty() && self.review_items.is_empty() && self.warnings.is_empty()
    }

    /// Items with `code` across all three lists.
    pub fn count(&self, code: &str) -> usize {
        self.hard_failures
            .iter()
            .chain(&self.review_items)
            .chain(&self.warnings)
            .filter(|i| i.code == code)
            .count()
    }

    /// One line per list, for the end of a CLI run.
    pub fn headline(&self) -> String {
        format!(
            "{} failure(s), {} item(s) to review, {} warning(s)",
            self.hard_failures.len(),
            self.review_items.len(),
            self.warnings.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{codes, EventLog};
    use serde_json::json;

    #[test]
    fn events_sorted_into_lists() {
        let mut log = EventLog::new();
        log.info(codes::ARCHIVE_VALIDATED, "ok", serde_json::Value::Null);
        log.error(codes::ERR_COULD_NOT_MATCH, "no match", json!({"folder": "x"}));
        log.warn(codes::REVIEW_LOW_CONFIDENCE, "check", json!({"student": "jdoe"}));
        log.warn(codes::WARN_NO_PDF_FOUND, "empty", json!({"student": "amy"}));
        log.info(codes::OCR_FALLBACK_USED, "fallback", json!({"student": "jdoe"}));

        let report = RunReport::from_events(log.events());
        assert_eq!(report.hard_failures.len(), 1);
        assert_eq!(report.hard_failures[0].student_key, None);
        assert_eq!(report.review_items[0].student_key.as_deref(), Some("jdoe"));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.count(codes::OCR_FALLBACK_USED), 0);
        assert_eq!(report.headline(), "1 failure(s), 1 item(s) to review, 1 warning(s)");
    }

    #[test]
    fn info_only_run_is_clean() {
        let mut log = EventLog::new();
        log.info(codes::ROSTER_SAVED, "saved", serde_json::Value::Null);
        assert!(RunReport::from_events(log.events()).is_clean());
    }
}
