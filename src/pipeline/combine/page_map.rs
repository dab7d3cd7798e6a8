//! PageMap: which pages of the combined document belong to which student.
//!
//! `page_start` is a zero-based page index. The map must cover the document
//! exactly once, in order, with no gaps or overlaps.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::CombineError;
use crate::pipeline::naming::MatchMethod;

/// Extension of the JSON sidecar written next to the combined PDF.
pub const SIDECAR_EXTENSION: &str = "page_map.json";

/// One source PDF inside a student section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    /// Path relative to the processing folder, `/`-separated. Empty when the
    /// map was recovered from watermarks and not yet re-linked.
    pub relative_path: String,
    pub page_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMapEntry {
    pub student_key: String,
    pub page_start: usize,
    pub page_count: usize,
    /// First segment's path (`None` for placeholders).
    pub source_pdf_path: Option<String>,
    pub segments: Vec<SegmentRef>,
    pub match_method: MatchMethod,
    pub placeholder: bool,
}

impl PageMapEntry {
    pub fn page_end(&self) -> usize {
        self.page_start + self.page_count
    }

    pub fn fuzzy_matched(&self) -> bool {
        self.match_method == MatchMethod::Fuzzy
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMap {
    pub entries: Vec<PageMapEntry>,
    pub total_pages: usize,
}

impl PageMap {
    pub fn new(entries: Vec<PageMapEntry>, total_pages: usize) -> Self {
        Self {
            entries,
            total_pages,
        }
    }

    pub fn entry(&self, student_key: &str) -> Option<&PageMapEntry> {
        self.entries.iter().find(|e| e.student_key == student_key)
    }

    /// Exhaustive, ordered, non-overlapping, unique keys, segment sums agree.
    pub fn validate(&self) -> Result<(), CombineError> {
        let mut expected_start = 0usize;
        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.student_key.as_str()) {
                return Err(CombineError::InvalidPageMap(format!(
                    "student '{}' appears twice",
                    entry.student_key
                )));
            }
            if entry.page_count == 0 {
                return Err(CombineError::InvalidPageMap(format!(
                    "student '{}' has no pages",
                    entry.student_key
                )));
            }
            if entry.page_start != expected_start {
                return Err(CombineError::InvalidPageMap(format!(
                    "student '{}' starts at page {} (expected {})",
                    entry.student_key, entry.page_start, expected_start
                )));
            }
            if !entry.placeholder {
                let segment_pages: usize = entry.segments.iter().map(|s| s.page_count).sum();
                if segment_pages != entry.page_count {
                    return Err(CombineError::InvalidPageMap(format!(
                        "student '{}' segments cover {} pages, entry says {}",
                        entry.student_key, segment_pages, entry.page_count
                    )));
                }
            }
            expected_start = entry.page_end();
        }
        if expected_start != self.total_pages {
            return Err(CombineError::InvalidPageMap(format!(
                "map covers {} pages, document has {}",
                expected_start, self.total_pages
            )));
        }
        Ok(())
    }

    /// `<dir>/<name>.page_map.json` for `<dir>/<name>.pdf`.
    pub fn sidecar_path(combined_pdf: &Path) -> PathBuf {
        combined_pdf.with_extension(SIDECAR_EXTENSION)
    }

    pub fn save(&self, path: &Path) -> Result<(), CombineError> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Load and validate a saved map. `Ok(None)` when no file exists.
    pub fn load(path: &Path) -> Result<Option<Self>, CombineError> {
        if !path.is_file() {
            return Ok(None);
        }
        let map: PageMap = serde_json::from_slice(&std::fs::read(path)?)?;
        map.validate()?;
        Ok(Some(map))
    }
}
