//! SplitRezipEngine: splits the graded combined PDF back into submission files.
//!
//! Each student section is cut per source segment and written over the
//! original PDF inside the processing folder; sibling files stay untouched
//! and placeholder sections are dropped. The processing folder is then
//! packaged as `<Assignment> Graded.zip`.
//!
//! The page map comes from the caller, else from the JSON sidecar, else from
//! the section watermarks (content first, OCR of the page footer second).

pub mod rezip;

pub use rezip::{regenerate_index, upload_zip_name, write_upload_zip, IndexFidelity, RezipSummary};

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lopdf::Document;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::pipeline::archive::{resolve_relative, safe_relative, scan_extracted, ArchiveError};
use crate::pipeline::backup::{ArchivedItem, BackupError, BackupManager};
use crate::pipeline::combine::watermark::strip_watermark;
use crate::pipeline::combine::{recover_page_map, relink, CombineError, PageMap, Watermark};
use crate::pipeline::consolidate::consolidate;
use crate::pipeline::grading::render::crop_footer_band;
use crate::pipeline::grading::{FallbackOcr, PageRenderer};
use crate::pipeline::naming::NameResolver;
use crate::pipeline::roster::RosterEntry;

/// Share of the page height (from the bottom) scanned for a watermark.
const FOOTER_FRACTION: f32 = 0.05;
/// Watermark text is small; render footers sharper than grade bands.
const WATERMARK_DPI: u32 = 300;

#[derive(Error, Debug)]
pub enum SplitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Combine(#[from] CombineError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("Segment path leaves the processing folder: {0}")]
    UnsafePath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageMapSource {
    Provided,
    Sidecar,
    Watermarks,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitOutcome {
    pub zip_path: PathBuf,
    pub page_map_source: PageMapSource,
    pub index_fidelity: IndexFidelity,
    pub students_written: usize,
    pub placeholders_skipped: usize,
    /// Submission PDFs overwritten, relative to the processing folder.
    pub pdfs_written: Vec<String>,
    pub files_zipped: usize,
    /// Earlier upload package moved aside.
    pub archived_previous: Option<ArchivedItem>,
}

/// Reads a watermark from the rendered page footer.
pub struct WatermarkOcr {
    renderer: Arc<dyn PageRenderer>,
    ocr: FallbackOcr,
}

impl WatermarkOcr {
    pub fn new(renderer: Arc<dyn PageRenderer>, ocr: FallbackOcr) -> Self {
        Self { renderer, ocr }
    }

    pub fn read(&self, pdf_bytes: &[u8], page_index: usize) -> Option<Watermark> {
        let page = self
            .renderer
            .render_page(pdf_bytes, page_index, WATERMARK_DPI)
            .ok()?;
        let footer = crop_footer_band(&page, FOOTER_FRACTION).ok()?;
        let read = self.ocr.recognize(&footer).ok()?;
        let watermark = Watermark::parse(&read.reading.text);
        tracing::debug!(page = page_index, found = watermark.is_some(), "Watermark OCR");
        watermark
    }
}

/// Where the submission folders live and who is on the roster; needed to
/// re-link a map recovered from watermarks.
pub struct SplitContext<'a> {
    pub processing: &'a Path,
    pub roster: &'a [RosterEntry],
    pub resolver: &'a NameResolver,
}

pub struct SplitRezipEngine<'a> {
    backup: &'a BackupManager,
    watermark_ocr: Option<WatermarkOcr>,
}

/// A supplied map is usable when it matches the document and knows where
/// every section came from.
fn usable_map(map: &PageMap, total_pages: usize) -> bool {
    map.validate().is_ok()
        && map.total_pages == total_pages
        && map
            .entries
            .iter()
            .filter(|e| !e.placeholder)
            .all(|e| e.segments.iter().all(|s| !s.relative_path.is_empty()))
}

fn check_relative(rel: &str) -> Result<(), SplitError> {
    safe_relative(rel)
        .map(|_| ())
        .ok_or_else(|| SplitError::UnsafePath(rel.to_string()))
}

/// Replace `target` with `bytes` via a temp file in the same folder.
fn replace_file(target: &Path, bytes: &[u8]) -> Result<(), SplitError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(target).map_err(|e| SplitError::Io(e.error))?;
    Ok(())
}

impl<'a> SplitRezipEngine<'a> {
    pub fn new(backup: &'a BackupManager) -> Self {
        Self {
            backup,
            watermark_ocr: None,
        }
    }

    pub fn with_watermark_ocr(mut self, reader: WatermarkOcr) -> Self {
        self.watermark_ocr = Some(reader);
        self
    }

    /// Pick the page map for `graded_pdf`: supplied, sidecar, then watermarks.
    pub fn resolve_page_map(
        &self,
        graded_pdf: &Path,
        pdf_bytes: &[u8],
        doc: &Document,
        supplied: Option<PageMap>,
        ctx: &SplitContext<'_>,
    ) -> Result<(PageMap, PageMapSource), SplitError> {
        let total = doc.get_pages().len();
        if let Some(map) = supplied {
            if usable_map(&map, total) {
                return Ok((map, PageMapSource::Provided));
            }
            tracing::warn!("Supplied page map does not match the graded PDF");
        }

        let sidecar = PageMap::sidecar_path(graded_pdf);
        match PageMap::load(&sidecar) {
            Ok(Some(map)) if usable_map(&map, total) => {
                return Ok((map, PageMapSource::Sidecar));
            }
            Ok(Some(_)) => tracing::warn!(path = %sidecar.display(), "Sidecar page map does not match the graded PDF"),
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %sidecar.display(), error = %e, "Sidecar page map unreadable"),
        }

        let mut map = recover_page_map(doc, |idx| {
            self.watermark_ocr
                .as_ref()
                .and_then(|reader| reader.read(pdf_bytes, idx))
        })?;
        let folders = scan_extracted(ctx.processing)?;
        let consolidation = consolidate(&folders.student_folders, ctx.roster, ctx.resolver);
        relink(&mut map, &consolidation, ctx.processing)?;
        Ok((map, PageMapSource::Watermarks))
    }

    /// Write each section's pages over its source PDFs. Returns the paths
    /// written, relative to the processing folder.
    pub fn write_segments(
        doc: &Document,
        map: &PageMap,
        processing: &Path,
    ) -> Result<Vec<String>, SplitError> {
        let total = doc.get_pages().len() as u32;
        let mut written = Vec::new();

        for entry in map.entries.iter().filter(|e| !e.placeholder) {
            let mut offset = entry.page_start as u32;
            for (i, segment) in entry.segments.iter().enumerate() {
                check_relative(&segment.relative_path)?;
                let keep = (offset + 1)..=(offset + segment.page_count as u32);
                let drop: Vec<u32> = (1..=total).filter(|n| !keep.contains(n)).collect();

                let mut part = doc.clone();
                part.delete_pages(&drop);
                if i == 0 {
                    if let Some(&first) = part.get_pages().get(&1) {
                        strip_watermark(&mut part, first)?;
                    }
                }
                part.prune_objects();

                let mut bytes = Vec::new();
                part.save_to(&mut bytes)?;
                replace_file(&resolve_relative(processing, &segment.relative_path), &bytes)?;
                tracing::debug!(
                    student = %entry.student_key,
                    path = %segment.relative_path,
                    pages = segment.page_count,
                    "Segment written"
                );
                written.push(segment.relative_path.clone());
                offset += segment.page_count as u32;
            }
        }
        Ok(written)
    }

    pub fn split(
        &self,
        graded_pdf: &Path,
        page_map: Option<PageMap>,
        ctx: &SplitContext<'_>,
        output_root: &Path,
    ) -> Result<SplitOutcome, SplitError> {
        let _span = tracing::info_span!("split", pdf = %graded_pdf.display()).entered();
        let bytes = std::fs::read(graded_pdf)?;
        let doc = Document::load_mem(&bytes)?;
        let (map, source) = self.resolve_page_map(graded_pdf, &bytes, &doc, page_map, ctx)?;

        // Catalog before writing so a bad processing folder fails untouched.
        let folders = scan_extracted(ctx.processing)?;
        let pdfs_written = Self::write_segments(&doc, &map, ctx.processing)?;

        let zip_path = output_root.join(upload_zip_name(&folders.assignment_name));
        let archived_previous = self.backup.archive(&zip_path)?;
        let folder_names: Vec<String> = folders
            .student_folders
            .iter()
            .map(|f| f.folder_name.clone())
            .collect();
        let summary = write_upload_zip(
            ctx.processing,
            &folders.assignment_name,
            &folder_names,
            &zip_path,
        )?;

        let placeholders_skipped = map.entries.iter().filter(|e| e.placeholder).count();
        tracing::info!(
            students = map.entries.len() - placeholders_skipped,
            placeholders = placeholders_skipped,
            pdfs = pdfs_written.len(),
            source = ?source,
            "Split complete"
        );
        Ok(SplitOutcome {
            zip_path: summary.zip_path,
            page_map_source: source,
            index_fidelity: summary.index_fidelity,
            students_written: map.entries.len() - placeholders_skipped,
            placeholders_skipped,
            pdfs_written,
            files_zipped: summary.files,
            archived_previous,
        })
    }
}
