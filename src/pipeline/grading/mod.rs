//! GradeExtractor: reads the handwritten grade off each student's first page.
//!
//! For every non-placeholder section: render the first page, crop the top
//! band, OCR it through the backend chain (cloud first, local fallbacks after),
//! parse the grade and band its confidence. Placeholders are reported as
//! `no_submission` without touching OCR.

pub mod backend;
pub mod cloud_vision;
pub mod ollama;
pub mod parse;
pub mod render;
#[cfg(feature = "ocr")]
pub mod tesseract;

pub use backend::{BackendFailure, FailingOcr, FallbackOcr, MockOcr, OcrBackend, OcrReading};
pub use parse::{classify, parse_grade, ConfidenceBand, ParsedGrade};
pub use render::{MockPageRenderer, PageRenderer, PdfiumRenderer};

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::{OcrSettings, GRADE_BAND_FRACTION};
use crate::pipeline::combine::{PageMap, PageMapEntry};
use crate::pipeline::roster::GradeWrite;
use backend::FallbackReading;
use parse::heuristic_confidence;
use render::crop_grade_band;

#[derive(Error, Debug)]
pub enum GradeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Rendering failed on page {page}: {reason}")]
    Rendering { page: usize, reason: String },

    #[error("Image processing failed: {0}")]
    Image(String),

    #[error("OCR backend {backend} failed: {reason}")]
    Ocr { backend: String, reason: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Graded PDF has {found} pages, page map expects {expected}")]
    PageCountMismatch { expected: usize, found: usize },

    #[error("OCR worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeStatus {
    Accepted,
    LowConfidence,
    NoGradeFound,
    NoSubmission,
    /// Every OCR backend failed on this page.
    OcrUnavailable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeFlags {
    pub low_confidence: bool,
    pub fuzzy_matched: bool,
    pub no_grade_found: bool,
    pub no_submission: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeExtractionResult {
    pub student_key: String,
    /// Zero-based page the grade was read from.
    pub page_index: usize,
    pub raw_ocr_text: String,
    /// Blank when no grade was found.
    pub parsed_grade: Option<f64>,
    pub denominator: Option<f64>,
    pub confidence: Option<f32>,
    pub flags: GradeFlags,
    pub status: GradeStatus,
    /// Backend that produced the read.
    pub backend: Option<String>,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ocr_errors: Vec<BackendFailure>,
}

impl GradeExtractionResult {
    fn base(entry: &PageMapEntry, status: GradeStatus) -> Self {
        Self {
            student_key: entry.student_key.clone(),
            page_index: entry.page_start,
            raw_ocr_text: String::new(),
            parsed_grade: None,
            denominator: None,
            confidence: None,
            flags: GradeFlags {
                low_confidence: status == GradeStatus::LowConfidence,
                fuzzy_matched: entry.fuzzy_matched(),
                no_grade_found: matches!(
                    status,
                    GradeStatus::NoGradeFound | GradeStatus::OcrUnavailable
                ),
                no_submission: status == GradeStatus::NoSubmission,
            },
            status,
            backend: None,
            fallback_used: false,
            ocr_errors: Vec::new(),
        }
    }

    pub fn needs_verify(&self) -> bool {
        self.flags.low_confidence || self.flags.fuzzy_matched
    }

    pub fn to_grade_write(&self) -> GradeWrite {
        GradeWrite {
            student_key: self.student_key.clone(),
            grade: self.parsed_grade,
            needs_verify: self.needs_verify(),
        }
    }
}

/// Cropped band of one section's first page, ready for OCR.
struct PageJob {
    entry: PageMapEntry,
    band: Result<Vec<u8>, String>,
}

pub struct GradeExtractor {
    ocr: FallbackOcr,
    renderer: Arc<dyn PageRenderer>,
    dpi: u32,
    band_fraction: f32,
}

impl GradeExtractor {
    pub fn new(ocr: FallbackOcr, renderer: Arc<dyn PageRenderer>) -> Self {
        Self {
            ocr,
            renderer,
            dpi: OcrSettings::default().render_dpi,
            band_fraction: GRADE_BAND_FRACTION,
        }
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    pub fn with_band_fraction(mut self, fraction: f32) -> Self {
        self.band_fraction = fraction;
        self
    }

    /// Backend chain from settings: cloud vision when an API key is
    /// configured, then Ollama, then Tesseract (with the `ocr` feature).
    pub fn from_settings(settings: &OcrSettings) -> Result<Self, GradeError> {
        let mut chain = FallbackOcr::default();
        match settings.resolved_api_key() {
            Some(key) => {
                chain = chain.with_backend(Arc::new(cloud_vision::CloudVisionOcr::new(
                    &settings.cloud_endpoint,
                    &key,
                    settings.timeout_secs,
                )?));
            }
            None => tracing::warn!("No cloud vision API key configured, using local OCR only"),
        }
        chain = chain.with_backend(Arc::new(ollama::OllamaVisionOcr::new(
            &settings.ollama_url,
            &settings.ollama_model,
            settings.timeout_secs,
        )?));
        #[cfg(feature = "ocr")]
        if let Some(dir) = &settings.tessdata_dir {
            match tesseract::TesseractOcr::new(dir) {
                Ok(tess) => chain = chain.with_backend(Arc::new(tess)),
                Err(e) => tracing::warn!(error = %e, "Tesseract unavailable"),
            }
        }

        Ok(Self::new(chain, Arc::new(PdfiumRenderer::new()?)).with_dpi(settings.render_dpi))
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.ocr.backend_names()
    }

    pub fn primary_backend(&self) -> Option<&str> {
        self.ocr.primary_name()
    }

    pub fn ocr(&self) -> &FallbackOcr {
        &self.ocr
    }

    pub fn renderer(&self) -> Arc<dyn PageRenderer> {
        Arc::clone(&self.renderer)
    }

    fn check_page_count(pdf_bytes: &[u8], map: &PageMap) -> Result<(), GradeError> {
        let found = lopdf::Document::load_mem(pdf_bytes)?.get_pages().len();
        if found != map.total_pages {
            return Err(GradeError::PageCountMismatch {
                expected: map.total_pages,
                found,
            });
        }
        Ok(())
    }

    fn render_band(&self, pdf_bytes: &[u8], page_index: usize) -> Result<Vec<u8>, GradeError> {
        let page = self.renderer.render_page(pdf_bytes, page_index, self.dpi)?;
        crop_grade_band(&page, self.band_fraction)
    }

    /// Render every section's first page. Rendering stays on one thread.
    fn prepare(&self, pdf_bytes: &[u8], map: &PageMap) -> Result<Vec<PageJob>, GradeError> {
        Self::check_page_count(pdf_bytes, map)?;
        Ok(map
            .entries
            .iter()
            .map(|entry| {
                let band = if entry.placeholder {
                    Ok(Vec::new())
                } else {
                    self.render_band(pdf_bytes, entry.page_start)
                        .map_err(|e| e.to_string())
                };
                PageJob {
                    entry: entry.clone(),
                    band,
                }
            })
            .collect())
    }

    fn grade_job(&self, job: PageJob) -> GradeExtractionResult {
        let entry = &job.entry;
        if entry.placeholder {
            return GradeExtractionResult::base(entry, GradeStatus::NoSubmission);
        }
        let band = match job.band {
            Ok(band) => band,
            Err(reason) => {
                tracing::warn!(student = %entry.student_key, reason = %reason, "Grade band not rendered");
                let mut result = GradeExtractionResult::base(entry, GradeStatus::NoGradeFound);
                result.ocr_errors.push(BackendFailure {
                    backend: "renderer".into(),
                    reason,
                });
                return result;
            }
        };
        match self.ocr.recognize(&band) {
            Ok(read) => score(entry, read),
            Err(failures) => {
                tracing::error!(student = %entry.student_key, backends = failures.len(), "All OCR backends failed");
                let mut result = GradeExtractionResult::base(entry, GradeStatus::OcrUnavailable);
                result.ocr_errors = failures;
                result
            }
        }
    }

    pub fn extract(
        &self,
        graded_pdf: &Path,
        map: &PageMap,
    ) -> Result<Vec<GradeExtractionResult>, GradeError> {
        let bytes = std::fs::read(graded_pdf)?;
        self.extract_bytes(&bytes, map)
    }

    pub fn extract_bytes(
        &self,
        pdf_bytes: &[u8],
        map: &PageMap,
    ) -> Result<Vec<GradeExtractionResult>, GradeError> {
        let _span = tracing::info_span!("extract_grades", students = map.entries.len()).entered();
        let results: Vec<_> = self
            .prepare(pdf_bytes, map)?
            .into_iter()
            .map(|job| self.grade_job(job))
            .collect();
        log_summary(&results);
        Ok(results)
    }

    /// Same as `extract`, with OCR calls spread over at most `workers`
    /// blocking tasks. Results come back in page-map order.
    pub async fn extract_concurrent(
        self: Arc<Self>,
        pdf_bytes: Arc<Vec<u8>>,
        map: PageMap,
        workers: usize,
    ) -> Result<Vec<GradeExtractionResult>, GradeError> {
        let jobs = {
            let extractor = Arc::clone(&self);
            let bytes = Arc::clone(&pdf_bytes);
            tokio::task::spawn_blocking(move || extractor.prepare(&bytes, &map))
                .await
                .map_err(|e| GradeError::Worker(e.to_string()))??
        };

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| GradeError::Worker(e.to_string()))?;
            let extractor = Arc::clone(&self);
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                extractor.grade_job(job)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(|e| GradeError::Worker(e.to_string()))?);
        }
        log_summary(&results);
        Ok(results)
    }
}

/// Parse and band one successful read.
fn score(entry: &PageMapEntry, read: FallbackReading) -> GradeExtractionResult {
    let parsed = parse_grade(&read.reading.text);
    let confidence = read
        .reading
        .confidence
        .unwrap_or_else(|| heuristic_confidence(parsed.as_ref()));

    let status = match &parsed {
        None => GradeStatus::NoGradeFound,
        Some(grade) => match classify(confidence) {
            ConfidenceBand::Accepted if grade.exceeds_denominator() => GradeStatus::LowConfidence,
            ConfidenceBand::Accepted => GradeStatus::Accepted,
            ConfidenceBand::LowConfidence => GradeStatus::LowConfidence,
            ConfidenceBand::NoGradeFound => GradeStatus::NoGradeFound,
        },
    };

    let fallback_used = read.fallback_used();
    let FallbackReading {
        reading,
        backend,
        failures,
    } = read;
    let mut result = GradeExtractionResult::base(entry, status);
    result.raw_ocr_text = reading.text;
    result.confidence = Some(confidence);
    result.fallback_used = fallback_used;
    result.ocr_errors = failures;
    result.backend = Some(backend);
    if status != GradeStatus::NoGradeFound {
        if let Some(grade) = parsed {
            result.parsed_grade = Some(grade.value);
            result.denominator = grade.denominator;
        }
    }
    tracing::debug!(
        student = %result.student_key,
        grade = ?result.parsed_grade,
        confidence,
        status = ?result.status,
        "Grade read"
    );
    result
}

fn log_summary(results: &[GradeExtractionResult]) {
    let count = |status: GradeStatus| results.iter().filter(|r| r.status == status).count();
    tracing::info!(
        students = results.len(),
        accepted = count(GradeStatus::Accepted),
        low_confidence = count(GradeStatus::LowConfidence),
        no_grade = count(GradeStatus::NoGradeFound),
        no_submission = count(GradeStatus::NoSubmission),
        ocr_unavailable = count(GradeStatus::OcrUnavailable),
        "Grade extraction complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::combine::tests::fixture_pdf;
    use crate::pipeline::combine::SegmentRef;
    use crate::pipeline::naming::MatchMethod;

    fn section(key: &str, start: usize, pages: usize, method: MatchMethod) -> PageMapEntry {
        PageMapEntry {
            student_key: key.into(),
            page_start: start,
            page_count: pages,
            source_pdf_path: Some(format!("{key}.pdf")),
            segments: vec![SegmentRef {
                relative_path: format!("{key}.pdf"),
                page_count: pages,
            }],
            match_method: method,
            placeholder: false,
        }
    }

    fn placeholder(key: &str, start: usize) -> PageMapEntry {
        PageMapEntry {
            student_key: key.into(),
            page_start: start,
            page_count: 1,
            source_pdf_path: None,
            segments: Vec::new(),
            match_method: MatchMethod::Unmatched,
            placeholder: true,
        }
    }

    /// amy (pages 0-1), ben (2), cal placeholder (3), dee fuzzy (4-5).
    fn class_map() -> (PageMap, Vec<u8>) {
        let map = PageMap::new(
            vec![
                section("amy", 0, 2, MatchMethod::Exact),
                section("ben", 2, 1, MatchMethod::Partial),
                placeholder("cal", 3),
                section("dee", 4, 2, MatchMethod::Fuzzy),
            ],
            6,
        );
        map.validate().unwrap();
        (map, fixture_pdf(&["a1", "a2", "b1", "none", "d1", "d2"]))
    }

    fn scripted() -> MockOcr {
        MockOcr::new("", None)
            .with_page(0, "8/10", Some(0.75))
            .with_page(2, "6/10", Some(0.55))
            .with_page(4, "5", Some(0.2))
    }

    fn extractor(ocr: FallbackOcr, renderer: Arc<MockPageRenderer>) -> GradeExtractor {
        GradeExtractor::new(ocr, renderer)
    }

    #[test]
    fn confidence_bands_applied_per_student() {
        let (map, pdf) = class_map();
        let ocr = Arc::new(scripted());
        let results = extractor(FallbackOcr::default().with_backend(ocr.clone()), Arc::new(MockPageRenderer::new(6)))
            .extract_bytes(&pdf, &map)
            .unwrap();

        let keys: Vec<_> = results.iter().map(|r| r.student_key.as_str()).collect();
        assert_eq!(keys, vec!["amy", "ben", "cal", "dee"]);

        assert_eq!(results[0].status, GradeStatus::Accepted);
        assert_eq!(results[0].parsed_grade, Some(8.0));
        assert_eq!(results[0].denominator, Some(10.0));
        assert!(!results[0].needs_verify());

        assert_eq!(results[1].status, GradeStatus::LowConfidence);
        assert!(results[1].flags.low_confidence);
        assert_eq!(results[1].parsed_grade, Some(6.0));
        assert!(results[1].to_grade_write().needs_verify);

        assert_eq!(results[3].status, GradeStatus::NoGradeFound);
        assert!(results[3].flags.no_grade_found);
        assert_eq!(results[3].parsed_grade, None);
        assert!(results[3].flags.fuzzy_matched);
        assert!(results[3].needs_verify());
    }

    #[test]
    fn placeholder_is_no_submission_without_ocr() {
        let (map, pdf) = class_map();
        let ocr = Arc::new(scripted());
        let renderer = Arc::new(MockPageRenderer::new(6));
        let results = extractor(FallbackOcr::default().with_backend(ocr.clone()), renderer.clone())
            .extract_bytes(&pdf, &map)
            .unwrap();

        let cal = &results[2];
        assert_eq!(cal.status, GradeStatus::NoSubmission);
        assert!(cal.flags.no_submission);
        assert_eq!(cal.confidence, None);
        assert_eq!(cal.backend, None);
        assert_eq!(ocr.calls(), 3);
        assert_eq!(renderer.rendered(), vec![0, 2, 4]);
    }

    #[test]
    fn failing_primary_uses_fallback_for_every_page() {
        let (map, pdf) = class_map();
        let primary = Arc::new(FailingOcr::new("cloud_vision"));
        let local = Arc::new(scripted().named("ollama_vision"));
        let results = extractor(
            FallbackOcr::default()
                .with_backend(primary.clone())
                .with_backend(local.clone()),
            Arc::new(MockPageRenderer::new(6)),
        )
        .extract_bytes(&pdf, &map)
        .unwrap();

        assert_eq!(primary.calls(), 3);
        assert_eq!(local.calls(), 3);
        for r in results.iter().filter(|r| !r.flags.no_submission) {
            assert!(r.fallback_used);
            assert_eq!(r.backend.as_deref(), Some("ollama_vision"));
            assert_eq!(r.ocr_errors[0].backend, "cloud_vision");
        }
        assert_eq!(results[0].status, GradeStatus::Accepted);
        assert_eq!(results[0].raw_ocr_text, "8/10");
        assert_eq!(results[0].confidence, Some(0.75));
        assert_eq!(results[0].ocr_errors.len(), 1);
    }

    #[test]
    fn all_backends_failing_is_ocr_unavailable() {
        let (map, pdf) = class_map();
        let chain = FallbackOcr::default()
            .with_backend(Arc::new(FailingOcr::new("cloud_vision")))
            .with_backend(Arc::new(FailingOcr::new("ollama_vision")));
        let results = extractor(chain, Arc::new(MockPageRenderer::new(6)))
            .extract_bytes(&pdf, &map)
            .unwrap();

        let amy = &results[0];
        assert_eq!(amy.status, GradeStatus::OcrUnavailable);
        assert!(amy.flags.no_grade_found);
        assert_eq!(amy.parsed_grade, None);
        assert_eq!(amy.ocr_errors.len(), 2);
        assert_eq!(results[2].status, GradeStatus::NoSubmission);
    }

    #[test]
    fn grade_above_denominator_is_demoted() {
        let (map, pdf) = class_map();
        let ocr = MockOcr::new("", None).with_page(0, "12/10", Some(0.95));
        let results = extractor(FallbackOcr::default().with_backend(Arc::new(ocr)), Arc::new(MockPageRenderer::new(6)))
            .extract_bytes(&pdf, &map)
            .unwrap();
        assert_eq!(results[0].status, GradeStatus::LowConfidence);
        assert_eq!(results[0].parsed_grade, Some(12.0));
        assert!(results[0].flags.low_confidence);
    }

    #[test]
    fn heuristic_confidence_without_native_score() {
        let (map, pdf) = class_map();
        let ocr = MockOcr::new("", None).with_page(0, "9", None).with_page(2, "7 or 8", None);
        let results = extractor(FallbackOcr::default().with_backend(Arc::new(ocr)), Arc::new(MockPageRenderer::new(6)))
            .extract_bytes(&pdf, &map)
            .unwrap();
        assert_eq!(results[0].status, GradeStatus::Accepted);
        assert_eq!(results[0].confidence, Some(0.8));
        assert_eq!(results[1].status, GradeStatus::LowConfidence);
        // blank band
        assert_eq!(results[3].status, GradeStatus::NoGradeFound);
        assert_eq!(results[3].confidence, Some(0.0));
    }

    #[test]
    fn page_count_mismatch_rejected() {
        let (map, _) = class_map();
        let short = fixture_pdf(&["only", "three", "pages"]);
        let err = extractor(FallbackOcr::default().with_backend(Arc::new(scripted())), Arc::new(MockPageRenderer::new(6)))
            .extract_bytes(&short, &map)
            .unwrap_err();
        assert!(matches!(
            err,
            GradeError::PageCountMismatch { expected: 6, found: 3 }
        ));
    }

    #[test]
    fn render_failure_is_no_grade() {
        let (map, pdf) = class_map();
        // renderer only knows the first three pages
        let results = extractor(FallbackOcr::default().with_backend(Arc::new(scripted())), Arc::new(MockPageRenderer::new(3)))
            .extract_bytes(&pdf, &map)
            .unwrap();
        assert_eq!(results[3].status, GradeStatus::NoGradeFound);
        assert_eq!(results[3].ocr_errors[0].backend, "renderer");
    }

    #[tokio::test]
    async fn concurrent_extraction_keeps_page_map_order() {
        let (map, pdf) = class_map();
        let ocr = Arc::new(scripted());
        let extractor = Arc::new(extractor(
            FallbackOcr::default().with_backend(ocr.clone()),
            Arc::new(MockPageRenderer::new(6)),
        ));

        let sequential = extractor.extract_bytes(&pdf, &map).unwrap();
        let concurrent = Arc::clone(&extractor)
            .extract_concurrent(Arc::new(pdf), map, 2)
            .await
            .unwrap();
        assert_eq!(concurrent, sequential);
        assert_eq!(ocr.calls(), 6);
    }
}
