//! OCR backend seam and the ordered fallback chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::render::page_tag;
use super::GradeError;

/// Text read from one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrReading {
    pub text: String,
    /// Native backend confidence in [0, 1], when the backend reports one.
    pub confidence: Option<f32>,
}

impl OcrReading {
    pub fn new(text: &str, confidence: Option<f32>) -> Self {
        Self {
            text: text.to_string(),
            confidence,
        }
    }
}

/// Reads text from a PNG image.
pub trait OcrBackend: Send + Sync {
    fn name(&self) -> &str;

    fn recognize(&self, png: &[u8]) -> Result<OcrReading, GradeError>;
}

/// A backend that gave up on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend: String,
    pub reason: String,
}

/// Successful read and the backends that failed before it.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackReading {
    pub reading: OcrReading,
    pub backend: String,
    pub failures: Vec<BackendFailure>,
}

impl FallbackReading {
    pub fn fallback_used(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Tries each backend in order; the first one is the primary.
#[derive(Clone, Default)]
pub struct FallbackOcr {
    backends: Vec<Arc<dyn OcrBackend>>,
}

impl FallbackOcr {
    pub fn new(backends: Vec<Arc<dyn OcrBackend>>) -> Self {
        Self { backends }
    }

    pub fn with_backend(mut self, backend: Arc<dyn OcrBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn primary_name(&self) -> Option<&str> {
        self.backends.first().map(|b| b.name())
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// `Err` carries every backend's failure when none could read the page.
    pub fn recognize(&self, png: &[u8]) -> Result<FallbackReading, Vec<BackendFailure>> {
        let mut failures = Vec::new();
        for backend in &self.backends {
            match backend.recognize(png) {
                Ok(reading) => {
                    if !failures.is_empty() {
                        tracing::warn!(
                            backend = backend.name(),
                            failed = failures.len(),
                            "OCR fallback backend used"
                        );
                    }
                    return Ok(FallbackReading {
                        reading,
                        backend: backend.name().to_string(),
                        failures,
                    });
                }
                Err(e) => {
                    tracing::warn!(backend = backend.name(), error = %e, "OCR backend failed");
                    failures.push(BackendFailure {
                        backend: backend.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Err(failures)
    }
}

// ── Mocks for testing ─────────────────────────────────────

/// Returns scripted readings. Pages rendered by `MockPageRenderer` are told
/// apart by their tag; untagged or unscripted images get the default.
pub struct MockOcr {
    name: String,
    default: OcrReading,
    by_page: HashMap<u32, OcrReading>,
    calls: AtomicUsize,
}

impl MockOcr {
    pub fn new(text: &str, confidence: Option<f32>) -> Self {
        Self {
            name: "mock".to_string(),
            default: OcrReading::new(text, confidence),
            by_page: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Reading for the page rendered from zero-based index `page`.
    pub fn with_page(mut self, page: usize, text: &str, confidence: Option<f32>) -> Self {
        self.by_page
            .insert(page as u32, OcrReading::new(text, confidence));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrBackend for MockOcr {
    fn name(&self) -> &str {
        &self.name
    }

    fn recognize(&self, png: &[u8]) -> Result<OcrReading, GradeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(page_tag(png)
            .and_then(|tag| self.by_page.get(&tag))
            .unwrap_or(&self.default)
            .clone())
    }
}

/// Always fails, counting the attempts.
pub struct FailingOcr {
    name: String,
    calls: AtomicUsize,
}

impl FailingOcr {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrBackend for FailingOcr {
    fn name(&self) -> &str {
        &self.name
    }

    fn recognize(&self, _png: &[u8]) -> Result<OcrReading, GradeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(GradeError::Ocr {
            backend: self.name.clone(),
            reason: "service unavailable".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_success_wins() {
        let primary = Arc::new(MockOcr::new("8/10", Some(0.9)).named("primary"));
        let second = Arc::new(MockOcr::new("1/10", Some(0.9)).named("second"));
        let chain = FallbackOcr::default()
            .with_backend(primary.clone())
            .with_backend(second.clone());

        let read = chain.recognize(b"png").unwrap();
        assert_eq!(read.backend, "primary");
        assert!(!read.fallback_used());
        assert_eq!(primary.calls(), 1);
        assert_eq!(second.calls(), 0);
    }

    #[test]
    fn failing_primary_falls_back() {
        let primary = Arc::new(FailingOcr::new("cloud"));
        let local = Arc::new(MockOcr::new("7", None).named("local"));
        let chain = FallbackOcr::default()
            .with_backend(primary.clone())
            .with_backend(local);

        let read = chain.recognize(b"png").unwrap();
        assert_eq!(read.backend, "local");
        assert!(read.fallback_used());
        assert_eq!(read.failures[0].backend, "cloud");
        assert_eq!(chain.primary_name(), Some("cloud"));
    }

    #[test]
    fn all_failing_reports_every_backend() {
        let chain = FallbackOcr::default()
            .with_backend(Arc::new(FailingOcr::new("a")))
            .with_backend(Arc::new(FailingOcr::new("b")));
        let failures = chain.recognize(b"png").unwrap_err();
        assert_eq!(failures.len(), 2);
        assert_eq!(chain.backend_names(), vec!["a", "b"]);
    }

    #[test]
    fn empty_chain_fails() {
        let chain = FallbackOcr::default();
        assert!(chain.is_empty());
        assert!(chain.recognize(b"png").unwrap_err().is_empty());
    }
}
