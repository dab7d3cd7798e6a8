//! Bundled Tesseract backend (last local fallback).
//! Only available when compiled with the `ocr` feature flag.

use std::path::{Path, PathBuf};

use super::backend::{OcrBackend, OcrReading};
use super::GradeError;

const BACKEND_NAME: &str = "tesseract";

pub struct TesseractOcr {
    tessdata_dir: PathBuf,
    lang: String,
}

impl TesseractOcr {
    pub fn new(tessdata_dir: &Path) -> Result<Self, GradeError> {
        if !tessdata_dir.join("eng.traineddata").exists() {
            return Err(GradeError::Ocr {
                backend: BACKEND_NAME.into(),
                reason: format!("eng.traineddata not found in {}", tessdata_dir.display()),
            });
        }
        Ok(Self {
            tessdata_dir: tessdata_dir.to_path_buf(),
            lang: "eng".to_string(),
        })
    }
}

impl OcrBackend for TesseractOcr {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn recognize(&self, png: &[u8]) -> Result<OcrReading, GradeError> {
        let failed = |reason: String| GradeError::Ocr {
            backend: BACKEND_NAME.into(),
            reason,
        };
        let tessdata = self
            .tessdata_dir
            .to_str()
            .ok_or_else(|| failed("Invalid tessdata path".into()))?;

        let tess = tesseract::Tesseract::new(Some(tessdata), Some(&self.lang))
            .map_err(|e| failed(format!("{e:?}")))?;
        let mut tess = tess
            .set_variable("tessedit_char_whitelist", "0123456789./ ")
            .map_err(|e| failed(format!("{e:?}")))?
            .set_image_from_mem(png)
            .map_err(|e| failed(format!("{e:?}")))?;
        let text = tess.get_text().map_err(|e| failed(format!("{e:?}")))?;
        let confidence = tess.mean_text_conf().max(0) as f32 / 100.0;

        tracing::debug!(text_len = text.len(), confidence, "Tesseract OCR complete");
        Ok(OcrReading {
            text: text.trim().to_string(),
            confidence: Some(confidence),
        })
    }
}
