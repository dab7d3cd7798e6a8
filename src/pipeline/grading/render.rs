//! Page rasterization via Google PDFium and the grade band crop.
//!
//! `PdfiumRenderer` is stateless (`Send + Sync`). Each render creates a fresh
//! `Pdfium` instance because the upstream type is `!Send`; the OS caches the
//! library load, so repeat loads are near-free.

use std::io::Cursor;
use std::sync::Mutex;

use image::{DynamicImage, GenericImageView, ImageOutputFormat, Rgb, RgbImage};
use pdfium_render::prelude::*;
use tracing::{debug, warn};

use super::GradeError;

/// Maximum width or height of a rendered page.
const MAX_DIMENSION_PX: u32 = 4096;

/// PDF points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Renders one page of a PDF to PNG bytes.
pub trait PageRenderer: Send + Sync {
    fn render_page(&self, pdf_bytes: &[u8], page_index: usize, dpi: u32)
        -> Result<Vec<u8>, GradeError>;
}

pub struct PdfiumRenderer;

impl PdfiumRenderer {
    /// Fails fast when the PDFium library cannot be loaded.
    ///
    /// Discovery order:
    /// 1. `PDFIUM_DYNAMIC_LIB_PATH` env var (explicit path to library file)
    /// 2. Alongside the running executable
    /// 3. System library search paths
    pub fn new() -> Result<Self, GradeError> {
        let _ = load_pdfium()?;
        Ok(Self)
    }
}

fn load_pdfium() -> Result<Pdfium, GradeError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        debug!(path = %path, "Loading PDFium from env var");
        let bindings = Pdfium::bind_to_library(&path).map_err(|e| GradeError::Rendering {
            page: 0,
            reason: format!("Failed to load PDFium from {path}: {e}"),
        })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.to_path_buf()))
    {
        let lib_path =
            Pdfium::pdfium_platform_library_name_at_path(exe_dir.to_string_lossy().as_ref());
        if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
            debug!(dir = %exe_dir.display(), "Loaded PDFium next to executable");
            return Ok(Pdfium::new(bindings));
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| GradeError::Rendering {
        page: 0,
        reason: format!("PDFium library not found. Set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"),
    })?;
    Ok(Pdfium::new(bindings))
}

/// Pixel size for a page, both sides clamped to [1, MAX_DIMENSION_PX] with
/// the aspect ratio kept.
fn compute_render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let max_dim = raw_w.max(raw_h);
    if max_dim > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / max_dim;
        let w = ((raw_w * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        let h = ((raw_h * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        (w, h)
    } else {
        (raw_w as u32, raw_h as u32)
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, GradeError> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .map_err(|e| GradeError::Image(format!("PNG encoding failed: {e}")))?;
    Ok(cursor.into_inner())
}

impl PageRenderer for PdfiumRenderer {
    fn render_page(
        &self,
        pdf_bytes: &[u8],
        page_index: usize,
        dpi: u32,
    ) -> Result<Vec<u8>, GradeError> {
        let pdfium = load_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf_bytes, None)
            .map_err(|e| GradeError::Rendering {
                page: page_index,
                reason: format!("Failed to load PDF: {e}"),
            })?;
        let pages = document.pages();
        let index = u16::try_from(page_index).map_err(|_| GradeError::Rendering {
            page: page_index,
            reason: format!("Page index {page_index} exceeds u16 maximum"),
        })?;
        let page = pages.get(index).map_err(|_| GradeError::Rendering {
            page: page_index,
            reason: format!(
                "Page {page_index} out of range (document has {} pages)",
                pages.len()
            ),
        })?;

        let (target_w, target_h) =
            compute_render_dimensions(page.width().value, page.height().value, dpi);
        if target_w == MAX_DIMENSION_PX || target_h == MAX_DIMENSION_PX {
            warn!(page = page_index, width = target_w, height = target_h, "Page dimensions capped");
        }

        let config = PdfRenderConfig::new()
            .set_target_width(target_w as i32)
            .set_maximum_height(target_h as i32);
        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| GradeError::Rendering {
                page: page_index,
                reason: format!("Rendering failed: {e}"),
            })?;

        let png = encode_png(&bitmap.as_image())?;
        debug!(page = page_index, width = target_w, height = target_h, png_size = png.len(), "Rendered page");
        Ok(png)
    }
}

fn crop_rows(png: &[u8], fraction: f32, from_bottom: bool) -> Result<Vec<u8>, GradeError> {
    let image = image::load_from_memory(png)
        .map_err(|e| GradeError::Image(format!("PNG decoding failed: {e}")))?;
    let (width, height) = image.dimensions();
    let band = ((height as f32 * fraction.clamp(0.0, 1.0)).round() as u32).clamp(1, height.max(1));
    let top = if from_bottom { height - band } else { 0 };
    encode_png(&image.crop_imm(0, top, width, band))
}

/// Keep the top `fraction` of the page, where the grade is written.
pub fn crop_grade_band(png: &[u8], fraction: f32) -> Result<Vec<u8>, GradeError> {
    crop_rows(png, fraction, false)
}

/// Keep the bottom `fraction` of the page, where section watermarks sit.
pub fn crop_footer_band(png: &[u8], fraction: f32) -> Result<Vec<u8>, GradeError> {
    crop_rows(png, fraction, true)
}

// ── Mock for testing ──────────────────────────────────────

/// Blue channel value marking a tagged mock page.
const TAG_MARKER: u8 = 0xA5;

/// Page index painted into the first pixel by `MockPageRenderer`.
pub fn page_tag(png: &[u8]) -> Option<u32> {
    let image = image::load_from_memory(png).ok()?;
    let pixel = image.get_pixel(0, 0).0;
    (pixel[2] == TAG_MARKER).then(|| u32::from(pixel[0]) | (u32::from(pixel[1]) << 8))
}

/// White pages with the page index painted into the first pixel.
pub struct MockPageRenderer {
    page_count: usize,
    rendered: Mutex<Vec<usize>>,
}

impl MockPageRenderer {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            rendered: Mutex::new(Vec::new()),
        }
    }

    /// Page indexes rendered so far.
    pub fn rendered(&self) -> Vec<usize> {
        self.rendered.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl PageRenderer for MockPageRenderer {
    fn render_page(
        &self,
        _pdf_bytes: &[u8],
        page_index: usize,
        _dpi: u32,
    ) -> Result<Vec<u8>, GradeError> {
        if page_index >= self.page_count {
            return Err(GradeError::Rendering {
                page: page_index,
                reason: format!("Page {page_index} out of range (mock has {} pages)", self.page_count),
            });
        }
        if let Ok(mut rendered) = self.rendered.lock() {
            rendered.push(page_index);
        }
        let mut image = RgbImage::from_pixel(40, 100, Rgb([255, 255, 255]));
        image.put_pixel(
            0,
            0,
            Rgb([(page_index & 0xFF) as u8, ((page_index >> 8) & 0xFF) as u8, TAG_MARKER]),
        );
        encode_png(&DynamicImage::ImageRgb8(image))
    }
}
