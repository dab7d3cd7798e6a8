//! Marker page for students without a usable submission.

use std::io::BufWriter;

use printpdf::*;

use super::CombineError;
use crate::pipeline::consolidate::PLACEHOLDER_MARKER;
use crate::pipeline::roster::RosterEntry;

/// One US Letter page naming the student. Returns PDF bytes.
pub fn placeholder_pdf(entry: &RosterEntry) -> Result<Vec<u8>, CombineError> {
    let (doc, page1, layer1) = PdfDocument::new("No submission", Mm(215.9), Mm(279.4), "Layer 1");
    let layer = doc.get_page(page1).get_layer(layer1);
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| CombineError::Placeholder(format!("PDF font error: {e}")))?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| CombineError::Placeholder(format!("PDF font error: {e}")))?;

    let mut y = Mm(230.0);
    layer.use_text("NO SUBMISSION", 28.0, Mm(25.0), y, &bold);
    y -= Mm(16.0);
    layer.use_text(entry.full_name(), 16.0, Mm(25.0), y, &font);
    y -= Mm(9.0);
    layer.use_text(
        format!("Username: {}", entry.username.trim_start_matches('#')),
        11.0,
        Mm(25.0),
        y,
        &font,
    );
    y -= Mm(6.0);
    if !entry.org_defined_id.is_empty() {
        layer.use_text(
            format!("Org Defined ID: {}", entry.org_defined_id.trim_start_matches('#')),
            11.0,
            Mm(25.0),
            y,
            &font,
        );
        y -= Mm(6.0);
    }
    y -= Mm(10.0);
    layer.use_text(PLACEHOLDER_MARKER, 8.0, Mm(25.0), y, &font);

    let mut buf = BufWriter::new(Vec::new());
    doc.save(&mut buf)
        .map_err(|e| CombineError::Placeholder(format!("PDF save error: {e}")))?;
    buf.into_inner()
        .map_err(|e| CombineError::Placeholder(format!("PDF buffer error: {e}")))
}
