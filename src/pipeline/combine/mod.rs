//! CombinedDocumentBuilder: one PDF for the whole class, in grading order.
//!
//! Students are ordered by last name, first name, then roster row. Each
//! student section starts with a watermarked page; students without a
//! submission get a generated marker page. The resulting `PageMap` is
//! validated before it is returned and saved as a JSON sidecar.

pub mod merge;
pub mod page_map;
pub mod placeholder;
pub mod watermark;

pub use page_map::{PageMap, PageMapEntry, SegmentRef, SIDECAR_EXTENSION};
pub use watermark::Watermark;

use std::path::{Path, PathBuf};

use lopdf::{Document, ObjectId};
use serde::Serialize;
use thiserror::Error;

use super::archive::resolve_relative;
use super::consolidate::{Consolidation, StudentSubmissions};
use super::naming::MatchMethod;
use merge::Merger;
use placeholder::placeholder_pdf;
use watermark::{read_watermark, stamp_page};

#[derive(Error, Debug)]
pub enum CombineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Placeholder page generation failed: {0}")]
    Placeholder(String),

    #[error("Invalid page map: {0}")]
    InvalidPageMap(String),

    #[error("Student key '{0}' cannot be written into a section watermark")]
    UnstampableKey(String),

    #[error("No watermark found on page {page}")]
    MissingWatermark { page: usize },

    #[error("Document has no pages")]
    EmptyDocument,

    #[error("No students to combine")]
    NoStudents,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A submission PDF left out of the combined document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedPdf {
    pub student_key: String,
    pub relative_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CombinedDocument {
    pub path: PathBuf,
    pub sidecar: PathBuf,
    pub page_map: PageMap,
    pub skipped: Vec<SkippedPdf>,
}

/// Students in grading order (stable, case-insensitive).
pub fn grading_order(students: &[StudentSubmissions]) -> Vec<&StudentSubmissions> {
    let mut ordered: Vec<&StudentSubmissions> = students.iter().collect();
    ordered.sort_by_key(|s| {
        (
            s.entry.last_name.trim().to_lowercase(),
            s.entry.first_name.trim().to_lowercase(),
            s.entry.row_index,
        )
    });
    ordered
}

/// Open a submission PDF. Unreadable or empty files are reported, not fatal.
fn load_submission(path: &Path) -> Result<Document, String> {
    let doc = Document::load(path).map_err(|e| e.to_string())?;
    if doc.get_pages().is_empty() {
        return Err("PDF has no pages".to_string());
    }
    Ok(doc)
}

/// Page count of each usable PDF, in the order `build` consumes them.
pub fn usable_segments(
    processing: &Path,
    student_key: &str,
    pdf_paths: &[String],
) -> (Vec<SegmentRef>, Vec<SkippedPdf>) {
    let mut segments = Vec::new();
    let mut skipped = Vec::new();
    for rel in pdf_paths {
        match load_submission(&resolve_relative(processing, rel)) {
            Ok(doc) => segments.push(SegmentRef {
                relative_path: rel.clone(),
                page_count: doc.get_pages().len(),
            }),
            Err(reason) => skipped.push(SkippedPdf {
                student_key: student_key.to_string(),
                relative_path: rel.clone(),
                reason,
            }),
        }
    }
    (segments, skipped)
}

pub fn build(
    consolidation: &Consolidation,
    processing: &Path,
    output: &Path,
) -> Result<CombinedDocument, CombineError> {
    let _span = tracing::info_span!("combine", output = %output.display()).entered();
    if consolidation.students.is_empty() {
        return Err(CombineError::NoStudents);
    }

    let mut merger = Merger::new();
    let mut entries = Vec::with_capacity(consolidation.students.len());
    let mut skipped = Vec::new();

    for student in grading_order(&consolidation.students) {
        let key = student.student_key();
        let start = merger.page_count();
        let mut segments = Vec::new();
        let mut first_page: Option<ObjectId> = None;

        if !student.placeholder {
            for rel in student.pdf_paths() {
                match load_submission(&resolve_relative(processing, &rel)) {
                    Ok(doc) => {
                        let ids = merger.append(doc)?;
                        first_page = first_page.or_else(|| ids.first().copied());
                        segments.push(SegmentRef {
                            relative_path: rel,
                            page_count: ids.len(),
                        });
                    }
                    Err(reason) => {
                        tracing::warn!(student = %key, path = %rel, reason = %reason, "Skipping unreadable PDF");
                        skipped.push(SkippedPdf {
                            student_key: key.clone(),
                            relative_path: rel,
                            reason,
                        });
                    }
                }
            }
        }

        let placeholder = segments.is_empty();
        let (watermark, match_method) = if placeholder {
            let marker = Document::load_mem(&placeholder_pdf(&student.entry)?)?;
            first_page = merger.append(marker)?.first().copied();
            (Watermark::placeholder(&key), MatchMethod::Unmatched)
        } else {
            let pages = segments.iter().map(|s| s.page_count).collect();
            (
                Watermark::for_student(&key, student.match_method, pages),
                student.match_method,
            )
        };
        if let Some(page_id) = first_page {
            stamp_page(merger.document_mut(), page_id, &watermark)?;
        }

        tracing::debug!(
            student = %key,
            page_start = start,
            pages = merger.page_count() - start,
            placeholder,
            "Student section added"
        );
        entries.push(PageMapEntry {
            student_key: key,
            page_start: start,
            page_count: merger.page_count() - start,
            source_pdf_path: segments.first().map(|s| s.relative_path.clone()),
            segments,
            match_method,
            placeholder,
        });
    }

    let mut doc = merger.finish();
    let page_map = PageMap::new(entries, doc.get_pages().len());
    page_map.validate()?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    doc.save(output)?;
    let sidecar = PageMap::sidecar_path(output);
    page_map.save(&sidecar)?;

    tracing::info!(
        students = page_map.entries.len(),
        pages = page_map.total_pages,
        skipped = skipped.len(),
        "Combined PDF built"
    );
    Ok(CombinedDocument {
        path: output.to_path_buf(),
        sidecar,
        page_map,
        skipped,
    })
}

// ═══════════════════════════════════════════════════════════
// Page map recovery
// ═══════════════════════════════════════════════════════════

/// Rebuild the page map from section watermarks. `fallback` is asked for
/// the watermark of a section's first page (zero-based index) when no
/// watermark is found in its content streams.
pub fn recover_page_map<F>(doc: &Document, mut fallback: F) -> Result<PageMap, CombineError>
where
    F: FnMut(usize) -> Option<Watermark>,
{
    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    let mut entries = Vec::new();
    let mut idx = 0usize;

    while idx < pages.len() {
        let wm = read_watermark(doc, pages[idx])
            .or_else(|| fallback(idx))
            .ok_or(CombineError::MissingWatermark { page: idx + 1 })?;
        let count = wm.page_count();
        if idx + count > pages.len() {
            return Err(CombineError::InvalidPageMap(format!(
                "section for '{}' runs past the last page",
                wm.student_key
            )));
        }
        entries.push(PageMapEntry {
            student_key: wm.student_key.clone(),
            page_start: idx,
            page_count: count,
            source_pdf_path: None,
            segments: wm
                .segment_pages
                .iter()
                .map(|n| SegmentRef {
                    relative_path: String::new(),
                    page_count: *n,
                })
                .collect(),
            match_method: wm.match_method.unwrap_or(MatchMethod::Unmatched),
            placeholder: wm.is_placeholder(),
        });
        idx += count;
    }

    let map = PageMap::new(entries, pages.len());
    map.validate()?;
    tracing::info!(students = map.entries.len(), pages = map.total_pages, "Page map recovered from watermarks");
    Ok(map)
}

/// Fill in source paths of a recovered map from a fresh consolidation of the
/// same processing folder.
pub fn relink(
    map: &mut PageMap,
    consolidation: &Consolidation,
    processing: &Path,
) -> Result<(), CombineError> {
    for entry in map.entries.iter_mut().filter(|e| !e.placeholder) {
        let student = consolidation.student(&entry.student_key).ok_or_else(|| {
            CombineError::InvalidPageMap(format!(
                "student '{}' is not in the roster",
                entry.student_key
            ))
        })?;
        let (segments, _) = usable_segments(processing, &entry.student_key, &student.pdf_paths());
        let recovered: Vec<usize> = entry.segments.iter().map(|s| s.page_count).collect();
        let found: Vec<usize> = segments.iter().map(|s| s.page_count).collect();
        if recovered != found {
            return Err(CombineError::InvalidPageMap(format!(
                "submission PDFs for '{}' no longer match the combined document",
                entry.student_key
            )));
        }
        entry.source_pdf_path = segments.first().map(|s| s.relative_path.clone());
        entry.segments = segments;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::archive::RawEntry;
    use crate::pipeline::consolidate::consolidate;
    use crate::pipeline::naming::NameResolver;
    use crate::pipeline::roster::RosterEntry;
    use lopdf::content::Content;
    use lopdf::{dictionary, Object, Stream};

    /// PDF with one text line per page. Pages inherit MediaBox and
    /// Resources from the page tree root.
    pub(crate) fn fixture_pdf(texts: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.4");
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let pages_id = doc.new_object_id();
        let mut kids = Vec::new();
        for text in texts {
            let content = format!("BT /F1 12 Tf 72 700 Td ({text}) Tj ET\n");
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Count" => kids.len() as i64,
                "Kids" => kids,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Resources" => dictionary! {
                    "Font" => dictionary! { "F1" => font_id },
                },
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut buf = Vec::new();
        doc.save_to(&mut buf).unwrap();
        buf
    }

    pub(crate) fn write_fixture(root: &Path, rel: &str, texts: &[&str]) {
        let path = resolve_relative(root, rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, fixture_pdf(texts)).unwrap();
    }

    /// First non-watermark text shown on each page ("" when none).
    pub(crate) fn page_texts(bytes: &[u8]) -> Vec<String> {
        let doc = Document::load_mem(bytes).unwrap();
        doc.get_pages()
            .values()
            .map(|page_id| {
                let content = doc.get_page_content(*page_id).unwrap_or_default();
                Content::decode(&content)
                    .map(|c| {
                        c.operations
                            .iter()
                            .filter(|op| op.operator == "Tj")
                            .filter_map(|op| match op.operands.first() {
                                Some(Object::String(s, _)) => {
                                    Some(String::from_utf8_lossy(s).to_string())
                                }
                                _ => None,
                            })
                            .find(|t| !t.starts_with(watermark::PREFIX))
                            .unwrap_or_default()
                    })
                    .unwrap_or_default()
            })
            .collect()
    }

    pub(crate) fn roster_entry(username: &str, first: &str, last: &str, row: usize) -> RosterEntry {
        RosterEntry {
            org_defined_id: format!("#{}", 1000 + row),
            username: format!("#{username}"),
            first_name: first.into(),
            last_name: last.into(),
            email: format!("{username}@school.edu"),
            grade_value: None,
            verify_flag: false,
            row_index: row,
        }
    }

    pub(crate) fn raw_entry(folder_name: &str, pdfs: &[&str]) -> RawEntry {
        let parsed = crate::pipeline::archive::parse_folder_name(folder_name).unwrap();
        RawEntry {
            folder_name: folder_name.into(),
            display_name: parsed.display_name,
            submission_id: parsed.submission_id,
            submitted_at: parsed.submitted_at,
            relative_dir: format!("Lab/{folder_name}"),
            pdf_paths: pdfs
                .iter()
                .map(|p| format!("Lab/{folder_name}/{p}"))
                .collect(),
        }
    }

    /// Three students: Doe (two PDFs), Chan (nothing), Adams (one PDF).
    fn scenario(root: &Path) -> Consolidation {
        let jane = "1-1 - Jane Doe - Jan 5, 2024 900 AM";
        let zoe = "2-2 - Zoe Adams - Jan 5, 2024 901 AM";
        write_fixture(root, &format!("Lab/{jane}/a.pdf"), &["j1", "j2"]);
        write_fixture(root, &format!("Lab/{jane}/b.pdf"), &["j3"]);
        write_fixture(root, &format!("Lab/{zoe}/z.pdf"), &["z1", "z2", "z3"]);
        let roster = vec![
            roster_entry("jdoe", "Jane", "Doe", 0),
            roster_entry("bchan", "Bo", "Chan", 1),
            roster_entry("zadams", "Zoe", "Adams", 2),
        ];
        let folders = vec![raw_entry(jane, &["a.pdf", "b.pdf"]), raw_entry(zoe, &["z.pdf"])];
        consolidate(&folders, &roster, &NameResolver::new())
    }

    #[test]
    fn grading_order_is_last_first_row() {
        let roster = vec![
            roster_entry("c", "amy", "smith", 0),
            roster_entry("a", "Zed", "Adams", 1),
            roster_entry("b", "Amy", "Smith", 2),
        ];
        let c = consolidate(&[], &roster, &NameResolver::new());
        let keys: Vec<String> = grading_order(&c.students)
            .iter()
            .map(|s| s.student_key())
            .collect();
        assert_eq!(keys, vec!["a", "c", "b"]);
    }

    #[test]
    fn build_orders_sections_and_accounts_for_every_page() {
        let dir = tempfile::tempdir().unwrap();
        let consolidation = scenario(dir.path());
        let out = dir.path().join("out/combined.pdf");
        let combined = build(&consolidation, dir.path(), &out).unwrap();

        let map = &combined.page_map;
        let keys: Vec<&str> = map.entries.iter().map(|e| e.student_key.as_str()).collect();
        assert_eq!(keys, vec!["zadams", "bchan", "jdoe"]);
        assert_eq!(map.total_pages, 7);
        assert_eq!(
            map.entries.iter().map(|e| e.page_count).sum::<usize>(),
            map.total_pages
        );
        assert!(map.entry("bchan").unwrap().placeholder);
        assert_eq!(map.entry("jdoe").unwrap().segments.len(), 2);
        assert_eq!(map.entry("jdoe").unwrap().page_start, 4);

        let texts = page_texts(&std::fs::read(&out).unwrap());
        assert_eq!(texts.len(), 7);
        assert_eq!(&texts[0..3], &["z1", "z2", "z3"]);
        assert_eq!(&texts[4..7], &["j1", "j2", "j3"]);

        assert_eq!(PageMap::load(&combined.sidecar).unwrap().as_ref(), Some(map));
    }

    #[test]
    fn watermark_recovery_equals_original_map() {
        let dir = tempfile::tempdir().unwrap();
        let consolidation = scenario(dir.path());
        let out = dir.path().join("combined.pdf");
        let combined = build(&consolidation, dir.path(), &out).unwrap();

        let doc = Document::load(&out).unwrap();
        let mut recovered = recover_page_map(&doc, |_| None).unwrap();
        relink(&mut recovered, &consolidation, dir.path()).unwrap();
        assert_eq!(recovered, combined.page_map);
    }

    #[test]
    fn recovery_uses_fallback_when_content_has_no_watermark() {
        let doc = Document::load_mem(&fixture_pdf(&["p1", "p2", "p3"])).unwrap();
        let map = recover_page_map(&doc, |idx| match idx {
            0 => Some(Watermark::for_student("a", MatchMethod::Exact, vec![2])),
            2 => Some(Watermark::placeholder("b")),
            _ => None,
        })
        .unwrap();
        assert_eq!(map.entries.len(), 2);
        assert_eq!(map.entries[1].page_start, 2);

        let err = recover_page_map(&doc, |_| None).unwrap_err();
        assert!(matches!(err, CombineError::MissingWatermark { page: 1 }));
    }

    #[test]
    fn unreadable_pdf_is_skipped_and_student_becomes_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let folder = "1-1 - Jane Doe - Jan 5, 2024 900 AM";
        let path = resolve_relative(dir.path(), &format!("Lab/{folder}/bad.pdf"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a pdf").unwrap();
        let roster = vec![roster_entry("jdoe", "Jane", "Doe", 0)];
        let c = consolidate(&[raw_entry(folder, &["bad.pdf"])], &roster, &NameResolver::new());

        let combined = build(&c, dir.path(), &dir.path().join("c.pdf")).unwrap();
        assert_eq!(combined.skipped.len(), 1);
        assert!(combined.page_map.entries[0].placeholder);
        assert_eq!(combined.page_map.total_pages, 1);
    }

    #[test]
    fn empty_consolidation_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let c = Consolidation::default();
        assert!(matches!(
            build(&c, dir.path(), &dir.path().join("c.pdf")),
            Err(CombineError::NoStudents)
        ));
    }
}
