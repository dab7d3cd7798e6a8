//! Upload package writer.
//!
//! The package mirrors the download: the root `index.html` (the preserved
//! bytes when the download carried one) plus every file of the processing
//! folder under its original relative path. Pipeline state is left out.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::SplitError;
use crate::pipeline::archive::{PreservedIndex, INDEX_HTML, STATE_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexFidelity {
    /// Byte-identical `index.html` from the download.
    Preserved,
    /// Minimal `index.html` generated here; D2L may reject or misread it.
    Regenerated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RezipSummary {
    pub zip_path: PathBuf,
    pub files: usize,
    pub index_fidelity: IndexFidelity,
}

pub fn upload_zip_name(assignment: &str) -> String {
    format!("{assignment} Graded.zip")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Minimal listing of the submission folders.
pub fn regenerate_index(assignment: &str, folders: &[String]) -> Vec<u8> {
    let title = escape_html(assignment);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n<body>\n<h1>{title}</h1>\n<ul>\n"
    );
    for folder in folders {
        html.push_str(&format!("<li>{}</li>\n", escape_html(folder)));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    html.into_bytes()
}

/// Files to package, `/`-separated and sorted. Skips the state directory
/// and the root `index.html`, which is written separately.
fn package_files(processing: &Path) -> Result<Vec<String>, SplitError> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            if parts.first().map(String::as_str) == Some(STATE_DIR) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                walk(root, &path, out)?;
            } else if !(parts.len() == 1 && parts[0].eq_ignore_ascii_case(INDEX_HTML)) {
                out.push(parts.join("/"));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(processing, processing, &mut files)?;
    Ok(files)
}

/// Write the upload package for `processing` to `zip_path`. The archive is
/// assembled next to its destination and renamed into place when complete.
pub fn write_upload_zip(
    processing: &Path,
    assignment: &str,
    folders: &[String],
    zip_path: &Path,
) -> Result<RezipSummary, SplitError> {
    let (index_bytes, index_fidelity) = match PreservedIndex::load_from(processing)? {
        Some(index) => (index.bytes, IndexFidelity::Preserved),
        None => {
            tracing::warn!(assignment = %assignment, "No preserved index.html, regenerating");
            (regenerate_index(assignment, folders), IndexFidelity::Regenerated)
        }
    };
    let files = package_files(processing)?;

    if let Some(parent) = zip_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let partial = zip_path.with_extension("zip.partial");
    {
        let mut zip = ZipWriter::new(File::create(&partial)?);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file(INDEX_HTML, opts)?;
        zip.write_all(&index_bytes)?;
        for rel in &files {
            zip.start_file(rel.as_str(), opts)?;
            let mut source = File::open(crate::pipeline::archive::resolve_relative(processing, rel))?;
            std::io::copy(&mut source, &mut zip)?;
        }
        zip.finish()?;
    }
    std::fs::rename(&partial, zip_path)?;

    tracing::info!(
        zip = %zip_path.display(),
        files = files.len() + 1,
        index = ?index_fidelity,
        "Upload package written"
    );
    Ok(RezipSummary {
        zip_path: zip_path.to_path_buf(),
        files: files.len() + 1,
        index_fidelity,
    })
}
