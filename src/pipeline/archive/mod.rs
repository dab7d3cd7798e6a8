//! D2L download archive: validation, extraction, and `index.html` preservation.
//!
//! Canonical layout:
//! ```text
//! index.html
//! <Assignment>/<id-id - Display Name - Mon D, YYYY HMM AM>/Submission attachment(s)/*.pdf
//! ```
//! The assignment level is optional (some exports put student folders at the
//! root). PDFs directly inside the student folder are accepted as well.

pub mod folder;

pub use folder::{parse_folder_name, FolderName};

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zip::ZipArchive;

pub const INDEX_HTML: &str = "index.html";
pub const SUBMISSION_ATTACHMENTS: &str = "Submission attachment(s)";
/// Pipeline state kept inside the processing folder (never zipped).
pub const STATE_DIR: &str = ".gradeloop";
pub const MANIFEST_FILE: &str = "archive.json";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Malformed archive: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Root `index.html`, kept byte-for-byte for the upload package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservedIndex {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub sha256: String,
    pub len: usize,
}

impl PreservedIndex {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let sha256 = sha256_hex(&bytes);
        Self {
            len: bytes.len(),
            bytes,
            sha256,
        }
    }

    pub fn state_path(processing: &Path) -> PathBuf {
        processing.join(STATE_DIR).join(INDEX_HTML)
    }

    /// Store under `<processing>/.gradeloop/index.html`.
    pub fn write_to(&self, processing: &Path) -> Result<PathBuf, ArchiveError> {
        let path = Self::state_path(processing);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &self.bytes)?;
        Ok(path)
    }

    pub fn load_from(processing: &Path) -> Result<Option<Self>, ArchiveError> {
        let path = Self::state_path(processing);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(Self::from_bytes(std::fs::read(path)?)))
    }
}

/// Join a `/`-separated archive path onto `root`.
pub fn resolve_relative(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|p| !p.is_empty())
        .fold(root.to_path_buf(), |acc, p| acc.join(p))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// One student folder found in the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    pub folder_name: String,
    /// Display name parsed from the folder name.
    pub display_name: String,
    pub submission_id: String,
    pub submitted_at: NaiveDateTime,
    /// Folder path relative to the archive root, `/`-separated.
    pub relative_dir: String,
    /// PDFs relative to the archive root, sorted by file name.
    pub pdf_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveValidation {
    /// No warnings: every folder recognised and every student has a PDF.
    pub valid: bool,
    pub assignment_name: String,
    /// Assignment folder inside the archive ("" when folders sit at the root).
    pub assignment_dir: String,
    pub student_folders: Vec<RawEntry>,
    pub index_html: Option<PreservedIndex>,
    pub warnings: Vec<ArchiveWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveWarning {
    /// Student folder without a PDF; the student is treated as no submission.
    NoPdfFound { folder_name: String },
    /// File outside any recognised submission folder.
    UnrecognizedEntry { path: String },
}

/// Facts about the extracted archive needed by later stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub assignment_name: String,
    pub assignment_dir: String,
    pub source_zip: PathBuf,
    pub index_sha256: Option<String>,
    pub extracted_files: usize,
}

impl ArchiveManifest {
    pub fn path(processing: &Path) -> PathBuf {
        processing.join(STATE_DIR).join(MANIFEST_FILE)
    }

    pub fn load(processing: &Path) -> Result<Option<Self>, ArchiveError> {
        let path = Self::path(processing);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
    }

    pub fn save(&self, processing: &Path) -> Result<(), ArchiveError> {
        let path = Self::path(processing);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Catalog (shared by ZIP and extracted-folder scans)
// ═══════════════════════════════════════════════════════════

fn is_pdf(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

/// Split a relative path into components, rejecting anything that could
/// escape the archive root.
fn safe_components(path: &Path) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then_some(parts)
}

/// Components of a stored `/`-separated relative path, or `None` when it
/// could resolve outside its root on any platform: absolute or UNC paths,
/// drive prefixes (`C:`), and `..` segments are all rejected.
pub fn safe_relative(relative: &str) -> Option<Vec<String>> {
    if relative.starts_with(['/', '\\']) {
        return None;
    }
    if relative
        .split(['/', '\\'])
        .any(|part| part == ".." || part.contains(':'))
    {
        return None;
    }
    safe_components(Path::new(relative))
}

#[derive(Default)]
struct Catalog {
    folders: BTreeMap<String, RawEntry>,
    assignment_dirs: Vec<String>,
    unrecognized: Vec<String>,
}

impl Catalog {
    fn add(&mut self, parts: &[String], is_dir: bool) {
        let upto = if is_dir { parts.len() } else { parts.len() - 1 };
        let Some((idx, parsed)) = parts[..upto]
            .iter()
            .enumerate()
            .find_map(|(i, p)| parse_folder_name(p).map(|f| (i, f)))
        else {
            let at_root_index = !is_dir && parts.len() == 1 && parts[0].eq_ignore_ascii_case(INDEX_HTML);
            if !is_dir && !at_root_index && parts.first().map(String::as_str) != Some(STATE_DIR) {
                self.unrecognized.push(parts.join("/"));
            }
            return;
        };

        let assignment_dir = parts[..idx].join("/");
        if !self.assignment_dirs.contains(&assignment_dir) {
            self.assignment_dirs.push(assignment_dir);
        }
        let relative_dir = parts[..=idx].join("/");
        let entry = self
            .folders
            .entry(relative_dir.clone())
            .or_insert_with(|| RawEntry {
                folder_name: parts[idx].clone(),
                display_name: parsed.display_name,
                submission_id: parsed.submission_id,
                submitted_at: parsed.submitted_at,
                relative_dir,
                pdf_paths: Vec::new(),
            });
        if !is_dir && is_pdf(&parts[parts.len() - 1]) {
            entry.pdf_paths.push(parts.join("/"));
        }
    }

    fn finish(
        self,
        fallback_name: &str,
        index_html: Option<PreservedIndex>,
    ) -> Result<ArchiveValidation, ArchiveError> {
        if self.folders.is_empty() {
            return Err(ArchiveError::Malformed(
                "no D2L submission folders found".to_string(),
            ));
        }
        if self.assignment_dirs.len() > 1 {
            return Err(ArchiveError::Malformed(format!(
                "submission folders found under more than one assignment: {}",
                self.assignment_dirs.join(", ")
            )));
        }
        let assignment_dir = self.assignment_dirs.into_iter().next().unwrap_or_default();
        let assignment_name = assignment_dir
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback_name)
            .to_string();

        let mut warnings: Vec<ArchiveWarning> = self
            .unrecognized
            .into_iter()
            .map(|path| ArchiveWarning::UnrecognizedEntry { path })
            .collect();

        let mut student_folders: Vec<RawEntry> = self.folders.into_values().collect();
        for entry in &mut student_folders {
            entry.pdf_paths.sort_by_key(|p| {
                let name = p.rsplit('/').next().unwrap_or(p);
                (name.to_lowercase(), p.clone())
            });
            if entry.pdf_paths.is_empty() {
                warnings.push(ArchiveWarning::NoPdfFound {
                    folder_name: entry.folder_name.clone(),
                });
            }
        }

        Ok(ArchiveValidation {
            valid: warnings.is_empty(),
            assignment_name,
            assignment_dir,
            student_folders,
            index_html,
            warnings,
        })
    }
}

fn zip_stem(zip_path: &Path) -> String {
    zip_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Assignment".to_string())
}

// ═══════════════════════════════════════════════════════════
// Operations
// ═══════════════════════════════════════════════════════════

/// Validate a D2L download without extracting it.
pub fn validate(zip_path: &Path) -> Result<ArchiveValidation, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(zip_path)?)?;
    let mut catalog = Catalog::default();
    let mut index_html = None;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let parts = file
            .enclosed_name()
            .and_then(safe_components)
            .ok_or_else(|| {
                ArchiveError::Malformed(format!("unsafe entry path: {}", file.name()))
            })?;

        if !file.is_dir() && parts.len() == 1 && parts[0].eq_ignore_ascii_case(INDEX_HTML) {
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            index_html = Some(PreservedIndex::from_bytes(bytes));
        }
        catalog.add(&parts, file.is_dir());
    }

    let validation = catalog.finish(&zip_stem(zip_path), index_html)?;
    tracing::info!(
        zip = %zip_path.display(),
        assignment = %validation.assignment_name,
        students = validation.student_folders.len(),
        warnings = validation.warnings.len(),
        index_preserved = validation.index_html.is_some(),
        "Archive validated"
    );
    Ok(validation)
}

/// Unpack the archive into `dest` and record its manifest and `index.html`
/// under the state directory. Returns the number of files written.
pub fn extract_to(zip_path: &Path, dest: &Path) -> Result<ArchiveManifest, ArchiveError> {
    let validation = validate(zip_path)?;
    let mut archive = ZipArchive::new(File::open(zip_path)?)?;
    std::fs::create_dir_all(dest)?;

    let mut extracted = 0usize;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let parts = file
            .enclosed_name()
            .and_then(safe_components)
            .ok_or_else(|| {
                ArchiveError::Malformed(format!("unsafe entry path: {}", file.name()))
            })?;
        let target = parts.iter().fold(dest.to_path_buf(), |acc, p| acc.join(p));
        if file.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut file, &mut out)?;
        extracted += 1;
    }

    if let Some(index) = &validation.index_html {
        index.write_to(dest)?;
    }
    let manifest = ArchiveManifest {
        assignment_name: validation.assignment_name.clone(),
        assignment_dir: validation.assignment_dir.clone(),
        source_zip: zip_path.to_path_buf(),
        index_sha256: validation.index_html.as_ref().map(|i| i.sha256.clone()),
        extracted_files: extracted,
    };
    manifest.save(dest)?;

    tracing::info!(
        dest = %dest.display(),
        files = extracted,
        "Archive extracted"
    );
    Ok(manifest)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<(Vec<String>, bool)>) -> Result<(), ArchiveError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let Some(parts) = path.strip_prefix(root).ok().and_then(safe_components) else {
            continue;
        };
        if parts[0] == STATE_DIR {
            continue;
        }
        let is_dir = entry.file_type()?.is_dir();
        out.push((parts, is_dir));
        if is_dir {
            walk(root, &path, out)?;
        }
    }
    Ok(())
}

/// Re-catalog an already extracted processing folder. Yields the same student
/// folders as `validate` on the source archive.
pub fn scan_extracted(processing: &Path) -> Result<ArchiveValidation, ArchiveError> {
    let manifest = ArchiveManifest::load(processing)?;
    let mut paths = Vec::new();
    walk(processing, processing, &mut paths)?;

    let mut catalog = Catalog::default();
    for (parts, is_dir) in &paths {
        catalog.add(parts, *is_dir);
    }
    let fallback = manifest
        .as_ref()
        .map(|m| m.assignment_name.clone())
        .unwrap_or_else(|| {
            processing
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "Assignment".to_string())
        });
    catalog.finish(&fallback, PreservedIndex::load_from(processing)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    #[test]
    fn safe_relative_rejects_escapes_on_every_platform() {
        assert_eq!(
            safe_relative("Lab 1/a b/Submission attachment(s)/x.pdf").unwrap().len(),
            4
        );
        for bad in [
            "",
            "/etc/passwd",
            "\\\\host\\share\\x.pdf",
            "\\x.pdf",
            "C:\\Users\\x.pdf",
            "C:/Users/x.pdf",
            "Lab/../../x.pdf",
            "Lab\\..\\x.pdf",
        ] {
            assert!(safe_relative(bad).is_none(), "{bad}");
        }
    }

    /// Builds a fixture ZIP entry by entry.
    pub(crate) struct ZipFixture {
        zip: ZipWriter<File>,
    }

    impl ZipFixture {
        pub(crate) fn new(path: &Path) -> Self {
            Self {
                zip: ZipWriter::new(File::create(path).unwrap()),
            }
        }

        pub(crate) fn file(mut self, name: &str, bytes: &[u8]) -> Self {
            self.zip.start_file(name, FileOptions::default()).unwrap();
            self.zip.write_all(bytes).unwrap();
            self
        }

        pub(crate) fn finish(mut self) {
            self.zip.finish().unwrap();
        }
    }

    const JANE: &str = "Lab 1/111-222 - Jane Doe - Jan 5, 2024 1023 AM";
    const BO: &str = "Lab 1/333-444 - Bo Chan - Jan 6, 2024 905 PM";

    #[test]
    fn validates_canonical_layout() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("download.zip");
        ZipFixture::new(&zip)
            .file("index.html", b"<html>list</html>")
            .file(&format!("{JANE}/Submission attachment(s)/b.pdf"), b"%PDF")
            .file(&format!("{JANE}/Submission attachment(s)/a.pdf"), b"%PDF")
            .file(&format!("{BO}/Submission attachment(s)/work.PDF"), b"%PDF")
            .finish();

        let v = validate(&zip).unwrap();
        assert!(v.valid);
        assert_eq!(v.assignment_name, "Lab 1");
        assert_eq!(v.student_folders.len(), 2);
        let jane = v
            .student_folders
            .iter()
            .find(|e| e.display_name == "Jane Doe")
            .unwrap();
        assert!(jane.pdf_paths[0].ends_with("a.pdf"));
        assert!(jane.pdf_paths[1].ends_with("b.pdf"));
        let index = v.index_html.unwrap();
        assert_eq!(index.bytes, b"<html>list</html>");
        assert_eq!(index.sha256, sha256_hex(b"<html>list</html>"));
    }

    #[test]
    fn folder_without_pdf_is_warning_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("d.zip");
        ZipFixture::new(&zip)
            .file(&format!("{JANE}/Submission attachment(s)/a.pdf"), b"%PDF")
            .file(&format!("{BO}/Submission attachment(s)/notes.docx"), b"doc")
            .finish();
        let v = validate(&zip).unwrap();
        assert!(!v.valid);
        assert_eq!(v.student_folders.len(), 2);
        assert!(v.warnings.contains(&ArchiveWarning::NoPdfFound {
            folder_name: "333-444 - Bo Chan - Jan 6, 2024 905 PM".into()
        }));
        assert!(v.index_html.is_none());
    }

    #[test]
    fn no_matching_folder_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("d.zip");
        ZipFixture::new(&zip)
            .file("random/file.pdf", b"%PDF")
            .file("index.html", b"x")
            .finish();
        assert!(matches!(validate(&zip), Err(ArchiveError::Malformed(_))));
    }

    #[test]
    fn traversal_entry_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("d.zip");
        ZipFixture::new(&zip)
            .file(&format!("{JANE}/a.pdf"), b"%PDF")
            .file("../evil.pdf", b"%PDF")
            .finish();
        assert!(matches!(validate(&zip), Err(ArchiveError::Malformed(_))));
    }

    #[test]
    fn root_level_folders_use_zip_stem() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("Essay 2 Download.zip");
        ZipFixture::new(&zip)
            .file("111-222 - Jane Doe - Jan 5, 2024 1023 AM/a.pdf", b"%PDF")
            .finish();
        let v = validate(&zip).unwrap();
        assert_eq!(v.assignment_name, "Essay 2 Download");
        assert_eq!(v.assignment_dir, "");
        assert_eq!(v.student_folders[0].pdf_paths.len(), 1);
    }

    #[test]
    fn extract_then_scan_matches_validate() {
        let dir = tempfile::tempdir().unwrap();
        let zip = dir.path().join("d.zip");
        ZipFixture::new(&zip)
            .file("index.html", b"<html/>")
            .file(&format!("{JANE}/Submission attachment(s)/a.pdf"), b"%PDF")
            .file(&format!("{BO}/Submission attachment(s)/w.pdf"), b"%PDF")
            .file("Lab 1/stray.txt", b"?")
            .finish();
        let processing = dir.path().join("processing");
        let manifest = extract_to(&zip, &processing).unwrap();
        assert_eq!(manifest.extracted_files, 4);
        assert!(processing.join(JANE).join("Submission attachment(s)/a.pdf").is_file());
        assert_eq!(
            std::fs::read(PreservedIndex::state_path(&processing)).unwrap(),
            b"<html/>"
        );

        let original = validate(&zip).unwrap();
        let rescanned = scan_extracted(&processing).unwrap();
        assert_eq!(rescanned.student_folders, original.student_folders);
        assert_eq!(rescanned.assignment_name, "Lab 1");
        assert_eq!(
            rescanned.index_html.map(|i| i.sha256),
            original.index_html.map(|i| i.sha256)
        );
    }
}
