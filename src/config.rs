use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "Gradeloop";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Settings file looked up in the data directory when no path is given.
pub const SETTINGS_FILE: &str = "gradeloop.toml";

/// Environment variable holding the cloud vision API key.
pub const VISION_API_KEY_ENV: &str = "GRADELOOP_VISION_API_KEY";

/// Fraction of the first page height (from the top) holding the handwritten grade.
pub const GRADE_BAND_FRACTION: f32 = 0.15;

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> String {
    if cfg!(debug_assertions) {
        "gradeloop=debug,gradeloop_lib=debug,info".to_string()
    } else {
        "gradeloop=info,gradeloop_lib=info,warn".to_string()
    }
}

/// Get the application data directory.
/// ~/Gradeloop/ on all platforms; falls back to the working directory
/// when no home directory can be determined.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Folder old processing folders and output archives are moved into.
pub fn archive_dir() -> PathBuf {
    app_data_dir().join("archive")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("No class configured with name: {0}")]
    UnknownClass(String),
}

// ═══════════════════════════════════════════════════════════
// Class paths (supplied by the external class registry)
// ═══════════════════════════════════════════════════════════

/// Folders the pipeline works in for one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPaths {
    /// Folder containing the roster import CSV.
    pub roster_folder: PathBuf,
    /// Folder the D2L download ZIP lands in; output ZIPs are written here too.
    pub downloads_folder: PathBuf,
    /// Working folder for the unpacked archive and combined PDF.
    pub processing_folder: PathBuf,
}

impl ClassPaths {
    /// Conventional layout: processing folder lives next to the roster.
    pub fn from_roster_and_downloads(roster_folder: &Path, downloads_folder: &Path) -> Self {
        Self {
            roster_folder: roster_folder.to_path_buf(),
            downloads_folder: downloads_folder.to_path_buf(),
            processing_folder: roster_folder.join("processing"),
        }
    }
}

/// Supplies per-class folders. The registry behind it lives outside this crate.
pub trait ConfigProvider: Send + Sync {
    fn class_paths(&self, class_name: &str) -> Result<ClassPaths, ConfigError>;
}

/// Provider over a fixed set of classes (CLI flags, tests).
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    classes: Vec<(String, ClassPaths)>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, name: &str, paths: ClassPaths) -> Self {
        self.classes.push((name.to_string(), paths));
        self
    }
}

impl ConfigProvider for StaticConfig {
    fn class_paths(&self, class_name: &str) -> Result<ClassPaths, ConfigError> {
        self.classes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(class_name))
            .map(|(_, paths)| paths.clone())
            .ok_or_else(|| ConfigError::UnknownClass(class_name.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════
// Grader settings (gradeloop.toml)
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OcrSettings {
    /// Google Cloud Vision endpoint.
    pub cloud_endpoint: String,
    /// API key; the environment variable wins when set.
    pub cloud_api_key: Option<String>,
    /// Local Ollama instance used as the first fallback.
    pub ollama_url: String,
    pub ollama_model: String,
    /// Tesseract data directory (only used with the `ocr` feature).
    pub tessdata_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    /// Concurrent OCR calls.
    pub workers: usize,
    pub render_dpi: u32,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            cloud_endpoint: "https://vision.googleapis.com/v1/images:annotate".into(),
            cloud_api_key: None,
            ollama_url: "http://localhost:11434".into(),
            ollama_model: "llama3.2-vision".into(),
            tessdata_dir: None,
            timeout_secs: 60,
            workers: 4,
            render_dpi: 200,
        }
    }
}

impl OcrSettings {
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(VISION_API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.cloud_api_key.clone())
    }
}

/// Bounded retry for external file locks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_factor: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 250,
            backoff_factor: 2,
        }
    }
}

impl RetrySettings {
    /// No waiting between attempts (tests).
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            initial_backoff_ms: 0,
            backoff_factor: 1,
        }
    }

    /// Backoff before retry number `attempt` (1-based; attempt 0 never waits).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(attempt - 1);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GraderSettings {
    pub ocr: OcrSettings,
    pub retry: RetrySettings,
    /// Points awarded by completion grading.
    pub completion_points: Option<f64>,
}

impl GraderSettings {
    /// Load settings from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Settings file in the data directory.
    pub fn default_path() -> PathBuf {
        app_data_dir().join(SETTINGS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_named_after_app() {
        assert!(app_data_dir().ends_with("Gradeloop"));
        assert!(archive_dir().starts_with(app_data_dir()));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let settings = GraderSettings::from_toml("").unwrap();
        assert_eq!(settings, GraderSettings::default());
        assert_eq!(settings.ocr.workers, 4);
        assert_eq!(settings.retry.attempts, 3);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let settings = GraderSettings::from_toml(
            "completion_points = 10.0\n[ocr]\nworkers = 2\n[retry]\nattempts = 5\n",
        )
        .unwrap();
        assert_eq!(settings.ocr.workers, 2);
        assert_eq!(settings.ocr.render_dpi, 200);
        assert_eq!(settings.retry.attempts, 5);
        assert_eq!(settings.retry.initial_backoff_ms, 250);
        assert_eq!(settings.completion_points, Some(10.0));
    }

    #[test]
    fn invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gradeloop.toml");
        std::fs::write(&path, "[ocr\nworkers = ").unwrap();
        let err = GraderSettings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_settings_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GraderSettings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, GraderSettings::default());
    }

    #[test]
    fn backoff_grows_exponentially() {
        let retry = RetrySettings {
            attempts: 4,
            initial_backoff_ms: 100,
            backoff_factor: 2,
        };
        assert_eq!(retry.backoff(0), Duration::ZERO);
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(RetrySettings::immediate(3).backoff(2), Duration::ZERO);
    }

    #[test]
    fn static_config_lookup_is_case_insensitive() {
        let paths = ClassPaths::from_roster_and_downloads(
            Path::new("/tmp/roster"),
            Path::new("/tmp/downloads"),
        );
        let config = StaticConfig::new().with_class("Chem 101", paths.clone());
        assert_eq!(config.class_paths("chem 101").unwrap(), paths);
        assert!(matches!(
            config.class_paths("Bio"),
            Err(ConfigError::UnknownClass(_))
        ));
        assert_eq!(paths.processing_folder, Path::new("/tmp/roster/processing"));
    }
}
