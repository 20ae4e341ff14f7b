//! Configuration types.
//!
//! Two layers:
//!
//! * [`DaemonConfig`] holds the orchestrator knobs the library needs (queue
//!   root, poll interval, redelivery cap, wake-up policy). Build it with
//!   [`DaemonConfig::builder()`]; setters clamp to sane ranges and `build()`
//!   rejects what cannot work.
//!
//! * [`Config`] is the file the `scanflow` binary reads: one section per
//!   collaborator plus `queue` and `logging`. It loads from `.json` or
//!   `.toml`, every field has a default, and [`Config::validate`] reports all
//!   problems at once.

use crate::error::ScanflowError;
use crate::queue::WakePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Orchestrator configuration ────────────────────────────────────────────

/// Settings for [`crate::Pipeline`] and [`crate::Daemon`].
///
/// # Example
/// ```rust
/// use scanflow::{DaemonConfig, WakePolicy};
/// use std::time::Duration;
///
/// let config = DaemonConfig::builder()
///     .queue_root("/var/spool/scanflow")
///     .poll_interval(Duration::from_secs(2))
///     .max_attempts(3)
///     .wake_policy(WakePolicy::Notify)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Directory holding one subdirectory per queue. Default:
    /// `<system temp>/scanflow-queue`.
    pub queue_root: PathBuf,

    /// Time between two ticks of a stage. Default: 5 s.
    ///
    /// In [`WakePolicy::Notify`] mode this is the fallback when no change
    /// event arrives.
    pub poll_interval: Duration,

    /// Failed deliveries after which an input container is moved to the
    /// dead-letter directory. 0 retries forever. Default: 5.
    pub max_attempts: u32,

    /// How stages with an input queue wait for work. Default: poll.
    pub wake_policy: WakePolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            queue_root: default_queue_root(),
            poll_interval: Duration::from_secs(5),
            max_attempts: 5,
            wake_policy: WakePolicy::Poll,
        }
    }
}

impl DaemonConfig {
    pub fn builder() -> DaemonConfigBuilder {
        DaemonConfigBuilder {
            config: DaemonConfig::default(),
        }
    }
}

/// Builder for [`DaemonConfig`].
#[derive(Debug, Clone)]
pub struct DaemonConfigBuilder {
    config: DaemonConfig,
}

impl DaemonConfigBuilder {
    pub fn queue_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.queue_root = root.into();
        self
    }

    /// Clamped to 1 ms .. 1 h.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval =
            interval.clamp(Duration::from_millis(1), Duration::from_secs(3600));
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn wake_policy(mut self, policy: WakePolicy) -> Self {
        self.config.wake_policy = policy;
        self
    }

    pub fn build(self) -> Result<DaemonConfig, ScanflowError> {
        if self.config.queue_root.as_os_str().is_empty() {
            return Err(ScanflowError::InvalidConfig(
                "queue_root must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

fn default_queue_root() -> PathBuf {
    std::env::temp_dir().join("scanflow-queue")
}

// ── File configuration ────────────────────────────────────────────────────

/// Everything the `scanflow` binary needs, as read from the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub delivery: DeliveryTarget,
    pub queue: QueueConfig,
    pub scanner: ScannerConfig,
    pub image: ImageConfig,
    pub ocr: OcrConfig,
    pub pdf: PdfConfig,
    pub llm: LlmConfig,
    pub paperless: PaperlessConfig,
    pub share: ShareConfig,
    pub logging: LoggingConfig,
}

/// Queue root and scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub root: PathBuf,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub wake: WakePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let daemon = DaemonConfig::default();
        Self {
            root: daemon.queue_root,
            poll_interval_ms: daemon.poll_interval.as_millis() as u64,
            max_attempts: daemon.max_attempts,
            wake: daemon.wake_policy,
        }
    }
}

impl QueueConfig {
    pub fn daemon_config(&self) -> Result<DaemonConfig, ScanflowError> {
        DaemonConfig::builder()
            .queue_root(&self.root)
            .poll_interval(Duration::from_millis(self.poll_interval_ms))
            .max_attempts(self.max_attempts)
            .wake_policy(self.wake)
            .build()
    }
}

/// Where page images come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerKind {
    /// Image files dropped into an inbox folder (network scanner target).
    #[default]
    Folder,
    /// Cycles through sample images; for demos and testing without hardware.
    Simulated,
    /// A local SANE device driven through `scanimage`.
    Sane,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub kind: ScannerKind,
    /// Folder scanner inbox.
    pub inbox: PathBuf,
    /// Files younger than this are assumed to be still uploading.
    pub min_age_secs: u64,
    /// Simulated scanner image pool.
    pub pool: PathBuf,
    /// SANE device name; detected from `product_name` when empty.
    pub device: String,
    pub product_name: String,
    pub resolution_dpi: u32,
    pub duplex: bool,
    /// Working directory for `scanimage` batch output.
    pub work_dir: PathBuf,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            kind: ScannerKind::Folder,
            inbox: PathBuf::new(),
            min_age_secs: 5,
            pool: PathBuf::new(),
            device: String::new(),
            product_name: String::new(),
            resolution_dpi: 600,
            duplex: true,
            work_dir: std::env::temp_dir().join("scanflow-scan"),
        }
    }
}

/// Clockwise rotation applied to every page image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    None,
    #[serde(rename = "90")]
    Rotate90,
    /// Pages from a document feeder typically arrive upside down.
    #[default]
    #[serde(rename = "180")]
    Rotate180,
    #[serde(rename = "270")]
    Rotate270,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub rotation: Rotation,
    pub grayscale: bool,
    /// Contrast adjustment in percent; 0 leaves the image unchanged.
    pub contrast: f32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            rotation: Rotation::Rotate180,
            grayscale: false,
            contrast: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// tesseract executable.
    pub program: PathBuf,
    /// Tesseract language codes, e.g. `deu+eng`. Empty uses tesseract's default.
    pub language: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("tesseract"),
            language: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfConfig {
    /// pdfium shared library. Empty binds the system library.
    pub library_path: PathBuf,
}

/// Which completion backend the guessers use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// Direct HTTP call to an OpenAI-style Responses endpoint.
    #[default]
    Responses,
    /// Any provider supported by edgequake-llm.
    Provider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub endpoint: String,
    /// Bearer token for the Responses backend. Falls back to `OPENAI_API_KEY`.
    pub api_key: String,
    pub model: String,
    /// edgequake-llm provider name ("openai", "anthropic", "ollama", ...).
    /// Empty auto-detects from the environment.
    pub provider: String,
    pub max_output_tokens: u32,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
    /// Extracted text beyond this many characters is not sent.
    pub max_input_chars: usize,
    /// Language the guessed names and tags should be in.
    pub language: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Responses,
            endpoint: "https://api.openai.com/v1/responses".into(),
            api_key: String::new(),
            model: "gpt-4o-mini".into(),
            provider: String::new(),
            max_output_tokens: 200,
            timeout_secs: 10,
            retries: 3,
            retry_delay_ms: 5000,
            max_input_chars: 20_000,
            language: "English".into(),
        }
    }
}

impl LlmConfig {
    /// The API key from the file, or from `OPENAI_API_KEY`.
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
    }

    /// False when the Responses backend has no key; the tag stage is then
    /// left out of the pipeline.
    pub fn is_usable(&self) -> bool {
        match self.backend {
            LlmBackend::Responses => self.resolved_api_key().is_some(),
            LlmBackend::Provider => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperlessConfig {
    /// Base URL, e.g. `http://paperless:8000`.
    pub url: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correspondent: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<u32>,
}

/// A mounted SMB/CIFS share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Mount point (or any directory) the share is rooted at.
    pub base_path: PathBuf,
    pub check_interval_secs: u64,
    pub retry_delay_ms: u64,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::new(),
            check_interval_secs: 30,
            retry_delay_ms: 2000,
        }
    }
}

/// Final destination of processed documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryTarget {
    #[default]
    Paperless,
    Share,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` overrides it.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Reads and validates a `.json` or `.toml` config file.
    pub fn load(path: &Path) -> Result<Self, ScanflowError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a `.json` or `.toml` config file without validating it; tools
    /// that use only some sections check those themselves.
    pub fn read(path: &Path) -> Result<Self, ScanflowError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScanflowError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |detail: String| ScanflowError::ConfigParse {
            path: path.to_path_buf(),
            detail,
        };
        let config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text).map_err(|e| parse_err(e.to_string()))?,
            Some("toml") => toml::from_str(&text).map_err(|e| parse_err(e.to_string()))?,
            _ => {
                return Err(ScanflowError::UnsupportedConfigFormat {
                    path: path.to_path_buf(),
                })
            }
        };
        Ok(config)
    }

    /// Checks cross-field consistency, reporting every problem found.
    pub fn validate(&self) -> Result<(), ScanflowError> {
        let mut problems = Vec::new();

        if self.queue.poll_interval_ms == 0 {
            problems.push("queue.poll_interval_ms must be greater than 0".to_string());
        }
        match self.scanner.kind {
            ScannerKind::Folder if self.scanner.inbox.as_os_str().is_empty() => {
                problems.push("scanner.inbox is required for the folder scanner".into())
            }
            ScannerKind::Simulated if self.scanner.pool.as_os_str().is_empty() => {
                problems.push("scanner.pool is required for the simulated scanner".into())
            }
            ScannerKind::Sane
                if self.scanner.device.is_empty() && self.scanner.product_name.is_empty() =>
            {
                problems.push("scanner.device or scanner.product_name is required for SANE".into())
            }
            _ => {}
        }
        if !(-100.0..=100.0).contains(&self.image.contrast) {
            problems.push("image.contrast must be between -100 and 100".into());
        }
        if self.llm.retries == 0 {
            problems.push("llm.retries must be at least 1".into());
        }
        match self.delivery {
            DeliveryTarget::Paperless => {
                if self.paperless.url.is_empty() {
                    problems.push("paperless.url is required for paperless delivery".into());
                }
                if self.paperless.token.is_empty() {
                    problems.push("paperless.token is required for paperless delivery".into());
                }
            }
            DeliveryTarget::Share => {
                if self.share.base_path.as_os_str().is_empty() {
                    problems.push("share.base_path is required for share delivery".into());
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ScanflowError::InvalidConfig(problems.join("; ")))
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, ScanflowError> {
        serde_json::to_string_pretty(self).map_err(|e| ScanflowError::Internal(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ScanflowError> {
        toml::to_string_pretty(self).map_err(|e| ScanflowError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.scanner.inbox = "/srv/scans".into();
        config.paperless.url = "http://paperless:8000".into();
        config.paperless.token = "secret".into();
        config
    }

    #[test]
    fn test_daemon_defaults() {
        let c = DaemonConfig::default();
        assert_eq!(c.poll_interval, Duration::from_secs(5));
        assert_eq!(c.max_attempts, 5);
        assert_eq!(c.wake_policy, WakePolicy::Poll);
        assert!(c.queue_root.ends_with("scanflow-queue"));
    }

    #[test]
    fn test_builder_clamps_interval() {
        let c = DaemonConfig::builder()
            .poll_interval(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(c.poll_interval, Duration::from_millis(1));
    }

    #[test]
    fn test_builder_rejects_empty_root() {
        let err = DaemonConfig::builder().queue_root("").build().unwrap_err();
        assert!(matches!(err, ScanflowError::InvalidConfig(_)));
    }

    #[test]
    fn test_default_config_needs_destinations() {
        let msg = Config::default().validate().unwrap_err().to_string();
        assert!(msg.contains("scanner.inbox"));
        assert!(msg.contains("paperless.url"));
        assert!(msg.contains("paperless.token"));
    }

    #[test]
    fn test_valid_config_passes() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_roundtrip_json_and_toml() {
        let mut config = valid();
        config.paperless.correspondent = Some(4);
        config.image.rotation = Rotation::Rotate90;

        let json = config.to_json_pretty().unwrap();
        assert_eq!(serde_json::from_str::<Config>(&json).unwrap(), config);

        let toml_text = config.to_toml().unwrap();
        assert_eq!(toml::from_str::<Config>(&toml_text).unwrap(), config);
    }

    #[test]
    fn test_default_config_serialises_in_both_formats() {
        let config = Config::default();
        assert!(config.to_json_pretty().unwrap().contains("\"queue\""));
        assert!(config.to_toml().unwrap().contains("[queue]"));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("scanflow.toml");
        std::fs::write(
            &toml_path,
            r#"
delivery = "share"

[scanner]
inbox = "/srv/inbox"

[share]
base_path = "/mnt/archive"

[queue]
wake = "notify"
poll_interval_ms = 250
"#,
        )
        .unwrap();
        let config = Config::load(&toml_path).unwrap();
        assert_eq!(config.delivery, DeliveryTarget::Share);
        assert_eq!(config.queue.wake, WakePolicy::Notify);
        assert_eq!(config.queue.poll_interval_ms, 250);
        // Untouched sections keep their defaults.
        assert_eq!(config.llm.model, "gpt-4o-mini");

        let yaml_path = dir.path().join("scanflow.yaml");
        std::fs::write(&yaml_path, "queue: {}").unwrap();
        assert!(matches!(
            Config::load(&yaml_path),
            Err(ScanflowError::UnsupportedConfigFormat { .. })
        ));
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ScanflowError::ConfigParse { .. })
        ));
    }
}
