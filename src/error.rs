//! Error types for the scanflow library.
//!
//! Two tiers mirror the two ways things go wrong in a running pipeline:
//!
//! * [`ScanflowError`] is **fatal**: the daemon or a tool cannot start at all
//!   (unreadable config, duplicate stage names, queue root not writable).
//!   The binary reports it and exits.
//!
//! * [`StageError`] is **per unit of work**: one stage failed on one
//!   container. The orchestrator logs it against the stage, leaves the input
//!   for redelivery and keeps polling. Other stages never see it.
//!
//! The leaf errors ([`ArchiveError`], [`QueueError`], [`LlmError`],
//! [`PaperlessError`], [`ShareError`]) belong to one component each and
//! convert into [`StageError`] with `?`.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the scanflow library.
#[derive(Debug, Error)]
pub enum ScanflowError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// The config file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file was read but is not valid JSON/TOML for [`crate::Config`].
    #[error("Failed to parse config file '{path}': {detail}")]
    ConfigParse { path: PathBuf, detail: String },

    /// The config file extension is not one we can parse.
    #[error("Unsupported config format for '{path}'\nUse a .json or .toml file.")]
    UnsupportedConfigFormat { path: PathBuf },

    /// One or more configuration values are out of range or inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pipeline assembly errors ──────────────────────────────────────────
    /// A pipeline needs at least one stage.
    #[error("Pipeline has no stages")]
    EmptyPipeline,

    /// Two stages share a name; each stage owns the queue named after it.
    #[error("Duplicate stage name '{0}'\nEvery stage owns the queue named after it, so names must be unique.")]
    DuplicateStage(String),

    /// A stage name cannot be used as a queue directory name.
    #[error("Invalid stage name '{0}': use ASCII letters, digits, '-' or '_'")]
    InvalidStageName(String),

    // ── Collaborator setup errors ─────────────────────────────────────────
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Share(#[from] ShareError),

    /// The language model provider could not be created.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Catch-all for unexpected internal failures.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure of one stage on one unit of work.
///
/// Never stops the daemon. The orchestrator logs it with the stage name and
/// applies the redelivery policy to the input container.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An image could not be decoded or encoded.
    #[error("Image processing failed for '{name}': {detail}")]
    Image { name: String, detail: String },

    /// An external program (tesseract, scanimage) failed or was not found.
    #[error("External program '{program}' failed: {detail}")]
    Command { program: String, detail: String },

    /// pdfium could not be bound, or a PDF could not be loaded or written.
    #[error("PDF operation failed: {0}")]
    Pdf(String),

    /// A guesser exhausted its retry budget.
    #[error("Guessing the {what} failed after {attempts} attempts: {last_error}")]
    GuessExhausted {
        what: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Paperless(#[from] PaperlessError),

    #[error(transparent)]
    Share(#[from] ShareError),

    /// The scanning device reported an error other than "no paper".
    #[error("Scanner failed: {0}")]
    Scanner(String),

    /// The handler panicked; the payload message is preserved when it is a string.
    #[error("Stage panicked: {0}")]
    Panicked(String),
}

// ── Archive errors ────────────────────────────────────────────────────────

/// Errors recorded by an archive writer or raised by an archive reader.
///
/// `Clone` because a writer keeps its first error (sticky) and hands a copy
/// back from every later `finalize()` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchiveError {
    /// A content entry with this name was already added.
    #[error("Archive already contains an entry named '{0}'")]
    DuplicateName(String),

    /// Content entries may not use the metadata prefix.
    #[error("Entry name '{0}' uses the reserved metadata prefix")]
    ReservedName(String),

    /// Metadata was attached to a name that has no content entry.
    #[error("Cannot attach metadata to '{0}': no such entry in the archive")]
    OrphanMetadata(String),

    /// The requested entry does not exist.
    #[error("Archive has no entry named '{0}'")]
    NotFound(String),

    /// The writer was already sealed.
    #[error("Archive was already finalized")]
    AlreadyFinalized,

    /// The underlying storage failed.
    #[error("Archive I/O failed: {0}")]
    Io(String),

    /// The bytes are not a readable ZIP archive.
    #[error("Archive is corrupt: {0}")]
    Corrupt(String),

    /// Metadata could not be serialised.
    #[error("Archive metadata for '{name}' could not be encoded: {detail}")]
    Metadata { name: String, detail: String },
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => ArchiveError::Io(e.to_string()),
            other => ArchiveError::Corrupt(other.to_string()),
        }
    }
}

// ── Queue errors ──────────────────────────────────────────────────────────

/// Errors from the durable file queues.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A filesystem operation on the queue directory failed.
    #[error("Queue '{queue}' I/O failed at '{path}': {source}")]
    Io {
        queue: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The change watcher could not be installed.
    #[error("Queue '{queue}' watcher failed: {detail}")]
    Watch { queue: String, detail: String },

    /// The queue name cannot be used as a directory name.
    #[error("Invalid queue name '{0}': use ASCII letters, digits, '-' or '_'")]
    InvalidName(String),
}

// ── Collaborator errors ───────────────────────────────────────────────────

/// Errors from a text-completion backend.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The request never produced an HTTP response (DNS, TLS, timeout).
    #[error("Completion request failed: {0}")]
    Http(String),

    /// The endpoint answered with a non-success status.
    #[error("Completion endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("Unexpected completion response: {0}")]
    Malformed(String),

    /// An edgequake-llm provider returned an error.
    #[error("LLM provider error: {0}")]
    Provider(String),
}

/// Errors from the Paperless-ngx client.
#[derive(Debug, Error)]
pub enum PaperlessError {
    /// Uploads need a title; Paperless uses it as the document name.
    #[error("Paperless upload requires a title")]
    MissingTitle,

    #[error("Paperless request failed: {0}")]
    Http(String),

    /// The server answered with an unexpected status.
    #[error("Paperless {operation} returned HTTP {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// The server answered with a body we could not decode.
    #[error("Paperless {operation} returned an unexpected body: {detail}")]
    Decode {
        operation: &'static str,
        detail: String,
    },
}

/// Errors from the network share.
#[derive(Debug, Error)]
pub enum ShareError {
    /// The name would resolve outside the share's base path.
    #[error("Path '{0}' escapes the share base path")]
    PathEscapesBase(String),

    /// The rename target already exists.
    #[error("Share entry '{0}' already exists")]
    AlreadyExists(String),

    /// The share was stopped while a caller was waiting for it.
    #[error("Network share is stopped")]
    Stopped,

    #[error("Share I/O failed at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
