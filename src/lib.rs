//! # scanflow
//!
//! A staged document-scanning daemon: pages come in from a scanner, get
//! cleaned up, OCR'd, merged, named and tagged by a language model, and end
//! up in Paperless-ngx or on a network share.
//!
//! ## Why stages and queues?
//!
//! Every step talks to something slow or flaky (a USB scanner, tesseract,
//! an LLM endpoint, a NAS). Each stage runs on its own task and hands its
//! output to the next stage through a durable directory queue, so a crash or
//! restart loses nothing, and one failing step never stops the others.
//!
//! ## Pipeline Overview
//!
//! ```text
//!  scanner
//!   │
//!   ├─ 1. scan     batch of page images            ─▶ queue "scan"
//!   ├─ 2. rotate   rotate/enhance, PNG              ─▶ queue "rotate"
//!   ├─ 3. ocr      tesseract, one PDF per page      ─▶ queue "ocr"
//!   ├─ 4. merge    pdfium, one PDF per batch        ─▶ queue "merge"
//!   ├─ 5. tag      LLM file name + tags metadata    ─▶ queue "tag"
//!   └─ 6. deliver  Paperless-ngx or network share
//! ```
//!
//! Units of work are ZIP containers ([`archive`]); per-file facts such as
//! tags travel next to the bytes as metadata side-entries.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scanflow::{Config, Daemon, Pipeline};
//! use scanflow::pipeline::standard_stages;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("scanflow.toml".as_ref())?;
//!     let stages = standard_stages(&config, None)?;
//!     let pipeline = Pipeline::assemble(stages, config.queue.daemon_config()?)?;
//!
//!     let daemon = Daemon::start(pipeline);
//!     tokio::signal::ctrl_c().await?;
//!     daemon.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Writing a Stage
//!
//! ```rust
//! use scanflow::{ArchiveWriter, InputFiles, Stage, StageError};
//!
//! struct Shout;
//!
//! #[async_trait::async_trait]
//! impl Stage for Shout {
//!     fn name(&self) -> &str {
//!         "shout"
//!     }
//!
//!     async fn run(
//!         &mut self,
//!         inputs: &mut InputFiles,
//!         output: &mut dyn ArchiveWriter,
//!     ) -> Result<(), StageError> {
//!         while let Some(file) = inputs.next().await {
//!             output
//!                 .add_file(file.name(), &file.bytes().to_ascii_uppercase())
//!                 .attach_metadata(file.name(), file.metadata());
//!         }
//!         Ok(())
//!     }
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `scanflow` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! scanflow = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod archive;
pub mod config;
pub mod daemon;
pub mod error;
pub mod guess;
pub mod llm;
pub mod ocr;
pub mod paperless;
pub mod pdf;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod queue;
pub mod rename;
pub mod scanner;
pub mod share;
pub mod stage;
pub mod tags;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use archive::{
    ArchiveEntry, ArchiveReader, ArchiveWriter, FsArchiveWriter, MemoryArchiveWriter, Metadata,
    SealedArchive,
};
pub use config::{Config, DaemonConfig, DaemonConfigBuilder};
pub use daemon::{Daemon, Pipeline, StageRunner, TickOutcome};
pub use error::{
    ArchiveError, LlmError, PaperlessError, QueueError, ScanflowError, ShareError, StageError,
};
pub use progress::{NoopProgressCallback, ProgressCallback, RenameProgressCallback};
pub use queue::{FileQueue, QueueEntry, QueueWatcher, WakePolicy};
pub use rename::{RenameReport, ShareRenamer};
pub use share::{FileShare, MountedShare};
pub use stage::{InputFiles, Stage};
