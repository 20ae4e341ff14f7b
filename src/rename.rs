//! Companion tool: rename the PDFs on a share from their content.
//!
//! Every `.pdf` at the share root is downloaded, its text extracted and a
//! sortable name guessed. A failure on one file is reported and the run moves
//! on to the next.

use crate::error::{ShareError, StageError};
use crate::guess::NameGuesser;
use crate::pdf::TextExtractor;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::share::FileShare;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenameReport {
    /// `(old, new)` pairs; in a dry run these are only proposals.
    pub renamed: Vec<(String, String)>,
    /// Files whose guessed name equals the current one.
    pub unchanged: Vec<String>,
    /// Non-PDF files that were not looked at.
    pub skipped: Vec<String>,
    /// `(name, error)` pairs.
    pub failed: Vec<(String, String)>,
}

pub struct ShareRenamer {
    share: Arc<dyn FileShare>,
    extractor: Arc<dyn TextExtractor>,
    guesser: Arc<dyn NameGuesser>,
    dry_run: bool,
    progress: ProgressCallback,
}

fn is_pdf(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".pdf")
}

impl ShareRenamer {
    pub fn new(
        share: Arc<dyn FileShare>,
        extractor: Arc<dyn TextExtractor>,
        guesser: Arc<dyn NameGuesser>,
    ) -> Self {
        Self {
            share,
            extractor,
            guesser,
            dry_run: false,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    /// Guess names without renaming anything.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn progress_callback(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Fails only when the share cannot be listed.
    pub async fn run(&self) -> Result<RenameReport, ShareError> {
        let mut report = RenameReport::default();
        let (pdfs, others): (Vec<String>, Vec<String>) =
            self.share.list().await?.into_iter().partition(|n| is_pdf(n));
        for name in others {
            info!(file = %name, "Skipping non-PDF file");
            report.skipped.push(name);
        }

        self.progress.on_run_start(pdfs.len());
        for name in pdfs {
            self.progress.on_file_start(&name);
            match self.rename_one(&name).await {
                Ok(Some(new_name)) => {
                    self.progress.on_file_renamed(&name, &new_name);
                    report.renamed.push((name, new_name));
                }
                Ok(None) => {
                    self.progress.on_file_unchanged(&name);
                    report.unchanged.push(name);
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "Failed to rename file");
                    self.progress.on_file_error(&name, &e.to_string());
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        self.progress
            .on_run_complete(report.renamed.len(), report.failed.len());
        Ok(report)
    }

    /// The new name, or `None` when the file already has it.
    async fn rename_one(&self, name: &str) -> Result<Option<String>, StageError> {
        let pdf = self.share.download(name).await?;
        let text = self.extractor.extract_text(pdf).await?;
        let new_name = self.guesser.guess_name(&text).await?;
        if new_name == name {
            return Ok(None);
        }
        if self.dry_run {
            info!(from = %name, to = %new_name, "Would rename");
        } else {
            self.share.rename(name, &new_name).await?;
            info!(from = %name, to = %new_name, "Renamed");
        }
        Ok(Some(new_name))
    }
}
