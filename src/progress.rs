//! Progress-callback trait for the share rename tool.
//!
//! Inject an [`Arc<dyn RenameProgressCallback>`] via
//! [`crate::rename::ShareRenamer::progress_callback`] to follow a run file by
//! file, e.g. to drive a terminal progress bar.
//!
//! # Example
//!
//! ```rust
//! use scanflow::RenameProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingCallback {
//!     renamed: AtomicUsize,
//! }
//!
//! impl RenameProgressCallback for CountingCallback {
//!     fn on_file_renamed(&self, from: &str, to: &str) {
//!         self.renamed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{from} -> {to}");
//!     }
//! }
//! ```

use std::sync::Arc;

/// Receives events while the share rename tool works through a share.
///
/// All methods have empty defaults; implement only what you need.
pub trait RenameProgressCallback: Send + Sync {
    /// Called once after listing, with the number of PDFs to look at.
    fn on_run_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// Called before a file is downloaded.
    fn on_file_start(&self, name: &str) {
        let _ = name;
    }

    /// Called after a rename, or after the guess in a dry run.
    fn on_file_renamed(&self, from: &str, to: &str) {
        let _ = (from, to);
    }

    /// Called when a file keeps its name because the guess equals it.
    fn on_file_unchanged(&self, name: &str) {
        let _ = name;
    }

    /// Called when a file could not be handled; the run continues.
    fn on_file_error(&self, name: &str, error: &str) {
        let _ = (name, error);
    }

    fn on_run_complete(&self, renamed: usize, failed: usize) {
        let _ = (renamed, failed);
    }
}

/// Callback that ignores every event.
pub struct NoopProgressCallback;

impl RenameProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn RenameProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(2);
        cb.on_file_start("a.pdf");
        cb.on_file_renamed("a.pdf", "b.pdf");
        cb.on_file_unchanged("b.pdf");
        cb.on_file_error("c.pdf", "boom");
        cb.on_run_complete(1, 1);
    }

    #[test]
    fn partial_implementation_keeps_defaults() {
        struct Errors(Mutex<Vec<String>>);
        impl RenameProgressCallback for Errors {
            fn on_file_error(&self, name: &str, error: &str) {
                self.0.lock().unwrap().push(format!("{name}: {error}"));
            }
        }

        let cb: ProgressCallback = Arc::new(Errors(Mutex::new(Vec::new())));
        cb.on_file_start("a.pdf");
        cb.on_file_error("a.pdf", "not a pdf");
    }
}
