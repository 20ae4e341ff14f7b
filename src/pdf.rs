//! PDF merging and text extraction via pdfium.
//!
//! pdfium keeps thread-local state and blocks, so every operation binds the
//! library and runs inside `tokio::task::spawn_blocking`.

use crate::error::StageError;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Turns a PDF into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, pdf: Vec<u8>) -> Result<String, StageError>;
}

/// Binds pdfium on demand from a configured library or the system one.
#[derive(Debug, Clone, Default)]
pub struct PdfEngine {
    library_path: Option<PathBuf>,
}

impl PdfEngine {
    /// `library_path` may name the shared library itself or the directory
    /// holding it. An empty path binds the system library.
    pub fn new(library_path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = library_path.into();
        Self {
            library_path: (!path.as_os_str().is_empty()).then_some(path),
        }
    }

    pub fn library_path(&self) -> Option<&Path> {
        self.library_path.as_deref()
    }

    fn bind(&self) -> Result<Pdfium, StageError> {
        let bindings = match &self.library_path {
            Some(path) if path.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
            }
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| StageError::Pdf(format!("Failed to bind pdfium: {:?}", e)))?;
        Ok(Pdfium::new(bindings))
    }

    /// Concatenates the pages of `documents` in order into one PDF.
    pub async fn merge(&self, documents: Vec<Vec<u8>>) -> Result<Vec<u8>, StageError> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.merge_blocking(&documents))
            .await
            .map_err(|e| StageError::Pdf(format!("Merge task panicked: {}", e)))?
    }

    fn merge_blocking(&self, documents: &[Vec<u8>]) -> Result<Vec<u8>, StageError> {
        let pdfium = self.bind()?;
        let mut merged = pdfium
            .create_new_pdf()
            .map_err(|e| StageError::Pdf(format!("Failed to create PDF: {:?}", e)))?;

        for (index, bytes) in documents.iter().enumerate() {
            let source = pdfium
                .load_pdf_from_byte_slice(bytes, None)
                .map_err(|e| StageError::Pdf(format!("Input {} is not a PDF: {:?}", index, e)))?;
            merged
                .pages_mut()
                .append(&source)
                .map_err(|e| {
                    StageError::Pdf(format!("Failed to append input {}: {:?}", index, e))
                })?;
        }

        debug!(
            inputs = documents.len(),
            pages = merged.pages().len(),
            "Merged PDF"
        );
        merged
            .save_to_bytes()
            .map_err(|e| StageError::Pdf(format!("Failed to save merged PDF: {:?}", e)))
    }

    fn extract_text_blocking(&self, pdf: &[u8]) -> Result<String, StageError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, None)
            .map_err(|e| StageError::Pdf(format!("Not a readable PDF: {:?}", e)))?;

        let mut text = String::new();
        for page in document.pages().iter() {
            let page_text = page
                .text()
                .map_err(|e| StageError::Pdf(format!("Failed to read page text: {:?}", e)))?;
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&page_text.all());
        }
        Ok(text)
    }
}

#[async_trait]
impl TextExtractor for PdfEngine {
    async fn extract_text(&self, pdf: Vec<u8>) -> Result<String, StageError> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.extract_text_blocking(&pdf))
            .await
            .map_err(|e| StageError::Pdf(format!("Text extraction task panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_library_path_means_system() {
        assert!(PdfEngine::new("").library_path().is_none());
        assert_eq!(
            PdfEngine::new("/opt/pdfium/lib").library_path(),
            Some(Path::new("/opt/pdfium/lib"))
        );
    }

    #[tokio::test]
    async fn test_bind_failure_is_a_stage_error() {
        let engine = PdfEngine::new("/nonexistent/libpdfium.so");
        let err = engine.merge(vec![]).await.unwrap_err();
        assert!(matches!(err, StageError::Pdf(msg) if msg.contains("bind")));
    }
}
