//! Page images to searchable single-page PDFs. Blank pages are dropped.

use crate::archive::ArchiveWriter;
use crate::error::StageError;
use crate::ocr::Ocr;
use crate::stage::{InputFiles, Stage};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

pub struct OcrStage {
    ocr: Box<dyn Ocr>,
}

impl OcrStage {
    pub const NAME: &'static str = "ocr";

    pub fn new(ocr: Box<dyn Ocr>) -> Self {
        Self { ocr }
    }
}

/// `scan-001.png` becomes `scan-001.pdf`.
pub fn pdf_file_name(name: &str) -> String {
    let path = Path::new(name);
    match path.file_stem() {
        Some(stem) if path.extension().is_some() => format!("{}.pdf", stem.to_string_lossy()),
        _ => format!("{name}.pdf"),
    }
}

/// True when OCR found nothing but whitespace.
fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

#[async_trait]
impl Stage for OcrStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &mut self,
        inputs: &mut InputFiles,
        output: &mut dyn ArchiveWriter,
    ) -> Result<(), StageError> {
        while let Some(file) = inputs.next().await {
            let text = self.ocr.image_to_text(file.bytes()).await?;
            if is_blank(&text) {
                info!(file = file.name(), "Blank page skipped");
                continue;
            }

            let pdf = self.ocr.image_to_pdf(file.bytes()).await?;
            let name = pdf_file_name(file.name());
            debug!(file = file.name(), pdf = %name, chars = text.len(), "Recognised page");
            output
                .add_file(&name, &pdf)
                .attach_metadata(&name, file.metadata());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveEntry, Metadata, MemoryArchiveWriter};

    /// Treats the image bytes as the page text.
    struct FakeOcr;

    #[async_trait]
    impl Ocr for FakeOcr {
        async fn image_to_text(&self, image: &[u8]) -> Result<String, StageError> {
            Ok(String::from_utf8_lossy(image).into_owned())
        }

        async fn image_to_pdf(&self, image: &[u8]) -> Result<Vec<u8>, StageError> {
            let mut pdf = b"%PDF ".to_vec();
            pdf.extend_from_slice(image);
            Ok(pdf)
        }
    }

    #[test]
    fn test_pdf_file_name() {
        assert_eq!(pdf_file_name("scan-001.png"), "scan-001.pdf");
        assert_eq!(pdf_file_name("page"), "page.pdf");
    }

    #[tokio::test]
    async fn test_blank_pages_are_dropped() {
        let mut inputs = InputFiles::from_entries(vec![
            ArchiveEntry::new("1.png", b"Hello".to_vec(), Metadata::new()),
            ArchiveEntry::new("2.png", b" \n\t ".to_vec(), Metadata::new()),
            ArchiveEntry::new("3.png", b"World".to_vec(), Metadata::new()),
        ]);
        let mut out = MemoryArchiveWriter::new();
        OcrStage::new(Box::new(FakeOcr))
            .run(&mut inputs, &mut out)
            .await
            .unwrap();
        assert_eq!(out.file_count(), 2);
        assert!(out.contains("1.pdf"));
        assert!(!out.contains("2.pdf"));
        assert!(out.contains("3.pdf"));
    }

    #[tokio::test]
    async fn test_all_blank_produces_nothing() {
        let mut inputs =
            InputFiles::from_entries(vec![ArchiveEntry::new("1.png", Vec::new(), Metadata::new())]);
        let mut out = MemoryArchiveWriter::new();
        OcrStage::new(Box::new(FakeOcr))
            .run(&mut inputs, &mut out)
            .await
            .unwrap();
        assert_eq!(out.file_count(), 0);
    }
}
