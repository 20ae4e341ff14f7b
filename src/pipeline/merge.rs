//! Merge the single-page PDFs of one scan batch into one document.

use crate::archive::{ArchiveWriter, Metadata};
use crate::error::StageError;
use crate::pdf::PdfEngine;
use crate::stage::{InputFiles, Stage};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

pub struct MergeStage {
    pdf: PdfEngine,
}

impl MergeStage {
    pub const NAME: &'static str = "merge";

    pub fn new(pdf: PdfEngine) -> Self {
        Self { pdf }
    }
}

/// Name of a merged document: `merged-<unix seconds>.pdf`.
pub fn merged_file_name(now: SystemTime) -> String {
    let secs = now.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    format!("merged-{secs}.pdf")
}

/// Union of the page metadata; the first page to set a key wins.
fn combine_metadata<'a>(pages: impl Iterator<Item = &'a Metadata>) -> Metadata {
    let mut combined = Metadata::new();
    for metadata in pages {
        for (key, value) in metadata {
            combined.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    combined
}

/// Orders page names so that digit runs compare by value: `scan-9.png`
/// sorts before `scan-10.png`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut x, mut y) = (a, b);
    loop {
        match (x.chars().next(), y.chars().next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(cx), Some(cy)) if cx.is_ascii_digit() && cy.is_ascii_digit() => {
                let (nx, rx) = split_digits(x);
                let (ny, ry) = split_digits(y);
                let (vx, vy) = (nx.trim_start_matches('0'), ny.trim_start_matches('0'));
                let ord = vx.len().cmp(&vy.len()).then_with(|| vx.cmp(vy));
                if ord != Ordering::Equal {
                    return ord;
                }
                x = rx;
                y = ry;
            }
            (Some(cx), Some(cy)) => {
                if cx != cy {
                    return cx.cmp(&cy);
                }
                x = &x[cx.len_utf8()..];
                y = &y[cy.len_utf8()..];
            }
        }
    }
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

#[async_trait]
impl Stage for MergeStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &mut self,
        inputs: &mut InputFiles,
        output: &mut dyn ArchiveWriter,
    ) -> Result<(), StageError> {
        let mut pages = inputs.collect_all().await;
        if pages.is_empty() {
            return Ok(());
        }
        pages.sort_by(|a, b| natural_cmp(a.name(), b.name()));
        let metadata = combine_metadata(pages.iter().map(|p| p.metadata()));
        let count = pages.len();

        let merged = if count == 1 {
            pages.pop().map(|p| p.into_bytes()).unwrap_or_default()
        } else {
            self.pdf
                .merge(pages.into_iter().map(|p| p.into_bytes()).collect())
                .await?
        };

        let name = merged_file_name(SystemTime::now());
        info!(pages = count, file = %name, bytes = merged.len(), "Merged document");
        output
            .add_file(&name, &merged)
            .attach_metadata(&name, &metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveEntry, ArchiveReader, MemoryArchiveWriter};
    use std::time::Duration;

    #[test]
    fn test_merged_file_name() {
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(merged_file_name(at), "merged-1700000000.pdf");
    }

    #[test]
    fn test_natural_order_of_page_names() {
        let mut names = vec![
            "scan-10.pdf",
            "scan-9.pdf",
            "scan-1.pdf",
            "scan-002.pdf",
            "scan-2.pdf",
            "cover.pdf",
        ];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(
            names,
            [
                "cover.pdf",
                "scan-1.pdf",
                "scan-002.pdf",
                "scan-2.pdf",
                "scan-9.pdf",
                "scan-10.pdf"
            ]
        );
    }

    #[test]
    fn test_combine_metadata_first_wins() {
        let a = Metadata::from([("k".to_string(), "1".to_string())]);
        let b = Metadata::from([
            ("k".to_string(), "2".to_string()),
            ("x".to_string(), "y".to_string()),
        ]);
        let combined = combine_metadata([&a, &b].into_iter());
        assert_eq!(combined["k"], "1");
        assert_eq!(combined["x"], "y");
    }

    #[tokio::test]
    async fn test_empty_batch_produces_nothing() {
        let mut out = MemoryArchiveWriter::new();
        MergeStage::new(PdfEngine::default())
            .run(&mut InputFiles::empty(), &mut out)
            .await
            .unwrap();
        assert_eq!(out.file_count(), 0);
    }

    #[tokio::test]
    async fn test_single_page_passes_through_without_pdfium() {
        let meta = Metadata::from([("tags".to_string(), "a".to_string())]);
        let mut inputs = InputFiles::from_entries(vec![ArchiveEntry::new(
            "1.pdf",
            b"%PDF-1.7".to_vec(),
            meta.clone(),
        )]);
        let mut out = MemoryArchiveWriter::new();
        MergeStage::new(PdfEngine::new("/nonexistent"))
            .run(&mut inputs, &mut out)
            .await
            .unwrap();

        let bytes = out.finalize().unwrap().into_bytes().unwrap();
        let mut reader = ArchiveReader::from_bytes(bytes).unwrap();
        let name = reader.file_names()[0].clone();
        assert!(name.starts_with("merged-") && name.ends_with(".pdf"));
        let entry = reader.get_file(&name).unwrap();
        assert_eq!(entry.bytes(), b"%PDF-1.7");
        assert_eq!(entry.metadata(), &meta);
    }
}
