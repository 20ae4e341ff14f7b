//! Name each document and attach topical tags, both guessed by a language
//! model from the document text.

use crate::archive::{ArchiveWriter, Metadata};
use crate::error::StageError;
use crate::guess::{NameGuesser, TagGuesser};
use crate::pdf::TextExtractor;
use crate::stage::{InputFiles, Stage};
use crate::tags::{join_tags, TAGS_KEY};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct TagStage {
    extractor: Arc<dyn TextExtractor>,
    names: Arc<dyn NameGuesser>,
    tags: Arc<dyn TagGuesser>,
}

impl TagStage {
    pub const NAME: &'static str = "tag";

    pub fn new(
        extractor: Arc<dyn TextExtractor>,
        names: Arc<dyn NameGuesser>,
        tags: Arc<dyn TagGuesser>,
    ) -> Self {
        Self {
            extractor,
            names,
            tags,
        }
    }
}

/// `name`, or `name` with `-2`, `-3`, ... before the extension when it is
/// already taken.
fn unique_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    };
    (2..)
        .map(|n| format!("{stem}-{n}{ext}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| name.to_string())
}

#[async_trait]
impl Stage for TagStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &mut self,
        inputs: &mut InputFiles,
        output: &mut dyn ArchiveWriter,
    ) -> Result<(), StageError> {
        while let Some(file) = inputs.next().await {
            let mut metadata: Metadata = file.metadata().clone();
            let pdf = file.into_bytes();
            let text = self.extractor.extract_text(pdf.clone()).await?;

            let guessed = self.names.guess_name(&text).await?;
            let tags = self.tags.guess_tags(&text).await?;
            let name = unique_name(&guessed, |n| output.contains(n));
            info!(file = %name, tags = ?tags, "Named and tagged document");

            metadata.insert(TAGS_KEY.to_string(), join_tags(&tags));
            output
                .add_file(&name, &pdf)
                .attach_metadata(&name, &metadata);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveEntry, ArchiveReader, MemoryArchiveWriter};

    struct Utf8Text;

    #[async_trait]
    impl TextExtractor for Utf8Text {
        async fn extract_text(&self, pdf: Vec<u8>) -> Result<String, StageError> {
            Ok(String::from_utf8_lossy(&pdf).into_owned())
        }
    }

    struct FixedName(&'static str);

    #[async_trait]
    impl NameGuesser for FixedName {
        async fn guess_name(&self, _text: &str) -> Result<String, StageError> {
            Ok(self.0.to_string())
        }
    }

    /// One tag per word of the text.
    struct WordTags;

    #[async_trait]
    impl TagGuesser for WordTags {
        async fn guess_tags(&self, text: &str) -> Result<Vec<String>, StageError> {
            Ok(text.split_whitespace().map(str::to_string).collect())
        }
    }

    #[test]
    fn test_unique_name() {
        let taken = ["a.pdf", "a-2.pdf"];
        let is_taken = |n: &str| taken.contains(&n);
        assert_eq!(unique_name("b.pdf", is_taken), "b.pdf");
        assert_eq!(unique_name("a.pdf", is_taken), "a-3.pdf");
        assert_eq!(unique_name("a-2.pdf", |n| n == "a-2.pdf"), "a-2-2.pdf");
    }

    #[tokio::test]
    async fn test_tags_attached_and_names_deduplicated() {
        let mut inputs = InputFiles::from_entries(vec![
            ArchiveEntry::new("m1.pdf", b"Invoice Acme".to_vec(), Metadata::new()),
            ArchiveEntry::new("m2.pdf", b"Letter".to_vec(), Metadata::new()),
        ]);
        let mut stage = TagStage::new(
            Arc::new(Utf8Text),
            Arc::new(FixedName("2024-05-01-Doc.pdf")),
            Arc::new(WordTags),
        );
        let mut out = MemoryArchiveWriter::new();
        stage.run(&mut inputs, &mut out).await.unwrap();

        let bytes = out.finalize().unwrap().into_bytes().unwrap();
        let mut reader = ArchiveReader::from_bytes(bytes).unwrap();
        assert_eq!(reader.file_names(), ["2024-05-01-Doc.pdf", "2024-05-01-Doc-2.pdf"]);
        let first = reader.get_file("2024-05-01-Doc.pdf").unwrap();
        assert_eq!(first.metadata()[TAGS_KEY], "Invoice,Acme");
        assert_eq!(first.bytes(), b"Invoice Acme");
    }
}
