//! Terminal stages: hand finished documents to Paperless or a file share.
//!
//! Neither produces output. A failed upload fails the whole container, so
//! it is redelivered; documents uploaded before the failure are uploaded
//! again on the next attempt.

use crate::archive::ArchiveWriter;
use crate::error::StageError;
use crate::paperless::{Document, DocumentStore};
use crate::share::FileShare;
use crate::stage::{InputFiles, Stage};
use crate::tags::{clean_tags, TAGS_KEY};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct PaperlessUploadStage {
    store: Arc<dyn DocumentStore>,
}

impl PaperlessUploadStage {
    pub const NAME: &'static str = "paperless-upload";

    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for PaperlessUploadStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &mut self,
        inputs: &mut InputFiles,
        _output: &mut dyn ArchiveWriter,
    ) -> Result<(), StageError> {
        while let Some(file) = inputs.next().await {
            let tags = clean_tags(file.metadata().get(TAGS_KEY).map_or("", String::as_str));
            let title = file.name().to_string();
            info!(file = %title, tags = ?tags, "Uploading to Paperless");
            self.store
                .upload(Document {
                    title,
                    tags,
                    data: file.into_bytes(),
                    ..Document::default()
                })
                .await?;
        }
        Ok(())
    }
}

pub struct ShareUploadStage {
    share: Arc<dyn FileShare>,
}

impl ShareUploadStage {
    pub const NAME: &'static str = "share-upload";

    pub fn new(share: Arc<dyn FileShare>) -> Self {
        Self { share }
    }
}

#[async_trait]
impl Stage for ShareUploadStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &mut self,
        inputs: &mut InputFiles,
        _output: &mut dyn ArchiveWriter,
    ) -> Result<(), StageError> {
        while let Some(file) = inputs.next().await {
            info!(file = file.name(), bytes = file.bytes().len(), "Uploading to share");
            self.share.upload(file.name(), file.bytes()).await?;
        }
        Ok(())
    }
}
