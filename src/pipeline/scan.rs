//! First stage: pull a batch of page images from a [`Scanner`].

use crate::archive::ArchiveWriter;
use crate::error::StageError;
use crate::scanner::Scanner;
use crate::stage::{InputFiles, Stage};
use async_trait::async_trait;
use tracing::info;

pub struct ScanStage {
    scanner: Box<dyn Scanner>,
}

impl ScanStage {
    pub const NAME: &'static str = "scan";

    pub fn new(scanner: Box<dyn Scanner>) -> Self {
        Self { scanner }
    }
}

#[async_trait]
impl Stage for ScanStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &mut self,
        _inputs: &mut InputFiles,
        output: &mut dyn ArchiveWriter,
    ) -> Result<(), StageError> {
        let pages = self.scanner.scan().await?;
        if pages.is_empty() {
            return Ok(());
        }
        info!(pages = pages.len(), "Scanned batch");
        for page in &pages {
            output.add_file(&page.name, &page.data);
        }
        Ok(())
    }

    async fn acknowledge(&mut self) -> Result<(), StageError> {
        self.scanner.acknowledge().await
    }
}
