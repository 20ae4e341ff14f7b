//! The contract every pipeline stage implements.

use crate::archive::{ArchiveEntry, ArchiveWriter};
use crate::error::StageError;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Input files handed to a stage, one at a time.
///
/// The producer side is a bounded channel: the orchestrator reads the next
/// entry from the input archive only after the stage took the previous one.
/// A stage that stops early simply stops pulling.
pub struct InputFiles {
    inner: ReceiverStream<ArchiveEntry>,
}

impl InputFiles {
    /// Creates the producer and consumer halves of a hand-off.
    pub fn channel(capacity: usize) -> (mpsc::Sender<ArchiveEntry>, InputFiles) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            InputFiles {
                inner: ReceiverStream::new(rx),
            },
        )
    }

    /// No input at all; used for the first stage of a pipeline.
    pub fn empty() -> Self {
        Self::channel(1).1
    }

    /// All entries available up front.
    pub fn from_entries(entries: Vec<ArchiveEntry>) -> Self {
        let (tx, inputs) = Self::channel(entries.len());
        for entry in entries {
            // Capacity equals the number of entries, so this cannot be full.
            let _ = tx.try_send(entry);
        }
        inputs
    }

    /// Next input file, or `None` when the container is exhausted.
    pub async fn next(&mut self) -> Option<ArchiveEntry> {
        self.inner.next().await
    }

    /// Drains the remaining inputs.
    pub async fn collect_all(&mut self) -> Vec<ArchiveEntry> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await {
            entries.push(entry);
        }
        entries
    }
}

impl Stream for InputFiles {
    type Item = ArchiveEntry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// One processing step.
///
/// `run` is called once per unit of work with the files of one input
/// container (none for the first stage) and a fresh output container. The
/// output is forwarded to the next stage only if `run` returns `Ok`, the
/// writer has not failed and it holds at least one file.
///
/// Calls are strictly sequential for one instance. `close` is called exactly
/// once when the daemon stops.
#[async_trait]
pub trait Stage: Send {
    /// Stable name. It names the stage's log span and its outbound queue,
    /// so it must be unique in a pipeline and filesystem safe.
    fn name(&self) -> &str;

    async fn run(
        &mut self,
        inputs: &mut InputFiles,
        output: &mut dyn ArchiveWriter,
    ) -> Result<(), StageError>;

    /// Called after a successful `run` once its output is safely enqueued
    /// and its input consumed. Sources use it to delete what they handed
    /// over.
    async fn acknowledge(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Metadata, MemoryArchiveWriter};

    struct Upper;

    #[async_trait]
    impl Stage for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn run(
            &mut self,
            inputs: &mut InputFiles,
            output: &mut dyn ArchiveWriter,
        ) -> Result<(), StageError> {
            while let Some(file) = inputs.next().await {
                let upper = file.bytes().to_ascii_uppercase();
                output.add_file(file.name(), &upper);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stage_consumes_all_inputs() {
        let mut inputs = InputFiles::from_entries(vec![
            ArchiveEntry::new("a.txt", b"abc".to_vec(), Metadata::new()),
            ArchiveEntry::new("b.txt", b"def".to_vec(), Metadata::new()),
        ]);
        let mut out = MemoryArchiveWriter::new();
        Upper.run(&mut inputs, &mut out).await.unwrap();
        assert_eq!(out.file_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_inputs_end_immediately() {
        let mut inputs = InputFiles::empty();
        assert!(inputs.next().await.is_none());
    }

    #[test]
    fn test_stage_is_object_safe() {
        let stages: Vec<Box<dyn Stage>> = vec![Box::new(Upper)];
        assert_eq!(stages[0].name(), "upper");
    }
}
