//! Pipeline orchestration.
//!
//! ```text
//!  ┌────────┐  queue "scan"  ┌────────┐  queue "ocr"  ┌────────┐
//!  │  scan  │ ─────────────▶ │  ocr   │ ────────────▶ │ upload │ ──▶ Paperless
//!  └────────┘                └────────┘               └────────┘
//!   task 1                    task 2                   task 3
//! ```
//!
//! Each stage runs in its own tokio task and handles one container per tick.
//! A tick dequeues the earliest input container, streams its files into the
//! stage over a capacity-1 channel, and, when the stage succeeds, enqueues
//! the stage's output for the next stage before deleting the input.
//!
//! Failures (errors, failed output writers, panics) stay inside the stage:
//! the input container is left in place with its attempt count raised, and
//! after `max_attempts` it moves to the queue's dead-letter directory.

use crate::archive::{ArchiveEntry, ArchiveReader, ArchiveWriter, FsArchiveWriter};
use crate::config::DaemonConfig;
use crate::error::{ScanflowError, StageError};
use crate::queue::{
    is_valid_queue_name, prepare_staging, FileQueue, QueueEntry, QueueWatcher, WakePolicy,
};
use crate::stage::{InputFiles, Stage};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::io::{Read, Seek};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Entries buffered between the archive reader and the stage.
const HANDOFF_CAPACITY: usize = 1;

/// What one tick of a stage did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The input queue was empty.
    Idle,
    /// The stage succeeded. `forwarded` is false when it produced no files
    /// or is the last stage.
    Completed {
        inputs: usize,
        outputs: usize,
        forwarded: bool,
    },
    /// The stage failed; the input (if any) is left for redelivery.
    Failed { attempts: u32 },
    /// The stage failed for the last allowed time; the input was moved to
    /// the dead-letter directory.
    DeadLettered { attempts: u32 },
}

impl TickOutcome {
    /// True when a container left the input queue.
    pub fn consumed_input(&self) -> bool {
        matches!(
            self,
            TickOutcome::Completed { .. } | TickOutcome::DeadLettered { .. }
        )
    }
}

/// A stage wired to its input and output queues.
pub struct StageRunner {
    stage: Box<dyn Stage>,
    input: Option<FileQueue>,
    output: Option<FileQueue>,
    staging: PathBuf,
    max_attempts: u32,
    span: Span,
}

impl StageRunner {
    pub fn name(&self) -> &str {
        self.stage.name()
    }

    /// Queue this stage consumes; `None` for the first stage.
    pub fn input(&self) -> Option<&FileQueue> {
        self.input.as_ref()
    }

    /// Queue this stage feeds; `None` for the last stage.
    pub fn output(&self) -> Option<&FileQueue> {
        self.output.as_ref()
    }

    /// Processes at most one unit of work.
    pub async fn tick(&mut self) -> TickOutcome {
        let span = self.span.clone();
        self.process_one().instrument(span).await
    }

    /// Calls the stage's `close` hook, logging failures.
    pub async fn close(&mut self) {
        let span = self.span.clone();
        self.close_stage().instrument(span).await
    }

    async fn close_stage(&mut self) {
        match AssertUnwindSafe(self.stage.close()).catch_unwind().await {
            Ok(Ok(())) => debug!("Stage closed"),
            Ok(Err(e)) => error!(error = %e, "Stage failed to close"),
            Err(payload) => error!(
                panic = %panic_message(payload.as_ref()),
                "Stage panicked while closing"
            ),
        }
    }

    /// Runs the stage's `acknowledge` hook. A failure or panic is logged;
    /// the unit of work already counts as completed.
    async fn acknowledge(&mut self) {
        match AssertUnwindSafe(self.stage.acknowledge()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Stage failed to acknowledge completed work"),
            Err(payload) => error!(
                panic = %panic_message(payload.as_ref()),
                "Stage panicked while acknowledging completed work"
            ),
        }
    }

    async fn process_one(&mut self) -> TickOutcome {
        let entry = match &self.input {
            None => None,
            Some(queue) => match queue.dequeue() {
                Ok(Some(entry)) => Some(entry),
                Ok(None) => return TickOutcome::Idle,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue input");
                    return TickOutcome::Failed { attempts: 0 };
                }
            },
        };
        if let Some(entry) = &entry {
            debug!(
                entry = %entry.path().display(),
                attempts = entry.attempts(),
                "Processing container"
            );
        }

        let mut output = FsArchiveWriter::create_in(&self.staging);
        let result = match self.execute(entry.as_ref(), &mut output).await {
            Ok(inputs) => self
                .forward(&mut output)
                .map(|forwarded| (inputs, forwarded)),
            Err(e) => Err(e),
        };

        match result {
            Ok((inputs, forwarded)) => {
                let outputs = output.file_count();
                if let Some(entry) = entry {
                    if let Err(e) = entry.done() {
                        error!(error = %e, "Failed to remove consumed input");
                    }
                }
                self.acknowledge().await;
                if inputs > 0 || outputs > 0 {
                    info!(inputs, outputs, forwarded, "Unit of work completed");
                }
                TickOutcome::Completed {
                    inputs,
                    outputs,
                    forwarded,
                }
            }
            Err(e) => self.fail(entry, &e),
        }
    }

    /// Runs the stage over one input container. Returns the number of input
    /// files handed over.
    async fn execute(
        &mut self,
        entry: Option<&QueueEntry>,
        output: &mut FsArchiveWriter,
    ) -> Result<usize, StageError> {
        let reader = match entry {
            Some(entry) => Some(ArchiveReader::new(entry.reader()?)?),
            None => None,
        };

        let (tx, inputs) = InputFiles::channel(HANDOFF_CAPACITY);
        let stage = &mut self.stage;
        let sink: &mut dyn ArchiveWriter = &mut *output;
        // `inputs` moves into the future so the feeder sees a closed channel
        // as soon as the stage returns or panics.
        let run = AssertUnwindSafe(async move {
            let mut inputs = inputs;
            stage.run(&mut inputs, sink).await
        })
        .catch_unwind();

        let (fed, ran) = tokio::join!(feed(reader, tx), run);
        ran.map_err(|payload| StageError::Panicked(panic_message(payload.as_ref())))??;
        if let Some(err) = output.error() {
            return Err(err.clone().into());
        }
        fed
    }

    /// Seals and enqueues the output when there is somewhere to send it and
    /// something to send.
    fn forward(&self, output: &mut FsArchiveWriter) -> Result<bool, StageError> {
        let count = output.file_count();
        match &self.output {
            Some(queue) if count > 0 => {
                let sealed = output.finalize()?;
                let path = queue.enqueue_sealed(sealed)?;
                debug!(
                    queue = queue.name(),
                    entry = %path.display(),
                    files = count,
                    "Forwarded output"
                );
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                if count > 0 {
                    warn!(files = count, "Last stage produced files; discarding them");
                }
                Ok(false)
            }
        }
    }

    fn fail(&self, entry: Option<QueueEntry>, err: &StageError) -> TickOutcome {
        let Some(entry) = entry else {
            error!(error = %err, "Stage failed");
            return TickOutcome::Failed { attempts: 0 };
        };

        let attempts = entry.attempts() + 1;
        if self.max_attempts > 0 && attempts >= self.max_attempts {
            error!(error = %err, attempts, "Stage failed; giving up on container");
            match entry.dead_letter() {
                Ok(path) => {
                    warn!(dead_letter = %path.display(), "Container moved to dead letters");
                    TickOutcome::DeadLettered { attempts }
                }
                Err(e) => {
                    error!(error = %e, "Failed to dead-letter container");
                    TickOutcome::Failed { attempts }
                }
            }
        } else {
            error!(error = %err, attempts, "Stage failed; container left for redelivery");
            if let Err(e) = entry.release_failed() {
                error!(error = %e, "Failed to release container for redelivery");
            }
            TickOutcome::Failed { attempts }
        }
    }
}

/// Streams the files of an input archive into the stage's channel.
async fn feed<R: Read + Seek>(
    reader: Option<ArchiveReader<R>>,
    tx: mpsc::Sender<ArchiveEntry>,
) -> Result<usize, StageError> {
    let Some(mut reader) = reader else {
        return Ok(0);
    };
    let names = reader.file_names().to_vec();
    let mut sent = 0;
    for name in &names {
        let entry = reader.get_file(name)?;
        if tx.send(entry).await.is_err() {
            debug!(remaining = names.len() - sent, "Stage stopped reading its inputs");
            break;
        }
        sent += 1;
    }
    Ok(sent)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────

/// An ordered list of stages connected by queues.
///
/// Stage `i` feeds the queue named after it, which stage `i + 1` consumes.
pub struct Pipeline {
    runners: Vec<StageRunner>,
    config: DaemonConfig,
}

impl Pipeline {
    /// Validates stage names and opens every queue.
    pub fn assemble(
        stages: Vec<Box<dyn Stage>>,
        config: DaemonConfig,
    ) -> Result<Self, ScanflowError> {
        if stages.is_empty() {
            return Err(ScanflowError::EmptyPipeline);
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            let name = stage.name();
            if !is_valid_queue_name(name) {
                return Err(ScanflowError::InvalidStageName(name.to_string()));
            }
            if !seen.insert(name.to_string()) {
                return Err(ScanflowError::DuplicateStage(name.to_string()));
            }
        }

        let staging = prepare_staging(&config.queue_root)?;
        let count = stages.len();
        let mut runners = Vec::with_capacity(count);
        let mut previous: Option<FileQueue> = None;

        for (index, stage) in stages.into_iter().enumerate() {
            let output = if index + 1 < count {
                Some(FileQueue::open(&config.queue_root, stage.name())?)
            } else {
                None
            };
            let span = info_span!("stage", stage = %stage.name());
            runners.push(StageRunner {
                stage,
                input: previous.take(),
                output: output.clone(),
                staging: staging.clone(),
                max_attempts: config.max_attempts,
                span,
            });
            previous = output;
        }

        info!(
            stages = count,
            root = %config.queue_root.display(),
            "Pipeline assembled"
        );
        Ok(Self { runners, config })
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.runners.iter().map(StageRunner::name).collect()
    }

    /// The outbound queue of `stage`.
    pub fn queue(&self, stage: &str) -> Option<&FileQueue> {
        self.runners
            .iter()
            .find(|r| r.name() == stage)
            .and_then(StageRunner::output)
    }

    pub fn runner_mut(&mut self, stage: &str) -> Option<&mut StageRunner> {
        self.runners.iter_mut().find(|r| r.name() == stage)
    }

    /// One tick of every stage, in pipeline order.
    pub async fn tick_all(&mut self) -> Vec<TickOutcome> {
        let mut outcomes = Vec::with_capacity(self.runners.len());
        for runner in &mut self.runners {
            outcomes.push(runner.tick().await);
        }
        outcomes
    }

    /// Closes every stage without starting the daemon.
    pub async fn close(mut self) {
        for runner in &mut self.runners {
            runner.close().await;
        }
    }

    /// Spawns one task per stage.
    pub fn start(self) -> Daemon {
        Daemon::start(self)
    }
}

// ── Daemon ────────────────────────────────────────────────────────────────

/// Running pipeline. Must be started inside a tokio runtime.
pub struct Daemon {
    shutdown: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub fn start(pipeline: Pipeline) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let Pipeline { runners, config } = pipeline;

        let workers = runners
            .into_iter()
            .map(|runner| {
                let watcher = match (config.wake_policy, runner.input()) {
                    (WakePolicy::Notify, Some(queue)) => match QueueWatcher::watch(queue) {
                        Ok(watcher) => Some(watcher),
                        Err(e) => {
                            warn!(
                                stage = runner.name(),
                                error = %e,
                                "Queue watcher unavailable; polling instead"
                            );
                            None
                        }
                    },
                    _ => None,
                };
                tokio::spawn(run_stage(
                    runner,
                    shutdown.subscribe(),
                    config.poll_interval,
                    watcher,
                ))
            })
            .collect();

        info!("Daemon started");
        Self { shutdown, workers }
    }

    /// Signals every stage to stop and waits until all of them have closed.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Stage task ended abnormally");
            }
        }
        info!("Daemon stopped");
    }
}

async fn run_stage(
    mut runner: StageRunner,
    mut shutdown: broadcast::Receiver<()>,
    interval: Duration,
    watcher: Option<QueueWatcher>,
) {
    let span = runner.span.clone();
    async move {
        info!(
            wake = if watcher.is_some() { "notify" } else { "poll" },
            interval_ms = interval.as_millis() as u64,
            "Stage started"
        );
        let mut backing_off = false;
        'outer: loop {
            if backing_off {
                // Redelivery renames the entry, which the watcher reports as
                // a change; retries wait out the full interval instead.
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            } else {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(interval) => {}
                    _ = changed(watcher.as_ref()) => {}
                }
            }
            loop {
                let outcome = runner.process_one().await;
                backing_off = matches!(outcome, TickOutcome::Failed { .. });
                // Polling stages do one unit per interval; watching stages
                // drain their queue while it keeps yielding work.
                if watcher.is_none() || !outcome.consumed_input() {
                    break;
                }
                if !matches!(
                    shutdown.try_recv(),
                    Err(broadcast::error::TryRecvError::Empty)
                ) {
                    break 'outer;
                }
            }
        }
        runner.close_stage().await;
        info!("Stage stopped");
    }
    .instrument(span)
    .await
}

async fn changed(watcher: Option<&QueueWatcher>) {
    match watcher {
        Some(watcher) => watcher.changed().await,
        None => std::future::pending().await,
    }
}
