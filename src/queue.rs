//! Durable filesystem queues between stages.
//!
//! One directory per queue name under a shared root:
//!
//! ```text
//! <root>/
//! ├── .staging/                        half-written archives (same volume)
//! ├── ocr/
//! │   ├── queue-01760000000000000000-0000000003
//! │   └── queue-01760000000000000001-0000000004~2   redelivered twice
//! └── ocr.dead-letter/
//!     └── queue-01759999999999999999-0000000001~5
//! ```
//!
//! Entry names carry the enqueue time in nanoseconds plus a process-wide
//! counter, both zero-padded, so lexicographic order is enqueue order.
//! Redelivery appends `~<attempts>` without changing the sortable prefix.
//! Because identity is the directory, two [`FileQueue`] values with the same
//! root and name see the same entries.

use crate::archive::SealedArchive;
use crate::error::QueueError;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, warn};

const ENTRY_PREFIX: &str = "queue-";
const ATTEMPT_SEPARATOR: char = '~';
const STAGING_DIR: &str = ".staging";
const DEAD_LETTER_SUFFIX: &str = ".dead-letter";

/// Tie-breaker for entries enqueued within the same nanosecond.
static ENQUEUE_SEQ: AtomicU64 = AtomicU64::new(0);

/// How a stage learns that its input queue has something new.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakePolicy {
    /// Check the queue once per poll interval.
    #[default]
    Poll,
    /// Watch the queue directory and wake on changes; the poll interval
    /// remains as a fallback.
    Notify,
}

/// True for names usable as a queue (and stage) directory name.
pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Creates (if needed) and returns the staging directory of a queue root.
///
/// Archives are written here before being renamed into a queue, so they
/// must share a volume with the queues.
pub fn prepare_staging(root: &Path) -> Result<PathBuf, QueueError> {
    let staging = root.join(STAGING_DIR);
    fs::create_dir_all(&staging).map_err(|source| QueueError::Io {
        queue: STAGING_DIR.to_string(),
        path: staging.clone(),
        source,
    })?;
    Ok(staging)
}

/// A named FIFO of files under a queue root.
#[derive(Debug, Clone)]
pub struct FileQueue {
    name: String,
    dir: PathBuf,
    staging: PathBuf,
    dead_letter: PathBuf,
}

impl FileQueue {
    /// Opens (creating if needed) the queue `name` under `root`.
    pub fn open(root: impl AsRef<Path>, name: &str) -> Result<Self, QueueError> {
        if !is_valid_queue_name(name) {
            return Err(QueueError::InvalidName(name.to_string()));
        }
        let root = root.as_ref();
        let queue = Self {
            name: name.to_string(),
            dir: root.join(name),
            staging: root.join(STAGING_DIR),
            dead_letter: root.join(format!("{name}{DEAD_LETTER_SUFFIX}")),
        };
        queue.create_dir(&queue.dir)?;
        queue.create_dir(&queue.staging)?;
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory for half-written files that will be renamed into a queue.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Appends `data` as a new entry. Readers never see a partial file.
    pub fn enqueue(&self, data: &[u8]) -> Result<PathBuf, QueueError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.staging)
            .map_err(|e| self.io_err(&self.staging, e))?;
        tmp.write_all(data)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| self.io_err(tmp.path(), e))?;
        let dest = self.next_entry_path();
        tmp.persist(&dest).map_err(|e| self.io_err(&dest, e.error))?;
        debug!(queue = %self.name, entry = %dest.display(), bytes = data.len(), "Enqueued");
        Ok(dest)
    }

    /// Moves an existing file into the queue.
    ///
    /// A same-volume rename is atomic. Across volumes the file is copied
    /// into staging first and renamed from there, then the source is removed.
    pub fn enqueue_from_path(&self, source: &Path) -> Result<PathBuf, QueueError> {
        let dest = self.next_entry_path();
        match fs::rename(source, &dest) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                let staged = self.staging.join(dest.file_name().unwrap_or_default());
                fs::copy(source, &staged).map_err(|e| self.io_err(source, e))?;
                fs::rename(&staged, &dest).map_err(|e| self.io_err(&dest, e))?;
                fs::remove_file(source).map_err(|e| self.io_err(source, e))?;
            }
            Err(e) => return Err(self.io_err(source, e)),
        }
        debug!(queue = %self.name, entry = %dest.display(), "Enqueued by rename");
        Ok(dest)
    }

    /// Enqueues a sealed archive, persisting its temp file in place.
    pub fn enqueue_sealed(&self, sealed: SealedArchive) -> Result<PathBuf, QueueError> {
        match sealed {
            SealedArchive::File(temp) => {
                let dest = self.next_entry_path();
                match temp.persist(&dest) {
                    Ok(()) => {
                        debug!(queue = %self.name, entry = %dest.display(), "Enqueued archive");
                        Ok(dest)
                    }
                    Err(e) if e.error.kind() == io::ErrorKind::CrossesDevices => {
                        let path = e.path.to_path_buf();
                        let result = self.enqueue_from_path(&path);
                        drop(e.path);
                        result
                    }
                    Err(e) => Err(self.io_err(&dest, e.error)),
                }
            }
            SealedArchive::Memory(bytes) => self.enqueue(&bytes),
        }
    }

    /// Returns the earliest entry, or `None` when the queue is empty.
    ///
    /// The entry stays on disk until [`QueueEntry::done`] is called.
    pub fn dequeue(&self) -> Result<Option<QueueEntry>, QueueError> {
        for name in self.entry_names()? {
            let path = self.dir.join(&name);
            match File::open(&path) {
                Ok(file) => {
                    let attempts = parse_attempts(&name);
                    return Ok(Some(QueueEntry {
                        queue: self.name.clone(),
                        path,
                        file,
                        attempts,
                        dead_letter_dir: self.dead_letter.clone(),
                    }));
                }
                // Consumed by another instance between listing and opening.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(self.io_err(&path, e)),
            }
        }
        Ok(None)
    }

    /// Number of entries waiting.
    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.entry_names()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Entries moved aside after exhausting their attempts, oldest first.
    pub fn dead_letters(&self) -> Result<Vec<PathBuf>, QueueError> {
        let mut names = match list_entry_names(&self.dead_letter) {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(&self.dead_letter, e)),
        };
        names.sort();
        Ok(names.into_iter().map(|n| self.dead_letter.join(n)).collect())
    }

    fn entry_names(&self) -> Result<Vec<String>, QueueError> {
        let mut names = match list_entry_names(&self.dir) {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(&self.dir, e)),
        };
        names.sort();
        Ok(names)
    }

    fn next_entry_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = ENQUEUE_SEQ.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{ENTRY_PREFIX}{nanos:020}-{seq:010}"))
    }

    fn create_dir(&self, dir: &Path) -> Result<(), QueueError> {
        fs::create_dir_all(dir).map_err(|e| self.io_err(dir, e))
    }

    fn io_err(&self, path: &Path, source: io::Error) -> QueueError {
        QueueError::Io {
            queue: self.name.clone(),
            path: path.to_path_buf(),
            source,
        }
    }
}

fn list_entry_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(ENTRY_PREFIX) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

fn parse_attempts(name: &str) -> u32 {
    name.rsplit_once(ATTEMPT_SEPARATOR)
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(0)
}

fn base_name(name: &str) -> &str {
    name.split_once(ATTEMPT_SEPARATOR)
        .map_or(name, |(base, _)| base)
}

/// A dequeued entry. Dropping it without calling [`done`](Self::done) leaves
/// it in the queue.
#[derive(Debug)]
pub struct QueueEntry {
    queue: String,
    path: PathBuf,
    file: File,
    attempts: u32,
    dead_letter_dir: PathBuf,
}

impl QueueEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How many earlier deliveries of this entry failed.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A second handle on the entry's file, positioned at the start.
    pub fn reader(&self) -> Result<File, QueueError> {
        File::open(&self.path).map_err(|e| self.io_err(&self.path, e))
    }

    pub fn read_all(&mut self) -> Result<Vec<u8>, QueueError> {
        let mut data = Vec::new();
        self.file
            .read_to_end(&mut data)
            .map_err(|e| self.io_err(&self.path, e))?;
        Ok(data)
    }

    /// Marks the entry consumed and deletes it. An already deleted entry is fine.
    pub fn done(self) -> Result<(), QueueError> {
        let QueueEntry { queue, path, file, .. } = self;
        drop(file);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(QueueError::Io { queue, path, source }),
        }
    }

    /// Leaves the entry for redelivery with one more failed attempt recorded.
    /// Returns the new attempt count.
    pub fn release_failed(self) -> Result<u32, QueueError> {
        let attempts = self.attempts + 1;
        let QueueEntry { queue, path, file, .. } = self;
        drop(file);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(base_name)
            .unwrap_or_default();
        let retry_path = path.with_file_name(format!("{name}{ATTEMPT_SEPARATOR}{attempts}"));
        match fs::rename(&path, &retry_path) {
            Ok(()) => Ok(attempts),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(queue = %queue, entry = %path.display(), "Entry vanished before release");
                Ok(attempts)
            }
            Err(source) => Err(QueueError::Io { queue, path, source }),
        }
    }

    /// Moves the entry out of the queue into its dead-letter directory.
    pub fn dead_letter(self) -> Result<PathBuf, QueueError> {
        let attempts = self.attempts + 1;
        let QueueEntry {
            queue,
            path,
            file,
            dead_letter_dir,
            ..
        } = self;
        drop(file);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(base_name)
            .unwrap_or_default()
            .to_string();
        let dest = dead_letter_dir.join(format!("{name}{ATTEMPT_SEPARATOR}{attempts}"));
        let io_err = |path: &Path, source| QueueError::Io {
            queue: queue.clone(),
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(&dead_letter_dir).map_err(|e| io_err(&dead_letter_dir, e))?;
        fs::rename(&path, &dest).map_err(|e| io_err(&path, e))?;
        Ok(dest)
    }

    fn io_err(&self, path: &Path, source: io::Error) -> QueueError {
        QueueError::Io {
            queue: self.queue.clone(),
            path: path.to_path_buf(),
            source,
        }
    }
}

// ── Change notification ───────────────────────────────────────────────────

/// Wakes waiters when files appear in a queue directory.
///
/// Backed by the platform watcher from the `notify` crate. Wake-ups are
/// coalesced into a single stored permit, so a change that lands between a
/// check and the next wait is never lost.
pub struct QueueWatcher {
    queue: FileQueue,
    signal: Arc<Notify>,
    _watcher: Mutex<notify::RecommendedWatcher>,
}

impl QueueWatcher {
    pub fn watch(queue: &FileQueue) -> Result<Self, QueueError> {
        let signal = Arc::new(Notify::new());
        let tx = Arc::clone(&signal);
        let queue_name = queue.name.clone();
        let watch_err = |e: notify::Error| QueueError::Watch {
            queue: queue.name.clone(),
            detail: e.to_string(),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if !matches!(event.kind, EventKind::Access(_) | EventKind::Remove(_)) => {
                tx.notify_one();
            }
            Ok(_) => {}
            Err(e) => debug!(queue = %queue_name, error = %e, "Queue watcher error"),
        })
        .map_err(watch_err)?;
        watcher
            .watch(&queue.dir, RecursiveMode::NonRecursive)
            .map_err(watch_err)?;

        Ok(Self {
            queue: queue.clone(),
            signal,
            _watcher: Mutex::new(watcher),
        })
    }

    /// Resolves on the next change in the directory (or immediately if one
    /// happened since the last call).
    pub async fn changed(&self) {
        self.signal.notified().await;
    }

    /// Blocks until an entry is available and returns it.
    ///
    /// The watcher is registered before the first check, and every wake-up
    /// re-checks the directory, so an entry enqueued at any point is found.
    pub async fn next_entry(&self) -> Result<QueueEntry, QueueError> {
        loop {
            if let Some(entry) = self.queue.dequeue()? {
                return Ok(entry);
            }
            self.changed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn read(mut entry: QueueEntry) -> Vec<u8> {
        let data = entry.read_all().unwrap();
        entry.done().unwrap();
        data
    }

    #[test]
    fn test_fifo_order() {
        let root = tempfile::tempdir().unwrap();
        let q = FileQueue::open(root.path(), "fifo").unwrap();
        for i in 0..25u8 {
            q.enqueue(&[i]).unwrap();
        }
        assert_eq!(q.len().unwrap(), 25);
        for i in 0..25u8 {
            assert_eq!(read(q.dequeue().unwrap().unwrap()), vec![i]);
        }
        assert!(q.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_same_name_shares_entries() {
        let root = tempfile::tempdir().unwrap();
        let a = FileQueue::open(root.path(), "shared").unwrap();
        let b = FileQueue::open(root.path(), "shared").unwrap();
        a.enqueue(b"payload").unwrap();
        assert_eq!(read(b.dequeue().unwrap().unwrap()), b"payload");
        assert!(a.is_empty().unwrap());
    }

    #[test]
    fn test_entry_stays_until_done() {
        let root = tempfile::tempdir().unwrap();
        let q = FileQueue::open(root.path(), "pending").unwrap();
        q.enqueue(b"x").unwrap();
        let first = q.dequeue().unwrap().unwrap();
        let again = q.dequeue().unwrap().unwrap();
        assert_eq!(first.path(), again.path());
        first.done().unwrap();
        // Already deleted: tolerated.
        again.done().unwrap();
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn test_release_failed_keeps_position_and_counts() {
        let root = tempfile::tempdir().unwrap();
        let q = FileQueue::open(root.path(), "retry").unwrap();
        q.enqueue(b"first").unwrap();
        q.enqueue(b"second").unwrap();

        let entry = q.dequeue().unwrap().unwrap();
        assert_eq!(entry.attempts(), 0);
        assert_eq!(entry.release_failed().unwrap(), 1);

        let entry = q.dequeue().unwrap().unwrap();
        assert_eq!(entry.attempts(), 1);
        assert_eq!(entry.release_failed().unwrap(), 2);

        let entry = q.dequeue().unwrap().unwrap();
        assert_eq!(entry.attempts(), 2);
        assert_eq!(read(entry), b"first");
    }

    #[test]
    fn test_dead_letter_moves_entry_aside() {
        let root = tempfile::tempdir().unwrap();
        let q = FileQueue::open(root.path(), "poison").unwrap();
        q.enqueue(b"bad").unwrap();
        let dest = q.dequeue().unwrap().unwrap().dead_letter().unwrap();
        assert!(dest.exists());
        assert!(q.is_empty().unwrap());
        assert_eq!(q.dead_letters().unwrap(), vec![dest]);
    }

    #[test]
    fn test_enqueue_from_path_moves_file() {
        let root = tempfile::tempdir().unwrap();
        let q = FileQueue::open(root.path(), "moved").unwrap();
        let src = root.path().join("incoming.bin");
        fs::write(&src, b"abc").unwrap();
        q.enqueue_from_path(&src).unwrap();
        assert!(!src.exists());
        assert_eq!(read(q.dequeue().unwrap().unwrap()), b"abc");
    }

    #[test]
    fn test_foreign_files_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        let q = FileQueue::open(root.path(), "tidy").unwrap();
        fs::write(q.dir().join("README"), b"not an entry").unwrap();
        assert!(q.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let root = tempfile::tempdir().unwrap();
        for bad in ["", "../up", "a/b", "has space", ".staging"] {
            assert!(
                matches!(FileQueue::open(root.path(), bad), Err(QueueError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_attempts() {
        assert_eq!(parse_attempts("queue-1-2"), 0);
        assert_eq!(parse_attempts("queue-1-2~7"), 7);
        assert_eq!(base_name("queue-1-2~7"), "queue-1-2");
    }

    #[tokio::test]
    async fn test_watcher_wakes_blocked_consumer() {
        let root = tempfile::tempdir().unwrap();
        let q = FileQueue::open(root.path(), "watched").unwrap();
        let watcher = QueueWatcher::watch(&q).unwrap();

        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.enqueue(b"late").unwrap();
        });

        let entry = tokio::time::timeout(Duration::from_secs(10), watcher.next_entry())
            .await
            .expect("watcher should wake")
            .unwrap();
        assert_eq!(read(entry), b"late");
    }
}
