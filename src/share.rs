//! Network file share access.
//!
//! [`MountedShare`] works on an SMB/CIFS share mounted into the local file
//! system. A supervisor task health-checks the mount and flips an
//! availability flag; operations wait while the share is down instead of
//! failing, and fail with [`ShareError::Stopped`] once the share is stopped.
//! One async mutex serialises every operation.

use crate::config::ShareConfig;
use crate::error::ShareError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Suffix of files being uploaded; they are renamed into place when complete.
pub const PARTIAL_SUFFIX: &str = ".partial";

#[async_trait]
pub trait FileShare: Send + Sync {
    /// Names of the files directly under the share root, sorted.
    async fn list(&self) -> Result<Vec<String>, ShareError>;
    async fn download(&self, name: &str) -> Result<Vec<u8>, ShareError>;
    async fn upload(&self, name: &str, data: &[u8]) -> Result<(), ShareError>;
    async fn delete(&self, name: &str) -> Result<(), ShareError>;
    /// Fails with [`ShareError::AlreadyExists`] instead of overwriting `to`.
    async fn rename(&self, from: &str, to: &str) -> Result<(), ShareError>;
}

/// Joins `name` onto `base`, rejecting anything but plain relative components.
pub fn resolve(base: &Path, name: &str) -> Result<PathBuf, ShareError> {
    let relative = Path::new(name);
    let plain = !name.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(ShareError::PathEscapesBase(name.to_string()));
    }
    Ok(base.join(relative))
}

fn io_error(path: &Path, source: std::io::Error) -> ShareError {
    ShareError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn is_healthy(base: &Path) -> bool {
    tokio::fs::metadata(base)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

pub struct MountedShare {
    base: PathBuf,
    retry_delay: Duration,
    lock: Mutex<()>,
    available: Arc<AtomicBool>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl MountedShare {
    /// Checks the share once and starts the supervisor. Must be called
    /// inside a tokio runtime.
    pub async fn start(config: &ShareConfig) -> Arc<Self> {
        let base = config.base_path.clone();
        let check_interval = Duration::from_secs(config.check_interval_secs.max(1));
        let retry_delay = Duration::from_millis(config.retry_delay_ms.max(1));

        let available = Arc::new(AtomicBool::new(is_healthy(&base).await));
        if !available.load(Ordering::SeqCst) {
            warn!(base = %base.display(), "Network share is not available yet");
        }
        let (shutdown, rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(
            base.clone(),
            Arc::clone(&available),
            check_interval,
            retry_delay,
            rx,
        ));

        Arc::new(Self {
            base,
            retry_delay,
            lock: Mutex::new(()),
            available,
            stopped: AtomicBool::new(false),
            shutdown,
            supervisor: StdMutex::new(Some(supervisor)),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Stops the supervisor. Pending and later operations fail with
    /// [`ShareError::Stopped`].
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        let handle = self.supervisor.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Busy-waits until the share is available.
    async fn wait_available(&self) -> Result<(), ShareError> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(ShareError::Stopped);
            }
            if self.is_available() {
                return Ok(());
            }
            debug!(base = %self.base.display(), "Waiting for network share");
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// After a failed operation, marks the share down if the mount is gone so
    /// the supervisor takes over.
    async fn recheck(&self) {
        if !is_healthy(&self.base).await && self.available.swap(false, Ordering::SeqCst) {
            warn!(base = %self.base.display(), "Network share went away");
        }
    }

    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T, ShareError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, ShareError>> + Send,
        T: Send,
    {
        self.wait_available().await?;
        let _guard = self.lock.lock().await;
        let result = op().await;
        if matches!(result, Err(ShareError::Io { .. })) {
            self.recheck().await;
        }
        result
    }
}

async fn supervise(
    base: PathBuf,
    available: Arc<AtomicBool>,
    check_interval: Duration,
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let wait = if available.load(Ordering::SeqCst) {
            check_interval
        } else {
            retry_delay
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        let healthy = is_healthy(&base).await;
        let was = available.swap(healthy, Ordering::SeqCst);
        match (was, healthy) {
            (false, true) => info!(base = %base.display(), "Network share is available"),
            (true, false) => warn!(base = %base.display(), "Network share is unavailable"),
            _ => {}
        }
    }
    debug!(base = %base.display(), "Share supervisor stopped");
}

#[async_trait]
impl FileShare for MountedShare {
    async fn list(&self) -> Result<Vec<String>, ShareError> {
        let base = self.base.clone();
        self.guarded(|| async move {
            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(&base)
                .await
                .map_err(|e| io_error(&base, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&base, e))? {
                let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
                let name = entry.file_name().to_string_lossy().into_owned();
                if is_file && !name.ends_with(PARTIAL_SUFFIX) {
                    names.push(name);
                }
            }
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>, ShareError> {
        let path = resolve(&self.base, name)?;
        self.guarded(|| async move { tokio::fs::read(&path).await.map_err(|e| io_error(&path, e)) })
            .await
    }

    async fn upload(&self, name: &str, data: &[u8]) -> Result<(), ShareError> {
        let path = resolve(&self.base, name)?;
        self.guarded(|| async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, e))?;
            }
            let mut partial = path.clone().into_os_string();
            partial.push(PARTIAL_SUFFIX);
            let partial = PathBuf::from(partial);
            tokio::fs::write(&partial, data)
                .await
                .map_err(|e| io_error(&partial, e))?;
            tokio::fs::rename(&partial, &path)
                .await
                .map_err(|e| io_error(&path, e))?;
            info!(file = %path.display(), bytes = data.len(), "Uploaded to share");
            Ok(())
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<(), ShareError> {
        let path = resolve(&self.base, name)?;
        self.guarded(|| async move {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| io_error(&path, e))
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ShareError> {
        let source = resolve(&self.base, from)?;
        let target = resolve(&self.base, to)?;
        self.guarded(|| async move {
            let exists = tokio::fs::try_exists(&target)
                .await
                .map_err(|e| io_error(&target, e))?;
            if exists {
                return Err(ShareError::AlreadyExists(to.to_string()));
            }
            tokio::fs::rename(&source, &target)
                .await
                .map_err(|e| io_error(&source, e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(base: &Path) -> ShareConfig {
        ShareConfig {
            base_path: base.to_path_buf(),
            check_interval_secs: 1,
            retry_delay_ms: 10,
        }
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let base = Path::new("/mnt/share");
        assert_eq!(resolve(base, "a.pdf").unwrap(), base.join("a.pdf"));
        assert_eq!(resolve(base, "2024/a.pdf").unwrap(), base.join("2024/a.pdf"));
        for bad in ["", "../a.pdf", "/etc/passwd", "a/../../b", "./a"] {
            assert!(
                matches!(resolve(base, bad), Err(ShareError::PathEscapesBase(_))),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn test_upload_list_download_delete() {
        let dir = TempDir::new().unwrap();
        let share = MountedShare::start(&config(dir.path())).await;
        assert!(share.is_available());

        share.upload("b.pdf", b"B").await.unwrap();
        share.upload("a.pdf", b"A").await.unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        assert_eq!(share.list().await.unwrap(), ["a.pdf", "b.pdf"]);
        assert_eq!(share.download("a.pdf").await.unwrap(), b"A");
        assert!(!dir.path().join("a.pdf.partial").exists());

        share.delete("a.pdf").await.unwrap();
        assert_eq!(share.list().await.unwrap(), ["b.pdf"]);
        share.stop().await;
    }

    #[tokio::test]
    async fn test_rename_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let share = MountedShare::start(&config(dir.path())).await;
        share.upload("scan.pdf", b"1").await.unwrap();
        share.upload("taken.pdf", b"2").await.unwrap();

        let err = share.rename("scan.pdf", "taken.pdf").await.unwrap_err();
        assert!(matches!(err, ShareError::AlreadyExists(name) if name == "taken.pdf"));

        share.rename("scan.pdf", "2024-01-01-Letter.pdf").await.unwrap();
        assert_eq!(
            share.list().await.unwrap(),
            ["2024-01-01-Letter.pdf", "taken.pdf"]
        );
        share.stop().await;
    }

    #[tokio::test]
    async fn test_operations_wait_until_share_appears() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("mount");
        let share = MountedShare::start(&config(&base)).await;
        assert!(!share.is_available());

        let creator = {
            let base = base.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::create_dir(&base).unwrap();
            })
        };
        share.upload("late.pdf", b"x").await.unwrap();
        creator.await.unwrap();
        assert!(base.join("late.pdf").exists());
        share.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_share_fails_fast() {
        let dir = TempDir::new().unwrap();
        let share = MountedShare::start(&config(&dir.path().join("missing"))).await;
        share.stop().await;
        assert!(matches!(share.list().await, Err(ShareError::Stopped)));
    }
}
