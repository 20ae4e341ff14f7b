//! Page image sources for the first pipeline stage.
//!
//! A [`Scanner`] returns one batch of pages per call, or an empty batch when
//! nothing is waiting. Sources that must not lose pages before they are safely
//! enqueued (the inbox folder) only delete them in [`Scanner::acknowledge`].

use crate::config::{ScannerConfig, ScannerKind};
use crate::error::StageError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Image extensions picked up from folders, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff"];

/// `scanimage` prints this when the feeder is empty or the device is off.
const NO_PAPER_MARKER: &str = "Error during device I/O";

/// One scanned page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedPage {
    pub name: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Scanner: Send {
    async fn scan(&mut self) -> Result<Vec<ScannedPage>, StageError>;

    /// Called once the last batch has been handed to the next stage.
    async fn acknowledge(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// Builds the scanner selected in the config.
pub fn build_scanner(config: &ScannerConfig) -> Box<dyn Scanner> {
    match config.kind {
        ScannerKind::Folder => Box::new(FolderScanner::new(
            &config.inbox,
            Duration::from_secs(config.min_age_secs),
        )),
        ScannerKind::Simulated => Box::new(SimulatedScanner::new(&config.pool)),
        ScannerKind::Sane => Box::new(SaneScanner::new(config)),
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Image files in `dir`, sorted by name. Files modified after `cutoff` are
/// skipped when a cutoff is given.
async fn list_images(dir: &Path, cutoff: Option<SystemTime>) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !has_image_extension(&path) {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        if let (Some(cutoff), Ok(modified)) = (cutoff, meta.modified()) {
            if modified > cutoff {
                debug!(file = %path.display(), "Skipping file that is still being written");
                continue;
            }
        }
        images.push(path);
    }
    images.sort();
    Ok(images)
}

// ── Inbox folder ──────────────────────────────────────────────────────────

/// Takes every settled image in an inbox folder, e.g. the upload target of a
/// network scanner.
pub struct FolderScanner {
    inbox: PathBuf,
    min_age: Duration,
    handed_over: Vec<PathBuf>,
}

impl FolderScanner {
    pub fn new(inbox: impl Into<PathBuf>, min_age: Duration) -> Self {
        Self {
            inbox: inbox.into(),
            min_age,
            handed_over: Vec::new(),
        }
    }
}

#[async_trait]
impl Scanner for FolderScanner {
    async fn scan(&mut self) -> Result<Vec<ScannedPage>, StageError> {
        self.handed_over.clear();
        let cutoff = SystemTime::now().checked_sub(self.min_age);
        let paths = list_images(&self.inbox, cutoff).await?;

        let mut pages = Vec::with_capacity(paths.len());
        for path in paths {
            let data = tokio::fs::read(&path).await?;
            pages.push(ScannedPage {
                name: file_name(&path),
                data,
            });
            self.handed_over.push(path);
        }
        if !pages.is_empty() {
            info!(inbox = %self.inbox.display(), pages = pages.len(), "Picked up scanned pages");
        }
        Ok(pages)
    }

    async fn acknowledge(&mut self) -> Result<(), StageError> {
        for path in self.handed_over.drain(..) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// ── Simulated ─────────────────────────────────────────────────────────────

/// Hands out the images of a pool folder one per scan, round-robin.
pub struct SimulatedScanner {
    pool: PathBuf,
    next: usize,
}

impl SimulatedScanner {
    pub fn new(pool: impl Into<PathBuf>) -> Self {
        Self {
            pool: pool.into(),
            next: 0,
        }
    }
}

#[async_trait]
impl Scanner for SimulatedScanner {
    async fn scan(&mut self) -> Result<Vec<ScannedPage>, StageError> {
        let images = list_images(&self.pool, None).await?;
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let path = &images[self.next % images.len()];
        self.next = self.next.wrapping_add(1);
        let data = tokio::fs::read(path).await?;
        Ok(vec![ScannedPage {
            name: file_name(path),
            data,
        }])
    }
}

// ── SANE ──────────────────────────────────────────────────────────────────

/// Drives a local SANE device with `scanimage` in batch mode.
pub struct SaneScanner {
    device: String,
    product_name: String,
    resolution_dpi: u32,
    duplex: bool,
    work_dir: PathBuf,
}

impl SaneScanner {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            device: config.device.clone(),
            product_name: config.product_name.clone(),
            resolution_dpi: config.resolution_dpi,
            duplex: config.duplex,
            work_dir: config.work_dir.clone(),
        }
    }

    fn batch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--format".to_string(),
            "png".to_string(),
            "--resolution".to_string(),
            self.resolution_dpi.to_string(),
        ];
        if self.duplex {
            args.push("--duplex=yes".into());
        }
        args.push(format!(
            "--batch={}",
            self.work_dir.join("scan-%03d.png").display()
        ));
        args.push("--batch-print".into());
        args.push("--device-name".into());
        args.push(self.device.clone());
        args
    }

    async fn detect_device(&mut self) -> Result<(), StageError> {
        if !self.device.is_empty() {
            return Ok(());
        }
        info!(product = %self.product_name, "Detecting scanner device");
        let output = Command::new("scanimage")
            .arg("-L")
            .output()
            .await
            .map_err(|e| command_error(e.to_string()))?;
        if !output.status.success() {
            return Err(command_error(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        let listing = String::from_utf8_lossy(&output.stdout);
        self.device = find_device(&listing, &self.product_name).ok_or_else(|| {
            StageError::Scanner(format!(
                "No device matching product '{}' found",
                self.product_name
            ))
        })?;
        info!(device = %self.device, "Scanner device detected");
        Ok(())
    }

    async fn clear_work_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        for path in list_images(&self.work_dir, None).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

fn command_error(detail: String) -> StageError {
    StageError::Command {
        program: "scanimage".into(),
        detail,
    }
}

/// Picks the first device of a `scanimage -L` listing whose name contains
/// `product`.
///
/// Listing lines look like
/// ``device `epsonscan2:DS-C490:0123:esci2:usb' is a EPSON DS-C490``.
pub fn find_device(listing: &str, product: &str) -> Option<String> {
    listing
        .lines()
        .filter(|line| line.starts_with("device"))
        .filter_map(|line| line.split(' ').nth(1))
        .map(|name| name.replace(['\'', '`'], ""))
        .find(|name| name.contains(product))
}

/// Image paths from `scanimage --batch-print` output, one per line.
pub fn parse_batch_output(stdout: &str) -> Vec<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}

#[async_trait]
impl Scanner for SaneScanner {
    async fn scan(&mut self) -> Result<Vec<ScannedPage>, StageError> {
        self.detect_device().await?;
        self.clear_work_dir().await?;

        let output = Command::new("scanimage")
            .args(self.batch_args())
            .output()
            .await
            .map_err(|e| command_error(e.to_string()))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if stderr.contains(NO_PAPER_MARKER) {
                debug!("No paper in the feeder");
                return Ok(Vec::new());
            }
            return Err(command_error(format!("{}: {}", output.status, stderr.trim())));
        }

        let mut pages = Vec::new();
        for path in parse_batch_output(&String::from_utf8_lossy(&output.stdout)) {
            let data = tokio::fs::read(&path).await?;
            pages.push(ScannedPage {
                name: file_name(&path),
                data,
            });
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(file = %path.display(), error = %e, "Failed to remove scanned image");
            }
        }
        info!(device = %self.device, pages = pages.len(), "Scanned");
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, data: &[u8]) {
        std::fs::write(dir.join(name), data).unwrap();
    }

    #[tokio::test]
    async fn test_folder_scanner_picks_images_sorted_and_deletes_on_ack() {
        let inbox = TempDir::new().unwrap();
        write(inbox.path(), "b.PNG", b"2");
        write(inbox.path(), "a.jpg", b"1");
        write(inbox.path(), "notes.txt", b"x");

        let mut scanner = FolderScanner::new(inbox.path(), Duration::ZERO);
        let pages = scanner.scan().await.unwrap();
        let names: Vec<_> = pages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a.jpg", "b.PNG"]);
        assert!(inbox.path().join("a.jpg").exists());

        scanner.acknowledge().await.unwrap();
        assert!(!inbox.path().join("a.jpg").exists());
        assert!(!inbox.path().join("b.PNG").exists());
        assert!(inbox.path().join("notes.txt").exists());
        assert!(scanner.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_folder_scanner_skips_fresh_files() {
        let inbox = TempDir::new().unwrap();
        write(inbox.path(), "page.png", b"1");
        let mut scanner = FolderScanner::new(inbox.path(), Duration::from_secs(3600));
        assert!(scanner.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unacknowledged_pages_are_rescanned() {
        let inbox = TempDir::new().unwrap();
        write(inbox.path(), "page.png", b"1");
        let mut scanner = FolderScanner::new(inbox.path(), Duration::ZERO);
        assert_eq!(scanner.scan().await.unwrap().len(), 1);
        assert_eq!(scanner.scan().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_simulated_scanner_round_robin() {
        let pool = TempDir::new().unwrap();
        write(pool.path(), "one.png", b"1");
        write(pool.path(), "two.png", b"2");
        let mut scanner = SimulatedScanner::new(pool.path());
        let mut seen = Vec::new();
        for _ in 0..3 {
            let pages = scanner.scan().await.unwrap();
            assert_eq!(pages.len(), 1);
            seen.push(pages[0].name.clone());
        }
        assert_eq!(seen, ["one.png", "two.png", "one.png"]);
    }

    #[test]
    fn test_find_device() {
        let listing = "device `v4l:/dev/video0' is a Noname webcam\n\
                       device `epsonscan2:DS-C490:0123:esci2:usb:ES0264:401' is a EPSON DS-C490\n";
        assert_eq!(
            find_device(listing, "DS-C490").as_deref(),
            Some("epsonscan2:DS-C490:0123:esci2:usb:ES0264:401")
        );
        assert_eq!(find_device(listing, "DS-999"), None);
    }

    #[test]
    fn test_batch_args_and_output() {
        let config = ScannerConfig {
            device: "dev0".into(),
            work_dir: PathBuf::from("/tmp/scan"),
            resolution_dpi: 300,
            duplex: false,
            ..ScannerConfig::default()
        };
        let args = SaneScanner::new(&config).batch_args();
        assert_eq!(
            args,
            [
                "--format",
                "png",
                "--resolution",
                "300",
                "--batch=/tmp/scan/scan-%03d.png",
                "--batch-print",
                "--device-name",
                "dev0"
            ]
        );
        assert_eq!(
            parse_batch_output("/tmp/scan/scan-001.png\n\n /tmp/scan/scan-002.png \n"),
            [
                PathBuf::from("/tmp/scan/scan-001.png"),
                PathBuf::from("/tmp/scan/scan-002.png")
            ]
        );
    }
}
