//! Optical character recognition through the `tesseract` executable.
//!
//! Images go in on stdin and results come back on stdout, so no temporary
//! files are involved.

use crate::error::StageError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait Ocr: Send + Sync {
    /// Recognised text of an image.
    async fn image_to_text(&self, image: &[u8]) -> Result<String, StageError>;

    /// A searchable single-page PDF of an image.
    async fn image_to_pdf(&self, image: &[u8]) -> Result<Vec<u8>, StageError>;
}

#[derive(Debug, Clone)]
pub struct TesseractOcr {
    program: PathBuf,
    language: String,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self::new("tesseract", "")
    }
}

impl TesseractOcr {
    /// An empty `language` leaves the choice to tesseract.
    pub fn new(program: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            language: language.into(),
        }
    }

    fn args(&self, pdf: bool) -> Vec<&str> {
        let mut args = vec!["-", "-"];
        if !self.language.is_empty() {
            args.extend(["-l", self.language.as_str()]);
        }
        if pdf {
            args.push("pdf");
        }
        args
    }

    async fn run(&self, image: &[u8], pdf: bool) -> Result<Vec<u8>, StageError> {
        let program = self.program.display().to_string();
        let command_error = |detail: String| StageError::Command {
            program: program.clone(),
            detail,
        };

        let mut child = Command::new(&self.program)
            .args(self.args(pdf))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| command_error(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| command_error("stdin was not captured".into()))?;
        let input = image.to_vec();
        // Feed stdin concurrently; tesseract may start writing before it has
        // read everything.
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| command_error(e.to_string()))?;
        writer
            .await
            .map_err(|e| command_error(e.to_string()))?
            .map_err(|e| command_error(format!("writing image: {e}")))?;

        if !output.status.success() {
            return Err(command_error(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(pdf, bytes = output.stdout.len(), "tesseract finished");
        Ok(output.stdout)
    }
}

#[async_trait]
impl Ocr for TesseractOcr {
    async fn image_to_text(&self, image: &[u8]) -> Result<String, StageError> {
        let stdout = self.run(image, false).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    async fn image_to_pdf(&self, image: &[u8]) -> Result<Vec<u8>, StageError> {
        self.run(image, true).await
    }
}
