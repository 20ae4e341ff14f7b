//! Page image clean-up: rotation, optional grayscale and contrast.
//!
//! Every page is re-encoded as PNG because OCR works best on lossless input.
//! Decoding and encoding run in `spawn_blocking`; a 600 dpi A4 page is
//! roughly 35 megapixels.

use crate::archive::ArchiveWriter;
use crate::config::{ImageConfig, Rotation};
use crate::error::StageError;
use crate::stage::{InputFiles, Stage};
use async_trait::async_trait;
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, warn};

pub struct RotateStage {
    config: ImageConfig,
}

impl RotateStage {
    pub const NAME: &'static str = "rotate";

    pub fn new(config: ImageConfig) -> Self {
        Self { config }
    }
}

/// Applies the configured adjustments to one decoded page.
pub fn adjust(img: DynamicImage, config: &ImageConfig) -> DynamicImage {
    let mut img = match config.rotation {
        Rotation::None => img,
        Rotation::Rotate90 => img.rotate90(),
        Rotation::Rotate180 => img.rotate180(),
        Rotation::Rotate270 => img.rotate270(),
    };
    if config.grayscale {
        img = img.grayscale();
    }
    if config.contrast != 0.0 {
        img = img.adjust_contrast(config.contrast);
    }
    img
}

/// Decodes, adjusts and PNG-encodes one page.
pub fn transform_page(data: &[u8], config: &ImageConfig) -> Result<Vec<u8>, image::ImageError> {
    let img = adjust(image::load_from_memory(data)?, config);
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// `page.jpg` becomes `page.png`.
fn png_name(name: &str) -> String {
    let path = Path::new(name);
    match path.file_stem() {
        Some(stem) if path.extension().is_some() => format!("{}.png", stem.to_string_lossy()),
        _ => format!("{name}.png"),
    }
}

#[async_trait]
impl Stage for RotateStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(
        &mut self,
        inputs: &mut InputFiles,
        output: &mut dyn ArchiveWriter,
    ) -> Result<(), StageError> {
        while let Some(file) = inputs.next().await {
            let name = file.name().to_string();
            let metadata = file.metadata().clone();
            let config = self.config.clone();
            let data = file.into_bytes();

            let result = tokio::task::spawn_blocking(move || transform_page(&data, &config))
                .await
                .map_err(|e| StageError::Image {
                    name: name.clone(),
                    detail: format!("image task panicked: {e}"),
                })?;
            let png = match result {
                Ok(png) => png,
                Err(image::ImageError::Unsupported(e)) => {
                    warn!(file = %name, error = %e, "Not a supported image; dropping it");
                    continue;
                }
                Err(e) => {
                    return Err(StageError::Image {
                        name,
                        detail: e.to_string(),
                    })
                }
            };

            let mut out_name = png_name(&name);
            if output.contains(&out_name) {
                out_name = format!("{name}.png");
            }
            debug!(from = %name, to = %out_name, bytes = png.len(), "Adjusted page");
            output
                .add_file(&out_name, &png)
                .attach_metadata(&out_name, &metadata);
        }
        Ok(())
    }
}
