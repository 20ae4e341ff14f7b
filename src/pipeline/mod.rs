//! Concrete pipeline stages for the scanning workflow.
//!
//! ## Data Flow
//!
//! ```text
//! scan ──▶ rotate ──▶ ocr ──▶ merge ──▶ tag ──▶ paperless-upload
//! (pages)  (PNG)      (PDFs)  (1 PDF)   (name,    or share-upload
//!                                        tags)
//! ```
//!
//! 1. [`scan`]    pull one batch of page images from the configured scanner
//! 2. [`rotate`]  rotate/enhance each page and re-encode it as PNG
//! 3. [`ocr`]     turn each page into a searchable PDF, dropping blank pages
//! 4. [`merge`]   merge the pages of a batch into one document
//! 5. [`tag`]     guess a file name and tags; left out when no language
//!    model is configured
//! 6. [`deliver`] upload to Paperless-ngx or a network share
//!
//! Every stage implements [`crate::Stage`]; [`standard_stages`] wires them
//! from a [`Config`].

pub mod deliver;
pub mod merge;
pub mod ocr;
pub mod rotate;
pub mod scan;
pub mod tag;

pub use deliver::{PaperlessUploadStage, ShareUploadStage};
pub use merge::MergeStage;
pub use ocr::OcrStage;
pub use rotate::RotateStage;
pub use scan::ScanStage;
pub use tag::TagStage;

use crate::config::{Config, DeliveryTarget};
use crate::error::ScanflowError;
use crate::guess::{LlmNameGuesser, LlmTagGuesser};
use crate::llm::build_completion;
use crate::ocr::TesseractOcr;
use crate::paperless::PaperlessClient;
use crate::pdf::PdfEngine;
use crate::scanner::build_scanner;
use crate::share::FileShare;
use crate::stage::Stage;
use std::sync::Arc;
use tracing::{info, warn};

/// The stage list for `config`.
///
/// `share` is required when delivering to a share.
pub fn standard_stages(
    config: &Config,
    share: Option<Arc<dyn FileShare>>,
) -> Result<Vec<Box<dyn Stage>>, ScanflowError> {
    let pdf = PdfEngine::new(&config.pdf.library_path);
    let mut stages: Vec<Box<dyn Stage>> = vec![
        Box::new(ScanStage::new(build_scanner(&config.scanner))),
        Box::new(RotateStage::new(config.image.clone())),
        Box::new(OcrStage::new(Box::new(TesseractOcr::new(
            &config.ocr.program,
            config.ocr.language.clone(),
        )))),
        Box::new(MergeStage::new(pdf.clone())),
    ];

    if config.llm.is_usable() {
        let completion = build_completion(&config.llm)?;
        stages.push(Box::new(TagStage::new(
            Arc::new(pdf),
            Arc::new(LlmNameGuesser::new(Arc::clone(&completion), &config.llm)),
            Arc::new(LlmTagGuesser::new(completion, &config.llm)),
        )));
    } else {
        warn!("No language model configured; documents keep their merged names and get no tags");
    }

    match config.delivery {
        DeliveryTarget::Paperless => {
            let client = PaperlessClient::new(&config.paperless)
                .map_err(|e| ScanflowError::InvalidConfig(format!("paperless: {e}")))?;
            stages.push(Box::new(PaperlessUploadStage::new(Arc::new(client))));
        }
        DeliveryTarget::Share => {
            let share = share.ok_or_else(|| {
                ScanflowError::InvalidConfig("delivery = \"share\" needs a network share".into())
            })?;
            stages.push(Box::new(ShareUploadStage::new(share)));
        }
    }

    info!(
        stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
        "Pipeline stages assembled"
    );
    Ok(stages)
}
