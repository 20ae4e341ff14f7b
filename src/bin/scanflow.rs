//! CLI binary for scanflow.
//!
//! A thin shim over the library crate: loads the config, installs logging and
//! either runs the daemon until Ctrl-C or runs one of the tools.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use scanflow::guess::LlmNameGuesser;
use scanflow::llm::build_completion;
use scanflow::pdf::PdfEngine;
use scanflow::pipeline::standard_stages;
use scanflow::{
    Config, Daemon, FileShare, MountedShare, Pipeline, ProgressCallback, RenameProgressCallback,
    ShareRenamer,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Renders one progress bar for a share rename run, with a log line per file.
struct CliRenameProgress {
    bar: ProgressBar,
    dry_run: bool,
}

impl CliRenameProgress {
    fn new(dry_run: bool) -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} files  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix(if dry_run { "Guessing" } else { "Renaming" });
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar, dry_run })
    }
}

impl RenameProgressCallback for CliRenameProgress {
    fn on_run_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
    }

    fn on_file_start(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn on_file_renamed(&self, from: &str, to: &str) {
        let arrow = if self.dry_run { "would become" } else { "→" };
        self.bar
            .println(format!("  {} {}  {}  {}", green("✓"), from, dim(arrow), bold(to)));
        self.bar.inc(1);
    }

    fn on_file_unchanged(&self, name: &str) {
        self.bar.println(format!("  {} {}", dim("="), dim(name)));
        self.bar.inc(1);
    }

    fn on_file_error(&self, name: &str, error: &str) {
        self.bar
            .println(format!("  {} {}  {}", red("✗"), name, red(error)));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, renamed: usize, failed: usize) {
        self.bar.finish_and_clear();
        let verb = if self.dry_run { "would be renamed" } else { "renamed" };
        if failed == 0 {
            eprintln!("{} {} files {verb}", green("✔"), bold(&renamed.to_string()));
        } else {
            eprintln!(
                "{} {} files {verb}  ({} failed)",
                red("⚠"),
                bold(&renamed.to_string()),
                red(&failed.to_string())
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the scanning daemon until Ctrl-C
  scanflow --config scanflow.toml

  # Print a default config to start from
  scanflow empty-config > scanflow.toml

  # Preview sorted names for the PDFs on the share, then apply them
  scanflow rename-share --config scanflow.toml --dry-run
  scanflow rename-share --config scanflow.toml

CONFIG SECTIONS:
  queue      root, poll_interval_ms, max_attempts, wake (poll | notify)
  scanner    kind (folder | simulated | sane), inbox, pool, device, ...
  image      rotation (none | 90 | 180 | 270), grayscale, contrast
  ocr        program, language
  pdf        library_path (empty: system pdfium)
  llm        backend (responses | provider), endpoint, api_key, model, ...
  paperless  url, token, correspondent, document_type, storage_path
  share      base_path, check_interval_secs, retry_delay_ms
  delivery   paperless | share
  logging    level, format (text | json)

ENVIRONMENT VARIABLES:
  RUST_LOG                Log filter; overrides logging.level
  OPENAI_API_KEY          Key for the responses backend when llm.api_key is empty
  EDGEQUAKE_LLM_PROVIDER  Provider for the provider backend when llm.provider is empty
  EDGEQUAKE_MODEL         Model for the provider backend
"#;

/// Staged document-scanning daemon.
#[derive(Parser, Debug)]
#[command(
    name = "scanflow",
    version,
    about = "Scan, OCR, merge, name and deliver documents",
    long_about = "Runs a staged pipeline that pulls page images from a scanner, cleans them up, \
OCRs them into searchable PDFs, merges each batch, names and tags it with a language model and \
delivers it to Paperless-ngx or a network share. Stages are decoupled by durable queues.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Config file (.json or .toml).
    #[arg(short, long, global = true, env = "SCANFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the default config as JSON and as TOML.
    EmptyConfig,

    /// Rename the PDFs on the network share from their content.
    RenameShare {
        /// Only print the guessed names.
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_logging(config: Option<&Config>) {
    let level = config.map_or("info", |c| c.logging.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let json = config.is_some_and(|c| c.logging.format == scanflow::config::LogFormat::Json);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
}

fn require_config(path: Option<&Path>) -> Result<&Path> {
    match path {
        Some(path) => Ok(path),
        None => bail!("--config <FILE> is required (try `scanflow empty-config`)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::EmptyConfig) => {
            let config = Config::default();
            println!("# JSON");
            println!("{}", config.to_json_pretty()?);
            println!();
            println!("# TOML");
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Some(Command::RenameShare { dry_run }) => {
            let path = require_config(cli.config.as_deref())?;
            let config = Config::read(path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?;
            init_logging(Some(&config));
            rename_share(&config, dry_run).await
        }
        None => {
            let path = require_config(cli.config.as_deref())?;
            let config = Config::load(path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?;
            init_logging(Some(&config));
            run_daemon(&config).await
        }
    }
}

async fn run_daemon(config: &Config) -> Result<()> {
    let share = match config.delivery {
        scanflow::config::DeliveryTarget::Share => Some(MountedShare::start(&config.share).await),
        scanflow::config::DeliveryTarget::Paperless => None,
    };

    let stages = standard_stages(
        config,
        share.clone().map(|s| s as Arc<dyn FileShare>),
    )
    .context("Failed to build pipeline stages")?;
    let daemon_config = config
        .queue
        .daemon_config()
        .context("Invalid queue configuration")?;
    let pipeline =
        Pipeline::assemble(stages, daemon_config).context("Failed to assemble pipeline")?;

    let daemon = Daemon::start(pipeline);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    daemon.stop().await;
    if let Some(share) = share {
        share.stop().await;
    }
    Ok(())
}

async fn rename_share(config: &Config, dry_run: bool) -> Result<()> {
    if config.share.base_path.as_os_str().is_empty() {
        bail!("share.base_path is required for rename-share");
    }
    if !config.llm.is_usable() {
        bail!("rename-share needs a language model: set llm.api_key or OPENAI_API_KEY");
    }

    let completion = build_completion(&config.llm).context("Failed to set up the language model")?;
    let share = MountedShare::start(&config.share).await;
    let progress: ProgressCallback = CliRenameProgress::new(dry_run);

    let renamer = ShareRenamer::new(
        share.clone(),
        Arc::new(PdfEngine::new(&config.pdf.library_path)),
        Arc::new(LlmNameGuesser::new(completion, &config.llm)),
    )
    .dry_run(dry_run)
    .progress_callback(progress);

    let result = renamer.run().await;
    share.stop().await;
    let report = result.context("Failed to list the network share")?;
    if !report.failed.is_empty() {
        bail!("{} of the files could not be renamed", report.failed.len());
    }
    Ok(())
}
