//! # Pyramid Optimizer - Main Entry Point
//!
//! Questo è il punto di ingresso principale dell'applicazione.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing` (su stderr)
//! - Caricamento del config JSON e override dalla CLI
//! - Verifica dei tool esterni richiesti
//! - Avvio dello scheduler e stampa del riepilogo finale
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI
//! 2. Configura il logging (`RUST_LOG`, oppure INFO/DEBUG a seconda di `--verbose`)
//! 3. Carica il config (`--config` o quello di default) e applica gli override
//! 4. Valida tutto in `BatchSettings` e controlla le dipendenze
//! 5. Esegue il batch; Ctrl-C annulla il lavoro in corso
//!
//! ## Esempio di utilizzo:
//! ```bash
//! pyramid-optimizer photos/ -o out/ -r 1024 -r 256:crop -f png:lossless -f webp:80 --strip-metadata
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pyramid_optimizer::config::{default_config_path, FormatConfig, ResolutionConfig};
use pyramid_optimizer::progress::{forward_events, BarReporter, JsonReporter, PromptResolver, Reporter};
use pyramid_optimizer::stats::format_size;
use pyramid_optimizer::tools::required_tools;
use pyramid_optimizer::{
    BatchOutcome, BatchScheduler, CancelToken, Config, ConflictResolver, ExternalTranscoder,
    PolicyState, ToolResolver,
};

#[derive(Parser)]
#[command(name = "pyramid-optimizer")]
#[command(about = "Produce multi-resolution, multi-format optimized copies of images")]
struct Args {
    /// Image files and/or directories to process
    sources: Vec<PathBuf>,

    /// Output directory for the generated files
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target size as SIZE[:MODE] (e.g. 1024, 256:crop, 50%); repeatable
    #[arg(short, long = "resolution", value_name = "SIZE[:MODE]")]
    resolutions: Vec<ResolutionConfig>,

    /// Keep the original size only
    #[arg(long)]
    no_resize: bool,

    /// Output format as FORMAT[:QUALITY][:lossless|lossy]; repeatable
    #[arg(short, long = "format", value_name = "FORMAT[:Q][:MODE]")]
    formats: Vec<FormatConfig>,

    /// Remove metadata (EXIF, XMP, ...) before encoding
    #[arg(long)]
    strip_metadata: bool,

    /// Recurse into subdirectories
    #[arg(short = 'R', long)]
    recursive: bool,

    /// Number of parallel workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Use OpenCL acceleration in ImageMagick when available
    #[arg(long)]
    hw_accel: bool,

    /// Timeout for every external tool invocation, in seconds
    #[arg(long, value_name = "SECS")]
    step_timeout: Option<u64>,

    /// What to do with existing outputs: ask, overwrite, skip
    #[arg(long)]
    overwrite: Option<PolicyState>,

    /// Directory containing the external tools (default: PATH)
    #[arg(long)]
    tools_dir: Option<PathBuf>,

    /// Output progress and results as JSON lines
    #[arg(long)]
    json: bool,

    /// Load configuration from this file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Save the effective configuration (to FILE or the default location)
    #[arg(long, value_name = "FILE")]
    save_config: Option<Option<PathBuf>>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if !self.resolutions.is_empty() {
            config.resolutions = self.resolutions.clone();
        }
        if !self.formats.is_empty() {
            config.formats = self.formats.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = Some(output.clone());
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(secs) = self.step_timeout {
            config.step_timeout_secs = secs;
        }
        if let Some(policy) = self.overwrite {
            config.overwrite = policy;
        }
        if let Some(dir) = &self.tools_dir {
            config.tools_dir = Some(dir.clone());
        }
        config.no_resize |= self.no_resize;
        config.strip_metadata |= self.strip_metadata;
        config.recursive |= self.recursive;
        config.hardware_acceleration |= self.hw_accel;
        config.json_output |= self.json;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout is reserved for JSON output
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match args.config.clone().or_else(default_config_path) {
        Some(path) => Config::from_file(&path).await?,
        None => Config::default(),
    };
    args.apply(&mut config);

    if let Some(target) = &args.save_config {
        let path = target
            .clone()
            .or_else(default_config_path)
            .ok_or_else(|| anyhow::anyhow!("No configuration directory available, pass a file"))?;
        config.save_to_file(&path).await?;
        info!("Configuration saved to {}", path.display());
        if args.sources.is_empty() {
            return Ok(());
        }
    }

    let settings = config.settings(args.sources.clone())?;

    let resolver = ToolResolver::new(settings.tools_dir.clone());
    resolver.verify(&required_tools(&settings.plan.formats, settings.plan.strip_metadata))?;

    let transcoder = ExternalTranscoder::new(resolver, settings.step_timeout)
        .with_acceleration(settings.hardware_acceleration)
        .await;
    if transcoder.accelerated() {
        info!("ImageMagick OpenCL acceleration enabled");
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after the running steps...");
                cancel.cancel();
            }
        });
    }

    let (reporter, conflicts): (Reporter, Arc<dyn ConflictResolver>) = if config.json_output {
        (Reporter::Json(JsonReporter), Arc::new(PromptResolver::new(None)))
    } else {
        let bar = BarReporter::new();
        let prompt = PromptResolver::new(Some(bar.bar()));
        (Reporter::Bar(bar), Arc::new(prompt))
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_events(rx, reporter));

    let scheduler = BatchScheduler::new(Arc::new(transcoder), conflicts, tx, cancel);
    let outcome = scheduler.run(&settings).await;
    // Closing the event channel lets the forwarder drain and stop
    drop(scheduler);
    let _ = forwarder.await;

    let outcome = outcome?;
    if !config.json_output {
        print_summary(&outcome);
    }

    Ok(())
}

fn print_summary(outcome: &BatchOutcome) {
    let stats = &outcome.stats;

    println!();
    if outcome.cancelled {
        println!("⚠️  Cancelled before completion");
    }
    println!("📊 Optimization Results:");
    println!("  Files processed: {}", stats.files_processed);
    println!("  Files written: {}", stats.files_written);
    println!("  Original size: {}", format_size(stats.total_original_bytes));
    println!("  Optimized size: {}", format_size(stats.total_optimized_bytes));
    println!("  Size saved: {}", format_size(stats.size_saved()));
    println!("  Compression ratio: {:.1}%", stats.compression_ratio());

    if !outcome.errors.is_empty() {
        println!();
        println!("❌ {} errors:", outcome.errors.len());
        for error in &outcome.errors {
            println!("  • {}", error);
        }
    }
}
