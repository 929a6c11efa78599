//! # Progress Reporting Module
//!
//! Questo modulo definisce gli eventi emessi dallo scheduler e i due modi di
//! presentarli.
//!
//! ## Eventi (`ProgressEvent`):
//! - `status`: messaggio testuale libero
//! - `progress`: `(current, total)` in ordine di completamento
//! - `stats`: snapshot di `BatchStats` dopo ogni immagine
//! - `finished` / `error`: segnale terminale, esattamente uno per batch
//!
//! ## Presentazione:
//! - `BarReporter`: progress bar `indicatif` su stderr
//! - `JsonReporter`: una riga JSON per evento su stdout, per consumatori programmatici
//!
//! ## Esempio di output JSON:
//! ```text
//! {"type":"progress","current":3,"total":10,"percentage":30.0}
//! {"type":"finished","stats":{...},"errors":[],"cancelled":false}
//! ```

use crate::overwrite::{ConflictDecision, ConflictResolver};
use crate::stats::{format_size, BatchStats};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

/// Events emitted by the batch scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status {
        message: String,
    },
    Progress {
        current: usize,
        total: usize,
        percentage: f64,
    },
    Stats {
        stats: BatchStats,
    },
    Finished {
        stats: BatchStats,
        errors: Vec<String>,
        cancelled: bool,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn progress(current: usize, total: usize) -> Self {
        let percentage = if total > 0 {
            (current as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Self::Progress {
            current,
            total,
            percentage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Error { .. })
    }
}

/// Interactive progress bar
#[derive(Clone)]
pub struct BarReporter {
    bar: ProgressBar,
}

impl BarReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn bar(&self) -> ProgressBar {
        self.bar.clone()
    }

    pub fn handle(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Status { message } => self.bar.set_message(message.clone()),
            ProgressEvent::Progress { current, total, .. } => {
                self.bar.set_length(*total as u64);
                self.bar.set_position(*current as u64);
            }
            ProgressEvent::Stats { stats } => self.bar.set_message(format!(
                "saved {} ({:.1}%)",
                format_size(stats.size_saved()),
                stats.compression_ratio()
            )),
            ProgressEvent::Finished { stats, .. } => self.bar.finish_with_message(stats.format_summary()),
            ProgressEvent::Error { message } => self.bar.abandon_with_message(format!("Error: {}", message)),
        }
    }
}

impl Default for BarReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON-lines output on stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReporter;

impl JsonReporter {
    pub fn handle(&self, event: &ProgressEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            println!("{}", json);
        }
    }
}

/// Where events end up
#[derive(Clone)]
pub enum Reporter {
    Bar(BarReporter),
    Json(JsonReporter),
}

impl Reporter {
    pub fn handle(&self, event: &ProgressEvent) {
        match self {
            Self::Bar(bar) => bar.handle(event),
            Self::Json(json) => json.handle(event),
        }
    }
}

/// Forward every event to `reporter` until the channel closes; returns the terminal event.
pub async fn forward_events(
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
    reporter: Reporter,
) -> Option<ProgressEvent> {
    let mut terminal = None;
    while let Some(event) = events.recv().await {
        reporter.handle(&event);
        if event.is_terminal() {
            terminal = Some(event);
        }
    }
    terminal
}

/// Asks on the terminal, with the progress bar suspended while waiting
pub struct PromptResolver {
    bar: Option<ProgressBar>,
}

impl PromptResolver {
    pub fn new(bar: Option<ProgressBar>) -> Self {
        Self { bar }
    }

    fn ask(existing: &Path) -> ConflictDecision {
        eprint!(
            "{} already exists. Overwrite? [y]es / [N]o / [a]ll / [s]kip all: ",
            existing.display()
        );
        let _ = std::io::stderr().flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return ConflictDecision::Skip;
        }
        parse_answer(&answer)
    }
}

impl ConflictResolver for PromptResolver {
    fn resolve(&self, existing: &Path) -> ConflictDecision {
        match &self.bar {
            Some(bar) => bar.suspend(|| Self::ask(existing)),
            None => Self::ask(existing),
        }
    }
}

/// Anything unrecognised, including EOF, keeps the existing file
fn parse_answer(answer: &str) -> ConflictDecision {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => ConflictDecision::Overwrite,
        "a" | "all" => ConflictDecision::OverwriteAll,
        "s" | "skip all" | "skipall" => ConflictDecision::SkipAll,
        _ => ConflictDecision::Skip,
    }
}
