//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore della pipeline di transcodifica.
//!
//! ## Categorie di errori:
//! - **Fatali per il job**: normalizzazione o costruzione della piramide fallita
//! - **Recuperabili per output**: un singolo encode fallito (`ToolFailed`, `ToolTimeout`, `EmptyOutput`)
//! - **Cosmetici**: rimozione metadata fallita
//! - **Fatali per il batch**: discovery, output directory, scratch directory
//! - **Validazione input**: rifiutati prima del dispatch (`Validation`, `InvalidSpec`)
//!
//! ## Esempio:
//! ```ignore
//! if !status.success() {
//!     return Err(OptimizeError::ToolFailed { tool, args, status: status.code() });
//! }
//! ```

use std::path::PathBuf;

/// Custom error types for the transcoding pipeline
#[derive(thiserror::Error, Debug)]
pub enum OptimizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image probing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("{tool} exited with {} (args: {})", exit_label(.status), .args.join(" "))]
    ToolFailed {
        tool: String,
        args: Vec<String>,
        status: Option<i32>,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Dependency missing: {0}")]
    ToolMissing(String),

    #[error("Tool produced no output: {}", .0.display())]
    EmptyOutput(PathBuf),

    #[error("Invalid resolution spec: {0}")]
    InvalidSpec(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("File discovery failed: {0}")]
    Discovery(String),

    #[error("Output directory {} is not usable: {}", .0.display(), .1)]
    OutputDir(PathBuf, String),

    #[error("Scratch directory error: {0}")]
    Scratch(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Worker failed: {0}")]
    Worker(String),
}

impl OptimizeError {
    /// Errors that stop the whole batch rather than a single image.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            Self::Discovery(_) | Self::OutputDir(..) | Self::Scratch(_) | Self::Worker(_)
        )
    }
}

fn exit_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

pub type Result<T, E = OptimizeError> = std::result::Result<T, E>;
