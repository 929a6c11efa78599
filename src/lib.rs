//! # Pyramid Optimizer Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! Ogni immagine sorgente viene normalizzata, ridimensionata in una piramide di
//! risoluzioni e codificata in uno o più formati tramite tool esterni
//! (ImageMagick, oxipng, pngquant, cjpegli, cwebp, avifenc).
//!
//! ## Architettura dei moduli:
//! - `config`: Configurazione serializzabile e validazione in `BatchSettings`
//! - `error`: Tipi di errore custom per le diverse fasi
//! - `size_policy`: Normalizzazione e ordinamento delle risoluzioni richieste
//! - `formats`: Formati di output e relativi parametri
//! - `discovery`: Espansione delle sorgenti in una lista di immagini
//! - `transcoder`: Invocazione dei tool esterni dietro il trait `Transcoder`
//! - `job`: Pipeline di una singola immagine
//! - `scheduler`: Pool di worker e aggregazione dei risultati
//! - `overwrite`: Politica di sovrascrittura condivisa
//! - `progress`: Eventi di avanzamento (progress bar o JSON)
//! - `stats`: Statistiche di compressione
//!
//! ## Utilizzo:
//! ```ignore
//! use pyramid_optimizer::{BatchScheduler, CancelToken, Config, ExternalTranscoder, ToolResolver};
//!
//! let settings = config.settings(sources)?;
//! let transcoder = Arc::new(ExternalTranscoder::new(ToolResolver::new(None), settings.step_timeout));
//! let scheduler = BatchScheduler::new(transcoder, resolver, events_tx, CancelToken::new());
//! let outcome = scheduler.run(&settings).await?;
//! ```

pub mod cancel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod formats;
pub mod job;
pub mod overwrite;
pub mod progress;
pub mod scheduler;
pub mod size_policy;
pub mod stats;
pub mod tools;
pub mod transcoder;

pub use cancel::CancelToken;
pub use config::{BatchSettings, Config};
pub use error::OptimizeError;
pub use formats::{FormatSpec, OutputFormat};
pub use overwrite::{ConflictDecision, ConflictResolver, OverwritePolicy, PolicyState};
pub use progress::ProgressEvent;
pub use scheduler::{BatchOutcome, BatchScheduler};
pub use size_policy::{ResizeMode, ResolutionSpec, SizeTarget};
pub use stats::BatchStats;
pub use tools::ToolResolver;
pub use transcoder::{ExternalTranscoder, Transcoder};
