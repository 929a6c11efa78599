//! # Configuration Management Module
//!
//! Questo modulo gestisce la configurazione del batch.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` serializzabile in JSON
//! - Caricamento/salvataggio da file (`--config`, `--save-config`)
//! - Validazione in un unico punto (`Config::settings`) prima del dispatch
//! - Valori di default sensati per tutti i parametri
//!
//! ## Parametri di configurazione:
//! - `resolutions`: lista di `{size, mode}` (default: `256` fit)
//! - `no_resize`: usa solo l'immagine originale normalizzata
//! - `formats`: lista di `{format, quality, lossless}` (default: WebP q82)
//! - `strip_metadata`, `recursive`, `hardware_acceleration`: flag (default: false)
//! - `workers`: worker paralleli (default: 75% dei core, tra 1 e 8)
//! - `step_timeout_secs`: timeout di ogni tool esterno (default: 300)
//! - `overwrite`: `ask`, `overwrite` o `skip` (default: `ask`)
//! - `tools_dir`: directory con i tool esterni (default: `PATH`)
//! - `json_output`: eventi JSON su stdout
//! - `output_dir`: directory di destinazione (obbligatoria)
//!
//! ## Esempio:
//! ```ignore
//! let config = Config {
//!     formats: vec!["png:lossless".parse()?, "webp:80".parse()?],
//!     output_dir: Some(PathBuf::from("out")),
//!     ..Default::default()
//! };
//! let settings = config.settings(vec![PathBuf::from("photos")])?;
//! ```

use crate::formats::{FormatSpec, OutputFormat};
use crate::job::JobPlan;
use crate::overwrite::PolicyState;
use crate::size_policy::{normalize_request, ResizeMode, ResolutionSpec};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const MAX_WORKERS: usize = 64;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Worker count from CPU parallelism: 75% of the cores, within `[1, 8]`
pub fn default_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores * 3 / 4).clamp(1, 8)
}

/// `{config_dir}/pyramid-optimizer/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pyramid-optimizer").join("config.json"))
}

/// A size as written by the user: a number or a string (`"50%"`, `"original"`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for SizeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// One resolution entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    pub size: SizeValue,
    #[serde(default)]
    pub mode: ResizeMode,
}

impl ResolutionConfig {
    fn to_spec(&self) -> ResolutionSpec {
        let raw = self.size.to_string();
        if raw.trim().eq_ignore_ascii_case("original") {
            ResolutionSpec::original()
        } else {
            ResolutionSpec::from_input(&raw, self.mode)
        }
    }
}

/// `SIZE[:MODE]`, e.g. `256`, `1024:crop`, `50%`, `original`
impl FromStr for ResolutionConfig {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (size, mode) = match s.rsplit_once(':') {
            Some((size, mode)) => (size, mode.parse::<ResizeMode>().map_err(|e| e.to_string())?),
            None => (s, ResizeMode::default()),
        };
        Ok(Self {
            size: SizeValue::Text(size.trim().to_string()),
            mode,
        })
    }
}

/// One output format entry; missing values use the format's defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatConfig {
    pub format: OutputFormat,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub lossless: Option<bool>,
}

impl FormatConfig {
    fn to_spec(&self) -> Result<FormatSpec> {
        let format = self.format;
        let quality = self.quality.unwrap_or_else(|| format.default_quality());
        let range = format.quality_range();
        if !range.contains(&quality) {
            return Err(anyhow::anyhow!(
                "{} quality must be between {} and {}",
                format,
                range.start(),
                range.end()
            ));
        }
        Ok(FormatSpec::new(format)
            .with_quality(quality)
            .with_lossless(self.lossless.unwrap_or_else(|| format.default_lossless())))
    }
}

/// `FORMAT[:QUALITY][:lossless|lossy]`, e.g. `webp:80`, `png:lossless`, `jpeg:90:lossy`
impl FromStr for FormatConfig {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let format = parts.next().unwrap_or_default().parse::<OutputFormat>()?;
        let mut config = Self {
            format,
            quality: None,
            lossless: None,
        };
        for part in parts {
            match part.trim().to_lowercase().as_str() {
                "lossless" => config.lossless = Some(true),
                "lossy" => config.lossless = Some(false),
                other => {
                    let quality = other
                        .parse::<u8>()
                        .map_err(|_| format!("invalid format option: {}", other))?;
                    config.quality = Some(quality);
                }
            }
        }
        Ok(config)
    }
}

/// Configuration for a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub resolutions: Vec<ResolutionConfig>,
    /// Keep the original size only; overrides `resolutions`
    pub no_resize: bool,
    pub formats: Vec<FormatConfig>,
    pub strip_metadata: bool,
    /// Recurse into subdirectories of directory sources
    pub recursive: bool,
    pub workers: usize,
    pub hardware_acceleration: bool,
    /// Upper bound for each external tool invocation
    pub step_timeout_secs: u64,
    /// Initial overwrite policy
    pub overwrite: PolicyState,
    pub tools_dir: Option<PathBuf>,
    /// Output progress and status as JSON for programmatic use
    pub json_output: bool,
    pub output_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolutions: vec![ResolutionConfig {
                size: SizeValue::Number(256.0),
                mode: ResizeMode::Fit,
            }],
            no_resize: false,
            formats: vec![FormatConfig {
                format: OutputFormat::WebP,
                quality: None,
                lossless: None,
            }],
            strip_metadata: false,
            recursive: false,
            workers: default_workers(),
            hardware_acceleration: false,
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            overwrite: PolicyState::Ask,
            tools_dir: None,
            json_output: false,
            output_dir: None,
        }
    }
}

/// Validated, immutable settings handed to the scheduler
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub sources: Vec<PathBuf>,
    pub recursive: bool,
    pub workers: usize,
    pub plan: JobPlan,
    pub overwrite: PolicyState,
    pub hardware_acceleration: bool,
    pub step_timeout: Duration,
    pub tools_dir: Option<PathBuf>,
}

impl Config {
    /// Validate everything and produce the batch settings.
    pub fn settings(&self, sources: Vec<PathBuf>) -> Result<BatchSettings> {
        if sources.is_empty() {
            return Err(anyhow::anyhow!("At least one input file or directory is required"));
        }

        let output_dir = self
            .output_dir
            .clone()
            .ok_or_else(|| anyhow::anyhow!("An output directory is required"))?;

        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(anyhow::anyhow!(
                "Number of workers must be between 1 and {}",
                MAX_WORKERS
            ));
        }

        if self.step_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Step timeout must be greater than 0"));
        }

        if self.formats.is_empty() {
            return Err(anyhow::anyhow!("At least one output format is required"));
        }
        let mut seen = HashSet::new();
        let mut formats = Vec::with_capacity(self.formats.len());
        for entry in &self.formats {
            if !seen.insert(entry.format) {
                return Err(anyhow::anyhow!("Format {} is listed more than once", entry.format));
            }
            formats.push(entry.to_spec()?);
        }

        let requested = if self.no_resize {
            vec![ResolutionSpec::original()]
        } else {
            self.resolutions.iter().map(ResolutionConfig::to_spec).collect()
        };
        let resolutions = normalize_request(requested)?;

        Ok(BatchSettings {
            sources,
            recursive: self.recursive,
            workers: self.workers,
            plan: JobPlan {
                resolutions,
                formats,
                strip_metadata: self.strip_metadata,
                output_dir,
            },
            overwrite: self.overwrite,
            hardware_acceleration: self.hardware_acceleration,
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            tools_dir: self.tools_dir.clone(),
        })
    }

    /// Load configuration from file; a missing file gives the defaults
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}
