//! # Tool Resolution Module
//!
//! Questo modulo trova i tool esterni usati dalla pipeline e verifica che siano
//! presenti prima di avviare il batch.
//!
//! ## Ordine di ricerca:
//! 1. Directory esplicita (`--tools-dir` / `tools_dir` nel config)
//! 2. Variabile d'ambiente `PYRAMID_TOOLS_DIR`
//! 3. `PATH` di sistema
//!
//! In una directory di tool sono accettati sia `{dir}/{tool}` sia
//! `{dir}/{tool}/{tool}`; su Windows viene aggiunto il suffisso `.exe`.
//!
//! ## Accelerazione hardware
//! `magick -list configure` viene letto una sola volta per processo; se
//! ImageMagick non espone OpenCL la richiesta di accelerazione viene ignorata
//! senza errori.

use crate::error::{OptimizeError, Result};
use crate::formats::{FormatSpec, OutputFormat};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub const MAGICK: &str = "magick";
pub const EXIFTOOL: &str = "exiftool";
pub const OXIPNG: &str = "oxipng";
pub const PNGQUANT: &str = "pngquant";
pub const CJPEGLI: &str = "cjpegli";
pub const CWEBP: &str = "cwebp";
pub const AVIFENC: &str = "avifenc";

/// Environment override for the bundled tools directory
pub const TOOLS_DIR_ENV: &str = "PYRAMID_TOOLS_DIR";

/// Finds external binaries in a tools directory or on `PATH`
#[derive(Debug, Clone, Default)]
pub struct ToolResolver {
    tools_dir: Option<PathBuf>,
}

impl ToolResolver {
    /// Use `tools_dir` if given, else `PYRAMID_TOOLS_DIR`, else only `PATH`
    pub fn new(tools_dir: Option<PathBuf>) -> Self {
        let tools_dir = tools_dir.or_else(|| env::var_os(TOOLS_DIR_ENV).map(PathBuf::from));
        if let Some(dir) = &tools_dir {
            debug!("Tools directory: {}", dir.display());
        }
        Self { tools_dir }
    }

    /// Resolved path of `tool`, if it exists anywhere we look
    pub fn resolve(&self, tool: &str) -> Option<PathBuf> {
        let file_name = executable_name(tool);

        if let Some(dir) = &self.tools_dir {
            let candidates = [dir.join(&file_name), dir.join(tool).join(&file_name)];
            if let Some(found) = candidates.into_iter().find(|p| p.is_file()) {
                debug!("Using bundled tool: {} -> {:?}", tool, found);
                return Some(found);
            }
        }

        let found = find_in_system_path(&file_name);
        if found.is_none() {
            debug!("Tool not found: {}", tool);
        }
        found
    }

    /// Program to spawn for `tool`; falls back to the bare name so the spawn
    /// error names the missing binary.
    pub fn program(&self, tool: &str) -> PathBuf {
        self.resolve(tool)
            .unwrap_or_else(|| PathBuf::from(executable_name(tool)))
    }

    /// Fail with every missing tool and how to get it.
    pub fn verify(&self, tools: &[&str]) -> Result<()> {
        let missing: Vec<String> = tools
            .iter()
            .filter(|tool| self.resolve(tool).is_none())
            .map(|tool| format!("{} ({})", tool, install_hint(tool)))
            .collect();

        if missing.is_empty() {
            info!("All required tools found: {}", tools.join(", "));
            Ok(())
        } else {
            Err(OptimizeError::ToolMissing(missing.join("; ")))
        }
    }
}

/// Tools needed for the requested formats and options, in invocation order
pub fn required_tools(formats: &[FormatSpec], strip_metadata: bool) -> Vec<&'static str> {
    let mut tools = vec![MAGICK];
    if strip_metadata {
        tools.push(EXIFTOOL);
    }
    for spec in formats {
        let needed: &[&'static str] = match spec.format {
            OutputFormat::Png if spec.lossless => &[OXIPNG],
            OutputFormat::Png => &[OXIPNG, PNGQUANT],
            OutputFormat::Jpeg => &[CJPEGLI],
            OutputFormat::WebP => &[CWEBP],
            OutputFormat::Avif => &[AVIFENC],
        };
        for tool in needed {
            if !tools.contains(tool) {
                tools.push(tool);
            }
        }
    }
    tools
}

fn executable_name(tool: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", tool)
    } else {
        tool.to_string()
    }
}

fn find_in_system_path(file_name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

fn install_hint(tool: &str) -> &'static str {
    match tool {
        MAGICK => "install ImageMagick 7",
        EXIFTOOL => "install exiftool / libimage-exiftool-perl",
        OXIPNG => "install oxipng",
        PNGQUANT => "install pngquant",
        CJPEGLI => "install jpegli (libjxl tools)",
        CWEBP => "install libwebp / webp",
        AVIFENC => "install libavif-bin",
        _ => "not found",
    }
}

/// Hardware backends advertised by ImageMagick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Acceleration {
    pub opencl: bool,
}

impl Acceleration {
    /// Read the `FEATURES`/`DELEGATES` lines of `magick -list configure`
    pub fn from_configure_output(output: &str) -> Self {
        let mut accel = Self::default();
        for line in output.lines() {
            let upper = line.to_uppercase();
            if upper.starts_with("FEATURES") || upper.starts_with("DELEGATES") {
                accel.opencl |= upper.contains("OPENCL");
            }
        }
        accel
    }
}

/// Upper bound for `magick -list configure`
pub const ACCEL_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

static ACCELERATION: OnceCell<Acceleration> = OnceCell::const_new();

/// Ask ImageMagick once per process. Any failure means "no acceleration".
pub async fn detect_acceleration(resolver: &ToolResolver) -> Acceleration {
    *ACCELERATION
        .get_or_init(|| query_acceleration(resolver.program(MAGICK), ACCEL_QUERY_TIMEOUT))
        .await
}

async fn query_acceleration(program: PathBuf, limit: Duration) -> Acceleration {
    let output = Command::new(&program)
        .args(["-list", "configure"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let accel = match tokio::time::timeout(limit, output).await {
        Ok(Ok(out)) if out.status.success() => {
            Acceleration::from_configure_output(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(_) => Acceleration::default(),
        Err(_) => {
            debug!("{} -list configure timed out after {:?}", program.display(), limit);
            Acceleration::default()
        }
    };
    debug!("ImageMagick acceleration: {:?}", accel);
    accel
}
