//! # Image Job Module
//!
//! Pipeline sequenziale per una singola immagine:
//!
//! ```text
//! Discovered -> Normalized -> [MetadataStripped] -> Pyramid-Built -> Encoded (risoluzione x formato) -> Done
//! ```
//!
//! ## Gestione errori:
//! - **Normalizzazione / piramide**: fatali per il job, un solo errore nel risultato
//! - **Rimozione metadata**: registrata, l'elaborazione continua
//! - **Encode**: ogni coppia (risoluzione, formato) fallisce in modo indipendente
//!
//! Il job non propaga mai errori: tutto finisce in `ImageJobResult::errors`.
//!
//! ## Scrittura degli output
//! Ogni encoder scrive nella directory di lavoro del worker; il file finito viene
//! poi spostato nella directory di output (rename, con fallback a copia), quindi
//! un encode fallito non lascia mai file troncati a destinazione.

use crate::cancel::CancelToken;
use crate::error::{OptimizeError, Result};
use crate::formats::{FormatSpec, OutputFormat};
use crate::overwrite::{ConflictResolver, OverwritePolicy};
use crate::size_policy::{should_resize, ResolutionSpec};
use crate::stats::ImageJobResult;
use crate::transcoder::Transcoder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What every job in a batch produces. Shared, never mutated after validation.
#[derive(Debug, Clone)]
pub struct JobPlan {
    /// Largest first; either exactly `[Original]` or only sized specs
    pub resolutions: Vec<ResolutionSpec>,
    pub formats: Vec<FormatSpec>,
    pub strip_metadata: bool,
    pub output_dir: PathBuf,
}

/// One source image to process
#[derive(Debug, Clone)]
pub struct ImageJobRequest {
    pub index: usize,
    pub source: PathBuf,
    pub plan: Arc<JobPlan>,
}

/// Collaborators shared by every job of a batch
#[derive(Clone)]
pub struct JobContext {
    pub transcoder: Arc<dyn Transcoder>,
    pub overwrite: Arc<OverwritePolicy>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub cancel: CancelToken,
}

/// `{base}[_{tag}].{ext}`
pub fn output_file_name(base: &str, tag: Option<&str>, format: OutputFormat) -> String {
    match tag {
        Some(tag) => format!("{}_{}.{}", base, tag, format.extension()),
        None => format!("{}.{}", base, format.extension()),
    }
}

struct PyramidLevel {
    /// `None` for the untouched original
    tag: Option<String>,
    image: PathBuf,
}

struct ImageJob<'a> {
    request: &'a ImageJobRequest,
    ctx: &'a JobContext,
    work: &'a Path,
    /// Encoder outputs only; never shares names with pipeline intermediates
    staging: PathBuf,
    name: String,
    base: String,
}

/// Run one image through the pipeline inside the worker's `scratch` directory.
pub async fn run_image_job(request: &ImageJobRequest, scratch: &Path, ctx: &JobContext) -> ImageJobResult {
    let source_bytes = tokio::fs::metadata(&request.source)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    let mut result = ImageJobResult::new(request.source.clone(), source_bytes);

    let name = request
        .source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| request.source.display().to_string());
    let base = request
        .source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());

    if ctx.cancel.is_cancelled() {
        result.cancelled = true;
        return result;
    }

    // Removed on drop, whatever happens below
    let work = match tempfile::Builder::new().prefix("job_").tempdir_in(scratch) {
        Ok(dir) => dir,
        Err(e) => {
            error!("Cannot create work directory for {}: {}", name, e);
            result.errors.push(format!("Scratch setup failed: {} ({})", name, e));
            return result;
        }
    };

    let staging = work.path().join("out");
    if let Err(e) = tokio::fs::create_dir(&staging).await {
        error!("Cannot create staging directory for {}: {}", name, e);
        result.errors.push(format!("Scratch setup failed: {} ({})", name, e));
        return result;
    }

    let job = ImageJob {
        request,
        ctx,
        work: work.path(),
        staging,
        name,
        base,
    };
    job.execute(&mut result).await;

    debug!(
        "#{} {} done: {} written, {} skipped, {} errors",
        request.index,
        job.name,
        result.files_written(),
        result.skipped,
        result.errors.len()
    );
    result
}

impl ImageJob<'_> {
    async fn execute(&self, result: &mut ImageJobResult) {
        let transcoder = &self.ctx.transcoder;
        let cancel = &self.ctx.cancel;
        let plan = &self.request.plan;

        let normalized = self.work.join("normalized.png");
        if let Err(e) = transcoder
            .normalize(&self.request.source, &normalized, cancel)
            .await
        {
            self.abort(result, "Normalize to PNG failed", e);
            return;
        }

        if plan.strip_metadata {
            match transcoder.strip_metadata(&normalized, cancel).await {
                Ok(()) => {}
                Err(OptimizeError::Cancelled) => {
                    result.cancelled = true;
                    return;
                }
                Err(e) => {
                    warn!("Metadata strip failed for {}: {}", self.name, e);
                    result
                        .errors
                        .push(format!("Metadata strip failed: {} ({})", self.name, e));
                }
            }
        }

        let levels = match self.build_pyramid(&normalized).await {
            Ok(levels) => levels,
            Err(e) => {
                self.abort(result, "Resize failed", e);
                return;
            }
        };

        for level in &levels {
            for spec in &plan.formats {
                if cancel.is_cancelled() {
                    result.cancelled = true;
                    return;
                }
                self.encode_output(level, spec, result).await;
            }
        }
    }

    /// Record a job-fatal error
    fn abort(&self, result: &mut ImageJobResult, stage: &str, e: OptimizeError) {
        if matches!(e, OptimizeError::Cancelled) {
            result.cancelled = true;
            return;
        }
        error!("{}: {} ({})", stage, self.name, e);
        result.errors.push(format!("{}: {} ({})", stage, self.name, e));
    }

    /// Each level is resized from the normalized source, never from another level.
    async fn build_pyramid(&self, normalized: &Path) -> Result<Vec<PyramidLevel>> {
        let specs = &self.request.plan.resolutions;

        if let [only] = specs.as_slice() {
            if only.is_original() {
                return Ok(vec![PyramidLevel {
                    tag: None,
                    image: normalized.to_path_buf(),
                }]);
            }
        }

        let (width, height) = self.ctx.transcoder.dimensions(normalized).await?;
        let mut levels = Vec::with_capacity(specs.len());

        for (i, spec) in specs.iter().enumerate() {
            if self.ctx.cancel.is_cancelled() {
                return Err(OptimizeError::Cancelled);
            }
            if !spec.is_original() && !should_resize(width, height, &spec.target) {
                debug!(
                    "{}: {} would not shrink {}x{}, skipped",
                    self.name, spec, width, height
                );
                continue;
            }

            let geometry = spec.geometry()?;
            let (new_w, new_h) = geometry.output_dimensions(width, height);
            debug!(
                "{}: {} {}x{} -> {}x{} ({})",
                self.name,
                spec,
                width,
                height,
                new_w,
                new_h,
                self.ctx.transcoder.name()
            );
            let output = self.work.join(format!("level_{}.png", i));
            self.ctx
                .transcoder
                .resize(normalized, &output, geometry, &self.ctx.cancel)
                .await?;
            levels.push(PyramidLevel {
                tag: Some(spec.size_tag()),
                image: output,
            });
        }

        Ok(levels)
    }

    async fn encode_output(&self, level: &PyramidLevel, spec: &FormatSpec, result: &mut ImageJobResult) {
        let file_name = output_file_name(&self.base, level.tag.as_deref(), spec.format);
        let destination = self.request.plan.output_dir.join(&file_name);

        if !self
            .ctx
            .overwrite
            .allows_write(&destination, &self.ctx.resolver)
            .await
        {
            debug!("Keeping existing {}", destination.display());
            result.skipped += 1;
            return;
        }

        let staged = self.staging.join(&file_name);
        let outcome: Result<u64> = async {
            self.encode(spec, &level.image, &staged).await?;
            publish(&staged, &destination).await
        }
        .await;

        match outcome {
            Ok(size) => result.add_output(destination, size),
            Err(OptimizeError::Cancelled) => result.cancelled = true,
            Err(e) => {
                warn!("{} encode failed for {}: {}", spec.format, file_name, e);
                result
                    .errors
                    .push(format!("{}: {} ({})", spec.format, file_name, e));
            }
        }
    }

    async fn encode(&self, spec: &FormatSpec, input: &Path, output: &Path) -> Result<()> {
        let transcoder = &self.ctx.transcoder;
        let cancel = &self.ctx.cancel;

        match spec.format {
            OutputFormat::Png => {
                // The lossless pass always runs; lossy adds quantization on top
                transcoder
                    .optimize_png(input, output, !spec.lossless, cancel)
                    .await?;
                if !spec.lossless {
                    transcoder
                        .quantize_png(output, spec.png_quant_range(), cancel)
                        .await?;
                }
                Ok(())
            }
            OutputFormat::Jpeg => {
                transcoder
                    .encode_jpeg(input, output, spec.quality, spec.lossless, cancel)
                    .await
            }
            OutputFormat::WebP => transcoder.encode_webp(input, output, spec.quality, cancel).await,
            OutputFormat::Avif => transcoder.encode_avif(input, output, spec.quality, cancel).await,
        }
    }
}

/// Move a finished artifact to its destination and return its size
async fn publish(staged: &Path, destination: &Path) -> Result<u64> {
    if let Err(e) = tokio::fs::rename(staged, destination).await {
        debug!("rename to {} failed ({}), copying", destination.display(), e);
        tokio::fs::copy(staged, destination).await?;
        let _ = tokio::fs::remove_file(staged).await;
    }
    Ok(tokio::fs::metadata(destination).await?.len())
}
