//! # Batch Scheduler
//!
//! Orchestratore del batch: discovery, partizione del lavoro, aggregazione.
//!
//! ## Flusso:
//! 1. Crea la directory di output
//! 2. Espande le sorgenti in una lista di immagini
//! 3. Crea `_tmp*/thread_{i}` nella directory di output, una per worker
//! 4. Assegna i job round-robin (`indice % N`) a esattamente N worker
//! 5. Raccoglie i risultati in ordine di completamento ed emette gli eventi
//! 6. Rimuove le directory di lavoro ed emette un solo evento terminale
//!
//! La partizione è statica: un worker non ruba lavoro agli altri, quindi le sue
//! directory di lavoro non sono mai condivise.

use crate::cancel::CancelToken;
use crate::config::BatchSettings;
use crate::discovery::discover_images;
use crate::error::{OptimizeError, Result};
use crate::job::{run_image_job, ImageJobRequest, JobContext};
use crate::overwrite::{ConflictResolver, OverwritePolicy};
use crate::progress::ProgressEvent;
use crate::stats::{format_size, BatchStats, ImageJobResult, StatsAggregator};
use crate::transcoder::Transcoder;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Final figures of a batch that ran to completion (or was cancelled)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub stats: BatchStats,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

/// One exclusively-owned working directory per worker, removed as a whole
struct ScratchArena {
    root: TempDir,
    slots: Vec<PathBuf>,
}

impl ScratchArena {
    fn create(parent: &Path, workers: usize) -> Result<Self> {
        let root = tempfile::Builder::new()
            .prefix("_tmp")
            .tempdir_in(parent)
            .map_err(|e| OptimizeError::Scratch(format!("cannot create in {}: {}", parent.display(), e)))?;

        let mut slots = Vec::with_capacity(workers);
        for i in 0..workers {
            let slot = root.path().join(format!("thread_{}", i));
            std::fs::create_dir_all(&slot)
                .map_err(|e| OptimizeError::Scratch(format!("{}: {}", slot.display(), e)))?;
            slots.push(slot);
        }

        debug!("Scratch arena at {} ({} slots)", root.path().display(), workers);
        Ok(Self { root, slots })
    }

    fn slot(&self, worker: usize) -> &Path {
        &self.slots[worker]
    }

    fn close(self) -> Result<()> {
        let path = self.root.path().to_path_buf();
        self.root
            .close()
            .map_err(|e| OptimizeError::Scratch(format!("cannot remove {}: {}", path.display(), e)))
    }
}

/// Running totals of the result loop
struct Tally {
    aggregator: StatsAggregator,
    completed: usize,
    total: usize,
    cancelled: bool,
}

pub struct BatchScheduler {
    transcoder: Arc<dyn Transcoder>,
    resolver: Arc<dyn ConflictResolver>,
    events: mpsc::UnboundedSender<ProgressEvent>,
    cancel: CancelToken,
}

impl BatchScheduler {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        resolver: Arc<dyn ConflictResolver>,
        events: mpsc::UnboundedSender<ProgressEvent>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            transcoder,
            resolver,
            events,
            cancel,
        }
    }

    fn emit(&self, event: ProgressEvent) {
        // A closed receiver only means nobody is listening anymore
        let _ = self.events.send(event);
    }

    /// Run one batch. Emits exactly one terminal event, `Finished` or `Error`.
    pub async fn run(&self, settings: &BatchSettings) -> Result<BatchOutcome> {
        let start_time = Instant::now();

        match self.execute(settings).await {
            Ok(outcome) => {
                info!(
                    "Batch finished in {:.1}s: {} ({} errors{})",
                    start_time.elapsed().as_secs_f64(),
                    outcome.stats.format_summary(),
                    outcome.errors.len(),
                    if outcome.cancelled { ", cancelled" } else { "" }
                );
                self.emit(ProgressEvent::Finished {
                    stats: outcome.stats,
                    errors: outcome.errors.clone(),
                    cancelled: outcome.cancelled,
                });
                Ok(outcome)
            }
            Err(e) => {
                error!("Batch aborted: {}", e);
                self.emit(ProgressEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn execute(&self, settings: &BatchSettings) -> Result<BatchOutcome> {
        let plan = Arc::new(settings.plan.clone());

        tokio::fs::create_dir_all(&plan.output_dir)
            .await
            .map_err(|e| OptimizeError::OutputDir(plan.output_dir.clone(), e.to_string()))?;

        self.emit(ProgressEvent::status("Gathering image files..."));
        let sources = settings.sources.clone();
        let recursive = settings.recursive;
        let files = tokio::task::spawn_blocking(move || discover_images(&sources, recursive))
            .await
            .map_err(|e| OptimizeError::Worker(e.to_string()))??;

        if files.is_empty() {
            self.emit(ProgressEvent::status("No image files found"));
            return Ok(BatchOutcome {
                cancelled: self.cancel.is_cancelled(),
                ..Default::default()
            });
        }

        let total = files.len();
        let workers = settings.workers.max(1);
        info!("Found {} images, {} workers", total, workers);
        self.emit(ProgressEvent::status(format!(
            "Found {} images. Starting multi-threaded processing...",
            total
        )));

        let arena = ScratchArena::create(&plan.output_dir, workers)?;

        let ctx = JobContext {
            transcoder: self.transcoder.clone(),
            overwrite: Arc::new(OverwritePolicy::new(settings.overwrite)),
            resolver: self.resolver.clone(),
            cancel: self.cancel.clone(),
        };

        let mut buckets: Vec<Vec<ImageJobRequest>> = (0..workers).map(|_| Vec::new()).collect();
        for (index, source) in files.into_iter().enumerate() {
            buckets[index % workers].push(ImageJobRequest {
                index,
                source,
                plan: plan.clone(),
            });
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ImageJobResult>();
        let handles: Vec<_> = buckets
            .into_iter()
            .enumerate()
            .map(|(worker, bucket)| {
                let ctx = ctx.clone();
                let tx = tx.clone();
                let scratch = arena.slot(worker).to_path_buf();
                tokio::spawn(async move {
                    for request in bucket {
                        if ctx.cancel.is_cancelled() {
                            debug!("Worker {} stopping: cancelled", worker);
                            break;
                        }
                        let result = run_image_job(&request, &scratch, &ctx).await;
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(tx);

        let mut tally = Tally {
            aggregator: StatsAggregator::new(),
            completed: 0,
            total,
            cancelled: false,
        };
        let mut workers: FuturesUnordered<_> = handles.into_iter().collect();
        let mut results_open = true;
        let mut worker_failure = None;

        loop {
            tokio::select! {
                received = rx.recv(), if results_open => match received {
                    Some(result) => self.report(&mut tally, result).await,
                    None => results_open = false,
                },
                Some(joined) = workers.next() => {
                    if let Err(e) = joined {
                        error!("Worker failed, stopping dispatch: {}", e);
                        // Running steps are killed, queued jobs never start
                        self.cancel.cancel();
                        worker_failure.get_or_insert_with(|| OptimizeError::Worker(e.to_string()));
                    }
                }
                else => break,
            }
        }

        if let Err(e) = arena.close() {
            warn!("Scratch cleanup failed: {}", e);
        }
        if let Some(e) = worker_failure {
            return Err(e);
        }

        let aggregator = tally.aggregator;
        Ok(BatchOutcome {
            stats: aggregator.snapshot().await,
            errors: aggregator.errors().await,
            cancelled: tally.cancelled || self.cancel.is_cancelled(),
        })
    }

    /// Fold one finished job into the totals and publish the events
    async fn report(&self, tally: &mut Tally, result: ImageJobResult) {
        tally.cancelled |= result.cancelled;
        if result.cancelled && result.outputs.is_empty() && result.errors.is_empty() {
            return;
        }

        tally.completed += 1;
        let stats = tally.aggregator.record(&result).await;
        let name = result
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!(
            "{} ({}/{}): {} -> {}",
            name,
            tally.completed,
            tally.total,
            format_size(result.bytes_in),
            format_size(result.bytes_out)
        );
        self.emit(ProgressEvent::progress(tally.completed, tally.total));
        self.emit(ProgressEvent::status(format!(
            "Processed: {} ({}/{})",
            name, tally.completed, tally.total
        )));
        self.emit(ProgressEvent::Stats { stats });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{FormatSpec, OutputFormat};
    use crate::job::JobPlan;
    use crate::overwrite::{ConflictDecision, FixedResolver, PolicyState};
    use crate::size_policy::{ResizeMode, ResolutionSpec};
    use crate::transcoder::fake::{FakeOp, FakeTranscoder};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Batch {
        _dir: TempDir,
        input: PathBuf,
        output: PathBuf,
    }

    fn batch_dirs() -> Batch {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        Batch {
            _dir: dir,
            input,
            output,
        }
    }

    fn write_sources(dir: &Path, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.join(format!("img_{}.png", i));
                std::fs::write(&path, vec![7u8; 1000 + i * 250]).unwrap();
                path
            })
            .collect()
    }

    fn settings(batch: &Batch, workers: usize, formats: Vec<FormatSpec>, overwrite: PolicyState) -> BatchSettings {
        BatchSettings {
            sources: vec![batch.input.clone()],
            recursive: false,
            workers,
            plan: JobPlan {
                resolutions: vec![ResolutionSpec::from_input("500", ResizeMode::Fit)],
                formats,
                strip_metadata: false,
                output_dir: batch.output.clone(),
            },
            overwrite,
            hardware_acceleration: false,
            step_timeout: Duration::from_secs(5),
            tools_dir: None,
        }
    }

    fn webp() -> Vec<FormatSpec> {
        vec![FormatSpec::new(OutputFormat::WebP)]
    }

    async fn run_batch(
        transcoder: Arc<dyn Transcoder>,
        resolver: Arc<dyn ConflictResolver>,
        settings: &BatchSettings,
    ) -> (Result<BatchOutcome>, Vec<ProgressEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = BatchScheduler::new(transcoder, resolver, tx, CancelToken::new());
        let outcome = scheduler.run(settings).await;
        drop(scheduler);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    fn skip_resolver() -> Arc<dyn ConflictResolver> {
        Arc::new(FixedResolver::new(ConflictDecision::Skip))
    }

    fn scratch_leftovers(output: &Path) -> usize {
        std::fs::read_dir(output)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("_tmp"))
            .count()
    }

    #[tokio::test]
    async fn test_end_to_end_single_image() {
        let batch = batch_dirs();
        let source = batch.input.join("name.png");
        image::RgbImage::from_pixel(1000, 1000, image::Rgb([200, 40, 90]))
            .save(&source)
            .unwrap();
        let source_size = std::fs::metadata(&source).unwrap().len();

        let mut settings = settings(
            &batch,
            1,
            vec![
                FormatSpec::new(OutputFormat::Png).with_lossless(true),
                FormatSpec::new(OutputFormat::WebP).with_quality(80),
            ],
            PolicyState::Ask,
        );
        settings.plan.strip_metadata = true;

        let fake = Arc::new(FakeTranscoder::new(1000, 1000));
        let (outcome, _) = run_batch(fake, skip_resolver(), &settings).await;
        let outcome = outcome.unwrap();

        assert_eq!(outcome.stats.files_processed, 1);
        assert!(outcome.errors.is_empty());
        assert!(!outcome.cancelled);

        let mut produced: Vec<String> = std::fs::read_dir(&batch.output)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        produced.sort();
        assert_eq!(produced, vec!["name_500.png", "name_500.webp"]);
        for name in &produced {
            assert!(std::fs::metadata(batch.output.join(name)).unwrap().len() <= source_size);
        }
    }

    #[tokio::test]
    async fn test_second_run_with_skip_all_writes_nothing() {
        let batch = batch_dirs();
        write_sources(&batch.input, 3);
        let settings = settings(&batch, 2, webp(), PolicyState::Ask);

        let fake = Arc::new(FakeTranscoder::new(800, 600));
        let (first, _) = run_batch(fake.clone(), skip_resolver(), &settings).await;
        assert_eq!(first.unwrap().stats.files_written, 3);
        let before: Vec<Vec<u8>> = (0..3)
            .map(|i| std::fs::read(batch.output.join(format!("img_{}_500.webp", i))).unwrap())
            .collect();

        let resolver = Arc::new(FixedResolver::new(ConflictDecision::SkipAll));
        let (second, _) = run_batch(fake, resolver.clone(), &settings).await;
        let second = second.unwrap();

        assert_eq!(resolver.calls(), 1);
        assert_eq!(second.stats.files_written, 0);
        assert_eq!(second.stats.total_optimized_bytes, 0);
        assert!(second.errors.is_empty());
        for (i, bytes) in before.iter().enumerate() {
            let after = std::fs::read(batch.output.join(format!("img_{}_500.webp", i))).unwrap();
            assert_eq!(&after, bytes);
        }
    }

    #[tokio::test]
    async fn test_totals_do_not_depend_on_worker_count() {
        let mut totals = Vec::new();
        for workers in [1, 4] {
            let batch = batch_dirs();
            write_sources(&batch.input, 7);
            let settings = settings(&batch, workers, webp(), PolicyState::AlwaysOverwrite);
            let fake = Arc::new(FakeTranscoder::new(800, 600));
            let (outcome, _) = run_batch(fake, skip_resolver(), &settings).await;
            totals.push(outcome.unwrap().stats);
        }

        assert_eq!(totals[0], totals[1]);
        assert_eq!(totals[0].files_processed, 7);
        assert_eq!(totals[0].total_source_bytes, (0..7).map(|i| 1000 + i * 250).sum::<u64>());
    }

    #[tokio::test]
    async fn test_zero_files_finishes_without_scratch() {
        let batch = batch_dirs();
        let settings = settings(&batch, 3, webp(), PolicyState::Ask);
        let fake = Arc::new(FakeTranscoder::new(800, 600));

        let (outcome, events) = run_batch(fake.clone(), skip_resolver(), &settings).await;
        assert_eq!(outcome.unwrap(), BatchOutcome::default());
        assert!(fake.ops().is_empty());
        assert_eq!(scratch_leftovers(&batch.output), 0);
        assert_eq!(
            events,
            vec![
                ProgressEvent::status("Gathering image files..."),
                ProgressEvent::status("No image files found"),
                ProgressEvent::Finished {
                    stats: BatchStats::default(),
                    errors: vec![],
                    cancelled: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_scratch_is_removed_after_batch() {
        let batch = batch_dirs();
        write_sources(&batch.input, 5);
        let settings = settings(&batch, 3, webp(), PolicyState::Ask);
        let fake = Arc::new(FakeTranscoder::new(800, 600));

        let (outcome, _) = run_batch(fake, skip_resolver(), &settings).await;
        assert!(outcome.is_ok());
        assert_eq!(scratch_leftovers(&batch.output), 0);
    }

    #[tokio::test]
    async fn test_job_errors_are_collected_not_fatal() {
        let batch = batch_dirs();
        write_sources(&batch.input, 2);
        let settings = settings(
            &batch,
            2,
            vec![FormatSpec::new(OutputFormat::Avif), FormatSpec::new(OutputFormat::WebP)],
            PolicyState::Ask,
        );
        let fake = Arc::new(FakeTranscoder::new(800, 600).failing(FakeOp::Avif));

        let (outcome, events) = run_batch(fake, skip_resolver(), &settings).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors.iter().all(|e| e.starts_with("AVIF: ")));
        assert_eq!(outcome.stats.files_written, 2);
        assert_eq!(outcome.stats.errors, 2);
        assert!(matches!(events.last(), Some(ProgressEvent::Finished { errors, .. }) if errors.len() == 2));
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_event() {
        let batch = batch_dirs();
        write_sources(&batch.input, 4);
        let settings = settings(&batch, 2, webp(), PolicyState::Ask);
        let fake = Arc::new(FakeTranscoder::new(800, 600));

        let (_, events) = run_batch(fake, skip_resolver(), &settings).await;
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_progress_counts_completions() {
        let batch = batch_dirs();
        write_sources(&batch.input, 6);
        let settings = settings(&batch, 4, webp(), PolicyState::Ask);
        let fake = Arc::new(FakeTranscoder::new(800, 600));

        let (_, events) = run_batch(fake, skip_resolver(), &settings).await;
        let progress: Vec<(usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress { current, total, .. } => Some((*current, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, (1..=6).map(|i| (i, 6)).collect::<Vec<_>>());

        let stats: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Stats { stats } => Some(stats.files_processed),
                _ => None,
            })
            .collect();
        assert_eq!(stats, (1..=6).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unusable_output_dir_is_batch_fatal() {
        let batch = batch_dirs();
        write_sources(&batch.input, 1);
        // A regular file where the output directory should be
        std::fs::write(&batch.output, b"not a dir").unwrap();
        let settings = settings(&batch, 1, webp(), PolicyState::Ask);
        let fake = Arc::new(FakeTranscoder::new(800, 600));

        let (outcome, events) = run_batch(fake, skip_resolver(), &settings).await;
        let err = outcome.unwrap_err();
        assert!(err.is_batch_fatal());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProgressEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch_and_cleans_up() {
        let batch = batch_dirs();
        write_sources(&batch.input, 5);
        let settings = settings(&batch, 1, webp(), PolicyState::Ask);
        let fake = Arc::new(FakeTranscoder::new(800, 600).with_delay(Duration::from_millis(100)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let scheduler = BatchScheduler::new(fake, skip_resolver(), tx, cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let outcome = scheduler.run(&settings).await.unwrap();
        drop(scheduler);

        assert!(outcome.cancelled);
        assert!(outcome.stats.files_processed < 5);
        assert_eq!(scratch_leftovers(&batch.output), 0);

        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        assert!(matches!(last, Some(ProgressEvent::Finished { cancelled: true, .. })));
    }

    #[tokio::test]
    async fn test_worker_panic_cancels_the_other_workers() {
        let batch = batch_dirs();
        write_sources(&batch.input, 6);
        let settings = settings(&batch, 2, webp(), PolicyState::Ask);
        let fake = Arc::new(
            FakeTranscoder::new(800, 600)
                .with_delay(Duration::from_millis(100))
                .panicking_on("img_0.png"),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let scheduler = BatchScheduler::new(fake, skip_resolver(), tx, cancel.clone());

        let err = scheduler.run(&settings).await.unwrap_err();
        drop(scheduler);

        assert!(matches!(err, OptimizeError::Worker(_)));
        assert!(err.is_batch_fatal());
        assert!(cancel.is_cancelled());
        // The healthy worker stops instead of draining its queue
        assert!(!batch.output.join("img_5_500.webp").exists());
        assert_eq!(scratch_leftovers(&batch.output), 0);

        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        assert!(matches!(last, Some(ProgressEvent::Error { .. })));
    }
}
