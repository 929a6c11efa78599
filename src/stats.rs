//! # Statistics Module
//!
//! Questo modulo traccia i byte originali e ottimizzati prodotti dal batch.
//!
//! ## Componenti principali:
//! - `ImageJobResult`: risultato di un singolo job (un'immagine)
//! - `BatchStats`: snapshot aggregato (solo addizioni, mai sottrazioni)
//! - `StatsAggregator`: accumulo thread-safe condiviso fra i worker
//!
//! ## Contabilità:
//! La dimensione originale viene conteggiata una volta per ogni file prodotto,
//! non una volta per immagine: `total_original_bytes` è quindi confrontabile con
//! i report esistenti. `total_source_bytes` conteggia ogni sorgente una sola volta.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of one image job. Produced exactly once per request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageJobResult {
    pub source: PathBuf,
    /// Size of the source file, charged once
    pub source_bytes: u64,
    /// Source size charged once per produced output
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub outputs: Vec<PathBuf>,
    /// Outputs left untouched by the overwrite policy
    pub skipped: usize,
    pub errors: Vec<String>,
    /// Stopped early by cancellation
    pub cancelled: bool,
}

impl ImageJobResult {
    pub fn new(source: PathBuf, source_bytes: u64) -> Self {
        Self {
            source,
            source_bytes,
            ..Default::default()
        }
    }

    /// Record one successfully written output
    pub fn add_output(&mut self, path: PathBuf, optimized_size: u64) {
        self.bytes_in += self.source_bytes;
        self.bytes_out += optimized_size;
        self.outputs.push(path);
    }

    pub fn files_written(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Aggregate byte counters for a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total_original_bytes: u64,
    pub total_optimized_bytes: u64,
    pub files_processed: usize,
    pub total_source_bytes: u64,
    pub files_written: usize,
    pub errors: usize,
}

impl BatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, result: &ImageJobResult) {
        self.total_original_bytes += result.bytes_in;
        self.total_optimized_bytes += result.bytes_out;
        self.total_source_bytes += result.source_bytes;
        self.files_written += result.files_written();
        self.errors += result.errors.len();
        self.files_processed += 1;
    }

    pub fn size_saved(&self) -> u64 {
        self.total_original_bytes.saturating_sub(self.total_optimized_bytes)
    }

    /// Percentage of bytes saved, negative when outputs grew
    pub fn compression_ratio(&self) -> f64 {
        calculate_reduction(self.total_original_bytes, self.total_optimized_bytes)
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Processed: {} files | Written: {} | Original: {} | Optimized: {} | Saved: {} ({:.1}%) | Errors: {}",
            self.files_processed,
            self.files_written,
            format_size(self.total_original_bytes),
            format_size(self.total_optimized_bytes),
            format_size(self.size_saved()),
            self.compression_ratio(),
            self.errors,
        )
    }
}

#[derive(Debug, Default)]
struct Totals {
    stats: BatchStats,
    errors: Vec<String>,
}

/// Shared accumulator updated by the scheduler as jobs complete.
///
/// Each `record` is a single locked read-modify-write that returns the snapshot
/// to publish.
#[derive(Clone, Default)]
pub struct StatsAggregator {
    inner: Arc<Mutex<Totals>>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, result: &ImageJobResult) -> BatchStats {
        let mut totals = self.inner.lock().await;
        totals.stats.add_job(result);
        totals.errors.extend(result.errors.iter().cloned());
        totals.stats
    }

    pub async fn snapshot(&self) -> BatchStats {
        self.inner.lock().await.stats
    }

    pub async fn errors(&self) -> Vec<String> {
        self.inner.lock().await.errors.clone()
    }
}

/// Get human-readable file size
pub fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Calculate percentage reduction
pub fn calculate_reduction(original_size: u64, new_size: u64) -> f64 {
    if original_size == 0 {
        0.0
    } else {
        ((original_size as f64 - new_size as f64) / original_size as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(source_bytes: u64, outputs: &[u64]) -> ImageJobResult {
        let mut result = ImageJobResult::new(PathBuf::from("in.png"), source_bytes);
        for (i, size) in outputs.iter().enumerate() {
            result.add_output(PathBuf::from(format!("out_{}.webp", i)), *size);
        }
        result
    }

    #[test]
    fn test_original_size_charged_per_output() {
        let result = job(1000, &[300, 200]);
        assert_eq!(result.bytes_in, 2000);
        assert_eq!(result.bytes_out, 500);
        assert_eq!(result.files_written(), 2);

        let mut stats = BatchStats::new();
        stats.add_job(&result);
        assert_eq!(stats.total_original_bytes, 2000);
        assert_eq!(stats.total_source_bytes, 1000);
        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.size_saved(), 1500);
        assert!((stats.compression_ratio() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_growth_saturates_size_saved() {
        let mut stats = BatchStats::new();
        stats.add_job(&job(100, &[150]));
        assert_eq!(stats.size_saved(), 0);
        assert!(stats.compression_ratio() < 0.0);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[tokio::test]
    async fn test_aggregator_sums_regardless_of_order() {
        let jobs: Vec<ImageJobResult> = (1..=20u64)
            .map(|i| {
                let mut r = job(i * 100, &[i * 10, i * 20]);
                if i % 5 == 0 {
                    r.errors.push(format!("AVIF: img_{}.avif (failed)", i));
                }
                r
            })
            .collect();

        let forward = StatsAggregator::new();
        for r in &jobs {
            forward.record(r).await;
        }

        let shuffled = StatsAggregator::new();
        let mut handles = Vec::new();
        for r in jobs.iter().rev().cloned() {
            let agg = shuffled.clone();
            handles.push(tokio::spawn(async move { agg.record(&r).await }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let a = forward.snapshot().await;
        let b = shuffled.snapshot().await;
        assert_eq!(a, b);
        assert_eq!(a.files_processed, 20);
        assert_eq!(a.total_original_bytes, (1..=20u64).map(|i| i * 200).sum::<u64>());
        assert_eq!(a.total_optimized_bytes, (1..=20u64).map(|i| i * 30).sum::<u64>());
        assert_eq!(shuffled.errors().await.len(), 4);
    }
}
