//! In-memory `Transcoder` for tests: deterministic sizes, no external tools.

use super::Transcoder;
use crate::cancel::CancelToken;
use crate::error::{OptimizeError, Result};
use crate::size_policy::ResizeGeometry;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Operation kinds, used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Normalize,
    Strip,
    Resize,
    OptimizePng,
    QuantizePng,
    Jpeg,
    WebP,
    Avif,
}

/// What the fake was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedOp {
    Normalize { source: PathBuf },
    Strip,
    Resize { geometry: ResizeGeometry },
    OptimizePng { scale16: bool },
    QuantizePng { quality: (u8, u8) },
    Jpeg { quality: u8, lossless: bool },
    WebP { quality: u8 },
    Avif { quality: u8 },
}

pub struct FakeTranscoder {
    dimensions: (u32, u32),
    failing: HashSet<FakeOp>,
    delay: Option<Duration>,
    panic_on: Option<String>,
    ops: Mutex<Vec<RecordedOp>>,
}

impl FakeTranscoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            dimensions: (width, height),
            failing: HashSet::new(),
            delay: None,
            panic_on: None,
            ops: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, op: FakeOp) -> Self {
        self.failing.insert(op);
        self
    }

    /// Every operation waits this long (cancellable)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Panic while normalizing the source with this file name
    pub fn panicking_on(mut self, file_name: &str) -> Self {
        self.panic_on = Some(file_name.to_string());
        self
    }

    pub fn ops(&self) -> Vec<RecordedOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&RecordedOp) -> bool) -> usize {
        self.ops().iter().filter(|op| pred(op)).count()
    }

    async fn step(&self, kind: FakeOp, op: RecordedOp, cancel: &CancelToken) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(OptimizeError::Cancelled),
            }
        }
        if cancel.is_cancelled() {
            return Err(OptimizeError::Cancelled);
        }
        self.ops.lock().unwrap().push(op);
        if self.failing.contains(&kind) {
            return Err(OptimizeError::ToolFailed {
                tool: format!("{:?}", kind).to_lowercase(),
                args: vec![],
                status: Some(1),
            });
        }
        Ok(())
    }

    /// Write `input`'s length scaled by `num/den` (at least one byte) to `output`
    async fn shrink(input: &Path, output: &Path, num: u64, den: u64) -> Result<()> {
        let len = tokio::fs::metadata(input).await?.len();
        let size = (len * num / den).max(1) as usize;
        tokio::fs::write(output, vec![0x5a; size]).await?;
        Ok(())
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    fn name(&self) -> &str {
        "fake"
    }

    async fn dimensions(&self, _image: &Path) -> Result<(u32, u32)> {
        Ok(self.dimensions)
    }

    async fn normalize(&self, source: &Path, output: &Path, cancel: &CancelToken) -> Result<()> {
        let name = source.file_name().map(|n| n.to_string_lossy().into_owned());
        if name.is_some() && name == self.panic_on {
            panic!("fake transcoder asked to panic on {:?}", source);
        }
        self.step(
            FakeOp::Normalize,
            RecordedOp::Normalize { source: source.to_path_buf() },
            cancel,
        )
        .await?;
        tokio::fs::copy(source, output).await?;
        Ok(())
    }

    async fn strip_metadata(&self, _image: &Path, cancel: &CancelToken) -> Result<()> {
        self.step(FakeOp::Strip, RecordedOp::Strip, cancel).await
    }

    async fn resize(
        &self,
        input: &Path,
        output: &Path,
        geometry: ResizeGeometry,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.step(FakeOp::Resize, RecordedOp::Resize { geometry }, cancel).await?;
        Self::shrink(input, output, 1, 2).await
    }

    async fn optimize_png(
        &self,
        input: &Path,
        output: &Path,
        scale16: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.step(FakeOp::OptimizePng, RecordedOp::OptimizePng { scale16 }, cancel)
            .await?;
        Self::shrink(input, output, 3, 4).await
    }

    async fn quantize_png(&self, image: &Path, quality: (u8, u8), cancel: &CancelToken) -> Result<()> {
        self.step(FakeOp::QuantizePng, RecordedOp::QuantizePng { quality }, cancel)
            .await?;
        Self::shrink(image, image, 1, 2).await
    }

    async fn encode_jpeg(
        &self,
        input: &Path,
        output: &Path,
        quality: u8,
        lossless: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.step(FakeOp::Jpeg, RecordedOp::Jpeg { quality, lossless }, cancel)
            .await?;
        Self::shrink(input, output, 1, 3).await
    }

    async fn encode_webp(&self, input: &Path, output: &Path, quality: u8, cancel: &CancelToken) -> Result<()> {
        self.step(FakeOp::WebP, RecordedOp::WebP { quality }, cancel).await?;
        Self::shrink(input, output, 1, 4).await
    }

    async fn encode_avif(&self, input: &Path, output: &Path, quality: u8, cancel: &CancelToken) -> Result<()> {
        self.step(FakeOp::Avif, RecordedOp::Avif { quality }, cancel).await?;
        Self::shrink(input, output, 1, 5).await
    }
}
