//! # Transcoder Module
//!
//! Interfaccia verso le operazioni opache sulle immagini: normalizzazione,
//! rimozione metadata, ridimensionamento ed encode per formato.
//!
//! ## Implementazioni:
//! - `ExternalTranscoder`: lancia i tool esterni (magick, exiftool, oxipng,
//!   pngquant, cjpegli, cwebp, avifenc)
//! - `fake::FakeTranscoder` (solo test): scrive byte deterministici e registra
//!   ogni operazione
//!
//! Ogni operazione è "file in, file out": successo significa che l'output
//! dichiarato esiste e non è vuoto.

pub mod command;
pub mod external;

#[cfg(test)]
pub mod fake;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::size_policy::ResizeGeometry;
use async_trait::async_trait;
use std::path::Path;

pub use external::ExternalTranscoder;

/// Image operations used by the job pipeline
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Pixel dimensions of a normalized (PNG) image
    async fn dimensions(&self, image: &Path) -> Result<(u32, u32)>;

    /// Convert `source` into a PNG at `output`
    async fn normalize(&self, source: &Path, output: &Path, cancel: &CancelToken) -> Result<()>;

    /// Remove all metadata from `image` in place
    async fn strip_metadata(&self, image: &Path, cancel: &CancelToken) -> Result<()>;

    async fn resize(
        &self,
        input: &Path,
        output: &Path,
        geometry: ResizeGeometry,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Lossless PNG optimization pass. `scale16` prepares the file for a lossy pass.
    async fn optimize_png(
        &self,
        input: &Path,
        output: &Path,
        scale16: bool,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Lossy palette quantization of `image` in place, within `quality` (low, high)
    async fn quantize_png(&self, image: &Path, quality: (u8, u8), cancel: &CancelToken) -> Result<()>;

    async fn encode_jpeg(
        &self,
        input: &Path,
        output: &Path,
        quality: u8,
        lossless: bool,
        cancel: &CancelToken,
    ) -> Result<()>;

    async fn encode_webp(&self, input: &Path, output: &Path, quality: u8, cancel: &CancelToken) -> Result<()>;

    async fn encode_avif(&self, input: &Path, output: &Path, quality: u8, cancel: &CancelToken) -> Result<()>;
}
