//! Output formats and their per-format encode settings.
//!
//! The set is closed (PNG, JPEG, WebP, AVIF); the job dispatches on
//! [`OutputFormat`] with a plain `match`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "PNG", alias = "png")]
    Png,
    #[serde(rename = "JPEG", alias = "jpeg", alias = "jpg")]
    Jpeg,
    #[serde(rename = "WebP", alias = "webp")]
    WebP,
    #[serde(rename = "AVIF", alias = "avif")]
    Avif,
}

impl OutputFormat {
    /// File extension written for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
            Self::Avif => "avif",
        }
    }

    pub fn default_quality(&self) -> u8 {
        match self {
            Self::Avif => 65,
            _ => 82,
        }
    }

    /// Lossless is only meaningful for PNG and JPEG
    pub fn supports_lossless(&self) -> bool {
        matches!(self, Self::Png | Self::Jpeg)
    }

    pub fn default_lossless(&self) -> bool {
        matches!(self, Self::Png)
    }

    pub fn quality_range(&self) -> RangeInclusive<u8> {
        match self {
            // pngquant and cjpegli reject 0
            Self::Png | Self::Jpeg => 1..=100,
            Self::WebP | Self::Avif => 0..=100,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Png => "PNG",
            Self::Jpeg => "JPEG",
            Self::WebP => "WebP",
            Self::Avif => "AVIF",
        };
        f.write_str(name)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::WebP),
            "avif" => Ok(Self::Avif),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

/// One requested output format with its encode parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatSpec {
    pub format: OutputFormat,
    pub quality: u8,
    /// Ignored for WebP and AVIF
    pub lossless: bool,
}

impl FormatSpec {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            quality: format.default_quality(),
            lossless: format.default_lossless(),
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_lossless(mut self, lossless: bool) -> Self {
        self.lossless = lossless && self.format.supports_lossless();
        self
    }

    /// pngquant `--quality` range for lossy PNG: `[max(q-15, 50), q]`
    pub fn png_quant_range(&self) -> (u8, u8) {
        let low = self.quality.saturating_sub(15).max(50).min(self.quality);
        (low, self.quality)
    }
}
