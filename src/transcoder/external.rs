//! # External Transcoder
//!
//! Implementazione di produzione del trait `Transcoder`: ogni operazione
//! costruisce una riga di comando e la esegue con `ToolInvocation`.
//!
//! | Operazione | Tool | Argomenti |
//! |------------|------|-----------|
//! | normalize | magick | `in out.png` (copia se già PNG) |
//! | strip | exiftool | `-all= -overwrite_original file` |
//! | resize | magick | `in -colorspace RGB -filter RobidouxSharp -resize G [...] -colorspace sRGB out` |
//! | PNG | oxipng | `--opt max --zopfli --force --out out in --timeout 30 --interlace 0 [--scale16]` |
//! | PNG lossy | pngquant | `--quality lo-hi --speed 1 --output f --force f` |
//! | JPEG | cjpegli | `in out (--distance 1.0 \| --quality Q)` |
//! | WebP | cwebp | `-q Q in -o out` |
//! | AVIF | avifenc | `-q Q --speed 2 in out` |
//!
//! Il ridimensionamento passa per lo spazio colore lineare (`-colorspace RGB`)
//! e torna in sRGB dopo il resampling.

use super::command::{ensure_non_empty, ToolInvocation};
use super::Transcoder;
use crate::args;
use crate::cancel::CancelToken;
use crate::error::{OptimizeError, Result};
use crate::size_policy::{ResizeGeometry, SizeTarget};
use crate::tools::{self, ToolResolver};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Fixed distance handed to cjpegli for lossless JPEG
pub const JPEG_LOSSLESS_DISTANCE: &str = "1.0";

const ACCELERATE_DEFINE: [&str; 2] = ["-define", "accelerate:auto-threshold=1"];

/// `Transcoder` backed by command-line tools
pub struct ExternalTranscoder {
    resolver: ToolResolver,
    step_timeout: Duration,
    accelerate: bool,
}

impl ExternalTranscoder {
    pub fn new(resolver: ToolResolver, step_timeout: Duration) -> Self {
        Self {
            resolver,
            step_timeout,
            accelerate: false,
        }
    }

    /// Enable the OpenCL hint for magick when requested and available.
    ///
    /// Without OpenCL support the request is dropped.
    pub async fn with_acceleration(mut self, requested: bool) -> Self {
        if !requested {
            return self;
        }
        let accel = tools::detect_acceleration(&self.resolver).await;
        self.accelerate = accel.opencl;
        if !accel.opencl {
            debug!("Hardware acceleration requested but ImageMagick reports no OpenCL; ignoring");
        }
        self
    }

    pub fn accelerated(&self) -> bool {
        self.accelerate
    }

    fn invocation(&self, tool: &str, args: Vec<String>) -> ToolInvocation {
        ToolInvocation::new(tool, self.resolver.program(tool), args)
    }

    /// magick invocation, with the acceleration define right after the program
    fn magick(&self, args: Vec<String>) -> ToolInvocation {
        let args = if self.accelerate {
            ACCELERATE_DEFINE
                .iter()
                .map(|s| s.to_string())
                .chain(args)
                .collect()
        } else {
            args
        };
        self.invocation(tools::MAGICK, args)
    }

    async fn run(&self, invocation: ToolInvocation, cancel: &CancelToken) -> Result<()> {
        invocation.run(self.step_timeout, cancel).await
    }
}

pub fn normalize_args(source: &Path, output: &Path) -> Vec<String> {
    args![source.display(), output.display()]
}

pub fn strip_args(image: &Path) -> Vec<String> {
    args!["-all=", "-overwrite_original", image.display()]
}

/// magick geometry string for a resize
pub fn geometry_arg(geometry: ResizeGeometry) -> String {
    match geometry {
        ResizeGeometry::Fit(n) => format!("{}x{}", n, n),
        ResizeGeometry::Crop(n) => format!("{}x{}^", n, n),
        ResizeGeometry::Width(n) => format!("{}x", n),
        ResizeGeometry::Height(n) => format!("x{}", n),
        // Same printable form as the size tag
        ResizeGeometry::Percent(p) => SizeTarget::Percent(p).to_string(),
    }
}

pub fn resize_args(input: &Path, output: &Path, geometry: ResizeGeometry) -> Vec<String> {
    let mut args = args![
        input.display(),
        "-colorspace",
        "RGB",
        "-filter",
        "RobidouxSharp",
        "-resize",
        geometry_arg(geometry),
    ];
    if let ResizeGeometry::Crop(n) = geometry {
        args.extend(args!["-gravity", "center", "-extent", format!("{}x{}", n, n)]);
    }
    args.extend(args!["-colorspace", "sRGB", output.display()]);
    args
}

pub fn oxipng_args(input: &Path, output: &Path, scale16: bool) -> Vec<String> {
    let mut args = args![
        "--opt",
        "max",
        "--zopfli",
        "--force",
        "--out",
        output.display(),
        input.display(),
        "--timeout",
        30,
        "--interlace",
        0,
    ];
    if scale16 {
        args.push("--scale16".to_string());
    }
    args
}

pub fn pngquant_args(image: &Path, (low, high): (u8, u8)) -> Vec<String> {
    args![
        "--quality",
        format!("{}-{}", low, high),
        "--speed",
        1,
        "--output",
        image.display(),
        "--force",
        image.display(),
    ]
}

pub fn cjpegli_args(input: &Path, output: &Path, quality: u8, lossless: bool) -> Vec<String> {
    let mut args = args![input.display(), output.display()];
    if lossless {
        args.extend(args!["--distance", JPEG_LOSSLESS_DISTANCE]);
    } else {
        args.extend(args!["--quality", quality]);
    }
    args
}

pub fn cwebp_args(input: &Path, output: &Path, quality: u8) -> Vec<String> {
    args!["-q", quality, input.display(), "-o", output.display()]
}

pub fn avifenc_args(input: &Path, output: &Path, quality: u8) -> Vec<String> {
    args!["-q", quality, "--speed", 2, input.display(), output.display()]
}

fn is_png(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("png"))
        .unwrap_or(false)
}

#[async_trait]
impl Transcoder for ExternalTranscoder {
    fn name(&self) -> &str {
        "external"
    }

    async fn dimensions(&self, image: &Path) -> Result<(u32, u32)> {
        let path: PathBuf = image.to_path_buf();
        tokio::task::spawn_blocking(move || image::image_dimensions(&path))
            .await
            .map_err(|e| OptimizeError::Worker(e.to_string()))?
            .map_err(OptimizeError::from)
    }

    async fn normalize(&self, source: &Path, output: &Path, cancel: &CancelToken) -> Result<()> {
        if is_png(source) {
            tokio::fs::copy(source, output).await?;
            return ensure_non_empty(output).await;
        }
        let invocation = self.magick(normalize_args(source, output)).expecting(output);
        self.run(invocation, cancel).await
    }

    async fn strip_metadata(&self, image: &Path, cancel: &CancelToken) -> Result<()> {
        let invocation = self
            .invocation(tools::EXIFTOOL, strip_args(image))
            .expecting(image);
        self.run(invocation, cancel).await
    }

    async fn resize(
        &self,
        input: &Path,
        output: &Path,
        geometry: ResizeGeometry,
        cancel: &CancelToken,
    ) -> Result<()> {
        let invocation = self.magick(resize_args(input, output, geometry)).expecting(output);
        self.run(invocation, cancel).await
    }

    async fn optimize_png(
        &self,
        input: &Path,
        output: &Path,
        scale16: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        let invocation = self
            .invocation(tools::OXIPNG, oxipng_args(input, output, scale16))
            .expecting(output);
        self.run(invocation, cancel).await
    }

    async fn quantize_png(&self, image: &Path, quality: (u8, u8), cancel: &CancelToken) -> Result<()> {
        let invocation = self
            .invocation(tools::PNGQUANT, pngquant_args(image, quality))
            .expecting(image);
        self.run(invocation, cancel).await
    }

    async fn encode_jpeg(
        &self,
        input: &Path,
        output: &Path,
        quality: u8,
        lossless: bool,
        cancel: &CancelToken,
    ) -> Result<()> {
        let invocation = self
            .invocation(tools::CJPEGLI, cjpegli_args(input, output, quality, lossless))
            .expecting(output);
        self.run(invocation, cancel).await
    }

    async fn encode_webp(&self, input: &Path, output: &Path, quality: u8, cancel: &CancelToken) -> Result<()> {
        let invocation = self
            .invocation(tools::CWEBP, cwebp_args(input, output, quality))
            .expecting(output);
        self.run(invocation, cancel).await
    }

    async fn encode_avif(&self, input: &Path, output: &Path, quality: u8, cancel: &CancelToken) -> Result<()> {
        let invocation = self
            .invocation(tools::AVIFENC, avifenc_args(input, output, quality))
            .expecting(output);
        self.run(invocation, cancel).await
    }
}
