//! # Size Policy Module
//!
//! Funzioni pure che decidono le dimensioni di destinazione di ogni livello della
//! piramide e se un ridimensionamento è necessario.
//!
//! ## Responsabilità:
//! - `validate_resize_input()`: unico punto di validazione dei valori inseriti dall'utente
//! - `should_resize()`: regola "mai ingrandire" per target in pixel o percentuale
//! - `sort_by_size()`: ordina i target dal più grande al più piccolo
//! - `normalize_request()`: deduplica e verifica l'esclusività di `Original`
//!
//! ## Chiave di ordinamento
//! Pixel e percentuali non hanno un ordine naturale comune: la chiave è il valore
//! numerico grezzo (pixel per i target in pixel, punti percentuali per le
//! percentuali). `Original` finisce sempre in fondo. A parità di chiave il target
//! in pixel precede la percentuale, poi vale l'ordine di inserimento.
//!
//! ```text
//! [256 fit, 50% fit]  ->  [256, 50%]     (256 > 50)
//! [40 fit, 50% fit]   ->  [50%, 40]      (50 > 40)
//! [50 fit, 50% fit]   ->  [50, 50%]      (pareggio: pixel prima)
//! ```

use crate::error::{OptimizeError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Pixel target used for blank or unparseable input
pub const DEFAULT_PIXEL_TARGET: u32 = 256;
pub const MIN_PIXEL_TARGET: u32 = 2;
pub const MAX_PIXEL_TARGET: u32 = 10_000;

/// How a target size maps onto the source's two axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Fit inside an NxN box, aspect ratio preserved
    #[default]
    Fit,
    /// Fill an NxN box, then center-crop to exactly NxN
    Crop,
    /// Exact width, free height
    Width,
    /// Exact height, free width
    Height,
}

impl FromStr for ResizeMode {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fit" => Ok(Self::Fit),
            "crop" => Ok(Self::Crop),
            "width" => Ok(Self::Width),
            "height" => Ok(Self::Height),
            other => Err(OptimizeError::InvalidSpec(format!("unknown resize mode: {}", other))),
        }
    }
}

impl fmt::Display for ResizeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fit => "fit",
            Self::Crop => "crop",
            Self::Width => "width",
            Self::Height => "height",
        };
        f.write_str(name)
    }
}

/// Normalized size target of one pyramid level
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeTarget {
    /// Pixel length, always within `MIN_PIXEL_TARGET..=MAX_PIXEL_TARGET`
    Pixels(u32),
    /// Percentage in `[1, 100]`, printed with two decimals unless whole
    Percent(f64),
    /// Keep the normalized source untouched
    Original,
}

impl SizeTarget {
    /// Numeric sort key; `None` sorts after every sized target.
    fn sort_key(&self) -> Option<f64> {
        match *self {
            Self::Pixels(n) => Some(n as f64),
            Self::Percent(p) if p.is_finite() => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for SizeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Pixels(n) => write!(f, "{}", n),
            Self::Percent(p) if is_whole(p) => write!(f, "{}%", p.round() as u32),
            Self::Percent(p) => write!(f, "{:.2}%", p),
            Self::Original => f.write_str("original"),
        }
    }
}

/// One requested pyramid level
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionSpec {
    pub target: SizeTarget,
    pub mode: ResizeMode,
}

impl ResolutionSpec {
    pub fn new(target: SizeTarget, mode: ResizeMode) -> Self {
        Self { target, mode }
    }

    /// The "no resize" request
    pub fn original() -> Self {
        Self::new(SizeTarget::Original, ResizeMode::Fit)
    }

    /// Parse raw user input through `validate_resize_input`
    pub fn from_input(raw: &str, mode: ResizeMode) -> Self {
        Self::new(validate_resize_input(raw), mode)
    }

    pub fn is_original(&self) -> bool {
        matches!(self.target, SizeTarget::Original)
    }

    /// Printable identifier used in output file names (`256`, `50%`, `original`)
    pub fn size_tag(&self) -> String {
        self.target.to_string()
    }

    /// Resolve this level into a concrete resize operation.
    ///
    /// Percentage targets scale both axes whatever the mode, except `Crop`, which
    /// needs an absolute box and is rejected.
    pub fn geometry(&self) -> Result<ResizeGeometry> {
        match (self.target, self.mode) {
            (SizeTarget::Pixels(n), ResizeMode::Fit) => Ok(ResizeGeometry::Fit(n)),
            (SizeTarget::Pixels(n), ResizeMode::Crop) => Ok(ResizeGeometry::Crop(n)),
            (SizeTarget::Pixels(n), ResizeMode::Width) => Ok(ResizeGeometry::Width(n)),
            (SizeTarget::Pixels(n), ResizeMode::Height) => Ok(ResizeGeometry::Height(n)),
            (SizeTarget::Percent(_), ResizeMode::Crop) => Err(OptimizeError::InvalidSpec(format!(
                "{} cannot be combined with crop mode",
                self.target
            ))),
            (SizeTarget::Percent(p), _) if p > 0.0 && p.is_finite() => Ok(ResizeGeometry::Percent(p)),
            (SizeTarget::Percent(p), _) => {
                Err(OptimizeError::InvalidSpec(format!("unsupported percentage: {}", p)))
            }
            (SizeTarget::Original, _) => Err(OptimizeError::InvalidSpec(
                "original is not a resize target".to_string(),
            )),
        }
    }
}

impl fmt::Display for ResolutionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_original() {
            f.write_str("original")
        } else {
            write!(f, "{} ({})", self.target, self.mode)
        }
    }
}

/// A concrete resize operation handed to the transcoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResizeGeometry {
    Fit(u32),
    Crop(u32),
    Width(u32),
    Height(u32),
    Percent(f64),
}

impl ResizeGeometry {
    /// Expected output dimensions for a `width`x`height` source.
    pub fn output_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let (w, h) = (width.max(1) as f64, height.max(1) as f64);
        let scaled = |v: f64| (v.round() as u32).max(1);
        match *self {
            Self::Fit(n) => {
                let scale = n as f64 / w.max(h);
                (scaled(w * scale), scaled(h * scale))
            }
            Self::Crop(n) => (n, n),
            Self::Width(n) => (n, scaled(h * n as f64 / w)),
            Self::Height(n) => (scaled(w * n as f64 / h), n),
            Self::Percent(p) => percent_dimensions(width, height, p),
        }
    }
}

fn percent_dimensions(width: u32, height: u32, pct: f64) -> (u32, u32) {
    let new_w = (width as f64 * pct / 100.0).floor() as u32;
    let new_h = (height as f64 * pct / 100.0).floor() as u32;
    (new_w, new_h)
}

fn clamp_percent(pct: f64) -> f64 {
    pct.clamp(1.0, 100.0)
}

/// Whole up to float noise, so `0.3 * 100` still prints as `30%`
fn is_whole(value: f64) -> bool {
    (value - value.round()).abs() < 1e-9
}

/// Normalize one raw size value.
///
/// Never fails: blank or unparseable input becomes the default pixel target.
/// - `"N%"`: clamped to `[1, 100]` (an unparseable number before `%` means 100%)
/// - a bare value strictly between 0 and 1 is a fraction (`0.3` -> `30%`)
/// - anything else numeric is rounded and clamped to `[2, 10000]` pixels
pub fn validate_resize_input(raw: &str) -> SizeTarget {
    let val: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    if val.is_empty() {
        return SizeTarget::Pixels(DEFAULT_PIXEL_TARGET);
    }

    if let Some(pct) = val.strip_suffix('%') {
        let pct = pct
            .parse::<f64>()
            .ok()
            .filter(|p| !p.is_nan())
            .unwrap_or(100.0);
        return SizeTarget::Percent(clamp_percent(pct));
    }

    match val.parse::<f64>() {
        Ok(v) if v > 0.0 && v < 1.0 => SizeTarget::Percent(clamp_percent(v * 100.0)),
        Ok(v) if v.is_finite() => {
            let n = v
                .round_ties_even()
                .clamp(MIN_PIXEL_TARGET as f64, MAX_PIXEL_TARGET as f64);
            SizeTarget::Pixels(n as u32)
        }
        _ => SizeTarget::Pixels(DEFAULT_PIXEL_TARGET),
    }
}

/// Whether producing `target` from a `width`x`height` image is a real downscale.
///
/// Pixel targets at or above the short edge, and percentages that would not shrink
/// both axes, are skipped.
pub fn should_resize(width: u32, height: u32, target: &SizeTarget) -> bool {
    match *target {
        SizeTarget::Pixels(n) => n < width.min(height),
        SizeTarget::Percent(p) => {
            if !(p > 0.0 && p.is_finite()) {
                return false;
            }
            let (new_w, new_h) = percent_dimensions(width, height, p);
            new_w < width && new_h < height
        }
        SizeTarget::Original => false,
    }
}

fn compare_specs(a: &ResolutionSpec, b: &ResolutionSpec) -> Ordering {
    match (a.target.sort_key(), b.target.sort_key()) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(ka), Some(kb)) => kb.partial_cmp(&ka).unwrap_or(Ordering::Equal).then_with(|| {
            let rank = |t: &SizeTarget| match t {
                SizeTarget::Pixels(_) => 0,
                _ => 1,
            };
            rank(&a.target).cmp(&rank(&b.target))
        }),
    }
}

/// Order specs largest-first by their raw numeric size, `Original` last.
pub fn sort_by_size(specs: &[ResolutionSpec]) -> Vec<ResolutionSpec> {
    let mut sorted = specs.to_vec();
    sorted.sort_by(compare_specs);
    sorted
}

/// Turn the requested specs into the list every job receives.
///
/// A request is either exactly `[Original]` or a non-empty set of sized specs;
/// duplicate size tags keep their first occurrence.
pub fn normalize_request(specs: Vec<ResolutionSpec>) -> Result<Vec<ResolutionSpec>> {
    if specs.is_empty() {
        return Err(OptimizeError::Validation(
            "at least one resolution is required".to_string(),
        ));
    }

    if specs.iter().any(ResolutionSpec::is_original) {
        if specs.len() != 1 {
            return Err(OptimizeError::Validation(
                "original cannot be combined with other resolutions".to_string(),
            ));
        }
        return Ok(specs);
    }

    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(specs.len());
    for spec in specs {
        if spec.mode == ResizeMode::Crop && matches!(spec.target, SizeTarget::Percent(_)) {
            return Err(OptimizeError::Validation(format!(
                "{}: crop mode needs a pixel size",
                spec.size_tag()
            )));
        }
        if seen.insert(spec.size_tag()) {
            unique.push(spec);
        }
    }

    Ok(sort_by_size(&unique))
}
