//! # Discovery Module
//!
//! Espande la lista di sorgenti (file e directory) in una lista piatta di
//! immagini da elaborare.
//!
//! ## Regole:
//! - Le estensioni sono confrontate senza distinzione maiuscole/minuscole
//! - Le directory sono esplorate ricorsivamente solo se richiesto
//! - Un file passato esplicitamente viene accettato solo se ha un'estensione supportata
//! - I duplicati (stesso file raggiunto due volte) vengono rimossi, l'ordine resta stabile
//! - Sorgenti inesistenti vengono segnalate con un warning e ignorate
//! - Errori di lettura delle directory sono fatali per il batch

use crate::error::{OptimizeError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Input extensions accepted by the pipeline (lowercase)
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "jpe", "webp", "avif", "gif", "bmp", "tiff", "tif", "heic", "heif",
    "dds", "j2c", "j2k", "jp2", "jxl", "png8", "png16", "png24", "png32", "png48", "png64",
    "psd", "tga", "ico",
];

/// Check if a path has a supported image extension
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Expand `sources` into the list of images to process.
pub fn discover_images(sources: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    let mut push = |path: PathBuf| {
        let key = path.canonicalize().unwrap_or_else(|_| path.clone());
        if seen.insert(key) {
            files.push(path);
        }
    };

    for source in sources {
        if source.is_dir() {
            for path in walk_directory(source, recursive)? {
                push(path);
            }
        } else if source.is_file() {
            if is_supported_image(source) {
                push(source.clone());
            } else {
                debug!("Ignoring unsupported file: {}", source.display());
            }
        } else {
            warn!("Source not found, skipping: {}", source.display());
        }
    }

    debug!("Discovered {} image files", files.len());
    Ok(files)
}

fn walk_directory(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut walker = WalkDir::new(dir).min_depth(1).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| {
            OptimizeError::Discovery(format!("cannot read {}: {}", dir.display(), e))
        })?;
        if entry.file_type().is_file() && is_supported_image(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"img").unwrap();
    }

    #[test]
    fn test_extension_matching_is_case_insensitive() {
        assert!(is_supported_image(Path::new("a/B.PNG")));
        assert!(is_supported_image(Path::new("photo.JpEg")));
        assert!(is_supported_image(Path::new("scan.png48")));
        assert!(!is_supported_image(Path::new("notes.txt")));
        assert!(!is_supported_image(Path::new("README")));
    }

    #[test]
    fn test_directory_recursion_only_when_requested() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("top.png"));
        touch(&dir.path().join("nested/deep.JPG"));
        touch(&dir.path().join("nested/skip.txt"));

        let flat = discover_images(&[dir.path().to_path_buf()], false).unwrap();
        assert_eq!(flat, vec![dir.path().join("top.png")]);

        let deep = discover_images(&[dir.path().to_path_buf()], true).unwrap();
        assert_eq!(deep.len(), 2);
        assert!(deep.contains(&dir.path().join("nested/deep.JPG")));
    }

    #[test]
    fn test_mixed_sources_are_deduplicated() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.webp");
        let b = dir.path().join("b.tif");
        touch(&a);
        touch(&b);

        let sources = vec![a.clone(), dir.path().to_path_buf(), a.clone()];
        let files = discover_images(&sources, false).unwrap();
        assert_eq!(files, vec![a, b]);
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let dir = TempDir::new().unwrap();
        let files = discover_images(&[dir.path().join("nope.png")], true).unwrap();
        assert!(files.is_empty());
    }
}
