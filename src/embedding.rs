//! Embedding collaborator: turns an image file into a fixed-length vector.
//!
//! The engine treats extraction as opaque. [`ByteHistogramEmbedder`] is a
//! deterministic stand-in that needs no model; a real feature extractor
//! plugs in through [`Embedder`].

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{Result, RetrievalError};
use crate::vector::Vector;

/// File extensions picked up by [`scan_images`], compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Maps an image file to a vector of fixed dimension.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    /// Must return the same vector for the same file contents.
    fn extract(&self, path: &Path) -> Result<Vector>;
}

/// Histogram of the file's byte values folded into `buckets` bins.
#[derive(Debug, Clone, Copy)]
pub struct ByteHistogramEmbedder {
    buckets: usize,
}

impl ByteHistogramEmbedder {
    pub const DEFAULT_BUCKETS: usize = 64;

    pub fn new(buckets: usize) -> Result<Self> {
        if buckets == 0 || buckets > 256 {
            return Err(RetrievalError::invalid_parameter(format!(
                "histogram buckets must be in 1..=256, got {buckets}"
            )));
        }
        Ok(Self { buckets })
    }

    fn histogram(&self, bytes: &[u8]) -> Vector {
        let mut bins = vec![0.0f32; self.buckets];
        for &b in bytes {
            bins[b as usize * self.buckets / 256] += 1.0;
        }
        Vector::new(bins)
    }
}

impl Default for ByteHistogramEmbedder {
    fn default() -> Self {
        Self {
            buckets: Self::DEFAULT_BUCKETS,
        }
    }
}

impl Embedder for ByteHistogramEmbedder {
    fn dimension(&self) -> usize {
        self.buckets
    }

    fn extract(&self, path: &Path) -> Result<Vector> {
        let bytes = std::fs::read(path)?;
        Ok(self.histogram(&bytes))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Image files directly under `dir`, sorted by file name.
pub fn scan_images(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(RetrievalError::invalid_parameter(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut images = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| match e.into_io_error() {
            Some(io) => RetrievalError::StorageFailure(io),
            None => RetrievalError::invalid_parameter("filesystem loop while scanning images"),
        })?;
        if entry.file_type().is_file() && is_image(entry.path()) {
            images.push(entry.into_path());
        }
    }
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    debug!(dir = %dir.display(), count = images.len(), "scanned image directory");
    Ok(images)
}

/// Embeddings extracted from a set of files, keyed by file name.
#[derive(Debug, Default)]
pub struct Extracted {
    pub items: Vec<(String, Vector)>,
    pub failures: Vec<(PathBuf, RetrievalError)>,
}

/// Run `embedder` over `paths` in parallel, keeping input order.
///
/// Unreadable files are collected as failures instead of aborting.
pub fn extract_all<E: Embedder + ?Sized>(embedder: &E, paths: &[PathBuf]) -> Extracted {
    let results: Vec<(PathBuf, Result<Vector>)> = paths
        .par_iter()
        .map(|path| (path.clone(), embedder.extract(path)))
        .collect();

    let mut extracted = Extracted::default();
    for (path, result) in results {
        match result {
            Ok(vector) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                extracted.items.push((name, vector));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "embedding extraction failed");
                extracted.failures.push((path, e));
            }
        }
    }
    extracted
}
