//! Standalone CLI operations.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::{
    app::{AppError, AppFactory, AppPaths, FaceService},
    config::Config,
    faces::{
        codec, naming, store::INDEX_KEY, IngestError, IngestOutcome, SearchEngine, SearchParams,
        StoreError,
    },
    storage::{BackendLocal, StorageManager},
};

/// Extensions accepted when walking directories
const VALID_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "webp"];

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct IngestSummary {
    pub indexed_images: usize,
    pub indexed_faces: usize,
    pub no_face: usize,
    /// Images whose faces are already in the index
    pub duplicates: usize,
    pub failed: usize,
    /// Files ignored because of their extension
    pub skipped: usize,
    pub cancelled: bool,
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VALID_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand files and directories into a sorted list of image files.
/// Returns the images and the number of files skipped.
pub fn collect_images(inputs: &[PathBuf]) -> Result<(Vec<PathBuf>, usize)> {
    let mut images = Vec::new();
    let mut skipped = 0;
    let mut pending: Vec<PathBuf> = inputs.to_vec();

    while let Some(path) = pending.pop() {
        if path.is_dir() {
            for entry in std::fs::read_dir(&path)
                .with_context(|| format!("Failed to read directory {}", path.display()))?
            {
                pending.push(entry?.path());
            }
        } else if path.is_file() {
            if has_image_extension(&path) {
                images.push(path);
            } else {
                log::debug!("skipping {}", path.display());
                skipped += 1;
            }
        } else {
            bail!("{} does not exist", path.display());
        }
    }

    images.sort();
    Ok((images, skipped))
}

/// Index every image under `inputs`. Ctrl-C stops between images.
pub fn ingest(service: &FaceService, inputs: &[PathBuf]) -> Result<IngestSummary> {
    let (files, skipped) = collect_images(inputs)?;

    let cancelled = Arc::new(AtomicBool::new(false));
    if let Err(err) = ctrlc::set_handler({
        let cancelled = cancelled.clone();
        move || {
            log::warn!("interrupt received, stopping after the current image");
            cancelled.store(true, Ordering::SeqCst);
        }
    }) {
        log::warn!("failed to set Ctrl+C handler: {err}");
    }

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let summary = ingest_files(service, &files, skipped, &cancelled, |name| {
        progress.set_message(name.to_string());
        progress.inc(1);
    });
    progress.finish_and_clear();

    Ok(summary)
}

/// Core of `ingest`, independent of terminal handling.
pub fn ingest_files<F: FnMut(&str)>(
    service: &FaceService,
    files: &[PathBuf],
    skipped: usize,
    cancelled: &AtomicBool,
    mut on_file: F,
) -> IngestSummary {
    let mut summary = IngestSummary {
        skipped,
        ..Default::default()
    };

    for path in files {
        if cancelled.load(Ordering::SeqCst) {
            summary.cancelled = true;
            break;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());

        let result = std::fs::read(path)
            .map_err(AppError::from)
            .and_then(|bytes| service.ingest_now(&file_name, &bytes));

        match result {
            Ok((_, IngestOutcome::Indexed { identifiers, .. })) => {
                summary.indexed_images += 1;
                summary.indexed_faces += identifiers.len();
            }
            Ok((_, IngestOutcome::NoFaceDetected)) => summary.no_face += 1,
            Err(AppError::Ingest(IngestError::Store(StoreError::DuplicateIdentifier(_)))) => {
                summary.duplicates += 1
            }
            Err(err) => {
                log::error!("{}: {err}", path.display());
                summary.failed += 1;
            }
        }

        on_file(&file_name);
    }

    summary
}

/// Search with the configured extractor, without touching the task ledger.
pub fn search(
    paths: &AppPaths,
    config: &Config,
    image: &Path,
    threshold: Option<f32>,
    top_k: Option<usize>,
) -> Result<serde_json::Value> {
    let bytes = std::fs::read(image).with_context(|| format!("Failed to read {}", image.display()))?;

    let extractor = AppFactory::create_extractor(config, paths)?;
    let store = AppFactory::open_store(paths, extractor.as_ref())?;
    let engine = SearchEngine::new(store, extractor, config.face_index.metric);

    let params = SearchParams {
        threshold: threshold.unwrap_or(config.face_index.similarity_threshold),
        top_k: top_k.unwrap_or(config.face_index.top_k),
    };

    let outcome = engine.search_image(&bytes, &params)?;
    Ok(serde_json::to_value(outcome)?)
}

/// Index statistics read straight from disk.
pub fn stats(paths: &AppPaths, config: &Config) -> Result<serde_json::Value> {
    let (model_id, dimensions) = AppFactory::index_identity(config)?;
    let store = AppFactory::open_store_for(paths, model_id, dimensions)?;
    let snapshot = store.snapshot_view()?;

    let sources: HashSet<&str> = snapshot.entries().iter().map(|e| e.source_key.as_str()).collect();

    Ok(serde_json::json!({
        "entries": snapshot.len(),
        "source_images": sources.len(),
        "dimensions": snapshot.dimensions(),
        "model": config.extractor.model_name(),
        "metric": config.face_index.metric,
    }))
}

/// Decode the whole index and report what was found. Errors on any
/// corruption, model/dimension mismatch, or entry whose identifier does
/// not name its own source image.
pub fn verify(paths: &AppPaths, config: &Config) -> Result<String> {
    let blob = BackendLocal::new(&paths.index_path)?;
    if !blob.exists(INDEX_KEY) {
        return Ok("no face index yet".to_string());
    }

    let bytes = blob.read(INDEX_KEY)?;
    let header = codec::read_header(&bytes).context("face index header is damaged")?;

    let (model_id, dimensions) = AppFactory::index_identity(config)?;
    let snapshot = codec::decode(&bytes, &model_id, dimensions).map_err(|err| {
        if err.is_corruption() {
            anyhow::anyhow!("face index is corrupt: {err}")
        } else {
            anyhow::anyhow!("face index does not match the configured extractor: {err}")
        }
    })?;

    let misnamed = snapshot
        .entries()
        .iter()
        .filter(|e| {
            let named_after = naming::parse_identifier(&e.identifier).map(|(key, _)| key);
            named_after != Some(e.source_key.as_str())
        })
        .count();
    if misnamed > 0 {
        bail!("face index is inconsistent: {misnamed} entries are not named after their source image");
    }

    Ok(format!(
        "face index OK: format v{}, {} entries, {} dimensions, {} bytes",
        header.version,
        snapshot.len(),
        header.dimensions,
        bytes.len()
    ))
}
