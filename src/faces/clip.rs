//! Whole-image embedding backend built on fastembed.
//!
//! The image models fastembed ships are not face detectors: every decodable
//! image yields exactly one vector describing the whole picture. Useful for
//! near-duplicate lookups and for running the service without an external
//! encoder.

use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions};

use crate::faces::extractor::{ExtractError, FeatureExtractor};
use crate::faces::vector::FeatureVector;
use crate::images;

pub const DEFAULT_CLIP_MODEL: &str = "clip-vit-b-32";

/// fastembed's image model, guarded by a Mutex because `embed()` requires
/// `&mut self`.
pub struct ClipExtractor {
    model: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl ClipExtractor {
    /// Load (downloading on first use) the named model into
    /// `cache_dir/models`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, ExtractError> {
        let (model_enum, dimensions) = parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            ExtractError::Model(format!("Failed to create models directory: {}", e))
        })?;

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let model = ImageEmbedding::try_new(options)
            .map_err(|e| ExtractError::Model(e.to_string()))?;

        log::info!("loaded image model {model_name} ({dimensions} dimensions)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }
}

impl FeatureExtractor for ClipExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<FeatureVector>, ExtractError> {
        let decoded = images::decode(image).map_err(|e| ExtractError::ImageDecode(e.to_string()))?;

        // fastembed reads images from disk; hand it a normalized PNG copy.
        let file = tempfile::Builder::new()
            .prefix("faceidx-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| ExtractError::Model(format!("Failed to create temp file: {}", e)))?;
        decoded
            .save_with_format(file.path(), image::ImageFormat::Png)
            .map_err(|e| ExtractError::Model(format!("Failed to stage image: {}", e)))?;

        let mut model = self.model.lock().map_err(|e| {
            ExtractError::Model(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![file.path()], None)
            .map_err(|e| ExtractError::Model(e.to_string()))?;

        let vector = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| ExtractError::Model("No embedding returned".to_string()))?;

        if vector.len() != self.dimensions {
            return Err(ExtractError::Model(format!(
                "model returned {} dimensions, expected {}",
                vector.len(),
                self.dimensions
            )));
        }

        Ok(vec![FeatureVector::new(vector)])
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Map a configured model name to fastembed's enum and its output width.
pub fn parse_model_name(name: &str) -> Result<(ImageEmbeddingModel, usize), ExtractError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => Ok((ImageEmbeddingModel::ClipVitB32, 512)),
        "resnet50" => Ok((ImageEmbeddingModel::Resnet50, 2048)),
        "unicom-vit-b-16" | "unicomvitb16" => Ok((ImageEmbeddingModel::UnicomVitB16, 768)),
        "unicom-vit-b-32" | "unicomvitb32" => Ok((ImageEmbeddingModel::UnicomVitB32, 512)),
        "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
            Ok((ImageEmbeddingModel::NomicEmbedVisionV15, 768))
        }
        _ => Err(ExtractError::Model(format!(
            "Unknown image model: {}. Supported models: clip-vit-b-32, resnet50, unicom-vit-b-16, unicom-vit-b-32, nomic-embed-vision-v1.5",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_name() {
        let (_, dims) = parse_model_name("CLIP-ViT-B-32").unwrap();
        assert_eq!(dims, 512);
        let (_, dims) = parse_model_name("resnet50").unwrap();
        assert_eq!(dims, 2048);
        assert!(parse_model_name("dlib").is_err());
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_single_vector_per_image() {
        let temp_dir = tempfile::tempdir().unwrap();
        let extractor = ClipExtractor::new(DEFAULT_CLIP_MODEL, temp_dir.path().to_path_buf()).unwrap();

        let vectors = extractor.extract(&images::tests::png_bytes(32, 32)).unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 512);
    }
}
