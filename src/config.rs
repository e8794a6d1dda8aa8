use crate::{
    faces::{clip::DEFAULT_CLIP_MODEL, Metric, DEFAULT_MAX_FACES_PER_IMAGE, DEFAULT_THRESHOLD, DEFAULT_TOP_K},
    storage::{self, StorageManager},
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_KEY: &str = "config.yaml";

const TASK_QUEUE_MAX_THREADS: u16 = 4;
const TASK_QUEUE_MAX_RETRIES: u8 = 2;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Default external encoder program and the model name it reports
const DEFAULT_ENCODER_COMMAND: &str = "face-encoder";
const DEFAULT_ENCODER_MODEL: &str = "face-encoder-128";
const DEFAULT_ENCODER_DIMENSIONS: usize = 128;

const DEFAULT_DISPLAY_MAX_DIMENSION: u32 = 800;
const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Search and ingestion tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaceIndexConfig {
    /// Maximum distance accepted as a match; smaller is stricter
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_max_faces_per_image")]
    pub max_faces_per_image: usize,

    #[serde(default)]
    pub metric: Metric,
}

impl Default for FaceIndexConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            max_faces_per_image: DEFAULT_MAX_FACES_PER_IMAGE,
            metric: Metric::default(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_max_faces_per_image() -> usize {
    DEFAULT_MAX_FACES_PER_IMAGE
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// External encoder program speaking JSON on stdout
    #[default]
    Command,
    /// In-process fastembed image model
    Clip,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default)]
    pub kind: ExtractorKind,

    /// Model name recorded in the index; defaults depend on `kind`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Vector length produced by the command extractor
    #[serde(default = "default_encoder_dimensions")]
    pub dimensions: usize,

    /// Program and arguments for the command extractor
    #[serde(default = "default_encoder_command")]
    pub command: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            kind: ExtractorKind::default(),
            model: None,
            dimensions: DEFAULT_ENCODER_DIMENSIONS,
            command: default_encoder_command(),
        }
    }
}

impl ExtractorConfig {
    pub fn model_name(&self) -> &str {
        match (&self.model, self.kind) {
            (Some(model), _) => model.as_str(),
            (None, ExtractorKind::Command) => DEFAULT_ENCODER_MODEL,
            (None, ExtractorKind::Clip) => DEFAULT_CLIP_MODEL,
        }
    }
}

fn default_encoder_dimensions() -> usize {
    DEFAULT_ENCODER_DIMENSIONS
}

fn default_encoder_command() -> Vec<String> {
    vec![DEFAULT_ENCODER_COMMAND.to_string()]
}

/// How matched source images are rendered for clients
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_max_dimension")]
    pub max_dimension: u32,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_DISPLAY_MAX_DIMENSION,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

fn default_display_max_dimension() -> u32 {
    DEFAULT_DISPLAY_MAX_DIMENSION
}

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "task_queue_max_threads")]
    pub task_queue_max_threads: u16,
    #[serde(default = "task_queue_max_retries")]
    pub task_queue_max_retries: u8,
    #[serde(default = "listen_addr")]
    pub listen_addr: String,
    #[serde(default = "max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub face_index: FaceIndexConfig,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_queue_max_threads: TASK_QUEUE_MAX_THREADS,
            task_queue_max_retries: TASK_QUEUE_MAX_RETRIES,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            face_index: FaceIndexConfig::default(),
            extractor: ExtractorConfig::default(),
            display: DisplayConfig::default(),
            base_path: String::new(),
        }
    }
}

fn task_queue_max_threads() -> u16 {
    TASK_QUEUE_MAX_THREADS
}

fn task_queue_max_retries() -> u8 {
    TASK_QUEUE_MAX_RETRIES
}

fn listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn max_upload_bytes() -> usize {
    DEFAULT_MAX_UPLOAD_BYTES
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.task_queue_max_threads == 0 {
            bail!("task_queue_max_threads cannot be 0");
        }

        if self.task_queue_max_threads > 100 {
            bail!("task_queue_max_threads cannot exceed 100");
        }

        let index = &self.face_index;
        if !index.similarity_threshold.is_finite() || index.similarity_threshold < 0.0 {
            bail!(
                "face_index.similarity_threshold must be a non-negative number, got {}",
                index.similarity_threshold
            );
        }

        if index.max_faces_per_image == 0 {
            bail!("face_index.max_faces_per_image must be greater than 0");
        }

        let extractor = &self.extractor;
        if extractor.kind == ExtractorKind::Command {
            if extractor.command.is_empty() {
                bail!("extractor.command must name a program");
            }
            if extractor.dimensions == 0 || extractor.dimensions > u16::MAX as usize {
                bail!(
                    "extractor.dimensions must be between 1 and {}, got {}",
                    u16::MAX,
                    extractor.dimensions
                );
            }
        }

        if extractor.model_name().trim().is_empty() {
            bail!("extractor.model cannot be empty");
        }

        if self.display.max_dimension == 0 {
            bail!("display.max_dimension must be greater than 0");
        }

        if !(1..=100).contains(&self.display.jpeg_quality) {
            bail!(
                "display.jpeg_quality must be between 1 and 100, got {}",
                self.display.jpeg_quality
            );
        }

        if self.max_upload_bytes == 0 {
            bail!("max_upload_bytes must be greater than 0");
        }

        Ok(())
    }

    pub fn load_with(base_path: &str) -> Result<Self> {
        let store = storage::BackendLocal::new(base_path)
            .with_context(|| format!("Failed to open config directory {base_path}"))?;

        // create new if does not exist
        if !store.exists(CONFIG_KEY) {
            store
                .write(CONFIG_KEY, serde_yml::to_string(&Self::default())?.as_bytes())
                .context("Failed to write default config")?;
        }

        let config_str = String::from_utf8(store.read(CONFIG_KEY)?)
            .context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_string();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store
            .write(CONFIG_KEY, config_str.as_bytes())
            .context("Failed to save config")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(dir: &tempfile::TempDir) -> &str {
        dir.path().to_str().unwrap()
    }

    #[test]
    fn test_creates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(base(&dir)).unwrap();

        assert!(dir.path().join(CONFIG_KEY).exists());
        assert_eq!(config.task_queue_max_threads, 4);
        assert_eq!(config.face_index.similarity_threshold, 0.6);
        assert_eq!(config.face_index.top_k, 7);
        assert_eq!(config.face_index.max_faces_per_image, 10);
        assert_eq!(config.face_index.metric, Metric::Euclidean);
        assert_eq!(config.extractor.kind, ExtractorKind::Command);
        assert_eq!(config.extractor.model_name(), DEFAULT_ENCODER_MODEL);
    }

    #[test]
    fn test_partial_config_is_filled_and_resaved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_KEY),
            "face_index:\n  top_k: 3\n  metric: cosine\n",
        )
        .unwrap();

        let config = Config::load_with(base(&dir)).unwrap();
        assert_eq!(config.face_index.top_k, 3);
        assert_eq!(config.face_index.metric, Metric::Cosine);
        assert_eq!(config.face_index.similarity_threshold, 0.6);

        let saved = std::fs::read_to_string(dir.path().join(CONFIG_KEY)).unwrap();
        assert!(saved.contains("listen_addr"));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_KEY),
            "face_index:\n  similarity_threshold: -0.5\n",
        )
        .unwrap();
        assert!(Config::load_with(base(&dir)).is_err());

        std::fs::write(dir.path().join(CONFIG_KEY), "task_queue_max_threads: 0\n").unwrap();
        assert!(Config::load_with(base(&dir)).is_err());

        std::fs::write(dir.path().join(CONFIG_KEY), "display:\n  jpeg_quality: 0\n").unwrap();
        assert!(Config::load_with(base(&dir)).is_err());
    }

    #[test]
    fn test_malformed_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_KEY), "face_index: [1, 2").unwrap();
        assert!(Config::load_with(base(&dir)).is_err());
    }

    #[test]
    fn test_clip_default_model() {
        let extractor = ExtractorConfig {
            kind: ExtractorKind::Clip,
            ..Default::default()
        };
        assert_eq!(extractor.model_name(), DEFAULT_CLIP_MODEL);
    }
}
