use crate::{
    app::{service::FaceService, task_runner::QueueLedger},
    config::{Config, ExtractorKind},
    faces::{
        clip::{self, ClipExtractor},
        extractor::model_id_hash,
        CommandExtractor, FeatureExtractor, VectorStore,
    },
    storage::{self, StorageManager},
};
use anyhow::{anyhow, Context, Result};
use homedir::my_home;
use std::path::PathBuf;
use std::sync::Arc;

/// Application factory for creating and configuring application components
pub struct AppFactory;

impl AppFactory {
    /// Build the full service from config in `paths.base_path`.
    ///
    /// Fails when the persisted index is corrupt or was built by another
    /// model; the service never starts over a damaged index.
    pub fn create_service(paths: &AppPaths) -> Result<FaceService> {
        let config = Self::create_config(paths)?;
        let extractor = Self::create_extractor(&config, paths)?;
        Self::create_service_with(paths, config, extractor)
    }

    /// Same as `create_service`, with an explicit extractor.
    pub fn create_service_with(
        paths: &AppPaths,
        config: Config,
        extractor: Arc<dyn FeatureExtractor>,
    ) -> Result<FaceService> {
        let store = Self::open_store(paths, extractor.as_ref())?;

        let images: Arc<dyn StorageManager> = Arc::new(
            storage::BackendLocal::new(&paths.images_path)
                .context("Failed to open image storage")?,
        );
        let ledger_blob: Arc<dyn StorageManager> = Arc::new(
            storage::BackendLocal::new(&paths.base_path).context("Failed to open queue storage")?,
        );
        let ledger = Arc::new(QueueLedger::load(ledger_blob));

        Ok(FaceService::new(config, store, extractor, images, ledger))
    }

    /// Load the face index written for `extractor`'s model.
    pub fn open_store(paths: &AppPaths, extractor: &dyn FeatureExtractor) -> Result<Arc<VectorStore>> {
        let store = Self::open_store_for(paths, extractor.model_id(), extractor.dimensions())?;

        log::info!(
            "face index ready: {} vectors, model {}, {} dimensions",
            store.len(),
            extractor.model_name(),
            extractor.dimensions()
        );

        Ok(store)
    }

    /// Load the face index without instantiating an extractor.
    pub fn open_store_for(
        paths: &AppPaths,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Arc<VectorStore>> {
        let blob: Arc<dyn StorageManager> = Arc::new(
            storage::BackendLocal::new(&paths.index_path).context("Failed to open index storage")?,
        );

        let store = VectorStore::load(blob, model_id, dimensions)
            .with_context(|| format!("Failed to load face index from {}", paths.index_path))?;

        Ok(Arc::new(store))
    }

    /// Model id and vector length the configured extractor will produce.
    pub fn index_identity(config: &Config) -> Result<([u8; 32], usize)> {
        let extractor = &config.extractor;
        let model_id = model_id_hash(extractor.model_name());
        match extractor.kind {
            ExtractorKind::Command => Ok((model_id, extractor.dimensions)),
            ExtractorKind::Clip => {
                let (_, dimensions) = clip::parse_model_name(extractor.model_name())?;
                Ok((model_id, dimensions))
            }
        }
    }

    /// Instantiate the configured feature extractor
    pub fn create_extractor(config: &Config, paths: &AppPaths) -> Result<Arc<dyn FeatureExtractor>> {
        let extractor = &config.extractor;
        match extractor.kind {
            ExtractorKind::Command => {
                log::info!("using encoder command {:?}", extractor.command);
                Ok(Arc::new(CommandExtractor::new(
                    &extractor.command,
                    extractor.model_name(),
                    extractor.dimensions,
                )?))
            }
            ExtractorKind::Clip => Ok(Arc::new(ClipExtractor::new(
                extractor.model_name(),
                PathBuf::from(&paths.base_path),
            )?)),
        }
    }

    /// Get application paths with validation
    pub fn get_paths() -> Result<AppPaths> {
        Self::paths_in(&Self::get_base_path()?)
    }

    /// Application paths rooted at `base_path`, created if missing.
    pub fn paths_in(base_path: &str) -> Result<AppPaths> {
        let paths = AppPaths {
            base_path: base_path.to_string(),
            index_path: format!("{base_path}/index"),
            images_path: format!("{base_path}/images"),
        };

        for dir in [&paths.base_path, &paths.index_path, &paths.images_path] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create application directory {dir}"))?;
        }

        Ok(paths)
    }

    /// Create configuration with validation
    pub fn create_config(paths: &AppPaths) -> Result<Config> {
        Config::load_with(&paths.base_path)
    }

    /// Get the base path for the application
    fn get_base_path() -> Result<String> {
        if let Ok(base_path) = std::env::var("FACEIDX_BASE_PATH") {
            return Ok(base_path);
        }

        let home = my_home()
            .map_err(|e| anyhow!("Could not determine home directory: {e:?}"))?
            .ok_or_else(|| anyhow!("Home directory path is empty"))?;
        Ok(format!("{}/.local/share/faceidx", home.to_string_lossy()))
    }
}

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: String,
    /// Blob namespace holding `faces.bin`
    pub index_path: String,
    /// Blob namespace holding uploaded source images
    pub images_path: String,
}
