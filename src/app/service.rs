use std::{
    collections::HashSet,
    io,
    sync::{mpsc, Arc},
    thread::JoinHandle,
};

use serde::Serialize;

use crate::{
    app::{
        errors::AppError,
        task_runner::{self, QueueDump, QueueLedger, QueueSettings, Status, Task},
    },
    config::Config,
    eid::Eid,
    faces::{
        naming, FeatureExtractor, IngestError, IngestOutcome, IngestWorker, Metric, SearchEngine,
        SearchOutcome, SearchParams, StoreError, VectorStore,
    },
    images,
    storage::StorageManager,
};

/// Handle returned for an accepted upload.
#[derive(Clone, Debug, Serialize)]
pub struct Submission {
    pub task_id: Eid,
    pub source_key: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Stats {
    pub entries: usize,
    pub source_images: usize,
    /// Files in image storage, including images still waiting in the queue
    pub stored_images: usize,
    pub dimensions: usize,
    pub model: String,
    pub metric: Metric,
}

/// Owns the face index and everything that reads or writes it.
pub struct FaceService {
    config: Config,
    store: Arc<VectorStore>,
    extractor: Arc<dyn FeatureExtractor>,
    worker: Arc<IngestWorker>,
    engine: SearchEngine,
    images: Arc<dyn StorageManager>,
    ledger: Arc<QueueLedger>,
    queue_settings: QueueSettings,

    task_tx: Option<mpsc::Sender<(Eid, Task)>>,
    task_queue_handle: Option<JoinHandle<()>>,
}

impl FaceService {
    pub fn new(
        config: Config,
        store: Arc<VectorStore>,
        extractor: Arc<dyn FeatureExtractor>,
        images: Arc<dyn StorageManager>,
        ledger: Arc<QueueLedger>,
    ) -> Self {
        let worker = Arc::new(IngestWorker::new(
            store.clone(),
            extractor.clone(),
            config.face_index.max_faces_per_image,
        ));
        let engine = SearchEngine::new(store.clone(), extractor.clone(), config.face_index.metric);
        let queue_settings = QueueSettings::from_config(&config);

        Self {
            config,
            store,
            extractor,
            worker,
            engine,
            images,
            ledger,
            queue_settings,
            task_tx: None,
            task_queue_handle: None,
        }
    }

    pub fn with_queue_settings(mut self, settings: QueueSettings) -> Self {
        self.queue_settings = settings;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Start the background task runner and re-enqueue tasks a previous
    /// run left unfinished.
    pub fn start_queue(&mut self) {
        if self.task_tx.is_some() {
            return;
        }

        let (task_tx, task_rx) = mpsc::channel::<(Eid, Task)>();

        for (id, task) in self.ledger.unfinished() {
            log::info!("re-enqueueing task {id}");
            self.ledger.set_status(&id, Status::Pending);
            if let Err(err) = task_tx.send((id, task)) {
                log::error!("failed to re-enqueue interrupted task: {err:?}");
            }
        }

        let handle = std::thread::spawn({
            let worker = self.worker.clone();
            let images = self.images.clone();
            let ledger = self.ledger.clone();
            let settings = self.queue_settings.clone();
            move || task_runner::start_queue(task_rx, worker, images, ledger, settings)
        });

        self.task_queue_handle = Some(handle);
        self.task_tx = Some(task_tx);
    }

    /// Ask the task runner to stop once running tasks finish.
    pub fn shutdown(&self) {
        if let Some(task_tx) = &self.task_tx {
            if let Err(err) = task_tx.send((Eid::new(), Task::Shutdown)) {
                log::error!("{err}");
            }
        }
    }

    pub fn wait_task_queue_finish(&mut self) {
        self.task_tx = None;
        if let Some(handle) = self.task_queue_handle.take() {
            if handle.join().is_err() {
                log::error!("task queue thread panicked");
            }
        }
    }

    /// Store `bytes` under a fresh source key and schedule indexing.
    pub fn submit(&self, file_name: &str, bytes: &[u8]) -> Result<Submission, AppError> {
        if !images::is_image(bytes) {
            return Err(AppError::BadRequest(format!("{file_name} is not an image")));
        }

        let task_tx = self.task_tx.as_ref().ok_or(AppError::QueueClosed)?;

        let source_key = naming::new_source_key(file_name);
        self.images.write(&source_key, bytes)?;

        let task = Task::IngestImage {
            source_key: source_key.clone(),
            file_name: file_name.to_string(),
        };
        let task_id = self.ledger.save_task(task.clone(), Status::Pending);

        if task_tx.send((task_id.clone(), task)).is_err() {
            self.ledger
                .set_status(&task_id, Status::Error("task queue is not running".to_string()));
            return Err(AppError::QueueClosed);
        }

        log::info!(
            "queued {file_name} ({}) as {source_key}, task {task_id}",
            images::mime_type(bytes).unwrap_or("unknown type")
        );
        Ok(Submission {
            task_id,
            source_key,
        })
    }

    /// Store and index `bytes` on the calling thread.
    ///
    /// The source key is derived from the file name and content, so a file
    /// that is already indexed fails with `DuplicateIdentifier` and leaves
    /// both the index and the stored image alone. The stored image is
    /// removed again unless at least one face was indexed from it.
    pub fn ingest_now(
        &self,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<(String, IngestOutcome), AppError> {
        let source_key = naming::content_source_key(file_name, bytes);
        if self.store.snapshot_view()?.has_source(&source_key) {
            let identifier = naming::face_identifier(&source_key, 0);
            return Err(IngestError::Store(StoreError::DuplicateIdentifier(identifier)).into());
        }
        self.images.write(&source_key, bytes)?;

        let result = self.worker.ingest(&source_key, bytes);
        let keep = matches!(
            result,
            Ok(IngestOutcome::Indexed { .. })
                | Err(IngestError::Store(StoreError::DuplicateIdentifier(_)))
        );
        if !keep {
            if let Err(err) = self.images.delete(&source_key) {
                log::warn!("failed to delete unused image {source_key}: {err}");
            }
        }

        Ok((source_key, result?))
    }

    /// Search parameters from config with optional overrides.
    pub fn search_params(&self, threshold: Option<f32>, top_k: Option<usize>) -> SearchParams {
        SearchParams {
            threshold: threshold.unwrap_or(self.config.face_index.similarity_threshold),
            top_k: top_k.unwrap_or(self.config.face_index.top_k),
        }
    }

    pub fn search(&self, bytes: &[u8], params: &SearchParams) -> Result<SearchOutcome, AppError> {
        if !images::is_image(bytes) {
            return Err(AppError::BadRequest("uploaded file is not an image".to_string()));
        }

        Ok(self.engine.search_image(bytes, params)?)
    }

    /// Display JPEG of a stored source image.
    pub fn display_image(&self, source_key: &str) -> Result<Vec<u8>, AppError> {
        let bytes = self.images.read(source_key).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => {
                AppError::NotFound(format!("image {source_key}"))
            }
            _ => AppError::IO(err),
        })?;

        let display = images::to_display_jpeg(
            &bytes,
            self.config.display.max_dimension,
            self.config.display.jpeg_quality,
        )?;
        Ok(display.data)
    }

    /// Source key recorded for an indexed face. Anything not in the index
    /// is `NotFound`, even when its image is already stored.
    pub fn source_key_for(&self, identifier: &str) -> Result<String, AppError> {
        self.store
            .snapshot_view()?
            .source_key_of(identifier)
            .map(str::to_string)
            .ok_or_else(|| AppError::NotFound(format!("face {identifier}")))
    }

    /// Display JPEG of the image a face was taken from.
    pub fn image_for(&self, identifier: &str) -> Result<Vec<u8>, AppError> {
        let source_key = self.source_key_for(identifier)?;
        self.display_image(&source_key)
    }

    pub fn stats(&self) -> Result<Stats, AppError> {
        let snapshot = self.store.snapshot_view()?;
        let sources: HashSet<&str> = snapshot
            .entries()
            .iter()
            .map(|e| e.source_key.as_str())
            .collect();

        Ok(Stats {
            entries: snapshot.len(),
            source_images: sources.len(),
            stored_images: self.images.list().len(),
            dimensions: snapshot.dimensions(),
            model: self.extractor.model_name().to_string(),
            metric: self.engine.metric(),
        })
    }

    pub fn queue_dump(&self) -> QueueDump {
        self.ledger.dump()
    }

    pub fn task_status(&self, id: &Eid) -> Option<Status> {
        self.ledger.status(id)
    }
}
