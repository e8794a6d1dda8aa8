//! Cross-module tests. Feature extraction is replaced by `StubExtractor`,
//! which answers from a table keyed by the exact image bytes.

mod search;
mod web;

use std::{
    collections::HashMap,
    io,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    app::{
        task_runner::{QueueLedger, QueueSettings},
        AppFactory, AppPaths, FaceService,
    },
    config::Config,
    faces::{ExtractError, FeatureExtractor, FeatureVector, VectorStore},
    storage::{BackendLocal, StorageManager},
};

pub const DIMS: usize = 4;

enum StubAnswer {
    Faces(Vec<Vec<f32>>),
    Fail(String),
}

pub struct StubExtractor {
    dimensions: usize,
    answers: Mutex<HashMap<Vec<u8>, StubAnswer>>,
}

impl StubExtractor {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            answers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_faces(self, image: &[u8], faces: Vec<Vec<f32>>) -> Self {
        self.set_faces(image, faces);
        self
    }

    pub fn with_failure(self, image: &[u8], reason: &str) -> Self {
        self.answers
            .lock()
            .unwrap()
            .insert(image.to_vec(), StubAnswer::Fail(reason.to_string()));
        self
    }

    pub fn set_faces(&self, image: &[u8], faces: Vec<Vec<f32>>) {
        self.answers
            .lock()
            .unwrap()
            .insert(image.to_vec(), StubAnswer::Faces(faces));
    }
}

impl FeatureExtractor for StubExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<FeatureVector>, ExtractError> {
        match self.answers.lock().unwrap().get(image) {
            Some(StubAnswer::Faces(faces)) => {
                Ok(faces.iter().cloned().map(FeatureVector::new).collect())
            }
            Some(StubAnswer::Fail(reason)) => Err(ExtractError::Model(reason.clone())),
            None => Err(ExtractError::ImageDecode("unknown test image".to_string())),
        }
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "stub"
    }
}

/// A distinct, decodable PNG for every `n`.
pub fn png(n: u32) -> Vec<u8> {
    crate::images::tests::png_bytes(n + 1, 2)
}

/// Unit-ish vector along `axis`, scaled by `scale`.
pub fn vec_on(axis: usize, scale: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[axis % DIMS] = scale;
    v
}

/// Directory storage whose writes can be made to fail on demand.
pub struct FlakyStorage {
    inner: BackendLocal,
    fail_writes: AtomicBool,
}

impl FlakyStorage {
    pub fn new(dir: &Path) -> Self {
        Self {
            inner: BackendLocal::new(dir).unwrap(),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl StorageManager for FlakyStorage {
    fn write(&self, ident: &str, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("disk full"));
        }
        self.inner.write(ident, data)
    }

    fn read(&self, ident: &str) -> io::Result<Vec<u8>> {
        self.inner.read(ident)
    }

    fn exists(&self, ident: &str) -> bool {
        self.inner.exists(ident)
    }

    fn delete(&self, ident: &str) -> io::Result<()> {
        self.inner.delete(ident)
    }

    fn list(&self) -> Vec<String> {
        self.inner.list()
    }
}

pub fn store_in(dir: &Path, extractor: &StubExtractor) -> Arc<VectorStore> {
    let blob = Arc::new(BackendLocal::new(dir).unwrap());
    Arc::new(VectorStore::load(blob, extractor.model_id(), extractor.dimensions()).unwrap())
}

/// Queue settings that keep tests fast.
pub fn fast_queue() -> QueueSettings {
    QueueSettings {
        max_threads: 2,
        max_retries: 2,
        retry_base_delay: Duration::ZERO,
        finished_grace: Duration::from_secs(60),
    }
}

pub fn test_paths(dir: &tempfile::TempDir) -> AppPaths {
    AppFactory::paths_in(dir.path().to_str().unwrap()).unwrap()
}

/// Service over `paths` with the stub extractor and a running queue.
pub fn running_service(paths: &AppPaths, extractor: Arc<StubExtractor>) -> FaceService {
    let mut service = AppFactory::create_service_with(paths, Config::default(), extractor)
        .unwrap()
        .with_queue_settings(fast_queue());
    service.start_queue();
    service
}

/// Service whose image storage can fail writes.
pub fn service_with_images(
    paths: &AppPaths,
    extractor: Arc<StubExtractor>,
    images: Arc<dyn StorageManager>,
) -> FaceService {
    let store = store_in(Path::new(&paths.index_path), &extractor);
    let ledger = Arc::new(QueueLedger::load(Arc::new(
        BackendLocal::new(&paths.base_path).unwrap(),
    )));
    FaceService::new(Config::default(), store, extractor, images, ledger)
        .with_queue_settings(fast_queue())
}

/// Poll `cond` until it holds or five seconds pass.
pub fn wait_for<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}
