use std::{
    io,
    sync::{
        atomic::{AtomicU16, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::sleep,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rand::random;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    eid::Eid,
    faces::{IngestError, IngestOutcome, IngestWorker},
    storage::StorageManager,
};

/// Ledger blob key inside the base directory
pub const QUEUE_KEY: &str = "task-queue.json";

pub fn now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Knobs copied out of `Config` when the queue starts.
#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub max_threads: u16,
    pub max_retries: u8,
    /// First retry delay; doubled on every further attempt
    pub retry_base_delay: Duration,
    /// How long finished tasks stay visible in the ledger
    pub finished_grace: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_threads: config.task_queue_max_threads.max(1),
            max_retries: config.task_queue_max_retries,
            ..Default::default()
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_threads: 4,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(5000),
            finished_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Status {
    Interrupted,
    Pending,
    InProgress,
    Done { identifiers: Vec<String> },
    NoFaceDetected,
    Error(String),
}

impl Status {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Status::Done { .. } | Status::NoFaceDetected | Status::Error(_)
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueDump {
    pub queue: Vec<TaskDump>,
    pub now: u128,
}

impl QueueDump {
    fn empty() -> Self {
        Self {
            queue: vec![],
            now: now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDump {
    pub id: Eid,
    pub task: Task,
    pub status: Status,
    #[serde(default)]
    pub attempt: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Task {
    /// index every face found in a stored source image
    IngestImage {
        source_key: String,
        file_name: String,
    },

    /// request to gracefully shutdown task queue
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to read source image: {0}")]
    Image(#[source] io::Error),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl TaskError {
    /// Only storage write failures are worth retrying; everything else
    /// fails the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Ingest(err) => err.is_retryable(),
            TaskError::Image(_) => false,
        }
    }
}

impl Task {
    pub fn run(
        &self,
        worker: &IngestWorker,
        images: &dyn StorageManager,
    ) -> Result<Status, TaskError> {
        match self {
            Task::IngestImage {
                source_key,
                file_name,
            } => {
                log::debug!("ingesting {file_name} as {source_key}");

                // committed by a run that stopped before recording Done
                let indexed = worker.store().snapshot_view().map_err(IngestError::from)?;
                if indexed.has_source(source_key) {
                    log::info!("{source_key} is already indexed");
                    let identifiers = indexed
                        .entries()
                        .iter()
                        .filter(|e| e.source_key == *source_key)
                        .map(|e| e.identifier.clone())
                        .collect();
                    return Ok(Status::Done { identifiers });
                }

                let bytes = images.read(source_key).map_err(TaskError::Image)?;

                match worker.ingest(source_key, &bytes)? {
                    IngestOutcome::Indexed { identifiers, .. } => Ok(Status::Done { identifiers }),
                    IngestOutcome::NoFaceDetected => {
                        // nothing in the index points at it
                        if let Err(err) = images.delete(source_key) {
                            log::warn!("failed to delete unused image {source_key}: {err}");
                        }
                        Ok(Status::NoFaceDetected)
                    }
                }
            }
            Task::Shutdown => Ok(Status::Done {
                identifiers: vec![],
            }),
        }
    }
}

/// Persistent record of submitted tasks and their status.
///
/// Every mutation rewrites the whole ledger through the blob backend.
pub struct QueueLedger {
    blob: Arc<dyn StorageManager>,
    dump: Mutex<QueueDump>,
}

impl QueueLedger {
    /// Load the ledger, marking tasks that were running when the previous
    /// process stopped as `Interrupted`.
    pub fn load(blob: Arc<dyn StorageManager>) -> Self {
        let mut dump = match blob.read(QUEUE_KEY) {
            Ok(data) => match serde_json::from_slice::<QueueDump>(&data) {
                Ok(dump) => dump,
                Err(e) => {
                    log::error!("failed to parse queue dump, starting empty: {e}");
                    QueueDump::empty()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => QueueDump::empty(),
            Err(e) => {
                log::error!("failed to read queue dump: {e}");
                QueueDump::empty()
            }
        };

        let mut interrupted = 0;
        for task_dump in dump.queue.iter_mut() {
            if task_dump.status == Status::InProgress {
                task_dump.status = Status::Interrupted;
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            log::warn!("{interrupted} task(s) were interrupted by the last shutdown");
        }

        let ledger = Self {
            blob,
            dump: Mutex::new(dump),
        };
        ledger.modify(|_| {});
        ledger
    }

    fn modify<F: FnOnce(&mut QueueDump)>(&self, f: F) {
        let mut dump = match self.dump.lock() {
            Ok(dump) => dump,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut dump);
        dump.now = now();

        match serde_json::to_vec_pretty(&*dump) {
            Ok(data) => {
                if let Err(e) = self.blob.write(QUEUE_KEY, &data) {
                    log::error!("failed to write queue dump: {e}");
                }
            }
            Err(e) => log::error!("failed to encode queue dump: {e}"),
        }
    }

    pub fn dump(&self) -> QueueDump {
        match self.dump.lock() {
            Ok(dump) => dump.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn save_task(&self, task: Task, status: Status) -> Eid {
        let id = Eid::new();
        let task_dump = TaskDump {
            id: id.clone(),
            task,
            status,
            attempt: 0,
        };
        self.modify(|dump| dump.queue.push(task_dump));
        id
    }

    pub fn set_status(&self, id: &Eid, status: Status) {
        self.modify(|dump| {
            if let Some(task_dump) = dump.queue.iter_mut().find(|td| &td.id == id) {
                task_dump.status = status;
            }
        });
    }

    pub fn set_attempt(&self, id: &Eid, attempt: u8) {
        self.modify(|dump| {
            if let Some(task_dump) = dump.queue.iter_mut().find(|td| &td.id == id) {
                task_dump.attempt = attempt;
            }
        });
    }

    pub fn remove_task(&self, id: &Eid) {
        self.modify(|dump| dump.queue.retain(|td| &td.id != id));
    }

    pub fn status(&self, id: &Eid) -> Option<Status> {
        self.dump()
            .queue
            .into_iter()
            .find(|td| &td.id == id)
            .map(|td| td.status)
    }

    /// Tasks left `Pending` or `Interrupted` by a previous run.
    pub fn unfinished(&self) -> Vec<(Eid, Task)> {
        self.dump()
            .queue
            .into_iter()
            .filter(|td| matches!(td.status, Status::Pending | Status::Interrupted))
            .map(|td| (td.id, td.task))
            .collect()
    }
}

/// Wait for a free slot and take it. The caller releases the slot with
/// `fetch_sub` once its work is done.
pub fn throttle(counter: &AtomicU16, max_threads: u16) {
    loop {
        let current = counter.load(Ordering::Acquire);
        if current < max_threads {
            if counter
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            continue;
        }
        sleep(Duration::from_millis(100));
    }
}

fn rand_jitter() -> u64 {
    random::<u64>() % 2000
}

fn backoff(settings: &QueueSettings, attempt: u8) -> Duration {
    let base = settings.retry_base_delay.as_millis() as u64;
    let jitter = if base == 0 { 0 } else { rand_jitter() };
    Duration::from_millis(base * 2u64.pow(attempt.saturating_sub(1) as u32) + jitter)
}

/// Run tasks from `task_rx`, one thread per task, until `Task::Shutdown`
/// arrives and every running task has finished.
pub fn start_queue(
    task_rx: mpsc::Receiver<(Eid, Task)>,
    worker: Arc<IngestWorker>,
    images: Arc<dyn StorageManager>,
    ledger: Arc<QueueLedger>,
    settings: QueueSettings,
) {
    // counts both waiting and running task threads
    let live = Arc::new(AtomicU16::new(0));
    let running = Arc::new(AtomicU16::new(0));

    log::debug!("waiting for job");
    while let Ok((id, task)) = task_rx.recv() {
        // graceful shutdown
        if let Task::Shutdown = &task {
            log::info!("{} task(s) still running", live.load(Ordering::Relaxed));
            while live.load(Ordering::Relaxed) > 0 {
                sleep(Duration::from_millis(100));
            }
            return;
        };

        let worker = worker.clone();
        let images = images.clone();
        let ledger = ledger.clone();
        let settings = settings.clone();
        let running = running.clone();
        let live_counter = live.clone();
        live.fetch_add(1, Ordering::Relaxed);

        let task_handle = std::thread::spawn({
            let id = id.clone();
            let ledger = ledger.clone();
            move || {
                throttle(&running, settings.max_threads);
                ledger.set_status(&id, Status::InProgress);

                let mut attempt = 0u8;
                let status = loop {
                    match task.run(&worker, images.as_ref()) {
                        Ok(status) => break status,
                        Err(err) if attempt < settings.max_retries && err.is_retryable() => {
                            attempt += 1;
                            let delay = backoff(&settings, attempt);
                            log::info!(
                                "task {}: retrying (attempt {}/{}) after error: {}, backoff {}ms",
                                id,
                                attempt,
                                settings.max_retries,
                                err,
                                delay.as_millis()
                            );
                            ledger.set_attempt(&id, attempt);
                            ledger.set_status(&id, Status::Pending);
                            sleep(delay);
                            ledger.set_status(&id, Status::InProgress);
                        }
                        Err(err) => {
                            log::error!("task {id} failed: {err}");
                            break Status::Error(err.to_string());
                        }
                    }
                };

                ledger.set_status(&id, status);
                running.fetch_sub(1, Ordering::AcqRel);

                // remove task a bit later to give client an opportunity to react
                let grace = settings.finished_grace;
                std::thread::spawn(move || {
                    sleep(grace);
                    ledger.remove_task(&id);
                });
            }
        });

        // handle thread panics
        std::thread::spawn(move || {
            if let Err(err) = task_handle.join() {
                log::error!("task_handle panicked: {err:?}");
                ledger.set_status(&id, Status::Error("task panicked".to_string()));
            }

            live_counter.fetch_sub(1, Ordering::Relaxed);
        });
    }
}
