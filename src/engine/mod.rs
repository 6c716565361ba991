//! Chunked upload orchestration.
//!
//! [`UploadEngine`] owns the queue and active sets, the durable store handle
//! and the event bus. Cloning the engine shares the same instance.

mod control;
mod events;
mod persister;
mod restore;
mod scheduler;
mod session;
mod state;
mod worker;


use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use crate::config::EngineConfig;
use crate::core::{
    CancelContext,
    FileHandle,
    RemoteUpload,
    Result,
    UploadError,
    UploadEvent,
    UploadId,
    UploadService,
    UploadSession,
    UploadSnapshot,
    UploadStore,
};
use persister::Persister;
use state::{QueuedUpload, SchedulerState, UploadRecord};

pub use events::{EventEmitter, FilteredEventReceiver};
pub use session::SessionInitiator;

pub(crate) struct EngineInner {
    config: EngineConfig,
    service: Arc<dyn UploadService>,
    store: Arc<dyn UploadStore>,
    initiator: SessionInitiator,
    events: EventEmitter,
    persister: Persister,
    state: Mutex<SchedulerState>,
    /// Held for the whole duration of a scheduling pass
    pass_lock: tokio::sync::Mutex<()>,
    /// Stop signal of the pass currently holding `pass_lock`
    current_pass: Mutex<Option<CancellationToken>>,
    last_pass_activity: Mutex<Instant>,
    slot_freed: Notify,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

impl UploadEngine {
    /// Builds the engine, prepares the durable store and starts the watchdog.
    ///
    /// Expired records and records that already finished are removed from the
    /// store; call [`UploadEngine::restore_and_start_all_uploads`] to resume
    /// the rest.
    pub async fn start(
        config: EngineConfig,
        service: Arc<dyn UploadService>,
        store: Arc<dyn UploadStore>,
    ) -> Result<Self> {
        let (persister, persister_handle) = Persister::spawn(store.clone());
        let inner = Arc::new(EngineInner {
            initiator: SessionInitiator::new(service.clone(), config.chunk_size),
            events: EventEmitter::new(config.event_capacity),
            config,
            service,
            store,
            persister,
            state: Mutex::new(SchedulerState::default()),
            pass_lock: tokio::sync::Mutex::new(()),
            current_pass: Mutex::new(None),
            last_pass_activity: Mutex::new(Instant::now()),
            slot_freed: Notify::new(),
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        });

        inner.prepare_store().await?;

        let watchdog_handle = scheduler::spawn_watchdog(&inner);
        inner.background.lock().extend([persister_handle, watchdog_handle]);

        info!(max_concurrent = inner.config.max_concurrent, chunk_size = inner.config.chunk_size, "Upload engine started");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Negotiates a session for `file` without touching engine state.
    pub async fn initialize_upload(&self, file: &FileHandle, relative_path: &str) -> Result<UploadSession> {
        self.inner.initialize_upload(file, relative_path).await
    }

    /// Queues an upload for an already negotiated session.
    pub fn enqueue(&self, session: UploadSession, file: FileHandle, relative_path: impl Into<String>) -> Result<UploadId> {
        self.inner.enqueue(session, file, relative_path.into(), false)
    }

    /// Opens `path`, negotiates a session and queues it.
    pub async fn submit(&self, path: impl AsRef<Path>, relative_path: impl Into<String>) -> Result<UploadId> {
        let file = FileHandle::open(path).await?;
        self.submit_file(file, relative_path).await
    }

    pub async fn submit_file(&self, file: FileHandle, relative_path: impl Into<String>) -> Result<UploadId> {
        let relative_path = relative_path.into();
        let session = self.initialize_upload(&file, &relative_path).await?;
        self.inner.enqueue(session, file, relative_path, false)
    }

    /// Submits a pre-scanned batch. Each upload is written to the durable
    /// store before its first chunk so the whole batch survives a restart.
    pub async fn submit_batch(&self, files: Vec<(FileHandle, String)>) -> Vec<Result<UploadId>> {
        let mut results = Vec::with_capacity(files.len());
        for (file, relative_path) in files {
            let result = match self.initialize_upload(&file, &relative_path).await {
                Ok(session) => self.inner.enqueue(session, file, relative_path, true),
                Err(err) => Err(err),
            };
            results.push(result);
        }
        results
    }

    pub async fn pause(&self, upload_id: &UploadId) -> Result<()> {
        self.inner.pause(upload_id).await
    }

    pub async fn resume(&self, upload_id: &UploadId) -> Result<()> {
        self.inner.resume(upload_id).await
    }

    /// Cancels one upload. Unknown or already cancelled ids are a no-op.
    pub async fn cancel(&self, upload_id: &UploadId) -> Result<()> {
        self.inner.cancel(upload_id).await
    }

    /// Cancels every active and queued upload; returns how many were cancelled.
    pub async fn cancel_all(&self) -> Result<usize> {
        self.inner.cancel_all().await
    }

    /// Requeues a failed upload, returning the id it continues under.
    pub async fn retry(&self, upload_id: &UploadId) -> Result<UploadId> {
        self.inner.retry(upload_id).await
    }

    /// Discards a failed upload and its checkpoint.
    pub fn remove(&self, upload_id: &UploadId) -> Result<()> {
        self.inner.remove(upload_id)
    }

    /// Re-enqueues a persisted upload as paused. Returns `false` when there is
    /// nothing restorable under `upload_id`.
    pub async fn restore_upload_from_storage(&self, upload_id: &UploadId) -> Result<bool> {
        self.inner.restore_upload_from_storage(upload_id).await
    }

    /// Restores every persisted upload and lets the scheduler start them.
    pub async fn restore_and_start_all_uploads(&self) -> Result<Vec<UploadId>> {
        self.inner.restore_and_start_all_uploads().await
    }

    /// Requests a scheduling pass; it runs as soon as no other pass is running.
    pub fn schedule(&self) {
        self.inner.trigger_pass();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F>
    where
        F: Fn(&UploadEvent) -> bool,
    {
        self.inner.events.subscribe_filtered(filter)
    }

    pub fn upload(&self, upload_id: &UploadId) -> Option<UploadSnapshot> {
        self.inner.state.lock().snapshot(upload_id)
    }

    pub fn uploads(&self) -> Vec<UploadSnapshot> {
        self.inner.state.lock().snapshots()
    }

    /// Ids waiting for a slot, in scheduling order
    pub fn queued_ids(&self) -> Vec<UploadId> {
        self.inner.state.lock().queued.iter().cloned().collect()
    }

    /// Uploads currently counted against `max_concurrent`
    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight()
    }

    pub async fn remote_status(&self, upload_id: &UploadId) -> Result<RemoteUpload> {
        self.inner.service.status(upload_id).await
    }

    pub async fn remote_active(&self) -> Result<Vec<RemoteUpload>> {
        self.inner.service.list_active().await
    }

    /// Waits until all store writes issued so far are applied.
    pub async fn flush(&self) {
        self.inner.persister.flush().await
    }

    /// Stops the watchdog and running workers and flushes the store.
    /// Checkpoints stay in the store so uploads resume on the next start.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        {
            let state = self.inner.state.lock();
            for active in state.active.values() {
                if let Some(run) = &active.run {
                    run.cancel("engine shutdown");
                }
            }
        }
        self.inner.persister.flush().await;

        let handles: Vec<_> = self.inner.background.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        info!("Upload engine stopped");
    }
}

impl EngineInner {
    pub(crate) async fn initialize_upload(&self, file: &FileHandle, relative_path: &str) -> Result<UploadSession> {
        self.initiator
            .initialize(file, relative_path)
            .await
            .inspect_err(|err| self.report_auth(None, err))
    }

    /// Publishes an auth event for authentication failures; other errors are ignored.
    pub(crate) fn report_auth(&self, upload_id: Option<&UploadId>, err: &UploadError) {
        if matches!(err, UploadError::AuthenticationRequired) {
            self.events.auth_error(upload_id.cloned(), err);
        }
    }

    pub(crate) fn enqueue(
        self: &Arc<Self>,
        session: UploadSession,
        file: FileHandle,
        relative_path: String,
        persist_now: bool,
    ) -> Result<UploadId> {
        if self.shutdown.is_cancelled() {
            return Err(UploadError::Shutdown);
        }

        let upload_id = session.upload_id.clone();
        let record = UploadRecord {
            session,
            file,
            relative_path,
            cancel: CancelContext::new(),
            persisted: persist_now,
        };

        let progress = {
            let mut state = self.state.lock();
            if state.contains(&upload_id) {
                return Err(UploadError::invalid_state(&upload_id, "enqueue", "already tracked"));
            }
            if persist_now {
                self.persister.save(record.to_persisted(0, 0), record.file.clone());
            }

            let queued = QueuedUpload::new(record);
            let progress = queued.progress();
            state.push_back(queued);
            progress
        };

        info!(upload_id = %upload_id, file = %progress.file_name, size = progress.total_size, "Upload queued");
        self.events.status(progress);
        self.trigger_pass();

        Ok(upload_id)
    }
}
