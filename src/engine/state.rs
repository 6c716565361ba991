use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use chrono::Utc;
use crate::core::{
    CancelContext,
    ErrorKind,
    FileHandle,
    PersistedUploadRecord,
    UploadId,
    UploadProgress,
    UploadSession,
    UploadSnapshot,
    UploadStatus,
};
use crate::utils::{ProgressSampler, format_eta, percentage};

/// Fields every upload record owns regardless of where it lives.
#[derive(Debug, Clone)]
pub(crate) struct UploadRecord {
    pub session: UploadSession,
    pub file: FileHandle,
    pub relative_path: String,
    pub cancel: CancelContext,
    /// A durable store entry exists for this upload
    pub persisted: bool,
}

impl UploadRecord {
    pub fn upload_id(&self) -> &UploadId {
        &self.session.upload_id
    }

    pub fn total_chunks(&self) -> u64 {
        self.session.total_chunks
    }

    /// Store entry at the given checkpoint. Content is filled in by the persister.
    pub fn to_persisted(&self, current_chunk: u64, uploaded_bytes: u64) -> PersistedUploadRecord {
        PersistedUploadRecord {
            upload_id: self.upload_id().clone(),
            file_name: self.file.name().to_string(),
            file_size: self.file.size(),
            file_type: self.file.mime_type().to_string(),
            relative_path: self.relative_path.clone(),
            file_bytes: Default::default(),
            session: self.session.clone(),
            current_chunk,
            uploaded_bytes,
            created_at: Utc::now(),
        }
    }

    pub fn progress(
        &self,
        status: UploadStatus,
        uploaded_chunks: u64,
        uploaded_size: u64,
        speed: Option<f64>,
        eta_secs: f64,
    ) -> UploadProgress {
        let total_size = self.file.size();
        let uploaded_size = uploaded_size.min(total_size);
        let eta = (eta_secs.is_finite() && eta_secs > 0.0).then(|| Duration::from_secs_f64(eta_secs));

        UploadProgress {
            upload_id: self.upload_id().clone(),
            file_name: self.file.name().to_string(),
            progress: percentage(uploaded_size, total_size),
            uploaded_chunks: uploaded_chunks.min(self.total_chunks()),
            total_chunks: self.total_chunks(),
            uploaded_size,
            total_size,
            remaining_size: total_size - uploaded_size,
            estimated_time_remaining: format_eta(eta_secs),
            status,
            speed,
            eta,
        }
    }
}

/// Record waiting for a concurrency slot
#[derive(Debug)]
pub(crate) struct QueuedUpload {
    pub record: UploadRecord,
    pub restored_chunk: Option<u64>,
    pub restored_bytes: Option<u64>,
    /// Held in the queue until resumed
    pub paused: bool,
}

impl QueuedUpload {
    pub fn new(record: UploadRecord) -> Self {
        Self {
            record,
            restored_chunk: None,
            restored_bytes: None,
            paused: false,
        }
    }

    pub fn status(&self) -> UploadStatus {
        if self.paused { UploadStatus::Paused } else { UploadStatus::Initialized }
    }

    pub fn progress(&self) -> UploadProgress {
        let chunks = self.restored_chunk.unwrap_or(0);
        let bytes = self.restored_bytes.unwrap_or(0);
        self.record.progress(self.status(), chunks, bytes, None, 0.0)
    }
}

/// Record holding a concurrency slot
#[derive(Debug)]
pub(crate) struct ActiveUpload {
    pub record: UploadRecord,
    pub current_chunk: u64,
    pub uploaded_bytes: u64,
    pub paused: bool,
    pub start_time: Instant,
    pub last_progress_time: Instant,
    pub last_persisted_chunk: u64,
    /// Cancels the running worker only; `record.cancel` cancels the upload
    pub run: Option<CancelContext>,
    pub sampler: ProgressSampler,
    pub speed: Option<f64>,
    pub eta_secs: f64,
}

impl ActiveUpload {
    pub fn activate(queued: QueuedUpload, progress_interval: Duration) -> Self {
        let total = queued.record.total_chunks();
        let current_chunk = queued.restored_chunk.unwrap_or(0).min(total);
        let uploaded_bytes = queued
            .restored_bytes
            .unwrap_or_else(|| queued.record.session.bytes_before(current_chunk, queued.record.file.size()));
        let now = Instant::now();

        Self {
            current_chunk,
            uploaded_bytes,
            paused: false,
            start_time: now,
            last_progress_time: now,
            last_persisted_chunk: current_chunk,
            run: None,
            sampler: ProgressSampler::new(progress_interval, uploaded_bytes),
            speed: None,
            eta_secs: 0.0,
            record: queued.record,
        }
    }

    /// Counted against the concurrency bound
    pub fn is_in_flight(&self) -> bool {
        self.current_chunk < self.record.total_chunks() && !self.paused
    }

    pub fn status(&self) -> UploadStatus {
        if self.paused { UploadStatus::Paused } else { UploadStatus::Uploading }
    }

    pub fn progress(&self) -> UploadProgress {
        self.progress_at(self.uploaded_bytes)
    }

    /// Progress including bytes of the chunk currently on the wire
    pub fn progress_at(&self, uploaded_bytes: u64) -> UploadProgress {
        self.record.progress(self.status(), self.current_chunk, uploaded_bytes, self.speed, self.eta_secs)
    }

    pub fn into_queued(self) -> QueuedUpload {
        QueuedUpload {
            restored_chunk: Some(self.current_chunk),
            restored_bytes: Some(self.uploaded_bytes),
            paused: false,
            record: self.record,
        }
    }
}

/// Record whose transfer failed; kept until retried or removed
#[derive(Debug)]
pub(crate) struct FailedUpload {
    pub record: UploadRecord,
    pub current_chunk: u64,
    pub uploaded_bytes: u64,
    pub kind: ErrorKind,
    pub message: String,
    /// A new session is being negotiated for this record
    pub retrying: bool,
}

impl FailedUpload {
    pub fn progress(&self) -> UploadProgress {
        self.record.progress(UploadStatus::Error, self.current_chunk, self.uploaded_bytes, None, 0.0)
    }
}

/// Queue and active sets owned by the scheduler.
///
/// An upload id is present in at most one of `pending`, `active` and
/// `failed`; `queued` holds the FIFO order of `pending`.
#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    pub queued: VecDeque<UploadId>,
    pub pending: HashMap<UploadId, QueuedUpload>,
    pub active: HashMap<UploadId, ActiveUpload>,
    pub failed: HashMap<UploadId, FailedUpload>,
}

impl SchedulerState {
    pub fn contains(&self, upload_id: &UploadId) -> bool {
        self.pending.contains_key(upload_id) || self.active.contains_key(upload_id) || self.failed.contains_key(upload_id)
    }

    pub fn in_flight(&self) -> usize {
        self.active.values().filter(|active| active.is_in_flight()).count()
    }

    pub fn push_back(&mut self, queued: QueuedUpload) {
        let upload_id = queued.record.upload_id().clone();
        self.queued.push_back(upload_id.clone());
        self.pending.insert(upload_id, queued);
    }

    pub fn push_front(&mut self, queued: QueuedUpload) {
        let upload_id = queued.record.upload_id().clone();
        self.queued.push_front(upload_id.clone());
        self.pending.insert(upload_id, queued);
    }

    /// Position of the first queued upload that is not held
    pub fn next_runnable(&self) -> Option<usize> {
        self.queued
            .iter()
            .position(|id| self.pending.get(id).is_some_and(|queued| !queued.paused))
    }

    pub fn has_runnable(&self) -> bool {
        self.next_runnable().is_some()
    }

    pub fn remove_pending(&mut self, upload_id: &UploadId) -> Option<QueuedUpload> {
        let queued = self.pending.remove(upload_id)?;
        self.queued.retain(|id| id != upload_id);
        Some(queued)
    }

    pub fn snapshot(&self, upload_id: &UploadId) -> Option<UploadSnapshot> {
        if let Some(active) = self.active.get(upload_id) {
            return Some(snapshot(&active.record, active.progress(), None));
        }
        if let Some(queued) = self.pending.get(upload_id) {
            return Some(snapshot(&queued.record, queued.progress(), None));
        }
        self.failed
            .get(upload_id)
            .map(|failed| snapshot(&failed.record, failed.progress(), Some((failed.kind, failed.message.clone()))))
    }

    /// Active first, then queued in order, then failed
    pub fn snapshots(&self) -> Vec<UploadSnapshot> {
        let mut active: Vec<_> = self.active.values().collect();
        active.sort_by_key(|upload| upload.start_time);

        active
            .into_iter()
            .map(|upload| upload.record.upload_id())
            .chain(self.queued.iter())
            .chain(self.failed.keys())
            .filter_map(|id| self.snapshot(id))
            .collect()
    }
}

fn snapshot(record: &UploadRecord, progress: UploadProgress, error: Option<(ErrorKind, String)>) -> UploadSnapshot {
    UploadSnapshot {
        upload_id: record.upload_id().clone(),
        relative_path: record.relative_path.clone(),
        status: progress.status,
        progress,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(id: &str, size: usize, chunk_size: u64) -> UploadRecord {
        let total_chunks = (size as u64).div_ceil(chunk_size);
        UploadRecord {
            session: UploadSession {
                upload_id: UploadId::from(id),
                chunk_size,
                total_chunks,
                target_path: String::new(),
            },
            file: FileHandle::from_bytes(format!("{}.bin", id), None, Bytes::from(vec![0u8; size])),
            relative_path: String::new(),
            cancel: CancelContext::new(),
            persisted: false,
        }
    }

    #[test]
    fn test_activate_keeps_restored_checkpoint() {
        let mut queued = QueuedUpload::new(record("a", 10, 4));
        queued.restored_chunk = Some(2);
        queued.restored_bytes = Some(8);

        let active = ActiveUpload::activate(queued, Duration::from_millis(100));
        assert_eq!(active.current_chunk, 2);
        assert_eq!(active.uploaded_bytes, 8);
        assert_eq!(active.last_persisted_chunk, 2);
        assert!(active.is_in_flight());
    }

    #[test]
    fn test_paused_and_finished_uploads_are_not_in_flight() {
        let mut state = SchedulerState::default();
        let mut paused = ActiveUpload::activate(QueuedUpload::new(record("a", 10, 4)), Duration::ZERO);
        paused.paused = true;
        let mut finished = ActiveUpload::activate(QueuedUpload::new(record("b", 10, 4)), Duration::ZERO);
        finished.current_chunk = 3;
        let running = ActiveUpload::activate(QueuedUpload::new(record("c", 10, 4)), Duration::ZERO);

        state.active.insert("a".into(), paused);
        state.active.insert("b".into(), finished);
        state.active.insert("c".into(), running);
        assert_eq!(state.in_flight(), 1);
    }

    #[test]
    fn test_next_runnable_skips_held_uploads() {
        let mut state = SchedulerState::default();
        let mut held = QueuedUpload::new(record("a", 10, 4));
        held.paused = true;
        state.push_back(held);
        state.push_back(QueuedUpload::new(record("b", 10, 4)));

        assert_eq!(state.next_runnable(), Some(1));
        state.remove_pending(&"b".into());
        assert!(!state.has_runnable());
        assert_eq!(state.queued.len(), 1);
    }

    #[test]
    fn test_progress_numbers() {
        let queued = QueuedUpload::new(record("a", 10, 4));
        let mut active = ActiveUpload::activate(queued, Duration::ZERO);
        active.current_chunk = 1;
        active.uploaded_bytes = 4;

        let progress = active.progress_at(6);
        assert_eq!(progress.progress, 60.0);
        assert_eq!(progress.uploaded_chunks, 1);
        assert_eq!(progress.remaining_size, 4);
        assert_eq!(progress.estimated_time_remaining, "0s");
        assert_eq!(progress.status, UploadStatus::Uploading);
    }
}
