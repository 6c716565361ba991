use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use crate::core::{CancelContext, ErrorKind, Result, UploadError, UploadId, UploadProgress, UploadStatus};
use super::EngineInner;
use super::state::{FailedUpload, QueuedUpload, SchedulerState, UploadRecord};

/// Where a resumed upload goes once the remote told us what is missing
enum ResumeTarget {
    /// Worker restarted in its existing slot
    InPlace,
    /// No slot free; back to the head of the queue
    Requeued,
    Queued,
}

impl EngineInner {
    /// Final step of a worker run that uploaded every chunk.
    pub(crate) fn complete(self: &Arc<Self>, upload_id: &UploadId, run: &CancelContext) {
        let elapsed = {
            let mut state = self.state.lock();
            if run.is_cancelled() {
                return;
            }
            let Some(active) = state.active.remove(upload_id) else {
                return;
            };

            let total_chunks = active.record.total_chunks();
            let file_size = active.record.file.size();
            self.persister.delete(upload_id.clone());

            let progress = active
                .record
                .progress(UploadStatus::Uploading, total_chunks, file_size, active.speed, 0.0);
            self.events.progress(progress.clone());
            self.events.status(UploadProgress {
                status: UploadStatus::Completed,
                ..progress
            });
            active.start_time.elapsed()
        };

        info!(upload_id = %upload_id, elapsed_ms = elapsed.as_millis() as u64, "Upload completed");
        self.release_slot();
    }

    /// Moves a record whose run failed into the failed set. Its store entry
    /// is kept so it can be retried.
    pub(crate) fn fail(self: &Arc<Self>, upload_id: &UploadId, run: &CancelContext, err: UploadError) {
        let kind = err.kind();
        {
            let mut state = self.state.lock();
            if run.is_cancelled() {
                return;
            }
            let Some(active) = state.active.remove(upload_id) else {
                return;
            };

            let failed = FailedUpload {
                record: active.record,
                current_chunk: active.current_chunk,
                uploaded_bytes: active.uploaded_bytes,
                kind,
                message: err.detail(),
                retrying: false,
            };
            let progress = failed.progress();
            self.events.status(progress.clone());
            self.events.error(kind, failed.message.clone(), progress);
            self.report_auth(Some(upload_id), &err);
            state.failed.insert(upload_id.clone(), failed);
        }

        warn!(upload_id = %upload_id, kind = ?kind, error = %err, "Upload failed");
        self.release_slot();
    }

    pub(crate) async fn pause(self: &Arc<Self>, upload_id: &UploadId) -> Result<()> {
        let progress = {
            let mut state = self.state.lock();
            if let Some(active) = state.active.get_mut(upload_id) {
                if active.paused {
                    return Ok(());
                }
                active.paused = true;
                if let Some(run) = active.run.take() {
                    run.cancel("paused");
                }
                active.speed = None;
                active.eta_secs = 0.0;
                active.progress()
            } else if let Some(queued) = state.pending.get_mut(upload_id) {
                if queued.paused {
                    return Ok(());
                }
                queued.paused = true;
                queued.progress()
            } else {
                return Err(missing(&state, upload_id, "pause"));
            }
        };
        self.events.status(progress);
        info!(upload_id = %upload_id, "Upload paused");

        if let Err(err) = self.service.pause(upload_id).await {
            warn!(upload_id = %upload_id, error = %err, "Remote pause failed");
        }
        self.release_slot();
        Ok(())
    }

    /// Resumes a paused upload from the lowest chunk the server is missing.
    pub(crate) async fn resume(self: &Arc<Self>, upload_id: &UploadId) -> Result<()> {
        {
            let state = self.state.lock();
            let paused = match (state.active.get(upload_id), state.pending.get(upload_id)) {
                (Some(active), _) => active.paused,
                (None, Some(queued)) => queued.paused,
                (None, None) => return Err(missing(&state, upload_id, "resume")),
            };
            if !paused {
                return Ok(());
            }
        }

        let missing_chunks = self.service.resume(upload_id).await.inspect_err(|err| {
            self.report_auth(Some(upload_id), err);
        })?;
        let resume_from = missing_chunks.iter().min().copied();

        let (target, progress) = {
            let mut state = self.state.lock();
            let slot_free = state.in_flight() < self.max_concurrent();

            if let Some(active) = state.active.get_mut(upload_id) {
                if !active.paused {
                    return Ok(());
                }
                if let Some(chunk) = resume_from {
                    let total_chunks = active.record.total_chunks();
                    active.current_chunk = chunk.min(total_chunks);
                    active.uploaded_bytes = active
                        .record
                        .session
                        .bytes_before(active.current_chunk, active.record.file.size());
                    active.last_persisted_chunk = active.last_persisted_chunk.min(active.current_chunk);
                }

                if slot_free {
                    active.last_progress_time = Instant::now();
                    self.spawn_worker(active);
                    (ResumeTarget::InPlace, active.progress())
                } else {
                    let Some(active) = state.active.remove(upload_id) else {
                        return Ok(());
                    };
                    let queued = active.into_queued();
                    let progress = queued.progress();
                    state.push_front(queued);
                    (ResumeTarget::Requeued, progress)
                }
            } else if let Some(mut queued) = state.remove_pending(upload_id) {
                if let Some(chunk) = resume_from {
                    let current_chunk = chunk.min(queued.record.total_chunks());
                    queued.restored_chunk = Some(current_chunk);
                    queued.restored_bytes = Some(queued.record.session.bytes_before(current_chunk, queued.record.file.size()));
                }
                queued.paused = false;
                let progress = queued.progress();
                state.push_front(queued);
                (ResumeTarget::Queued, progress)
            } else {
                return Err(missing(&state, upload_id, "resume"));
            }
        };

        self.events.status(progress.clone());
        match target {
            ResumeTarget::InPlace => info!(upload_id = %upload_id, chunk = progress.uploaded_chunks, "Upload resumed"),
            ResumeTarget::Requeued | ResumeTarget::Queued => {
                info!(upload_id = %upload_id, chunk = progress.uploaded_chunks, "Upload resumed, waiting for a slot")
            }
        }
        self.trigger_pass();
        Ok(())
    }

    /// Cancels an upload wherever it is. Cancelling twice, or cancelling an
    /// unknown id, does nothing.
    pub(crate) async fn cancel(self: &Arc<Self>, upload_id: &UploadId) -> Result<()> {
        {
            let mut state = self.state.lock();
            let Some((record, chunks, bytes)) = take_record(&mut state, upload_id) else {
                return Ok(());
            };
            self.drop_record(record, chunks, bytes);
        }
        info!(upload_id = %upload_id, "Upload cancelled");

        if let Err(err) = self.service.cancel(upload_id).await {
            warn!(upload_id = %upload_id, error = %err, "Remote cancel failed");
        }
        self.release_slot();
        Ok(())
    }

    /// Cancels every active and queued upload with a single remote call.
    /// Failed uploads are left for retry or removal.
    pub(crate) async fn cancel_all(self: &Arc<Self>) -> Result<usize> {
        let count = {
            let mut state = self.state.lock();
            let mut ids: Vec<UploadId> = state.active.keys().cloned().collect();
            ids.extend(state.queued.iter().cloned());

            for upload_id in &ids {
                if let Some((record, chunks, bytes)) = take_record(&mut state, upload_id) {
                    self.drop_record(record, chunks, bytes);
                }
            }
            ids.len()
        };
        info!(count, "All uploads cancelled");

        if let Err(err) = self.service.cancel_all().await {
            warn!(error = %err, "Remote cancel-all failed");
        }
        self.release_slot();
        Ok(count)
    }

    /// Cancels the record's token, removes its store entry and emits the
    /// cancelled status. Runs under the state lock.
    fn drop_record(&self, record: UploadRecord, uploaded_chunks: u64, uploaded_bytes: u64) {
        record.cancel.cancel("cancelled");
        self.persister.delete(record.upload_id().clone());
        self.events
            .status(record.progress(UploadStatus::Cancelled, uploaded_chunks, uploaded_bytes, None, 0.0));
    }

    /// Requeues a failed upload.
    ///
    /// Transfer and authentication failures continue from their checkpoint.
    /// A finalization failure discards the server session: a new session is
    /// negotiated and the file is uploaded again from chunk 0.
    pub(crate) async fn retry(self: &Arc<Self>, upload_id: &UploadId) -> Result<UploadId> {
        let (file, relative_path) = {
            let mut state = self.state.lock();
            let finalization = match state.failed.get(upload_id) {
                Some(failed) if !failed.retrying => failed.kind == ErrorKind::FinalizationFailed,
                _ => return Err(missing(&state, upload_id, "retry")),
            };

            if !finalization {
                let Some(failed) = state.failed.remove(upload_id) else {
                    return Err(UploadError::NotFound(upload_id.clone()));
                };
                let mut queued = QueuedUpload::new(failed.record);
                queued.restored_chunk = Some(failed.current_chunk);
                queued.restored_bytes = Some(failed.uploaded_bytes);
                let progress = queued.progress();

                state.push_back(queued);
                drop(state);
                self.events.status(progress);
                info!(upload_id = %upload_id, chunk = failed.current_chunk, "Retrying upload from checkpoint");
                self.trigger_pass();
                return Ok(upload_id.clone());
            }

            // Stays in `failed` until the new session arrives
            let Some(failed) = state.failed.get_mut(upload_id) else {
                return Err(UploadError::NotFound(upload_id.clone()));
            };
            failed.retrying = true;
            (failed.record.file.clone(), failed.record.relative_path.clone())
        };

        let result = self.initialize_upload(&file, &relative_path).await;

        let still_failed = {
            let mut state = self.state.lock();
            let retrying = state.failed.get(upload_id).is_some_and(|failed| failed.retrying);
            if !retrying {
                false
            } else if result.is_err() {
                if let Some(failed) = state.failed.get_mut(upload_id) {
                    failed.retrying = false;
                }
                true
            } else {
                state.failed.remove(upload_id);
                true
            }
        };

        let session = result?;
        if !still_failed {
            info!(upload_id = %upload_id, new_upload_id = %session.upload_id, "Upload cancelled during retry, dropping new session");
            if let Err(err) = self.service.cancel(&session.upload_id).await {
                warn!(upload_id = %session.upload_id, error = %err, "Remote cancel failed");
            }
            return Err(UploadError::Cancelled);
        }

        self.persister.delete(upload_id.clone());
        let new_id = self.enqueue(session, file, relative_path, false)?;
        info!(upload_id = %upload_id, new_upload_id = %new_id, "Retrying upload with a new session");
        Ok(new_id)
    }

    /// Forgets a failed upload and deletes its checkpoint.
    pub(crate) fn remove(&self, upload_id: &UploadId) -> Result<()> {
        let mut state = self.state.lock();
        if state.failed.get(upload_id).is_none_or(|failed| failed.retrying) {
            return Err(missing(&state, upload_id, "remove"));
        }
        state.failed.remove(upload_id);
        self.persister.delete(upload_id.clone());
        info!(upload_id = %upload_id, "Failed upload removed");
        Ok(())
    }
}

/// Takes a record out of whichever set holds it, with its progress counters.
fn take_record(state: &mut SchedulerState, upload_id: &UploadId) -> Option<(UploadRecord, u64, u64)> {
    if let Some(active) = state.active.remove(upload_id) {
        return Some((active.record, active.current_chunk, active.uploaded_bytes));
    }
    if let Some(queued) = state.remove_pending(upload_id) {
        let chunks = queued.restored_chunk.unwrap_or(0);
        let bytes = queued.restored_bytes.unwrap_or(0);
        return Some((queued.record, chunks, bytes));
    }
    state
        .failed
        .remove(upload_id)
        .map(|failed| (failed.record, failed.current_chunk, failed.uploaded_bytes))
}

/// Error for an operation on an id that is unknown or in the wrong set.
fn missing(state: &SchedulerState, upload_id: &UploadId, action: &'static str) -> UploadError {
    match state.snapshot(upload_id) {
        Some(snapshot) => UploadError::invalid_state(upload_id, action, snapshot.status),
        None => UploadError::NotFound(upload_id.clone()),
    }
}
