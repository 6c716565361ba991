use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};
use crate::core::{CancelContext, ProgressCallback, Result, UploadError, UploadId};
use super::EngineInner;

/// One worker run: uploads the remaining chunks of `upload_id` in ascending
/// order until done, paused, cancelled or failed.
pub(crate) async fn run(engine: Arc<EngineInner>, upload_id: UploadId, run: CancelContext) {
    match transfer(&engine, &upload_id, &run).await {
        Ok(()) => engine.complete(&upload_id, &run),
        Err(_) if run.is_cancelled() => {
            debug!(upload_id = %upload_id, reason = ?run.reason(), "Worker stopped");
        }
        Err(err) if err.is_cancelled() => {
            debug!(upload_id = %upload_id, "Worker stopped, upload no longer active");
        }
        Err(err) => engine.fail(&upload_id, &run, err),
    }
}

async fn transfer(engine: &Arc<EngineInner>, upload_id: &UploadId, run: &CancelContext) -> Result<()> {
    loop {
        let (file, session, chunk_index, base_bytes) = {
            let state = engine.state.lock();
            let active = state.active.get(upload_id).ok_or(UploadError::Cancelled)?;
            if run.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            if active.current_chunk >= active.record.total_chunks() {
                return Ok(());
            }
            (
                active.record.file.clone(),
                active.record.session.clone(),
                active.current_chunk,
                active.uploaded_bytes,
            )
        };

        let (start, end) = session.chunk_range(chunk_index, file.size());
        let data = run.run(file.slice(start, end)).await?;
        let chunk_len = data.len() as u64;
        trace!(upload_id = %upload_id, chunk = chunk_index, bytes = chunk_len, "Sending chunk");

        let callback = progress_callback(engine, upload_id, run, base_bytes);
        let ack = run
            .run(engine.service.upload_chunk(upload_id, chunk_index, data, callback))
            .await?;

        if !engine.record_chunk(upload_id, run, chunk_index, chunk_len, ack.completed) {
            return Err(UploadError::Cancelled);
        }
        if ack.completed {
            return Ok(());
        }
    }
}

/// Feeds transport progress of the current chunk into the record's sampler
/// and emits a throttled progress event.
fn progress_callback(engine: &Arc<EngineInner>, upload_id: &UploadId, run: &CancelContext, base_bytes: u64) -> ProgressCallback {
    let engine = Arc::downgrade(engine);
    let upload_id = upload_id.clone();
    let run = run.clone();

    Arc::new(move |chunk_bytes: u64| {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let mut state = engine.state.lock();
        if run.is_cancelled() {
            return;
        }
        let Some(active) = state.active.get_mut(&upload_id) else {
            return;
        };

        let total = base_bytes + chunk_bytes;
        if let Some(sample) = active.sampler.sample(total, active.record.file.size()) {
            active.speed = Some(sample.speed);
            active.eta_secs = sample.eta_secs;
            active.last_progress_time = Instant::now();
            engine.events.progress(active.progress_at(total));
        }
    })
}

impl EngineInner {
    /// Applies a confirmed chunk. Returns `false` when the run was stopped
    /// while the chunk was on the wire.
    pub(crate) fn record_chunk(
        &self,
        upload_id: &UploadId,
        run: &CancelContext,
        chunk_index: u64,
        chunk_len: u64,
        completed: bool,
    ) -> bool {
        let mut state = self.state.lock();
        if run.is_cancelled() {
            return false;
        }
        let Some(active) = state.active.get_mut(upload_id) else {
            return false;
        };

        let total_chunks = active.record.total_chunks();
        let file_size = active.record.file.size();
        active.current_chunk = (chunk_index + 1).min(total_chunks);
        active.uploaded_bytes = (active.uploaded_bytes + chunk_len).min(file_size);
        if completed {
            active.current_chunk = total_chunks;
            active.uploaded_bytes = file_size;
        }
        active.last_progress_time = Instant::now();

        // The completion path deletes the entry, so nothing to write for the last chunk
        if active.current_chunk >= total_chunks {
            return true;
        }

        if !active.record.persisted {
            self.persister.save(
                active.record.to_persisted(active.current_chunk, active.uploaded_bytes),
                active.record.file.clone(),
            );
            active.record.persisted = true;
            active.last_persisted_chunk = active.current_chunk;
        } else if active.current_chunk.saturating_sub(active.last_persisted_chunk) >= self.config.checkpoint_interval.max(1) {
            self.persister.checkpoint(upload_id.clone(), active.current_chunk, active.uploaded_bytes);
            active.last_persisted_chunk = active.current_chunk;
        }

        true
    }
}
