use tokio::sync::broadcast;
use crate::core::{ErrorKind, UploadError, UploadEvent, UploadId, UploadProgress};

/// Typed event bus between the engine and its observers.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    event_tx: broadcast::Sender<UploadEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self { event_tx }
    }

    /// Subscribe events
    ///
    /// Slow receivers lose the oldest events (`RecvError::Lagged`); every
    /// receiver gets its own copy of each event.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F>
    where
        F: Fn(&UploadEvent) -> bool,
    {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter,
        }
    }

    pub fn emit(&self, event: UploadEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub fn progress(&self, progress: UploadProgress) {
        self.emit(UploadEvent::Progress {
            upload_id: progress.upload_id.clone(),
            progress,
        });
    }

    pub fn status(&self, progress: UploadProgress) {
        self.emit(UploadEvent::StatusChanged {
            upload_id: progress.upload_id.clone(),
            status: progress.status,
            progress,
        });
    }

    pub fn error(&self, kind: ErrorKind, message: String, progress: UploadProgress) {
        self.emit(UploadEvent::Error {
            upload_id: progress.upload_id.clone(),
            kind,
            message,
            progress,
        });
    }

    pub fn auth_error(&self, upload_id: Option<UploadId>, error: &UploadError) {
        self.emit(UploadEvent::AuthError {
            upload_id,
            message: error.to_string(),
        });
    }
}

/// Receiver yielding only events accepted by `filter`
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<UploadEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&UploadEvent) -> bool,
{
    pub async fn recv(&mut self) -> Result<UploadEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if (self.filter)(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UploadStatus;

    fn progress(id: &str, status: UploadStatus) -> UploadProgress {
        UploadProgress {
            upload_id: UploadId::from(id),
            file_name: "a.bin".to_string(),
            progress: 0.0,
            uploaded_chunks: 0,
            total_chunks: 1,
            uploaded_size: 0,
            total_size: 1,
            remaining_size: 1,
            estimated_time_remaining: "0s".to_string(),
            status,
            speed: None,
            eta: None,
        }
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let emitter = EventEmitter::new(16);
        let mut statuses = emitter.subscribe_filtered(|event| matches!(event, UploadEvent::StatusChanged { .. }));

        emitter.progress(progress("a", UploadStatus::Uploading));
        emitter.status(progress("a", UploadStatus::Paused));

        let event = statuses.recv().await.unwrap();
        assert_eq!(event.name(), "upload-status-change");
        assert_eq!(event.upload_id(), Some(&UploadId::from("a")));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::new(1);
        emitter.auth_error(None, &UploadError::AuthenticationRequired);
    }
}
