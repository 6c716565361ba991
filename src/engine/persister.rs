use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use crate::core::{FileHandle, PersistedUploadRecord, UploadId, UploadStore};

enum PersistOp {
    /// First write of a record; content comes from `file` if not attached
    Save {
        record: Box<PersistedUploadRecord>,
        file: FileHandle,
    },
    Checkpoint {
        upload_id: UploadId,
        current_chunk: u64,
        uploaded_bytes: u64,
    },
    Delete(UploadId),
    Flush(oneshot::Sender<()>),
}

/// Single background writer in front of the durable store.
///
/// Operations are applied in the order they were issued, so a delete issued
/// after a checkpoint can never be undone by it. Callers never wait for a
/// write unless they ask for [`Persister::flush`].
#[derive(Debug, Clone)]
pub(crate) struct Persister {
    op_tx: mpsc::UnboundedSender<PersistOp>,
}

impl Persister {
    pub fn spawn(store: Arc<dyn UploadStore>) -> (Self, JoinHandle<()>) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(store, op_rx));
        (Self { op_tx }, handle)
    }

    fn send(&self, op: PersistOp) {
        if self.op_tx.send(op).is_err() {
            warn!("Persister stopped, dropping store write");
        }
    }

    pub fn save(&self, record: PersistedUploadRecord, file: FileHandle) {
        self.send(PersistOp::Save {
            record: Box::new(record),
            file,
        });
    }

    pub fn checkpoint(&self, upload_id: UploadId, current_chunk: u64, uploaded_bytes: u64) {
        self.send(PersistOp::Checkpoint {
            upload_id,
            current_chunk,
            uploaded_bytes,
        });
    }

    pub fn delete(&self, upload_id: UploadId) {
        self.send(PersistOp::Delete(upload_id));
    }

    /// Waits until every operation issued before this call is applied.
    pub async fn flush(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PersistOp::Flush(reply_tx));
        let _ = reply_rx.await;
    }
}

async fn run(store: Arc<dyn UploadStore>, mut op_rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = op_rx.recv().await {
        match op {
            PersistOp::Save { record, file } => match store.put_with_content(&record, &file).await {
                Ok(()) => debug!(upload_id = %record.upload_id, chunk = record.current_chunk, "Upload record saved"),
                Err(err) => warn!(upload_id = %record.upload_id, error = %err, "Failed to save upload record"),
            },
            PersistOp::Checkpoint { upload_id, current_chunk, uploaded_bytes } => {
                match store.checkpoint(&upload_id, current_chunk, uploaded_bytes).await {
                    Ok(true) => debug!(upload_id = %upload_id, chunk = current_chunk, "Checkpoint written"),
                    Ok(false) => debug!(upload_id = %upload_id, "Checkpoint for unknown record ignored"),
                    Err(err) => warn!(upload_id = %upload_id, error = %err, "Failed to write checkpoint"),
                }
            }
            PersistOp::Delete(upload_id) => {
                if let Err(err) = store.delete(&upload_id).await {
                    warn!(upload_id = %upload_id, error = %err, "Failed to delete upload record");
                }
            }
            PersistOp::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::core::UploadSession;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_operations_apply_in_order() {
        let store = Arc::new(MemoryStore::new());
        let (persister, _handle) = Persister::spawn(store.clone());

        let file = FileHandle::from_bytes("a.bin", None, Bytes::from(vec![9u8; 10]));
        let record = PersistedUploadRecord {
            upload_id: "a".into(),
            file_name: "a.bin".to_string(),
            file_size: 10,
            file_type: file.mime_type().to_string(),
            relative_path: String::new(),
            file_bytes: Bytes::new(),
            session: UploadSession {
                upload_id: "a".into(),
                chunk_size: 4,
                total_chunks: 3,
                target_path: String::new(),
            },
            current_chunk: 1,
            uploaded_bytes: 4,
            created_at: chrono::Utc::now(),
        };

        persister.save(record, file);
        persister.checkpoint("a".into(), 2, 8);
        persister.flush().await;

        let stored = store.get(&"a".into()).await.unwrap().unwrap();
        assert_eq!(stored.current_chunk, 2);
        assert_eq!(stored.file_bytes.len(), 10);

        persister.delete("a".into());
        persister.checkpoint("a".into(), 3, 10);
        persister.flush().await;
        assert!(store.is_empty());
    }
}
