mod file;
mod index;
mod memory;

pub use file::FileStore;
pub use index::CreatedIndex;
pub use memory::MemoryStore;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::{Duration, Utc};
    use crate::core::{FileHandle, PersistedUploadRecord, UploadId, UploadSession, UploadStore};

    fn record(id: &str, current_chunk: u64, age_days: i64) -> PersistedUploadRecord {
        let content = Bytes::from(vec![1u8; 10]);
        PersistedUploadRecord {
            upload_id: UploadId::from(id),
            file_name: format!("{}.bin", id),
            file_size: content.len() as u64,
            file_type: "application/octet-stream".to_string(),
            relative_path: format!("docs/{}.bin", id),
            file_bytes: content,
            session: UploadSession {
                upload_id: UploadId::from(id),
                chunk_size: 4,
                total_chunks: 3,
                target_path: "/docs".to_string(),
            },
            current_chunk,
            uploaded_bytes: current_chunk * 4,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    async fn exercise(store: &dyn UploadStore) {
        store.init().await.unwrap();

        store.put(&record("fresh", 1, 0)).await.unwrap();
        store.put(&record("stale", 1, 10)).await.unwrap();
        assert_eq!(store.list_ids().await.unwrap(), vec![UploadId::from("stale"), UploadId::from("fresh")]);

        let fresh = UploadId::from("fresh");
        assert!(store.checkpoint(&fresh, 2, 8).await.unwrap());
        // Older checkpoints never overwrite newer ones
        assert!(store.checkpoint(&fresh, 1, 4).await.unwrap());
        let loaded = store.get(&fresh).await.unwrap().unwrap();
        assert_eq!(loaded.current_chunk, 2);
        assert_eq!(loaded.uploaded_bytes, 8);
        assert_eq!(loaded.file_bytes.len(), 10);

        assert!(!store.checkpoint(&UploadId::from("missing"), 1, 4).await.unwrap());

        let expired = store.delete_created_before(Utc::now() - Duration::days(7)).await.unwrap();
        assert_eq!(expired, vec![UploadId::from("stale")]);
        assert!(store.get(&UploadId::from("stale")).await.unwrap().is_none());

        store.delete(&fresh).await.unwrap();
        store.delete(&fresh).await.unwrap();
        assert!(store.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStore::new(dir.path().join("uploads"))).await;
    }

    #[tokio::test]
    async fn test_file_store_rebuilds_index_on_init() {
        let dir = tempfile::tempdir().unwrap();
        let odd_id = "odd/id:1";

        let store = FileStore::new(dir.path());
        store.init().await.unwrap();
        store.put(&record(odd_id, 2, 0)).await.unwrap();
        tokio::fs::write(dir.path().join("garbage.json"), b"{not json").await.unwrap();

        let reopened = FileStore::new(dir.path());
        reopened.init().await.unwrap();
        assert_eq!(reopened.list_ids().await.unwrap(), vec![UploadId::from(odd_id)]);
        assert!(!dir.path().join("garbage.json").exists());

        let loaded = reopened.get(&UploadId::from(odd_id)).await.unwrap().unwrap();
        assert_eq!(loaded.current_chunk, 2);
        assert_eq!(loaded.relative_path, "docs/odd/id:1.bin");
    }

    #[tokio::test]
    async fn test_file_store_init_removes_orphaned_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.init().await.unwrap();
        store.put(&record("kept", 1, 0)).await.unwrap();
        store.put(&record("orphan", 1, 0)).await.unwrap();
        store.put(&record("broken", 1, 0)).await.unwrap();

        // Interrupted writes: content without metadata, unreadable metadata, a temp file
        tokio::fs::remove_file(dir.path().join("orphan.json")).await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{truncated").await.unwrap();
        tokio::fs::write(dir.path().join("kept.json.tmp"), b"{}").await.unwrap();

        let reopened = FileStore::new(dir.path());
        reopened.init().await.unwrap();
        assert_eq!(reopened.list_ids().await.unwrap(), vec![UploadId::from("kept")]);

        for name in ["orphan.bin", "broken.bin", "broken.json", "kept.json.tmp"] {
            assert!(!dir.path().join(name).exists(), "{} left behind", name);
        }
        assert!(dir.path().join("kept.bin").exists());
        assert_eq!(reopened.get(&UploadId::from("kept")).await.unwrap().unwrap().file_bytes.len(), 10);
    }

    #[tokio::test]
    async fn test_file_store_streams_content_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        tokio::fs::write(&source, &data).await.unwrap();
        let file = FileHandle::open(&source).await.unwrap();

        let store = FileStore::new(dir.path().join("uploads"));
        store.init().await.unwrap();
        let mut entry = record("large", 1, 0);
        entry.file_bytes = Bytes::new();
        entry.file_size = file.size();
        store.put_with_content(&entry, &file).await.unwrap();

        let loaded = store.get(&UploadId::from("large")).await.unwrap().unwrap();
        assert_eq!(&loaded.file_bytes[..], &data[..]);
        assert_eq!(loaded.current_chunk, 1);
    }

    #[tokio::test]
    async fn test_memory_store_reads_content_from_handle() {
        let store = MemoryStore::new();
        let file = FileHandle::from_bytes("m.bin", None, Bytes::from(vec![7u8; 12]));
        let mut entry = record("m", 0, 0);
        entry.file_bytes = Bytes::new();
        store.put_with_content(&entry, &file).await.unwrap();
        assert_eq!(store.get(&UploadId::from("m")).await.unwrap().unwrap().file_bytes.len(), 12);
    }
}
