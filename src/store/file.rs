use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use tokio::io::AsyncWriteExt;
use crate::core::{FileHandle, PersistedUploadRecord, Result, UploadError, UploadId, UploadStore};
use super::index::CreatedIndex;

/// Directory-backed store.
///
/// Each record is two files: `<key>.json` with the metadata and `<key>.bin`
/// with the file content. Writes for the same upload id are serialized and
/// replace files atomically through a rename. Content is written before
/// metadata, so a `.bin` without a readable `.json` is an interrupted write
/// and is removed by `init`.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    index: CreatedIndex,
    locks: Mutex<HashMap<UploadId, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index: CreatedIndex::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_for(&self, upload_id: &UploadId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(upload_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn meta_path(&self, upload_id: &UploadId) -> PathBuf {
        self.dir.join(format!("{}.json", file_key(upload_id)))
    }

    fn content_path(&self, upload_id: &UploadId) -> PathBuf {
        self.dir.join(format!("{}.bin", file_key(upload_id)))
    }

    async fn read_meta(&self, upload_id: &UploadId) -> Result<Option<PersistedUploadRecord>> {
        match tokio::fs::read(self.meta_path(upload_id)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_meta(&self, record: &PersistedUploadRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.meta_path(&record.upload_id), &data).await
    }

    async fn remove_files(&self, upload_id: &UploadId) -> Result<()> {
        for path in [self.meta_path(upload_id), self.content_path(upload_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

/// Upload ids come from the server; keep file names portable.
fn file_key(upload_id: &UploadId) -> String {
    upload_id
        .as_str()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c.to_string(),
            other => format!("~{:x}", other as u32),
        })
        .collect()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Streams `content` into `path` through a temporary file.
async fn copy_atomic(path: &Path, content: &FileHandle) -> Result<()> {
    let tmp = tmp_path(path);
    let mut out = tokio::fs::File::create(&tmp).await?;
    let written = content.copy_to(&mut out).await?;
    out.flush().await?;
    drop(out);

    if written != content.size() {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(UploadError::store(format!(
            "{} changed while saving: expected {} bytes, read {}",
            content.name(),
            content.size(),
            written
        )));
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Cannot remove stale store file"),
    }
}

#[async_trait]
impl UploadStore for FileStore {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.index.clear();

        let mut keys = HashSet::new();
        let mut content = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => {}
                Some("bin") => {
                    content.push(path);
                    continue;
                }
                Some("tmp") => {
                    debug!(path = %path.display(), "Removing interrupted write");
                    remove_if_exists(&path).await;
                    continue;
                }
                _ => continue,
            }

            let parsed = tokio::fs::read(&path)
                .await
                .map_err(UploadError::from)
                .and_then(|data| Ok(serde_json::from_slice::<PersistedUploadRecord>(&data)?));

            match parsed {
                Ok(record) => {
                    if let Some(key) = path.file_stem() {
                        keys.insert(key.to_os_string());
                    }
                    self.index.insert(&record.upload_id, record.created_at);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Removing unreadable upload record");
                    remove_if_exists(&path).await;
                }
            }
        }

        // Content whose metadata is missing or was just removed
        for path in content {
            if !path.file_stem().is_some_and(|key| keys.contains(key)) {
                warn!(path = %path.display(), "Removing orphaned upload content");
                remove_if_exists(&path).await;
            }
        }

        debug!(dir = %self.dir.display(), records = self.index.ids().len(), "File store ready");
        Ok(())
    }

    async fn put(&self, record: &PersistedUploadRecord) -> Result<()> {
        let lock = self.lock_for(&record.upload_id);
        let _guard = lock.lock().await;

        write_atomic(&self.content_path(&record.upload_id), &record.file_bytes).await?;
        self.write_meta(record).await?;
        self.index.insert(&record.upload_id, record.created_at);
        Ok(())
    }

    async fn put_with_content(&self, record: &PersistedUploadRecord, content: &FileHandle) -> Result<()> {
        if !record.file_bytes.is_empty() || content.size() == 0 {
            return self.put(record).await;
        }

        let lock = self.lock_for(&record.upload_id);
        let _guard = lock.lock().await;

        copy_atomic(&self.content_path(&record.upload_id), content).await?;
        self.write_meta(record).await?;
        self.index.insert(&record.upload_id, record.created_at);
        Ok(())
    }

    async fn checkpoint(&self, upload_id: &UploadId, current_chunk: u64, uploaded_bytes: u64) -> Result<bool> {
        let lock = self.lock_for(upload_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.read_meta(upload_id).await? else {
            return Ok(false);
        };
        if current_chunk < record.current_chunk {
            return Ok(true);
        }

        record.current_chunk = current_chunk;
        record.uploaded_bytes = uploaded_bytes;
        self.write_meta(&record).await?;
        Ok(true)
    }

    async fn get(&self, upload_id: &UploadId) -> Result<Option<PersistedUploadRecord>> {
        let lock = self.lock_for(upload_id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.read_meta(upload_id).await? else {
            return Ok(None);
        };

        match tokio::fs::read(self.content_path(upload_id)).await {
            Ok(data) => record.file_bytes = Bytes::from(data),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(UploadError::store(format!("Content of upload {} is missing", upload_id)));
            }
            Err(err) => return Err(err.into()),
        }

        Ok(Some(record))
    }

    async fn delete(&self, upload_id: &UploadId) -> Result<()> {
        let lock = self.lock_for(upload_id);
        {
            let _guard = lock.lock().await;
            self.remove_files(upload_id).await?;
            self.index.remove(upload_id);
        }
        self.locks.lock().remove(upload_id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<UploadId>> {
        Ok(self.index.ids())
    }

    async fn delete_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadId>> {
        let expired = self.index.before(cutoff);
        for upload_id in &expired {
            self.delete(upload_id).await?;
        }
        Ok(expired)
    }
}
