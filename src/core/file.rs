use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use super::errors::{Result, UploadError};

const SNIFF_LEN: usize = 8192;

#[derive(Debug, Clone)]
enum FileSource {
    Path(PathBuf),
    /// Content rebuilt from the durable store after a restart
    Memory(Bytes),
}

/// The bytes of one file being uploaded.
#[derive(Debug, Clone)]
pub struct FileHandle {
    name: String,
    size: u64,
    mime_type: String,
    source: FileSource,
}

impl FileHandle {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(UploadError::InitializationFailed(format!("Not a file: {}", path.display())));
        }

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UploadError::InitializationFailed(format!("Invalid file name: {}", path.display())))?
            .to_string();

        let mut head = vec![0u8; SNIFF_LEN.min(metadata.len() as usize)];
        if !head.is_empty() {
            let mut file = File::open(path).await?;
            file.read_exact(&mut head).await?;
        }

        Ok(Self {
            name,
            size: metadata.len(),
            mime_type: sniff_mime_type(&head),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, mime_type: Option<String>, bytes: Bytes) -> Self {
        let mime_type = mime_type
            .filter(|mime| !mime.is_empty())
            .unwrap_or_else(|| sniff_mime_type(&bytes[..bytes.len().min(SNIFF_LEN)]));

        Self {
            name: name.into(),
            size: bytes.len() as u64,
            mime_type,
            source: FileSource::Memory(bytes),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.source, FileSource::Memory(_))
    }

    /// Reads the bytes in `[start, end)`.
    pub async fn slice(&self, start: u64, end: u64) -> Result<Bytes> {
        let end = end.min(self.size);
        if start >= end {
            return Ok(Bytes::new());
        }

        match &self.source {
            FileSource::Memory(bytes) => Ok(bytes.slice(start as usize..end as usize)),
            FileSource::Path(path) => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(start)).await?;

                let mut buffer = vec![0u8; (end - start) as usize];
                file.read_exact(&mut buffer).await?;
                Ok(Bytes::from(buffer))
            }
        }
    }

    /// Streams the whole content into `writer` without buffering it,
    /// returning the number of bytes written.
    pub async fn copy_to<W>(&self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match &self.source {
            FileSource::Memory(bytes) => {
                writer.write_all(bytes).await?;
                Ok(bytes.len() as u64)
            }
            FileSource::Path(path) => {
                let mut file = File::open(path).await?;
                Ok(tokio::io::copy(&mut file, writer).await?)
            }
        }
    }

    pub async fn read_all(&self) -> Result<Bytes> {
        match &self.source {
            FileSource::Memory(bytes) => Ok(bytes.clone()),
            FileSource::Path(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

fn sniff_mime_type(head: &[u8]) -> String {
    infer::get(head)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_path_slice_reads_exact_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..100u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let file = FileHandle::open(&path).await.unwrap();
        assert_eq!(file.name(), "data.bin");
        assert_eq!(file.size(), 100);
        assert_eq!(file.mime_type(), "application/octet-stream");

        let slice = file.slice(90, 120).await.unwrap();
        assert_eq!(&slice[..], &data[90..]);
        assert!(file.slice(100, 120).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_handle_sniffs_type() {
        let png_header = Bytes::from_static(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0]);
        let file = FileHandle::from_bytes("a.png", None, png_header);
        assert_eq!(file.mime_type(), "image/png");
        assert!(file.is_in_memory());
        assert_eq!(&file.slice(1, 4).await.unwrap()[..], b"PNG");
    }

    #[tokio::test]
    async fn test_copy_to_streams_path_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let file = FileHandle::open(&path).await.unwrap();
        let mut out = Vec::new();
        assert_eq!(file.copy_to(&mut out).await.unwrap(), data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_open_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileHandle::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, UploadError::InitializationFailed(_)));
    }
}
