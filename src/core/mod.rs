mod cancel;
mod errors;
mod file;
mod traits;
mod types;

pub use cancel::CancelContext;
pub use errors::{ErrorKind, Result, UploadError};
pub use file::FileHandle;
pub use traits::{ProgressCallback, UploadService, UploadStore};
pub use types::{
    ChunkAck,
    InitRequest,
    PersistedUploadRecord,
    RemoteUpload,
    UploadEvent,
    UploadId,
    UploadProgress,
    UploadSession,
    UploadSnapshot,
    UploadStatus,
};
