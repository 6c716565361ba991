pub mod config;
pub mod core;
pub mod engine;
pub mod remote;
pub mod store;
pub mod utils;

// 重新导出核心类型
pub use core::{
    ErrorKind,
    FileHandle,
    Result,
    UploadError,
    UploadEvent,
    UploadId,
    UploadProgress,
    UploadService,
    UploadSession,
    UploadSnapshot,
    UploadStatus,
    UploadStore,
};

pub use config::{Config, EngineConfig, RemoteConfig};
pub use engine::UploadEngine;
pub use remote::HttpUploadService;
pub use store::{FileStore, MemoryStore};
