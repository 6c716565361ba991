mod client;
mod progress_stream;

pub use client::{HttpUploadService, is_finalization_failure};
pub use progress_stream::{ProgressStream, chunk_stream};
