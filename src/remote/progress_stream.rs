use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use futures::stream;
use pin_project_lite::pin_project;
use crate::core::ProgressCallback;

/// Size of the pieces a chunk is handed to the transport in.
const PIECE_SIZE: usize = 64 * 1024;

pin_project! {
    /// Reports how many bytes of the wrapped body were handed to the transport.
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        callback: ProgressCallback,
        bytes_sent: u64,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self {
            inner,
            callback,
            bytes_sent: 0,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(piece))) => {
                if !piece.is_empty() {
                    *this.bytes_sent += piece.len() as u64;
                    (this.callback)(*this.bytes_sent);
                }
                Poll::Ready(Some(Ok(piece)))
            }
            other => other,
        }
    }
}

/// Splits `data` into transport-sized pieces wrapped in a [`ProgressStream`].
pub fn chunk_stream(
    data: Bytes,
    callback: ProgressCallback,
) -> ProgressStream<impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static> {
    let pieces: Vec<std::io::Result<Bytes>> = (0..data.len())
        .step_by(PIECE_SIZE)
        .map(|start| Ok(data.slice(start..(start + PIECE_SIZE).min(data.len()))))
        .collect();

    ProgressStream::new(stream::iter(pieces), callback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use futures::StreamExt;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_reports_cumulative_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let callback: ProgressCallback = Arc::new(move |sent| recorder.lock().push(sent));

        let data = Bytes::from(vec![7u8; PIECE_SIZE * 2 + 10]);
        let pieces: Vec<_> = chunk_stream(data, callback).collect().await;

        assert_eq!(pieces.len(), 3);
        assert_eq!(
            *seen.lock(),
            vec![PIECE_SIZE as u64, (PIECE_SIZE * 2) as u64, (PIECE_SIZE * 2 + 10) as u64]
        );
    }
}
