use blocking::Unblock;
use bytes::Bytes;
use futures::{AsyncRead, Stream};
use std::{
    io::{self, Read},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
    task::{Context, Poll},
    time::Instant,
};

/// What a [`CrossRuntimeStream`] has yielded so far, readable after the
/// stream itself was handed to an http client.
#[derive(Debug, Default)]
pub struct StreamProgress {
    bytes: AtomicU64,
    first_chunk: OnceLock<Instant>,
    read_error: Mutex<Option<io::Error>>,
}

impl StreamProgress {
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// when the first read of the source completed, EOF included
    pub fn first_chunk(&self) -> Option<Instant> {
        self.first_chunk.get().copied()
    }

    /// the error the source failed with, if the stream ended on one
    pub fn take_read_error(&self) -> Option<io::Error> {
        self.read_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Turns a blocking reader into a byte stream on any runtime, tracking its
/// [`StreamProgress`] so the consumer of the stream doesn't have to.
pub struct CrossRuntimeStream {
    pub(crate) reader: Unblock<Box<dyn Read + Send>>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) progress: Arc<StreamProgress>,
}

impl CrossRuntimeStream {
    pub fn new(reader: impl Read + Send + 'static, buffer_size: usize) -> Self {
        Self {
            reader: Unblock::new(Box::new(reader)),
            buffer: vec![0; buffer_size.max(1)],
            progress: Arc::default(),
        }
    }

    pub fn progress(&self) -> Arc<StreamProgress> {
        self.progress.clone()
    }
}

impl Stream for CrossRuntimeStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.reader).poll_read(cx, &mut this.buffer) {
            Poll::Ready(Ok(n)) => {
                let _ = this.progress.first_chunk.set(Instant::now());
                if n == 0 {
                    return Poll::Ready(None);
                }
                this.progress.bytes.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(Bytes::copy_from_slice(&this.buffer[..n]))))
            }
            Poll::Ready(Err(e)) => {
                // the consumer only sees a copy, the original stays for the caller
                let copy = io::Error::new(e.kind(), e.to_string());
                *this
                    .progress
                    .read_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(e);
                Poll::Ready(Some(Err(copy)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
