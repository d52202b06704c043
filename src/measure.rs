//! The measuring stream decorator shared by every adapter, so that all
//! backends produce comparable records.

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::{
    io,
    time::{Duration, Instant},
};

use crate::metrics::{MetricError, MetricRecord, Results};

/// Counts and times the bytes read from a stream, then pushes exactly one
/// record into [`Results`].
///
/// Both entry points consume the reader, so a record can't be pushed twice.
pub struct MeasuringReader<'a, F>
where
    F: Fn(&io::Error) -> MetricError,
{
    metric: MetricRecord,
    buffer_size: usize,
    results: &'a Results,
    start: Instant,
    classify: F,
    first_byte: Option<Duration>,
}

impl<'a, F> MeasuringReader<'a, F>
where
    F: Fn(&io::Error) -> MetricError,
{
    pub fn new(
        metric: MetricRecord,
        buffer_size: usize,
        results: &'a Results,
        start: Instant,
        classify: F,
    ) -> Self {
        Self {
            metric,
            buffer_size,
            results,
            start,
            classify,
            first_byte: None,
        }
    }

    /// Drain the reader, discarding its content.
    /// Returns the total bytes read.
    pub async fn read_from<R>(self, reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.measure(reader, None::<&mut futures::io::Sink>).await
    }

    /// Drain the reader into the writer.
    /// Write errors are classified and recorded just like read errors.
    pub async fn copy_to<R, W>(self, reader: R, writer: &mut W) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.measure(reader, Some(writer)).await
    }

    /// Record a transfer whose stream is pulled by someone else, such as an
    /// http client consuming a request body.
    ///
    /// `size` is what was moved before `outcome` was known, and is kept on failure.
    pub fn record(
        mut self,
        size: u64,
        first_byte: Option<Instant>,
        outcome: io::Result<()>,
    ) -> io::Result<u64> {
        self.first_byte = first_byte.map(|at| at.saturating_duration_since(self.start));
        match outcome {
            Ok(()) => Ok(self.succeed(size)),
            Err(e) => Err(self.fail(size, e)),
        }
    }

    async fn measure<R, W>(mut self, mut reader: R, mut writer: Option<&mut W>) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0; self.buffer_size];
        let mut size: u64 = 0;

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(size, e)),
            };
            if self.first_byte.is_none() {
                self.first_byte = Some(self.start.elapsed());
            }
            if n == 0 {
                break;
            }
            if let Some(writer) = writer.as_mut() {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    return Err(self.fail(size, e));
                }
            }
            size += n as u64;
        }

        if let Some(writer) = writer.as_mut() {
            if let Err(e) = writer.flush().await {
                return Err(self.fail(size, e));
            }
        }

        Ok(self.succeed(size))
    }

    fn succeed(mut self, size: u64) -> u64 {
        self.metric.size = size as i64;
        self.metric.first_byte = self.first_byte;
        self.metric.total = Some(self.start.elapsed());
        self.metric.success = true;
        self.metric.error = None;
        self.results.push(self.metric);
        size
    }

    fn fail(self, size: u64, err: io::Error) -> io::Error {
        let mut detail = (self.classify)(&err);
        if detail.code.is_empty() {
            detail.code = format!("{:?}", err.kind());
        }
        if detail.message.is_empty() {
            detail.message = err.to_string();
        }
        log::debug!(
            "stream of [{}] failed after {} bytes: {}",
            self.metric.key,
            size,
            err
        );
        let mut metric = self.metric;
        metric.size = size as i64;
        metric.first_byte = self.first_byte;
        metric.total = None;
        metric.success = false;
        metric.error = Some(detail);
        self.results.push(metric);
        err
    }
}

/// A classifier for backends without an error taxonomy of their own.
pub fn classify_io_error(err: &io::Error) -> MetricError {
    MetricError::new(format!("{:?}", err.kind()), err.to_string())
}
