use async_trait::async_trait;
use futures::AsyncRead;
use rand::Rng;
use std::{
    collections::HashMap,
    io,
    ops::Range,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use super::{
    collect_pages, page_of, AdapterError, BlobStoreAdapter, ListLimit, ObjectRef,
};
use crate::{
    measure::MeasuringReader,
    metrics::{MetricError, MetricRecord, Results},
    runtime,
};

pub const DEFAULT_DUMMY_DELAY: Range<Duration> = Duration::ZERO..Duration::from_millis(500);

/// How a dummy object misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DummyFault {
    /// the object can't be opened
    Missing,
    /// the stream breaks after the given amount of bytes
    StreamAfter(u64),
}

/// A fixture object served by the [`DummyAdapter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DummyObject {
    pub size: u64,
    pub fault: Option<DummyFault>,
}

impl DummyObject {
    pub fn sized(size: u64) -> Self {
        Self { size, fault: None }
    }

    pub fn with_fault(mut self, fault: DummyFault) -> Self {
        self.fault = Some(fault);
        self
    }
}

/// A dry-run backend.
///
/// Every transfer waits a random delay picked from `delay`, then streams
/// zeroes of the fixture size. Objects without a fixture stream `default_size` bytes.
/// A zero `buffer_size` reads nothing, turning every download into an empty
/// transfer that only measures the delay.
#[derive(Debug, Clone)]
pub struct DummyAdapter {
    delay: Range<Duration>,
    default_size: u64,
    buffer_size: usize,
    objects: HashMap<String, DummyObject>,
    object_count: usize,
    page_size: usize,
}

impl Default for DummyAdapter {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DUMMY_DELAY,
            default_size: 0,
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            objects: HashMap::new(),
            object_count: 0,
            page_size: 1000,
        }
    }
}

impl DummyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// set the range of the random delay
    pub fn delay(mut self, delay: Range<Duration>) -> Self {
        self.delay = delay;
        self
    }

    /// set the size of objects without a fixture
    pub fn default_size(mut self, size: u64) -> Self {
        self.default_size = size;
        self
    }

    /// set the scratch buffer size of the measuring reader
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// register a fixture object
    pub fn object(mut self, key: impl Into<String>, object: DummyObject) -> Self {
        self.objects.insert(key.into(), object);
        self
    }

    /// set how many generated keys the listing reports
    pub fn object_count(mut self, count: usize) -> Self {
        self.object_count = count;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    fn pick_delay(&self) -> Duration {
        if self.delay.is_empty() {
            self.delay.start
        } else {
            rand::thread_rng().gen_range(self.delay.clone())
        }
    }

    fn lookup(&self, key: &str) -> DummyObject {
        self.objects
            .get(key)
            .copied()
            .unwrap_or_else(|| DummyObject::sized(self.default_size))
    }

    fn all_keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<_> = (0..self.object_count)
            .map(|i| format!("dummy/object-{:04}", i))
            .chain(self.objects.keys().cloned())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

fn classify_dummy_error(err: &io::Error) -> MetricError {
    match err.kind() {
        io::ErrorKind::NotFound => MetricError::new("NoSuchKey", err.to_string()),
        _ => MetricError::new("DummyStreamError", err.to_string()),
    }
}

/// Streams zeroes, optionally failing after a given amount of bytes
struct DummyReader {
    remaining: u64,
    fail_at: Option<u64>,
    read: u64,
}

impl DummyReader {
    fn new(object: DummyObject) -> Self {
        let fail_at = match object.fault {
            Some(DummyFault::StreamAfter(n)) => Some(n),
            _ => None,
        };
        Self {
            remaining: object.size,
            fail_at,
            read: 0,
        }
    }
}

impl AsyncRead for DummyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut budget = this.remaining;
        if let Some(fail_at) = this.fail_at {
            if this.read >= fail_at {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "dummy stream interrupted",
                )));
            }
            budget = budget.min(fail_at - this.read);
        }
        let n = (buf.len() as u64).min(budget) as usize;
        buf[..n].fill(0);
        this.remaining -= n as u64;
        this.read += n as u64;
        Poll::Ready(Ok(n))
    }
}

#[async_trait]
impl BlobStoreAdapter for DummyAdapter {
    async fn download(&self, object: &ObjectRef, results: &Results) -> Result<(), AdapterError> {
        log::debug!("dummy: working on [{}]", object.key);
        let fixture = self.lookup(&object.key);
        let start = Instant::now();
        runtime::sleep(self.pick_delay()).await;

        if fixture.fault == Some(DummyFault::Missing) {
            let source = io::Error::new(io::ErrorKind::NotFound, "dummy object is missing");
            results.push(
                MetricRecord::prototype(object.index, &object.key)
                    .failed_before_stream(classify_dummy_error(&source)),
            );
            return Err(AdapterError::Connect {
                key: object.key.clone(),
                source,
            });
        }

        let reader = MeasuringReader::new(
            MetricRecord::prototype(object.index, &object.key),
            object.buffer_size_or(self.buffer_size),
            results,
            start,
            classify_dummy_error,
        );
        reader
            .read_from(DummyReader::new(fixture))
            .await
            .map_err(|source| AdapterError::Stream {
                key: object.key.clone(),
                source,
            })?;
        Ok(())
    }

    async fn upload(
        &self,
        object: &ObjectRef,
        source: &Path,
        results: &Results,
    ) -> Result<(), AdapterError> {
        log::debug!(
            "dummy: working on [{}] -> [{}]",
            source.display(),
            object.key
        );
        let start = Instant::now();
        let file = match async_fs::File::open(source).await {
            Ok(file) => file,
            Err(e) => {
                results.push(
                    MetricRecord::prototype(object.index, &object.key).failed_before_stream(
                        MetricError::new("LocalResource", e.to_string()),
                    ),
                );
                return Err(AdapterError::LocalResource {
                    path: source.to_path_buf(),
                    source: e,
                });
            }
        };
        runtime::sleep(self.pick_delay()).await;

        // uploads read the whole local file
        let reader = MeasuringReader::new(
            MetricRecord::prototype(object.index, &object.key),
            object.buffer_size_or(self.buffer_size).max(1),
            results,
            start,
            |e: &io::Error| MetricError::new("LocalResource", e.to_string()),
        );
        reader
            .read_from(file)
            .await
            .map_err(|e| AdapterError::LocalResource {
                path: source.to_path_buf(),
                source: e,
            })?;
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        limit: ListLimit,
    ) -> Result<Vec<String>, AdapterError> {
        let keys = self.all_keys(prefix);
        collect_pages(limit, |token| {
            let page = page_of(&keys, token.as_deref(), self.page_size);
            async move { Ok(page) }
        })
        .await
    }
}
