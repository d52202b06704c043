use async_trait::async_trait;
use futures::Future;
use std::{io, path::Path, path::PathBuf, sync::Arc};

use crate::metrics::Results;

mod dummy;
mod fs;
#[cfg(feature = "reqwest")]
mod reqwest;

pub use dummy::*;
pub use fs::*;
#[cfg(feature = "reqwest")]
pub use reqwest::*;

/// The object moved by one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    /// the submission-order position, copied into the metric record
    pub index: usize,
    pub key: String,
    /// the scratch buffer size of this transfer, overriding the adapter's own
    pub buffer_size: Option<usize>,
}

impl ObjectRef {
    pub fn new(index: usize, key: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
            buffer_size: None,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub(crate) fn buffer_size_or(&self, fallback: usize) -> usize {
        self.buffer_size.unwrap_or(fallback)
    }
}

/// How many keys a listing may collect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListLimit {
    /// exhaust every page
    #[default]
    Unlimited,
    AtMost(usize),
}

impl ListLimit {
    fn is_reached(&self, collected: usize) -> bool {
        match self {
            ListLimit::Unlimited => false,
            ListLimit::AtMost(max) => collected >= *max,
        }
    }
}

/// One page of a listing
#[derive(Debug, Default)]
pub struct Page {
    pub keys: Vec<String>,
    /// the continuation token of the next page, None on the last page
    pub next: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The transfer could not begin
    #[error("failed to open [{key}]: {source}")]
    Connect {
        key: String,
        #[source]
        source: io::Error,
    },
    /// The transfer began but failed partway
    #[error("transfer of [{key}] failed: {source}")]
    Stream {
        key: String,
        #[source]
        source: io::Error,
    },
    /// A local file could not be opened or read
    #[error("local resource [{}] is not accessible: {source}", path.display())]
    LocalResource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not supported by this adapter")]
    Unsupported(&'static str),
    #[cfg(feature = "reqwest")]
    #[error(transparent)]
    Http(#[from] ::reqwest::Error),
}

/// The capability set of a blob store backend.
///
/// Every attempted `download` or `upload` pushes exactly one record into the
/// given [`Results`], whether it succeeds or not, so the sample count of a run
/// always equals the number of submitted transfers.
#[async_trait]
pub trait BlobStoreAdapter: Send + Sync {
    /// Stream one object from the store, measuring it.
    async fn download(&self, object: &ObjectRef, results: &Results) -> Result<(), AdapterError>;

    /// Stream the local file at `source` into the store under `object.key`, measuring it.
    async fn upload(
        &self,
        object: &ObjectRef,
        source: &Path,
        results: &Results,
    ) -> Result<(), AdapterError>;

    /// List the keys under `prefix`, following pages until `limit` keys are collected.
    async fn list_objects(&self, prefix: &str, limit: ListLimit)
        -> Result<Vec<String>, AdapterError>;
}

pub type AnyAdapter = Arc<dyn BlobStoreAdapter>;

/// Drive a paginated listing until the last page, or until `limit` keys are collected.
/// `fetch` receives the continuation token of the previous page.
pub async fn collect_pages<F, Fut>(limit: ListLimit, mut fetch: F) -> Result<Vec<String>, AdapterError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page, AdapterError>>,
{
    let mut keys = Vec::new();
    let mut token = None;
    while !limit.is_reached(keys.len()) {
        let page = fetch(token).await?;
        for key in page.keys {
            if limit.is_reached(keys.len()) {
                break;
            }
            keys.push(key);
        }
        match page.next {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(keys)
}

/// Paginate an in-memory key list, the continuation token being the offset of the page.
pub(crate) fn page_of(keys: &[String], token: Option<&str>, page_size: usize) -> Page {
    let start = token.and_then(|t| t.parse::<usize>().ok()).unwrap_or(0);
    let start = start.min(keys.len());
    let end = (start + page_size.max(1)).min(keys.len());
    Page {
        keys: keys[start..end].to_vec(),
        next: (end < keys.len()).then(|| end.to_string()),
    }
}
