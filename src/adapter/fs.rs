use async_trait::async_trait;
use futures::StreamExt;
use std::{
    io,
    path::{Component, Path, PathBuf},
    time::Instant,
};

use super::{collect_pages, page_of, AdapterError, BlobStoreAdapter, ListLimit, ObjectRef};
use crate::{
    measure::MeasuringReader,
    metrics::{MetricError, MetricRecord, Results},
};

/// A local directory used as a bucket, keys being `/` separated relative paths.
#[derive(Debug, Clone)]
pub struct FsAdapter {
    root: PathBuf,
    buffer_size: usize,
    page_size: usize,
}

impl FsAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            page_size: 1000,
        }
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// resolve a key inside the root, refusing anything that would escape it
    fn resolve(&self, key: &str) -> io::Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if key.is_empty() || escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid object key: {:?}", key),
            ));
        }
        Ok(self.root.join(relative))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    async fn walk(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let entries = match async_fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // an absent bucket root is just empty
                Err(e) if e.kind() == io::ErrorKind::NotFound && dir == self.root => break,
                Err(e) => return Err(e),
            };
            futures::pin_mut!(entries);
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if let Some(key) = self.key_of(&entry.path()) {
                    keys.push(key);
                } else {
                    log::warn!("fs: skip non utf-8 path [{}]", entry.path().display());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn classify_fs_error(err: &io::Error) -> MetricError {
    let code = match err.kind() {
        io::ErrorKind::NotFound => "NoSuchKey".to_string(),
        io::ErrorKind::PermissionDenied => "AccessDenied".to_string(),
        io::ErrorKind::InvalidInput => "InvalidKey".to_string(),
        kind => format!("{:?}", kind),
    };
    MetricError::new(code, err.to_string())
}

#[async_trait]
impl BlobStoreAdapter for FsAdapter {
    async fn download(&self, object: &ObjectRef, results: &Results) -> Result<(), AdapterError> {
        log::debug!("fs: working on [{}]", object.key);
        let prototype = MetricRecord::prototype(object.index, &object.key);
        let start = Instant::now();
        let opened = match self.resolve(&object.key) {
            Ok(path) => async_fs::File::open(path).await,
            Err(e) => Err(e),
        };
        let file = match opened {
            Ok(file) => file,
            Err(source) => {
                results.push(prototype.failed_before_stream(classify_fs_error(&source)));
                return Err(AdapterError::Connect {
                    key: object.key.clone(),
                    source,
                });
            }
        };

        MeasuringReader::new(
            prototype,
            object.buffer_size_or(self.buffer_size),
            results,
            start,
            classify_fs_error,
        )
            .read_from(file)
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
        log::debug!("fs: working on [{}] -> [{}]", source.display(), object.key);
        let prototype = MetricRecord::prototype(object.index, &object.key);
        let start = Instant::now();

        let input = match async_fs::File::open(source).await {
            Ok(file) => file,
            Err(e) => {
                results.push(
                    prototype.failed_before_stream(MetricError::new("LocalResource", e.to_string())),
                );
                return Err(AdapterError::LocalResource {
                    path: source.to_path_buf(),
                    source: e,
                });
            }
        };

        let created = async {
            let dest = self.resolve(&object.key)?;
            if let Some(parent) = dest.parent() {
                async_fs::create_dir_all(parent).await?;
            }
            async_fs::File::create(dest).await
        };
        let mut output = match created.await {
            Ok(file) => file,
            Err(e) => {
                results.push(prototype.failed_before_stream(classify_fs_error(&e)));
                return Err(AdapterError::Connect {
                    key: object.key.clone(),
                    source: e,
                });
            }
        };

        MeasuringReader::new(
            prototype,
            object.buffer_size_or(self.buffer_size).max(1),
            results,
            start,
            classify_fs_error,
        )
        .copy_to(input, &mut output)
        .await
        .map_err(|e| AdapterError::Stream {
            key: object.key.clone(),
            source: e,
        })?;
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        limit: ListLimit,
    ) -> Result<Vec<String>, AdapterError> {
        let keys: Vec<_> = self
            .walk()
            .await
            .map_err(|source| AdapterError::Connect {
                key: prefix.to_string(),
                source,
            })?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect();
        collect_pages(limit, |token| {
            let page = page_of(&keys, token.as_deref(), self.page_size);
            async move { Ok(page) }
        })
        .await
    }
}
