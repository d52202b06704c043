use futures::{Future, FutureExt};
use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    adapter::{AdapterError, AnyAdapter, ListLimit, ObjectRef},
    builder::BlobBenchBuilder,
    metrics::{MetricRecord, Results},
    pool::{Pool, PoolError, Task},
};

/// How object keys of a download run are generated:
/// `{basedir}/{prefix}{separator}{index}`, the index zero padded to `suffix_digits`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    pub basedir: String,
    pub prefix: String,
    pub separator: String,
    pub suffix_digits: usize,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            basedir: String::new(),
            prefix: String::new(),
            separator: "-".to_string(),
            suffix_digits: 4,
        }
    }
}

impl KeyLayout {
    pub fn key_for(&self, index: usize) -> String {
        let name = format!(
            "{}{}{:0width$}",
            self.prefix,
            self.separator,
            index,
            width = self.suffix_digits
        );
        join_key(&self.basedir, &name)
    }
}

fn join_key(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// The immutable configuration of a benchmark run
#[derive(Debug, Clone)]
pub struct BenchConfiguration {
    /// the number of concurrent transfers
    pub workers: NonZeroUsize,
    /// the scratch buffer size handed to every transfer, zero reads nothing
    pub buffer_size: usize,
    /// how many objects a download run fetches
    pub object_count: usize,
    pub key_layout: KeyLayout,
    /// the key directory uploads are stored under
    pub dest_dir: String,
}

impl Default for BenchConfiguration {
    fn default() -> Self {
        Self {
            workers: crate::DEFAULT_WORKERS,
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            object_count: 2,
            key_layout: KeyLayout::default(),
            dest_dir: String::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("failed to read local directory [{}]: {source}", path.display())]
    LocalDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// The outcome of a run
#[derive(Debug, Clone)]
pub struct BenchReport {
    /// one record per submitted transfer, sorted by index
    pub records: Vec<MetricRecord>,
    /// wall clock time of the whole run
    pub elapsed: Duration,
    /// how many transfers the run planned
    pub requested: usize,
    /// whether submission stopped early on cancellation
    pub cancelled: bool,
}

impl BenchReport {
    pub fn failures(&self) -> impl Iterator<Item = &MetricRecord> {
        self.records.iter().filter(|r| !r.success)
    }
}

enum Transfer {
    Download(ObjectRef),
    Upload { object: ObjectRef, source: PathBuf },
}

impl Transfer {
    fn object(&self) -> &ObjectRef {
        match self {
            Transfer::Download(object) => object,
            Transfer::Upload { object, .. } => object,
        }
    }
}

/// The benchmark driver: turns a configuration into transfers, runs them on
/// a worker pool against one adapter, and collects the records.
pub struct BlobBench {
    configuration: BenchConfiguration,
    adapter: AnyAdapter,
}

impl BlobBench {
    pub(crate) fn new(configuration: BenchConfiguration, adapter: AnyAdapter) -> Self {
        Self {
            configuration,
            adapter,
        }
    }

    pub fn builder() -> BlobBenchBuilder {
        BlobBenchBuilder::default()
    }

    pub fn configuration(&self) -> &BenchConfiguration {
        &self.configuration
    }

    /// Download `object_count` objects named after the key layout.
    pub async fn download<C>(&self, cancelled: C) -> Result<BenchReport, BenchError>
    where
        C: Future<Output = ()>,
    {
        let layout = &self.configuration.key_layout;
        let transfers = (0..self.configuration.object_count)
            .map(|i| Transfer::Download(self.object(i, layout.key_for(i))))
            .collect();
        self.run(transfers, cancelled).await
    }

    /// List the objects under `prefix`, then download every listed object.
    pub async fn download_listed<C>(
        &self,
        prefix: &str,
        limit: ListLimit,
        cancelled: C,
    ) -> Result<BenchReport, BenchError>
    where
        C: Future<Output = ()>,
    {
        let keys = self.adapter.list_objects(prefix, limit).await?;
        log::info!("listed {} objects under [{}]", keys.len(), prefix);
        let transfers = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| Transfer::Download(self.object(i, key)))
            .collect();
        self.run(transfers, cancelled).await
    }

    /// Upload every file of `local_dir`, in file name order.
    pub async fn upload<C>(&self, local_dir: &Path, cancelled: C) -> Result<BenchReport, BenchError>
    where
        C: Future<Output = ()>,
    {
        let files = local_files(local_dir)
            .await
            .map_err(|source| BenchError::LocalDir {
                path: local_dir.to_path_buf(),
                source,
            })?;
        let transfers = files
            .into_iter()
            .enumerate()
            .map(|(i, (name, source))| Transfer::Upload {
                object: self.object(i, join_key(&self.configuration.dest_dir, &name)),
                source,
            })
            .collect();
        self.run(transfers, cancelled).await
    }

    fn object(&self, index: usize, key: String) -> ObjectRef {
        ObjectRef::new(index, key).with_buffer_size(self.configuration.buffer_size)
    }

    async fn run<C>(&self, transfers: Vec<Transfer>, cancelled: C) -> Result<BenchReport, BenchError>
    where
        C: Future<Output = ()>,
    {
        let start = Instant::now();
        let requested = transfers.len();
        let results = Arc::new(Results::new());
        let pool = Pool::new(self.configuration.workers.get())?;
        // shared, so every submission observes the same signal
        let cancelled = cancelled.shared();
        let mut was_cancelled = false;

        log::info!("run started, {} transfers", requested);
        for transfer in transfers {
            let adapter = self.adapter.clone();
            let sink = results.clone();
            let task = Task::new(move || async move {
                let outcome = match &transfer {
                    Transfer::Download(object) => adapter.download(object, &sink).await,
                    Transfer::Upload { object, source } => {
                        adapter.upload(object, source, &sink).await
                    }
                };
                if let Err(e) = outcome {
                    log::error!("transfer {} failed: {}", transfer.object().index, e);
                }
            });
            match pool.add(cancelled.clone(), task).await {
                Ok(()) => {}
                Err(PoolError::Cancelled) => {
                    log::warn!("run cancelled, stop submitting transfers");
                    was_cancelled = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        pool.wait().await?;

        let elapsed = start.elapsed();
        log::info!("run finished in {:?}", elapsed);
        Ok(BenchReport {
            records: results.sorted_by_index(),
            elapsed,
            requested,
            cancelled: was_cancelled,
        })
    }
}

/// the regular files of a directory as (file name, path), sorted by name
async fn local_files(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    use futures::StreamExt;

    let entries = async_fs::read_dir(dir).await?;
    futures::pin_mut!(entries);
    let mut files = Vec::new();
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        if !entry.file_type().await?.is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => files.push((name, entry.path())),
            Err(name) => log::warn!("skip non utf-8 file name {:?}", name),
        }
    }
    files.sort();
    Ok(files)
}
