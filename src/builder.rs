use std::num::NonZeroUsize;

use crate::{
    adapter::AnyAdapter,
    client::{BenchConfiguration, BlobBench, KeyLayout},
};

#[derive(Default)]
pub struct BlobBenchBuilder {
    adapter: Option<AnyAdapter>,
    workers: Option<usize>,
    buffer_size: Option<usize>,
    object_count: Option<usize>,
    key_layout: Option<KeyLayout>,
    dest_dir: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("field validation failed: {0}")]
    FieldValidationFailed(String),
}

impl BlobBenchBuilder {
    /// set the adapter every transfer of the run goes through
    pub fn adapter(mut self, adapter: AnyAdapter) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// set the number of concurrent workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// set the scratch buffer size of every transfer
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// set how many objects a download run fetches
    pub fn object_count(mut self, count: usize) -> Self {
        self.object_count = Some(count);
        self
    }

    pub fn key_layout(mut self, layout: KeyLayout) -> Self {
        self.key_layout = Some(layout);
        self
    }

    /// set the key directory uploads are stored under
    pub fn dest_dir(mut self, dir: impl Into<String>) -> Self {
        self.dest_dir = Some(dir.into());
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.adapter.is_none() {
            return Err(BuildError::FieldValidationFailed(
                "adapter is not set".to_string(),
            ));
        }
        if self.workers == Some(0) {
            return Err(BuildError::FieldValidationFailed(
                "workers must be positive".to_string(),
            ));
        }
        if let Some(layout) = &self.key_layout {
            if layout.suffix_digits > 20 {
                return Err(BuildError::FieldValidationFailed(format!(
                    "suffix digits must not exceed 20, got {}",
                    layout.suffix_digits
                )));
            }
        }
        Ok(())
    }

    pub fn build(self) -> Result<BlobBench, BuildError> {
        self.validate()?;
        let defaults = BenchConfiguration::default();
        let configuration = BenchConfiguration {
            workers: self
                .workers
                .and_then(NonZeroUsize::new)
                .unwrap_or(defaults.workers),
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size),
            object_count: self.object_count.unwrap_or(defaults.object_count),
            key_layout: self.key_layout.unwrap_or(defaults.key_layout),
            dest_dir: self.dest_dir.unwrap_or(defaults.dest_dir),
        };
        let adapter = self.adapter.ok_or_else(|| {
            BuildError::FieldValidationFailed("adapter is not set".to_string())
        })?;
        Ok(BlobBench::new(configuration, adapter))
    }
}
