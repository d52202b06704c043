//! A benchmarking harness for blob stores.
//!
//! Transfers run on a bounded [`pool::Pool`], every adapter streams through a
//! [`measure::MeasuringReader`], and each transfer leaves exactly one
//! [`metrics::MetricRecord`] behind in the run's [`metrics::Results`].

#[cfg(not(any(feature = "tokio", feature = "smol")))]
compile_error!("at least one runtime feature must be enabled: `tokio` or `smol`");

use std::num::NonZeroUsize;

pub mod adapter;
mod builder;
pub mod client;
pub mod measure;
pub mod metrics;
pub mod pool;
pub mod report;
pub mod runtime;
mod utils;

pub use builder::*;
pub use client::*;

/// The scratch buffer size of a measuring reader, 8 KiB
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// The number of concurrent transfers of a run, 5
pub const DEFAULT_WORKERS: NonZeroUsize = match NonZeroUsize::new(5) {
    Some(n) => n,
    None => panic!("the default worker count must be positive"),
};
