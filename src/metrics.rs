//! Per-transfer outcome records and the shared collection they are pushed into.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// The normalized error of a failed transfer.
/// Every backend maps its own error shape into this `{code, message}` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricError {
    pub code: String,
    pub message: String,
}

impl MetricError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The outcome of one upload or download
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    /// the submission-order position, assigned by the driver
    pub index: usize,
    /// the object key that was transferred
    pub key: String,
    /// the bytes observed, or `UNKNOWN_SIZE` if no stream was ever opened
    pub size: i64,
    /// elapsed time from the start of the operation to the first completed read
    pub first_byte: Option<Duration>,
    /// elapsed time from the start of the operation to the end of the stream.
    /// `None` means the transfer did not complete.
    pub total: Option<Duration>,
    pub success: bool,
    /// only set when `success` is false
    pub error: Option<MetricError>,
}

impl MetricRecord {
    pub const UNKNOWN_SIZE: i64 = -1;

    /// A prototype record, to be completed by a measuring reader or by
    /// [`MetricRecord::failed_before_stream`].
    pub fn prototype(index: usize, key: impl Into<String>) -> Self {
        Self {
            index,
            key: key.into(),
            size: Self::UNKNOWN_SIZE,
            first_byte: None,
            total: None,
            success: false,
            error: None,
        }
    }

    /// Turn a prototype into the record of a transfer that failed before any byte was read,
    /// such as a connection or local file error.
    pub fn failed_before_stream(mut self, error: MetricError) -> Self {
        self.size = Self::UNKNOWN_SIZE;
        self.first_byte = None;
        self.total = None;
        self.success = false;
        self.error = Some(error);
        self
    }
}

/// Results contains all metric records of one run.
/// Items keep the push order; sorting is left to the reader.
#[derive(Debug, Default)]
pub struct Results {
    items: Mutex<Vec<MetricRecord>>,
}

impl Results {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half pushed record behind,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Vec<MetricRecord>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push adds a record. It is safe to call concurrently.
    pub fn push(&self, record: MetricRecord) {
        self.lock().push(record);
    }

    /// A snapshot of the records pushed so far.
    /// It is safe to call concurrently with `push`.
    pub fn items(&self) -> Vec<MetricRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// A snapshot sorted by submission index
    pub fn sorted_by_index(&self) -> Vec<MetricRecord> {
        let mut items = self.items();
        sort_by_index(&mut items);
        items
    }

    /// A snapshot sorted by total latency, incomplete transfers last
    pub fn sorted_by_duration(&self) -> Vec<MetricRecord> {
        let mut items = self.items();
        sort_by_duration(&mut items);
        items
    }

    /// Take every record out, leaving the collection empty
    pub fn drain(&self) -> Vec<MetricRecord> {
        std::mem::take(&mut *self.lock())
    }
}

pub fn sort_by_index(records: &mut [MetricRecord]) {
    records.sort_by_key(|r| r.index);
}

pub fn sort_by_duration(records: &mut [MetricRecord]) {
    records.sort_by_key(|r| (r.total.is_none(), r.total, r.index));
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use test_log::test;

    fn record(index: usize, total: Option<u64>) -> MetricRecord {
        MetricRecord {
            size: 10,
            total: total.map(Duration::from_millis),
            success: total.is_some(),
            ..MetricRecord::prototype(index, format!("key-{index}"))
        }
    }

    #[test]
    fn test_push_keeps_insertion_order() {
        let results = Results::new();
        results.push(record(2, Some(5)));
        results.push(record(0, Some(1)));
        results.push(record(1, Some(3)));
        let indices: Vec<_> = results.items().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![2, 0, 1]);
    }

    #[test]
    fn test_items_is_a_snapshot() {
        let results = Results::new();
        results.push(record(0, Some(1)));
        let snapshot = results.items();
        results.push(record(1, Some(1)));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_sorted_by_index() {
        let results = Results::new();
        for i in [4, 1, 3, 0, 2] {
            results.push(record(i, Some(1)));
        }
        let indices: Vec<_> = results.sorted_by_index().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_sorted_by_duration_puts_incomplete_last() {
        let results = Results::new();
        results.push(record(0, None));
        results.push(record(1, Some(30)));
        results.push(record(2, Some(10)));
        let indices: Vec<_> = results
            .sorted_by_duration()
            .iter()
            .map(|r| r.index)
            .collect();
        assert_eq!(indices, vec![2, 1, 0]);
    }

    #[test]
    fn test_concurrent_push_loses_nothing() {
        let results = Arc::new(Results::new());
        let handles: Vec<_> = (0..64)
            .map(|i| {
                let results = results.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        results.push(record(i * 50 + j, Some(1)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(results.len(), 64 * 50);
        let indices: Vec<_> = results.sorted_by_index().iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..64 * 50).collect::<Vec<_>>());
    }

    #[test]
    fn test_failed_before_stream() {
        let record = MetricRecord::prototype(3, "a/b")
            .failed_before_stream(MetricError::new("NoSuchKey", "missing"));
        assert_eq!(record.size, MetricRecord::UNKNOWN_SIZE);
        assert!(!record.success);
        assert_eq!(record.total, None);
        assert_eq!(record.error.unwrap().code, "NoSuchKey");
    }

    #[test]
    fn test_drain_empties() {
        let results = Results::new();
        results.push(record(0, Some(1)));
        assert_eq!(results.drain().len(), 1);
        assert!(results.is_empty());
    }
}
