//! Rendering of a finished run: aggregate statistics and the per-transfer table.

use hdrhistogram::Histogram;
use std::{io, time::Duration};

use crate::{client::BenchReport, metrics::MetricRecord};

pub const TABLE_HEADER: &str =
    "Sample|File|TimeToFirstGet (ms)|TimeToLastGet (ms)|Size (KB)|Success|Err Code|Err Message";

/// Latency percentiles of the completed transfers, in microseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub min: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub max: u64,
    pub mean: f64,
}

/// Aggregate figures of a run
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub transfers: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// bytes of the successful transfers
    pub bytes: u64,
    pub elapsed: Duration,
    /// None when no transfer completed
    pub latency: Option<LatencySummary>,
}

impl Summary {
    pub fn from_records(records: &[MetricRecord], elapsed: Duration) -> Self {
        let succeeded = records.iter().filter(|r| r.success).count();
        let bytes = records
            .iter()
            .filter(|r| r.success)
            .map(|r| r.size.max(0) as u64)
            .sum();
        Self {
            transfers: records.len(),
            succeeded,
            failed: records.len() - succeeded,
            bytes,
            elapsed,
            latency: latency_summary(records),
        }
    }

    /// bytes of the successful transfers per second of wall clock time
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

fn latency_summary(records: &[MetricRecord]) -> Option<LatencySummary> {
    // 1µs to 1h with 3 significant digits
    let mut histogram = Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3).ok()?;
    for total in records.iter().filter_map(|r| r.total) {
        let micros = (total.as_micros() as u64).max(1);
        histogram.saturating_record(micros);
    }
    if histogram.is_empty() {
        return None;
    }
    Some(LatencySummary {
        min: histogram.min(),
        p50: histogram.value_at_quantile(0.5),
        p90: histogram.value_at_quantile(0.9),
        p99: histogram.value_at_quantile(0.99),
        max: histogram.max(),
        mean: histogram.mean(),
    })
}

fn millis(d: Option<Duration>) -> String {
    match d {
        Some(d) => format!("{:.1}", d.as_secs_f64() * 1000.0),
        None => "-".to_string(),
    }
}

fn kilobytes(size: i64) -> String {
    if size < 0 {
        "-".to_string()
    } else {
        format!("{:.1}", size as f64 / 1024.0)
    }
}

/// Write one `|` separated line per record, then the total execution time.
pub fn render_table(report: &BenchReport, mut w: impl io::Write) -> io::Result<()> {
    writeln!(w, "{}", TABLE_HEADER)?;
    for r in &report.records {
        let (code, message) = r
            .error
            .as_ref()
            .map(|e| (e.code.as_str(), e.message.as_str()))
            .unwrap_or_default();
        writeln!(
            w,
            "{}|{}|{}|{}|{}|{}|{}|{}",
            r.index,
            r.key,
            millis(r.first_byte),
            millis(r.total),
            kilobytes(r.size),
            r.success,
            code,
            // keep one record per line
            message.replace(['\n', '|'], " ")
        )?;
    }
    writeln!(w)?;
    writeln!(w, "Total execution time: {:?}", report.elapsed)?;
    w.flush()
}

/// Write the aggregate figures of a run
pub fn render_summary(summary: &Summary, mut w: impl io::Write) -> io::Result<()> {
    writeln!(
        w,
        "Transfers: {} ({} succeeded, {} failed)",
        summary.transfers, summary.succeeded, summary.failed
    )?;
    writeln!(
        w,
        "Bytes: {} in {:?} ({:.2} MiB/s)",
        summary.bytes,
        summary.elapsed,
        summary.throughput() / (1024.0 * 1024.0)
    )?;
    match &summary.latency {
        Some(l) => writeln!(
            w,
            "Latency (ms): min {:.1} p50 {:.1} p90 {:.1} p99 {:.1} max {:.1} mean {:.1}",
            l.min as f64 / 1000.0,
            l.p50 as f64 / 1000.0,
            l.p90 as f64 / 1000.0,
            l.p99 as f64 / 1000.0,
            l.max as f64 / 1000.0,
            l.mean / 1000.0
        )?,
        None => writeln!(w, "Latency (ms): no completed transfer")?,
    }
    w.flush()
}
