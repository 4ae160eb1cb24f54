//! Run counters and per-stage timings.

use crate::pipeline::StageKind;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Records appended to staging
    pub records_ingested: AtomicU64,

    /// Records rejected by ingestion validation
    pub records_rejected: AtomicU64,

    /// Canonical records produced by deduplication
    pub records_deduplicated: AtomicU64,

    /// Records written to a country partition
    pub records_routed: AtomicU64,

    /// Records with an unsupported or missing country
    pub records_unrouted: AtomicU64,

    /// Destination tables replaced (partitions and the unrouted table)
    pub partitions_written: AtomicU64,

    /// Write attempts retried after a transient failure
    pub retries: AtomicU64,

    /// Writes that failed after exhausting retries
    pub failures: AtomicU64,

    start_time: Option<Instant>,

    // Per-stage wall time (microseconds)
    pub create_tables_us: AtomicU64,
    pub load_staging_us: AtomicU64,
    pub filter_latest_us: AtomicU64,
    pub load_partitions_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_ingested(&self, count: u64) {
        self.records_ingested.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_rejected(&self, count: u64) {
        self.records_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_deduplicated(&self, count: u64) {
        self.records_deduplicated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_routed(&self, count: u64) {
        self.records_routed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_unrouted(&self, count: u64) {
        self.records_unrouted.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a replaced destination table.
    pub fn add_partition_written(&self) {
        self.partitions_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retried write.
    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure.
    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent in a stage.
    pub fn add_stage_time(&self, stage: StageKind, duration: Duration) {
        let counter = match stage {
            StageKind::CreateTables => &self.create_tables_us,
            StageKind::LoadStaging => &self.load_staging_us,
            StageKind::FilterLatest => &self.filter_latest_us,
            StageKind::LoadPartitions => &self.load_partitions_us,
        };
        counter.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Records ingested per second.
    pub fn records_per_second(&self) -> f64 {
        let records = self.records_ingested.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            records as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            records_ingested: self.records_ingested.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            records_deduplicated: self.records_deduplicated.load(Ordering::Relaxed),
            records_routed: self.records_routed.load(Ordering::Relaxed),
            records_unrouted: self.records_unrouted.load(Ordering::Relaxed),
            partitions_written: self.partitions_written.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            records_per_second: self.records_per_second(),
            create_tables_secs: secs(&self.create_tables_us),
            load_staging_secs: secs(&self.load_staging_us),
            filter_latest_secs: secs(&self.filter_latest_us),
            load_partitions_secs: secs(&self.load_partitions_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub records_ingested: u64,
    pub records_rejected: u64,
    pub records_deduplicated: u64,
    pub records_routed: u64,
    pub records_unrouted: u64,
    pub partitions_written: u64,
    pub retries: u64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub records_per_second: f64,
    pub create_tables_secs: f64,
    pub load_staging_secs: f64,
    pub filter_latest_secs: f64,
    pub load_partitions_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    fn stage_total_secs(&self) -> f64 {
        self.create_tables_secs + self.load_staging_secs + self.filter_latest_secs + self.load_partitions_secs
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.stage_total_secs();
        let pct = |secs: f64| if total > 0.0 { secs / total * 100.0 } else { 0.0 };

        write!(
            f,
            "Records: {} ingested, {} rejected, {} canonical | \
             Routed: {} | Unrouted: {} | Partitions: {} | \
             Retries: {} | Failures: {} | Elapsed: {:.1}s | \
             Time: create {:.0}% | staging {:.0}% | latest {:.0}% | partitions {:.0}%",
            self.records_ingested,
            self.records_rejected,
            self.records_deduplicated,
            self.records_routed,
            self.records_unrouted,
            self.partitions_written,
            self.retries,
            self.failures,
            self.elapsed.as_secs_f64(),
            pct(self.create_tables_secs),
            pct(self.load_staging_secs),
            pct(self.filter_latest_secs),
            pct(self.load_partitions_secs),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_records: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_records: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_records,
        }
    }

    /// Start the periodic reporter. Stops when `shutdown` fires or closes.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_records > 0 {
                        (snapshot.records_ingested + snapshot.records_rejected) as f64
                            / self.total_records as f64
                            * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}% ingested] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Records ingested: {}", snapshot.records_ingested);
        println!("Records rejected: {}", snapshot.records_rejected);
        println!("Canonical customers: {}", snapshot.records_deduplicated);
        println!("Routed: {}", snapshot.records_routed);
        println!("Unrouted: {}", snapshot.records_unrouted);
        println!("Tables replaced: {}", snapshot.partitions_written);
        println!("Retries: {}", snapshot.retries);
        println!("Failures: {}", snapshot.failures);

        let total = snapshot.stage_total_secs();
        if total > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            for (stage, secs) in [
                (StageKind::CreateTables, snapshot.create_tables_secs),
                (StageKind::LoadStaging, snapshot.load_staging_secs),
                (StageKind::FilterLatest, snapshot.filter_latest_secs),
                (StageKind::LoadPartitions, snapshot.load_partitions_secs),
            ] {
                println!("{:<16} {:>7.3}s ({:>5.1}%)", stage, secs, secs / total * 100.0);
            }
        }
        println!("========================\n");
    }
}
