//! Run orchestration.
//!
//! A run holds the pipeline's store-level lock and executes the stage plan in
//! order. Cancellation is observed at stage boundaries; a cancelled run never
//! starts routing, so destination partitions keep their pre-run contents.

use crate::catalog::{ensure_schema, Catalog};
use crate::config::Config;
use crate::error::{PipelineError, PipelineErrorKind};
use crate::io::{ObjectTableStore, RunLock, TableStore};
use crate::pipeline::dedup::run_dedup;
use crate::pipeline::enrich::{enrich_and_route, write_routed, EnrichOptions};
use crate::pipeline::ingest::{ingest, RejectedRecord};
use crate::pipeline::plan::{StageKind, StagePlan};
use crate::pipeline::{Metrics, MetricsReporter};
use crate::record::{CountryCode, CustomerId, RawCustomerRecord};
use chrono::NaiveDate;
use object_store::ObjectStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Cooperative cancellation shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub pipeline: String,
    pub as_of: NaiveDate,
    pub ingested: usize,
    pub rejected: usize,
    /// Canonical customers after deduplication
    pub deduplicated: usize,
    pub routed_by_country: BTreeMap<CountryCode, usize>,
    pub unrouted: usize,
    pub duration_ms: u64,
    pub rejected_records: Vec<RejectedRecord>,
    pub unrouted_ids: Vec<CustomerId>,
}

/// Executes runs of the customer pipeline against one store.
pub struct Orchestrator {
    store: Arc<dyn TableStore>,
    lock_store: Arc<dyn ObjectStore>,
    lock_prefix: String,
    catalog: Catalog,
    plan: StagePlan,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    /// Create an orchestrator. The run lock lives in `lock_store` under `lock_prefix`.
    pub fn new(
        store: Arc<dyn TableStore>,
        lock_store: Arc<dyn ObjectStore>,
        lock_prefix: impl Into<String>,
        config: Arc<Config>,
    ) -> Self {
        let catalog = Catalog::new(config.pipeline.supported_countries.iter());
        let plan = StagePlan::new(&catalog);
        Self {
            store,
            lock_store,
            lock_prefix: lock_prefix.into(),
            catalog,
            plan,
            config,
            metrics: Metrics::new(),
        }
    }

    /// Tables and the run lock share one object store under `prefix`.
    pub fn from_object_store(store: Arc<dyn ObjectStore>, prefix: &str, config: Arc<Config>) -> Self {
        let tables = Arc::new(ObjectTableStore::new(store.clone(), prefix));
        Self::new(tables, store, prefix, config)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run every stage over `records`.
    ///
    /// Fails with [`PipelineErrorKind::Locked`] if another run of the same
    /// pipeline holds the lock. The lock is released on success and failure.
    pub async fn run(
        &self,
        records: &[RawCustomerRecord],
        cancel: &CancellationFlag,
    ) -> Result<RunSummary, PipelineError> {
        let name = &self.config.pipeline.name;
        let first = StageKind::CreateTables;

        let lock = RunLock::acquire(self.lock_store.clone(), &self.lock_prefix, name)
            .await
            .map_err(|e| PipelineError::new(first, 0, PipelineErrorKind::Lock(e)))?
            .ok_or_else(|| PipelineError::new(first, 0, PipelineErrorKind::Locked(name.clone())))?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.processing.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.processing.metrics_interval_secs,
                records.len() as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let result = self.run_stages(records, cancel).await;

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if let Err(e) = lock.release().await {
            tracing::warn!("Failed to release run lock for {}: {}", name, e);
        }

        match &result {
            Ok(summary) => tracing::info!(
                "Run of {} complete in {}ms: {} ingested, {} canonical, {} unrouted",
                name,
                summary.duration_ms,
                summary.ingested,
                summary.deduplicated,
                summary.unrouted
            ),
            Err(e) => tracing::error!("Run of {} failed: {}", name, e),
        }

        result
    }

    fn begin(&self, stage: StageKind, processed: usize, cancel: &CancellationFlag) -> Result<Instant, PipelineError> {
        if cancel.is_cancelled() {
            tracing::warn!("Run cancelled before {}", stage);
            return Err(PipelineError::new(stage, processed, PipelineErrorKind::Cancelled));
        }
        tracing::info!("Stage {} started", stage);
        Ok(Instant::now())
    }

    fn finish(&self, stage: StageKind, started: Instant) {
        let elapsed = started.elapsed();
        self.metrics.add_stage_time(stage, elapsed);
        tracing::info!("Stage {} finished in {:.3}s", stage, elapsed.as_secs_f64());
    }

    async fn run_stages(
        &self,
        records: &[RawCustomerRecord],
        cancel: &CancellationFlag,
    ) -> Result<RunSummary, PipelineError> {
        let run_started = Instant::now();
        let pipeline = &self.config.pipeline;
        let as_of = pipeline.resolve_as_of();
        let store = self.store.as_ref();
        tracing::info!("Processing {} input records as of {}", records.len(), as_of);

        // create_tables
        let stage = StageKind::CreateTables;
        let started = self.begin(stage, 0, cancel)?;
        ensure_schema(store, &self.catalog)
            .await
            .map_err(|e| PipelineError::new(stage, 0, e))?;
        self.finish(stage, started);

        // load_staging
        let stage = StageKind::LoadStaging;
        let started = self.begin(stage, 0, cancel)?;
        let ingested = ingest(store, &self.catalog.staging.name, records)
            .await
            .map_err(|e| PipelineError::new(stage, 0, e))?;
        self.metrics.add_ingested(ingested.accepted as u64);
        self.metrics.add_rejected(ingested.rejected_count() as u64);
        self.finish(stage, started);

        // filter_latest
        let stage = StageKind::FilterLatest;
        let started = self.begin(stage, ingested.accepted, cancel)?;
        let (_, canonical) = run_dedup(store, &self.catalog.staging.name, &self.catalog.snapshot.name)
            .await
            .map_err(|e| PipelineError::new(stage, ingested.accepted, e))?;
        let deduplicated = canonical.len();
        self.metrics.add_deduplicated(deduplicated as u64);
        self.finish(stage, started);

        // load_partitions
        let stage = StageKind::LoadPartitions;
        let started = self.begin(stage, deduplicated, cancel)?;
        let countries = pipeline.supported_countries.clone();
        let options = EnrichOptions {
            stale_after_days: pipeline.stale_after_days,
            age_policy: pipeline.age_policy,
        };
        let routed = tokio::task::spawn_blocking(move || enrich_and_route(&canonical, as_of, &countries, &options))
            .await
            .map_err(|e| PipelineError::new(stage, deduplicated, e))?;

        let processing = &self.config.processing;
        write_routed(
            store,
            &self.catalog,
            &routed,
            &processing.retry,
            processing.partition_concurrency,
            &self.metrics,
        )
        .await
        .map_err(|e| PipelineError::new(stage, deduplicated, e))?;
        self.metrics.add_routed(routed.routed_total() as u64);
        self.metrics.add_unrouted(routed.unrouted.len() as u64);
        self.finish(stage, started);

        Ok(RunSummary {
            pipeline: pipeline.name.clone(),
            as_of,
            ingested: ingested.accepted,
            rejected: ingested.rejected_count(),
            deduplicated,
            routed_by_country: routed.routed_counts(),
            unrouted: routed.unrouted.len(),
            duration_ms: run_started.elapsed().as_millis() as u64,
            unrouted_ids: routed
                .unrouted
                .iter()
                .map(|record| record.customer_id().to_string())
                .collect(),
            rejected_records: ingested.rejected,
        })
    }
}
