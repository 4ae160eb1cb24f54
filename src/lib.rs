//! Customer Pipeline
//!
//! Batch pipeline that ingests customer records into a staging table, keeps
//! the latest record per customer, enriches it with derived fields and routes
//! it into per-country destination tables.
//!
//! # Architecture
//!
//! - **Catalog**: table schemas and idempotent table creation
//! - **I/O**: the `TableStore` contract over `object_store`, plus the run lock
//! - **Pipeline**: ingestion, deduplication, enrichment and routing, run by the orchestrator
//!
//! # Usage
//!
//! ```no_run
//! use customer_pipeline::{run_pipeline, CancellationFlag, Config};
//! use customer_pipeline::record::sample_records;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let summary = run_pipeline(config, sample_records(), &CancellationFlag::new()).await?;
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod record;

pub use catalog::Catalog;
pub use config::Config;
pub use error::{PipelineError, PipelineErrorKind};
pub use io::{ObjectTableStore, TableStore};
pub use pipeline::{CancellationFlag, Metrics, Orchestrator, RunSummary, StageKind, StagePlan};
pub use record::{CanonicalRecord, CountryCode, CustomerRecord, EnrichedRecord, RawCustomerRecord};

use anyhow::Result;
use pipeline::MetricsReporter;
use std::sync::Arc;

/// Run the full customer pipeline over `records` with the given configuration.
pub async fn run_pipeline(
    config: Config,
    records: Vec<RawCustomerRecord>,
    cancel: &CancellationFlag,
) -> Result<RunSummary> {
    config.validate()?;

    let config = Arc::new(config);

    tracing::info!("Starting pipeline {}", config.pipeline.name);
    tracing::info!(
        "Supported countries: {}",
        config
            .pipeline
            .supported_countries
            .iter()
            .map(CountryCode::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );
    tracing::info!("Tables stored at: {}", config.storage.path_display());

    let (store, prefix) = io::create_object_store(&config.storage)?;
    let orchestrator = Orchestrator::from_object_store(store, &prefix, config.clone());

    let result = orchestrator.run(&records, cancel).await;

    if config.processing.enable_metrics {
        let metrics = orchestrator.metrics();
        MetricsReporter::new(
            metrics.clone(),
            config.processing.metrics_interval_secs,
            records.len() as u64,
        )
        .print_summary();

        if let Some(ref path) = config.processing.metrics_output_path {
            if let Err(e) = metrics.snapshot().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }
    }

    Ok(result?)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool used for enrichment.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
