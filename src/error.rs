//! Error types for the store and each pipeline stage.

use crate::pipeline::StageKind;
use crate::record::CountryCode;
use thiserror::Error;

/// Failures of the table store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[from] object_store::Error),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table '{table}' row {row}: {details}")]
    Constraint {
        table: String,
        row: usize,
        details: String,
    },

    #[error("corrupt data in '{location}': {details}")]
    Corrupt { location: String, details: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Fatal schema-management failure; aborts the run before data moves.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("store unreachable while ensuring table '{table}': {source}")]
    Store {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("table '{table}' exists with an incompatible schema: {details}")]
    Incompatible { table: String, details: String },
}

/// Fatal ingestion failure. Individual invalid records are not errors; they
/// are reported in the ingest summary.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to append {rows} rows to staging: {source}")]
    Append {
        rows: usize,
        #[source]
        source: StoreError,
    },
}

/// Fatal deduplication failure.
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("staging table unreadable: {0}")]
    StagingUnreadable(#[source] StoreError),

    #[error("failed to replace canonical snapshot: {0}")]
    SnapshotWrite(#[source] StoreError),
}

/// Failure writing routed output. An unmatched country is not an error.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("failed to replace partition {country} after {attempts} attempts ({replaced} partitions already replaced): {source}")]
    PartitionWrite {
        country: CountryCode,
        attempts: usize,
        replaced: usize,
        #[source]
        source: StoreError,
    },

    #[error("failed to replace unrouted table: {0}")]
    UnroutedWrite(#[source] StoreError),
}

/// What went wrong during a run.
#[derive(Error, Debug)]
pub enum PipelineErrorKind {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("pipeline '{0}' is already running")]
    Locked(String),

    #[error("run lock error: {0}")]
    Lock(#[source] StoreError),

    #[error("enrichment task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("run cancelled")]
    Cancelled,
}

/// A failed run: the stage that failed, how many records had been processed
/// and the cause. The store is left in the last committed stage's state.
#[derive(Error, Debug)]
#[error("pipeline failed at stage {stage} after processing {processed} records: {kind}")]
pub struct PipelineError {
    pub stage: StageKind,
    pub processed: usize,
    #[source]
    pub kind: PipelineErrorKind,
}

impl PipelineError {
    pub fn new(stage: StageKind, processed: usize, kind: impl Into<PipelineErrorKind>) -> Self {
        Self {
            stage,
            processed,
            kind: kind.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, PipelineErrorKind::Cancelled)
    }
}
