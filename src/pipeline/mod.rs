//! Pipeline stages and run orchestration.

pub mod dedup;
pub mod enrich;
pub mod ingest;
mod metrics;
mod orchestrator;
mod plan;


pub use dedup::select_latest;
pub use enrich::{compute_age, enrich, enrich_and_route, EnrichOptions, RoutedOutput};
pub use ingest::{validate_record, IngestSummary, RejectReason, RejectedRecord};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use orchestrator::{CancellationFlag, Orchestrator, RunSummary};
pub use plan::{Branch, PlannedStage, StageKind, StagePlan};
