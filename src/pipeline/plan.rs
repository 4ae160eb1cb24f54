//! Stage plan for a run.
//!
//! ```text
//! create_tables ──▶ load_staging ──▶ filter_latest ──▶ load_partitions
//!                                                      ├─ table_ind
//!                                                      ├─ table_usa
//!                                                      └─ unrouted_customers
//! ```
//!
//! Stages run strictly in order; only the branches of `load_partitions` run
//! concurrently, and each branch writes a distinct table.

use crate::catalog::Catalog;
use crate::record::CountryCode;
use serde::Serialize;
use std::fmt;

/// The four sequential stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    CreateTables,
    LoadStaging,
    FilterLatest,
    LoadPartitions,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::CreateTables,
        StageKind::LoadStaging,
        StageKind::FilterLatest,
        StageKind::LoadPartitions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::CreateTables => "create_tables",
            StageKind::LoadStaging => "load_staging",
            StageKind::FilterLatest => "filter_latest",
            StageKind::LoadPartitions => "load_partitions",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concurrent write target of the partition stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Partition(CountryCode),
    Unrouted,
}

/// A stage and, for the partition stage, its branches with their tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStage {
    pub kind: StageKind,
    pub tables: Vec<String>,
    pub branches: Vec<(Branch, String)>,
}

/// Ordered stages for one run over a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagePlan {
    pub stages: Vec<PlannedStage>,
}

impl StagePlan {
    pub fn new(catalog: &Catalog) -> Self {
        let branches: Vec<(Branch, String)> = catalog
            .countries()
            .filter_map(|code| {
                catalog
                    .destination(code)
                    .map(|schema| (Branch::Partition(code.clone()), schema.name.clone()))
            })
            .chain([(Branch::Unrouted, catalog.unrouted.name.clone())])
            .collect();

        let stages = vec![
            PlannedStage {
                kind: StageKind::CreateTables,
                tables: catalog.tables().map(|schema| schema.name.clone()).collect(),
                branches: Vec::new(),
            },
            PlannedStage {
                kind: StageKind::LoadStaging,
                tables: vec![catalog.staging.name.clone()],
                branches: Vec::new(),
            },
            PlannedStage {
                kind: StageKind::FilterLatest,
                tables: vec![catalog.staging.name.clone(), catalog.snapshot.name.clone()],
                branches: Vec::new(),
            },
            PlannedStage {
                kind: StageKind::LoadPartitions,
                tables: branches.iter().map(|(_, table)| table.clone()).collect(),
                branches,
            },
        ];

        Self { stages }
    }

    pub fn kinds(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.stages.iter().map(|stage| stage.kind)
    }

    /// Human-readable rendering for the `plan` command.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, stage) in self.stages.iter().enumerate() {
            out.push_str(&format!("{}. {} [{}]\n", i + 1, stage.kind, stage.tables.join(", ")));
            for (branch, table) in &stage.branches {
                let label = match branch {
                    Branch::Partition(code) => format!("country = {}", code),
                    Branch::Unrouted => "unsupported or missing country".to_string(),
                };
                out.push_str(&format!("   ├─ {} ({})\n", table, label));
            }
        }
        out
    }
}
