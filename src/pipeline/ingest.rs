//! Ingestion: validate raw records and append the valid ones to staging.

use crate::error::IngestError;
use crate::io::{to_row, TableStore};
use crate::record::{parse_date, CustomerRecord, RawCustomerRecord};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

/// Why a record was not ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    MissingIdentifier,
    MissingOpenDate,
    InvalidDate { field: &'static str, value: String },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingIdentifier => write!(f, "customer_id is missing or empty"),
            RejectReason::MissingOpenDate => write!(f, "open_date is missing"),
            RejectReason::InvalidDate { field, value } => {
                write!(f, "{} '{}' is not a YYYY-MM-DD date", field, value)
            }
        }
    }
}

/// A rejected input record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    /// Position in the input batch
    pub index: usize,
    pub customer_id: Option<String>,
    #[serde(flatten)]
    pub reason: RejectReason,
}

/// Outcome of an ingestion batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl IngestSummary {
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    pub fn total(&self) -> usize {
        self.accepted + self.rejected.len()
    }
}

fn optional_date(field: &'static str, value: Option<&str>) -> Result<Option<NaiveDate>, RejectReason> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse_date(text).map(Some).ok_or_else(|| RejectReason::InvalidDate {
            field,
            value: text.to_string(),
        }),
    }
}

/// Check a raw record against the staging constraints.
///
/// The identifier must be non-empty after trimming (it is stored trimmed) and
/// the open date must parse. Optional dates must parse when present; blank
/// optional dates count as absent. A missing name is stored as empty text.
pub fn validate_record(raw: &RawCustomerRecord) -> Result<CustomerRecord, RejectReason> {
    let customer_id = raw
        .customer_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(RejectReason::MissingIdentifier)?;

    let open_date = match raw.open_date.as_deref().map(str::trim) {
        None | Some("") => return Err(RejectReason::MissingOpenDate),
        Some(text) => parse_date(text).ok_or_else(|| RejectReason::InvalidDate {
            field: "open_date",
            value: text.to_string(),
        })?,
    };

    Ok(CustomerRecord {
        customer_name: raw.customer_name.clone().unwrap_or_default(),
        customer_id: customer_id.to_string(),
        open_date,
        last_consulted_date: optional_date("last_consulted_date", raw.last_consulted_date.as_deref())?,
        vaccination_id: raw.vaccination_id.clone(),
        doctor_consulted: raw.doctor_consulted.clone(),
        state: raw.state.clone(),
        country: raw.country.clone(),
        dob: optional_date("dob", raw.dob.as_deref())?,
        is_active: raw.is_active.clone(),
    })
}

/// Split a batch into accepted records (input order kept) and rejections.
pub fn validate_batch(records: &[RawCustomerRecord]) -> (Vec<CustomerRecord>, Vec<RejectedRecord>) {
    let mut accepted = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();

    for (index, raw) in records.iter().enumerate() {
        match validate_record(raw) {
            Ok(record) => accepted.push(record),
            Err(reason) => rejected.push(RejectedRecord {
                index,
                customer_id: raw.customer_id.clone(),
                reason,
            }),
        }
    }

    (accepted, rejected)
}

/// Validate `records` and append the accepted ones to `staging_table` in one write.
///
/// Invalid records are rejected individually; only a store failure fails the batch.
pub async fn ingest(
    store: &dyn TableStore,
    staging_table: &str,
    records: &[RawCustomerRecord],
) -> Result<IngestSummary, IngestError> {
    let (accepted, rejected) = validate_batch(records);

    for rejection in &rejected {
        tracing::warn!(
            "Rejected record #{} ({}): {}",
            rejection.index,
            rejection.customer_id.as_deref().unwrap_or("<no id>"),
            rejection.reason
        );
    }

    let rows = accepted
        .iter()
        .map(to_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| IngestError::Append {
            rows: accepted.len(),
            source,
        })?;

    if !rows.is_empty() {
        store
            .append_rows(staging_table, rows)
            .await
            .map_err(|source| IngestError::Append {
                rows: accepted.len(),
                source,
            })?;
    }

    tracing::info!(
        "Ingested {} records into {} ({} rejected)",
        accepted.len(),
        staging_table,
        rejected.len()
    );

    Ok(IngestSummary {
        accepted: accepted.len(),
        rejected,
    })
}
