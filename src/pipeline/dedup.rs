//! Deduplication: one canonical record per customer.
//!
//! Within each customer's staged records the winner is chosen by:
//!
//! 1. a defined `last_consulted_date` beats an undefined one;
//! 2. among defined dates, the later date wins;
//! 3. on a tie (equal dates, or no dates at all) the record ingested last wins.
//!
//! Staging is read in append order, so "ingested last" is the highest
//! position in the staged slice.

use crate::error::{DedupError, StoreError};
use crate::io::{from_row, to_row, TableStore};
use crate::record::{CanonicalRecord, CustomerId, CustomerRecord};
use chrono::NaiveDate;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Ranking key for a staged record. Larger keys win.
///
/// `Option<NaiveDate>` orders `None` below every `Some`, which gives rules 1
/// and 2; the staging position breaks ties (rule 3).
fn rank(record: &CustomerRecord, position: usize) -> (Option<NaiveDate>, usize) {
    (record.last_consulted_date, position)
}

/// Select the latest record for every customer identifier.
///
/// Pure and deterministic: the same staged slice always yields the same map.
pub fn select_latest(staged: &[CustomerRecord]) -> BTreeMap<CustomerId, CanonicalRecord> {
    let mut winners: BTreeMap<&str, (usize, &CustomerRecord)> = BTreeMap::new();

    for (position, record) in staged.iter().enumerate() {
        match winners.entry(record.customer_id.as_str()) {
            Entry::Vacant(slot) => {
                slot.insert((position, record));
            }
            Entry::Occupied(mut slot) => {
                let (best_position, best) = *slot.get();
                if rank(record, position) > rank(best, best_position) {
                    slot.insert((position, record));
                }
            }
        }
    }

    winners
        .into_iter()
        .map(|(id, (_, record))| (id.to_string(), CanonicalRecord::from(record.clone())))
        .collect()
}

/// Read staged records in append order.
pub async fn read_staged(store: &dyn TableStore, staging_table: &str) -> Result<Vec<CustomerRecord>, StoreError> {
    store
        .read_all(staging_table)
        .await?
        .into_iter()
        .map(from_row)
        .collect()
}

/// Deduplicate staging into a fresh canonical snapshot.
///
/// The snapshot table is replaced wholesale; the returned map is exactly what
/// was written.
pub async fn run_dedup(
    store: &dyn TableStore,
    staging_table: &str,
    snapshot_table: &str,
) -> Result<(usize, BTreeMap<CustomerId, CanonicalRecord>), DedupError> {
    let staged = read_staged(store, staging_table)
        .await
        .map_err(DedupError::StagingUnreadable)?;

    let canonical = select_latest(&staged);

    let rows = canonical
        .values()
        .map(to_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(DedupError::SnapshotWrite)?;
    store
        .replace_table(snapshot_table, rows)
        .await
        .map_err(DedupError::SnapshotWrite)?;

    tracing::info!(
        "Deduplicated {} staged records into {} customers",
        staged.len(),
        canonical.len()
    );

    Ok((staged.len(), canonical))
}
