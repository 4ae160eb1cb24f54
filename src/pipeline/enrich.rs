//! Enrichment and routing.
//!
//! Derived fields are computed on the rayon pool; records are then classified
//! by their `country` attribute into one destination partition or the
//! unrouted list. Writing replaces each destination table's contents, one
//! concurrent task per partition.

use crate::catalog::Catalog;
use crate::config::{AgePolicy, RetryConfig};
use crate::error::{RoutingError, StoreError};
use crate::io::{to_row, Row, TableStore};
use crate::pipeline::plan::Branch;
use crate::pipeline::Metrics;
use crate::record::{CanonicalRecord, CountryCode, CustomerId, EnrichedRecord};
use chrono::{Datelike, NaiveDate};
use futures::stream::{self, StreamExt};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Parameters of the derived-field computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichOptions {
    /// `flag_days_gt_30` is set when days since last consultation exceed this
    pub stale_after_days: i64,
    pub age_policy: AgePolicy,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            stale_after_days: 30,
            age_policy: AgePolicy::CalendarYear,
        }
    }
}

/// Age on `as_of` for someone born on `dob`.
pub fn compute_age(dob: NaiveDate, as_of: NaiveDate, policy: AgePolicy) -> i32 {
    let years = as_of.year() - dob.year();
    match policy {
        AgePolicy::CalendarYear => years,
        AgePolicy::Exact => {
            if (as_of.month(), as_of.day()) < (dob.month(), dob.day()) {
                years - 1
            } else {
                years
            }
        }
    }
}

/// Compute the derived fields for one canonical record.
pub fn enrich(canonical: &CanonicalRecord, as_of: NaiveDate, options: &EnrichOptions) -> EnrichedRecord {
    let record = canonical.record.clone();
    let age = record.dob.map(|dob| compute_age(dob, as_of, options.age_policy));
    let days_since_last_consulted = record
        .last_consulted_date
        .map(|last| (as_of - last).num_days());
    let flag_days_gt_30 = days_since_last_consulted.map(|days| days > options.stale_after_days);

    EnrichedRecord {
        record,
        age,
        days_since_last_consulted,
        flag_days_gt_30,
    }
}

/// Enriched records classified by destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutedOutput {
    /// One entry per supported country, possibly empty, ordered by customer id
    pub partitions: BTreeMap<CountryCode, Vec<EnrichedRecord>>,

    /// Records whose country is absent or unsupported, ordered by customer id
    pub unrouted: Vec<EnrichedRecord>,
}

impl RoutedOutput {
    pub fn routed_counts(&self) -> BTreeMap<CountryCode, usize> {
        self.partitions
            .iter()
            .map(|(code, records)| (code.clone(), records.len()))
            .collect()
    }

    pub fn routed_total(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn total(&self) -> usize {
        self.routed_total() + self.unrouted.len()
    }
}

/// Enrich every canonical record and classify it by country.
///
/// Every record lands in exactly one of its country's partition or `unrouted`.
pub fn enrich_and_route(
    canonical: &BTreeMap<CustomerId, CanonicalRecord>,
    as_of: NaiveDate,
    countries: &BTreeSet<CountryCode>,
    options: &EnrichOptions,
) -> RoutedOutput {
    let inputs: Vec<&CanonicalRecord> = canonical.values().collect();
    let enriched: Vec<EnrichedRecord> = inputs
        .par_iter()
        .map(|record| enrich(record, as_of, options))
        .collect();

    let mut output = RoutedOutput {
        partitions: countries.iter().map(|code| (code.clone(), Vec::new())).collect(),
        unrouted: Vec::new(),
    };

    for record in enriched {
        let partition = record
            .record
            .country
            .as_deref()
            .and_then(|country| output.partitions.get_mut(&CountryCode::from(country)));

        match partition {
            Some(records) => records.push(record),
            None => {
                tracing::warn!(
                    "Customer {} has unsupported country {:?}; not routed",
                    record.customer_id(),
                    record.record.country
                );
                output.unrouted.push(record);
            }
        }
    }

    output
}

/// Replace a table, retrying transient failures with exponential backoff.
/// Returns the number of attempts used.
async fn replace_with_retry(
    store: &dyn TableStore,
    table: &str,
    rows: Vec<Row>,
    retry: &RetryConfig,
    metrics: &Metrics,
) -> Result<usize, (usize, StoreError)> {
    let mut attempt = 0;
    let mut backoff = retry.initial_backoff_ms;

    loop {
        attempt += 1;
        match store.replace_table(table, rows.clone()).await {
            Ok(()) => return Ok(attempt),
            Err(e) => {
                if attempt > retry.max_retries {
                    tracing::error!("Replacing {} failed after {} attempts: {}", table, attempt, e);
                    metrics.add_failure();
                    return Err((attempt, e));
                }

                tracing::warn!(
                    "Replacing {} attempt {} failed: {}, retrying in {}ms",
                    table,
                    attempt,
                    e,
                    backoff
                );
                metrics.add_retry();

                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff = next_backoff(backoff, retry.max_backoff_ms);
            }
        }
    }
}

fn next_backoff(current_ms: u64, max_ms: u64) -> u64 {
    current_ms.saturating_mul(2).min(max_ms)
}

fn encode(records: &[EnrichedRecord]) -> Result<Vec<Row>, StoreError> {
    records.iter().map(to_row).collect()
}

/// Write routed output: replace every destination partition and the unrouted
/// table, with at most `concurrency` writes in flight.
///
/// Partitions touch disjoint tables, so completion order does not matter. A
/// failed partition does not roll back partitions already replaced.
pub async fn write_routed(
    store: &dyn TableStore,
    catalog: &Catalog,
    routed: &RoutedOutput,
    retry: &RetryConfig,
    concurrency: usize,
    metrics: &Metrics,
) -> Result<(), RoutingError> {
    let mut branches: Vec<Branch> = catalog.countries().cloned().map(Branch::Partition).collect();
    branches.push(Branch::Unrouted);

    let results: Vec<(Branch, Result<usize, (usize, StoreError)>)> = stream::iter(branches)
        .map(|branch| async move {
            let (table, records) = match &branch {
                Branch::Partition(code) => (
                    catalog.destination(code).map(|schema| schema.name.clone()),
                    routed.partitions.get(code).map(Vec::as_slice).unwrap_or(&[]),
                ),
                Branch::Unrouted => (Some(catalog.unrouted.name.clone()), routed.unrouted.as_slice()),
            };
            let Some(table) = table else {
                return (branch, Ok(0));
            };

            let result = match encode(records) {
                Ok(rows) => replace_with_retry(store, &table, rows, retry, metrics).await,
                Err(e) => Err((1, e)),
            };
            if result.is_ok() {
                metrics.add_partition_written();
                tracing::info!("Replaced {} with {} records", table, records.len());
            }
            (branch, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let replaced = results
        .iter()
        .filter(|(branch, result)| matches!(branch, Branch::Partition(_)) && result.is_ok())
        .count();

    let mut failures: Vec<_> = results
        .into_iter()
        .filter_map(|(branch, result)| result.err().map(|err| (branch, err)))
        .collect();
    failures.sort_by(|a, b| a.0.cmp(&b.0));

    match failures.into_iter().next() {
        None => Ok(()),
        Some((Branch::Partition(country), (attempts, source))) => Err(RoutingError::PartitionWrite {
            country,
            attempts,
            replaced,
            source,
        }),
        Some((Branch::Unrouted, (_, source))) => Err(RoutingError::UnroutedWrite(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableSchema;
    use crate::io::{from_row, CreateOutcome, ObjectTableStore};
    use crate::record::CustomerRecord;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn canonical(id: &str, country: Option<&str>, last: Option<&str>, dob: Option<&str>) -> CanonicalRecord {
        CanonicalRecord::from(CustomerRecord {
            customer_name: "Test".into(),
            customer_id: id.into(),
            open_date: date("2022-01-01"),
            last_consulted_date: last.map(date),
            vaccination_id: Some("VAC01".into()),
            doctor_consulted: None,
            state: None,
            country: country.map(Into::into),
            dob: dob.map(date),
            is_active: Some("Y".into()),
        })
    }

    fn countries() -> BTreeSet<CountryCode> {
        ["IND", "USA"].into_iter().map(CountryCode::from).collect()
    }

    fn by_id(records: Vec<CanonicalRecord>) -> BTreeMap<CustomerId, CanonicalRecord> {
        records
            .into_iter()
            .map(|r| (r.customer_id().to_string(), r))
            .collect()
    }

    #[test]
    fn test_calendar_year_age_ignores_birthday() {
        let dob = date("1990-05-15");
        assert_eq!(compute_age(dob, date("2023-03-10"), AgePolicy::CalendarYear), 33);
        assert_eq!(compute_age(dob, date("2023-03-10"), AgePolicy::Exact), 32);
        assert_eq!(compute_age(dob, date("2023-05-15"), AgePolicy::Exact), 33);
        assert_eq!(compute_age(dob, date("2023-12-31"), AgePolicy::Exact), 33);
    }

    #[test]
    fn test_days_since_and_flag_ind_scenario() {
        let record = canonical("CUST001", Some("IND"), Some("2023-02-01"), Some("1990-05-15"));
        let enriched = enrich(&record, date("2023-03-10"), &EnrichOptions::default());
        assert_eq!(enriched.days_since_last_consulted, Some(37));
        assert_eq!(enriched.flag_days_gt_30, Some(true));
        assert_eq!(enriched.age, Some(33));
    }

    #[test]
    fn test_days_since_and_flag_usa_scenario() {
        let record = canonical("CUST011", Some("USA"), Some("2023-01-15"), Some("1987-10-25"));
        let enriched = enrich(&record, date("2023-01-20"), &EnrichOptions::default());
        assert_eq!(enriched.days_since_last_consulted, Some(5));
        assert_eq!(enriched.flag_days_gt_30, Some(false));
        assert_eq!(enriched.age, Some(36));
    }

    #[test]
    fn test_threshold_boundary() {
        let options = EnrichOptions::default();
        let at = enrich(&canonical("A", None, Some("2023-01-01"), None), date("2023-01-31"), &options);
        assert_eq!(at.days_since_last_consulted, Some(30));
        assert_eq!(at.flag_days_gt_30, Some(false));

        let over = enrich(&canonical("A", None, Some("2023-01-01"), None), date("2023-02-01"), &options);
        assert_eq!(over.flag_days_gt_30, Some(true));

        let custom = EnrichOptions {
            stale_after_days: 7,
            ..Default::default()
        };
        let stale = enrich(&canonical("A", None, Some("2023-01-01"), None), date("2023-01-09"), &custom);
        assert_eq!(stale.flag_days_gt_30, Some(true));
    }

    #[test]
    fn test_undefined_propagates() {
        let enriched = enrich(&canonical("A", Some("IND"), None, None), date("2023-03-10"), &EnrichOptions::default());
        assert_eq!(enriched.days_since_last_consulted, None);
        assert_eq!(enriched.flag_days_gt_30, None);
        assert_eq!(enriched.age, None);
    }

    #[test]
    fn test_future_consultation_is_negative() {
        let enriched = enrich(&canonical("A", None, Some("2023-03-15"), None), date("2023-03-10"), &EnrichOptions::default());
        assert_eq!(enriched.days_since_last_consulted, Some(-5));
        assert_eq!(enriched.flag_days_gt_30, Some(false));
    }

    #[test]
    fn test_flag_matches_days() {
        let as_of = date("2023-06-01");
        let options = EnrichOptions::default();
        for day in ["2023-01-01", "2023-04-30", "2023-05-01", "2023-05-02", "2023-06-01", "2023-07-01"] {
            let enriched = enrich(&canonical("A", None, Some(day), None), as_of, &options);
            let days = enriched.days_since_last_consulted.unwrap();
            assert_eq!(enriched.flag_days_gt_30, Some(days > 30), "date {}", day);
        }
    }

    #[test]
    fn test_routing_exhaustive_and_disjoint() {
        let input = by_id(vec![
            canonical("CUST001", Some("IND"), Some("2023-02-01"), None),
            canonical("CUST011", Some("USA"), Some("2023-01-15"), None),
            canonical("CUST020", Some("FRA"), None, None),
            canonical("CUST021", None, None, None),
            canonical("CUST022", Some("ind"), None, None),
            canonical("CUST002", Some("IND"), None, None),
        ]);

        let routed = enrich_and_route(&input, date("2023-03-10"), &countries(), &EnrichOptions::default());
        assert_eq!(routed.total(), input.len());

        let mut seen: Vec<String> = routed
            .partitions
            .values()
            .flatten()
            .chain(routed.unrouted.iter())
            .map(|r| r.customer_id().to_string())
            .collect();
        seen.sort();
        let mut expected: Vec<String> = input.keys().cloned().collect();
        expected.sort();
        assert_eq!(seen, expected);

        let ind: Vec<_> = routed.partitions[&CountryCode::from("IND")]
            .iter()
            .map(|r| r.customer_id())
            .collect();
        assert_eq!(ind, vec!["CUST001", "CUST002"]);
        for (code, records) in &routed.partitions {
            assert!(records.iter().all(|r| code.matches(r.record.country.as_deref())));
        }

        let unrouted: Vec<_> = routed.unrouted.iter().map(|r| r.customer_id()).collect();
        assert_eq!(unrouted, vec!["CUST020", "CUST021", "CUST022"]);
    }

    #[test]
    fn test_empty_partitions_present() {
        let input = by_id(vec![canonical("CUST020", Some("FRA"), None, None)]);
        let routed = enrich_and_route(&input, date("2023-03-10"), &countries(), &EnrichOptions::default());
        assert_eq!(routed.partitions.len(), 2);
        assert!(routed.partitions.values().all(Vec::is_empty));
        assert_eq!(routed.unrouted.len(), 1);
        assert_eq!(routed.routed_counts()[&CountryCode::from("USA")], 0);
    }

    async fn setup(store: &ObjectTableStore) -> Catalog {
        let catalog = Catalog::new(countries().iter());
        crate::catalog::ensure_schema(store, &catalog).await.unwrap();
        catalog
    }

    #[tokio::test]
    async fn test_write_routed_replaces_partitions() {
        let store = ObjectTableStore::in_memory();
        let catalog = setup(&store).await;
        let metrics = Metrics::new();

        let input = by_id(vec![
            canonical("CUST001", Some("IND"), Some("2023-02-01"), Some("1990-05-15")),
            canonical("CUST020", Some("FRA"), None, None),
        ]);
        let routed = enrich_and_route(&input, date("2023-03-10"), &countries(), &EnrichOptions::default());
        write_routed(&store, &catalog, &routed, &RetryConfig::default(), 4, &metrics)
            .await
            .unwrap();

        let ind: Vec<EnrichedRecord> = store
            .read_all("table_ind")
            .await
            .unwrap()
            .into_iter()
            .map(|row| from_row(row).unwrap())
            .collect();
        assert_eq!(ind, routed.partitions[&CountryCode::from("IND")]);
        assert!(store.read_all("table_usa").await.unwrap().is_empty());
        assert_eq!(store.read_all("unrouted_customers").await.unwrap().len(), 1);
        assert_eq!(metrics.snapshot().partitions_written, 3);

        // A second run with fewer records replaces rather than merges.
        let routed = enrich_and_route(&BTreeMap::new(), date("2023-03-10"), &countries(), &EnrichOptions::default());
        write_routed(&store, &catalog, &routed, &RetryConfig::default(), 4, &metrics)
            .await
            .unwrap();
        assert!(store.read_all("table_ind").await.unwrap().is_empty());
    }

    /// Store whose replace_table fails for one table a fixed number of times.
    struct FlakyStore {
        inner: ObjectTableStore,
        table: String,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl TableStore for FlakyStore {
        async fn create_if_absent(&self, schema: &TableSchema) -> Result<CreateOutcome, StoreError> {
            self.inner.create_if_absent(schema).await
        }

        async fn append_rows(&self, table: &str, rows: Vec<Row>) -> Result<(), StoreError> {
            self.inner.append_rows(table, rows).await
        }

        async fn replace_table(&self, table: &str, rows: Vec<Row>) -> Result<(), StoreError> {
            if table == self.table
                && self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(StoreError::TableNotFound(format!("{} (injected)", table)));
            }
            self.inner.replace_table(table, rows).await
        }

        async fn read_all(&self, table: &str) -> Result<Vec<Row>, StoreError> {
            self.inner.read_all(table).await
        }
    }

    fn fast_retry(max_retries: usize) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn test_next_backoff_is_capped() {
        assert_eq!(next_backoff(500, 10_000), 1_000);
        assert_eq!(next_backoff(8_000, 10_000), 10_000);
        assert_eq!(next_backoff(u64::MAX / 2 + 1, u64::MAX), u64::MAX);
        assert_eq!(next_backoff(u64::MAX, 10_000), 10_000);
    }

    #[tokio::test]
    async fn test_write_routed_retries_transient_failure() {
        let inner = ObjectTableStore::in_memory();
        let catalog = setup(&inner).await;
        let store = FlakyStore {
            inner,
            table: "table_usa".into(),
            failures_left: AtomicUsize::new(1),
        };
        let metrics = Metrics::new();

        let input = by_id(vec![canonical("CUST011", Some("USA"), Some("2023-01-15"), None)]);
        let routed = enrich_and_route(&input, date("2023-01-20"), &countries(), &EnrichOptions::default());
        write_routed(&store, &catalog, &routed, &fast_retry(1), 2, &metrics)
            .await
            .unwrap();

        assert_eq!(store.read_all("table_usa").await.unwrap().len(), 1);
        assert_eq!(metrics.snapshot().retries, 1);
    }

    #[tokio::test]
    async fn test_write_routed_reports_failed_partition() {
        let inner = ObjectTableStore::in_memory();
        let catalog = setup(&inner).await;
        let store = FlakyStore {
            inner,
            table: "table_usa".into(),
            failures_left: AtomicUsize::new(10),
        };
        let metrics = Metrics::new();

        let input = by_id(vec![
            canonical("CUST001", Some("IND"), None, None),
            canonical("CUST011", Some("USA"), None, None),
        ]);
        let routed = enrich_and_route(&input, date("2023-01-20"), &countries(), &EnrichOptions::default());
        let err = write_routed(&store, &catalog, &routed, &fast_retry(2), 2, &metrics)
            .await
            .unwrap_err();

        match err {
            RoutingError::PartitionWrite { country, attempts, replaced, .. } => {
                assert_eq!(country, CountryCode::from("USA"));
                assert_eq!(attempts, 3);
                assert_eq!(replaced, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The healthy partition was replaced and is not rolled back.
        assert_eq!(store.read_all("table_ind").await.unwrap().len(), 1);
        assert_eq!(metrics.snapshot().failures, 1);
    }
}
