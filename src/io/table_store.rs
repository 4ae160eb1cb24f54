//! Table storage on top of `object_store`.
//!
//! Layout under the store prefix:
//!
//! ```text
//! <table>/_schema.json                      column set, written once (create-only)
//! <table>/rows.jsonl                        rows written by replace_table
//! <table>/part-00000000000000000001.jsonl   rows appended by append_rows, in order
//! ```
//!
//! Rows are JSON objects, one per line. Every write is a single object put, so
//! a reader sees either the old or the new contents of an object.

use crate::catalog::TableSchema;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutMode, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// One row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

const SCHEMA_FILE: &str = "_schema.json";
const ROWS_FILE: &str = "rows.jsonl";
const PART_PREFIX: &str = "part-";
const PART_SUFFIX: &str = ".jsonl";

/// Attempts to claim a part number before giving up on an append.
const MAX_APPEND_ATTEMPTS: usize = 16;

/// Result of [`TableStore::create_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created,
    /// The table already existed with this schema. It was not modified.
    Existing(TableSchema),
}

/// The minimal storage contract the pipeline depends on.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Create the table unless it exists. Never alters an existing table.
    async fn create_if_absent(&self, schema: &TableSchema) -> StoreResult<CreateOutcome>;

    /// Append rows after all existing rows.
    async fn append_rows(&self, table: &str, rows: Vec<Row>) -> StoreResult<()>;

    /// Replace the table's contents with `rows`.
    async fn replace_table(&self, table: &str, rows: Vec<Row>) -> StoreResult<()>;

    /// Read every row in write order.
    async fn read_all(&self, table: &str) -> StoreResult<Vec<Row>>;
}

/// Serialize a value into a row. The value must serialize to a JSON object.
pub fn to_row<T: Serialize>(value: &T) -> StoreResult<Row> {
    match serde_json::to_value(value)? {
        Value::Object(row) => Ok(row),
        other => Err(StoreError::Corrupt {
            location: "<row>".to_string(),
            details: format!("expected a JSON object, got {}", other),
        }),
    }
}

/// Deserialize a row into a typed value.
pub fn from_row<T: DeserializeOwned>(row: Row) -> StoreResult<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

/// [`TableStore`] backed by any `object_store` implementation.
#[derive(Clone)]
pub struct ObjectTableStore {
    store: Arc<dyn ObjectStore>,
    prefix: Vec<String>,
}

impl ObjectTableStore {
    /// Create a table store rooted at `prefix` (empty for the store root).
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        let prefix = prefix
            .split('/')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        Self { store, prefix }
    }

    /// In-memory store, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "")
    }

    fn path(&self, parts: &[&str]) -> Path {
        Path::from_iter(
            self.prefix
                .iter()
                .map(String::as_str)
                .chain(parts.iter().copied()),
        )
    }

    fn part_name(seq: u64) -> String {
        format!("{}{:020}{}", PART_PREFIX, seq, PART_SUFFIX)
    }

    fn parse_part(name: &str) -> Option<u64> {
        name.strip_prefix(PART_PREFIX)?
            .strip_suffix(PART_SUFFIX)?
            .parse()
            .ok()
    }

    async fn load_schema(&self, table: &str) -> StoreResult<TableSchema> {
        let path = self.path(&[table, SCHEMA_FILE]);
        match self.store.get(&path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    location: path.to_string(),
                    details: e.to_string(),
                })
            }
            Err(object_store::Error::NotFound { .. }) => {
                Err(StoreError::TableNotFound(table.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Append parts currently in the table, sorted by sequence number.
    async fn list_parts(&self, table: &str) -> StoreResult<Vec<(u64, Path)>> {
        let prefix = self.path(&[table]);
        let listed: Vec<_> = match self.store.list(Some(&prefix)).try_collect().await {
            Ok(listed) => listed,
            Err(object_store::Error::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut parts: Vec<(u64, Path)> = listed
            .into_iter()
            .filter_map(|meta| {
                let seq = meta.location.filename().and_then(Self::parse_part)?;
                Some((seq, meta.location))
            })
            .collect();
        parts.sort_by_key(|(seq, _)| *seq);
        Ok(parts)
    }

    async fn read_object(&self, path: &Path) -> StoreResult<Option<Vec<Row>>> {
        let bytes = match self.store.get(path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_rows(&bytes, path).map(Some)
    }

    fn validate(schema: &TableSchema, rows: &[Row]) -> StoreResult<()> {
        for (idx, row) in rows.iter().enumerate() {
            schema
                .validate_row(row)
                .map_err(|details| StoreError::Constraint {
                    table: schema.name.clone(),
                    row: idx,
                    details,
                })?;
        }
        Ok(())
    }
}

fn encode_rows(rows: &[Row]) -> StoreResult<Bytes> {
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, row)?;
        buf.push(b'\n');
    }
    Ok(Bytes::from(buf))
}

fn decode_rows(bytes: &[u8], path: &Path) -> StoreResult<Vec<Row>> {
    let corrupt = |details: String| StoreError::Corrupt {
        location: path.to_string(),
        details,
    };

    let text = std::str::from_utf8(bytes).map_err(|e| corrupt(e.to_string()))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(row)) => Ok(row),
            Ok(other) => Err(corrupt(format!("expected a JSON object, got {}", other))),
            Err(e) => Err(corrupt(e.to_string())),
        })
        .collect()
}

#[async_trait]
impl TableStore for ObjectTableStore {
    async fn create_if_absent(&self, schema: &TableSchema) -> StoreResult<CreateOutcome> {
        let path = self.path(&[&schema.name, SCHEMA_FILE]);
        let payload = PutPayload::from(serde_json::to_vec_pretty(schema)?);

        match self.store.put_opts(&path, payload, PutMode::Create.into()).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(object_store::Error::AlreadyExists { .. }) => {
                let existing = self.load_schema(&schema.name).await?;
                Ok(CreateOutcome::Existing(existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append_rows(&self, table: &str, rows: Vec<Row>) -> StoreResult<()> {
        let schema = self.load_schema(table).await?;
        Self::validate(&schema, &rows)?;

        if rows.is_empty() {
            return Ok(());
        }

        let bytes = encode_rows(&rows)?;
        let mut seq = self
            .list_parts(table)
            .await?
            .last()
            .map_or(1, |(last, _)| last + 1);

        for _ in 0..MAX_APPEND_ATTEMPTS {
            let path = self.path(&[table, &Self::part_name(seq)]);
            let payload = PutPayload::from(bytes.clone());

            match self.store.put_opts(&path, payload, PutMode::Create.into()).await {
                Ok(_) => {
                    tracing::debug!("Appended {} rows to {} as part {}", rows.len(), table, seq);
                    return Ok(());
                }
                Err(object_store::Error::AlreadyExists { .. }) => {
                    tracing::debug!("Part {} of {} already taken, trying next", seq, table);
                    seq += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Corrupt {
            location: self.path(&[table]).to_string(),
            details: format!("could not claim an append slot after {} attempts", MAX_APPEND_ATTEMPTS),
        })
    }

    async fn replace_table(&self, table: &str, rows: Vec<Row>) -> StoreResult<()> {
        let schema = self.load_schema(table).await?;
        Self::validate(&schema, &rows)?;

        let path = self.path(&[table, ROWS_FILE]);
        self.store
            .put(&path, PutPayload::from(encode_rows(&rows)?))
            .await?;

        // Appended parts predate the replacement and are no longer part of the table.
        for (seq, part) in self.list_parts(table).await? {
            match self.store.delete(&part).await {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                    tracing::debug!("Removed part {} of {}", seq, table);
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!("Replaced {} with {} rows", table, rows.len());
        Ok(())
    }

    async fn read_all(&self, table: &str) -> StoreResult<Vec<Row>> {
        self.load_schema(table).await?;

        let mut rows = self
            .read_object(&self.path(&[table, ROWS_FILE]))
            .await?
            .unwrap_or_default();

        for (_, part) in self.list_parts(table).await? {
            if let Some(part_rows) = self.read_object(&part).await? {
                rows.extend(part_rows);
            }
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{customer_schema, enriched_schema};
    use object_store::local::LocalFileSystem;
    use serde_json::json;
    use tempfile::TempDir;

    fn customer(id: &str, date: &str) -> Row {
        json!({
            "customer_name": "Test",
            "customer_id": id,
            "open_date": "2022-01-01",
            "last_consulted_date": date,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn ids(rows: &[Row]) -> Vec<String> {
        rows.iter()
            .map(|r| r["customer_id"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_part_names_sort_numerically() {
        let a = ObjectTableStore::part_name(9);
        let b = ObjectTableStore::part_name(10);
        assert!(a < b);
        assert_eq!(ObjectTableStore::parse_part(&b), Some(10));
        assert_eq!(ObjectTableStore::parse_part("rows.jsonl"), None);
        assert_eq!(ObjectTableStore::parse_part("_schema.json"), None);
    }

    #[test]
    fn test_prefix_paths() {
        let store = ObjectTableStore::new(Arc::new(InMemory::new()), "/warehouse//customers/");
        assert_eq!(
            store.path(&["staging", "rows.jsonl"]).to_string(),
            "warehouse/customers/staging/rows.jsonl"
        );
    }

    #[tokio::test]
    async fn test_create_if_absent() {
        let store = ObjectTableStore::in_memory();
        let schema = customer_schema("staging_customers");

        assert_eq!(store.create_if_absent(&schema).await.unwrap(), CreateOutcome::Created);
        assert_eq!(
            store.create_if_absent(&schema).await.unwrap(),
            CreateOutcome::Existing(schema.clone())
        );
    }

    #[tokio::test]
    async fn test_missing_table() {
        let store = ObjectTableStore::in_memory();
        assert!(matches!(
            store.read_all("nope").await,
            Err(StoreError::TableNotFound(_))
        ));
        assert!(matches!(
            store.append_rows("nope", vec![customer("A", "2023-01-01")]).await,
            Err(StoreError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_append_preserves_order() {
        let store = ObjectTableStore::in_memory();
        store.create_if_absent(&customer_schema("staging")).await.unwrap();

        store
            .append_rows("staging", vec![customer("A", "2023-01-01"), customer("B", "2023-01-02")])
            .await
            .unwrap();
        store.append_rows("staging", vec![]).await.unwrap();
        store.append_rows("staging", vec![customer("C", "2023-01-03")]).await.unwrap();

        let rows = store.read_all("staging").await.unwrap();
        assert_eq!(ids(&rows), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_all_rows() {
        let store = ObjectTableStore::in_memory();
        store.create_if_absent(&customer_schema("staging")).await.unwrap();

        let appends = (0..8).map(|i| {
            let store = store.clone();
            async move {
                store
                    .append_rows("staging", vec![customer(&format!("C{}", i), "2023-01-01")])
                    .await
            }
        });
        for result in futures::future::join_all(appends).await {
            result.unwrap();
        }

        let mut got = ids(&store.read_all("staging").await.unwrap());
        got.sort();
        assert_eq!(got.len(), 8);
    }

    #[tokio::test]
    async fn test_append_rejects_invalid_rows() {
        let store = ObjectTableStore::in_memory();
        store.create_if_absent(&customer_schema("staging")).await.unwrap();

        let mut bad = customer("B", "2023-01-01");
        bad.remove("open_date");
        let err = store
            .append_rows("staging", vec![customer("A", "2023-01-01"), bad])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint { row: 1, .. }));

        // Nothing from the rejected batch was written.
        assert!(store.read_all("staging").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_overwrites_everything() {
        let store = ObjectTableStore::in_memory();
        store.create_if_absent(&customer_schema("snapshot")).await.unwrap();

        store.append_rows("snapshot", vec![customer("OLD", "2023-01-01")]).await.unwrap();
        store
            .replace_table("snapshot", vec![customer("A", "2023-01-01"), customer("B", "2023-01-01")])
            .await
            .unwrap();
        assert_eq!(ids(&store.read_all("snapshot").await.unwrap()), vec!["A", "B"]);

        store.replace_table("snapshot", vec![customer("C", "2023-01-01")]).await.unwrap();
        assert_eq!(ids(&store.read_all("snapshot").await.unwrap()), vec!["C"]);

        store.replace_table("snapshot", vec![]).await.unwrap();
        assert!(store.read_all("snapshot").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_typed_rows() {
        let store = ObjectTableStore::in_memory();
        store.create_if_absent(&enriched_schema("table_usa")).await.unwrap();

        let row = to_row(&json!({"customer_id": "CUST011", "age": 36})).unwrap();
        store.replace_table("table_usa", vec![row]).await.unwrap();

        let rows = store.read_all("table_usa").await.unwrap();
        let value: Value = from_row(rows[0].clone()).unwrap();
        assert_eq!(value["age"], 36);

        assert!(to_row(&json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_local_filesystem_backend() {
        let dir = TempDir::new().unwrap();
        let fs: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
        let store = ObjectTableStore::new(fs, "warehouse");

        store.create_if_absent(&customer_schema("staging")).await.unwrap();
        assert!(store.read_all("staging").await.unwrap().is_empty());

        store.append_rows("staging", vec![customer("A", "2023-01-01")]).await.unwrap();
        store.append_rows("staging", vec![customer("B", "2023-01-02")]).await.unwrap();
        assert_eq!(ids(&store.read_all("staging").await.unwrap()), vec!["A", "B"]);

        assert!(dir.path().join("warehouse/staging/_schema.json").exists());
        assert!(dir
            .path()
            .join("warehouse/staging/part-00000000000000000002.jsonl")
            .exists());
    }
}
