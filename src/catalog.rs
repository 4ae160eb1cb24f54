//! Table schemas and the schema manager.
//!
//! The catalog names every table a run touches: the append-only staging table,
//! the canonical snapshot, one destination table per supported country and the
//! table collecting records with an unmatched country. [`ensure_schema`]
//! creates whatever is missing and checks that what already exists is
//! compatible. It never drops or alters a table.

use crate::error::SchemaError;
use crate::io::{CreateOutcome, Row, TableStore};
use crate::record::{parse_date, CountryCode};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Version of the column sets below. Bump when a column set changes.
pub const SCHEMA_VERSION: u32 = 1;

pub const STAGING_TABLE: &str = "staging_customers";
pub const SNAPSHOT_TABLE: &str = "latest_customers";
pub const UNROUTED_TABLE: &str = "unrouted_customers";

/// Column types understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    String,
    Date,
    Int64,
    Boolean,
}

impl ColumnType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ColumnType::String => value.is_string(),
            ColumnType::Date => value.as_str().and_then(parse_date).is_some(),
            ColumnType::Int64 => value.as_i64().is_some(),
            ColumnType::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "STRING",
            ColumnType::Date => "DATE",
            ColumnType::Int64 => "INT64",
            ColumnType::Boolean => "BOOLEAN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    fn required(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: false,
        }
    }

    fn nullable(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            nullable: true,
        }
    }
}

/// A named table with a fixed, versioned column set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub version: u32,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check a row against the column set.
    ///
    /// Missing nullable columns are treated as null. Unknown columns,
    /// nulls in `NOT NULL` columns and type mismatches are rejected.
    pub fn validate_row(&self, row: &Row) -> Result<(), String> {
        if let Some(unknown) = row.keys().find(|k| self.column(k).is_none()) {
            return Err(format!("unknown column '{}'", unknown));
        }

        for column in &self.columns {
            match row.get(&column.name) {
                None | Some(Value::Null) => {
                    if !column.nullable {
                        return Err(format!("column '{}' is NOT NULL", column.name));
                    }
                }
                Some(value) => {
                    if !column.column_type.accepts(value) {
                        return Err(format!(
                            "column '{}' expects {}, got {}",
                            column.name, column.column_type, value
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Describe why `existing` cannot stand in for `self`, if it can't.
    ///
    /// Versions, column names and column types must match; nullability may differ.
    pub fn incompatibility(&self, existing: &TableSchema) -> Option<String> {
        if existing.version != self.version {
            return Some(format!(
                "schema version {} but version {} is required",
                existing.version, self.version
            ));
        }

        for column in &self.columns {
            match existing.column(&column.name) {
                None => return Some(format!("missing column '{}'", column.name)),
                Some(found) if found.column_type != column.column_type => {
                    return Some(format!(
                        "column '{}' is {} but {} is required",
                        column.name, found.column_type, column.column_type
                    ));
                }
                Some(_) => {}
            }
        }

        existing
            .columns
            .iter()
            .find(|c| self.column(&c.name).is_none())
            .map(|extra| format!("unexpected column '{}'", extra.name))
    }
}

fn customer_columns(strict: bool) -> Vec<Column> {
    let key = |name: &str, ty: ColumnType| {
        if strict {
            Column::required(name, ty)
        } else {
            Column::nullable(name, ty)
        }
    };

    vec![
        key("customer_name", ColumnType::String),
        key("customer_id", ColumnType::String),
        key("open_date", ColumnType::Date),
        Column::nullable("last_consulted_date", ColumnType::Date),
        Column::nullable("vaccination_id", ColumnType::String),
        Column::nullable("doctor_consulted", ColumnType::String),
        Column::nullable("state", ColumnType::String),
        Column::nullable("country", ColumnType::String),
        Column::nullable("dob", ColumnType::Date),
        Column::nullable("is_active", ColumnType::String),
    ]
}

/// Staging and snapshot tables hold raw customer columns.
pub fn customer_schema(name: &str) -> TableSchema {
    TableSchema {
        name: name.to_string(),
        version: SCHEMA_VERSION,
        columns: customer_columns(true),
    }
}

/// Destination and unrouted tables add the derived columns.
pub fn enriched_schema(name: &str) -> TableSchema {
    let mut columns = customer_columns(false);
    columns.push(Column::nullable("age", ColumnType::Int64));
    columns.push(Column::nullable("days_since_last_consulted", ColumnType::Int64));
    columns.push(Column::nullable("flag_days_gt_30", ColumnType::Boolean));

    TableSchema {
        name: name.to_string(),
        version: SCHEMA_VERSION,
        columns,
    }
}

/// Destination table name for a country (`IND` -> `table_ind`).
pub fn destination_table(country: &CountryCode) -> String {
    format!("table_{}", country.as_str().to_ascii_lowercase())
}

/// Every table a run needs.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub staging: TableSchema,
    pub snapshot: TableSchema,
    pub unrouted: TableSchema,
    /// Destination tables, ordered by country code.
    pub destinations: Vec<(CountryCode, TableSchema)>,
}

impl Catalog {
    /// Build the catalog for a set of supported countries.
    pub fn new<'a>(countries: impl IntoIterator<Item = &'a CountryCode>) -> Self {
        let mut destinations: Vec<(CountryCode, TableSchema)> = countries
            .into_iter()
            .map(|code| (code.clone(), enriched_schema(&destination_table(code))))
            .collect();
        destinations.sort_by(|a, b| a.0.cmp(&b.0));
        destinations.dedup_by(|a, b| a.0 == b.0);

        Self {
            staging: customer_schema(STAGING_TABLE),
            snapshot: customer_schema(SNAPSHOT_TABLE),
            unrouted: enriched_schema(UNROUTED_TABLE),
            destinations,
        }
    }

    pub fn countries(&self) -> impl Iterator<Item = &CountryCode> {
        self.destinations.iter().map(|(code, _)| code)
    }

    pub fn destination(&self, country: &CountryCode) -> Option<&TableSchema> {
        self.destinations
            .iter()
            .find(|(code, _)| code == country)
            .map(|(_, schema)| schema)
    }

    /// All tables, staging first.
    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        [&self.staging, &self.snapshot, &self.unrouted]
            .into_iter()
            .chain(self.destinations.iter().map(|(_, schema)| schema))
    }
}

/// Ensure every catalog table exists with a compatible schema.
///
/// Tables are created concurrently. Safe to call repeatedly and from
/// concurrent runs: creation is create-only, and a table that already exists
/// is compared rather than touched.
pub async fn ensure_schema(store: &dyn TableStore, catalog: &Catalog) -> Result<(), SchemaError> {
    let checks = catalog.tables().map(|schema| async move {
        let outcome = store
            .create_if_absent(schema)
            .await
            .map_err(|source| SchemaError::Store {
                table: schema.name.clone(),
                source,
            })?;

        match outcome {
            CreateOutcome::Created => {
                tracing::info!("Created table {}", schema.name);
                Ok(())
            }
            CreateOutcome::Existing(existing) => match schema.incompatibility(&existing) {
                None => {
                    tracing::debug!("Table {} already exists", schema.name);
                    Ok(())
                }
                Some(details) => Err(SchemaError::Incompatible {
                    table: schema.name.clone(),
                    details,
                }),
            },
        }
    });

    try_join_all(checks).await?;
    Ok(())
}
