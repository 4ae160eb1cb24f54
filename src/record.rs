//! Customer record types flowing through the pipeline.
//!
//! ```text
//! RawCustomerRecord ──ingest──▶ CustomerRecord ──dedup──▶ CanonicalRecord ──enrich──▶ EnrichedRecord
//! ```

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Date format used for every date column (`YYYY-MM-DD`).
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Stable customer key.
pub type CustomerId = String;

/// Parse a `YYYY-MM-DD` date, ignoring surrounding whitespace.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

/// Country code used to select a destination partition (e.g. `IND`, `USA`).
///
/// Matching is exact: `"ind"` and `"IND"` are different codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountryCode(String);

impl CountryCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the code looks like an ISO-style code: non-empty, uppercase ASCII letters.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c.is_ascii_uppercase())
    }

    /// Whether a record's country attribute selects this partition.
    pub fn matches(&self, country: Option<&str>) -> bool {
        country == Some(self.0.as_str())
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CountryCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for CountryCode {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A customer record as decoded from the producer, before validation.
///
/// Every field is optional text so that ingestion can report exactly which
/// constraint a record violates. Column names from the upstream warehouse
/// export (`Customer_Id`, `Open_Date`, ...) are accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCustomerRecord {
    #[serde(alias = "Customer_Name")]
    pub customer_name: Option<String>,
    #[serde(alias = "Customer_Id")]
    pub customer_id: Option<String>,
    #[serde(alias = "Open_Date")]
    pub open_date: Option<String>,
    #[serde(alias = "Last_Consulted_Date")]
    pub last_consulted_date: Option<String>,
    #[serde(alias = "Vaccination_Id")]
    pub vaccination_id: Option<String>,
    #[serde(alias = "Doctor_Consulted")]
    pub doctor_consulted: Option<String>,
    #[serde(alias = "State")]
    pub state: Option<String>,
    #[serde(alias = "Country")]
    pub country: Option<String>,
    #[serde(alias = "DOB")]
    pub dob: Option<String>,
    #[serde(alias = "Is_Active")]
    pub is_active: Option<String>,
}

/// A validated customer record, as stored in staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_name: String,
    pub customer_id: CustomerId,
    pub open_date: NaiveDate,
    pub last_consulted_date: Option<NaiveDate>,
    pub vaccination_id: Option<String>,
    pub doctor_consulted: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub dob: Option<NaiveDate>,
    pub is_active: Option<String>,
}

impl CustomerRecord {
    /// Decode the `"Y"`/`"N"` active flag. Any other value is `None`.
    pub fn is_active(&self) -> Option<bool> {
        match self.is_active.as_deref() {
            Some("Y") => Some(true),
            Some("N") => Some(false),
            _ => None,
        }
    }
}

/// The single record chosen to represent a customer's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalRecord {
    pub record: CustomerRecord,
}

impl CanonicalRecord {
    pub fn customer_id(&self) -> &str {
        &self.record.customer_id
    }

    pub fn country(&self) -> Option<&str> {
        self.record.country.as_deref()
    }
}

impl From<CustomerRecord> for CanonicalRecord {
    fn from(record: CustomerRecord) -> Self {
        Self { record }
    }
}

/// A canonical record plus derived fields, as written to destination tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: CustomerRecord,

    /// Age in years relative to the processing date; `None` without a date of birth.
    pub age: Option<i32>,

    /// Days between the processing date and the last consultation.
    pub days_since_last_consulted: Option<i64>,

    /// `days_since_last_consulted` exceeds the staleness threshold (30 days by default).
    pub flag_days_gt_30: Option<bool>,
}

impl EnrichedRecord {
    pub fn customer_id(&self) -> &str {
        &self.record.customer_id
    }
}

#[allow(clippy::too_many_arguments)]
fn raw(
    name: &str,
    id: &str,
    open: &str,
    last: &str,
    vaccination: &str,
    doctor: &str,
    state: &str,
    country: &str,
    dob: &str,
    active: &str,
) -> RawCustomerRecord {
    RawCustomerRecord {
        customer_name: Some(name.into()),
        customer_id: Some(id.into()),
        open_date: Some(open.into()),
        last_consulted_date: Some(last.into()),
        vaccination_id: Some(vaccination.into()),
        doctor_consulted: Some(doctor.into()),
        state: Some(state.into()),
        country: Some(country.into()),
        dob: Some(dob.into()),
        is_active: Some(active.into()),
    }
}

/// Seed batch used by `generate-sample`: one Indian and one US customer.
pub fn sample_records() -> Vec<RawCustomerRecord> {
    vec![
        raw("Alice", "CUST001", "2023-01-01", "2023-02-01", "VAC01", "Dr. Smith", "KA", "IND", "1990-05-15", "Y"),
        raw("Karen", "CUST011", "2022-01-01", "2023-01-15", "VAC01", "Dr. Scott", "CA", "USA", "1987-10-25", "Y"),
    ]
}
