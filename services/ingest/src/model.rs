//! Raw and canonical row types shared by every stage of the pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// CANONICAL ATTRIBUTES
// =============================================================================

/// The fixed target attribute set that a raw column can map onto.
///
/// `timestamp_id` is not listed: it is derived from the file name, never
/// read from a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalAttribute {
    Timestamp,
    Country,
    State,
    Admin2,
    Latitude,
    Longitude,
    Confirmed,
    Deaths,
    Recovered,
    Active,
    Incidence,
    CaseFatalityRatio,
}

impl CanonicalAttribute {
    pub const ALL: [CanonicalAttribute; 12] = [
        CanonicalAttribute::Timestamp,
        CanonicalAttribute::Country,
        CanonicalAttribute::State,
        CanonicalAttribute::Admin2,
        CanonicalAttribute::Latitude,
        CanonicalAttribute::Longitude,
        CanonicalAttribute::Confirmed,
        CanonicalAttribute::Deaths,
        CanonicalAttribute::Recovered,
        CanonicalAttribute::Active,
        CanonicalAttribute::Incidence,
        CanonicalAttribute::CaseFatalityRatio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalAttribute::Timestamp => "timestamp",
            CanonicalAttribute::Country => "country",
            CanonicalAttribute::State => "state",
            CanonicalAttribute::Admin2 => "admin2",
            CanonicalAttribute::Latitude => "latitude",
            CanonicalAttribute::Longitude => "longitude",
            CanonicalAttribute::Confirmed => "confirmed",
            CanonicalAttribute::Deaths => "deaths",
            CanonicalAttribute::Recovered => "recovered",
            CanonicalAttribute::Active => "active",
            CanonicalAttribute::Incidence => "incidence",
            CanonicalAttribute::CaseFatalityRatio => "case_fatality_ratio",
        }
    }
}

impl fmt::Display for CanonicalAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalAttribute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalAttribute::ALL
            .into_iter()
            .find(|attr| attr.as_str() == s)
            .ok_or_else(|| format!("unknown canonical attribute '{}'", s))
    }
}

// =============================================================================
// RAW ROWS
// =============================================================================

/// A single cell as produced by a reader.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Empty,
    Text(String),
    Number(f64),
}

impl RawValue {
    /// Builds a cell from reader text, mapping blank fields to `Empty`.
    pub fn from_field(field: &str) -> Self {
        if field.trim().is_empty() {
            RawValue::Empty
        } else {
            RawValue::Text(field.to_string())
        }
    }
}

/// One upstream row: column label → value, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    cells: Vec<(String, RawValue)>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, value: RawValue) {
        self.cells.push((label.into(), value));
    }

    /// Builds a row from parallel header and field slices.
    pub fn from_fields<'a>(headers: &[String], fields: impl IntoIterator<Item = &'a str>) -> Self {
        let mut row = RawRow::new();
        let mut fields = fields.into_iter();
        for header in headers {
            let value = fields.next().map_or(RawValue::Empty, RawValue::from_field);
            row.push(header.clone(), value);
        }
        row
    }

    pub fn get(&self, label: &str) -> Option<&RawValue> {
        self.cells
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v)
    }

    pub fn labels(&self) -> Vec<String> {
        self.cells.iter().map(|(l, _)| l.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<L: Into<String>> FromIterator<(L, RawValue)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (L, RawValue)>>(iter: I) -> Self {
        let mut row = RawRow::new();
        for (label, value) in iter {
            row.push(label, value);
        }
        row
    }
}

// =============================================================================
// CANONICAL RECORDS
// =============================================================================

/// The unit persisted to the store. Every attribute is always present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub timestamp_id: i64,
    pub country: Option<String>,
    pub state: Option<String>,
    pub admin2: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub confirmed: Option<i64>,
    pub deaths: Option<i64>,
    pub recovered: Option<i64>,
    pub active: Option<i64>,
    pub incidence: Option<f64>,
    pub case_fatality_ratio: Option<f64>,
}

impl CanonicalRecord {
    /// A record with only the day key set.
    pub fn empty(timestamp_id: i64) -> Self {
        Self {
            timestamp: None,
            timestamp_id,
            country: None,
            state: None,
            admin2: None,
            latitude: None,
            longitude: None,
            confirmed: None,
            deaths: None,
            recovered: None,
            active: None,
            incidence: None,
            case_fatality_ratio: None,
        }
    }

    pub fn merge_key(&self) -> MergeKey {
        MergeKey {
            country: self.country.clone(),
            state: self.state.clone(),
            admin2: self.admin2.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Upsert identity: `(country, state, admin2, timestamp)`. Nulls compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MergeKey {
    pub country: Option<String>,
    pub state: Option<String>,
    pub admin2: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}
