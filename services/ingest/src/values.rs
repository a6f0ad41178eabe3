//! Cell-level cleanup: null sentinels, timestamps, numeric coercion and the
//! per-file day key.
//!
//! Nothing in here fails a row. A cell that cannot be converted becomes
//! `None` for its attribute and the record is still emitted.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::path::Path;

use crate::columns::ColumnMap;
use crate::error::{IngestError, Result};
use crate::model::{CanonicalAttribute, CanonicalRecord, RawRow, RawValue};

/// Tokens treated as null for every attribute, after trimming.
pub const NULL_SENTINELS: &[&str] = &["", "Unknown", "#DIV/0!"];

/// Naive date-time layouts seen in the upstream timestamp columns.
///
/// Two-digit years come first: `%Y` would happily read `3/22/20` as year 20.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%y %H:%M:%S",
    "%m/%d/%y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y"];

/// A cell that survived sentinel substitution.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Cell<'a> {
    Text(&'a str),
    Number(f64),
}

/// Applies the global null substitution. Runs before any type conversion.
fn clean(value: Option<&RawValue>) -> Option<Cell<'_>> {
    match value? {
        RawValue::Empty => None,
        RawValue::Number(n) => Some(Cell::Number(*n)),
        RawValue::Text(s) => {
            let s = s.trim();
            if NULL_SENTINELS.contains(&s) {
                None
            } else {
                Some(Cell::Text(s))
            }
        }
    }
}

/// Permissive timestamp parser. Naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date.and_time(NaiveTime::MIN).and_utc());
        }
    }

    None
}

/// UTC-midnight epoch seconds of `date`.
pub fn day_key(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Reporting date of a snapshot from its `MM-DD-YYYY[.ext]` file name.
pub fn parse_reporting_date(file_name: &str) -> Result<NaiveDate> {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    NaiveDate::parse_from_str(stem, "%m-%d-%Y")
        .map_err(|_| IngestError::FileName(file_name.to_string()))
}

fn to_text(cell: Option<Cell<'_>>) -> Option<String> {
    match cell? {
        Cell::Text(s) => Some(s.to_string()),
        Cell::Number(n) => Some(n.to_string()),
    }
}

fn to_float(cell: Option<Cell<'_>>) -> Option<f64> {
    let value = match cell? {
        Cell::Text(s) => s.parse::<f64>().ok()?,
        Cell::Number(n) => n,
    };
    value.is_finite().then_some(value)
}

/// Counts must be finite, integral and non-negative. `"120.0"` is accepted.
fn to_count(cell: Option<Cell<'_>>) -> Option<i64> {
    if let Some(Cell::Text(s)) = cell {
        if let Ok(n) = s.parse::<i64>() {
            return (n >= 0).then_some(n);
        }
    }
    let value = to_float(cell)?;
    if value < 0.0 || value.fract() != 0.0 || value > i64::MAX as f64 {
        return None;
    }
    Some(value as i64)
}

fn to_timestamp(cell: Option<Cell<'_>>) -> Option<DateTime<Utc>> {
    match cell? {
        Cell::Text(s) => parse_timestamp(s),
        // Spreadsheet exports occasionally carry epoch seconds.
        Cell::Number(n) if n.is_finite() && n.fract() == 0.0 => {
            DateTime::from_timestamp(n as i64, 0)
        }
        Cell::Number(_) => None,
    }
}

/// Converts one raw row into a canonical record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueNormalizer;

impl ValueNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// `country` is left as found in the file; region aliasing happens later.
    pub fn normalize(
        &self,
        row: &RawRow,
        columns: &ColumnMap,
        file_date: NaiveDate,
    ) -> CanonicalRecord {
        let cell = |attr: CanonicalAttribute| clean(columns.source(attr).and_then(|l| row.get(l)));

        CanonicalRecord {
            timestamp: to_timestamp(cell(CanonicalAttribute::Timestamp)),
            timestamp_id: day_key(file_date),
            country: to_text(cell(CanonicalAttribute::Country)),
            state: to_text(cell(CanonicalAttribute::State)),
            admin2: to_text(cell(CanonicalAttribute::Admin2)),
            latitude: to_float(cell(CanonicalAttribute::Latitude)),
            longitude: to_float(cell(CanonicalAttribute::Longitude)),
            confirmed: to_count(cell(CanonicalAttribute::Confirmed)),
            deaths: to_count(cell(CanonicalAttribute::Deaths)),
            recovered: to_count(cell(CanonicalAttribute::Recovered)),
            active: to_count(cell(CanonicalAttribute::Active)),
            incidence: to_float(cell(CanonicalAttribute::Incidence)),
            case_fatality_ratio: to_float(cell(CanonicalAttribute::CaseFatalityRatio)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliases::AliasTables;
    use crate::columns::ColumnMapper;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn text(s: &str) -> RawValue {
        RawValue::Text(s.to_string())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn normalize(row: RawRow, file_date: NaiveDate) -> CanonicalRecord {
        let mapper = ColumnMapper::new(Arc::new(AliasTables::builtin().unwrap()));
        let columns = mapper.map(&row.labels());
        ValueNormalizer::new().normalize(&row, &columns, file_date)
    }

    // -------------------------------------------------------------------------
    // TIMESTAMPS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_timestamp_upstream_layouts() {
        let expected = Utc.with_ymd_and_hms(2020, 3, 22, 23, 45, 0).unwrap();
        for raw in [
            "2020-03-22T23:45:00",
            "2020-03-22 23:45:00",
            "2020-03-22 23:45",
            "3/22/2020 23:45",
            "03/22/2020 23:45:00",
            "3/22/20 23:45",
            "2020-03-22T23:45:00Z",
            "2020-03-22T23:45:00+00:00",
        ] {
            assert_eq!(parse_timestamp(raw), Some(expected), "layout {}", raw);
        }
    }

    #[test]
    fn test_parse_timestamp_offsets_convert_to_utc() {
        let parsed = parse_timestamp("2020-02-01T19:53:03-05:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2020, 2, 2, 0, 53, 3).unwrap());
    }

    #[test]
    fn test_parse_timestamp_date_only() {
        assert_eq!(
            parse_timestamp("1/22/2020"),
            Some(Utc.with_ymd_and_hms(2020, 1, 22, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_timestamp_garbage_is_none() {
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp("13/45/2020 10:00"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    // -------------------------------------------------------------------------
    // DAY KEY
    // -------------------------------------------------------------------------

    #[test]
    fn test_reporting_date_from_file_name() {
        assert_eq!(parse_reporting_date("01-14-2021.csv").unwrap(), date(2021, 1, 14));
        assert_eq!(parse_reporting_date("12-31-2020").unwrap(), date(2020, 12, 31));
        assert!(matches!(
            parse_reporting_date("README.md"),
            Err(IngestError::FileName(_))
        ));
        assert!(parse_reporting_date("2021-01-14.csv").is_err());
    }

    #[test]
    fn test_day_key_is_utc_midnight() {
        assert_eq!(day_key(date(1970, 1, 2)), 86_400);
        assert_eq!(
            day_key(date(2021, 1, 14)),
            Utc.with_ymd_and_hms(2021, 1, 14, 0, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn test_timestamp_id_ignores_row_timestamp() {
        let row: RawRow = [
            ("Country_Region", text("Chile")),
            ("Last_Update", text("2021-01-15 23:59:59")),
        ]
        .into_iter()
        .collect();
        let rec = normalize(row, date(2021, 1, 14));
        assert_eq!(rec.timestamp_id, day_key(date(2021, 1, 14)));
        assert_eq!(
            rec.timestamp,
            Some(Utc.with_ymd_and_hms(2021, 1, 15, 23, 59, 59).unwrap())
        );
    }

    // -------------------------------------------------------------------------
    // NULL SENTINELS
    // -------------------------------------------------------------------------

    #[test]
    fn test_sentinels_null_every_attribute() {
        let labels = [
            "Last_Update",
            "Country_Region",
            "Province_State",
            "Admin2",
            "Lat",
            "Long_",
            "Confirmed",
            "Deaths",
            "Recovered",
            "Active",
            "Incident_Rate",
            "Case_Fatality_Ratio",
        ];
        for sentinel in ["Unknown", "#DIV/0!", "", "  Unknown "] {
            let row: RawRow = labels.iter().map(|l| (*l, text(sentinel))).collect();
            let rec = normalize(row, date(2021, 1, 1));
            assert_eq!(rec, CanonicalRecord::empty(day_key(date(2021, 1, 1))), "{:?}", sentinel);
        }
    }

    #[test]
    fn test_div_zero_case_fatality_ratio() {
        let row: RawRow = [
            ("Country_Region", text("Chile")),
            ("Case_Fatality_Ratio", text("#DIV/0!")),
        ]
        .into_iter()
        .collect();
        assert_eq!(normalize(row, date(2021, 1, 1)).case_fatality_ratio, None);
    }

    // -------------------------------------------------------------------------
    // NUMERIC COERCION
    // -------------------------------------------------------------------------

    #[test]
    fn test_counts() {
        assert_eq!(to_count(Some(Cell::Text("120"))), Some(120));
        assert_eq!(to_count(Some(Cell::Text("120.0"))), Some(120));
        assert_eq!(to_count(Some(Cell::Number(7.0))), Some(7));
        assert_eq!(to_count(Some(Cell::Text("-3"))), None);
        assert_eq!(to_count(Some(Cell::Text("1.5"))), None);
        assert_eq!(to_count(Some(Cell::Text("many"))), None);
        assert_eq!(to_count(Some(Cell::Text("NaN"))), None);
        assert_eq!(to_count(None), None);
    }

    #[test]
    fn test_floats_reject_non_finite() {
        assert_eq!(to_float(Some(Cell::Text("1.25"))), Some(1.25));
        assert_eq!(to_float(Some(Cell::Text("-33.45"))), Some(-33.45));
        assert_eq!(to_float(Some(Cell::Text("inf"))), None);
        assert_eq!(to_float(Some(Cell::Number(f64::NAN))), None);
    }

    #[test]
    fn test_bad_cell_does_not_drop_row() {
        let row: RawRow = [
            ("Country_Region", text("Chile")),
            ("Confirmed", text("n/a")),
            ("Deaths", text("4")),
            ("Last_Update", text("not a date")),
        ]
        .into_iter()
        .collect();
        let rec = normalize(row, date(2021, 1, 1));
        assert_eq!(rec.country.as_deref(), Some("Chile"));
        assert_eq!(rec.confirmed, None);
        assert_eq!(rec.deaths, Some(4));
        assert_eq!(rec.timestamp, None);
    }

    #[test]
    fn test_text_cells_are_trimmed() {
        let row: RawRow = [("Country/Region", text("  Chile "))].into_iter().collect();
        assert_eq!(normalize(row, date(2020, 3, 1)).country.as_deref(), Some("Chile"));
    }
}
