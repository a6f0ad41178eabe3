//! One snapshot in, canonical records out.
//!
//! Pure: no I/O and no shared mutable state, so files can be normalized in
//! parallel. One record per input row; rows are never dropped here.

use chrono::NaiveDate;
use std::sync::Arc;

use crate::aliases::AliasTables;
use crate::columns::{ColumnMap, ColumnMapper};
use crate::model::{CanonicalRecord, RawRow};
use crate::regions::RegionCanonicalizer;
use crate::values::ValueNormalizer;

#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    columns: ColumnMapper,
    values: ValueNormalizer,
    regions: RegionCanonicalizer,
}

impl RecordNormalizer {
    pub fn new(aliases: Arc<AliasTables>) -> Self {
        Self {
            columns: ColumnMapper::new(aliases.clone()),
            values: ValueNormalizer::new(),
            regions: RegionCanonicalizer::new(aliases),
        }
    }

    /// Column layout of a file, taken from its first row.
    pub fn column_map(&self, rows: &[RawRow]) -> ColumnMap {
        let labels = rows.first().map(RawRow::labels).unwrap_or_default();
        self.columns.map(&labels)
    }

    pub fn normalize_file(&self, rows: &[RawRow], file_date: NaiveDate) -> Vec<CanonicalRecord> {
        let columns = self.column_map(rows);
        rows.iter()
            .map(|row| {
                let mut record = self.values.normalize(row, &columns, file_date);
                record.country = record
                    .country
                    .as_deref()
                    .map(|c| self.regions.canonicalize(c));
                record
            })
            .collect()
    }
}
