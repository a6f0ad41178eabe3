//! Snapshot discovery and reading.
//!
//! Responsibilities:
//! - List daily snapshot files (`MM-DD-YYYY.csv`) in a directory
//! - Read one snapshot into raw rows, tolerating BOMs and legacy encodings
//! - Fingerprint file contents for the audit log
//! - Survey the distinct column layouts across the history

use chrono::NaiveDate;
use encoding_rs::WINDOWS_1252;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use crate::model::RawRow;
use crate::values::parse_reporting_date;

/// Handle to one daily snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub name: String,
    pub reporting_date: NaiveDate,
}

impl SnapshotFile {
    /// Builds a handle, deriving the reporting date from the file name.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| IngestError::FileName(path.display().to_string()))?;
        let reporting_date = parse_reporting_date(&name)?;
        Ok(Self {
            path,
            name,
            reporting_date,
        })
    }
}

/// Contents of one snapshot as produced by a reader.
#[derive(Debug, Clone, Default)]
pub struct RawSnapshot {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    pub content_hash: Option<String>,
}

/// Supplies raw rows for a snapshot. Called from the blocking pool.
pub trait RecordSource: Send + Sync {
    fn read(&self, file: &SnapshotFile) -> Result<RawSnapshot>;
}

/// Lists snapshot files in `dir`, oldest first.
///
/// Anything that is not a `.csv` with an `MM-DD-YYYY` name is skipped.
pub fn discover_snapshots(dir: &Path) -> Result<Vec<SnapshotFile>> {
    let entries = std::fs::read_dir(dir).map_err(|e| IngestError::unreadable(dir, e))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if !path.is_file() || !is_csv {
            continue;
        }
        match SnapshotFile::from_path(&path) {
            Ok(file) => files.push(file),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping file"),
        }
    }

    files.sort_by(|a, b| {
        a.reporting_date
            .cmp(&b.reporting_date)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(files)
}

/// Reads comma-separated snapshots from disk.
#[derive(Debug, Clone, Default)]
pub struct CsvDirectorySource;

impl CsvDirectorySource {
    pub fn new() -> Self {
        Self
    }
}

impl RecordSource for CsvDirectorySource {
    fn read(&self, file: &SnapshotFile) -> Result<RawSnapshot> {
        let bytes = std::fs::read(&file.path).map_err(|e| IngestError::unreadable(&file.path, e))?;
        let mut snapshot = parse_csv_bytes(&bytes, &file.path)?;
        snapshot.content_hash = Some(content_hash(&bytes));
        debug!(
            file = %file.name,
            rows = snapshot.rows.len(),
            columns = snapshot.headers.len(),
            "read snapshot"
        );
        Ok(snapshot)
    }
}

/// `sha256:<hex>` of the raw file bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Decodes UTF-8, falling back to Windows-1252 for legacy exports.
fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (text, _, _) = WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// Parses snapshot bytes. `path` is only used in error messages.
pub fn parse_csv_bytes(bytes: &[u8], path: &Path) -> Result<RawSnapshot> {
    let content = decode(bytes);
    // Remove UTF-8 BOM if present
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| IngestError::unreadable(path, e))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for (line_idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| {
            IngestError::unreadable(path, format!("line {}: {}", line_idx + 2, e))
        })?;
        rows.push(RawRow::from_fields(&headers, record.iter()));
    }

    Ok(RawSnapshot {
        headers,
        rows,
        content_hash: None,
    })
}

/// Distinct header layouts across `files`, each with the files using it.
pub fn survey_columns(
    source: &dyn RecordSource,
    files: &[SnapshotFile],
) -> Result<BTreeMap<Vec<String>, Vec<String>>> {
    let mut layouts: BTreeMap<Vec<String>, Vec<String>> = BTreeMap::new();
    for file in files {
        let snapshot = source.read(file)?;
        layouts
            .entry(snapshot.headers)
            .or_default()
            .push(file.name.clone());
    }
    Ok(layouts)
}
