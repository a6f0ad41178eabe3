//! Static alias tables for column labels and country names.
//!
//! Both tables are versioned JSON, keyed by canonical name with the list of
//! historical spellings that fold onto it:
//!
//! ```json
//! {
//!   "version": "2021-03",
//!   "columns":   { "country": ["Country/Region", "Country_Region"] },
//!   "countries": { "South Korea": ["Korea, South"] }
//! }
//! ```
//!
//! The tables are validated once at load time and are read-only afterwards.
//! A malformed table is an `AliasTable` error before any file is touched.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use crate::error::{IngestError, Result};
use crate::model::CanonicalAttribute;

/// Table shipped with the binary.
pub const DEFAULT_ALIASES: &str = include_str!("../config/aliases.json");

#[derive(Debug, Deserialize)]
struct AliasFile {
    version: String,
    columns: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    countries: BTreeMap<String, Vec<String>>,
}

/// Validated, immutable alias tables.
#[derive(Debug, Clone)]
pub struct AliasTables {
    version: String,
    columns: HashMap<String, CanonicalAttribute>,
    countries: HashMap<String, String>,
    canonical_countries: BTreeSet<String>,
}

impl AliasTables {
    /// Loads the table embedded in the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_json(DEFAULT_ALIASES)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::AliasTable(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: AliasFile = serde_json::from_str(content)
            .map_err(|e| IngestError::AliasTable(format!("invalid alias JSON: {}", e)))?;
        Self::from_file(file)
    }

    fn from_file(file: AliasFile) -> Result<Self> {
        let columns = build_column_table(&file.columns)?;
        let (countries, canonical_countries) = build_country_table(&file.countries)?;
        Ok(Self {
            version: file.version,
            columns,
            countries,
            canonical_countries,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Canonical attribute for a raw column label, if the label is known.
    pub fn column(&self, label: &str) -> Option<CanonicalAttribute> {
        self.columns.get(label).copied()
    }

    /// Canonical country for a known variant spelling.
    pub fn country(&self, raw: &str) -> Option<&str> {
        self.countries.get(raw).map(String::as_str)
    }

    /// Every canonical country name the country table folds onto.
    pub fn canonical_countries(&self) -> &BTreeSet<String> {
        &self.canonical_countries
    }

    /// Every variant spelling in the country table.
    pub fn country_variants(&self) -> impl Iterator<Item = &str> {
        self.countries.keys().map(String::as_str)
    }

    /// Every raw column label in the column table.
    pub fn column_labels(&self) -> impl Iterator<Item = (&str, CanonicalAttribute)> {
        self.columns.iter().map(|(label, attr)| (label.as_str(), *attr))
    }
}

fn build_column_table(
    raw: &BTreeMap<String, Vec<String>>,
) -> Result<HashMap<String, CanonicalAttribute>> {
    let mut table = HashMap::new();
    for (canonical, labels) in raw {
        let attr: CanonicalAttribute = canonical.parse().map_err(IngestError::AliasTable)?;
        for label in labels {
            if label.trim().is_empty() {
                return Err(IngestError::AliasTable(format!(
                    "empty column label listed under '{}'",
                    canonical
                )));
            }
            if let Some(previous) = table.insert(label.clone(), attr) {
                if previous != attr {
                    return Err(IngestError::AliasTable(format!(
                        "column label '{}' maps to both '{}' and '{}'",
                        label, previous, attr
                    )));
                }
            }
        }
    }
    Ok(table)
}

fn build_country_table(
    raw: &BTreeMap<String, Vec<String>>,
) -> Result<(HashMap<String, String>, BTreeSet<String>)> {
    let mut table: HashMap<String, String> = HashMap::new();
    let mut canonical = BTreeSet::new();

    for (name, variants) in raw {
        if name.trim().is_empty() {
            return Err(IngestError::AliasTable(
                "empty canonical country name".to_string(),
            ));
        }
        canonical.insert(name.clone());
        for variant in variants {
            if variant.is_empty() {
                return Err(IngestError::AliasTable(format!(
                    "empty country variant listed under '{}'",
                    name
                )));
            }
            if variant == name {
                continue;
            }
            if let Some(previous) = table.insert(variant.clone(), name.clone()) {
                if &previous != name {
                    return Err(IngestError::AliasTable(format!(
                        "country variant '{}' maps to both '{}' and '{}'",
                        variant, previous, name
                    )));
                }
            }
        }
    }

    // A canonical name that is also someone else's variant would make
    // canonicalization non-idempotent.
    for name in &canonical {
        if let Some(target) = table.get(name) {
            return Err(IngestError::AliasTable(format!(
                "canonical country '{}' is also listed as a variant of '{}'",
                name, target
            )));
        }
    }

    Ok((table, canonical))
}
