//! Column reconciliation: raw labels → canonical attributes.
//!
//! Two passes over an explicit attribute list instead of mutating a table
//! in place:
//! 1. every raw label is looked up in the alias table (unknown ones dropped)
//! 2. every canonical attribute left without a source is recorded as missing

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::aliases::AliasTables;
use crate::model::CanonicalAttribute;

/// Where each canonical attribute is read from in one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    sources: BTreeMap<CanonicalAttribute, String>,
    missing: Vec<CanonicalAttribute>,
    dropped: Vec<String>,
}

impl ColumnMap {
    /// Source label for `attr`, or `None` when the file lacks it.
    pub fn source(&self, attr: CanonicalAttribute) -> Option<&str> {
        self.sources.get(&attr).map(String::as_str)
    }

    /// Canonical attributes the file has no column for.
    pub fn missing(&self) -> &[CanonicalAttribute] {
        &self.missing
    }

    /// Raw labels that matched nothing in the alias table.
    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }
}

#[derive(Debug, Clone)]
pub struct ColumnMapper {
    aliases: Arc<AliasTables>,
}

impl ColumnMapper {
    pub fn new(aliases: Arc<AliasTables>) -> Self {
        Self { aliases }
    }

    pub fn map(&self, raw_columns: &[String]) -> ColumnMap {
        let mut map = ColumnMap::default();

        for label in raw_columns {
            match self.aliases.column(label.trim()) {
                // First spelling in file order wins if a file carries two.
                Some(attr) => {
                    map.sources.entry(attr).or_insert_with(|| label.clone());
                }
                None => map.dropped.push(label.clone()),
            }
        }

        map.missing = CanonicalAttribute::ALL
            .into_iter()
            .filter(|attr| !map.sources.contains_key(attr))
            .collect();

        map
    }
}
