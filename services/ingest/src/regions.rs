//! Country name canonicalization.
//!
//! The alias table is domain knowledge (typos, SAR folding, renames,
//! dependencies folded into their governing state); this module only applies
//! it. Unknown names pass through untouched.

use std::sync::Arc;

use crate::aliases::AliasTables;

#[derive(Debug, Clone)]
pub struct RegionCanonicalizer {
    aliases: Arc<AliasTables>,
}

impl RegionCanonicalizer {
    pub fn new(aliases: Arc<AliasTables>) -> Self {
        Self { aliases }
    }

    pub fn canonicalize(&self, country: &str) -> String {
        self.aliases
            .country(country)
            .unwrap_or(country)
            .to_string()
    }
}
