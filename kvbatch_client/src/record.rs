//! Records returned by reads.
use std::collections::BTreeMap;

use crate::value::Value;

/// Bin name to value mapping of one record version.
pub type Bins = BTreeMap<String, Value>;

/// A record as returned by the server.
///
/// Never mutated after it was parsed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    /// Bins of the record. Empty for header-only reads.
    pub bins: Bins,

    /// All versions of the record when the server returned unresolved duplicates.
    ///
    /// Empty unless the row carried more than one version; `bins` is then the first entry.
    pub duplicates: Vec<Bins>,

    /// Number of times the record was modified.
    pub generation: u32,

    /// Expiration time in seconds, 0 means never.
    pub expiration: u32,
}

impl Record {
    /// Build a record from the bins of one response row.
    ///
    /// A bin name that repeats within the row starts a new duplicate version.
    pub fn from_row_bins(
        bins: impl IntoIterator<Item = (String, Value)>,
        generation: u32,
        expiration: u32,
    ) -> Self {
        let mut versions = vec![];
        let mut current = Bins::new();
        for (name, value) in bins {
            if current.contains_key(&name) {
                versions.push(std::mem::take(&mut current));
            }
            current.insert(name, value);
        }

        if versions.is_empty() {
            return Self {
                bins: current,
                duplicates: vec![],
                generation,
                expiration,
            };
        }

        versions.push(current);
        Self {
            bins: versions[0].clone(),
            duplicates: versions,
            generation,
            expiration,
        }
    }

    /// Header-only record.
    pub fn header(generation: u32, expiration: u32) -> Self {
        Self {
            generation,
            expiration,
            ..Default::default()
        }
    }

    /// Value of a bin.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bins.get(name)
    }

    /// Whether the server returned more than one version of this record.
    pub fn has_duplicates(&self) -> bool {
        !self.duplicates.is_empty()
    }
}
