//! The persisted sparse matrix of directed route metrics
//!
//! In memory, entries are keyed by a structured [`PairKey`]. The
//! `"source|destination"` string form exists only at the file boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use log::debug;

use crate::core::entity::KEY_SEPARATOR;
use crate::core::error::{Error, Result};
use crate::core::report::Coverage;
use crate::core::route::RouteMetric;
use crate::core::store::{read_json, StagedWrite};

/// Ordered (source, destination) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairKey {
    pub source: String,
    pub destination: String,
}

impl PairKey {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub fn is_self_pair(&self) -> bool {
        self.source == self.destination
    }

    /// Whether either endpoint is exactly one of `names`
    pub fn touches(&self, names: &BTreeSet<String>) -> bool {
        names.contains(&self.source) || names.contains(&self.destination)
    }

    /// Parse the persisted `"source|destination"` form
    pub fn parse(key: &str) -> Result<Self> {
        match key.split_once(KEY_SEPARATOR) {
            Some((source, destination)) if !destination.contains(KEY_SEPARATOR) => {
                Ok(Self::new(source, destination))
            }
            _ => Err(Error::ParseError(format!("malformed matrix key '{key}'"))),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.source, self.destination)
    }
}

/// Sparse directed matrix. Absence of a live pair means an earlier
/// computation failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Matrix {
    entries: BTreeMap<PairKey, RouteMetric>,
}

impl Matrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the matrix file; a missing file is an empty matrix
    pub fn load(path: &Path) -> Result<Self> {
        let raw: BTreeMap<String, RouteMetric> = read_json(path)?.unwrap_or_default();
        let entries = raw
            .into_iter()
            .map(|(key, metric)| Ok((PairKey::parse(&key)?, metric)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        debug!("Loaded {} matrix entries from {}", entries.len(), path.display());
        Ok(Self { entries })
    }

    /// Serialise with string keys in sorted order
    pub fn stage(&self, path: &Path) -> Result<StagedWrite> {
        let raw: BTreeMap<String, &RouteMetric> = self
            .entries
            .iter()
            .map(|(key, metric)| (key.to_string(), metric))
            .collect();
        StagedWrite::json(path, &raw)
    }

    pub fn get(&self, source: &str, destination: &str) -> Option<&RouteMetric> {
        self.entries.get(&PairKey::new(source, destination))
    }

    pub fn contains(&self, key: &PairKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: PairKey, metric: RouteMetric) {
        self.entries.insert(key, metric);
    }

    pub fn remove(&mut self, key: &PairKey) -> Option<RouteMetric> {
        self.entries.remove(key)
    }

    /// Last-write-wins merge
    pub fn merge(&mut self, new_entries: impl IntoIterator<Item = (PairKey, RouteMetric)>) {
        self.entries.extend(new_entries);
    }

    /// Delete every entry whose source or destination is exactly one of
    /// `names`. Returns the number of entries removed.
    pub fn prune(&mut self, names: &BTreeSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.touches(names));
        before - self.entries.len()
    }

    pub fn set_self_pair(&mut self, name: &str) {
        self.entries.insert(PairKey::new(name, name), RouteMetric::zero());
    }

    /// Expected vs present entries over the given live geocoded names
    pub fn coverage<'a>(&self, live_geocoded: impl IntoIterator<Item = &'a str>) -> Coverage {
        let names: Vec<&str> = live_geocoded.into_iter().collect();
        let expected = names.len() * names.len();
        let present = names
            .iter()
            .flat_map(|source| names.iter().map(move |destination| (*source, *destination)))
            .filter(|(source, destination)| self.get(source, destination).is_some())
            .count();

        Coverage {
            live_geocoded: names.len(),
            expected,
            present,
            missing: expected - present,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PairKey, &RouteMetric)> {
        self.entries.iter()
    }
}
