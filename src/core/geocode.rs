//! Coordinate resolution: override table, persistent cache, live geocoding
//!
//! Resolution order for one entity (first hit wins):
//! 1. the override table (hand-curated fixes for provider mis-resolution),
//! 2. the cache, unless the entity was added or modified in this run,
//! 3. live geocoding with the full address, then once more with a degraded
//!    postal-code-and-city query.

use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};

use crate::core::config::GeocoderConfig;
use crate::core::entity::Entity;
use crate::core::error::{suggest_name, Error, Result};
use crate::core::retry::{status_error, Pacer, RetryPolicy};
use crate::core::store::{read_json, StagedWrite};

/// A resolved position, with the provider's label kept for auditing
#[derive(Debug, Clone, PartialEq)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
    pub display_name: Option<String>,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// Corrections for clubs the provider resolves to the wrong place
static BUILTIN_OVERRIDES: Lazy<BTreeMap<String, Coordinate>> = Lazy::new(|| {
    [
        ("Aarslev BK", 55.308319, 10.490157), // Fyn, not Aarhus
        ("DBU Fyn", 55.3954, 10.3516),
        ("F.C. Lange Bolde", 55.4120, 10.3640),
        ("FC Avrasya", 55.3990, 10.3970),
        ("FC Hjallese", 55.3970, 10.3900),
        ("FIUK, Odense", 55.4200, 10.4250),
        ("Get2Sport", 55.4120, 10.4130),
        ("Rise S & IF", 54.8850, 10.3730), // Ærø, not Rise near Aabenraa
    ]
    .into_iter()
    .map(|(name, lat, lon)| (name.to_string(), Coordinate::new(lat, lon)))
    .collect()
});

/// Fixed name → coordinate table that takes precedence over cache and lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    entries: BTreeMap<String, Coordinate>,
}

impl Overrides {
    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_OVERRIDES.clone(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, coordinate: Coordinate) {
        self.entries.insert(name.into(), coordinate);
    }

    pub fn get(&self, name: &str) -> Option<&Coordinate> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Warn about overrides that match no live entity (usually a rename)
    pub fn warn_unmatched(&self, entities: &[Entity]) {
        for name in self.entries.keys() {
            if entities.iter().any(|e| &e.name == name) {
                continue;
            }
            match suggest_name(name, entities.iter().map(|e| e.name.as_str())) {
                Some(suggestion) => {
                    warn!("⚠️  Override '{name}' matches no entity. Did you mean '{suggestion}'?")
                }
                None => debug!("Override '{name}' matches no entity"),
            }
        }
    }
}

/// Persisted cache record; numbers are stored as strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CacheRecord {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
}

/// Persistent entity name → coordinate cache
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeocodeCache {
    entries: BTreeMap<String, Coordinate>,
}

impl GeocodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cache file; a missing file is an empty cache. Records whose
    /// numbers do not parse are dropped so the entity gets geocoded again.
    pub fn load(path: &Path) -> Result<Self> {
        let records: BTreeMap<String, CacheRecord> = read_json(path)?.unwrap_or_default();
        let mut entries = BTreeMap::new();

        for (name, record) in records {
            match (record.lat.trim().parse::<f64>(), record.lon.trim().parse::<f64>()) {
                (Ok(lat), Ok(lon)) => {
                    let mut coordinate = Coordinate::new(lat, lon);
                    if !record.display_name.is_empty() {
                        coordinate.display_name = Some(record.display_name);
                    }
                    entries.insert(name, coordinate);
                }
                _ => warn!("⚠️  Ignoring unreadable cache entry for '{name}'"),
            }
        }

        debug!("Loaded {} cached coordinates from {}", entries.len(), path.display());
        Ok(Self { entries })
    }

    pub fn stage(&self, path: &Path) -> Result<StagedWrite> {
        let records: BTreeMap<&str, CacheRecord> = self
            .entries
            .iter()
            .map(|(name, c)| {
                (
                    name.as_str(),
                    CacheRecord {
                        lat: c.lat.to_string(),
                        lon: c.lon.to_string(),
                        display_name: c.display_name.clone().unwrap_or_default(),
                    },
                )
            })
            .collect();
        StagedWrite::json(path, &records)
    }

    pub fn get(&self, name: &str) -> Option<&Coordinate> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, coordinate: Coordinate) {
        self.entries.insert(name.into(), coordinate);
    }

    pub fn evict(&mut self, name: &str) -> Option<Coordinate> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Free-text address lookup against an external service
#[allow(async_fn_in_trait)]
pub trait Geocoder {
    /// One logical lookup. `Ok(None)` is a normal "no match".
    async fn geocode(&mut self, query: &str) -> Result<Option<Coordinate>>;
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: String,
}

/// Nominatim search client, paced to the public fair-use policy
pub struct NominatimClient {
    http: NominatimHttp,
    pacer: Pacer,
    retry: RetryPolicy,
}

/// One unpaced search request
struct NominatimHttp {
    client: Client,
    search_url: String,
    country_code: String,
}

impl NominatimClient {
    pub fn new(config: &GeocoderConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(config.timeout())
            .connect_timeout(config.timeout().min(std::time::Duration::from_secs(10)))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::ConfigError(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http: NominatimHttp {
                client,
                search_url: format!("{}/search", config.base_url.trim_end_matches('/')),
                country_code: config.country_code.clone(),
            },
            pacer: Pacer::new(config.min_interval()),
            retry: config.retry_policy(),
        })
    }
}

impl NominatimHttp {
    async fn search(&self, query: &str) -> Result<Option<Coordinate>> {
        let response = self
            .client
            .get(&self.search_url)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("limit", "1"),
                ("countrycodes", self.country_code.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error("Nominatim", response.status()));
        }

        let places: Vec<NominatimPlace> = response.json().await?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };

        let lat = place.lat.parse::<f64>();
        let lon = place.lon.parse::<f64>();
        match (lat, lon) {
            (Ok(lat), Ok(lon)) => Ok(Some(
                Coordinate::new(lat, lon).with_display_name(place.display_name),
            )),
            _ => Err(Error::ParseError(format!(
                "Nominatim returned non-numeric coordinates ({}, {})",
                place.lat, place.lon
            ))),
        }
    }
}

impl Geocoder for NominatimClient {
    async fn geocode(&mut self, query: &str) -> Result<Option<Coordinate>> {
        debug!("Geocoding '{query}'");
        self.retry
            .run_paced(&mut self.pacer, "Geocoding", || self.http.search(query))
            .await
    }
}

/// Where a resolved coordinate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoordinateSource {
    Override,
    Cache,
    /// Live lookup with the full address
    Geocoded,
    /// Live lookup with the postal-code-and-city fallback
    Degraded,
}

impl CoordinateSource {
    /// Coordinates obtained by a lookup in this run
    pub fn is_fresh(&self) -> bool {
        matches!(self, CoordinateSource::Geocoded | CoordinateSource::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub coordinate: Coordinate,
    pub source: CoordinateSource,
}

/// No coordinate could be found with any strategy
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeFailure {
    pub name: String,
    pub queries: Vec<String>,
    pub last_error: Option<String>,
}

/// Build the lookup queries for an entity: full address, then the degraded
/// postal-code-and-city query when it differs and is not blank.
pub fn geocode_queries(entity: &Entity, country_name: &str) -> Vec<String> {
    let locality = join_nonempty(&[&entity.postal_code, &entity.city], " ");
    let full = join_nonempty(&[&entity.address, &locality, country_name], ", ");
    let mut queries = vec![full];

    if !locality.is_empty() {
        let degraded = join_nonempty(&[&locality, country_name], ", ");
        if !queries.contains(&degraded) {
            queries.push(degraded);
        }
    }
    queries
}

fn join_nonempty(parts: &[&str], separator: &str) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

/// The resolution policy for one run
#[derive(Debug, Clone)]
pub struct GeocodePolicy {
    overrides: Overrides,
    country_name: String,
}

impl GeocodePolicy {
    pub fn new(overrides: Overrides, country_name: impl Into<String>) -> Self {
        Self {
            overrides,
            country_name: country_name.into(),
        }
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    /// Resolve one entity. `affected` entities never short-circuit on the cache.
    ///
    /// Live successes are written to `cache`; a failed entity is evicted from
    /// it so a stale coordinate cannot resurface on the next run.
    pub async fn resolve<G: Geocoder>(
        &self,
        entity: &Entity,
        affected: bool,
        cache: &mut GeocodeCache,
        geocoder: &mut G,
    ) -> std::result::Result<Resolved, GeocodeFailure> {
        if let Some(coordinate) = self.overrides.get(&entity.name) {
            return Ok(Resolved {
                coordinate: coordinate.clone(),
                source: CoordinateSource::Override,
            });
        }

        if !affected {
            if let Some(coordinate) = cache.get(&entity.name) {
                return Ok(Resolved {
                    coordinate: coordinate.clone(),
                    source: CoordinateSource::Cache,
                });
            }
        }

        let queries = geocode_queries(entity, &self.country_name);
        let mut last_error = None;

        for (attempt, query) in queries.iter().enumerate() {
            match geocoder.geocode(query).await {
                Ok(Some(coordinate)) => {
                    let source = if attempt == 0 {
                        CoordinateSource::Geocoded
                    } else {
                        CoordinateSource::Degraded
                    };
                    info!(
                        "📍 {}: {:.4}, {:.4}{}",
                        entity.name,
                        coordinate.lat,
                        coordinate.lon,
                        if attempt == 0 { "" } else { " (fallback)" }
                    );
                    cache.insert(entity.name.clone(), coordinate.clone());
                    return Ok(Resolved { coordinate, source });
                }
                Ok(None) => debug!("No match for '{query}'"),
                Err(e) => {
                    warn!("⚠️  Geocoding '{query}' failed: {e}");
                    last_error = Some(e.to_string());
                }
            }
        }

        warn!("⚠️  Could not geocode {} ({})", entity.name, queries.join(" | "));
        cache.evict(&entity.name);
        Err(GeocodeFailure {
            name: entity.name.clone(),
            queries,
            last_error,
        })
    }
}
