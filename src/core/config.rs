//! Run configuration
//!
//! Every field has a default, so the TOML file is optional and may be partial.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::entity::KEY_SEPARATOR;
use crate::core::error::{Error, Result};
use crate::core::geocode::{Coordinate, Overrides};
use crate::core::retry::RetryPolicy;

/// Nominatim fair-use floor
pub const MIN_GEOCODE_INTERVAL_MS: u64 = 1100;
/// Public OSRM floor for pairwise calls
pub const MIN_PAIR_INTERVAL_MS: u64 = 600;
/// Public OSRM floor between table batches
pub const MIN_BATCH_INTERVAL_MS: u64 = 2000;
/// Largest source batch the public OSRM table endpoint accepts reliably
pub const MAX_BATCH_SIZE: usize = 40;

/// Where the three state files live
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub entities: PathBuf,
    pub matrix: PathBuf,
    pub geocode_cache: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            entities: PathBuf::from("data/clubs.json"),
            matrix: PathBuf::from("data/matrix.json"),
            geocode_cache: PathBuf::from("cache/geocode_cache.json"),
        }
    }
}

impl PathsConfig {
    /// Resolve relative paths against `base`; absolute paths are kept
    pub fn relative_to(&self, base: &Path) -> Self {
        let resolve = |p: &PathBuf| if p.is_absolute() { p.clone() } else { base.join(p) };
        Self {
            entities: resolve(&self.entities),
            matrix: resolve(&self.matrix),
            geocode_cache: resolve(&self.geocode_cache),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeocoderConfig {
    pub base_url: String,
    pub country_code: String,
    /// Appended to every query
    pub country_name: String,
    pub user_agent: String,
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            country_code: "dk".to_string(),
            country_name: "Danmark".to_string(),
            user_agent: format!("drivetime-matrix/{}", env!("CARGO_PKG_VERSION")),
            min_interval_ms: MIN_GEOCODE_INTERVAL_MS,
            timeout_secs: 15,
            max_attempts: 3,
            retry_delay_ms: 2000,
        }
    }
}

impl GeocoderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_attempts, Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub base_url: String,
    pub profile: String,
    pub pair_interval_ms: u64,
    pub batch_interval_ms: u64,
    pub batch_size: usize,
    pub pair_timeout_secs: u64,
    pub table_timeout_secs: u64,
    pub max_attempts: u32,
    pub pair_retry_delay_ms: u64,
    pub batch_retry_delay_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_url: "http://router.project-osrm.org".to_string(),
            profile: "driving".to_string(),
            pair_interval_ms: MIN_PAIR_INTERVAL_MS,
            batch_interval_ms: MIN_BATCH_INTERVAL_MS,
            batch_size: MAX_BATCH_SIZE,
            pair_timeout_secs: 30,
            table_timeout_secs: 120,
            max_attempts: 3,
            pair_retry_delay_ms: 5000,
            batch_retry_delay_ms: 10000,
        }
    }
}

impl RouterConfig {
    pub fn pair_interval(&self) -> Duration {
        Duration::from_millis(self.pair_interval_ms)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn pair_timeout(&self) -> Duration {
        Duration::from_secs(self.pair_timeout_secs)
    }

    pub fn table_timeout(&self) -> Duration {
        Duration::from_secs(self.table_timeout_secs)
    }

    pub fn pair_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_attempts, Duration::from_millis(self.pair_retry_delay_ms))
    }

    pub fn batch_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.max_attempts, Duration::from_millis(self.batch_retry_delay_ms))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct OverrideEntry {
    pub lat: f64,
    pub lon: f64,
}

/// Top-level configuration, loaded from TOML
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub geocoder: GeocoderConfig,
    pub router: RouterConfig,
    /// Extra name → coordinate overrides, merged over the built-in table
    pub overrides: BTreeMap<String, OverrideEntry>,
    pub builtin_overrides: bool,
    /// Recompute pairs between live geocoded entities that are absent from the matrix
    pub repair_missing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            geocoder: GeocoderConfig::default(),
            router: RouterConfig::default(),
            overrides: BTreeMap::new(),
            builtin_overrides: true,
            repair_missing: false,
        }
    }
}

impl Config {
    /// Read and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reject settings that would break the upstream services' usage policies
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.geocoder.min_interval_ms < MIN_GEOCODE_INTERVAL_MS {
            problems.push(format!(
                "geocoder.min_interval_ms must be at least {MIN_GEOCODE_INTERVAL_MS}"
            ));
        }
        if self.router.pair_interval_ms < MIN_PAIR_INTERVAL_MS {
            problems.push(format!(
                "router.pair_interval_ms must be at least {MIN_PAIR_INTERVAL_MS}"
            ));
        }
        if self.router.batch_interval_ms < MIN_BATCH_INTERVAL_MS {
            problems.push(format!(
                "router.batch_interval_ms must be at least {MIN_BATCH_INTERVAL_MS}"
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.router.batch_size) {
            problems.push(format!("router.batch_size must be within 1..={MAX_BATCH_SIZE}"));
        }
        if self.geocoder.max_attempts == 0 || self.router.max_attempts == 0 {
            problems.push("max_attempts must be at least 1".to_string());
        }
        if self.geocoder.base_url.trim().is_empty() || self.router.base_url.trim().is_empty() {
            problems.push("base_url must not be empty".to_string());
        }
        for name in self.overrides.keys() {
            if name.contains(KEY_SEPARATOR) {
                problems.push(format!("override name '{name}' contains '{KEY_SEPARATOR}'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigError(problems.join("; ")))
        }
    }

    /// The effective override table
    pub fn overrides(&self) -> Overrides {
        let mut overrides = if self.builtin_overrides {
            Overrides::builtin()
        } else {
            Overrides::default()
        };
        for (name, entry) in &self.overrides {
            overrides.insert(name.clone(), Coordinate::new(entry.lat, entry.lon));
        }
        overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.router.batch_size, 40);
        assert_eq!(config.geocoder.min_interval(), Duration::from_millis(1100));
        assert_eq!(config.router.batch_retry_policy().delay_after(2), Duration::from_secs(20));
        assert!(config.builtin_overrides);
        assert!(!config.repair_missing);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            repair_missing = true

            [router]
            base_url = "http://localhost:5000"
            batch_size = 25

            [overrides]
            "B1909" = { lat = 55.40, lon = 10.38 }
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert!(config.repair_missing);
        assert_eq!(config.router.base_url, "http://localhost:5000");
        assert_eq!(config.router.batch_size, 25);
        assert_eq!(config.router.profile, "driving");
        assert_eq!(config.paths, PathsConfig::default());

        let overrides = config.overrides();
        assert_eq!(overrides.get("B1909").unwrap().lat, 55.40);
        assert!(overrides.get("DBU Fyn").is_some());
    }

    #[test]
    fn test_disable_builtin_overrides() {
        let config = Config::from_toml("builtin_overrides = false").unwrap();
        assert!(config.overrides().is_empty());
    }

    #[test]
    fn test_validate_rejects_aggressive_pacing() {
        let config = Config::from_toml(
            r#"
            [geocoder]
            min_interval_ms = 200

            [router]
            batch_size = 100
            "#,
        )
        .unwrap();

        match config.validate() {
            Err(Error::ConfigError(msg)) => {
                assert!(msg.contains("geocoder.min_interval_ms"));
                assert!(msg.contains("router.batch_size"));
            }
            other => panic!("Expected ConfigError, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_separator_in_override() {
        let config = Config::from_toml(r#"overrides = { "A|B" = { lat = 1.0, lon = 2.0 } }"#).unwrap();
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        assert!(matches!(
            Config::from_toml("[router\nbatch_size = 1"),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_paths_relative_to_data_dir() {
        let paths = PathsConfig {
            geocode_cache: PathBuf::from("/var/cache/geo.json"),
            ..PathsConfig::default()
        }
        .relative_to(Path::new("/srv/fyn"));

        assert_eq!(paths.entities, PathBuf::from("/srv/fyn/data/clubs.json"));
        assert_eq!(paths.geocode_cache, PathBuf::from("/var/cache/geo.json"));
    }
}
