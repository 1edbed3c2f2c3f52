//! # drivetime-matrix
//!
//! Keeps a directed driving-time/distance matrix between named locations
//! (sports clubs) in step with a periodically refreshed address list, while
//! calling the geocoding (Nominatim) and routing (OSRM) services as rarely
//! as possible.
//!
//! Each run diffs the new entity list against the previous one. Only added
//! or modified entities are geocoded again and only pairs touching them are
//! routed; entries of removed entities are pruned. The entity list, the
//! matrix and the geocode cache are read once at start and written once at
//! the end.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use drivetime_matrix::{Config, RouteMode};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let report = drivetime_matrix::synchronize(
//!         &config,
//!         Path::new("export/clubs.csv"),
//!         RouteMode::Pairwise,
//!         None,
//!     )
//!     .await?;
//!     println!("{} routes computed", report.routes_computed);
//!     Ok(())
//! }
//! ```
//!
//! The engine itself is generic over [`Geocoder`] and [`RouteProvider`], so
//! it can be driven without any network access:
//!
//! ```rust,ignore
//! let mut sync = Synchronizer::new(my_geocoder, my_router, policy, SyncOptions::default());
//! let outcome = sync.run(SyncState::default(), entities, RouteMode::Pairwise).await?;
//! ```

use std::path::Path;

use log::info;

mod core;

pub use crate::core::config::{
    Config, GeocoderConfig, OverrideEntry, PathsConfig, RouterConfig, MAX_BATCH_SIZE,
    MIN_BATCH_INTERVAL_MS, MIN_GEOCODE_INTERVAL_MS, MIN_PAIR_INTERVAL_MS,
};
pub use crate::core::diff::{diff, DiffResult};
pub use crate::core::entity::{normalize_entities, Entity, EntitySource, EntityStore, KEY_SEPARATOR};
pub use crate::core::error::{suggest_name, Error, Result};
pub use crate::core::geocode::{
    geocode_queries, Coordinate, CoordinateSource, GeocodeCache, GeocodeFailure, GeocodePolicy,
    Geocoder, NominatimClient, Overrides, Resolved,
};
pub use crate::core::matrix::{Matrix, PairKey};
pub use crate::core::report::{BatchFailure, Coverage, GeocodeCounts, RouteFailure, RunReport};
pub use crate::core::retry::{Backoff, Pacer, RetryPolicy};
pub use crate::core::route::{duration_text, OsrmClient, RouteMetric, RouteProvider, TableRows};
pub use crate::core::store::{commit_all, read_json, StagedWrite};
pub use crate::core::sync::{
    plan, plan_routes, ProgressCallback, RouteMode, SyncOptions, SyncOutcome, SyncPlan, SyncState,
    Synchronizer,
};

/// Run one synchronisation against the configured services and persist the
/// result.
///
/// Loads the previous state from `config.paths`, the new entity list from
/// `entities`, and writes all three outputs only after the run completed.
pub async fn synchronize(
    config: &Config,
    entities: &Path,
    mode: RouteMode,
    progress: Option<ProgressCallback>,
) -> Result<RunReport> {
    let new_entities = EntitySource::new(entities).load()?;
    let state = SyncState::load(&config.paths)?;

    let geocoder = NominatimClient::new(&config.geocoder)?;
    let router = OsrmClient::new(&config.router, &config.geocoder.user_agent)?;
    let policy = GeocodePolicy::new(config.overrides(), config.geocoder.country_name.clone());
    let options = SyncOptions {
        progress,
        batch_size: config.router.batch_size,
        repair_missing: config.repair_missing,
    };

    let mut synchronizer = Synchronizer::new(geocoder, router, policy, options);
    let outcome = synchronizer.run(state, new_entities, mode).await?;
    outcome.state.save(&config.paths)?;

    outcome.report.log_summary();
    info!("✅ Matrix written to {}", config.paths.matrix.display());
    Ok(outcome.report)
}
