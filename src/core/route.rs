//! Driving time/distance lookups against an OSRM-compatible routing service
//!
//! Two modes share one metric type:
//! - pairwise (`/route`): one call per ordered pair, for incremental runs;
//! - bulk table (`/table`): one call per batch of sources against every
//!   destination, for full rebuilds.

use std::ops::Range;

use log::debug;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};

use crate::core::config::RouterConfig;
use crate::core::error::{Error, Result};
use crate::core::geocode::Coordinate;
use crate::core::retry::{status_error, Pacer, RetryPolicy};

/// Travel metrics for one directed pair, with the derived presentation fields.
///
/// Field order matches the persisted matrix record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMetric {
    pub duration_min: i64,
    pub duration_sec: i64,
    pub distance_km: f64,
    pub duration_text: String,
}

impl RouteMetric {
    /// Derive the metric from raw service output (seconds, meters).
    ///
    /// Rounding is half-to-even, matching the values already in existing
    /// matrix files.
    pub fn from_raw(duration_s: f64, distance_m: f64) -> Self {
        let duration_min = (duration_s / 60.0).round_ties_even() as i64;
        Self {
            duration_min,
            duration_sec: duration_s.round_ties_even() as i64,
            distance_km: (distance_m / 100.0).round_ties_even() / 10.0,
            duration_text: duration_text(duration_min),
        }
    }

    /// The metric of a self-pair
    pub fn zero() -> Self {
        Self::from_raw(0.0, 0.0)
    }
}

/// "42 min", or "1 t 5 min" from one hour up
pub fn duration_text(minutes: i64) -> String {
    if minutes >= 60 {
        format!("{} t {} min", minutes / 60, minutes % 60)
    } else {
        format!("{minutes} min")
    }
}

/// One row per requested source, one cell per coordinate; `None` = unreachable
pub type TableRows = Vec<Vec<Option<RouteMetric>>>;

/// Driving route lookups
#[allow(async_fn_in_trait)]
pub trait RouteProvider {
    /// Fastest route from `from` to `to`. `Ok(None)` when the service answers
    /// that there is no route; `Err` when the call itself failed.
    async fn route(&mut self, from: &Coordinate, to: &Coordinate) -> Result<Option<RouteMetric>>;

    /// Rows for `sources` (indices into `coordinates`) against all coordinates
    async fn table(&mut self, coordinates: &[Coordinate], sources: Range<usize>) -> Result<TableRows>;

    /// Attempts spent on a table batch before it is reported as failed
    fn table_attempts(&self) -> u32 {
        1
    }
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    duration: f64,
    distance: f64,
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmTableResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    durations: Option<Vec<Vec<Option<f64>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f64>>>>,
}

/// OSRM HTTP client with separate pacing for pairwise calls and table batches
pub struct OsrmClient {
    http: OsrmHttp,
    pair_pacer: Pacer,
    batch_pacer: Pacer,
    pair_retry: RetryPolicy,
    batch_retry: RetryPolicy,
}

/// Unpaced single requests against one OSRM instance
struct OsrmHttp {
    client: Client,
    base_url: String,
    profile: String,
    pair_timeout: std::time::Duration,
    table_timeout: std::time::Duration,
}

impl OsrmClient {
    pub fn new(config: &RouterConfig, user_agent: &str) -> Result<Self> {
        let client = ClientBuilder::new()
            .connect_timeout(std::time::Duration::from_secs(10))
            .user_agent(user_agent.to_string())
            .build()
            .map_err(|e| Error::ConfigError(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http: OsrmHttp {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                profile: config.profile.clone(),
                pair_timeout: config.pair_timeout(),
                table_timeout: config.table_timeout(),
            },
            pair_pacer: Pacer::new(config.pair_interval()),
            batch_pacer: Pacer::new(config.batch_interval()),
            pair_retry: config.pair_retry_policy(),
            batch_retry: config.batch_retry_policy(),
        })
    }
}

impl OsrmHttp {
    fn route_url(&self, from: &Coordinate, to: &Coordinate) -> String {
        format!(
            "{}/route/v1/{}/{},{};{},{}",
            self.base_url, self.profile, from.lon, from.lat, to.lon, to.lat
        )
    }

    fn table_url(&self, coordinates: &[Coordinate]) -> String {
        let coords = coordinates
            .iter()
            .map(|c| format!("{},{}", c.lon, c.lat))
            .collect::<Vec<_>>()
            .join(";");
        format!("{}/table/v1/{}/{}", self.base_url, self.profile, coords)
    }

    async fn fetch_route(&self, url: &str) -> Result<Option<RouteMetric>> {
        let response = self
            .client
            .get(url)
            .query(&[("overview", "false")])
            .timeout(self.pair_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            // OSRM answers "NoRoute" with 400 and a JSON body
            if response.status() == reqwest::StatusCode::BAD_REQUEST {
                if let Ok(body) = response.json::<OsrmRouteResponse>().await {
                    debug!("No route: {} {}", body.code, body.message.unwrap_or_default());
                    return Ok(None);
                }
                return Err(Error::RequestRejected("OSRM returned 400 Bad Request".into()));
            }
            return Err(status_error("OSRM", response.status()));
        }

        let body: OsrmRouteResponse = response.json().await?;
        if body.code != "Ok" {
            debug!("No route: {} {}", body.code, body.message.unwrap_or_default());
            return Ok(None);
        }
        Ok(body
            .routes
            .first()
            .map(|route| RouteMetric::from_raw(route.duration, route.distance)))
    }

    async fn fetch_table(&self, url: &str, sources: &str, width: usize, height: usize) -> Result<TableRows> {
        let response = self
            .client
            .get(url)
            .query(&[("sources", sources), ("annotations", "duration,distance")])
            .timeout(self.table_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error("OSRM table", response.status()));
        }

        let body: OsrmTableResponse = response.json().await?;
        if body.code != "Ok" {
            return Err(Error::RequestRejected(format!(
                "OSRM table answered {}: {}",
                body.code,
                body.message.unwrap_or_default()
            )));
        }

        let (Some(durations), Some(distances)) = (body.durations, body.distances) else {
            return Err(Error::ParseError("OSRM table response lacks durations or distances".into()));
        };
        if durations.len() != height
            || distances.len() != height
            || durations.iter().chain(distances.iter()).any(|row| row.len() != width)
        {
            return Err(Error::ParseError(format!(
                "OSRM table response is not {height}x{width}"
            )));
        }

        Ok(durations
            .into_iter()
            .zip(distances)
            .map(|(duration_row, distance_row)| {
                duration_row
                    .into_iter()
                    .zip(distance_row)
                    .map(|cell| match cell {
                        (Some(duration), Some(distance)) => Some(RouteMetric::from_raw(duration, distance)),
                        _ => None,
                    })
                    .collect()
            })
            .collect())
    }
}

impl RouteProvider for OsrmClient {
    async fn route(&mut self, from: &Coordinate, to: &Coordinate) -> Result<Option<RouteMetric>> {
        let url = self.http.route_url(from, to);
        debug!("Routing {url}");
        self.pair_retry
            .run_paced(&mut self.pair_pacer, "Route", || self.http.fetch_route(&url))
            .await
    }

    async fn table(&mut self, coordinates: &[Coordinate], sources: Range<usize>) -> Result<TableRows> {
        if sources.end > coordinates.len() || sources.is_empty() {
            return Err(Error::InvalidInput(format!(
                "source range {sources:?} outside 0..{}",
                coordinates.len()
            )));
        }

        let url = self.http.table_url(coordinates);
        let source_list = sources
            .clone()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(";");
        debug!("Table batch {sources:?} ({} chars)", url.len());

        self.batch_retry
            .run_paced(&mut self.batch_pacer, "Table batch", || {
                self.http
                    .fetch_table(&url, &source_list, coordinates.len(), sources.len())
            })
            .await
    }

    fn table_attempts(&self) -> u32 {
        self.batch_retry.max_attempts.max(1)
    }
}
