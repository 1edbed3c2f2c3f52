//! End-of-run summary
//!
//! Per-entity and per-pair failures never abort a run. They are collected
//! here and logged once the run completes.

use std::ops::Range;

use log::{info, warn};

use crate::core::geocode::GeocodeFailure;

/// Share of missing entries above which the run summary warns
pub const MISSING_WARN_PERCENT: f64 = 5.0;

/// A directed pair that could not be routed
#[derive(Debug, Clone, PartialEq)]
pub struct RouteFailure {
    pub source: String,
    pub destination: String,
    pub reason: String,
}

/// A bulk table batch that failed after all attempts
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    /// 1-based batch number
    pub batch: usize,
    /// Source indices covered by the batch
    pub sources: Range<usize>,
    pub attempts: u32,
    pub reason: String,
}

/// Matrix completeness over the live geocoded entities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coverage {
    pub live_geocoded: usize,
    /// n² for n live geocoded entities
    pub expected: usize,
    pub present: usize,
    pub missing: usize,
}

impl Coverage {
    pub fn missing_percent(&self) -> f64 {
        if self.expected == 0 {
            0.0
        } else {
            self.missing as f64 * 100.0 / self.expected as f64
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.missing_percent() > MISSING_WARN_PERCENT
    }
}

/// Geocode resolutions counted by where the coordinate came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeocodeCounts {
    pub overrides: usize,
    pub cached: usize,
    pub geocoded: usize,
    pub degraded: usize,
}

impl GeocodeCounts {
    pub fn resolved(&self) -> usize {
        self.overrides + self.cached + self.geocoded + self.degraded
    }
}

/// Everything a run did, for logging and for callers to inspect
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub geocode: GeocodeCounts,
    pub geocode_failures: Vec<GeocodeFailure>,
    pub routes_requested: usize,
    pub routes_computed: usize,
    pub route_failures: Vec<RouteFailure>,
    pub batch_failures: Vec<BatchFailure>,
    pub entries_pruned: usize,
    pub coverage: Coverage,
}

impl RunReport {
    /// Whether the run left anything absent that it tried to compute
    pub fn has_failures(&self) -> bool {
        !self.geocode_failures.is_empty()
            || !self.route_failures.is_empty()
            || !self.batch_failures.is_empty()
    }

    pub fn log_summary(&self) {
        info!(
            "📋 Entities: {} added, {} modified, {} removed, {} unchanged",
            self.added, self.modified, self.removed, self.unchanged
        );
        info!(
            "📍 Coordinates: {} override, {} cached, {} geocoded, {} fallback, {} failed",
            self.geocode.overrides,
            self.geocode.cached,
            self.geocode.geocoded,
            self.geocode.degraded,
            self.geocode_failures.len()
        );
        for failure in &self.geocode_failures {
            warn!("⚠️  No coordinates for {}", failure.name);
        }

        info!(
            "🚗 Routes: {} requested, {} computed, {} failed; {} stale entries pruned",
            self.routes_requested,
            self.routes_computed,
            self.route_failures.len(),
            self.entries_pruned
        );
        for failure in &self.batch_failures {
            warn!(
                "⚠️  Batch {} (sources {}..{}) failed after {} attempts: {}",
                failure.batch, failure.sources.start, failure.sources.end, failure.attempts, failure.reason
            );
        }

        let coverage = &self.coverage;
        info!(
            "📊 Matrix: {}/{} entries for {} clubs with coordinates ({:.1}% missing)",
            coverage.present,
            coverage.expected,
            coverage.live_geocoded,
            coverage.missing_percent()
        );
        if coverage.is_degraded() {
            warn!(
                "⚠️  {} of {} expected entries are missing; run again with repair_missing to retry them",
                coverage.missing, coverage.expected
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_percent() {
        let coverage = Coverage {
            live_geocoded: 10,
            expected: 100,
            present: 94,
            missing: 6,
        };
        assert_eq!(coverage.missing_percent(), 6.0);
        assert!(coverage.is_degraded());

        let healthy = Coverage {
            present: 95,
            missing: 5,
            ..coverage
        };
        assert!(!healthy.is_degraded(), "Exactly 5% is tolerated");
        assert_eq!(Coverage::default().missing_percent(), 0.0);
    }

    #[test]
    fn test_has_failures() {
        let mut report = RunReport::default();
        assert!(!report.has_failures());

        report.route_failures.push(RouteFailure {
            source: "A".into(),
            destination: "B".into(),
            reason: "timeout".into(),
        });
        assert!(report.has_failures());
        report.log_summary();
    }
}
