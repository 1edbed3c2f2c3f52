//! Incremental synchronisation of the matrix against a new entity list
//!
//! One run: diff the snapshots, resolve coordinates, prune entries for removed
//! or unresolvable entities, set self-pairs, compute the routes the diff
//! calls for, and hand back the new state with a [`RunReport`]. Nothing is
//! written to disk here; [`SyncState::save`] persists the result.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{info, warn};

use crate::core::config::{PathsConfig, MAX_BATCH_SIZE};
use crate::core::diff::{diff, DiffResult};
use crate::core::entity::{normalize_entities, Entity, EntityStore};
use crate::core::error::Result;
use crate::core::geocode::{Coordinate, CoordinateSource, GeocodeCache, GeocodePolicy, Geocoder, Overrides};
use crate::core::matrix::{Matrix, PairKey};
use crate::core::report::{BatchFailure, RouteFailure, RunReport};
use crate::core::route::RouteProvider;
use crate::core::store::commit_all;

/// Progress callback: (completed, total)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// How routes are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteMode {
    /// One call per directed pair touching the re-route set
    #[default]
    Pairwise,
    /// Rebuild the whole matrix from batched table calls
    Table,
}

/// Options for a synchronisation run
#[derive(Clone)]
pub struct SyncOptions {
    /// Optional progress callback for route calls or batches
    pub progress: Option<ProgressCallback>,
    /// Sources per table call
    pub batch_size: usize,
    /// Also recompute live pairs that are absent from the matrix
    pub repair_missing: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            progress: None,
            batch_size: MAX_BATCH_SIZE,
            repair_missing: false,
        }
    }
}

/// Everything a run reads at start and writes at end
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub entities: Vec<Entity>,
    pub matrix: Matrix,
    pub cache: GeocodeCache,
}

impl SyncState {
    /// Load all persisted state; missing files mean a first run
    pub fn load(paths: &PathsConfig) -> Result<Self> {
        Ok(Self {
            entities: EntityStore::new(&paths.entities).load_previous()?,
            matrix: Matrix::load(&paths.matrix)?,
            cache: GeocodeCache::load(&paths.geocode_cache)?,
        })
    }

    /// Persist the matrix, cache and entity list. All three are serialised
    /// before any of them replaces its file.
    ///
    /// The entity list drives the next diff, so it is replaced last: if a
    /// rename fails, the next run still sees the old list and recomputes.
    pub fn save(&self, paths: &PathsConfig) -> Result<()> {
        let writes = vec![
            self.matrix.stage(&paths.matrix)?,
            self.cache.stage(&paths.geocode_cache)?,
            EntityStore::new(&paths.entities).stage(&self.entities)?,
        ];
        commit_all(writes)?;
        info!("💾 Saved {} entities and {} matrix entries", self.entities.len(), self.matrix.len());
        Ok(())
    }

    /// Entities that have a coordinate in the cache or the override table
    pub fn located<'a>(&'a self, overrides: &'a Overrides) -> impl Iterator<Item = &'a str> + 'a {
        self.entities
            .iter()
            .filter(|e| overrides.get(&e.name).is_some() || self.cache.get(&e.name).is_some())
            .map(|e| e.name.as_str())
    }
}

/// Result of a run
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub state: SyncState,
    pub report: RunReport,
}

/// What a run would do, computed without external calls
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub diff: DiffResult,
    /// Entities that would need a live lookup
    pub to_geocode: Vec<String>,
    /// Upper bound of route computations (pairs, or batches in table mode)
    pub route_calls: usize,
    pub mode: RouteMode,
}

/// Directed pairs to compute: every pair touching `route_set` in both
/// directions, plus absent live pairs when `repair_missing` is set.
/// Self-pairs are never included; they are set without a lookup.
pub fn plan_routes(
    live: &[&str],
    route_set: &BTreeSet<String>,
    matrix: &Matrix,
    repair_missing: bool,
) -> BTreeSet<PairKey> {
    let mut pairs = BTreeSet::new();

    for source in live.iter().filter(|name| route_set.contains(**name)) {
        for destination in live.iter().filter(|name| *name != source) {
            pairs.insert(PairKey::new(*source, *destination));
            pairs.insert(PairKey::new(*destination, *source));
        }
    }

    if repair_missing {
        for source in live {
            for destination in live.iter().filter(|name| *name != source) {
                let key = PairKey::new(*source, *destination);
                if !matrix.contains(&key) {
                    pairs.insert(key);
                }
            }
        }
    }

    pairs
}

/// Dry run: classify and estimate without touching any service
pub fn plan(
    state: &SyncState,
    new_entities: &[Entity],
    overrides: &Overrides,
    mode: RouteMode,
    options: &SyncOptions,
) -> SyncPlan {
    let diff = diff(&state.entities, new_entities);

    let to_geocode: Vec<String> = new_entities
        .iter()
        .filter(|e| overrides.get(&e.name).is_none())
        .filter(|e| diff.is_affected(&e.name) || state.cache.get(&e.name).is_none())
        .map(|e| e.name.clone())
        .collect();

    let live: Vec<&str> = new_entities.iter().map(|e| e.name.as_str()).collect();
    let route_calls = match mode {
        RouteMode::Pairwise => {
            let mut route_set = diff.affected();
            route_set.extend(to_geocode.iter().cloned());
            plan_routes(&live, &route_set, &state.matrix, options.repair_missing).len()
        }
        RouteMode::Table => live.len().div_ceil(options.batch_size.max(1)),
    };

    SyncPlan {
        diff,
        to_geocode,
        route_calls,
        mode,
    }
}

/// Drives one synchronisation run against a geocoder and a route provider
pub struct Synchronizer<G, R> {
    geocoder: G,
    router: R,
    policy: GeocodePolicy,
    options: SyncOptions,
}

impl<G: Geocoder, R: RouteProvider> Synchronizer<G, R> {
    pub fn new(geocoder: G, router: R, policy: GeocodePolicy, options: SyncOptions) -> Self {
        Self {
            geocoder,
            router,
            policy,
            options,
        }
    }

    pub fn geocoder(&self) -> &G {
        &self.geocoder
    }

    pub fn router(&self) -> &R {
        &self.router
    }

    /// Run one synchronisation. Only invalid entity input is an error;
    /// geocoding and routing failures end up in the report.
    pub async fn run(
        &mut self,
        state: SyncState,
        new_entities: Vec<Entity>,
        mode: RouteMode,
    ) -> Result<SyncOutcome> {
        let new_entities = normalize_entities(new_entities)?;
        let SyncState {
            entities: previous,
            mut matrix,
            mut cache,
        } = state;

        let diff = diff(&previous, &new_entities);
        let mut report = RunReport {
            added: diff.added.len(),
            modified: diff.modified.len(),
            removed: diff.removed.len(),
            unchanged: diff.unchanged.len(),
            ..Default::default()
        };
        info!(
            "🔍 {} added, {} modified, {} removed, {} unchanged",
            report.added, report.modified, report.removed, report.unchanged
        );

        self.policy.overrides().warn_unmatched(&new_entities);

        // Coordinates, in new-snapshot order
        let mut coordinates: BTreeMap<String, Coordinate> = BTreeMap::new();
        let mut live: Vec<&str> = Vec::new();
        let mut route_set = diff.affected();
        let mut unresolved = BTreeSet::new();

        for entity in &new_entities {
            let affected = diff.is_affected(&entity.name);
            match self
                .policy
                .resolve(entity, affected, &mut cache, &mut self.geocoder)
                .await
            {
                Ok(resolved) => {
                    match resolved.source {
                        CoordinateSource::Override => report.geocode.overrides += 1,
                        CoordinateSource::Cache => report.geocode.cached += 1,
                        CoordinateSource::Geocoded => report.geocode.geocoded += 1,
                        CoordinateSource::Degraded => report.geocode.degraded += 1,
                    }
                    if resolved.source.is_fresh() {
                        route_set.insert(entity.name.clone());
                    }
                    coordinates.insert(entity.name.clone(), resolved.coordinate);
                    live.push(entity.name.as_str());
                }
                Err(failure) => {
                    unresolved.insert(failure.name.clone());
                    report.geocode_failures.push(failure);
                }
            }
        }

        let mut stale = diff.removed.clone();
        stale.extend(unresolved);
        report.entries_pruned = matrix.prune(&stale);

        match mode {
            RouteMode::Pairwise => {
                for name in &live {
                    matrix.set_self_pair(name);
                }
                let pairs = plan_routes(&live, &route_set, &matrix, self.options.repair_missing);
                self.route_pairs(pairs, &coordinates, &mut matrix, &mut report).await;
            }
            RouteMode::Table => {
                matrix = Matrix::new();
                for name in &live {
                    matrix.set_self_pair(name);
                }
                self.route_table(&live, &coordinates, &mut matrix, &mut report).await;
            }
        }

        report.coverage = matrix.coverage(live.iter().copied());

        Ok(SyncOutcome {
            state: SyncState {
                entities: new_entities,
                matrix,
                cache,
            },
            report,
        })
    }

    async fn route_pairs(
        &mut self,
        pairs: BTreeSet<PairKey>,
        coordinates: &BTreeMap<String, Coordinate>,
        matrix: &mut Matrix,
        report: &mut RunReport,
    ) {
        let total = pairs.len() as u64;
        report.routes_requested += pairs.len();
        if total > 0 {
            info!("🚗 Computing {total} routes");
        }

        for (done, key) in pairs.into_iter().enumerate() {
            let (Some(from), Some(to)) = (coordinates.get(&key.source), coordinates.get(&key.destination)) else {
                continue;
            };

            let reason = match self.router.route(from, to).await {
                Ok(Some(metric)) => {
                    matrix.insert(key.clone(), metric);
                    report.routes_computed += 1;
                    None
                }
                Ok(None) => Some("no route".to_string()),
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = reason {
                warn!("⚠️  No route {key}: {reason}");
                // The old entry describes a previous address
                matrix.remove(&key);
                report.route_failures.push(RouteFailure {
                    source: key.source,
                    destination: key.destination,
                    reason,
                });
            }

            if let Some(progress) = &self.options.progress {
                progress(done as u64 + 1, total);
            }
        }
    }

    async fn route_table(
        &mut self,
        live: &[&str],
        coordinates: &BTreeMap<String, Coordinate>,
        matrix: &mut Matrix,
        report: &mut RunReport,
    ) {
        let points: Vec<Coordinate> = live
            .iter()
            .filter_map(|name| coordinates.get(*name).cloned())
            .collect();
        let n = points.len();
        let batch_size = self.options.batch_size.max(1);
        let batches = n.div_ceil(batch_size);
        report.routes_requested += n * n.saturating_sub(1);
        if batches > 0 {
            info!("🚗 Rebuilding {n}x{n} matrix in {batches} batches");
        }

        for (index, start) in (0..n).step_by(batch_size).enumerate() {
            let sources = start..(start + batch_size).min(n);

            match self.router.table(&points, sources.clone()).await {
                Ok(rows) => {
                    for (row, source) in rows.into_iter().zip(sources.clone()) {
                        for (cell, destination) in row.into_iter().zip(0..n) {
                            if source == destination {
                                continue;
                            }
                            if let Some(metric) = cell {
                                matrix.insert(PairKey::new(live[source], live[destination]), metric);
                                report.routes_computed += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("⚠️  Batch {} failed: {e}", index + 1);
                    report.batch_failures.push(BatchFailure {
                        batch: index + 1,
                        sources,
                        attempts: self.router.table_attempts(),
                        reason: e.to_string(),
                    });
                }
            }

            if let Some(progress) = &self.options.progress {
                progress(index as u64 + 1, batches as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;
    use crate::core::geocode::geocode_queries;
    use crate::core::route::{RouteMetric, TableRows};
    use std::ops::Range;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    /// Answers known full-address queries; everything else is "no match"
    #[derive(Default)]
    struct FakeGeocoder {
        known: BTreeMap<String, Coordinate>,
        calls: Vec<String>,
    }

    impl FakeGeocoder {
        fn knowing(entities: &[Entity]) -> Self {
            let known = entities
                .iter()
                .map(|e| (geocode_queries(e, "Danmark")[0].clone(), fake_coordinate(e)))
                .collect();
            Self {
                known,
                calls: Vec::new(),
            }
        }
    }

    impl Geocoder for FakeGeocoder {
        async fn geocode(&mut self, query: &str) -> Result<Option<Coordinate>> {
            self.calls.push(query.to_string());
            Ok(self.known.get(query).cloned())
        }
    }

    fn fake_coordinate(entity: &Entity) -> Coordinate {
        let postal: f64 = entity.postal_code.parse().unwrap_or(0.0);
        Coordinate::new(55.0 + postal / 100_000.0, 10.0 + entity.address.len() as f64 / 100.0)
    }

    /// Routes by coordinate distance; can be told to fail
    #[derive(Default)]
    struct FakeRouter {
        route_calls: Vec<(Coordinate, Coordinate)>,
        table_calls: usize,
        fail_routes: bool,
        failing_batches: BTreeSet<usize>,
    }

    fn fake_metric(from: &Coordinate, to: &Coordinate) -> RouteMetric {
        let degrees = (from.lat - to.lat).abs() + (from.lon - to.lon).abs();
        RouteMetric::from_raw(degrees * 5000.0 + 60.0, degrees * 90_000.0 + 500.0)
    }

    impl RouteProvider for FakeRouter {
        async fn route(&mut self, from: &Coordinate, to: &Coordinate) -> Result<Option<RouteMetric>> {
            self.route_calls.push((from.clone(), to.clone()));
            if self.fail_routes {
                return Err(Error::NetworkError("connection refused".into()));
            }
            Ok(Some(fake_metric(from, to)))
        }

        async fn table(&mut self, coordinates: &[Coordinate], sources: Range<usize>) -> Result<TableRows> {
            self.table_calls += 1;
            if self.failing_batches.contains(&sources.start) {
                return Err(Error::HttpError("OSRM table returned 504".into()));
            }
            Ok(sources
                .map(|i| {
                    coordinates
                        .iter()
                        .map(|to| Some(fake_metric(&coordinates[i], to)))
                        .collect()
                })
                .collect())
        }

        fn table_attempts(&self) -> u32 {
            3
        }
    }

    fn club(name: &str, postal: &str) -> Entity {
        Entity::new(name, &format!("{name}vej 1"), postal, "Odense")
    }

    fn synchronizer(
        entities: &[Entity],
        options: SyncOptions,
    ) -> Synchronizer<FakeGeocoder, FakeRouter> {
        Synchronizer::new(
            FakeGeocoder::knowing(entities),
            FakeRouter::default(),
            GeocodePolicy::new(Overrides::default(), "Danmark"),
            options,
        )
    }

    async fn first_run(entities: &[Entity]) -> SyncState {
        let mut sync = synchronizer(entities, SyncOptions::default());
        sync.run(SyncState::default(), entities.to_vec(), RouteMode::Pairwise)
            .await
            .unwrap()
            .state
    }

    fn keys(matrix: &Matrix) -> Vec<String> {
        matrix.iter().map(|(key, _)| key.to_string()).collect()
    }

    #[tokio::test]
    async fn test_first_run_builds_full_matrix() {
        let entities = vec![club("A", "5000"), club("B", "5200"), club("C", "5300")];
        let mut sync = synchronizer(&entities, SyncOptions::default());
        let outcome = sync
            .run(SyncState::default(), entities.clone(), RouteMode::Pairwise)
            .await
            .unwrap();

        assert_eq!(outcome.state.matrix.len(), 9);
        assert_eq!(outcome.report.routes_computed, 6);
        assert_eq!(outcome.report.coverage.missing, 0);
        assert_eq!(sync.geocoder().calls.len(), 3);
        assert_eq!(sync.router().route_calls.len(), 6);
        assert_eq!(outcome.state.cache.len(), 3);
        assert_eq!(outcome.state.entities, entities);
    }

    #[tokio::test]
    async fn test_remove_one_add_one() {
        let a = club("A", "5000");
        let b = club("B", "5200");
        let c = club("C", "5300");
        let state = first_run(&[a.clone(), b.clone()]).await;
        let a_to_a = state.matrix.get("A", "A").cloned();

        let mut sync = synchronizer(&[a.clone(), c.clone()], SyncOptions::default());
        let outcome = sync
            .run(state, vec![a, c], RouteMode::Pairwise)
            .await
            .unwrap();

        assert_eq!(keys(&outcome.state.matrix), vec!["A|A", "A|C", "C|A", "C|C"]);
        assert_eq!(outcome.state.matrix.get("A", "A").cloned(), a_to_a);
        assert_eq!(sync.geocoder().calls, vec!["Cvej 1, 5300 Odense, Danmark"]);
        assert_eq!(sync.router().route_calls.len(), 2, "A→C and C→A; C→C needs no lookup");
        assert_eq!(outcome.report.entries_pruned, 3);
        assert_eq!(outcome.report.removed, 1);
    }

    #[tokio::test]
    async fn test_modified_entity_is_regeocoded_and_rerouted() {
        let entities = vec![club("A", "5000"), club("B", "5200"), club("C", "5300")];
        let mut state = first_run(&entities).await;

        // Mark an untouched pair so we can see it survives
        let sentinel = RouteMetric::from_raw(4242.0, 4242.0);
        state.matrix.insert(PairKey::new("B", "C"), sentinel.clone());

        let moved = club("A", "5700");
        let new = vec![moved.clone(), club("B", "5200"), club("C", "5300")];
        let mut sync = synchronizer(&new, SyncOptions::default());
        let outcome = sync.run(state, new, RouteMode::Pairwise).await.unwrap();

        assert_eq!(outcome.report.modified, 1);
        assert_eq!(sync.geocoder().calls, vec!["Avej 1, 5700 Odense, Danmark"]);
        assert_eq!(sync.router().route_calls.len(), 4);
        assert_eq!(outcome.state.matrix.get("B", "C"), Some(&sentinel));
        assert_eq!(outcome.state.cache.get("A"), Some(&fake_coordinate(&moved)));
    }

    #[tokio::test]
    async fn test_identical_rerun_makes_no_calls() {
        let entities = vec![club("A", "5000"), club("B", "5200")];
        let state = first_run(&entities).await;
        let before = state.matrix.clone();

        let mut sync = synchronizer(&entities, SyncOptions::default());
        let outcome = sync.run(state, entities, RouteMode::Pairwise).await.unwrap();

        assert!(sync.geocoder().calls.is_empty());
        assert!(sync.router().route_calls.is_empty());
        assert_eq!(outcome.state.matrix, before);
        assert_eq!(outcome.report.geocode.cached, 2);
    }

    #[tokio::test]
    async fn test_rerun_is_byte_identical() {
        let entities = vec![club("A", "5000"), club("B", "5200"), club("C", "5300")];
        let dir = tempdir().unwrap();

        let mut files = Vec::new();
        for run in ["one", "two"] {
            let paths = PathsConfig::default().relative_to(&dir.path().join(run));
            first_run(&entities).await.save(&paths).unwrap();
            files.push(std::fs::read(&paths.matrix).unwrap());
        }
        assert_eq!(files[0], files[1]);
    }

    #[tokio::test]
    async fn test_unchanged_entity_without_cache_is_geocoded_and_routed() {
        let entities = vec![club("A", "5000"), club("B", "5200")];
        let mut state = first_run(&entities).await;
        state.cache.evict("B");
        state.matrix.prune(&BTreeSet::from(["B".to_string()]));

        let mut sync = synchronizer(&entities, SyncOptions::default());
        let outcome = sync.run(state, entities, RouteMode::Pairwise).await.unwrap();

        assert_eq!(sync.geocoder().calls.len(), 1);
        assert_eq!(sync.router().route_calls.len(), 2);
        assert_eq!(outcome.state.matrix.len(), 4);
    }

    #[tokio::test]
    async fn test_geocode_failure_excludes_entity() {
        let a = club("A", "5000");
        let b = club("B", "5200");
        let state = first_run(&[a.clone(), b.clone()]).await;

        // B moves somewhere the geocoder cannot find
        let lost = Entity::new("B", "Ukendt 99", "", "");
        let mut sync = synchronizer(&[a.clone()], SyncOptions::default());
        let outcome = sync.run(state, vec![a, lost], RouteMode::Pairwise).await.unwrap();

        assert_eq!(outcome.report.geocode_failures.len(), 1);
        assert_eq!(outcome.report.geocode_failures[0].name, "B");
        assert_eq!(keys(&outcome.state.matrix), vec!["A|A"]);
        assert!(outcome.state.cache.get("B").is_none());
        assert_eq!(outcome.report.coverage.expected, 1);
        assert!(sync.router().route_calls.is_empty());
    }

    #[tokio::test]
    async fn test_route_failure_is_reported_not_fatal() {
        let entities = vec![club("A", "5000"), club("B", "5200")];
        let mut sync = Synchronizer::new(
            FakeGeocoder::knowing(&entities),
            FakeRouter {
                fail_routes: true,
                ..Default::default()
            },
            GeocodePolicy::new(Overrides::default(), "Danmark"),
            SyncOptions::default(),
        );
        let outcome = sync
            .run(SyncState::default(), entities, RouteMode::Pairwise)
            .await
            .unwrap();

        assert_eq!(outcome.report.route_failures.len(), 2);
        assert_eq!(keys(&outcome.state.matrix), vec!["A|A", "B|B"]);
        assert_eq!(outcome.report.coverage.missing, 2);
        assert!(outcome.report.coverage.is_degraded());
    }

    #[tokio::test]
    async fn test_repair_missing_recomputes_absent_pairs() {
        let entities = vec![club("A", "5000"), club("B", "5200"), club("C", "5300")];
        let mut state = first_run(&entities).await;
        state.matrix.remove(&PairKey::new("A", "B"));

        let options = SyncOptions {
            repair_missing: true,
            ..Default::default()
        };
        let mut sync = synchronizer(&entities, options);
        let outcome = sync.run(state, entities, RouteMode::Pairwise).await.unwrap();

        assert_eq!(sync.router().route_calls.len(), 1);
        assert!(outcome.state.matrix.get("A", "B").is_some());
        assert_eq!(outcome.report.coverage.missing, 0);
    }

    #[tokio::test]
    async fn test_table_rebuild() {
        let entities: Vec<Entity> = (0..5).map(|i| club(&format!("K{i}"), &format!("5{i}00"))).collect();
        let progress_calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&progress_calls);
        let options = SyncOptions {
            batch_size: 2,
            progress: Some(Arc::new(move |_: u64, _: u64| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };

        let mut sync = synchronizer(&entities, options);
        let outcome = sync
            .run(SyncState::default(), entities, RouteMode::Table)
            .await
            .unwrap();

        assert_eq!(sync.router().table_calls, 3);
        assert!(sync.router().route_calls.is_empty());
        assert_eq!(outcome.state.matrix.len(), 25);
        assert_eq!(outcome.report.routes_computed, 20);
        assert_eq!(progress_calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.state.matrix.get("K1", "K1"), Some(&RouteMetric::zero()));
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_rows_absent() {
        let entities = vec![club("A", "5000"), club("B", "5200"), club("C", "5300")];
        let mut sync = Synchronizer::new(
            FakeGeocoder::knowing(&entities),
            FakeRouter {
                failing_batches: BTreeSet::from([1]),
                ..Default::default()
            },
            GeocodePolicy::new(Overrides::default(), "Danmark"),
            SyncOptions {
                batch_size: 1,
                ..Default::default()
            },
        );
        let outcome = sync
            .run(SyncState::default(), entities, RouteMode::Table)
            .await
            .unwrap();

        let report = &outcome.report;
        assert_eq!(report.batch_failures.len(), 1);
        assert_eq!(report.batch_failures[0].batch, 2);
        assert_eq!(report.batch_failures[0].sources, 1..2);
        assert_eq!(report.batch_failures[0].attempts, 3);
        assert!(outcome.state.matrix.get("B", "A").is_none());
        assert!(outcome.state.matrix.get("B", "C").is_none());
        assert!(outcome.state.matrix.get("A", "B").is_some());
        assert!(outcome.state.matrix.get("B", "B").is_some());
        assert_eq!(report.coverage.missing, 2);
    }

    #[tokio::test]
    async fn test_invalid_entities_fail_before_any_call() {
        let entities = vec![club("A", "5000"), club("A", "5200")];
        let mut sync = synchronizer(&entities, SyncOptions::default());
        let result = sync.run(SyncState::default(), entities, RouteMode::Pairwise).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(sync.geocoder().calls.is_empty());
    }

    #[test]
    fn test_plan_routes_counts_each_pair_once() {
        let live = ["A", "B", "C"];
        let route_set = BTreeSet::from(["A".to_string(), "B".to_string()]);
        let pairs = plan_routes(&live, &route_set, &Matrix::new(), false);

        // A and B touch every pair except C→C; A→B and B→A are shared
        assert_eq!(pairs.len(), 6);
        assert!(pairs.iter().all(|pair| !pair.is_self_pair()));
    }

    #[tokio::test]
    async fn test_dry_run_plan() {
        let entities = vec![club("A", "5000"), club("B", "5200")];
        let state = first_run(&entities).await;
        let new = vec![club("A", "5000"), club("C", "5300")];

        let pairwise = plan(&state, &new, &Overrides::default(), RouteMode::Pairwise, &SyncOptions::default());
        assert_eq!(pairwise.to_geocode, vec!["C".to_string()]);
        assert_eq!(pairwise.route_calls, 2);
        assert_eq!(pairwise.diff.removed, BTreeSet::from(["B".to_string()]));

        let table = plan(&state, &new, &Overrides::default(), RouteMode::Table, &SyncOptions::default());
        assert_eq!(table.route_calls, 1);
    }

    #[tokio::test]
    async fn test_save_replaces_entity_list_last() {
        let entities = vec![club("A", "5000"), club("B", "5200")];
        let dir = tempdir().unwrap();
        let paths = PathsConfig::default().relative_to(dir.path());

        // A directory in place of the entity list makes its rename fail
        std::fs::create_dir_all(&paths.entities).unwrap();

        let state = first_run(&entities).await;
        assert!(state.save(&paths).is_err());

        assert_eq!(Matrix::load(&paths.matrix).unwrap(), state.matrix);
        assert!(paths.geocode_cache.is_file());
        assert!(paths.entities.is_dir(), "The previous entity list must stay in place");
    }

    #[test]
    fn test_located_counts_overrides_and_cache() {
        let mut state = SyncState {
            entities: vec![club("A", "5000"), club("B", "5200"), club("C", "5300")],
            ..Default::default()
        };
        state.cache.insert("A", Coordinate::new(55.0, 10.0));
        let mut overrides = Overrides::default();
        overrides.insert("C", Coordinate::new(55.1, 10.1));

        assert_eq!(state.located(&overrides).collect::<Vec<_>>(), vec!["A", "C"]);
    }
}
