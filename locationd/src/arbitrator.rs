//! Source arbitration: ranked, confidence-based selection across the
//! registered position sources, with per-source health tracking and
//! periodic availability re-evaluation.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::Utc;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ArbitratorConfig, SelectionMode};
use crate::data::{GeoFix, MovementState};
use crate::errors::{LocationError, Result};
use crate::geo::haversine_m;
use crate::sources::{CollectContext, LocationSource, SourceHealth};

pub struct Arbitrator {
    cfg: ArbitratorConfig,
    /// Every configured source, priority order. Availability changes move
    /// sources in and out of `active`, never out of the registry.
    registry: Vec<Arc<dyn LocationSource>>,
    active: RwLock<Vec<Arc<dyn LocationSource>>>,
    last_fix: StdMutex<Option<GeoFix>>,
    movement_tx: watch::Sender<MovementState>,
    cancel: CancellationToken,
}

impl Arbitrator {
    /// Probe availability across the configured sources and build the
    /// active list. An empty active list is not fatal here; `collect_best`
    /// reports it per cycle and re-evaluation may recover sources later.
    pub async fn new(
        cfg: ArbitratorConfig,
        mut registry: Vec<Arc<dyn LocationSource>>,
        cancel: CancellationToken,
    ) -> Self {
        registry.sort_by_key(|s| s.priority());
        let (movement_tx, _) = watch::channel(MovementState::Unknown);
        let arbitrator = Self {
            cfg,
            registry,
            active: RwLock::new(Vec::new()),
            last_fix: StdMutex::new(None),
            movement_tx,
            cancel,
        };
        arbitrator.reevaluate().await;
        arbitrator
    }

    /// Re-run availability probes across all configured sources. Sources
    /// that became available enter at their configured priority slot;
    /// sources that vanished are removed.
    pub async fn reevaluate(&self) {
        let ctx = self.probe_context();
        let mut active = Vec::new();
        for source in &self.registry {
            let available = source.available(&ctx).await;
            source.meter().set_available(available);
            if available {
                active.push(source.clone());
            } else {
                debug!(source = source.name(), "source unavailable, skipping");
            }
        }
        info!(
            active = active.len(),
            configured = self.registry.len(),
            "source availability re-evaluated"
        );
        *self.active.write().await = active;
    }

    /// Subscribe to movement state transitions.
    pub fn movement_watch(&self) -> watch::Receiver<MovementState> {
        self.movement_tx.subscribe()
    }

    pub fn last_fix(&self) -> Option<GeoFix> {
        self.last_fix.lock().expect("last fix poisoned").clone()
    }

    /// Health snapshots for every configured source.
    pub fn health_report(&self) -> Vec<(String, SourceHealth)> {
        self.registry
            .iter()
            .map(|s| (s.name().to_string(), s.health()))
            .collect()
    }

    /// Produce the best currently available fix.
    pub async fn collect_best(&self) -> Result<GeoFix> {
        let sources = self.active.read().await.clone();
        if sources.is_empty() {
            return Err(LocationError::NoSourcesAvailable);
        }

        match self.cfg.selection_mode {
            SelectionMode::Traditional => self.collect_traditional(&sources).await,
            SelectionMode::Hybrid => self.collect_hybrid(&sources).await,
        }
    }

    async fn collect_traditional(
        &self,
        sources: &[Arc<dyn LocationSource>],
    ) -> Result<GeoFix> {
        let mut failures = Vec::new();
        for source in sources {
            match self.collect_one(source).await {
                Ok(fix) => return Ok(self.accept(fix)),
                Err(e) => failures.push(format!("{}: {e}", source.name())),
            }
        }
        Err(LocationError::AllSourcesFailed(failures.join("; ")))
    }

    async fn collect_hybrid(
        &self,
        sources: &[Arc<dyn LocationSource>],
    ) -> Result<GeoFix> {
        let mut retained: Vec<GeoFix> = Vec::new();
        let mut failures = Vec::new();

        for source in sources {
            match self.collect_one(source).await {
                Ok(fix) => {
                    if fix.confidence >= self.cfg.fallback_threshold {
                        debug!(
                            source = source.name(),
                            confidence = fix.confidence,
                            "accepting high-confidence fix"
                        );
                        return Ok(self.accept(fix));
                    }
                    debug!(
                        source = source.name(),
                        confidence = fix.confidence,
                        "retaining low-confidence fix"
                    );
                    retained.push(fix);
                }
                Err(e) => failures.push(format!("{}: {e}", source.name())),
            }
        }

        let best = retained
            .into_iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        match best {
            Some(fix) if fix.confidence >= self.cfg.min_acceptable_confidence => {
                Ok(self.accept(fix))
            }
            Some(fix) => {
                warn!(
                    confidence = fix.confidence,
                    minimum = self.cfg.min_acceptable_confidence,
                    "accepting fix below minimum confidence"
                );
                Ok(self.accept(fix))
            }
            None => Err(LocationError::AllSourcesFailed(failures.join("; "))),
        }
    }

    /// One source, with its timeout and retry budget. Collects are
    /// serialized per source; validation failures count as attempts.
    async fn collect_one(&self, source: &Arc<dyn LocationSource>) -> Result<GeoFix> {
        let ctx = self.probe_context();
        let mut last_error = LocationError::NoFix;

        for attempt in 0..self.cfg.collect_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.cfg.retry_delay).await;
            }
            if self.cancel.is_cancelled() {
                return Err(LocationError::Timeout(0));
            }

            let started = std::time::Instant::now();
            let outcome = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    Err(LocationError::Timeout(ctx.timeout.as_secs()))
                }
                collected = tokio::time::timeout(ctx.timeout, source.collect(&ctx)) => {
                    match collected {
                        Ok(result) => result,
                        Err(_) => Err(LocationError::Timeout(ctx.timeout.as_secs())),
                    }
                }
            };

            match outcome.and_then(|fix| self.validate(fix)) {
                Ok(fix) => {
                    source.meter().record_success(started.elapsed());
                    return Ok(fix);
                }
                Err(e) => {
                    debug!(source = source.name(), attempt, error = %e, "collect failed");
                    source.meter().record_failure(e.to_string());
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn validate(&self, fix: GeoFix) -> Result<GeoFix> {
        if !(-90.0..=90.0).contains(&fix.lat) || !(-180.0..=180.0).contains(&fix.lon) {
            return Err(LocationError::Validation(format!(
                "coordinates out of range: ({}, {})",
                fix.lat, fix.lon
            )));
        }
        if fix.accuracy_m > self.cfg.max_accuracy_m {
            return Err(LocationError::Validation(format!(
                "accuracy {}m above ceiling {}m",
                fix.accuracy_m, self.cfg.max_accuracy_m
            )));
        }
        let age = Utc::now() - fix.timestamp;
        let max_age = chrono::Duration::from_std(self.cfg.max_fix_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if age > max_age {
            return Err(LocationError::Validation(format!(
                "fix is {}s old",
                age.num_seconds()
            )));
        }
        Ok(fix)
    }

    /// Record the accepted fix and publish movement transitions.
    fn accept(&self, fix: GeoFix) -> GeoFix {
        let mut last = self.last_fix.lock().expect("last fix poisoned");
        if let Some(previous) = &*last {
            let distance = haversine_m(previous.lat, previous.lon, fix.lat, fix.lon);
            let state = if distance > self.cfg.movement_threshold_m {
                MovementState::Moving
            } else {
                MovementState::Stationary
            };
            if *self.movement_tx.borrow() != state {
                info!(distance_m = distance, state = ?state, "movement state transition");
            }
            self.movement_tx.send_replace(state);
        }
        *last = Some(fix.clone());
        fix
    }

    fn probe_context(&self) -> CollectContext {
        CollectContext {
            timeout: self.cfg.collect_timeout,
            cancel: self.cancel.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::HealthMeter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    struct TestSource {
        name: &'static str,
        priority: u32,
        available: AtomicBool,
        confidence: f64,
        fail_first: u32,
        delay: Duration,
        position: StdMutex<(f64, f64)>,
        calls: AtomicU32,
        meter: HealthMeter,
    }

    impl TestSource {
        fn new(name: &'static str, priority: u32, confidence: f64) -> Self {
            Self {
                name,
                priority,
                available: AtomicBool::new(true),
                confidence,
                fail_first: 0,
                delay: Duration::ZERO,
                position: StdMutex::new((59.33, 18.06)),
                calls: AtomicU32::new(0),
                meter: HealthMeter::default(),
            }
        }

        fn failing(name: &'static str, priority: u32) -> Self {
            let mut source = Self::new(name, priority, 0.9);
            source.fail_first = u32::MAX;
            source
        }

        fn move_to(&self, lat: f64, lon: f64) {
            *self.position.lock().unwrap() = (lat, lon);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LocationSource for TestSource {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        async fn available(&self, _ctx: &CollectContext) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn collect(&self, _ctx: &CollectContext) -> Result<GeoFix> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call <= self.fail_first {
                return Err(LocationError::GnssRead("simulated failure".into()));
            }
            let (lat, lon) = *self.position.lock().unwrap();
            let mut fix = GeoFix::basic(lat, lon, 30.0, self.name);
            fix.confidence = self.confidence;
            Ok(fix)
        }

        fn meter(&self) -> &HealthMeter {
            &self.meter
        }
    }

    fn config() -> ArbitratorConfig {
        ArbitratorConfig {
            priority: vec![],
            selection_mode: SelectionMode::Hybrid,
            fallback_threshold: 0.7,
            min_acceptable_confidence: 0.5,
            collect_timeout: Duration::from_secs(1),
            collect_retries: 1,
            retry_delay: Duration::from_millis(1),
            max_accuracy_m: 10_000.0,
            max_fix_age: Duration::from_secs(60),
            movement_threshold_m: 100.0,
            reevaluate_interval: Duration::from_secs(60),
        }
    }

    async fn arbitrator(
        cfg: ArbitratorConfig,
        sources: Vec<Arc<TestSource>>,
    ) -> Arbitrator {
        let registry: Vec<Arc<dyn LocationSource>> = sources
            .into_iter()
            .map(|s| s as Arc<dyn LocationSource>)
            .collect();
        Arbitrator::new(cfg, registry, CancellationToken::new()).await
    }

    #[tokio::test]
    async fn high_confidence_first_source_short_circuits() {
        let first = Arc::new(TestSource::new("gnss", 1, 0.9));
        let second = Arc::new(TestSource::new("satellite", 2, 0.95));
        let arb = arbitrator(config(), vec![first.clone(), second.clone()]).await;

        let fix = arb.collect_best().await.unwrap();
        assert_eq!(fix.source, "gnss");
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn priority_order_beats_registration_order() {
        let low_pri = Arc::new(TestSource::new("satellite", 5, 0.9));
        let high_pri = Arc::new(TestSource::new("gnss", 1, 0.9));
        let arb = arbitrator(config(), vec![low_pri, high_pri]).await;

        let fix = arb.collect_best().await.unwrap();
        assert_eq!(fix.source, "gnss");
    }

    #[tokio::test]
    async fn low_confidence_results_fall_back_to_best_retained() {
        let first = Arc::new(TestSource::new("gnss", 1, 0.55));
        let second = Arc::new(TestSource::new("satellite", 2, 0.65));
        let arb = arbitrator(config(), vec![first.clone(), second.clone()]).await;

        let fix = arb.collect_best().await.unwrap();
        assert_eq!(fix.source, "satellite");
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn below_minimum_confidence_still_returns_best() {
        let first = Arc::new(TestSource::new("gnss", 1, 0.3));
        let second = Arc::new(TestSource::new("satellite", 2, 0.4));
        let arb = arbitrator(config(), vec![first, second]).await;

        let fix = arb.collect_best().await.unwrap();
        assert_eq!(fix.source, "satellite");
        assert_eq!(fix.confidence, 0.4);
    }

    #[tokio::test]
    async fn traditional_mode_takes_first_success() {
        let mut cfg = config();
        cfg.selection_mode = SelectionMode::Traditional;
        let first = Arc::new(TestSource::new("gnss", 1, 0.2));
        let second = Arc::new(TestSource::new("satellite", 2, 0.95));
        let arb = arbitrator(cfg, vec![first, second.clone()]).await;

        let fix = arb.collect_best().await.unwrap();
        assert_eq!(fix.source, "gnss");
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn all_failing_sources_aggregate_into_one_error() {
        let mut cfg = config();
        cfg.collect_retries = 2;
        let first = Arc::new(TestSource::failing("gnss", 1));
        let second = Arc::new(TestSource::failing("satellite", 2));
        let arb = arbitrator(cfg, vec![first.clone(), second.clone()]).await;

        match arb.collect_best().await.unwrap_err() {
            LocationError::AllSourcesFailed(detail) => {
                assert!(detail.contains("gnss"));
                assert!(detail.contains("satellite"));
            }
            other => panic!("expected AllSourcesFailed, got {other}"),
        }
        // Retry budget spent on each source.
        assert_eq!(first.calls(), 2);
        assert_eq!(second.calls(), 2);
        assert_eq!(first.health().error_count, 2);
    }

    #[tokio::test]
    async fn retry_budget_recovers_flaky_source() {
        let mut cfg = config();
        cfg.collect_retries = 3;
        let mut flaky = TestSource::new("gnss", 1, 0.9);
        flaky.fail_first = 2;
        let flaky = Arc::new(flaky);
        let arb = arbitrator(cfg, vec![flaky.clone()]).await;

        let fix = arb.collect_best().await.unwrap();
        assert_eq!(fix.source, "gnss");
        assert_eq!(flaky.calls(), 3);
        let health = flaky.health();
        assert_eq!(health.error_count, 2);
        assert_eq!(health.success_count, 1);
    }

    #[tokio::test]
    async fn no_available_sources_is_a_typed_failure() {
        let source = Arc::new(TestSource::new("gnss", 1, 0.9));
        source.available.store(false, Ordering::SeqCst);
        let arb = arbitrator(config(), vec![source]).await;

        assert!(matches!(
            arb.collect_best().await,
            Err(LocationError::NoSourcesAvailable)
        ));
    }

    #[tokio::test]
    async fn reevaluation_restores_recovered_sources() {
        let source = Arc::new(TestSource::new("gnss", 1, 0.9));
        source.available.store(false, Ordering::SeqCst);
        let arb = arbitrator(config(), vec![source.clone()]).await;
        assert!(arb.collect_best().await.is_err());

        source.available.store(true, Ordering::SeqCst);
        arb.reevaluate().await;
        assert!(arb.collect_best().await.is_ok());
    }

    #[tokio::test]
    async fn out_of_range_coordinates_fail_validation() {
        let source = Arc::new(TestSource::new("gnss", 1, 0.9));
        source.move_to(95.0, 18.0);
        let arb = arbitrator(config(), vec![source]).await;

        match arb.collect_best().await.unwrap_err() {
            LocationError::AllSourcesFailed(detail) => {
                assert!(detail.contains("validation"), "got: {detail}")
            }
            other => panic!("expected AllSourcesFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let mut cfg = config();
        cfg.collect_timeout = Duration::from_millis(20);
        let mut slow = TestSource::new("gnss", 1, 0.9);
        slow.delay = Duration::from_millis(200);
        let arb = arbitrator(cfg, vec![Arc::new(slow)]).await;

        match arb.collect_best().await.unwrap_err() {
            LocationError::AllSourcesFailed(detail) => {
                assert!(detail.contains("timed out"), "got: {detail}")
            }
            other => panic!("expected AllSourcesFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn movement_transitions_are_published() {
        let source = Arc::new(TestSource::new("gnss", 1, 0.9));
        let arb = arbitrator(config(), vec![source.clone()]).await;
        let watch = arb.movement_watch();

        let _ = arb.collect_best().await.unwrap();
        assert_eq!(*watch.borrow(), MovementState::Unknown);

        // 300 m north of the first fix: moving.
        source.move_to(59.33 + 300.0 / 111_320.0, 18.06);
        let _ = arb.collect_best().await.unwrap();
        assert_eq!(*watch.borrow(), MovementState::Moving);

        // Holding position: stationary.
        let _ = arb.collect_best().await.unwrap();
        assert_eq!(*watch.borrow(), MovementState::Stationary);
    }
}
