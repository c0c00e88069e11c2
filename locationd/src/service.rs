//! Long-running service loops: collection, cache maintenance, limiter
//! resets, and contribution submission, all driven off one select loop and
//! one cancellation token.

use std::sync::Arc;

use chrono::Utc;
use ridge_geolocation_api::{ContributionClient, ElevationClient};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::arbitrator::Arbitrator;
use crate::cache::CellCache;
use crate::cell::CellularDataCollector;
use crate::config::Config;
use crate::contribution::ContributionQueue;
use crate::data::{ContributionObservation, GeoFix, GpsObservation, MovementState};
use crate::fuser::LocationFuser;
use crate::ratelimit::RateLimiter;
use crate::resolver::CellResolver;
use crate::scheduler::QueryScheduler;

/// Interval between contribution submission attempts.
const CONTRIBUTE_INTERVAL_SECS: u64 = 60;

/// Everything the service loops need, wired up by the binary.
pub struct Core {
    pub config: Config,
    pub cache: Arc<CellCache>,
    pub limiter: Arc<RateLimiter>,
    pub resolver: Arc<CellResolver>,
    pub fuser: Arc<LocationFuser>,
    pub scheduler: Arc<QueryScheduler>,
    pub arbitrator: Arc<Arbitrator>,
    pub collector: Option<Arc<dyn CellularDataCollector>>,
    pub contributions: Option<Arc<ContributionQueue>>,
    pub contribution_client: Option<Arc<ContributionClient>>,
    pub elevation_client: Option<Arc<ElevationClient>>,
}

impl Core {
    /// One collection cycle: arbitrate, propagate movement, feed the
    /// contribution queue.
    pub async fn collect_cycle(&self) -> Option<GeoFix> {
        let mut fix = match self.arbitrator.collect_best().await {
            Ok(fix) => fix,
            Err(e) => {
                warn!(error = %e, "collection cycle produced no fix");
                return None;
            }
        };

        let movement = *self.arbitrator.movement_watch().borrow();
        self.scheduler.set_movement(movement, Utc::now());

        if fix.altitude_m.is_none() {
            if let Some(elevation) = &self.elevation_client {
                match elevation.elevation(fix.lat, fix.lon).await {
                    Ok(altitude) => fix.altitude_m = Some(altitude),
                    Err(e) => debug!(error = %e, "elevation lookup failed"),
                }
            }
        }

        info!(
            lat = fix.lat,
            lon = fix.lon,
            accuracy_m = fix.accuracy_m,
            source = %fix.source,
            method = %fix.method,
            confidence = fix.confidence,
            from_cache = fix.from_cache,
            "fix collected"
        );

        self.maybe_queue_contribution(&fix, movement).await;
        Some(fix)
    }

    /// GNSS-grade fixes travel back to the provider; everything else stays
    /// on the device.
    async fn maybe_queue_contribution(&self, fix: &GeoFix, movement: MovementState) {
        let (Some(queue), Some(collector)) = (&self.contributions, &self.collector) else {
            return;
        };
        let is_gnss = fix.satellites.is_some() && !fix.api_call_made;
        if !is_gnss {
            return;
        }
        let env = match collector.scan().await {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "no cellular environment for contribution");
                return;
            }
        };
        let metrics = crate::cell::parser::metrics_from_serving(&env.serving);
        let observation = ContributionObservation {
            serving: env.serving,
            neighbors: env.neighbors,
            gps: GpsObservation {
                lat: fix.lat,
                lon: fix.lon,
                accuracy_m: fix.accuracy_m,
                speed_kmh: fix.speed_kmh,
                heading_deg: fix.course_deg,
                timestamp: fix.timestamp,
            },
            metrics: Some(metrics),
        };
        let outcome = queue.offer(observation, true, movement).await;
        debug!(outcome = ?outcome, "contribution offered");
    }

    async fn contribute_tick(&self) {
        let (Some(queue), Some(client)) = (&self.contributions, &self.contribution_client)
        else {
            return;
        };
        let movement = *self.arbitrator.movement_watch().borrow();

        // The trickle rule keeps the lookup ratio healthy while moving with
        // good GPS; the submission itself rides the normal queue path.
        let moving_with_good_gps = movement == MovementState::Moving
            && self
                .arbitrator
                .last_fix()
                .is_some_and(|fix| {
                    fix.satellites.is_some()
                        && fix.accuracy_m <= self.config.contribution.min_gps_accuracy_m
                });
        if self.limiter.should_trickle(moving_with_good_gps).await {
            debug!("trickle submission recommended");
        }

        let sent = queue.submit_pending(client, &self.limiter, movement).await;
        if sent > 0 {
            info!(sent, "contributions submitted");
        }
    }

    async fn shutdown(&self) {
        info!("flushing state before exit");
        // Give any straggling I/O a moment before the store closes.
        time::sleep(self.config.service.shutdown_grace.min(std::time::Duration::from_secs(5)))
            .await;
        self.limiter.flush().await;
        self.cache.close().await;

        let scheduler = self.scheduler.stats();
        let fuser = self.fuser.stats();
        info!(
            total_queries = scheduler.total_queries,
            cache_hits = scheduler.cache_hits,
            accepted = fuser.accepted,
            rejected = fuser.rejected,
            "final statistics"
        );
    }
}

/// Main service loop. Returns after the cancellation token fires and state
/// is flushed.
pub async fn run(core: Arc<Core>, cancel: CancellationToken) {
    let cfg = &core.config.service;
    let mut scan = time::interval(cfg.scan_interval);
    let mut maintenance = time::interval(core.config.service.maintenance_interval);
    let mut stats_checkpoint = time::interval(core.config.cache.stats_checkpoint);
    let mut hourly_reset = time::interval(std::time::Duration::from_secs(3600));
    let mut reevaluate = time::interval(core.config.arbitrator.reevaluate_interval);
    let mut contribute =
        time::interval(std::time::Duration::from_secs(CONTRIBUTE_INTERVAL_SECS));

    // The first tick of every interval fires immediately; skip the noisy
    // ones so startup is one scan and nothing else.
    maintenance.reset();
    stats_checkpoint.reset();
    hourly_reset.reset();
    contribute.reset();

    info!(
        scan_interval_s = cfg.scan_interval.as_secs(),
        maintenance_interval_s = core.config.service.maintenance_interval.as_secs(),
        "service loops running"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown signal received, stopping service loops");
                break;
            }
            _ = scan.tick() => {
                let _ = core.collect_cycle().await;
            }
            _ = maintenance.tick() => {
                let last_fix = core.arbitrator.last_fix().map(|f| (f.lat, f.lon));
                if let Err(e) = core.cache.run_maintenance(Utc::now(), last_fix).await {
                    error!(error = %e, "cache maintenance failed");
                }
            }
            _ = stats_checkpoint.tick() => {
                core.cache.checkpoint_stats().await;
            }
            _ = hourly_reset.tick() => {
                core.limiter.reset_hourly(Utc::now()).await;
            }
            _ = reevaluate.tick() => {
                core.arbitrator.reevaluate().await;
            }
            _ = contribute.tick() => {
                core.contribute_tick().await;
            }
        }
    }

    core.shutdown().await;
}
