//! Cell-resolver source: the full scan → schedule → resolve → fuse → gate
//! pipeline behind the uniform source interface.
//!
//! This is the fallback that keeps producing positions when no GNSS and no
//! operator triangulation is reachable, so it leans hard on the cache and
//! lets the scheduler decide when remote lookups are actually warranted.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use crate::cache::CellCache;
use crate::cell::CellularDataCollector;
use crate::cell::parser::metrics_from_serving;
use crate::data::{CellEnvironment, CellId, GeoFix, TowerSource};
use crate::errors::{LocationError, Result};
use crate::fuser::{GateDecision, LocationFuser};
use crate::resolver::CellResolver;
use crate::scheduler::{QueryReason, QueryScheduler};
use crate::sources::{CollectContext, HealthMeter, LocationSource};

pub struct CellResolverSource {
    priority: u32,
    collector: Arc<dyn CellularDataCollector>,
    resolver: Arc<CellResolver>,
    fuser: Arc<LocationFuser>,
    scheduler: Arc<QueryScheduler>,
    cache: Arc<CellCache>,
    meter: HealthMeter,
}

impl CellResolverSource {
    pub fn new(
        priority: u32,
        collector: Arc<dyn CellularDataCollector>,
        resolver: Arc<CellResolver>,
        fuser: Arc<LocationFuser>,
        scheduler: Arc<QueryScheduler>,
        cache: Arc<CellCache>,
    ) -> Self {
        Self {
            priority,
            collector,
            resolver,
            fuser,
            scheduler,
            cache,
            meter: HealthMeter::default(),
        }
    }

    /// Every cell with a full identifier in this scan, serving cell first.
    fn observed_ids(env: &CellEnvironment) -> Vec<CellId> {
        let mut ids = vec![env.serving.id];
        for neighbor in &env.neighbors {
            if let Some(id) = neighbor.id {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }
}

#[async_trait]
impl LocationSource for CellResolverSource {
    fn name(&self) -> &str {
        "cell_resolver"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn available(&self, _ctx: &CollectContext) -> bool {
        // The modem is assumed present when this source is configured; a
        // dead modem surfaces as a collect failure, not an availability flap.
        true
    }

    async fn collect(&self, _ctx: &CollectContext) -> Result<GeoFix> {
        let started = Instant::now();
        let now = Utc::now();

        let env = self.collector.scan().await?;
        let ids = Self::observed_ids(&env);
        for id in &ids {
            // Observed, not necessarily useful; keeps entries safe from
            // eviction while the cell remains in the environment.
            self.cache.touch_seen(id, now).await?;
        }

        let (go, reason) = self.scheduler.should_query(&env);
        debug!(go, reason = reason.as_str(), cells = ids.len(), "scheduler verdict");

        let towers = if go {
            match self.resolver.resolve(&ids).await {
                Ok(towers) => {
                    if towers.iter().any(|t| matches!(t.source, TowerSource::Remote)) {
                        self.scheduler.record_resolution(now);
                    }
                    towers
                }
                Err(LocationError::RateLimitExceeded(msg)) => {
                    info!(reason = %msg, "rate limited, falling back to cache");
                    self.scheduler.record_fallback_to_cache();
                    self.resolver.resolve_cached(&ids).await?
                }
                Err(e) => return Err(e),
            }
        } else {
            if reason == QueryReason::DebounceActive {
                debug!("debounce active, serving cached resolution");
            }
            self.resolver.resolve_cached(&ids).await?
        };

        let metrics = metrics_from_serving(&env.serving);
        let Some(mut fix) = self.fuser.fuse(&towers, Some(&env.serving), Some(&metrics))
        else {
            return Err(LocationError::NoFix);
        };
        fix.collection_ms = started.elapsed().as_millis() as u64;

        for tower in &towers {
            self.cache.touch_used(&tower.id, now).await?;
        }

        let decision = self.fuser.gate(fix);
        self.scheduler.record_gate(&decision);
        match decision {
            GateDecision::Accepted { fix, stable, .. } => {
                debug!(stable, "cell fix accepted");
                Ok(fix)
            }
            GateDecision::Rejected(reason) => {
                debug!(reason = reason.as_str(), "cell fix rejected by quality gate");
                // Not an error: hold the previous accepted position.
                match self.fuser.last_accepted() {
                    Some(mut previous) => {
                        previous.from_cache = true;
                        Ok(previous)
                    }
                    None => Err(LocationError::NoFix),
                }
            }
        }
    }

    fn meter(&self) -> &HealthMeter {
        &self.meter
    }
}
