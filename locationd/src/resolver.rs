//! Cell resolver: cache first, negative cache second, remote lookup last,
//! and only with a token from the policy rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use ridge_geolocation_api::cell_lookup::{CellLookupClient, CellLookupQuery};
use ridge_geolocation_api::ApiError;
use tracing::{debug, info, warn};

use crate::cache::{CacheLookup, CellCache};
use crate::config::ResolverConfig;
use crate::data::{CachedEntry, CellId, TowerLocation, TowerSource};
use crate::errors::{LocationError, Result};
use crate::ratelimit::RateLimiter;

/// Confidence assigned to a fresh remote resolution. More observations and a
/// narrower claimed range both raise it; the clamps keep single-sample
/// entries from being believed too much and saturated entries from being
/// believed absolutely.
pub fn confidence_score(samples: u32, range_m: f64) -> f64 {
    let samples_part = 0.6 * (samples as f64 / 100.0).min(1.0);
    let range_part = 0.4 * (1.0 - range_m / 10_000.0).max(0.0);
    (samples_part + range_part).clamp(0.1, 0.95)
}

#[derive(Debug, Default)]
pub struct ResolverStats {
    pub cache_hits: AtomicU64,
    pub negative_hits: AtomicU64,
    pub remote_hits: AtomicU64,
    pub remote_errors: AtomicU64,
    pub rate_limited: AtomicU64,
}

/// Loud provider-error reports are throttled to once per hour; everything
/// in between stays at debug.
const PROVIDER_WARN_INTERVAL: Duration = Duration::from_secs(3600);

pub struct CellResolver {
    cache: Arc<CellCache>,
    limiter: Arc<RateLimiter>,
    client: Option<Arc<CellLookupClient>>,
    cfg: ResolverConfig,
    pub stats: ResolverStats,
    last_provider_warn: Mutex<Option<Instant>>,
}

impl CellResolver {
    pub fn new(
        cache: Arc<CellCache>,
        limiter: Arc<RateLimiter>,
        client: Option<Arc<CellLookupClient>>,
        cfg: ResolverConfig,
    ) -> Self {
        Self {
            cache,
            limiter,
            client,
            cfg,
            stats: ResolverStats::default(),
            last_provider_warn: Mutex::new(None),
        }
    }

    /// Resolve up to `max_cells_per_lookup` identifiers. The result may be
    /// smaller than the request: negative-cached cells are silently dropped
    /// and rate-limited cells stay unresolved until a later cycle.
    pub async fn resolve(&self, ids: &[CellId]) -> Result<Vec<TowerLocation>> {
        let ids = &ids[..ids.len().min(self.cfg.max_cells_per_lookup)];
        let mut resolved = Vec::with_capacity(ids.len());
        let mut to_resolve = Vec::new();

        for id in ids {
            match self.cache.get(id).await? {
                CacheLookup::Positive(entry) => {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    if let Some(tower) = entry.to_tower() {
                        resolved.push(tower);
                    }
                }
                CacheLookup::Negative => {
                    self.stats.negative_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(cell = %id, "skipping negative-cached cell");
                }
                CacheLookup::Miss => to_resolve.push(*id),
            }
        }

        if to_resolve.is_empty() {
            return Ok(resolved);
        }
        let Some(client) = &self.client else {
            debug!(unresolved = to_resolve.len(), "no lookup endpoint configured");
            return Ok(resolved);
        };

        let mut last_error: Option<LocationError> = None;
        let mut any_remote_success = false;
        for id in to_resolve {
            // Tokens are granted per identifier, not per batch.
            if !self.limiter.try_lookup().await {
                self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                info!(cell = %id, "lookup denied by rate limiter, serving cache only");
                break;
            }
            match self.lookup_with_backoff(client, &id).await {
                Ok(Some(tower)) => {
                    any_remote_success = true;
                    let entry = CachedEntry::positive(&tower, Utc::now());
                    self.cache.set(&entry).await?;
                    resolved.push(tower);
                }
                Ok(None) => {
                    // Confirmed unknown: remember that no answer existed.
                    self.write_negative(&id).await?;
                }
                Err(e) => {
                    self.stats.remote_errors.fetch_add(1, Ordering::Relaxed);
                    if matches!(e, LocationError::Api { .. }) {
                        self.notify_provider_error(&id, &e);
                    } else {
                        warn!(cell = %id, error = %e, "remote lookup failed");
                    }
                    self.write_negative(&id).await?;
                    last_error = Some(e);
                }
            }
        }

        if resolved.is_empty() && !any_remote_success {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(resolved)
    }

    /// Cache-only resolution, for cycles the scheduler decided do not
    /// warrant remote traffic.
    pub async fn resolve_cached(&self, ids: &[CellId]) -> Result<Vec<TowerLocation>> {
        let ids = &ids[..ids.len().min(self.cfg.max_cells_per_lookup)];
        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            if let CacheLookup::Positive(entry) = self.cache.get(id).await? {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                if let Some(tower) = entry.to_tower() {
                    resolved.push(tower);
                }
            }
        }
        Ok(resolved)
    }

    /// One remote query with exponential backoff on 429 responses.
    async fn lookup_with_backoff(
        &self,
        client: &CellLookupClient,
        id: &CellId,
    ) -> Result<Option<TowerLocation>> {
        let query = CellLookupQuery {
            mcc: id.mcc,
            mnc: id.mnc,
            lac: id.lac,
            cellid: id.cell,
            radio: id.radio.as_str().to_string(),
        };

        let mut delay = self.cfg.backoff_base;
        for attempt in 0..self.cfg.backoff_attempts {
            match client.lookup(&query).await {
                Ok(reply) => {
                    let range_m = reply.range.unwrap_or(1000.0);
                    let samples = reply.samples.unwrap_or(1);
                    // lat/lon presence was verified by the client.
                    let tower = TowerLocation {
                        id: *id,
                        lat: reply.lat.unwrap_or_default(),
                        lon: reply.lon.unwrap_or_default(),
                        range_m,
                        samples,
                        confidence: confidence_score(samples, range_m),
                        source: TowerSource::Remote,
                        changeable: reply.changeable,
                        updated_at: Utc::now(),
                    };
                    self.stats.remote_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(tower));
                }
                Err(ApiError::NotFound) => return Ok(None),
                Err(ApiError::RateLimited) if attempt + 1 < self.cfg.backoff_attempts => {
                    debug!(cell = %id, attempt, delay_ms = delay.as_millis() as u64,
                        "provider backoff on 429");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(ApiError::Provider { code, message }) => {
                    return Err(LocationError::Api { code, message });
                }
                Err(e) => return Err(LocationError::RemoteUnavailable(e.to_string())),
            }
        }
        Err(LocationError::RemoteUnavailable(format!(
            "provider kept answering 429 for {id}"
        )))
    }

    fn notify_provider_error(&self, id: &CellId, error: &LocationError) {
        let mut last = self.last_provider_warn.lock().expect("warn throttle poisoned");
        if last.is_none_or(|at| at.elapsed() >= PROVIDER_WARN_INTERVAL) {
            warn!(cell = %id, error = %error, "provider rejected lookup");
            *last = Some(Instant::now());
        } else {
            debug!(cell = %id, error = %error, "provider rejected lookup (throttled)");
        }
    }

    async fn write_negative(&self, id: &CellId) -> Result<()> {
        let now = Utc::now();
        let expiry = self.cache.negative_expiry(now);
        self.cache
            .set(&CachedEntry::negative(*id, now, expiry))
            .await
    }
}
