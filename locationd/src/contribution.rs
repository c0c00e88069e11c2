//! Bounded contribution queue: buffers GNSS-grade cell observations and
//! returns them to the provider in small, deduplicated, rate-limited
//! batches.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ridge_geolocation_api::{CellSubmission, ContributionClient};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ContributionConfig;
use crate::data::{ContributionObservation, MovementState};
use crate::ratelimit::RateLimiter;

/// Why an observation was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Queued,
    Duplicate,
    NotGnss,
    AccuracyTooLoose,
    NoSignificantChange,
    StationaryCellCap,
    StationaryGlobalCap,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct DedupKey {
    cell: String,
    grid_x: i64,
    grid_y: i64,
    hour: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedContribution {
    observation: ContributionObservation,
    key: DedupKey,
    queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContributionStats {
    pub offered: u64,
    pub queued: u64,
    pub duplicates: u64,
    pub ineligible: u64,
    pub overflow_dropped: u64,
    pub submitted: u64,
    pub batches: u64,
}

#[derive(Default, Serialize, Deserialize)]
struct QueueState {
    queue: VecDeque<QueuedContribution>,
    /// Tuples already queued or submitted; incoming matches are dropped.
    seen: HashSet<DedupKey>,
    last_position: Option<(f64, f64)>,
    last_rsrp: Option<i32>,
    per_cell_last_submit: HashMap<String, DateTime<Utc>>,
    stationary_submits: Vec<DateTime<Utc>>,
    #[serde(skip)]
    stats: ContributionStats,
}

pub struct ContributionQueue {
    cfg: ContributionConfig,
    state: Mutex<QueueState>,
}

impl ContributionQueue {
    pub fn new(cfg: ContributionConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Restore a persisted queue if one is configured and parses.
    pub async fn load(cfg: ContributionConfig) -> Self {
        let state = match &cfg.queue_path {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                    warn!(error = %e, "corrupt contribution queue, starting empty");
                    QueueState::default()
                }),
                Err(_) => QueueState::default(),
            },
            None => QueueState::default(),
        };
        Self {
            cfg,
            state: Mutex::new(state),
        }
    }

    /// Offer one observation. Only GNSS-grade positions attached to a real
    /// change of scenery are worth sending back.
    pub async fn offer(
        &self,
        observation: ContributionObservation,
        fix_is_gnss: bool,
        movement: MovementState,
    ) -> OfferOutcome {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.stats.offered += 1;

        if !fix_is_gnss {
            state.stats.ineligible += 1;
            return OfferOutcome::NotGnss;
        }
        if observation.gps.accuracy_m > self.cfg.min_gps_accuracy_m {
            state.stats.ineligible += 1;
            return OfferOutcome::AccuracyTooLoose;
        }

        let moved_enough = match state.last_position {
            None => true,
            Some((lat, lon)) => {
                crate::geo::haversine_m(lat, lon, observation.gps.lat, observation.gps.lon)
                    >= self.cfg.movement_threshold_m
            }
        };
        let rsrp_changed = match (state.last_rsrp, observation.serving.rsrp) {
            (Some(previous), Some(current)) => {
                (current - previous).abs() >= self.cfg.rsrp_delta_db
            }
            _ => false,
        };
        if !moved_enough && !rsrp_changed {
            state.stats.ineligible += 1;
            return OfferOutcome::NoSignificantChange;
        }

        if movement == MovementState::Stationary {
            let cell_key = observation.serving.id.cache_key();
            let interval = ChronoDuration::from_std(self.cfg.stationary_max_interval)
                .unwrap_or_else(|_| ChronoDuration::hours(3));
            if let Some(last) = state.per_cell_last_submit.get(&cell_key) {
                if now - *last < interval {
                    state.stats.ineligible += 1;
                    return OfferOutcome::StationaryCellCap;
                }
            }
            let hour_ago = now - ChronoDuration::hours(1);
            state.stationary_submits.retain(|t| *t > hour_ago);
            if state.stationary_submits.len()
                >= self.cfg.stationary_global_cap_per_hour as usize
            {
                state.stats.ineligible += 1;
                return OfferOutcome::StationaryGlobalCap;
            }
        }

        let key = self.dedup_key(&observation);
        if state.seen.contains(&key) {
            state.stats.duplicates += 1;
            return OfferOutcome::Duplicate;
        }

        if state.queue.len() >= self.cfg.queue_max {
            // Oldest out first; its tuple stays in the dedup set.
            state.queue.pop_front();
            state.stats.overflow_dropped += 1;
        }

        state.last_position = Some((observation.gps.lat, observation.gps.lon));
        state.last_rsrp = observation.serving.rsrp;
        state.seen.insert(key.clone());
        state.queue.push_back(QueuedContribution {
            observation,
            key,
            queued_at: now,
        });
        state.stats.queued += 1;
        debug!(depth = state.queue.len(), "contribution queued");

        self.persist(&state).await;
        OfferOutcome::Queued
    }

    /// Submit queued observations in batches, pausing between them to
    /// smooth bursts. Stops at the first rate-limit denial or transport
    /// failure; unsent items stay queued.
    pub async fn submit_pending(
        &self,
        client: &ContributionClient,
        limiter: &RateLimiter,
        movement: MovementState,
    ) -> u64 {
        let mut total = 0u64;
        loop {
            let mut state = self.state.lock().await;
            if state.queue.is_empty() {
                self.persist(&state).await;
                return total;
            }

            if !limiter.try_submission().await {
                info!("submission denied by rate limiter, keeping queue");
                self.persist(&state).await;
                return total;
            }

            let batch: Vec<QueuedContribution> = {
                let take = self.cfg.batch_size.min(state.queue.len());
                state.queue.drain(..take).collect()
            };
            let cells: Vec<CellSubmission> = batch
                .iter()
                .map(|item| CellSubmission {
                    mcc: item.observation.serving.id.mcc,
                    mnc: item.observation.serving.id.mnc,
                    lac: item.observation.serving.id.lac,
                    cellid: item.observation.serving.id.cell,
                    lat: item.observation.gps.lat,
                    lon: item.observation.gps.lon,
                    radio: item.observation.serving.id.radio.as_str().to_string(),
                    range: item.observation.gps.accuracy_m,
                })
                .collect();

            match client.submit(&cells).await {
                Ok(()) => {
                    let now = Utc::now();
                    for item in &batch {
                        state
                            .per_cell_last_submit
                            .insert(item.key.cell.clone(), now);
                    }
                    if movement == MovementState::Stationary {
                        state.stationary_submits.push(now);
                    }
                    state.stats.submitted += batch.len() as u64;
                    state.stats.batches += 1;
                    total += batch.len() as u64;
                    let drained = state.queue.is_empty();
                    self.persist(&state).await;
                    drop(state);
                    if drained {
                        return total;
                    }
                    tokio::time::sleep(self.cfg.burst_delay).await;
                }
                Err(e) => {
                    warn!(error = %e, "contribution batch failed, requeueing");
                    for item in batch.into_iter().rev() {
                        state.queue.push_front(item);
                    }
                    self.persist(&state).await;
                    return total;
                }
            }
        }
    }

    pub async fn depth(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn stats(&self) -> ContributionStats {
        self.state.lock().await.stats.clone()
    }

    /// Quantize to the dedup grid: (cell, 75 m cell, hour bucket).
    fn dedup_key(&self, observation: &ContributionObservation) -> DedupKey {
        let lat_step = self.cfg.grid_m / 111_320.0;
        let cos_lat = observation.gps.lat.to_radians().cos().abs().max(0.01);
        let lon_step = self.cfg.grid_m / (111_320.0 * cos_lat);
        DedupKey {
            cell: observation.serving.id.cache_key(),
            grid_y: (observation.gps.lat / lat_step).floor() as i64,
            grid_x: (observation.gps.lon / lon_step).floor() as i64,
            hour: observation.gps.timestamp.timestamp().div_euclid(3600),
        }
    }

    async fn persist(&self, state: &QueueState) {
        let Some(path) = &self.cfg.queue_path else { return };
        let tmp = {
            let mut tmp = path.clone().into_os_string();
            tmp.push(".tmp");
            PathBuf::from(tmp)
        };
        let result = async {
            let raw = serde_json::to_vec(state)?;
            tokio::fs::write(&tmp, raw).await?;
            tokio::fs::rename(&tmp, path).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to persist contribution queue");
        }
    }
}
