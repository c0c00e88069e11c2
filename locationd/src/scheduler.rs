//! Adaptive query scheduler: decides whether a scan of the cellular
//! environment warrants a fresh remote resolution.
//!
//! Change detection runs against the last committed fingerprint. A detected
//! change triggers immediately but opens a debounce window; when the window
//! lapses the next scan either confirms the change (committed, `verified`)
//! or reveals it was a blip (`debounced`). While the device is stationary,
//! change-driven triggers are additionally spaced out by a ladder keyed off
//! how long it has been still.

use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::data::{CellEnvironment, MovementState};
use crate::fingerprint::{EnvironmentFingerprint, top_k_delta, tower_change_ratio};
use crate::fuser::GateDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryReason {
    NoPreviousData,
    DebounceActive,
    ServingCellChanged,
    TowerChange,
    TopKChanged,
    CacheExpired,
    UsingCache,
}

impl QueryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryReason::NoPreviousData => "no_previous_data",
            QueryReason::DebounceActive => "debounce_active",
            QueryReason::ServingCellChanged => "serving_cell_changed",
            QueryReason::TowerChange => "tower_change",
            QueryReason::TopKChanged => "top_k_changed",
            QueryReason::CacheExpired => "cache_expired",
            QueryReason::UsingCache => "using_cache",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub environment_changes: u64,
    pub debounced_changes: u64,
    pub verified_changes: u64,
    pub fallbacks_to_cache: u64,
    pub quality_rejections: u64,
    pub accepted_fixes: u64,
    pub big_move_acceptances: u64,
    pub stationary_detections: u64,
}

#[derive(Default)]
struct SchedState {
    last_fingerprint: Option<EnvironmentFingerprint>,
    /// A change fired and awaits confirmation after the debounce window.
    pending_change: bool,
    debounce_until: Option<DateTime<Utc>>,
    last_trigger_at: Option<DateTime<Utc>>,
    last_resolution_at: Option<DateTime<Utc>>,
    movement: MovementState,
    stationary_since: Option<DateTime<Utc>>,
    stats: SchedulerStats,
}

pub struct QueryScheduler {
    cfg: SchedulerConfig,
    state: Mutex<SchedState>,
}

impl QueryScheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(SchedState::default()),
        }
    }

    /// Answer "should we initiate a fresh remote resolution now?". Never
    /// fails; a no with a reason is the normal return.
    pub fn should_query(&self, env: &CellEnvironment) -> (bool, QueryReason) {
        self.should_query_at(env, Utc::now())
    }

    pub fn should_query_at(
        &self,
        env: &CellEnvironment,
        now: DateTime<Utc>,
    ) -> (bool, QueryReason) {
        let fp = EnvironmentFingerprint::from_environment(env);
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.stats.total_queries += 1;

        let Some(last) = state.last_fingerprint.clone() else {
            state.last_fingerprint = Some(fp);
            state.last_trigger_at = Some(now);
            state.stats.cache_misses += 1;
            return (true, QueryReason::NoPreviousData);
        };

        if let Some(until) = state.debounce_until {
            if now < until {
                state.stats.cache_hits += 1;
                return (false, QueryReason::DebounceActive);
            }
            // Window lapsed; this scan decides verified vs debounced.
            state.debounce_until = None;
        }

        let change = self.detect_change(&last, &fp);

        if let Some(reason) = change {
            if state.pending_change {
                // The change survived the debounce window.
                state.pending_change = false;
                state.stats.verified_changes += 1;
                state.last_fingerprint = Some(fp);
                state.last_trigger_at = Some(now);
                state.stats.cache_misses += 1;
                return (true, reason);
            }

            if self.stationary_hold(&state, now) {
                debug!(reason = reason.as_str(), "change suppressed while stationary");
                state.stats.cache_hits += 1;
                return (false, QueryReason::UsingCache);
            }

            state.pending_change = true;
            state.debounce_until = Some(
                now + ChronoDuration::from_std(self.cfg.debounce)
                    .unwrap_or_else(|_| ChronoDuration::seconds(10)),
            );
            state.last_trigger_at = Some(now);
            state.stats.environment_changes += 1;
            state.stats.cache_misses += 1;
            return (true, reason);
        }

        if state.pending_change {
            // The environment settled back; the trigger was a blip.
            state.pending_change = false;
            state.stats.debounced_changes += 1;
        }

        let expired = match state.last_resolution_at {
            None => true,
            Some(at) => {
                now - at
                    >= ChronoDuration::from_std(self.cfg.hard_ttl)
                        .unwrap_or_else(|_| ChronoDuration::minutes(60))
            }
        };
        if expired {
            state.last_trigger_at = Some(now);
            state.stats.cache_misses += 1;
            return (true, QueryReason::CacheExpired);
        }

        state.stats.cache_hits += 1;
        (false, QueryReason::UsingCache)
    }

    fn detect_change(
        &self,
        last: &EnvironmentFingerprint,
        current: &EnvironmentFingerprint,
    ) -> Option<QueryReason> {
        if current.serving_key != last.serving_key {
            return Some(QueryReason::ServingCellChanged);
        }
        if tower_change_ratio(last, current) >= self.cfg.tower_change_threshold {
            return Some(QueryReason::TowerChange);
        }
        if top_k_delta(last, current, self.cfg.top_k) >= self.cfg.top_k_delta {
            return Some(QueryReason::TopKChanged);
        }
        None
    }

    /// While stationary, change-driven triggers follow a widening ladder
    /// keyed off how long the device has been still.
    fn stationary_hold(&self, state: &SchedState, now: DateTime<Utc>) -> bool {
        if state.movement != MovementState::Stationary {
            return false;
        }
        let (Some(since), Some(last_trigger)) =
            (state.stationary_since, state.last_trigger_at)
        else {
            return false;
        };
        let still_min = (now - since).num_minutes();
        let interval_min = if still_min >= 60 {
            60
        } else if still_min >= 40 {
            40
        } else if still_min >= 20 {
            20
        } else if still_min >= 10 {
            10
        } else {
            self.cfg.moving_floor.as_secs() as i64 / 60
        };
        now - last_trigger < ChronoDuration::minutes(interval_min)
    }

    /// Movement transitions reported by the arbitrator.
    pub fn set_movement(&self, movement: MovementState, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        if movement == MovementState::Stationary && state.movement != MovementState::Stationary
        {
            state.stationary_since = Some(now);
            state.stats.stationary_detections += 1;
        }
        if movement == MovementState::Moving {
            state.stationary_since = None;
        }
        state.movement = movement;
    }

    /// Record that a remote resolution completed, for the hard-TTL rule.
    pub fn record_resolution(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.last_resolution_at = Some(now);
    }

    /// Record a rate-limiter denial that forced cache-only operation.
    pub fn record_fallback_to_cache(&self) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        state.stats.fallbacks_to_cache += 1;
    }

    /// Feed quality-gate outcomes into the shared counters.
    pub fn record_gate(&self, decision: &GateDecision) {
        let mut state = self.state.lock().expect("scheduler state poisoned");
        match decision {
            GateDecision::Accepted { big_move, .. } => {
                state.stats.accepted_fixes += 1;
                if *big_move {
                    state.stats.big_move_acceptances += 1;
                }
            }
            GateDecision::Rejected(_) => state.stats.quality_rejections += 1,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.state.lock().expect("scheduler state poisoned").stats.clone()
    }
}
