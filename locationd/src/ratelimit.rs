//! Policy-compliant rate limiter for provider lookups and submissions.
//!
//! Enforces hard hourly and daily ceilings plus a rolling-window
//! lookups-per-submission ratio published by the provider. Decisions never
//! fail: `try_lookup` and `try_submission` always answer with a boolean.
//! State survives restarts through an atomically replaced JSON file.

use std::path::PathBuf;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LimiterState {
    /// Timestamps of granted lookups, oldest first, bounded by the window.
    lookups: Vec<DateTime<Utc>>,
    /// Timestamps of granted submissions, oldest first.
    submissions: Vec<DateTime<Utc>>,
    hourly_lookups: u32,
    hourly_submissions: u32,
    daily_submissions: u32,
    hour_reset_at: Option<DateTime<Utc>>,
    day_reset_at: Option<DateTime<Utc>>,
    dropped_by_ratio: u64,
    dropped_by_hourly: u64,
    dropped_by_daily: u64,
    trickle_signals: u64,
}

/// Snapshot of limiter health for logging and the host's status surface.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterMetrics {
    pub current_ratio: f64,
    pub lookups_in_window: usize,
    pub submissions_in_window: usize,
    pub remaining_hourly_lookups: u32,
    pub remaining_hourly_submissions: u32,
    pub remaining_daily_submissions: u32,
    pub dropped_by_ratio: u64,
    pub dropped_by_hourly: u64,
    pub dropped_by_daily: u64,
    pub trickle_signals: u64,
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Load persisted state. A missing or corrupt file starts fresh; entries
    /// dated further in the future than the clock-skew allowance are dropped.
    pub async fn load(cfg: RateLimitConfig) -> Self {
        let state = match tokio::fs::read_to_string(&cfg.state_path).await {
            Ok(raw) => match serde_json::from_str::<LimiterState>(&raw) {
                Ok(mut state) => {
                    let horizon = Utc::now()
                        + ChronoDuration::from_std(cfg.max_clock_skew)
                            .unwrap_or_else(|_| ChronoDuration::minutes(15));
                    let before =
                        state.lookups.len() + state.submissions.len();
                    state.lookups.retain(|t| *t <= horizon);
                    state.submissions.retain(|t| *t <= horizon);
                    let dropped = before - state.lookups.len() - state.submissions.len();
                    if dropped > 0 {
                        warn!(dropped, "dropped future-dated rate-limiter entries");
                    }
                    info!(
                        lookups = state.lookups.len(),
                        submissions = state.submissions.len(),
                        "restored rate-limiter state"
                    );
                    state
                }
                Err(e) => {
                    warn!(error = %e, "corrupt rate-limiter state, starting fresh");
                    LimiterState::default()
                }
            },
            Err(_) => LimiterState::default(),
        };
        Self {
            cfg,
            state: Mutex::new(state),
        }
    }

    /// Request one lookup token.
    pub async fn try_lookup(&self) -> bool {
        self.try_lookup_at(Utc::now()).await
    }

    pub async fn try_lookup_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        Self::cleanup(&self.cfg, &mut state, now);

        let hourly = count_since(&state.lookups, now - ChronoDuration::hours(1));
        if hourly >= self.cfg.max_lookups_per_hour as usize {
            state.dropped_by_hourly += 1;
            debug!(hourly, "lookup denied by hourly ceiling");
            self.persist(&state).await;
            return false;
        }

        let lookups = state.lookups.len();
        let submissions = state.submissions.len();
        if submissions == 0 {
            if lookups >= self.cfg.bootstrap_lookups as usize {
                state.dropped_by_ratio += 1;
                debug!(lookups, "lookup denied, bootstrap allowance spent");
                self.persist(&state).await;
                return false;
            }
        } else {
            let projected = (lookups + 1) as f64 / submissions as f64;
            if projected > self.cfg.max_ratio {
                state.dropped_by_ratio += 1;
                debug!(
                    projected,
                    max = self.cfg.max_ratio,
                    "lookup denied by rolling ratio"
                );
                self.persist(&state).await;
                return false;
            }
        }

        state.lookups.push(now);
        state.hourly_lookups += 1;
        self.persist(&state).await;
        true
    }

    /// Request one submission token. Submissions improve the ratio, so only
    /// the hard ceilings can refuse them.
    pub async fn try_submission(&self) -> bool {
        self.try_submission_at(Utc::now()).await
    }

    pub async fn try_submission_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        Self::cleanup(&self.cfg, &mut state, now);

        let hourly = count_since(&state.submissions, now - ChronoDuration::hours(1));
        if hourly >= self.cfg.max_submissions_per_hour as usize {
            state.dropped_by_hourly += 1;
            debug!(hourly, "submission denied by hourly ceiling");
            self.persist(&state).await;
            return false;
        }
        let daily = count_since(&state.submissions, now - ChronoDuration::hours(24));
        if daily >= self.cfg.max_submissions_per_day as usize {
            state.dropped_by_daily += 1;
            debug!(daily, "submission denied by daily ceiling");
            self.persist(&state).await;
            return false;
        }

        state.submissions.push(now);
        state.hourly_submissions += 1;
        state.daily_submissions += 1;
        self.persist(&state).await;
        true
    }

    /// Whether the caller should make a trickle submission to keep the ratio
    /// healthy. Only meaningful while moving with good GPS; the caller owns
    /// the actual submission.
    pub async fn should_trickle(&self, moving_with_good_gps: bool) -> bool {
        self.should_trickle_at(moving_with_good_gps, Utc::now()).await
    }

    pub async fn should_trickle_at(
        &self,
        moving_with_good_gps: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if !moving_with_good_gps {
            return false;
        }
        let mut state = self.state.lock().await;
        let hourly = count_since(&state.submissions, now - ChronoDuration::hours(1));
        let trickle = hourly < self.cfg.min_trickle_per_hour as usize;
        if trickle {
            state.trickle_signals += 1;
        }
        trickle
    }

    pub async fn metrics(&self) -> RateLimiterMetrics {
        self.metrics_at(Utc::now()).await
    }

    pub async fn metrics_at(&self, now: DateTime<Utc>) -> RateLimiterMetrics {
        let mut state = self.state.lock().await;
        Self::cleanup(&self.cfg, &mut state, now);

        let hourly_lookups =
            count_since(&state.lookups, now - ChronoDuration::hours(1));
        let hourly_submissions =
            count_since(&state.submissions, now - ChronoDuration::hours(1));
        let daily_submissions =
            count_since(&state.submissions, now - ChronoDuration::hours(24));

        RateLimiterMetrics {
            current_ratio: if state.submissions.is_empty() {
                state.lookups.len() as f64
            } else {
                state.lookups.len() as f64 / state.submissions.len() as f64
            },
            lookups_in_window: state.lookups.len(),
            submissions_in_window: state.submissions.len(),
            remaining_hourly_lookups: self
                .cfg
                .max_lookups_per_hour
                .saturating_sub(hourly_lookups as u32),
            remaining_hourly_submissions: self
                .cfg
                .max_submissions_per_hour
                .saturating_sub(hourly_submissions as u32),
            remaining_daily_submissions: self
                .cfg
                .max_submissions_per_day
                .saturating_sub(daily_submissions as u32),
            dropped_by_ratio: state.dropped_by_ratio,
            dropped_by_hourly: state.dropped_by_hourly,
            dropped_by_daily: state.dropped_by_daily,
            trickle_signals: state.trickle_signals,
        }
    }

    /// Roll the hourly counters. Driven by the service's hourly tick.
    pub async fn reset_hourly(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.hourly_lookups = 0;
        state.hourly_submissions = 0;
        state.hour_reset_at = Some(now);
        if state
            .day_reset_at
            .is_none_or(|at| now - at >= ChronoDuration::hours(24))
        {
            state.daily_submissions = 0;
            state.day_reset_at = Some(now);
        }
        self.persist(&state).await;
    }

    /// Write state out now. Called during shutdown.
    pub async fn flush(&self) {
        let state = self.state.lock().await;
        self.persist(&state).await;
    }

    /// Drop history outside the rolling window. Runs before every decision.
    fn cleanup(cfg: &RateLimitConfig, state: &mut LimiterState, now: DateTime<Utc>) {
        let cutoff = now
            - ChronoDuration::from_std(cfg.window)
                .unwrap_or_else(|_| ChronoDuration::hours(48));
        state.lookups.retain(|t| *t > cutoff);
        state.submissions.retain(|t| *t > cutoff);
    }

    /// Atomic write through a temporary file. Failures are logged and never
    /// block a decision.
    async fn persist(&self, state: &LimiterState) {
        let tmp = self.temp_path();
        let result = async {
            let raw = serde_json::to_vec_pretty(state)?;
            tokio::fs::write(&tmp, raw).await?;
            tokio::fs::rename(&tmp, &self.cfg.state_path).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, path = %self.cfg.state_path.display(),
                "failed to persist rate-limiter state");
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut path = self.cfg.state_path.clone().into_os_string();
        path.push(".tmp");
        PathBuf::from(path)
    }
}

fn count_since(history: &[DateTime<Utc>], cutoff: DateTime<Utc>) -> usize {
    history.iter().filter(|t| **t > cutoff).count()
}
