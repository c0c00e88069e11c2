//! Position sources and the capability set the arbitrator drives them
//! through.

pub mod cell_resolver;
pub mod gnss;
pub mod satellite;
pub mod triangulation;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::data::GeoFix;
use crate::errors::Result;

/// Context handed to every probe and collect call.
#[derive(Clone)]
pub struct CollectContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Default for CollectContext {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }
}

/// Health snapshot for one source. Observed success rate drives no
/// decisions yet; it is exposed for the host's status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub available: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub error_count: u64,
    pub success_count: u64,
}

#[derive(Debug, Default)]
struct HealthInner {
    available: bool,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    error_count: u64,
    success_count: u64,
    total_latency_ms: u64,
}

/// Per-source health tracking, updated on every call.
#[derive(Debug, Default)]
pub struct HealthMeter {
    inner: Mutex<HealthInner>,
}

impl HealthMeter {
    pub fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.lock().expect("health meter poisoned");
        inner.success_count += 1;
        inner.total_latency_ms += latency.as_millis() as u64;
        inner.last_success = Some(Utc::now());
        inner.last_error = None;
    }

    pub fn record_failure(&self, error: impl Into<String>) {
        let mut inner = self.inner.lock().expect("health meter poisoned");
        inner.error_count += 1;
        inner.last_error = Some(error.into());
    }

    pub fn set_available(&self, available: bool) {
        self.inner.lock().expect("health meter poisoned").available = available;
    }

    pub fn snapshot(&self) -> SourceHealth {
        let inner = self.inner.lock().expect("health meter poisoned");
        let calls = inner.success_count + inner.error_count;
        SourceHealth {
            available: inner.available,
            last_success: inner.last_success,
            last_error: inner.last_error.clone(),
            success_rate: if calls == 0 {
                0.0
            } else {
                inner.success_count as f64 / calls as f64
            },
            avg_latency_ms: if inner.success_count == 0 {
                0.0
            } else {
                inner.total_latency_ms as f64 / inner.success_count as f64
            },
            error_count: inner.error_count,
            success_count: inner.success_count,
        }
    }
}

/// Uniform capability set every position source implements.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Stable, unique name; matches the configured priority list.
    fn name(&self) -> &str;

    /// Lower is preferred.
    fn priority(&self) -> u32;

    /// Cheap probe. Must not block on the network.
    async fn available(&self, ctx: &CollectContext) -> bool;

    async fn collect(&self, ctx: &CollectContext) -> Result<GeoFix>;

    fn meter(&self) -> &HealthMeter;

    fn health(&self) -> SourceHealth {
        self.meter().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_meter_tracks_rates_and_latency() {
        let meter = HealthMeter::default();
        meter.record_success(Duration::from_millis(100));
        meter.record_success(Duration::from_millis(300));
        meter.record_failure("boom");

        let health = meter.snapshot();
        assert_eq!(health.success_count, 2);
        assert_eq!(health.error_count, 1);
        assert!((health.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(health.avg_latency_ms, 200.0);
        assert_eq!(health.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn fresh_meter_reports_zeroes() {
        let health = HealthMeter::default().snapshot();
        assert_eq!(health.success_rate, 0.0);
        assert_eq!(health.avg_latency_ms, 0.0);
        assert!(health.last_success.is_none());
    }
}
