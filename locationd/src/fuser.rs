//! Location fuser and quality gate.
//!
//! Fuses resolved towers into one position with a weighted centroid computed
//! on the unit sphere, then decides whether the fresh fix is trustworthy
//! compared to the previous accepted one. A large displacement is accepted
//! outright; everything else must not regress accuracy, must move the
//! needle, and must be statistically consistent with the previous position.

use std::sync::Mutex;

use chrono::Utc;
use tracing::debug;

use crate::config::FuserConfig;
use crate::data::{
    CellularMetrics, FixQuality, FixType, GeoFix, ServingCell, TA_UNIT_METERS,
    TowerLocation, TowerSource,
};
use crate::geo::{
    haversine_m, residuals_m, speed_kmh, weighted_centroid, weighted_std_dev,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AccuracyRegressionTooHigh,
    InsufficientImprovement,
    ChiSquareFailed,
    SpeedExceeded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AccuracyRegressionTooHigh => "accuracy_regression_too_high",
            RejectReason::InsufficientImprovement => "insufficient_improvement",
            RejectReason::ChiSquareFailed => "chi_square_failed",
            RejectReason::SpeedExceeded => "speed_exceeded",
        }
    }
}

#[derive(Debug)]
pub enum GateDecision {
    Accepted {
        fix: GeoFix,
        /// Enough consecutive good fixes to report a stable position.
        stable: bool,
        big_move: bool,
    },
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Default)]
pub struct FuserStats {
    pub accepted: u64,
    pub rejected: u64,
    pub big_moves: u64,
}

#[derive(Default)]
struct GateState {
    last_accepted: Option<GeoFix>,
    good_count: u32,
    stats: FuserStats,
}

pub struct LocationFuser {
    cfg: FuserConfig,
    state: Mutex<GateState>,
}

impl LocationFuser {
    pub fn new(cfg: FuserConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Fuse resolved towers into one fix. Returns `None` for an empty input.
    pub fn fuse(
        &self,
        towers: &[TowerLocation],
        serving: Option<&ServingCell>,
        metrics: Option<&CellularMetrics>,
    ) -> Option<GeoFix> {
        if towers.is_empty() {
            return None;
        }

        let serving_rsrp = serving
            .and_then(|s| s.rsrp)
            .or_else(|| metrics.and_then(|m| m.rsrp));

        let mut weighted: Vec<(&TowerLocation, f64)> = towers
            .iter()
            .map(|tower| {
                let range = tower.range_m.max(1.0);
                let mut weight = (1.0 / (range * range))
                    * (1.0 + 0.2 * ((tower.samples as f64 + 1.0).log10()))
                    * tower.confidence.max(0.01);
                if let Some(serving) = serving {
                    if serving.id == tower.id {
                        weight *= 2.0;
                        if let Some(rsrp) = serving_rsrp {
                            // Linear-domain received power relative to 1 pW.
                            weight *= 10f64.powf(rsrp as f64 / 10.0) / 1e-12;
                        }
                    }
                }
                (tower, weight)
            })
            .collect();

        weighted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        weighted.truncate(self.cfg.max_towers);

        let n = weighted.len();
        let points: Vec<(f64, f64, f64)> = weighted
            .iter()
            .map(|(t, w)| (t.lat, t.lon, *w))
            .collect();

        let (lat, lon) = if n == 1 {
            (weighted[0].0.lat, weighted[0].0.lon)
        } else {
            weighted_centroid(&points)?
        };

        let r_min = weighted
            .iter()
            .map(|(t, _)| t.range_m)
            .fold(f64::INFINITY, f64::min);
        let distances: Vec<f64> = weighted
            .iter()
            .map(|(t, _)| haversine_m(lat, lon, t.lat, t.lon))
            .collect();
        let weights: Vec<f64> = weighted.iter().map(|(_, w)| *w).collect();
        let sigma = weighted_std_dev(&distances, &weights);

        let mut accuracy = (2.0 * r_min).max(sigma / 2.0) * (1.0 / (n as f64).sqrt());
        accuracy = accuracy.clamp(self.cfg.min_accuracy_m, self.cfg.max_accuracy_m);

        let total_weight: f64 = weights.iter().sum();
        let mut confidence = weighted
            .iter()
            .map(|(t, w)| t.confidence * w)
            .sum::<f64>()
            / total_weight;
        confidence = confidence.clamp(0.1, 0.95);

        // Timing advance bounds the distance to the serving tower.
        if let Some(ta) = serving.and_then(|s| s.timing_advance) {
            if ta > 0 {
                let ta_distance = ta as f64 * TA_UNIT_METERS;
                accuracy = accuracy.min(2.0 * ta_distance);
                confidence = (confidence * 1.1).min(0.95);
            }
        }
        accuracy = accuracy.max(self.cfg.min_accuracy_m);

        let method = match n {
            1 => "single_cell",
            2 => "weighted_centroid",
            _ => "triangulation",
        };
        let from_cache = weighted
            .iter()
            .all(|(t, _)| matches!(t.source, TowerSource::Cache));
        let api_call_made = weighted
            .iter()
            .any(|(t, _)| matches!(t.source, TowerSource::Remote));

        let mut contributors: Vec<String> = weighted
            .iter()
            .map(|(t, _)| {
                match t.source {
                    TowerSource::Cache => "cell_cache",
                    TowerSource::Remote => "cell_remote",
                    TowerSource::Negative => "cell_negative",
                }
                .to_string()
            })
            .collect();
        contributors.sort();
        contributors.dedup();

        Some(GeoFix {
            lat,
            lon,
            altitude_m: None,
            accuracy_m: accuracy,
            speed_kmh: None,
            course_deg: None,
            hdop: None,
            vdop: None,
            fix_type: FixType::TwoD,
            quality: FixQuality::from_accuracy(accuracy),
            satellites: None,
            source: "cell_resolver".to_string(),
            method: method.to_string(),
            contributors,
            valid: true,
            confidence,
            collection_ms: 0,
            from_cache,
            api_call_made,
            api_cost: weighted
                .iter()
                .filter(|(t, _)| matches!(t.source, TowerSource::Remote))
                .count() as f64,
            timestamp: Utc::now(),
        })
    }

    /// Compare a fresh fix against the previous accepted one.
    pub fn gate(&self, fix: GeoFix) -> GateDecision {
        let mut state = self.state.lock().expect("fuser state poisoned");

        let Some(previous) = state.last_accepted.clone() else {
            state.good_count = 1;
            state.stats.accepted += 1;
            state.last_accepted = Some(fix.clone());
            return GateDecision::Accepted {
                fix,
                stable: false,
                big_move: false,
            };
        };

        let distance = haversine_m(previous.lat, previous.lon, fix.lat, fix.lon);
        let elapsed_s = (fix.timestamp - previous.timestamp)
            .num_milliseconds() as f64
            / 1000.0;
        let implied_speed = speed_kmh(distance, elapsed_s.max(1.0));
        if implied_speed > self.cfg.max_speed_kmh {
            debug!(speed = implied_speed, "rejecting fix, implied speed too high");
            state.good_count = 0;
            state.stats.rejected += 1;
            return GateDecision::Rejected(RejectReason::SpeedExceeded);
        }

        // A genuine move dwarfs accuracy quibbles.
        if distance > self.cfg.min_movement_distance_m {
            state.good_count += 1;
            state.stats.accepted += 1;
            state.stats.big_moves += 1;
            let stable = state.good_count >= self.cfg.good_fixes_required;
            state.last_accepted = Some(fix.clone());
            return GateDecision::Accepted {
                fix,
                stable,
                big_move: true,
            };
        }

        let ratio = fix.accuracy_m / previous.accuracy_m.max(1.0);
        if ratio > self.cfg.accuracy_regression_limit {
            state.good_count = 0;
            state.stats.rejected += 1;
            return GateDecision::Rejected(RejectReason::AccuracyRegressionTooHigh);
        }
        if ratio < self.cfg.accuracy_improvement {
            state.good_count = 0;
            state.stats.rejected += 1;
            return GateDecision::Rejected(RejectReason::InsufficientImprovement);
        }

        let (dlat_m, dlon_m) = residuals_m(previous.lat, previous.lon, fix.lat, fix.lon);
        let scale = fix.accuracy_m.max(1.0);
        let chi_square = (dlat_m / scale).powi(2) + (dlon_m / scale).powi(2);
        if chi_square > self.cfg.chi_square_limit {
            debug!(chi_square, "rejecting statistically implausible jump");
            state.good_count = 0;
            state.stats.rejected += 1;
            return GateDecision::Rejected(RejectReason::ChiSquareFailed);
        }

        // Consecutive good fixes get exponentially smoothed.
        let alpha = self.cfg.ema_alpha;
        let mut smoothed = fix;
        smoothed.lat = alpha * smoothed.lat + (1.0 - alpha) * previous.lat;
        smoothed.lon = alpha * smoothed.lon + (1.0 - alpha) * previous.lon;

        state.good_count += 1;
        state.stats.accepted += 1;
        let stable = state.good_count >= self.cfg.good_fixes_required;
        state.last_accepted = Some(smoothed.clone());
        GateDecision::Accepted {
            fix: smoothed,
            stable,
            big_move: false,
        }
    }

    pub fn last_accepted(&self) -> Option<GeoFix> {
        self.state.lock().expect("fuser state poisoned").last_accepted.clone()
    }

    pub fn stats(&self) -> FuserStats {
        self.state.lock().expect("fuser state poisoned").stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CellId, RadioType};
    use chrono::Duration as ChronoDuration;

    fn config() -> FuserConfig {
        FuserConfig {
            min_accuracy_m: 50.0,
            max_accuracy_m: 10_000.0,
            max_towers: 5,
            min_movement_distance_m: 300.0,
            accuracy_regression_limit: 1.2,
            accuracy_improvement: 0.8,
            chi_square_limit: 5.99,
            good_fixes_required: 3,
            max_speed_kmh: 160.0,
            ema_alpha: 0.3,
        }
    }

    fn cell(cell: u64) -> CellId {
        CellId {
            mcc: 240,
            mnc: 1,
            lac: 54321,
            cell,
            radio: RadioType::Lte,
        }
    }

    fn tower(id: u64, lat: f64, lon: f64, range_m: f64) -> TowerLocation {
        TowerLocation {
            id: cell(id),
            lat,
            lon,
            range_m,
            samples: 100,
            confidence: 0.8,
            source: TowerSource::Cache,
            changeable: true,
            updated_at: Utc::now(),
        }
    }

    fn serving(id: u64, rsrp: Option<i32>, ta: Option<u32>) -> ServingCell {
        ServingCell {
            id: cell(id),
            rsrp,
            rsrq: None,
            sinr: None,
            timing_advance: ta,
            band: None,
            arfcn: None,
            pcid: None,
        }
    }

    fn fix_at(lat: f64, lon: f64, accuracy: f64, seconds_ago: i64) -> GeoFix {
        let mut fix = GeoFix::basic(lat, lon, accuracy, "cell_resolver");
        fix.timestamp = Utc::now() - ChronoDuration::seconds(seconds_ago);
        fix
    }

    #[test]
    fn empty_input_fuses_to_nothing() {
        let fuser = LocationFuser::new(config());
        assert!(fuser.fuse(&[], None, None).is_none());
    }

    #[test]
    fn single_tower_returns_coordinates_verbatim() {
        let fuser = LocationFuser::new(config());
        let fix = fuser
            .fuse(&[tower(1, 59.33, 18.06, 500.0)], None, None)
            .unwrap();
        assert_eq!(fix.lat, 59.33);
        assert_eq!(fix.lon, 18.06);
        assert_eq!(fix.method, "single_cell");
        // 2 * r_min for one tower.
        assert_eq!(fix.accuracy_m, 1000.0);
    }

    #[test]
    fn method_tag_tracks_tower_count() {
        let fuser = LocationFuser::new(config());
        let two = fuser
            .fuse(
                &[tower(1, 59.0, 18.0, 500.0), tower(2, 59.01, 18.0, 500.0)],
                None,
                None,
            )
            .unwrap();
        assert_eq!(two.method, "weighted_centroid");

        let three = fuser
            .fuse(
                &[
                    tower(1, 59.0, 18.0, 500.0),
                    tower(2, 59.01, 18.0, 500.0),
                    tower(3, 59.0, 18.01, 500.0),
                ],
                None,
                None,
            )
            .unwrap();
        assert_eq!(three.method, "triangulation");
    }

    #[test]
    fn identical_towers_fuse_to_that_point() {
        let fuser = LocationFuser::new(config());
        let towers: Vec<TowerLocation> =
            (1..=4).map(|i| tower(i, 59.33, 18.06, 300.0)).collect();
        let fix = fuser.fuse(&towers, None, None).unwrap();
        assert!(haversine_m(fix.lat, fix.lon, 59.33, 18.06) < 1.0);
    }

    #[test]
    fn antimeridian_towers_fuse_near_180_not_zero() {
        let fuser = LocationFuser::new(config());
        let fix = fuser
            .fuse(
                &[tower(1, 0.0, 179.9, 500.0), tower(2, 0.0, -179.9, 500.0)],
                None,
                None,
            )
            .unwrap();
        assert!(fix.lat.abs() < 0.01);
        assert!((fix.lon.abs() - 180.0).abs() < 0.01, "got lon {}", fix.lon);
    }

    #[test]
    fn serving_cell_pulls_centroid_toward_it() {
        let fuser = LocationFuser::new(config());
        let towers = [tower(1, 59.0, 18.0, 500.0), tower(2, 59.1, 18.0, 500.0)];

        let neutral = fuser.fuse(&towers, None, None).unwrap();
        let pulled = fuser
            .fuse(&towers, Some(&serving(1, None, None)), None)
            .unwrap();
        assert!(pulled.lat < neutral.lat, "serving weight must pull south");
    }

    #[test]
    fn accuracy_is_clamped_to_bounds() {
        let fuser = LocationFuser::new(config());
        // Tiny range forces the floor.
        let tight = fuser.fuse(&[tower(1, 59.0, 18.0, 1.0)], None, None).unwrap();
        assert_eq!(tight.accuracy_m, 50.0);
        // Huge range forces the ceiling.
        let loose = fuser
            .fuse(&[tower(1, 59.0, 18.0, 500_000.0)], None, None)
            .unwrap();
        assert_eq!(loose.accuracy_m, 10_000.0);
        assert!((0.1..=0.95).contains(&tight.confidence));
    }

    #[test]
    fn timing_advance_tightens_accuracy() {
        let fuser = LocationFuser::new(config());
        let towers = [tower(1, 59.0, 18.0, 2_000.0)];

        let unconstrained = fuser
            .fuse(&towers, Some(&serving(1, None, Some(0))), None)
            .unwrap();
        // TA of zero adds no constraint.
        assert_eq!(unconstrained.accuracy_m, 4_000.0);

        // TA of 10 bounds the distance to about 781 m.
        let constrained = fuser
            .fuse(&towers, Some(&serving(1, None, Some(10))), None)
            .unwrap();
        assert!((constrained.accuracy_m - 2.0 * 10.0 * TA_UNIT_METERS).abs() < 1e-6);

        // Maximum TA implies a bound far above the ceiling; nothing tightens.
        let max_ta = fuser
            .fuse(&towers, Some(&serving(1, None, Some(1282))), None)
            .unwrap();
        assert_eq!(max_ta.accuracy_m, 4_000.0);
    }

    #[test]
    fn first_fix_is_always_accepted() {
        let fuser = LocationFuser::new(config());
        match fuser.gate(fix_at(59.33, 18.06, 100.0, 0)) {
            GateDecision::Accepted { stable, big_move, .. } => {
                assert!(!stable);
                assert!(!big_move);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn big_move_bypasses_accuracy_regression() {
        let fuser = LocationFuser::new(config());
        let _ = fuser.gate(fix_at(59.33, 18.06, 30.0, 3600));

        // 31 km away with double the accuracy error: still accepted.
        match fuser.gate(fix_at(59.50, 18.50, 60.0, 0)) {
            GateDecision::Accepted { big_move, .. } => assert!(big_move),
            other => panic!("expected big-move acceptance, got {other:?}"),
        }
        assert_eq!(fuser.stats().big_moves, 1);
    }

    #[test]
    fn accuracy_regression_is_rejected() {
        let fuser = LocationFuser::new(config());
        let _ = fuser.gate(fix_at(59.33, 18.06, 100.0, 60));

        let near = fix_at(59.3301, 18.0601, 130.0, 0);
        match fuser.gate(near) {
            GateDecision::Rejected(reason) => {
                assert_eq!(reason, RejectReason::AccuracyRegressionTooHigh)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn suspicious_improvement_is_rejected() {
        let fuser = LocationFuser::new(config());
        let _ = fuser.gate(fix_at(59.33, 18.06, 100.0, 60));

        match fuser.gate(fix_at(59.3301, 18.0601, 40.0, 0)) {
            GateDecision::Rejected(reason) => {
                assert_eq!(reason, RejectReason::InsufficientImprovement)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn chi_square_rejects_implausible_jump() {
        let fuser = LocationFuser::new(config());
        let _ = fuser.gate(fix_at(59.33, 18.06, 100.0, 60));

        // About 250 m north with 100 m claimed accuracy: chi-square over
        // the 5.99 limit, but under the big-move threshold.
        let jump = fix_at(59.33 + 250.0 / 111_320.0, 18.06, 100.0, 0);
        match fuser.gate(jump) {
            GateDecision::Rejected(reason) => {
                assert_eq!(reason, RejectReason::ChiSquareFailed)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn implied_speed_over_limit_is_rejected() {
        let fuser = LocationFuser::new(config());
        let _ = fuser.gate(fix_at(59.33, 18.06, 100.0, 60));

        // 31 km in one minute is about 1860 km/h.
        match fuser.gate(fix_at(59.50, 18.50, 100.0, 0)) {
            GateDecision::Rejected(reason) => {
                assert_eq!(reason, RejectReason::SpeedExceeded)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn accepted_fixes_are_ema_smoothed() {
        let fuser = LocationFuser::new(config());
        let _ = fuser.gate(fix_at(59.0, 18.0, 100.0, 60));

        // 100 m north, same accuracy: plain acceptance with smoothing.
        let north = 59.0 + 100.0 / 111_320.0;
        match fuser.gate(fix_at(north, 18.0, 100.0, 0)) {
            GateDecision::Accepted { fix, big_move, .. } => {
                assert!(!big_move);
                let expected = 0.3 * north + 0.7 * 59.0;
                assert!((fix.lat - expected).abs() < 1e-9);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn hysteresis_requires_three_consecutive_accepts() {
        let fuser = LocationFuser::new(config());
        let step = 100.0 / 111_320.0;

        let mut stables = Vec::new();
        for i in 0..4 {
            let fix = fix_at(59.0 + step * i as f64, 18.0, 100.0, 60 - i as i64 * 15);
            match fuser.gate(fix) {
                GateDecision::Accepted { stable, .. } => stables.push(stable),
                other => panic!("expected acceptance, got {other:?}"),
            }
        }
        assert_eq!(stables, vec![false, false, true, true]);
    }

    #[test]
    fn rejection_resets_the_good_counter_but_keeps_state() {
        let fuser = LocationFuser::new(config());
        let step = 100.0 / 111_320.0;

        let _ = fuser.gate(fix_at(59.0, 18.0, 100.0, 120));
        let _ = fuser.gate(fix_at(59.0 + step, 18.0, 100.0, 90));

        // A regression rejection clears progress toward stability.
        let _ = fuser.gate(fix_at(59.0 + step, 18.0, 200.0, 60));
        assert!(fuser.last_accepted().is_some());

        // Three clean fixes near the retained position rebuild stability.
        let mut stables = Vec::new();
        for i in 0..3 {
            let fix = fix_at(59.0 + step, 18.0, 100.0, 30 - i as i64 * 10);
            match fuser.gate(fix) {
                GateDecision::Accepted { stable, .. } => stables.push(stable),
                other => panic!("expected acceptance, got {other:?}"),
            }
        }
        assert_eq!(stables, vec![false, false, true]);
    }
}
