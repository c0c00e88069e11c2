//! Environment fingerprinting: a canonical, hashable summary of the
//! currently observed cells, compared across time to detect change.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::CellEnvironment;

/// Canonical summary of one cellular environment scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    /// Serialized serving cell identifier.
    pub serving_key: String,
    /// (neighbor observation key, RSRP) sorted by key for stability.
    pub neighbors: Vec<(String, i32)>,
    /// Hex SHA-256 of the canonical string form.
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

impl EnvironmentFingerprint {
    pub fn from_environment(env: &CellEnvironment) -> Self {
        let serving_key = env.serving.id.cache_key();

        let mut neighbors: Vec<(String, i32)> = env
            .neighbors
            .iter()
            .map(|n| (n.observation_key(), n.rsrp.unwrap_or(i32::MIN)))
            .collect();
        neighbors.sort();
        neighbors.dedup_by(|a, b| a.0 == b.0);

        let mut canonical = serving_key.clone();
        for (key, rsrp) in &neighbors {
            canonical.push('|');
            canonical.push_str(key);
            canonical.push('=');
            canonical.push_str(&rsrp.to_string());
        }
        let digest = hex::encode(Sha256::digest(canonical.as_bytes()));

        Self {
            serving_key,
            neighbors,
            digest,
            created_at: env.scanned_at,
        }
    }

    pub fn neighbor_keys(&self) -> HashSet<&str> {
        self.neighbors.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// Strongest `k` neighbors by RSRP, strongest first.
    pub fn top_k(&self, k: usize) -> Vec<&str> {
        let mut by_power: Vec<&(String, i32)> = self.neighbors.iter().collect();
        by_power.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        by_power.into_iter().take(k).map(|(k, _)| k.as_str()).collect()
    }
}

/// |U − I| / |U| over the neighbor sets of two fingerprints. 0.0 when both
/// are empty.
pub fn tower_change_ratio(
    previous: &EnvironmentFingerprint,
    current: &EnvironmentFingerprint,
) -> f64 {
    let prev = previous.neighbor_keys();
    let cur = current.neighbor_keys();
    let union: HashSet<&str> = prev.union(&cur).copied().collect();
    if union.is_empty() {
        return 0.0;
    }
    let intersection = prev.intersection(&cur).count();
    (union.len() - intersection) as f64 / union.len() as f64
}

/// Number of current top-K members absent from the previous top-K.
pub fn top_k_delta(
    previous: &EnvironmentFingerprint,
    current: &EnvironmentFingerprint,
    k: usize,
) -> usize {
    let prev: HashSet<&str> = previous.top_k(k).into_iter().collect();
    current
        .top_k(k)
        .into_iter()
        .filter(|key| !prev.contains(key))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CellId, NeighborCell, RadioType, ServingCell};

    fn cell(cell: u64) -> CellId {
        CellId {
            mcc: 240,
            mnc: 1,
            lac: 100,
            cell,
            radio: RadioType::Lte,
        }
    }

    fn neighbor(pcid: u32, rsrp: i32) -> NeighborCell {
        NeighborCell {
            id: None,
            pcid: Some(pcid),
            arfcn: Some(6300),
            rsrp: Some(rsrp),
            rsrq: None,
        }
    }

    fn environment(serving: u64, neighbors: Vec<NeighborCell>) -> CellEnvironment {
        CellEnvironment {
            serving: ServingCell {
                id: cell(serving),
                rsrp: Some(-90),
                rsrq: None,
                sinr: None,
                timing_advance: None,
                band: None,
                arfcn: Some(6300),
                pcid: Some(1),
            },
            neighbors,
            scanned_at: Utc::now(),
        }
    }

    #[test]
    fn digest_is_stable_for_equal_environments() {
        let env = environment(1, vec![neighbor(10, -80), neighbor(20, -90)]);
        let a = EnvironmentFingerprint::from_environment(&env);
        let b = EnvironmentFingerprint::from_environment(&env);
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn digest_ignores_neighbor_order() {
        let a = EnvironmentFingerprint::from_environment(&environment(
            1,
            vec![neighbor(10, -80), neighbor(20, -90)],
        ));
        let b = EnvironmentFingerprint::from_environment(&environment(
            1,
            vec![neighbor(20, -90), neighbor(10, -80)],
        ));
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn digest_changes_with_serving_cell() {
        let a = EnvironmentFingerprint::from_environment(&environment(1, vec![]));
        let b = EnvironmentFingerprint::from_environment(&environment(2, vec![]));
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn change_ratio_counts_symmetric_difference() {
        let prev = EnvironmentFingerprint::from_environment(&environment(
            1,
            vec![neighbor(10, -80), neighbor(20, -85), neighbor(30, -90)],
        ));
        let cur = EnvironmentFingerprint::from_environment(&environment(
            1,
            vec![neighbor(10, -80), neighbor(40, -85), neighbor(50, -90)],
        ));
        // Union is {10,20,30,40,50}, intersection {10}: 4/5 changed.
        let ratio = tower_change_ratio(&prev, &cur);
        assert!((ratio - 0.8).abs() < 1e-9, "got {ratio}");
    }

    #[test]
    fn change_ratio_is_zero_for_identical_sets() {
        let env = environment(1, vec![neighbor(10, -80), neighbor(20, -85)]);
        let a = EnvironmentFingerprint::from_environment(&env);
        let b = EnvironmentFingerprint::from_environment(&env);
        assert_eq!(tower_change_ratio(&a, &b), 0.0);
    }

    #[test]
    fn top_k_is_ordered_by_power() {
        let fp = EnvironmentFingerprint::from_environment(&environment(
            1,
            vec![neighbor(10, -95), neighbor(20, -70), neighbor(30, -85)],
        ));
        assert_eq!(fp.top_k(2), vec!["pci20@6300", "pci30@6300"]);
    }

    #[test]
    fn top_k_delta_counts_new_members_only() {
        let prev = EnvironmentFingerprint::from_environment(&environment(
            1,
            vec![neighbor(10, -70), neighbor(20, -75), neighbor(30, -80)],
        ));
        let cur = EnvironmentFingerprint::from_environment(&environment(
            1,
            vec![neighbor(40, -70), neighbor(50, -75), neighbor(10, -80)],
        ));
        assert_eq!(top_k_delta(&prev, &cur, 3), 2);
        assert_eq!(top_k_delta(&prev, &prev, 3), 0);
    }
}
