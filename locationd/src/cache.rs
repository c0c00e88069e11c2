//! Persistent cell-tower cache with eviction and maintenance.
//!
//! A single SQLite file holds three tables standing in for the store's
//! logical buckets: `cell_data` (key = canonical cell identifier, value =
//! JSON-encoded entry), `metadata`, and `stats`. Hot columns are mirrored
//! out of the JSON so eviction passes can run as queries.
//!
//! Entries leave the cache four ways: negative TTL expiry, age, distance
//! from the current fix, and the size-cap LRU pass. The first is allowed to
//! remove anything; the other three never touch an entry seen within the
//! recent-keep window.

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::data::{CachedEntry, CellId};
use crate::errors::{LocationError, Result};
use crate::geo::haversine_m;

const STATS_KEY: &str = "cache";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub negative_hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub deletes: u64,
    pub corrupt_dropped: u64,
    pub evicted_age: u64,
    pub evicted_distance: u64,
    pub evicted_size: u64,
    pub evicted_negative_ttl: u64,
}

/// What a cache probe saw. A negative hit means the cell is confirmed
/// unknown and must not be re-queried until its TTL lapses.
#[derive(Debug)]
pub enum CacheLookup {
    Positive(CachedEntry),
    Negative,
    Miss,
}

pub struct CellCache {
    pool: SqlitePool,
    cfg: CacheConfig,
    stats: RwLock<CacheStats>,
}

impl CellCache {
    /// Open or create the store. Only this failure escalates to the
    /// supervisor.
    pub async fn open(cfg: CacheConfig) -> Result<Self> {
        if let Some(parent) = cfg.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LocationError::StoreUnavailable(e.to_string()))?;
            let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755));
        }
        if !cfg.path.exists() {
            std::fs::File::create(&cfg.path)
                .map_err(|e| LocationError::StoreUnavailable(e.to_string()))?;
        }
        std::fs::set_permissions(&cfg.path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| LocationError::StoreUnavailable(e.to_string()))?;

        let options = SqliteConnectOptions::new()
            .filename(&cfg.path)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| LocationError::StoreUnavailable(e.to_string()))?;

        for ddl in [
            "CREATE TABLE IF NOT EXISTS cell_data (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                lat REAL,
                lon REAL,
                cached_at INTEGER NOT NULL,
                last_access INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                last_used_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                is_negative INTEGER NOT NULL,
                expires_at INTEGER,
                size_bytes INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS stats (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        ] {
            sqlx::query(ddl)
                .execute(&pool)
                .await
                .map_err(|e| LocationError::StoreUnavailable(e.to_string()))?;
        }

        let stats = Self::load_stats(&pool).await;
        info!(path = %cfg.path.display(), "opened cell cache");
        Ok(Self {
            pool,
            cfg,
            stats: RwLock::new(stats),
        })
    }

    /// Probe the cache. Expired negative entries are deleted in place and
    /// reported as a miss; corrupt rows likewise.
    pub async fn get(&self, id: &CellId) -> Result<CacheLookup> {
        self.get_at(id, Utc::now()).await
    }

    pub async fn get_at(&self, id: &CellId, now: DateTime<Utc>) -> Result<CacheLookup> {
        let key = id.cache_key();
        let row = sqlx::query("SELECT value FROM cell_data WHERE key = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            self.stats.write().await.misses += 1;
            return Ok(CacheLookup::Miss);
        };

        let raw: String = row.get("value");
        let entry: CachedEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key, error = %e, "dropping corrupt cache entry");
                self.delete_key(&key).await?;
                let mut stats = self.stats.write().await;
                stats.corrupt_dropped += 1;
                stats.misses += 1;
                return Ok(CacheLookup::Miss);
            }
        };

        if entry.is_negative {
            if entry.expires_at.is_none_or(|at| at <= now) {
                self.delete_key(&key).await?;
                self.stats.write().await.misses += 1;
                return Ok(CacheLookup::Miss);
            }
            self.stats.write().await.negative_hits += 1;
            return Ok(CacheLookup::Negative);
        }

        sqlx::query(
            "UPDATE cell_data SET last_access = ?, access_count = access_count + 1
             WHERE key = ?",
        )
        .bind(now.timestamp())
        .bind(&key)
        .execute(&self.pool)
        .await?;
        self.stats.write().await.hits += 1;
        Ok(CacheLookup::Positive(entry))
    }

    /// Insert or replace an entry, then enforce the size cap.
    pub async fn set(&self, entry: &CachedEntry) -> Result<()> {
        let key = entry.id.cache_key();
        let value = serde_json::to_string(entry)?;
        let size_bytes = (key.len() + value.len()) as i64;

        sqlx::query(
            "INSERT OR REPLACE INTO cell_data
             (key, value, lat, lon, cached_at, last_access, last_seen_at,
              last_used_at, access_count, is_negative, expires_at, size_bytes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key)
        .bind(&value)
        .bind(entry.lat)
        .bind(entry.lon)
        .bind(entry.cached_at.timestamp())
        .bind(entry.last_access.timestamp())
        .bind(entry.last_seen_at.timestamp())
        .bind(entry.last_used_at.timestamp())
        .bind(entry.access_count as i64)
        .bind(entry.is_negative as i64)
        .bind(entry.expires_at.map(|at| at.timestamp()))
        .bind(size_bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| LocationError::WriteFailed(e.to_string()))?;

        self.stats.write().await.inserts += 1;

        let cap = self.cap_bytes();
        if self.estimated_size_bytes().await? > cap {
            self.evict_size_at(entry.cached_at).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, id: &CellId) -> Result<bool> {
        let removed = self.delete_key(&id.cache_key()).await?;
        if removed {
            self.stats.write().await.deletes += 1;
        }
        Ok(removed)
    }

    /// Record that the scanner observed this cell, without implying it was
    /// useful. Keeps the entry safe from eviction.
    pub async fn touch_seen(&self, id: &CellId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE cell_data SET last_seen_at = ? WHERE key = ?")
            .bind(at.timestamp())
            .bind(id.cache_key())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record that this cell contributed to a computed fix.
    pub async fn touch_used(&self, id: &CellId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE cell_data SET last_used_at = ?, last_access = ?,
             access_count = access_count + 1 WHERE key = ?",
        )
        .bind(at.timestamp())
        .bind(at.timestamp())
        .bind(id.cache_key())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Expiry instant for a new negative entry: base TTL plus uniform jitter
    /// so a fleet of devices does not re-ask in lockstep.
    pub fn negative_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let jitter_h = rand::thread_rng().gen_range(
            self.cfg.negative_jitter_min_hours..=self.cfg.negative_jitter_max_hours,
        );
        let ttl_s = (self.cfg.negative_base_hours as f64 + jitter_h) * 3600.0;
        now + ChronoDuration::seconds(ttl_s as i64)
    }

    pub async fn entry_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cell_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn estimated_size_bytes(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(SUM(size_bytes), 0) AS total FROM cell_data")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    /// Delete expired negative entries. The only pass allowed to remove
    /// recently seen entries.
    pub async fn purge_expired_negatives(&self, now: DateTime<Utc>) -> Result<u64> {
        let removed = sqlx::query(
            "DELETE FROM cell_data WHERE is_negative = 1 AND expires_at IS NOT NULL
             AND expires_at <= ?",
        )
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.stats.write().await.evicted_negative_ttl += removed;
        Ok(removed)
    }

    /// Delete entries past maximum retention that have also dropped out of
    /// the environment.
    pub async fn evict_age(&self, now: DateTime<Utc>) -> Result<u64> {
        let age_cutoff = now - ChronoDuration::days(self.cfg.max_age_days);
        let removed = sqlx::query(
            "DELETE FROM cell_data WHERE cached_at < ? AND last_seen_at < ?",
        )
        .bind(age_cutoff.timestamp())
        .bind(self.recent_cutoff(now).timestamp())
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.stats.write().await.evicted_age += removed;
        Ok(removed)
    }

    /// Delete entries far from the current confirmed fix. Only runs when a
    /// fix is available.
    pub async fn evict_distance(
        &self,
        now: DateTime<Utc>,
        fix_lat: f64,
        fix_lon: f64,
    ) -> Result<u64> {
        let rows = sqlx::query(
            "SELECT key, lat, lon FROM cell_data
             WHERE lat IS NOT NULL AND lon IS NOT NULL AND last_seen_at < ?",
        )
        .bind(self.recent_cutoff(now).timestamp())
        .fetch_all(&self.pool)
        .await?;

        let limit_m = self.cfg.purge_distance_km * 1000.0;
        let mut removed = 0;
        for row in rows {
            let lat: f64 = row.get("lat");
            let lon: f64 = row.get("lon");
            if haversine_m(fix_lat, fix_lon, lat, lon) > limit_m {
                let key: String = row.get("key");
                if self.delete_key(&key).await? {
                    removed += 1;
                }
            }
        }
        self.stats.write().await.evicted_distance += removed;
        Ok(removed)
    }

    /// Enforce the size cap: not-recently-seen entries leave in
    /// least-recently-used order, negatives before positives, until the
    /// store is back under the eviction target.
    pub async fn evict_size_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let cap = self.cap_bytes();
        let target = (cap as f64 * self.cfg.size_evict_target) as i64;
        self.evict_size_to(now, cap, target).await
    }

    async fn evict_size_to(
        &self,
        now: DateTime<Utc>,
        cap_bytes: i64,
        target_bytes: i64,
    ) -> Result<u64> {
        let mut size = self.estimated_size_bytes().await?;
        if size <= cap_bytes {
            return Ok(0);
        }

        let candidates = sqlx::query(
            "SELECT key, size_bytes FROM cell_data WHERE last_seen_at < ?
             ORDER BY is_negative DESC, last_used_at ASC",
        )
        .bind(self.recent_cutoff(now).timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0;
        for row in candidates {
            if size <= target_bytes {
                break;
            }
            let key: String = row.get("key");
            let bytes: i64 = row.get("size_bytes");
            if self.delete_key(&key).await? {
                size -= bytes;
                removed += 1;
            }
        }
        if size > target_bytes {
            debug!(
                size,
                target_bytes, "size eviction exhausted candidates above target"
            );
        }
        self.stats.write().await.evicted_size += removed;
        Ok(removed)
    }

    /// The nightly maintenance cycle: age, distance, size, negative expiry.
    pub async fn run_maintenance(
        &self,
        now: DateTime<Utc>,
        last_fix: Option<(f64, f64)>,
    ) -> Result<()> {
        let age = self.evict_age(now).await?;
        let distance = match last_fix {
            Some((lat, lon)) => self.evict_distance(now, lat, lon).await?,
            None => 0,
        };
        let size = self.evict_size_at(now).await?;
        let negatives = self.purge_expired_negatives(now).await?;
        info!(
            age,
            distance,
            size,
            negatives,
            entries = self.entry_count().await?,
            "cache maintenance complete"
        );
        self.checkpoint_stats().await;
        Ok(())
    }

    pub async fn stats(&self) -> CacheStats {
        self.stats.read().await.clone()
    }

    /// Write the stats bucket. Runs periodically and at close.
    pub async fn checkpoint_stats(&self) {
        let snapshot = self.stats.read().await.clone();
        let raw = match serde_json::to_string(&snapshot) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to serialize cache stats");
                return;
            }
        };
        let result = sqlx::query("INSERT OR REPLACE INTO stats (key, value) VALUES (?, ?)")
            .bind(STATS_KEY)
            .bind(raw)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to checkpoint cache stats");
        }
    }

    pub async fn close(&self) {
        self.checkpoint_stats().await;
        self.pool.close().await;
    }

    async fn load_stats(pool: &SqlitePool) -> CacheStats {
        let row = sqlx::query("SELECT value FROM stats WHERE key = ?")
            .bind(STATS_KEY)
            .fetch_optional(pool)
            .await;
        match row {
            Ok(Some(row)) => {
                let raw: String = row.get("value");
                serde_json::from_str(&raw).unwrap_or_default()
            }
            _ => CacheStats::default(),
        }
    }

    async fn delete_key(&self, key: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM cell_data WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    fn recent_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::hours(self.cfg.recent_keep_hours)
    }

    fn cap_bytes(&self) -> i64 {
        (self.cfg.size_cap_mb as i64) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{RadioType, TowerLocation, TowerSource};
    use std::path::Path;

    fn config(dir: &Path) -> CacheConfig {
        CacheConfig {
            path: dir.join("opencellid_cache.db"),
            size_cap_mb: 25,
            size_evict_target: 0.8,
            max_age_days: 30,
            recent_keep_hours: 48,
            purge_distance_km: 300.0,
            negative_base_hours: 12,
            negative_jitter_min_hours: 10.0,
            negative_jitter_max_hours: 14.0,
            stats_checkpoint: Duration::from_secs(300),
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

    fn tower(id: CellId, lat: f64, lon: f64) -> TowerLocation {
        TowerLocation {
            id,
            lat,
            lon,
            range_m: 500.0,
            samples: 200,
            confidence: 0.9,
            source: TowerSource::Remote,
            changeable: true,
            updated_at: Utc::now(),
        }
    }

    async fn open(dir: &Path) -> CellCache {
        CellCache::open(config(dir)).await.unwrap()
    }

    #[tokio::test]
    async fn set_get_round_trip_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();

        let entry = CachedEntry::positive(&tower(cell(1), 59.33, 18.06), now);
        cache.set(&entry).await.unwrap();

        match cache.get_at(&cell(1), now).await.unwrap() {
            CacheLookup::Positive(got) => {
                assert_eq!(got.id, entry.id);
                assert_eq!(got.lat, entry.lat);
                assert_eq!(got.lon, entry.lon);
                assert_eq!(got.samples, entry.samples);
            }
            other => panic!("expected positive hit, got {other:?}"),
        }
        assert_eq!(cache.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        assert!(matches!(
            cache.get_at(&cell(42), Utc::now()).await.unwrap(),
            CacheLookup::Miss
        ));
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn negative_entry_hits_until_ttl_then_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();

        let expires = now + ChronoDuration::hours(24);
        cache
            .set(&CachedEntry::negative(cell(7), now, expires))
            .await
            .unwrap();

        assert!(matches!(
            cache.get_at(&cell(7), now + ChronoDuration::hours(1)).await.unwrap(),
            CacheLookup::Negative
        ));
        // Past the TTL the entry is deleted in place and reads as a miss.
        assert!(matches!(
            cache.get_at(&cell(7), now + ChronoDuration::hours(25)).await.unwrap(),
            CacheLookup::Miss
        ));
        assert_eq!(cache.entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn negative_expiry_stays_in_jitter_band() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();

        for _ in 0..50 {
            let expiry = cache.negative_expiry(now);
            let ttl_h = (expiry - now).num_seconds() as f64 / 3600.0;
            assert!(
                (22.0..=26.0).contains(&ttl_h),
                "TTL {ttl_h}h outside [base+jitter_min, base+jitter_max]"
            );
        }
    }

    #[tokio::test]
    async fn corrupt_entry_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO cell_data (key, value, cached_at, last_access,
             last_seen_at, last_used_at, access_count, is_negative, size_bytes)
             VALUES (?, 'not json', 0, 0, 0, 0, 0, 0, 8)",
        )
        .bind(cell(9).cache_key())
        .execute(&cache.pool)
        .await
        .unwrap();

        assert!(matches!(
            cache.get_at(&cell(9), now).await.unwrap(),
            CacheLookup::Miss
        ));
        assert_eq!(cache.stats().await.corrupt_dropped, 1);
        assert_eq!(cache.entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn age_eviction_spares_recently_seen() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();
        let old = now - ChronoDuration::days(45);

        let mut stale = CachedEntry::positive(&tower(cell(1), 59.0, 18.0), old);
        stale.last_seen_at = old;
        cache.set(&stale).await.unwrap();

        let mut seen = CachedEntry::positive(&tower(cell(2), 59.0, 18.0), old);
        seen.last_seen_at = now - ChronoDuration::hours(1);
        cache.set(&seen).await.unwrap();

        assert_eq!(cache.evict_age(now).await.unwrap(), 1);
        assert!(matches!(
            cache.get_at(&cell(1), now).await.unwrap(),
            CacheLookup::Miss
        ));
        assert!(matches!(
            cache.get_at(&cell(2), now).await.unwrap(),
            CacheLookup::Positive(_)
        ));
    }

    #[tokio::test]
    async fn distance_eviction_spares_near_and_recently_seen() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();
        let old_seen = now - ChronoDuration::hours(72);

        // Far away (Stockholm to Berlin is about 800 km) and not seen.
        let mut far = CachedEntry::positive(&tower(cell(1), 52.52, 13.40), now);
        far.last_seen_at = old_seen;
        cache.set(&far).await.unwrap();

        // Far away but recently seen: protected.
        let far_seen = CachedEntry::positive(&tower(cell(2), 52.52, 13.40), now);
        cache.set(&far_seen).await.unwrap();

        // Nearby and not seen: stays.
        let mut near = CachedEntry::positive(&tower(cell(3), 59.4, 18.1), now);
        near.last_seen_at = old_seen;
        cache.set(&near).await.unwrap();

        assert_eq!(cache.evict_distance(now, 59.33, 18.06).await.unwrap(), 1);
        assert!(matches!(
            cache.get_at(&cell(1), now).await.unwrap(),
            CacheLookup::Miss
        ));
        assert!(matches!(
            cache.get_at(&cell(2), now).await.unwrap(),
            CacheLookup::Positive(_)
        ));
        assert!(matches!(
            cache.get_at(&cell(3), now).await.unwrap(),
            CacheLookup::Positive(_)
        ));
    }

    #[tokio::test]
    async fn size_eviction_removes_oldest_used_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();
        let unseen = now - ChronoDuration::hours(72);

        for (cell_id, used_hours_ago) in [(1u64, 300i64), (2, 200), (3, 100)] {
            let mut entry = CachedEntry::positive(&tower(cell(cell_id), 59.0, 18.0), now);
            entry.last_seen_at = unseen;
            entry.last_used_at = now - ChronoDuration::hours(used_hours_ago);
            cache.set(&entry).await.unwrap();
        }
        // Recently seen entry is immune regardless of size pressure.
        let protected = CachedEntry::positive(&tower(cell(4), 59.0, 18.0), now);
        cache.set(&protected).await.unwrap();

        let size = cache.estimated_size_bytes().await.unwrap();
        // Cap below current size, target sized to force exactly two
        // evictions in last-used order.
        let target = size - 700;
        let removed = cache.evict_size_to(now, size - 1, target).await.unwrap();
        assert!(removed >= 1);

        // The least recently used entries go first.
        assert!(matches!(
            cache.get_at(&cell(1), now).await.unwrap(),
            CacheLookup::Miss
        ));
        assert!(matches!(
            cache.get_at(&cell(4), now).await.unwrap(),
            CacheLookup::Positive(_)
        ));
        assert!(cache.estimated_size_bytes().await.unwrap() <= target);
    }

    #[tokio::test]
    async fn size_eviction_prefers_negatives_at_equal_age() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();
        let unseen = now - ChronoDuration::hours(72);

        let mut positive = CachedEntry::positive(&tower(cell(1), 59.0, 18.0), now);
        positive.last_seen_at = unseen;
        positive.last_used_at = unseen;
        cache.set(&positive).await.unwrap();

        let mut negative =
            CachedEntry::negative(cell(2), now, now + ChronoDuration::hours(24));
        negative.last_seen_at = unseen;
        negative.last_used_at = unseen;
        cache.set(&negative).await.unwrap();

        let size = cache.estimated_size_bytes().await.unwrap();
        // Room for exactly one eviction.
        cache.evict_size_to(now, size - 1, size - 100).await.unwrap();

        assert!(matches!(
            cache.get_at(&cell(1), now).await.unwrap(),
            CacheLookup::Positive(_)
        ));
        assert!(matches!(
            cache.get_at(&cell(2), now).await.unwrap(),
            CacheLookup::Miss
        ));
    }

    #[tokio::test]
    async fn touch_seen_protects_and_touch_used_orders() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();
        let old = now - ChronoDuration::days(45);

        let mut entry = CachedEntry::positive(&tower(cell(1), 59.0, 18.0), old);
        entry.last_seen_at = old;
        cache.set(&entry).await.unwrap();

        cache.touch_seen(&cell(1), now).await.unwrap();
        assert_eq!(cache.evict_age(now).await.unwrap(), 0);

        cache.touch_used(&cell(1), now).await.unwrap();
        match cache.get_at(&cell(1), now).await.unwrap() {
            CacheLookup::Positive(_) => {}
            other => panic!("expected positive hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stats_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let cache = open(dir.path()).await;
            cache
                .set(&CachedEntry::positive(&tower(cell(1), 59.0, 18.0), now))
                .await
                .unwrap();
            let _ = cache.get_at(&cell(1), now).await.unwrap();
            cache.close().await;
        }
        let cache = open(dir.path()).await;
        let stats = cache.stats().await;
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn maintenance_runs_all_passes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path()).await;
        let now = Utc::now();

        let mut expired =
            CachedEntry::negative(cell(1), now - ChronoDuration::hours(30), now - ChronoDuration::hours(1));
        expired.last_seen_at = now - ChronoDuration::hours(72);
        cache.set(&expired).await.unwrap();

        cache.run_maintenance(now, Some((59.33, 18.06))).await.unwrap();
        assert_eq!(cache.entry_count().await.unwrap(), 0);
    }
}
