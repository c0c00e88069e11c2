//! Application configuration: a clap CLI mapped into typed config structs,
//! validated once at startup. Invalid policy parameters are fatal.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::errors::{LocationError, Result};

/// Primary application configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub arbitrator: ArbitratorConfig,
    pub scheduler: SchedulerConfig,
    pub resolver: ResolverConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub fuser: FuserConfig,
    pub contribution: ContributionConfig,
    pub provider: ProviderConfig,
    pub cellular: CellularConfig,
    pub service: ServiceConfig,
}

/// How the arbitrator picks among source results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// First successful collect wins.
    Traditional,
    /// Confidence-based with fallback across all sources.
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitratorConfig {
    /// Source names in preference order, most preferred first.
    pub priority: Vec<String>,
    pub selection_mode: SelectionMode,
    /// Accept immediately at or above this confidence.
    pub fallback_threshold: f64,
    /// Minimum confidence for a retained result to win outright.
    pub min_acceptable_confidence: f64,
    pub collect_timeout: Duration,
    pub collect_retries: u32,
    pub retry_delay: Duration,
    /// Reject fixes claiming worse accuracy than this, meters.
    pub max_accuracy_m: f64,
    /// Reject fixes older than this.
    pub max_fix_age: Duration,
    /// Displacement treated as movement, meters.
    pub movement_threshold_m: f64,
    /// How often source availability is re-evaluated.
    pub reevaluate_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    /// Fraction of the neighbor union that must change to trigger.
    pub tower_change_threshold: f64,
    /// Strongest-neighbor comparison depth.
    pub top_k: usize,
    /// New entries in the top-K set that count as a change.
    pub top_k_delta: usize,
    /// Resolution age that forces a refresh regardless of environment.
    pub hard_ttl: Duration,
    /// Minimum interval between triggers while moving.
    pub moving_floor: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub max_cells_per_lookup: usize,
    /// Attempts per identifier when the provider answers 429.
    pub backoff_attempts: u32,
    pub backoff_base: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub size_cap_mb: u64,
    /// Size eviction stops at this fraction of the cap.
    pub size_evict_target: f64,
    pub max_age_days: i64,
    /// Entries seen within this window are safe from eviction.
    pub recent_keep_hours: i64,
    pub purge_distance_km: f64,
    pub negative_base_hours: i64,
    pub negative_jitter_min_hours: f64,
    pub negative_jitter_max_hours: f64,
    pub stats_checkpoint: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_lookups_per_hour: u32,
    pub max_submissions_per_hour: u32,
    pub max_submissions_per_day: u32,
    /// Rolling-window lookups-per-submission ceiling. Provider policy caps
    /// this at 10.0.
    pub max_ratio: f64,
    pub window: Duration,
    /// Lookups allowed before the first submission.
    pub bootstrap_lookups: u32,
    pub min_trickle_per_hour: u32,
    /// Future-dated persisted entries beyond this are dropped on load.
    pub max_clock_skew: Duration,
    pub state_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuserConfig {
    pub min_accuracy_m: f64,
    pub max_accuracy_m: f64,
    pub max_towers: usize,
    pub min_movement_distance_m: f64,
    pub accuracy_regression_limit: f64,
    pub accuracy_improvement: f64,
    pub chi_square_limit: f64,
    /// Consecutive accepted fixes before the position is reported stable.
    pub good_fixes_required: u32,
    pub max_speed_kmh: f64,
    pub ema_alpha: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionConfig {
    pub enabled: bool,
    pub min_gps_accuracy_m: f64,
    pub movement_threshold_m: f64,
    pub rsrp_delta_db: i32,
    /// Deduplication grid pitch, meters.
    pub grid_m: f64,
    pub batch_size: usize,
    pub burst_delay: Duration,
    pub queue_max: usize,
    pub stationary_max_interval: Duration,
    pub stationary_global_cap_per_hour: u32,
    pub queue_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub lookup_url: Option<String>,
    pub api_key: Option<String>,
    pub contribute_url: Option<String>,
    pub contribute_token: Option<String>,
    /// Operator triangulation endpoints, tried in order.
    pub triangulation_urls: Vec<String>,
    pub elevation_url: Option<String>,
    /// Local satellite-terminal status APIs, tried in order.
    pub satellite_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellularConfig {
    pub enabled: bool,
    /// Path to the cell modem AT device.
    pub device: PathBuf,
    /// Secondary AT port used for modem GNSS reads, when present.
    pub gnss_device: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub scan_interval: Duration,
    pub maintenance_interval: Duration,
    pub run_once: bool,
    /// How long in-flight collects may finish during shutdown.
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Self {
        let arbitrator = ArbitratorConfig {
            priority: cli
                .source_priority
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            selection_mode: cli.selection_mode,
            fallback_threshold: cli.fallback_threshold,
            min_acceptable_confidence: cli.min_acceptable_confidence,
            collect_timeout: Duration::from_secs(cli.collection_timeout),
            collect_retries: cli.max_retries,
            retry_delay: Duration::from_secs(cli.retry_delay),
            max_accuracy_m: cli.max_accuracy_m,
            max_fix_age: Duration::from_secs(cli.max_fix_age),
            movement_threshold_m: cli.movement_threshold_m,
            reevaluate_interval: Duration::from_secs(cli.reevaluate_interval),
        };

        let scheduler = SchedulerConfig {
            debounce: Duration::from_secs(cli.debounce_time),
            tower_change_threshold: cli.tower_change_threshold,
            top_k: 5,
            top_k_delta: 2,
            hard_ttl: Duration::from_secs(cli.cache_hard_ttl_min * 60),
            moving_floor: Duration::from_secs(300),
        };

        let resolver = ResolverConfig {
            max_cells_per_lookup: cli.max_cells_per_lookup,
            backoff_attempts: 3,
            backoff_base: Duration::from_secs(cli.retry_delay),
        };

        let cache = CacheConfig {
            path: PathBuf::from(&cli.cache_path),
            size_cap_mb: cli.cache_size_cap_mb,
            size_evict_target: 0.8,
            max_age_days: cli.cache_max_age_days,
            recent_keep_hours: cli.recent_keep_hours,
            purge_distance_km: cli.purge_distance_km,
            negative_base_hours: 12,
            negative_jitter_min_hours: 10.0,
            negative_jitter_max_hours: 14.0,
            stats_checkpoint: Duration::from_secs(300),
        };

        let rate_limit = RateLimitConfig {
            max_lookups_per_hour: cli.max_lookups_per_hour,
            max_submissions_per_hour: cli.max_submissions_per_hour,
            max_submissions_per_day: cli.max_submissions_per_day,
            max_ratio: cli.max_lookup_ratio,
            window: Duration::from_secs(cli.ratio_window_hours * 3600),
            bootstrap_lookups: 10,
            min_trickle_per_hour: 1,
            max_clock_skew: Duration::from_secs(15 * 60),
            state_path: PathBuf::from(&cli.rate_limit_state_path),
        };

        let fuser = FuserConfig {
            min_accuracy_m: 50.0,
            max_accuracy_m: 10_000.0,
            max_towers: 5,
            min_movement_distance_m: cli.min_movement_distance_m,
            accuracy_regression_limit: cli.accuracy_regression_limit,
            accuracy_improvement: 0.8,
            chi_square_limit: 5.99,
            good_fixes_required: 3,
            max_speed_kmh: cli.max_speed_kmh,
            ema_alpha: 0.3,
        };

        let contribution = ContributionConfig {
            enabled: cli.enable_contributions,
            min_gps_accuracy_m: 20.0,
            movement_threshold_m: 250.0,
            rsrp_delta_db: 6,
            grid_m: cli.contribution_grid_m,
            batch_size: 3,
            burst_delay: Duration::from_millis(2000),
            queue_max: 100,
            stationary_max_interval: Duration::from_secs(3 * 3600),
            stationary_global_cap_per_hour: 2,
            queue_path: cli
                .contribution_queue_path
                .as_ref()
                .map(PathBuf::from),
        };

        let provider = ProviderConfig {
            lookup_url: cli.lookup_url.clone(),
            api_key: cli.api_key.clone(),
            contribute_url: cli.contribute_url.clone(),
            contribute_token: cli.contribute_token.clone(),
            triangulation_urls: split_urls(&cli.triangulation_urls),
            elevation_url: cli.elevation_url.clone(),
            satellite_urls: split_urls(&cli.satellite_urls),
        };

        let cellular = CellularConfig {
            enabled: cli.enable_cell,
            device: PathBuf::from(&cli.cell_device),
            gnss_device: cli.gnss_device.as_ref().map(PathBuf::from),
        };

        let service = ServiceConfig {
            scan_interval: Duration::from_secs(cli.scan_interval),
            maintenance_interval: Duration::from_secs(cli.maintenance_interval_hours * 3600),
            run_once: cli.run_once,
            shutdown_grace: Duration::from_secs(5),
        };

        Self {
            arbitrator,
            scheduler,
            resolver,
            cache,
            rate_limit,
            fuser,
            contribution,
            provider,
            cellular,
            service,
        }
    }

    /// Fatal-at-init validation of policy parameters.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.max_ratio <= 0.0 || self.rate_limit.max_ratio > 10.0 {
            return Err(LocationError::Config(format!(
                "lookup ratio must be in (0, 10], got {}",
                self.rate_limit.max_ratio
            )));
        }
        if self.cache.negative_jitter_min_hours > self.cache.negative_jitter_max_hours
            || self.cache.negative_jitter_min_hours < 0.0
        {
            return Err(LocationError::Config(format!(
                "invalid negative-cache jitter range [{}, {}]",
                self.cache.negative_jitter_min_hours, self.cache.negative_jitter_max_hours
            )));
        }
        if self.provider.lookup_url.is_some() && self.provider.api_key.is_none() {
            return Err(LocationError::Config(
                "cell lookups configured without an API key".into(),
            ));
        }
        if self.provider.contribute_url.is_some() && self.provider.contribute_token.is_none() {
            return Err(LocationError::Config(
                "contributions configured without a token".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.arbitrator.fallback_threshold)
            || !(0.0..=1.0).contains(&self.arbitrator.min_acceptable_confidence)
        {
            return Err(LocationError::Config(
                "confidence thresholds must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fuser.ema_alpha) {
            return Err(LocationError::Config("EMA alpha must be in [0, 1]".into()));
        }
        Ok(())
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// CLI parser using clap. Defaults follow the provider policy and the
// shipped service unit.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[arg(
        long = "source-priority",
        default_value = "gnss,satellite,modem_gnss,triangulation,cell_resolver",
        help = "Comma-separated source names in preference order"
    )]
    pub source_priority: String,

    #[arg(
        long = "selection-mode",
        value_enum,
        default_value = "hybrid",
        help = "How the arbitrator picks among source results"
    )]
    pub selection_mode: SelectionMode,

    #[arg(
        long = "fallback-threshold",
        default_value = "0.7",
        help = "Accept a source result immediately at or above this confidence"
    )]
    pub fallback_threshold: f64,

    #[arg(
        long = "min-confidence",
        default_value = "0.5",
        help = "Minimum confidence for a retained result to win outright"
    )]
    pub min_acceptable_confidence: f64,

    #[arg(
        long = "collection-timeout",
        default_value = "30",
        help = "Timeout in seconds for one source collection"
    )]
    pub collection_timeout: u64,

    #[arg(
        long = "max-retries",
        default_value = "3",
        help = "Attempts per source before giving up on it for this cycle"
    )]
    pub max_retries: u32,

    #[arg(
        long = "retry-delay",
        default_value = "2",
        help = "Pause in seconds between attempts"
    )]
    pub retry_delay: u64,

    #[arg(
        long = "max-accuracy",
        default_value = "10000",
        help = "Reject fixes with worse accuracy than this many meters"
    )]
    pub max_accuracy_m: f64,

    #[arg(
        long = "max-fix-age",
        default_value = "60",
        help = "Reject fixes older than this many seconds"
    )]
    pub max_fix_age: u64,

    #[arg(
        long = "movement-threshold",
        default_value = "100",
        help = "Displacement in meters treated as movement"
    )]
    pub movement_threshold_m: f64,

    #[arg(
        long = "reevaluate-interval",
        default_value = "60",
        help = "Seconds between source availability re-evaluations"
    )]
    pub reevaluate_interval: u64,

    #[arg(
        long = "debounce-time",
        default_value = "10",
        help = "Seconds to wait before confirming an environment change"
    )]
    pub debounce_time: u64,

    #[arg(
        long = "tower-change-threshold",
        default_value = "0.35",
        help = "Fraction of neighbor towers that must change to trigger a query"
    )]
    pub tower_change_threshold: f64,

    #[arg(
        long = "cache-hard-ttl",
        default_value = "60",
        help = "Minutes before a cached resolution must be refreshed"
    )]
    pub cache_hard_ttl_min: u64,

    #[arg(
        long = "max-cells-per-lookup",
        default_value = "5",
        help = "Upper bound on identifiers resolved per request"
    )]
    pub max_cells_per_lookup: usize,

    #[arg(
        long = "cache-path",
        default_value = "/overlay/ridge-location/opencellid_cache.db",
        help = "Path to the on-disk cell cache"
    )]
    pub cache_path: String,

    #[arg(
        long = "cache-size-cap",
        default_value = "25",
        help = "Cell cache size cap in megabytes"
    )]
    pub cache_size_cap_mb: u64,

    #[arg(
        long = "cache-max-age",
        default_value = "30",
        help = "Days a cached tower may live without being seen"
    )]
    pub cache_max_age_days: i64,

    #[arg(
        long = "recent-keep-hours",
        default_value = "48",
        help = "Entries seen within this many hours are never evicted"
    )]
    pub recent_keep_hours: i64,

    #[arg(
        long = "purge-distance",
        default_value = "300",
        help = "Evict towers farther than this many km from the current fix"
    )]
    pub purge_distance_km: f64,

    #[arg(
        long = "max-lookups-per-hour",
        default_value = "30",
        help = "Hard hourly ceiling on provider lookups"
    )]
    pub max_lookups_per_hour: u32,

    #[arg(
        long = "max-submissions-per-hour",
        default_value = "6",
        help = "Hard hourly ceiling on provider submissions"
    )]
    pub max_submissions_per_hour: u32,

    #[arg(
        long = "max-submissions-per-day",
        default_value = "50",
        help = "Hard daily ceiling on provider submissions"
    )]
    pub max_submissions_per_day: u32,

    #[arg(
        long = "max-lookup-ratio",
        default_value = "8.0",
        help = "Rolling lookups-per-submission ceiling (provider policy caps at 10)"
    )]
    pub max_lookup_ratio: f64,

    #[arg(
        long = "ratio-window",
        default_value = "48",
        help = "Rolling ratio window in hours"
    )]
    pub ratio_window_hours: u64,

    #[arg(
        long = "rate-limit-state",
        default_value = "/overlay/ridge-location/rate_limiter_state.json",
        help = "Path to the persisted rate-limiter state"
    )]
    pub rate_limit_state_path: String,

    #[arg(
        long = "min-movement-distance",
        default_value = "300",
        help = "Meters of movement that bypass the accuracy-regression gate"
    )]
    pub min_movement_distance_m: f64,

    #[arg(
        long = "accuracy-regression-limit",
        default_value = "1.2",
        help = "Largest tolerated new/previous accuracy ratio"
    )]
    pub accuracy_regression_limit: f64,

    #[arg(
        long = "max-speed",
        default_value = "160",
        help = "Reject fixes implying ground speed above this many km/h"
    )]
    pub max_speed_kmh: f64,

    #[arg(
        long = "enable-contributions",
        default_value = "false",
        help = "Queue eligible observations for return to the provider"
    )]
    pub enable_contributions: bool,

    #[arg(
        long = "contribution-grid-m",
        default_value = "75",
        help = "Deduplication grid pitch in meters"
    )]
    pub contribution_grid_m: f64,

    #[arg(
        long = "contribution-queue-path",
        help = "Optional path to persist the contribution queue"
    )]
    pub contribution_queue_path: Option<String>,

    #[arg(long = "lookup-url", help = "Cell lookup endpoint")]
    pub lookup_url: Option<String>,

    #[arg(
        long = "api-key",
        env = "RIDGE_LOCATION_API_KEY",
        help = "API key for the cell lookup endpoint"
    )]
    pub api_key: Option<String>,

    #[arg(long = "contribute-url", help = "Cell contribution endpoint")]
    pub contribute_url: Option<String>,

    #[arg(
        long = "contribute-token",
        env = "RIDGE_LOCATION_CONTRIBUTE_TOKEN",
        help = "Token for the contribution endpoint"
    )]
    pub contribute_token: Option<String>,

    #[arg(
        long = "triangulation-urls",
        default_value = "",
        help = "Comma-separated operator triangulation endpoints"
    )]
    pub triangulation_urls: String,

    #[arg(long = "elevation-url", help = "Elevation endpoint")]
    pub elevation_url: Option<String>,

    #[arg(
        long = "satellite-urls",
        default_value = "",
        help = "Comma-separated local satellite-terminal status APIs"
    )]
    pub satellite_urls: String,

    #[arg(
        long = "enable-cell",
        default_value = "true",
        help = "Enable cell modem scanning"
    )]
    pub enable_cell: bool,

    #[arg(
        long = "cell-device",
        default_value = "/dev/ttyUSB2",
        help = "Path to the cell modem AT device"
    )]
    pub cell_device: String,

    #[arg(long = "gnss-device", help = "AT port used for modem GNSS reads")]
    pub gnss_device: Option<String>,

    #[arg(
        long = "scan-interval",
        default_value = "30",
        help = "Seconds between cellular environment scans"
    )]
    pub scan_interval: u64,

    #[arg(
        long = "maintenance-interval",
        default_value = "24",
        help = "Hours between full cache maintenance passes"
    )]
    pub maintenance_interval_hours: u64,

    #[arg(
        long = "run-once",
        default_value = "false",
        help = "Run one collection cycle and exit"
    )]
    pub run_once: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_defaults() -> Config {
        Config::from_cli(&Cli::parse_from(["ridge-locationd"]))
    }

    #[test]
    fn defaults_follow_provider_policy() {
        let cfg = config_with_defaults();
        assert_eq!(cfg.rate_limit.max_lookups_per_hour, 30);
        assert_eq!(cfg.rate_limit.max_submissions_per_hour, 6);
        assert_eq!(cfg.rate_limit.max_submissions_per_day, 50);
        assert_eq!(cfg.rate_limit.max_ratio, 8.0);
        assert_eq!(cfg.rate_limit.window, Duration::from_secs(48 * 3600));
        assert_eq!(cfg.cache.size_cap_mb, 25);
        assert_eq!(cfg.contribution.grid_m, 75.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn ratio_above_provider_policy_is_fatal() {
        let mut cfg = config_with_defaults();
        cfg.rate_limit.max_ratio = 10.5;
        assert!(matches!(
            cfg.validate(),
            Err(LocationError::Config(_))
        ));
    }

    #[test]
    fn inverted_jitter_range_is_fatal() {
        let mut cfg = config_with_defaults();
        cfg.cache.negative_jitter_min_hours = 14.0;
        cfg.cache.negative_jitter_max_hours = 10.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn lookup_without_key_is_fatal() {
        let mut cfg = config_with_defaults();
        cfg.provider.lookup_url = Some("https://provider.example/cell".into());
        cfg.provider.api_key = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn priority_list_is_parsed_in_order() {
        let cfg = Config::from_cli(&Cli::parse_from([
            "ridge-locationd",
            "--source-priority",
            "satellite, gnss",
        ]));
        assert_eq!(cfg.arbitrator.priority, vec!["satellite", "gnss"]);
    }
}
