//! Core data model: cell identifiers, observations, resolved towers, cache
//! entries, and the standardized fix passed upstream.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{LocationError, Result};

/// Meters of round-trip distance represented by one timing-advance unit.
pub const TA_UNIT_METERS: f64 = 78.125;

/// Largest timing-advance value a modem can report.
pub const TA_MAX: u32 = 1282;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RadioType {
    Gsm,
    Umts,
    Lte,
    Nr,
}

impl RadioType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RadioType::Gsm => "gsm",
            RadioType::Umts => "umts",
            RadioType::Lte => "lte",
            RadioType::Nr => "nr",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gsm" => Ok(RadioType::Gsm),
            // Modems report WCDMA for the UMTS family.
            "umts" | "wcdma" => Ok(RadioType::Umts),
            "lte" => Ok(RadioType::Lte),
            "nr" | "nr5g" => Ok(RadioType::Nr),
            other => Err(LocationError::InvalidCellIdentifier(format!(
                "unknown radio technology '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RadioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The 5-tuple uniquely naming a radio cell. Equal iff all five fields match.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CellId {
    pub mcc: u16,
    pub mnc: u16,
    pub lac: u32,
    pub cell: u64,
    pub radio: RadioType,
}

impl CellId {
    /// Canonical serialized key form: the five fields joined by ':'.
    /// Stable across runs; used as the cache key.
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.mcc, self.mnc, self.lac, self.cell, self.radio
        )
    }

    pub fn parse(key: &str) -> Result<Self> {
        let fields: Vec<&str> = key.split(':').collect();
        if fields.len() != 5 {
            return Err(LocationError::InvalidCellIdentifier(format!(
                "expected 5 fields, got {} in '{key}'",
                fields.len()
            )));
        }
        let bad = |field: &str| {
            LocationError::InvalidCellIdentifier(format!("bad {field} in '{key}'"))
        };
        Ok(CellId {
            mcc: fields[0].parse().map_err(|_| bad("mcc"))?,
            mnc: fields[1].parse().map_err(|_| bad("mnc"))?,
            lac: fields[2].parse().map_err(|_| bad("lac"))?,
            cell: fields[3].parse().map_err(|_| bad("cell"))?,
            radio: RadioType::parse(fields[4])?,
        })
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

/// The cell the device is currently attached to, with measured signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServingCell {
    pub id: CellId,
    /// Received power, dBm.
    pub rsrp: Option<i32>,
    pub rsrq: Option<i32>,
    pub sinr: Option<i32>,
    /// 0..=1282; one unit is 78.125 m of round-trip distance.
    pub timing_advance: Option<u32>,
    pub band: Option<String>,
    pub arfcn: Option<u32>,
    pub pcid: Option<u32>,
}

/// An observed but not attached cell. May not carry a full identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborCell {
    pub id: Option<CellId>,
    pub pcid: Option<u32>,
    pub arfcn: Option<u32>,
    pub rsrp: Option<i32>,
    pub rsrq: Option<i32>,
}

impl NeighborCell {
    /// Identity used for environment comparison when the full 5-tuple is
    /// unknown: full key if present, otherwise physical id + channel.
    pub fn observation_key(&self) -> String {
        match &self.id {
            Some(id) => id.cache_key(),
            None => format!(
                "pci{}@{}",
                self.pcid.map_or("-".to_string(), |p| p.to_string()),
                self.arfcn.map_or("-".to_string(), |a| a.to_string())
            ),
        }
    }
}

/// One observed Wi-Fi access point, for triangulation requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub bssid: String,
    pub signal_dbm: i32,
    pub frequency_mhz: Option<u32>,
    pub ssid: Option<String>,
}

/// Link metrics for the serving cell, independent of identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellularMetrics {
    pub rssi: Option<i32>,
    pub rsrp: Option<i32>,
    pub rsrq: Option<i32>,
    pub sinr: Option<i32>,
    pub band: Option<String>,
    pub network_type: Option<String>,
}

/// One scan of the cellular environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellEnvironment {
    pub serving: ServingCell,
    pub neighbors: Vec<NeighborCell>,
    pub scanned_at: DateTime<Utc>,
}

/// Coarse movement state derived from consecutive accepted fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementState {
    #[default]
    Unknown,
    Moving,
    Stationary,
}

/// Where a resolved tower location came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TowerSource {
    Cache,
    Remote,
    Negative,
}

/// A cell identifier resolved to coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TowerLocation {
    pub id: CellId,
    pub lat: f64,
    pub lon: f64,
    /// Stated accuracy radius, meters.
    pub range_m: f64,
    pub samples: u32,
    /// 0.0..=1.0
    pub confidence: f64,
    pub source: TowerSource,
    /// The provider may revise this tower's position later.
    pub changeable: bool,
    pub updated_at: DateTime<Utc>,
}

/// A tower resolution as persisted in the cache.
///
/// `last_seen_at` and `last_used_at` are distinct on purpose: seen means the
/// scanner observed the cell, used means it contributed to a fix. Entries
/// that are seen but never used are the first to go when space is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub id: CellId,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub range_m: f64,
    pub samples: u32,
    pub confidence: f64,
    pub changeable: bool,
    pub updated_at: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub access_count: u64,
    /// Confirmed-unknown cell; records that the provider had no answer.
    pub is_negative: bool,
    /// Expiry of a negative entry. Positive entries have no TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedEntry {
    pub fn positive(tower: &TowerLocation, now: DateTime<Utc>) -> Self {
        CachedEntry {
            id: tower.id,
            lat: Some(tower.lat),
            lon: Some(tower.lon),
            range_m: tower.range_m,
            samples: tower.samples,
            confidence: tower.confidence,
            changeable: tower.changeable,
            updated_at: tower.updated_at,
            cached_at: now,
            last_access: now,
            last_seen_at: now,
            last_used_at: now,
            access_count: 0,
            is_negative: false,
            expires_at: None,
        }
    }

    /// A negative entry never reports coordinates.
    pub fn negative(id: CellId, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        CachedEntry {
            id,
            lat: None,
            lon: None,
            range_m: 0.0,
            samples: 0,
            confidence: 0.0,
            changeable: false,
            updated_at: now,
            cached_at: now,
            last_access: now,
            last_seen_at: now,
            last_used_at: now,
            access_count: 0,
            is_negative: true,
            expires_at: Some(expires_at),
        }
    }

    pub fn to_tower(&self) -> Option<TowerLocation> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if !self.is_negative => Some(TowerLocation {
                id: self.id,
                lat,
                lon,
                range_m: self.range_m,
                samples: self.samples,
                confidence: self.confidence,
                source: TowerSource::Cache,
                changeable: self.changeable,
                updated_at: self.updated_at,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixType {
    None,
    #[serde(rename = "2d")]
    TwoD,
    #[serde(rename = "3d")]
    ThreeD,
    Dgps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl FixQuality {
    /// Grade by horizontal accuracy.
    pub fn from_accuracy(accuracy_m: f64) -> Self {
        if accuracy_m <= 10.0 {
            FixQuality::Excellent
        } else if accuracy_m <= 50.0 {
            FixQuality::Good
        } else if accuracy_m <= 500.0 {
            FixQuality::Fair
        } else {
            FixQuality::Poor
        }
    }
}

/// The standardized fix every source produces and the host consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoFix {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: Option<f64>,
    pub accuracy_m: f64,
    pub speed_kmh: Option<f64>,
    pub course_deg: Option<f64>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
    pub fix_type: FixType,
    pub quality: FixQuality,
    pub satellites: Option<u32>,
    /// Which source produced this fix.
    pub source: String,
    /// How the position was derived (single_cell, weighted_centroid, ...).
    pub method: String,
    /// Every data source that contributed.
    pub contributors: Vec<String>,
    pub valid: bool,
    /// 0.0..=1.0
    pub confidence: f64,
    pub collection_ms: u64,
    pub from_cache: bool,
    pub api_call_made: bool,
    /// Estimated number of billable provider calls this fix cost.
    pub api_cost: f64,
    pub timestamp: DateTime<Utc>,
}

impl GeoFix {
    /// A fix with only position and accuracy filled in; sources complete the
    /// rest.
    pub fn basic(lat: f64, lon: f64, accuracy_m: f64, source: &str) -> Self {
        GeoFix {
            lat,
            lon,
            altitude_m: None,
            accuracy_m,
            speed_kmh: None,
            course_deg: None,
            hdop: None,
            vdop: None,
            fix_type: FixType::TwoD,
            quality: FixQuality::from_accuracy(accuracy_m),
            satellites: None,
            source: source.to_string(),
            method: String::new(),
            contributors: vec![source.to_string()],
            valid: true,
            confidence: 0.5,
            collection_ms: 0,
            from_cache: false,
            api_call_made: false,
            api_cost: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// One position read from a GNSS receiver (on-device or modem-hosted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GnssReading {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: Option<f64>,
    pub accuracy_m: f64,
    pub satellites: u32,
    pub fix_type: FixType,
    pub hdop: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub course_deg: Option<f64>,
}

/// GPS position captured at the moment a cell was observed, for
/// contributions back to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsObservation {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_m: f64,
    pub speed_kmh: Option<f64>,
    pub heading_deg: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// One observation eligible for return to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionObservation {
    pub serving: ServingCell,
    pub neighbors: Vec<NeighborCell>,
    pub gps: GpsObservation,
    pub metrics: Option<CellularMetrics>,
}
