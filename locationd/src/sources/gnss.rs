//! GNSS-backed sources. One source type serves both the on-device receiver
//! and the modem-hosted one; they differ only in name, priority, and the
//! [`GnssReceiver`] behind them.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::data::{FixQuality, FixType, GeoFix, GnssReading};
use crate::errors::{LocationError, Result};
use crate::sources::{CollectContext, HealthMeter, LocationSource};

/// Abstract receiver: one read returning a position or a typed error.
#[async_trait]
pub trait GnssReceiver: Send + Sync {
    /// Whether the hardware is present at all. Cheap, no I/O.
    fn is_present(&self) -> bool;

    async fn read_position(&self) -> Result<GnssReading>;
}

pub struct GnssSource {
    name: String,
    priority: u32,
    receiver: Arc<dyn GnssReceiver>,
    meter: HealthMeter,
}

impl GnssSource {
    pub fn new(name: impl Into<String>, priority: u32, receiver: Arc<dyn GnssReceiver>) -> Self {
        Self {
            name: name.into(),
            priority,
            receiver,
            meter: HealthMeter::default(),
        }
    }
}

/// Confidence from fix dimension and satellite count. GNSS is trusted when
/// it locks; a weak 2-D fix still beats most cell estimates.
fn confidence_for(reading: &GnssReading) -> f64 {
    match reading.fix_type {
        FixType::ThreeD | FixType::Dgps if reading.satellites >= 6 => 0.95,
        FixType::ThreeD | FixType::Dgps => 0.9,
        FixType::TwoD => 0.7,
        FixType::None => 0.0,
    }
}

#[async_trait]
impl LocationSource for GnssSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn available(&self, _ctx: &CollectContext) -> bool {
        self.receiver.is_present()
    }

    async fn collect(&self, _ctx: &CollectContext) -> Result<GeoFix> {
        let started = Instant::now();
        let reading = self.receiver.read_position().await?;
        if reading.fix_type == FixType::None {
            return Err(LocationError::GnssRead("receiver has no fix".into()));
        }
        debug!(
            source = %self.name,
            satellites = reading.satellites,
            accuracy = reading.accuracy_m,
            "GNSS position read"
        );

        Ok(GeoFix {
            lat: reading.lat,
            lon: reading.lon,
            altitude_m: reading.altitude_m,
            accuracy_m: reading.accuracy_m,
            speed_kmh: reading.speed_kmh,
            course_deg: reading.course_deg,
            hdop: reading.hdop,
            vdop: None,
            fix_type: reading.fix_type,
            quality: FixQuality::from_accuracy(reading.accuracy_m),
            satellites: Some(reading.satellites),
            source: self.name.clone(),
            method: "gnss".to_string(),
            contributors: vec![self.name.clone()],
            valid: true,
            confidence: confidence_for(&reading),
            collection_ms: started.elapsed().as_millis() as u64,
            from_cache: false,
            api_call_made: false,
            api_cost: 0.0,
            timestamp: Utc::now(),
        })
    }

    fn meter(&self) -> &HealthMeter {
        &self.meter
    }
}
