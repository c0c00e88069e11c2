//! Remote Wi-Fi/cell triangulation source. Builds a request from the
//! current cellular environment (plus Wi-Fi access points when a scanner is
//! wired in) and tries the configured operator endpoints in order.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use ridge_geolocation_api::{CellTowerQuery, TriangulationClient, WifiAccessPointQuery};
use tracing::debug;

use crate::cell::CellularDataCollector;
use crate::data::{CellEnvironment, FixQuality, FixType, GeoFix, WifiNetwork};
use crate::errors::{LocationError, Result};
use crate::sources::{CollectContext, HealthMeter, LocationSource};

/// Optional Wi-Fi scan capability. The scanner itself is a collaborator.
#[async_trait]
pub trait WifiObserver: Send + Sync {
    async fn access_points(&self) -> Result<Vec<WifiNetwork>>;
}

pub struct TriangulationSource {
    priority: u32,
    collector: Arc<dyn CellularDataCollector>,
    wifi: Option<Arc<dyn WifiObserver>>,
    clients: Vec<TriangulationClient>,
    meter: HealthMeter,
}

impl TriangulationSource {
    pub fn new(
        priority: u32,
        collector: Arc<dyn CellularDataCollector>,
        wifi: Option<Arc<dyn WifiObserver>>,
        clients: Vec<TriangulationClient>,
    ) -> Self {
        Self {
            priority,
            collector,
            wifi,
            clients,
            meter: HealthMeter::default(),
        }
    }
}

fn towers_from_environment(env: &CellEnvironment) -> Vec<CellTowerQuery> {
    let serving = &env.serving;
    let mut towers = vec![CellTowerQuery {
        cell_id: serving.id.cell,
        location_area_code: serving.id.lac,
        mobile_country_code: serving.id.mcc,
        mobile_network_code: serving.id.mnc,
        radio_type: Some(serving.id.radio.as_str().to_string()),
        signal_strength: serving.rsrp,
        timing_advance: serving.timing_advance,
    }];
    // Neighbors only help when they carry a full identifier.
    for neighbor in &env.neighbors {
        if let Some(id) = neighbor.id {
            towers.push(CellTowerQuery {
                cell_id: id.cell,
                location_area_code: id.lac,
                mobile_country_code: id.mcc,
                mobile_network_code: id.mnc,
                radio_type: Some(id.radio.as_str().to_string()),
                signal_strength: neighbor.rsrp,
                timing_advance: None,
            });
        }
    }
    towers
}

fn confidence_for(accuracy_m: f64) -> f64 {
    if accuracy_m <= 100.0 {
        0.8
    } else if accuracy_m <= 500.0 {
        0.7
    } else {
        0.55
    }
}

#[async_trait]
impl LocationSource for TriangulationSource {
    fn name(&self) -> &str {
        "triangulation"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn available(&self, _ctx: &CollectContext) -> bool {
        !self.clients.is_empty()
    }

    async fn collect(&self, _ctx: &CollectContext) -> Result<GeoFix> {
        let started = Instant::now();
        let env = self.collector.scan().await?;
        let towers = towers_from_environment(&env);

        let access_points: Vec<WifiAccessPointQuery> = match &self.wifi {
            Some(observer) => observer
                .access_points()
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|ap| WifiAccessPointQuery {
                    mac_address: ap.bssid,
                    signal_strength: ap.signal_dbm,
                    channel: ap.frequency_mhz,
                })
                .collect(),
            None => Vec::new(),
        };

        let mut last_error = String::from("no triangulation endpoints configured");
        for client in &self.clients {
            match client.locate(&towers, &access_points).await {
                Ok(reply) => {
                    debug!(
                        accuracy = reply.accuracy,
                        towers = towers.len(),
                        wifi = access_points.len(),
                        "triangulation answered"
                    );
                    return Ok(GeoFix {
                        lat: reply.lat,
                        lon: reply.lon,
                        altitude_m: None,
                        accuracy_m: reply.accuracy,
                        speed_kmh: None,
                        course_deg: None,
                        hdop: None,
                        vdop: None,
                        fix_type: FixType::TwoD,
                        quality: FixQuality::from_accuracy(reply.accuracy),
                        satellites: None,
                        source: "triangulation".to_string(),
                        method: "triangulation_api".to_string(),
                        contributors: vec!["triangulation".to_string()],
                        valid: true,
                        confidence: confidence_for(reply.accuracy),
                        collection_ms: started.elapsed().as_millis() as u64,
                        from_cache: false,
                        api_call_made: true,
                        api_cost: 1.0,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    debug!(error = %e, "triangulation endpoint failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(LocationError::RemoteUnavailable(last_error))
    }

    fn meter(&self) -> &HealthMeter {
        &self.meter
    }
}
