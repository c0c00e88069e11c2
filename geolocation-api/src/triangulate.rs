//! Operator triangulation endpoint.
//!
//! A POST carrying the currently observed cell towers and Wi-Fi access
//! points; the operator answers with a position and an accuracy, or a
//! structured error body.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::error::{ApiError, Result};

#[derive(Debug, Serialize)]
struct TriangulationRequest<'a> {
    #[serde(skip_serializing_if = "<[_]>::is_empty", rename = "cellTowers")]
    cell_towers: &'a [CellTowerQuery],
    #[serde(skip_serializing_if = "<[_]>::is_empty", rename = "wifiAccessPoints")]
    wifi_access_points: &'a [WifiAccessPointQuery],
}

#[derive(Debug, Clone, Serialize)]
pub struct CellTowerQuery {
    #[serde(rename = "cellId")]
    pub cell_id: u64,
    #[serde(rename = "locationAreaCode")]
    pub location_area_code: u32,
    #[serde(rename = "mobileCountryCode")]
    pub mobile_country_code: u16,
    #[serde(rename = "mobileNetworkCode")]
    pub mobile_network_code: u16,
    #[serde(skip_serializing_if = "Option::is_none", rename = "radioType")]
    pub radio_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "signalStrength")]
    pub signal_strength: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "timingAdvance")]
    pub timing_advance: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WifiAccessPointQuery {
    #[serde(rename = "macAddress")]
    pub mac_address: String,
    #[serde(rename = "signalStrength")]
    pub signal_strength: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TriangulationLocation {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TriangulationReply {
    Success {
        location: TriangulationLocation,
        accuracy: f64,
    },
    Error {
        error: ProviderErrorBody,
    },
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    code: i32,
    message: String,
}

#[derive(Debug)]
pub struct TriangulationResponse {
    pub lat: f64,
    pub lon: f64,
    pub accuracy: f64,
}

pub struct TriangulationClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl TriangulationClient {
    pub fn new(http: reqwest::Client, endpoint: Url) -> Self {
        Self { http, endpoint }
    }

    pub async fn locate(
        &self,
        cell_towers: &[CellTowerQuery],
        wifi_access_points: &[WifiAccessPointQuery],
    ) -> Result<TriangulationResponse> {
        let request = TriangulationRequest {
            cell_towers,
            wifi_access_points,
        };
        debug!(
            cells = cell_towers.len(),
            wifi = wifi_access_points.len(),
            "sending triangulation request"
        );

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited);
        }

        let text = response.text().await?;
        let reply: TriangulationReply = serde_json::from_str(&text).map_err(|e| {
            error!(error = %e, raw = %text, "failed to parse triangulation response");
            e
        })?;

        match reply {
            TriangulationReply::Success { location, accuracy } => Ok(TriangulationResponse {
                lat: location.lat,
                lon: location.lng,
                accuracy,
            }),
            TriangulationReply::Error { error } => Err(ApiError::Provider {
                code: error.code,
                message: error.message,
            }),
        }
    }
}
