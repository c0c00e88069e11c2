//! Satellite-terminal telemetry source.
//!
//! Aggregates over the terminal's local status APIs. Different firmware
//! generations expose different JSON shapes, so the position is extracted
//! structurally rather than through one fixed schema.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::data::{FixQuality, FixType, GeoFix};
use crate::errors::{LocationError, Result};
use crate::sources::{CollectContext, HealthMeter, LocationSource};

/// Accuracy assumed when the terminal reports none.
const DEFAULT_ACCURACY_M: f64 = 25.0;

pub struct SatelliteTelemetrySource {
    priority: u32,
    urls: Vec<String>,
    http: reqwest::Client,
    meter: HealthMeter,
}

impl SatelliteTelemetrySource {
    pub fn new(priority: u32, urls: Vec<String>, http: reqwest::Client) -> Self {
        Self {
            priority,
            urls,
            http,
            meter: HealthMeter::default(),
        }
    }
}

/// Pull (lat, lon, accuracy) out of whichever shape this firmware speaks.
fn extract_position(body: &Value) -> Option<(f64, f64, Option<f64>)> {
    // Flat: {"lat": .., "lon": .., "accuracy": ..}
    if let (Some(lat), Some(lon)) = (body.get("lat"), body.get("lon")) {
        return Some((
            lat.as_f64()?,
            lon.as_f64()?,
            body.get("accuracy").and_then(Value::as_f64),
        ));
    }
    // Long names: {"latitude": .., "longitude": .., "uncertaintyMeters": ..}
    if let (Some(lat), Some(lon)) = (body.get("latitude"), body.get("longitude")) {
        return Some((
            lat.as_f64()?,
            lon.as_f64()?,
            body.get("uncertaintyMeters").and_then(Value::as_f64),
        ));
    }
    // Nested: {"location": {"lat": .., "lng"/"lon": ..}, "accuracy": ..}
    if let Some(location) = body.get("location") {
        let lat = location.get("lat")?.as_f64()?;
        let lon = location
            .get("lng")
            .or_else(|| location.get("lon"))?
            .as_f64()?;
        return Some((lat, lon, body.get("accuracy").and_then(Value::as_f64)));
    }
    None
}

#[async_trait]
impl LocationSource for SatelliteTelemetrySource {
    fn name(&self) -> &str {
        "satellite"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn available(&self, _ctx: &CollectContext) -> bool {
        !self.urls.is_empty()
    }

    async fn collect(&self, _ctx: &CollectContext) -> Result<GeoFix> {
        let started = Instant::now();
        let mut last_error = String::from("no telemetry endpoints configured");

        for url in &self.urls {
            let body: Value = match async {
                self.http
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await
            }
            .await
            {
                Ok(body) => body,
                Err(e) => {
                    debug!(url = %url, error = %e, "telemetry endpoint failed");
                    last_error = e.to_string();
                    continue;
                }
            };

            let Some((lat, lon, accuracy)) = extract_position(&body) else {
                warn!(url = %url, "telemetry response carried no position");
                last_error = format!("no position in response from {url}");
                continue;
            };
            let accuracy = accuracy.unwrap_or(DEFAULT_ACCURACY_M);

            return Ok(GeoFix {
                lat,
                lon,
                altitude_m: body.get("altitude").and_then(Value::as_f64),
                accuracy_m: accuracy,
                speed_kmh: None,
                course_deg: None,
                hdop: None,
                vdop: None,
                fix_type: FixType::ThreeD,
                quality: FixQuality::from_accuracy(accuracy),
                satellites: None,
                source: "satellite".to_string(),
                method: "terminal_telemetry".to_string(),
                contributors: vec!["satellite".to_string()],
                valid: true,
                confidence: 0.85,
                collection_ms: started.elapsed().as_millis() as u64,
                from_cache: false,
                api_call_made: false,
                api_cost: 0.0,
                timestamp: Utc::now(),
            });
        }

        Err(LocationError::RemoteUnavailable(last_error))
    }

    fn meter(&self) -> &HealthMeter {
        &self.meter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn extracts_flat_long_and_nested_shapes() {
        let flat: Value =
            serde_json::from_str(r#"{"lat":59.1,"lon":18.2,"accuracy":12.0}"#).unwrap();
        assert_eq!(extract_position(&flat), Some((59.1, 18.2, Some(12.0))));

        let long: Value = serde_json::from_str(
            r#"{"latitude":59.1,"longitude":18.2,"uncertaintyMeters":7.5}"#,
        )
        .unwrap();
        assert_eq!(extract_position(&long), Some((59.1, 18.2, Some(7.5))));

        let nested: Value =
            serde_json::from_str(r#"{"location":{"lat":59.1,"lng":18.2}}"#).unwrap();
        assert_eq!(extract_position(&nested), Some((59.1, 18.2, None)));

        let junk: Value = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert_eq!(extract_position(&junk), None);
    }

    #[tokio::test]
    async fn first_working_endpoint_wins() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"latitude":59.5,"longitude":18.5,"uncertaintyMeters":10.0,"altitude":120.0}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let source = SatelliteTelemetrySource::new(
            1,
            vec![
                format!("http://{}/broken", server.address()),
                format!("http://{}/status", server.address()),
            ],
            reqwest::Client::new(),
        );

        let fix = source.collect(&CollectContext::default()).await.unwrap();
        assert_eq!(fix.lat, 59.5);
        assert_eq!(fix.accuracy_m, 10.0);
        assert_eq!(fix.altitude_m, Some(120.0));
        assert_eq!(fix.confidence, 0.85);
    }

    #[tokio::test]
    async fn all_endpoints_down_is_remote_unavailable() {
        let source = SatelliteTelemetrySource::new(
            1,
            vec!["http://127.0.0.1:1/status".into()],
            reqwest::Client::new(),
        );
        assert!(matches!(
            source.collect(&CollectContext::default()).await,
            Err(LocationError::RemoteUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn unconfigured_source_reports_unavailable() {
        let source = SatelliteTelemetrySource::new(1, vec![], reqwest::Client::new());
        assert!(!source.available(&CollectContext::default()).await);
    }
}
