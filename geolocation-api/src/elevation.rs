//! Elevation endpoint. Auxiliary; uses the shorter timeout.

use serde::Deserialize;
use url::Url;

use crate::error::{ApiError, Result};

#[derive(Debug, Deserialize)]
struct ElevationReply {
    results: Vec<ElevationResult>,
}

#[derive(Debug, Deserialize)]
struct ElevationResult {
    elevation: f64,
}

pub struct ElevationClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl ElevationClient {
    /// The caller should pass a client built with [`crate::AUXILIARY_TIMEOUT`].
    pub fn new(http: reqwest::Client, endpoint: Url) -> Self {
        Self { http, endpoint }
    }

    pub async fn elevation(&self, lat: f64, lon: f64) -> Result<f64> {
        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[("locations", format!("{lat},{lon}"))])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status().as_u16()));
        }

        let reply: ElevationReply = serde_json::from_str(&response.text().await?)?;
        reply
            .results
            .first()
            .map(|r| r.elevation)
            .ok_or(ApiError::NotFound)
    }
}
