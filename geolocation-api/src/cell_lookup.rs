//! Cell-tower lookup endpoint.
//!
//! A GET with the tower identifier in query parameters; the provider answers
//! with coordinates, a stated range and a sample count, or with an inline
//! error body. HTTP 429 is mapped to [`ApiError::RateLimited`] so the caller
//! can run its backoff.

use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{ApiError, Result};

/// Query parameters for one tower lookup.
#[derive(Debug, Clone)]
pub struct CellLookupQuery {
    pub mcc: u16,
    pub mnc: u16,
    pub lac: u32,
    pub cellid: u64,
    /// Radio technology in the provider's spelling (gsm, umts, lte, nr).
    pub radio: String,
}

/// Provider response for one tower.
///
/// The provider reports errors inline with `error`/`message` rather than with
/// an HTTP status, so every field the success path needs is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct CellLookupResponse {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Stated accuracy radius in meters.
    pub range: Option<f64>,
    pub samples: Option<u32>,
    #[serde(default)]
    pub changeable: bool,
    pub radio: Option<String>,
    pub error: Option<i32>,
    pub message: Option<String>,
}

pub struct CellLookupClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
}

impl CellLookupClient {
    pub fn new(http: reqwest::Client, endpoint: Url, api_key: impl Into<String>) -> Self {
        Self {
            http,
            endpoint,
            api_key: api_key.into(),
        }
    }

    /// Look up one tower. Returns [`ApiError::NotFound`] when the provider
    /// confirms it has no answer for this identifier.
    pub async fn lookup(&self, query: &CellLookupQuery) -> Result<CellLookupResponse> {
        debug!(
            mcc = query.mcc,
            mnc = query.mnc,
            lac = query.lac,
            cellid = query.cellid,
            radio = %query.radio,
            "looking up cell tower"
        );

        let response = self
            .http
            .get(self.endpoint.clone())
            .query(&[
                ("key", self.api_key.as_str()),
                ("mcc", &query.mcc.to_string()),
                ("mnc", &query.mnc.to_string()),
                ("lac", &query.lac.to_string()),
                ("cellid", &query.cellid.to_string()),
                ("radio", &query.radio),
                ("format", "json"),
            ])
            .send()
            .await?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(ApiError::RateLimited),
            status if !status.is_success() => return Err(ApiError::Status(status.as_u16())),
            _ => {}
        }

        let body: CellLookupResponse = serde_json::from_str(&response.text().await?)?;
        if let Some(code) = body.error {
            let message = body.message.unwrap_or_default();
            // The provider signals "cell not found" as an inline error.
            if message.to_ascii_lowercase().contains("not found") {
                return Err(ApiError::NotFound);
            }
            return Err(ApiError::Provider { code, message });
        }
        if body.lat.is_none() || body.lon.is_none() {
            return Err(ApiError::NotFound);
        }
        Ok(body)
    }
}
