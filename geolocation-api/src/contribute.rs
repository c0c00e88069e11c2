//! Cell observation contribution endpoint.

use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::{ApiError, Result};

/// One observed tower with the GPS position it was observed from.
#[derive(Debug, Clone, Serialize)]
pub struct CellSubmission {
    pub mcc: u16,
    pub mnc: u16,
    pub lac: u32,
    pub cellid: u64,
    pub lat: f64,
    pub lon: f64,
    pub radio: String,
    /// Accuracy radius of the GPS position, meters.
    pub range: f64,
}

#[derive(Debug, Serialize)]
struct ContributionBody<'a> {
    token: &'a str,
    cells: &'a [CellSubmission],
}

pub struct ContributionClient {
    http: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl ContributionClient {
    pub fn new(http: reqwest::Client, endpoint: Url, token: impl Into<String>) -> Self {
        Self {
            http,
            endpoint,
            token: token.into(),
        }
    }

    /// Submit a batch of observations.
    pub async fn submit(&self, cells: &[CellSubmission]) -> Result<()> {
        debug!(batch = cells.len(), "submitting cell observations");

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&ContributionBody {
                token: &self.token,
                cells,
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimited),
            status if status.is_success() => Ok(()),
            status => Err(ApiError::Status(status.as_u16())),
        }
    }
}
