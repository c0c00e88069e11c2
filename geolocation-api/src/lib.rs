//! Typed clients for the geolocation provider's HTTP endpoints.
//!
//! Four endpoint roles are covered: cell-tower lookup, cell observation
//! contribution, operator triangulation, and elevation. Each client wraps a
//! shared [`reqwest::Client`] and returns typed results; callers decide what
//! a denial or a provider error means for them.

pub mod cell_lookup;
pub mod contribute;
pub mod elevation;
pub mod error;
pub mod triangulate;

pub use cell_lookup::{CellLookupClient, CellLookupResponse};
pub use contribute::{CellSubmission, ContributionClient};
pub use elevation::ElevationClient;
pub use error::{ApiError, Result};
pub use triangulate::{
    CellTowerQuery, TriangulationClient, TriangulationResponse, WifiAccessPointQuery,
};

use std::time::Duration;

/// Default timeout for primary provider calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for auxiliary calls (elevation).
pub const AUXILIARY_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the shared HTTP client with the default provider timeout.
pub fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()
}
