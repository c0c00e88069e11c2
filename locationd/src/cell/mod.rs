//! Cellular environment collection.
//!
//! The core consumes the [`CellularDataCollector`] capability; how the data
//! leaves the modem (AT over serial, ubus, sysfs) is the collaborator's
//! concern. An AT-backed implementation over a serial port ships in
//! [`modem`] for the common Quectel case.

pub mod modem;
pub mod parser;

use async_trait::async_trait;
use chrono::Utc;

use crate::data::{CellEnvironment, CellularMetrics, NeighborCell, ServingCell};
use crate::errors::Result;

#[async_trait]
pub trait CellularDataCollector: Send + Sync {
    async fn serving_cell(&self) -> Result<ServingCell>;

    async fn neighbor_cells(&self) -> Result<Vec<NeighborCell>>;

    async fn cellular_metrics(&self) -> Result<CellularMetrics>;

    /// One full scan. Neighbor failures degrade to an empty list; a missing
    /// serving cell is a real failure.
    async fn scan(&self) -> Result<CellEnvironment> {
        let serving = self.serving_cell().await?;
        let neighbors = self.neighbor_cells().await.unwrap_or_default();
        Ok(CellEnvironment {
            serving,
            neighbors,
            scanned_at: Utc::now(),
        })
    }
}
