//! AT transport over a serial port for Quectel-style modems.
//!
//! Blocking serial I/O runs on the blocking pool; the rest of the daemon
//! only sees the async [`CellularDataCollector`] and [`GnssReceiver`]
//! capabilities.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serialport::SerialPort;
use tracing::{debug, warn};

use crate::cell::parser::{
    metrics_from_serving, parse_gnss_position, parse_neighbor_cells, parse_serving_cell,
};
use crate::cell::CellularDataCollector;
use crate::data::{CellularMetrics, GnssReading, NeighborCell, ServingCell};
use crate::errors::{LocationError, Result};
use crate::sources::gnss::GnssReceiver;

const BAUD_RATE: u32 = 115_200;
const PORT_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_TIMEOUT_MS: u64 = 3_000;
const COMMAND_RETRIES: usize = 2;
const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Shared handle to one AT port.
#[derive(Clone)]
pub struct AtModem {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    device: String,
}

impl AtModem {
    pub fn open(device: &Path) -> Result<Self> {
        let name = device.display().to_string();
        let port = serialport::new(&name, BAUD_RATE)
            .timeout(PORT_TIMEOUT)
            .open()
            .map_err(|e| {
                LocationError::CellScan(format!("failed to open AT port '{name}': {e}"))
            })?;
        Ok(Self {
            port: Arc::new(Mutex::new(port)),
            device: name,
        })
    }

    /// Send one command and collect the response up to OK/ERROR, retrying on
    /// transient failures.
    pub async fn send_command(&self, command: &str) -> Result<String> {
        let this = self.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || this.send_command_blocking(&command))
            .await
            .map_err(|e| LocationError::CellScan(format!("AT task panicked: {e}")))?
    }

    fn send_command_blocking(&self, command: &str) -> Result<String> {
        let mut port = self
            .port
            .lock()
            .map_err(|_| LocationError::CellScan("AT port lock poisoned".into()))?;
        let framed = format!("{command}\r\n");

        for attempt in 0..=COMMAND_RETRIES {
            if attempt > 0 {
                debug!(command, attempt, "retrying AT command");
                std::thread::sleep(RETRY_PAUSE);
            }

            port.flush().map_err(|e| LocationError::CellScan(e.to_string()))?;
            if let Err(e) = port.write_all(framed.as_bytes()) {
                warn!(device = %self.device, error = %e, "AT write failed");
                continue;
            }

            let mut response = String::new();
            let mut buf = [0u8; 1024];
            let started = Instant::now();
            while started.elapsed() < Duration::from_millis(COMMAND_TIMEOUT_MS) {
                match port.read(&mut buf) {
                    Ok(n) if n > 0 => {
                        response.push_str(&String::from_utf8_lossy(&buf[..n]));
                        if response.contains("OK") {
                            return Ok(response);
                        }
                        if response.contains("ERROR") {
                            warn!(command, "AT command returned error");
                            break;
                        }
                    }
                    Ok(_) => {}
                    // Timeouts while draining are expected; keep polling.
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!(device = %self.device, error = %e, "AT read failed");
                        break;
                    }
                }
            }
        }
        Err(LocationError::CellScan(format!(
            "AT command '{command}' failed after {} attempts",
            COMMAND_RETRIES + 1
        )))
    }
}

/// Cellular environment collector over an AT port.
pub struct AtModemCollector {
    modem: AtModem,
}

impl AtModemCollector {
    pub fn new(modem: AtModem) -> Self {
        Self { modem }
    }
}

#[async_trait]
impl CellularDataCollector for AtModemCollector {
    async fn serving_cell(&self) -> Result<ServingCell> {
        let response = self.modem.send_command("AT+QENG=\"servingcell\"").await?;
        parse_serving_cell(&response)
    }

    async fn neighbor_cells(&self) -> Result<Vec<NeighborCell>> {
        let response = self.modem.send_command("AT+QENG=\"neighbourcell\"").await?;
        parse_neighbor_cells(&response)
    }

    async fn cellular_metrics(&self) -> Result<CellularMetrics> {
        let serving = self.serving_cell().await?;
        Ok(metrics_from_serving(&serving))
    }
}

/// Modem-hosted GNSS over the same AT dialect.
pub struct AtGnssReceiver {
    modem: AtModem,
}

impl AtGnssReceiver {
    pub fn new(modem: AtModem) -> Self {
        Self { modem }
    }
}

#[async_trait]
impl GnssReceiver for AtGnssReceiver {
    fn is_present(&self) -> bool {
        true
    }

    async fn read_position(&self) -> Result<GnssReading> {
        let response = self.modem.send_command("AT+QGPSLOC=2").await?;
        parse_gnss_position(&response).map_err(|e| match e {
            // A modem without a fix answers with a CME error.
            LocationError::GnssRead(msg) => {
                LocationError::GnssRead(format!("no GNSS fix from modem: {msg}"))
            }
            other => other,
        })
    }
}
