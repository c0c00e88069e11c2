//! Parsers for Quectel QENG/QGPSLOC responses.
//!
//! The serving-cell line carries the full identifier; neighbour lines only
//! carry physical ids, which is all the environment fingerprint needs.

use crate::data::{
    CellId, CellularMetrics, FixType, GnssReading, NeighborCell, RadioType, ServingCell,
};
use crate::errors::{LocationError, Result};

const SERVINGCELL_PREFIX: &str = "+QENG: \"servingcell\",";
// No closing quote: matches both intra and inter neighbourcell lines.
const NEIGHBOURCELL_PREFIX: &str = "+QENG: \"neighbourcell";
const GPSLOC_PREFIX: &str = "+QGPSLOC:";

fn split_quoted_fields(line: &str) -> Vec<String> {
    line.split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .collect()
}

fn opt_u32(field: &str) -> Option<u32> {
    field.trim().parse().ok()
}

fn opt_i32(field: &str) -> Option<i32> {
    field.trim().parse().ok()
}

fn hex_u32(field: &str) -> Option<u32> {
    u32::from_str_radix(field.trim(), 16).ok()
}

fn hex_u64(field: &str) -> Option<u64> {
    u64::from_str_radix(field.trim(), 16).ok()
}

/// Parse the serving cell out of a QENG response. A modem still searching
/// for a network is a scan failure, not a panic.
pub fn parse_serving_cell(response: &str) -> Result<ServingCell> {
    let line = response
        .lines()
        .find(|l| l.contains(SERVINGCELL_PREFIX))
        .ok_or_else(|| {
            LocationError::CellScan("no servingcell line in response".into())
        })?;

    let idx = line.find(SERVINGCELL_PREFIX).expect("just matched");
    let fields = split_quoted_fields(&line[idx + SERVINGCELL_PREFIX.len()..]);
    if fields.len() < 2 {
        return Err(LocationError::CellScan(format!(
            "servingcell line too short: '{line}'"
        )));
    }

    let rat = fields[1].as_str();
    match rat {
        "LTE" => parse_lte_serving(&fields),
        "WCDMA" => parse_wcdma_serving(&fields),
        "GSM" => parse_gsm_serving(&fields),
        "NR5G-SA" | "NR5G" => parse_nr_serving(&fields),
        _ => Err(LocationError::CellScan(format!(
            "modem reports no usable cell (state '{}')",
            fields[0]
        ))),
    }
}

// "servingcell",<state>,"LTE",<duplex>,<mcc>,<mnc>,<cellid hex>,<pcid>,
// <earfcn>,<band>,<ul_bw>,<dl_bw>,<tac hex>,<rsrp>,<rsrq>,<rssi>,<sinr>,...
fn parse_lte_serving(fields: &[String]) -> Result<ServingCell> {
    let id = full_id(fields, 3, 4, 11, 5, RadioType::Lte)?;
    Ok(ServingCell {
        id,
        rsrp: fields.get(12).and_then(|f| opt_i32(f)),
        rsrq: fields.get(13).and_then(|f| opt_i32(f)),
        sinr: fields.get(15).and_then(|f| opt_i32(f)),
        timing_advance: None,
        band: fields.get(8).filter(|f| !f.is_empty()).cloned(),
        arfcn: fields.get(7).and_then(|f| opt_u32(f)),
        pcid: fields.get(6).and_then(|f| opt_u32(f)),
    })
}

// "servingcell",<state>,"WCDMA",<mcc>,<mnc>,<lac hex>,<cellid hex>,
// <uarfcn>,<psc>,<rac>,<rscp>,<ecio>
fn parse_wcdma_serving(fields: &[String]) -> Result<ServingCell> {
    let id = full_id(fields, 2, 3, 4, 5, RadioType::Umts)?;
    Ok(ServingCell {
        id,
        rsrp: fields.get(9).and_then(|f| opt_i32(f)),
        rsrq: None,
        sinr: fields.get(10).and_then(|f| opt_i32(f)),
        timing_advance: None,
        band: None,
        arfcn: fields.get(6).and_then(|f| opt_u32(f)),
        pcid: fields.get(7).and_then(|f| opt_u32(f)),
    })
}

// "servingcell",<state>,"GSM",<mcc>,<mnc>,<lac hex>,<cellid hex>,<bsic>,
// <arfcn>,<band>,<rxlev>
fn parse_gsm_serving(fields: &[String]) -> Result<ServingCell> {
    let id = full_id(fields, 2, 3, 4, 5, RadioType::Gsm)?;
    Ok(ServingCell {
        id,
        rsrp: fields.get(9).and_then(|f| opt_i32(f)),
        rsrq: None,
        sinr: None,
        timing_advance: None,
        band: fields.get(8).filter(|f| !f.is_empty()).cloned(),
        arfcn: fields.get(7).and_then(|f| opt_u32(f)),
        pcid: fields.get(6).and_then(|f| opt_u32(f)),
    })
}

// "servingcell",<state>,"NR5G-SA",<duplex>,<mcc>,<mnc>,<cellid hex>,<pcid>,
// <tac hex>,<arfcn>,<band>,<rsrp>,<rsrq>,<sinr>
fn parse_nr_serving(fields: &[String]) -> Result<ServingCell> {
    let id = full_id(fields, 3, 4, 7, 5, RadioType::Nr)?;
    Ok(ServingCell {
        id,
        rsrp: fields.get(10).and_then(|f| opt_i32(f)),
        rsrq: fields.get(11).and_then(|f| opt_i32(f)),
        sinr: fields.get(12).and_then(|f| opt_i32(f)),
        timing_advance: None,
        band: fields.get(9).filter(|f| !f.is_empty()).cloned(),
        arfcn: fields.get(8).and_then(|f| opt_u32(f)),
        pcid: fields.get(6).and_then(|f| opt_u32(f)),
    })
}

fn full_id(
    fields: &[String],
    mcc_idx: usize,
    mnc_idx: usize,
    lac_idx: usize,
    cell_idx: usize,
    radio: RadioType,
) -> Result<CellId> {
    let bad = |what: &str| {
        LocationError::CellScan(format!("servingcell line missing {what}"))
    };
    Ok(CellId {
        mcc: fields
            .get(mcc_idx)
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(|| bad("mcc"))?,
        mnc: fields
            .get(mnc_idx)
            .and_then(|f| f.trim().parse().ok())
            .ok_or_else(|| bad("mnc"))?,
        lac: fields
            .get(lac_idx)
            .and_then(|f| hex_u32(f))
            .ok_or_else(|| bad("lac/tac"))?,
        cell: fields
            .get(cell_idx)
            .and_then(|f| hex_u64(f))
            .ok_or_else(|| bad("cell id"))?,
        radio,
    })
}

/// Parse all neighbour lines. Unknown RATs and short lines are skipped.
pub fn parse_neighbor_cells(response: &str) -> Result<Vec<NeighborCell>> {
    let mut results = Vec::new();

    for line in response.lines() {
        let Some(idx) = line.find(NEIGHBOURCELL_PREFIX) else {
            continue;
        };
        let after = &line[idx + NEIGHBOURCELL_PREFIX.len()..];
        // Skip the rest of the tag ("...intra","LTE" or ...","LTE").
        let Some(comma) = after.find(',') else { continue };
        let fields = split_quoted_fields(&after[comma + 1..]);
        if fields.is_empty() {
            continue;
        }
        if let Some(cell) = parse_neighbor_fields(&fields[0], &fields[1..]) {
            results.push(cell);
        }
    }
    Ok(results)
}

fn parse_neighbor_fields(rat: &str, fields: &[String]) -> Option<NeighborCell> {
    match rat {
        // "LTE",<earfcn>,<pcid>,<rsrq>,<rsrp>,<rssi>,<sinr>,...
        "LTE" | "NR5G" => {
            let arfcn = fields.first().and_then(|f| opt_u32(f))?;
            Some(NeighborCell {
                id: None,
                pcid: fields.get(1).and_then(|f| opt_u32(f)),
                arfcn: Some(arfcn),
                rsrq: fields.get(2).and_then(|f| opt_i32(f)),
                rsrp: fields.get(3).and_then(|f| opt_i32(f)),
            })
        }
        // "WCDMA",<uarfcn>,<psc>,<rscp>,<ecno>
        "WCDMA" => {
            let arfcn = fields.first().and_then(|f| opt_u32(f))?;
            Some(NeighborCell {
                id: None,
                pcid: fields.get(1).and_then(|f| opt_u32(f)),
                arfcn: Some(arfcn),
                rsrp: fields.get(2).and_then(|f| opt_i32(f)),
                rsrq: None,
            })
        }
        // "GSM",<mcc>,<mnc>,<lac hex>,<cellid hex>,<bsic>,<arfcn>,<rxlev>
        "GSM" => {
            if fields.len() < 6 {
                return None;
            }
            let id = match (
                fields[0].parse::<u16>().ok(),
                fields[1].parse::<u16>().ok(),
                hex_u32(&fields[2]),
                hex_u64(&fields[3]),
            ) {
                (Some(mcc), Some(mnc), Some(lac), Some(cell)) => Some(CellId {
                    mcc,
                    mnc,
                    lac,
                    cell,
                    radio: RadioType::Gsm,
                }),
                _ => None,
            };
            Some(NeighborCell {
                id,
                pcid: fields.get(4).and_then(|f| opt_u32(f)),
                arfcn: fields.get(5).and_then(|f| opt_u32(f)),
                rsrp: fields.get(6).and_then(|f| opt_i32(f)),
                rsrq: None,
            })
        }
        _ => None,
    }
}

/// Link metrics derived from the serving-cell line.
pub fn metrics_from_serving(serving: &ServingCell) -> CellularMetrics {
    CellularMetrics {
        rssi: None,
        rsrp: serving.rsrp,
        rsrq: serving.rsrq,
        sinr: serving.sinr,
        band: serving.band.clone(),
        network_type: Some(serving.id.radio.as_str().to_uppercase()),
    }
}

// +QGPSLOC: <utc>,<lat>,<lon>,<hdop>,<alt>,<fix>,<cog>,<spkm>,<spkn>,<date>,<nsat>
// Meters of position error per unit of HDOP, the usual UERE estimate.
const HDOP_TO_METERS: f64 = 5.0;

/// Parse a modem GNSS position report (decimal-degree mode).
pub fn parse_gnss_position(response: &str) -> Result<GnssReading> {
    let line = response
        .lines()
        .find(|l| l.contains(GPSLOC_PREFIX))
        .ok_or_else(|| LocationError::GnssRead("no QGPSLOC line in response".into()))?;

    let idx = line.find(GPSLOC_PREFIX).expect("just matched");
    let fields = split_quoted_fields(&line[idx + GPSLOC_PREFIX.len()..]);
    if fields.len() < 11 {
        return Err(LocationError::GnssRead(format!(
            "QGPSLOC line too short: '{line}'"
        )));
    }

    let parse_f64 = |i: usize, what: &str| {
        fields[i]
            .trim()
            .parse::<f64>()
            .map_err(|_| LocationError::GnssRead(format!("bad {what} '{}'", fields[i])))
    };

    let lat = parse_f64(1, "latitude")?;
    let lon = parse_f64(2, "longitude")?;
    let hdop = parse_f64(3, "hdop")?;
    let altitude = parse_f64(4, "altitude").ok();
    let fix_type = match fields[5].trim() {
        "2" => FixType::TwoD,
        "3" => FixType::ThreeD,
        _ => FixType::None,
    };

    Ok(GnssReading {
        lat,
        lon,
        altitude_m: altitude,
        accuracy_m: (hdop * HDOP_TO_METERS).max(1.0),
        satellites: fields[10].trim().parse().unwrap_or(0),
        fix_type,
        hdop: Some(hdop),
        speed_kmh: parse_f64(7, "speed").ok(),
        course_deg: parse_f64(6, "course").ok(),
    })
}
