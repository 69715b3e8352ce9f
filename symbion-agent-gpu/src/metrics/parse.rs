//! Lenient CSV line parsers for nvidia-smi output
//!
//! A line with the wrong field count yields the zero-valued record; a field
//! that is `-` or not an integer yields 0. Nothing here ever fails.

use super::{DmonMetrics, QueryMetrics};

/// Fields per `dmon -s pucvmet` line
pub const DMON_FIELD_COUNT: usize = 22;
/// Fields per `--query-gpu` line
pub const QUERY_FIELD_COUNT: usize = 6;

/// nvidia-smi prints `-` for counters a GPU doesn't support
fn parse_field(raw: &str) -> i64 {
    match raw.trim() {
        "-" => 0,
        value => value.parse().unwrap_or(0),
    }
}

pub fn parse_dmon_line(line: &str) -> DmonMetrics {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() != DMON_FIELD_COUNT {
        return DmonMetrics::default();
    }

    let f: Vec<i64> = parts.iter().map(|p| parse_field(p)).collect();

    DmonMetrics {
        id: f[0],
        pwr: f[1],
        gtemp: f[2],
        mtemp: f[3],
        sm: f[4],
        mem: f[5],
        enc: f[6],
        dec: f[7],
        jpg: f[8],
        ofa: f[9],
        mclk: f[10],
        pclk: f[11],
        pviol: f[12],
        tviol: f[13],
        fb: f[14],
        bar1: f[15],
        ccpm: f[16],
        sbecc: f[17],
        dbecc: f[18],
        pci: f[19],
        rxpci: f[20],
        txpci: f[21],
    }
}

pub fn parse_query_line(line: &str) -> QueryMetrics {
    let parts: Vec<&str> = line.trim().split(',').collect();
    if parts.len() != QUERY_FIELD_COUNT {
        return QueryMetrics::default();
    }

    QueryMetrics {
        utilgpu: parse_field(parts[0]),
        memused: parse_field(parts[1]),
        memfree: parse_field(parts[2]),
        drivver: parts[3].trim().to_string(),
        fanspe: parse_field(parts[4]),
        pstat: parts[5].trim().to_string(),
    }
}
