//! GPU metrics model for Symbion GPU agents
//!
//! Two partial views arrive per GPU:
//! - `dmon` samples from the long-lived `nvidia-smi dmon` stream
//! - `query` samples from the periodic `nvidia-smi --query-gpu` invocation
//!
//! Both are fused into one [`GpuState`] per GPU, which is what gets published.

mod parse;

pub use parse::{parse_dmon_line, parse_query_line, DMON_FIELD_COUNT, QUERY_FIELD_COUNT};

use crate::discovery::Gpu;
use serde::{Deserialize, Serialize};

/// One line of `nvidia-smi dmon -s pucvmet` output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmonMetrics {
    pub id: i64,
    /// Power draw (W)
    pub pwr: i64,
    /// GPU temperature (°C)
    pub gtemp: i64,
    /// Memory temperature (°C)
    pub mtemp: i64,
    pub sm: i64,
    pub mem: i64,
    pub enc: i64,
    pub dec: i64,
    pub jpg: i64,
    pub ofa: i64,
    /// Memory clock (MHz)
    pub mclk: i64,
    /// Processor clock (MHz)
    pub pclk: i64,
    pub pviol: i64,
    pub tviol: i64,
    pub fb: i64,
    pub bar1: i64,
    pub ccpm: i64,
    pub sbecc: i64,
    pub dbecc: i64,
    pub pci: i64,
    pub rxpci: i64,
    pub txpci: i64,
}

/// One `nvidia-smi --query-gpu` sample
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub utilgpu: i64,
    /// Used framebuffer memory (MiB)
    pub memused: i64,
    /// Free framebuffer memory (MiB)
    pub memfree: i64,
    pub drivver: String,
    pub fanspe: i64,
    /// Performance state, e.g. `P2`
    pub pstat: String,
}

/// Fused view of one GPU: the latest sample of each kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuState {
    pub gpu: Gpu,
    pub dmon: DmonMetrics,
    pub query: QueryMetrics,
}

impl GpuState {
    /// Empty state for a GPU, both sub-records zero-valued
    pub fn new(gpu: Gpu) -> Self {
        Self {
            gpu,
            dmon: DmonMetrics::default(),
            query: QueryMetrics::default(),
        }
    }
}
