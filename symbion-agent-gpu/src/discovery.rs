//! GPU discovery and identification for Symbion GPU agents
//!
//! This module handles:
//! - Enumerating NVIDIA GPUs through `nvidia-smi --query-gpu`
//! - Parsing the index/name/uuid listing
//! - Validating GPU UUIDs before they are handed to an external process

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::execution::NvidiaSmi;
use crate::sources::SourceError;

/// Stable identity of one GPU, immutable after discovery
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gpu {
    pub index: u32,
    pub name: String,
    pub uuid: String,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to run nvidia-smi: {0}")]
    Command(#[from] SourceError),
    #[error("found 0 nvidia gpus")]
    NoGpus,
}

const GPU_UUID_PATTERN: &str =
    r"^GPU-[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";

fn uuid_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(GPU_UUID_PATTERN).ok()).as_ref()
}

/// Check a GPU UUID against the canonical `GPU-xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` form
pub fn is_valid_gpu_uuid(uuid: &str) -> bool {
    uuid_regex().is_some_and(|re| re.is_match(uuid))
}

/// Discover all GPUs visible to nvidia-smi
///
/// An empty result is an error: the agent has nothing to monitor.
pub async fn discover_gpus(smi: &NvidiaSmi) -> Result<Vec<Gpu>, DiscoveryError> {
    info!("Starting GPU discovery...");

    let output = smi.list_gpus().await?;
    let gpus = parse_gpu_list(&output);

    if gpus.is_empty() {
        return Err(DiscoveryError::NoGpus);
    }

    for gpu in &gpus {
        info!(index = gpu.index, name = %gpu.name, gpu_uuid = %gpu.uuid, "Found GPU");
    }
    Ok(gpus)
}

/// Parse `index, name, uuid` lines; malformed lines are skipped
pub fn parse_gpu_list(output: &str) -> Vec<Gpu> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() != 3 {
                debug!("Skipping GPU listing line: {:?}", line);
                return None;
            }

            let index = match parts[0].trim().parse::<u32>() {
                Ok(index) => index,
                Err(_) => {
                    debug!("Skipping GPU listing line with bad index: {:?}", line);
                    return None;
                }
            };

            Some(Gpu {
                index,
                name: parts[1].trim().to_string(),
                uuid: parts[2].trim().to_string(),
            })
        })
        .collect()
}
