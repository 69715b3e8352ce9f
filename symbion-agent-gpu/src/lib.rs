//! Symbion GPU Agent - NVIDIA GPU telemetry over MQTT
//!
//! Samples every GPU through nvidia-smi and publishes one JSON state per GPU:
//! - `dmon` streaming and `--query-gpu` polling, fused per GPU
//! - Change-or-heartbeat publication gating
//! - Home Assistant discovery and availability
//! - Cooperative shutdown with a bounded grace period

pub mod agent;
pub mod aggregator;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod execution;
pub mod gate;
pub mod homeassistant;
pub mod metrics;
pub mod monitor;
pub mod sink;
pub mod sources;
pub mod supervisor;

#[cfg(test)]
mod test_support;
