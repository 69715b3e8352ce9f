//! Command line flags, applied on top of the config file and environment

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::config::AgentConfig;

#[derive(Parser, Debug, Default)]
#[command(name = "symbion-agent-gpu", version)]
#[command(about = "Publish NVIDIA GPU telemetry from nvidia-smi to an MQTT broker")]
pub struct Cli {
    /// Config file location (default: $SYMBION_GPU_CONFIG or the user config dir)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// MQTT broker, e.g. tcp://127.0.0.1:1883 or mqtt.lan
    #[arg(short, long, value_name = "ADDR")]
    pub broker: Option<String>,

    /// MQTT broker port, overrides a port given in --broker
    #[arg(long)]
    pub port: Option<u16>,

    /// Base topic for published GPU states
    #[arg(short, long)]
    pub topic: Option<String>,

    #[arg(short, long)]
    pub username: Option<String>,

    #[arg(short, long)]
    pub password: Option<String>,

    /// Publish Home Assistant discovery configs (true/false)
    #[arg(long, value_name = "BOOL", action = ArgAction::Set)]
    pub ha: Option<bool>,

    /// Polling interval of the query runner, in seconds
    #[arg(short, long, value_name = "SECS")]
    pub interval: Option<u64>,
}

impl Cli {
    /// Override config values with every flag that was given
    pub fn apply_to(&self, config: &mut AgentConfig) {
        if let Some(broker) = &self.broker {
            let (host, port) = parse_broker(broker);
            config.mqtt.broker_host = host.to_string();
            if let Some(port) = port {
                config.mqtt.broker_port = port;
            }
        }
        if let Some(port) = self.port {
            config.mqtt.broker_port = port;
        }
        if let Some(topic) = &self.topic {
            config.publish.base_topic = topic.clone();
        }
        if let Some(username) = &self.username {
            config.mqtt.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            config.mqtt.password = Some(password.clone());
        }
        if let Some(ha) = self.ha {
            config.publish.homeassistant = ha;
        }
        if let Some(secs) = self.interval {
            config.gpu.poll_interval_ms = secs.saturating_mul(1000);
        }
    }
}

/// Split `[tcp://|mqtt://]host[:port]` into host and optional port
fn parse_broker(broker: &str) -> (&str, Option<u16>) {
    let address = broker.trim();
    let address = address
        .strip_prefix("tcp://")
        .or_else(|| address.strip_prefix("mqtt://"))
        .unwrap_or(address)
        .trim_end_matches('/');

    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (address, None),
        },
        _ => (address, None),
    }
}
