//! Symbion GPU Agent - publishes NVIDIA GPU telemetry to MQTT
//!
//! Startup: config -> broker connection -> GPU discovery -> HA discovery ->
//! one monitor per GPU. Runs until SIGINT/SIGTERM, then drains within the
//! configured grace period.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use symbion_agent_gpu::agent::start_pipeline;
use symbion_agent_gpu::cli::Cli;
use symbion_agent_gpu::config::AgentConfig;
use symbion_agent_gpu::discovery::{discover_gpus, Gpu};
use symbion_agent_gpu::execution::NvidiaSmi;
use symbion_agent_gpu::gate::PublicationGate;
use symbion_agent_gpu::homeassistant::publish_configs;
use symbion_agent_gpu::monitor::GpuMonitor;
use symbion_agent_gpu::sink::MqttSink;
use symbion_agent_gpu::supervisor::{shutdown_signal, LifecycleState, Supervisor};

/// Main agent state
struct Agent {
    config: AgentConfig,
    smi: Arc<NvidiaSmi>,
    gpus: Vec<Gpu>,
    sink: MqttSink,
}

impl Agent {
    /// Load config, connect to the broker and discover GPUs
    ///
    /// Precedence: command line, then environment, then config file.
    async fn new(cli: &Cli) -> Result<Self> {
        info!("Initializing Symbion GPU Agent v{}", env!("CARGO_PKG_VERSION"));

        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => AgentConfig::config_file_path().context("Failed to locate config file")?,
        };
        let mut config = AgentConfig::load_from(&config_path)
            .await
            .context("Failed to load configuration")?;
        config.apply_env().context("Invalid environment override")?;
        cli.apply_to(&mut config);
        config.validate().context("Invalid configuration")?;
        config
            .save_to(&config_path)
            .await
            .context("Failed to save configuration")?;

        let sink = MqttSink::connect(&config.mqtt, &config.publish.base_topic)
            .await
            .context("Failed to connect to MQTT broker")?;

        let smi = Arc::new(NvidiaSmi::new(config.gpu.smi_path.clone()));
        let gpus = discover_gpus(&smi).await.context("Failed to discover GPUs")?;

        Ok(Agent {
            config,
            smi,
            gpus,
            sink,
        })
    }

    /// Run until a termination signal, then shut down
    async fn run(self) -> Result<()> {
        let base_topic = self.config.publish.base_topic.clone();

        if self.config.publish.homeassistant {
            if let Err(e) = publish_configs(&self.sink.publisher(), &self.gpus, &base_topic).await {
                warn!("Failed to publish Home Assistant discovery configs: {}", e);
            }
        } else if let Err(e) = self.sink.announce_online().await {
            warn!("Failed to publish availability: {}", e);
        }

        let mut supervisor = Supervisor::new();
        let monitor = GpuMonitor::new(
            supervisor.spawner(),
            self.smi.clone(),
            self.smi.clone(),
            self.config.poll_interval(),
        );
        let gate = PublicationGate::new(self.sink.publisher(), base_topic, self.config.heartbeat());

        let started = start_pipeline(&supervisor.spawner(), &monitor, &self.gpus, gate);
        info!("Monitoring {} of {} GPUs", started, self.gpus.len());

        match shutdown_signal().await {
            Ok(signal) => info!("Received {}, shutting down", signal),
            Err(e) => warn!("Failed to listen for shutdown signal: {}, shutting down", e),
        }

        match supervisor.shutdown(self.config.shutdown_grace()).await {
            LifecycleState::ForcedExit => warn!(
                "Workers still running after {:?}, exiting anyway",
                self.config.shutdown_grace()
            ),
            _ => info!("All workers stopped"),
        }

        self.sink.close().await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("symbion_agent_gpu=info")),
        )
        .init();

    info!("🎛️ Symbion GPU Agent starting...");

    let agent = Agent::new(&cli).await.context("Failed to create agent")?;
    agent.run().await.context("Agent execution failed")?;

    info!("Symbion GPU Agent stopped");
    Ok(())
}
