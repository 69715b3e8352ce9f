//! Publication gate: decides which fused states reach the MQTT sink
//!
//! A state is published when the GPU has never been published, when it
//! differs from the last published state, or when the last publication is
//! older than the heartbeat interval. The bookkeeping map is owned by the
//! gate's single task, so decisions for all GPUs are serialized.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::metrics::GpuState;
use crate::sink::{state_topic, Publisher};

/// Re-announce unchanged state after this long
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Last emission for one GPU
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub state: GpuState,
    pub published_at: Instant,
}

/// Wire format: the state plus the time it was sent
#[derive(Serialize)]
struct StatePayload<'a> {
    #[serde(flatten)]
    state: &'a GpuState,
    timestamp: DateTime<Utc>,
}

pub struct PublicationGate<P> {
    publisher: P,
    base_topic: String,
    heartbeat: Duration,
    last_published: HashMap<String, PublishedRecord>,
}

impl<P: Publisher> PublicationGate<P> {
    pub fn new(publisher: P, base_topic: impl Into<String>, heartbeat: Duration) -> Self {
        Self {
            publisher,
            base_topic: base_topic.into(),
            heartbeat,
            last_published: HashMap::new(),
        }
    }

    pub fn should_publish(&self, state: &GpuState, now: Instant) -> bool {
        match self.last_published.get(&state.gpu.uuid) {
            None => true,
            Some(last) => last.state != *state || now.duration_since(last.published_at) > self.heartbeat,
        }
    }

    /// Evaluate one state and publish it if it qualifies; returns whether it was sent
    ///
    /// A failed publish still counts as an emission: bookkeeping is updated and
    /// nothing is retried.
    pub async fn offer(&mut self, state: GpuState, now: Instant) -> bool {
        if !self.should_publish(&state, now) {
            return false;
        }

        let uuid = state.gpu.uuid.clone();
        let payload = StatePayload {
            state: &state,
            timestamp: Utc::now(),
        };
        let payload = match serde_json::to_string(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(gpu_uuid = %uuid, error = %e, "failed to marshal metrics");
                return false;
            }
        };

        let topic = state_topic(&self.base_topic, &uuid);
        match self.publisher.publish(payload, &topic, false).await {
            Ok(()) => debug!(gpu_uuid = %uuid, %topic, "published gpu state"),
            Err(e) => error!(gpu_uuid = %uuid, error = %e, "failed to publish metrics"),
        }

        self.last_published.insert(
            uuid,
            PublishedRecord {
                state,
                published_at: now,
            },
        );
        true
    }

    pub fn last_published(&self, gpu_uuid: &str) -> Option<&PublishedRecord> {
        self.last_published.get(gpu_uuid)
    }

    /// Consume the merged state stream until every producer is gone
    pub async fn run(mut self, mut states: mpsc::Receiver<GpuState>) {
        info!("starting main metrics consumer");
        while let Some(state) = states.recv().await {
            self.offer(state, Instant::now()).await;
        }
        info!("main metrics consumer stopped");
    }
}
