//! Per-GPU monitor: fuses the dmon stream and the query poll into GpuState snapshots

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::discovery::Gpu;
use crate::metrics::{DmonMetrics, GpuState, QueryMetrics};
use crate::sources::{spawn_poll_runner, spawn_stream_runner, PollSource, StreamSource, HANDOFF_CAPACITY};
use crate::supervisor::TaskSpawner;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("agent is shutting down, not starting monitor for {0}")]
    ShuttingDown(String),
}

/// Starts one fused monitor per GPU from a shared pair of sources
pub struct GpuMonitor<S, P> {
    spawner: TaskSpawner,
    stream: Arc<S>,
    poll: Arc<P>,
    poll_interval: Duration,
}

impl<S: StreamSource, P: PollSource> GpuMonitor<S, P> {
    pub fn new(spawner: TaskSpawner, stream: Arc<S>, poll: Arc<P>, poll_interval: Duration) -> Self {
        Self {
            spawner,
            stream,
            poll,
            poll_interval,
        }
    }

    /// Start both runners and the fusing task for one GPU
    ///
    /// The returned sequence closes once both runners have finished or the
    /// agent is cancelled.
    pub fn start(&self, gpu: Gpu) -> Result<mpsc::Receiver<GpuState>, MonitorError> {
        if self.spawner.is_shutting_down() {
            return Err(MonitorError::ShuttingDown(gpu.uuid));
        }

        let dmon_rx = spawn_stream_runner(&self.spawner, self.stream.clone(), gpu.clone());
        let query_rx = spawn_poll_runner(&self.spawner, self.poll.clone(), gpu.clone(), self.poll_interval);

        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
        let cancel = self.spawner.token();
        self.spawner.spawn("gpu-monitor", fuse(gpu, cancel, dmon_rx, query_rx, tx));
        Ok(rx)
    }
}

/// Merge both sample streams of one GPU, emitting the full state on every sample
pub(crate) async fn fuse(
    gpu: Gpu,
    cancel: CancellationToken,
    mut dmon_rx: mpsc::Receiver<DmonMetrics>,
    mut query_rx: mpsc::Receiver<QueryMetrics>,
    out: mpsc::Sender<GpuState>,
) {
    let uuid = gpu.uuid.clone();
    let mut state = GpuState::new(gpu);
    let mut dmon_open = true;
    let mut query_open = true;

    loop {
        if !dmon_open && !query_open {
            info!(gpu_uuid = %uuid, "all channels closed, shutting down combined monitor");
            return;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(gpu_uuid = %uuid, "combined monitor context cancelled, shutting down");
                return;
            }
            sample = dmon_rx.recv(), if dmon_open => match sample {
                Some(dmon) => state.dmon = dmon,
                None => {
                    debug!(gpu_uuid = %uuid, "dmon channel closed");
                    dmon_open = false;
                    continue;
                }
            },
            sample = query_rx.recv(), if query_open => match sample {
                Some(query) => state.query = query,
                None => {
                    debug!(gpu_uuid = %uuid, "query channel closed");
                    query_open = false;
                    continue;
                }
            },
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(gpu_uuid = %uuid, "combined monitor context cancelled during send");
                return;
            }
            sent = out.send(state.clone()) => {
                if sent.is_err() {
                    debug!(gpu_uuid = %uuid, "combined monitor consumer dropped");
                    return;
                }
            }
        }
    }
}
