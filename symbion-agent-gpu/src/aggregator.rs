//! Fan-in of every per-GPU state stream into one global stream
//!
//! Each GPU gets a forwarder task relaying its states into a shared channel.
//! Forwarders only ever drop their sender clone; the merged channel closes
//! when the last one is gone, so no producer closes it on behalf of others.

use tokio::sync::mpsc;
use tracing::debug;

use crate::discovery::Gpu;
use crate::metrics::GpuState;
use crate::sources::HANDOFF_CAPACITY;
use crate::supervisor::TaskSpawner;

/// Merge per-GPU streams; per-GPU order is kept, cross-GPU order is arrival order
pub fn fan_in(spawner: &TaskSpawner, streams: Vec<(Gpu, mpsc::Receiver<GpuState>)>) -> mpsc::Receiver<GpuState> {
    let (merged_tx, merged_rx) = mpsc::channel(HANDOFF_CAPACITY);

    for (gpu, mut stream) in streams {
        let merged_tx = merged_tx.clone();
        let cancel = spawner.token();

        spawner.spawn("forwarder", async move {
            loop {
                let state = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(gpu_uuid = %gpu.uuid, "forwarder context cancelled");
                        return;
                    }
                    state = stream.recv() => match state {
                        Some(state) => state,
                        None => break,
                    },
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(gpu_uuid = %gpu.uuid, "forwarder context cancelled");
                        return;
                    }
                    sent = merged_tx.send(state) => {
                        if sent.is_err() {
                            debug!(gpu_uuid = %gpu.uuid, "merged channel consumer dropped");
                            return;
                        }
                    }
                }
            }
            debug!(gpu_uuid = %gpu.uuid, "forwarder finished");
        });
    }

    merged_rx
}
