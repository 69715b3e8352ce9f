//! Pipeline wiring: per-GPU monitors -> fan-in -> publication gate

use tracing::{error, info, warn};

use crate::aggregator::fan_in;
use crate::discovery::Gpu;
use crate::gate::PublicationGate;
use crate::monitor::GpuMonitor;
use crate::sink::Publisher;
use crate::sources::{PollSource, StreamSource};
use crate::supervisor::TaskSpawner;

/// Start a monitor for every GPU and the gate consuming their merged output
///
/// A GPU whose monitor cannot start is skipped. Returns the number of
/// monitors started.
pub fn start_pipeline<S, P, T>(
    spawner: &TaskSpawner,
    monitor: &GpuMonitor<S, P>,
    gpus: &[Gpu],
    gate: PublicationGate<T>,
) -> usize
where
    S: StreamSource,
    P: PollSource,
    T: Publisher,
{
    let mut streams = Vec::with_capacity(gpus.len());
    for gpu in gpus {
        match monitor.start(gpu.clone()) {
            Ok(rx) => {
                info!(gpu_uuid = %gpu.uuid, name = %gpu.name, "started gpu monitor");
                streams.push((gpu.clone(), rx));
            }
            Err(e) => error!(gpu_uuid = %gpu.uuid, error = %e, "failed to start monitor"),
        }
    }

    let started = streams.len();
    if started == 0 {
        warn!("no gpu monitors running, nothing will be published");
    }

    let merged = fan_in(spawner, streams);
    spawner.spawn("publication-gate", gate.run(merged));
    started
}
