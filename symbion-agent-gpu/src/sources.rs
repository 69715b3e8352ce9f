//! Source runners: turn raw nvidia-smi output into typed sample streams
//!
//! Two runners exist per GPU:
//! - [`run_stream`] supervises one long-lived `dmon` process and emits one
//!   [`DmonMetrics`] per output line
//! - [`run_poll`] invokes `--query-gpu` on a fixed interval and emits one
//!   [`QueryMetrics`] per successful invocation
//!
//! Both close their output channel when they return, and every suspension
//! point is raced against the shared cancellation token.

use std::future::Future;
use std::io;
use std::process::ExitStatus;
use std::string::FromUtf8Error;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{is_valid_gpu_uuid, Gpu};
use crate::metrics::{parse_dmon_line, parse_query_line, DmonMetrics, QueryMetrics};
use crate::supervisor::TaskSpawner;

/// Default period of the polling runner
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Hand-off channels between stages hold a single item
pub(crate) const HANDOFF_CAPACITY: usize = 1;

/// Errors raised by an external sample producer
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{0} pipe was not captured")]
    MissingPipe(&'static str),
    #[error("output is not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type LineReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// A running streaming producer
pub struct StreamProcess {
    /// Primary output, one record per line
    pub stdout: LineReader,
    /// Diagnostic channel, logged but never parsed
    pub stderr: Option<LineReader>,
    /// Underlying process, killed when dropped
    pub child: Option<Child>,
}

/// Long-lived producer of `dmon` lines for one GPU
pub trait StreamSource: Send + Sync + 'static {
    fn spawn(&self, gpu: &Gpu) -> Result<StreamProcess, SourceError>;
}

/// On-demand producer of one `--query-gpu` line for one GPU
pub trait PollSource: Send + Sync + 'static {
    fn sample(&self, gpu: &Gpu) -> impl Future<Output = Result<String, SourceError>> + Send;
}

/// Start the streaming runner for a GPU as a tracked task
pub fn spawn_stream_runner<S: StreamSource>(
    spawner: &TaskSpawner,
    source: Arc<S>,
    gpu: Gpu,
) -> mpsc::Receiver<DmonMetrics> {
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    let task_spawner = spawner.clone();
    spawner.spawn("dmon-runner", async move {
        run_stream(&task_spawner, source.as_ref(), &gpu, tx).await;
    });
    rx
}

/// Start the polling runner for a GPU as a tracked task
pub fn spawn_poll_runner<P: PollSource>(
    spawner: &TaskSpawner,
    source: Arc<P>,
    gpu: Gpu,
    period: Duration,
) -> mpsc::Receiver<QueryMetrics> {
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    let cancel = spawner.token();
    spawner.spawn("query-runner", async move {
        run_poll(source.as_ref(), &gpu, period, cancel, tx).await;
    });
    rx
}

/// Read `dmon` output line by line until the process exits or cancellation
pub async fn run_stream<S: StreamSource + ?Sized>(
    spawner: &TaskSpawner,
    source: &S,
    gpu: &Gpu,
    out: mpsc::Sender<DmonMetrics>,
) {
    if !is_valid_gpu_uuid(&gpu.uuid) {
        error!(gpu_uuid = %gpu.uuid, "invalid GPU UUID format");
        return;
    }

    let cancel = spawner.token();
    let StreamProcess {
        stdout,
        stderr,
        child,
    } = match source.spawn(gpu) {
        Ok(process) => process,
        Err(e) => {
            error!(gpu_uuid = %gpu.uuid, error = %e, "failed to start dmon");
            return;
        }
    };

    if let Some(stderr) = stderr {
        let uuid = gpu.uuid.clone();
        let cancel = cancel.clone();
        spawner.spawn("dmon-stderr", async move {
            let mut lines = stderr.lines();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = lines.next_line() => next,
                };
                match next {
                    Ok(Some(line)) => error!(gpu_uuid = %uuid, error = %line, "dmon process error"),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(gpu_uuid = %uuid, error = %e, "dmon stderr closed");
                        break;
                    }
                }
            }
        });
    }

    let mut lines = stdout.lines();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(gpu_uuid = %gpu.uuid, "dmon context cancelled, shutting down monitor");
                return;
            }
            next = lines.next_line() => next,
        };

        match next {
            Ok(Some(line)) => {
                let metrics = parse_dmon_line(&line);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(gpu_uuid = %gpu.uuid, "dmon context cancelled during send, shutting down monitor");
                        return;
                    }
                    sent = out.send(metrics) => {
                        if sent.is_err() {
                            debug!(gpu_uuid = %gpu.uuid, "dmon consumer dropped");
                            return;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(gpu_uuid = %gpu.uuid, error = %e, "failed to read dmon output");
                break;
            }
        }
    }

    info!(gpu_uuid = %gpu.uuid, "dmon process finished, shutting down monitor");

    if let Some(mut child) = child {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            status = child.wait() => match status {
                Ok(status) if status.success() => debug!(gpu_uuid = %gpu.uuid, "dmon exited cleanly"),
                Ok(status) => warn!(gpu_uuid = %gpu.uuid, %status, "dmon exited with failure"),
                Err(e) => warn!(gpu_uuid = %gpu.uuid, error = %e, "failed to reap dmon"),
            },
        }
    }
}

/// Sample `--query-gpu` every `period`; failed invocations skip the tick
pub async fn run_poll<P: PollSource + ?Sized>(
    source: &P,
    gpu: &Gpu,
    period: Duration,
    cancel: CancellationToken,
    out: mpsc::Sender<QueryMetrics>,
) {
    if !is_valid_gpu_uuid(&gpu.uuid) {
        error!(gpu_uuid = %gpu.uuid, "invalid GPU UUID format");
        return;
    }

    // first sample one period after start, like a plain ticker
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            output = source.sample(gpu) => output,
        };

        let metrics = match output {
            Ok(line) => parse_query_line(&line),
            Err(e) => {
                error!(gpu_uuid = %gpu.uuid, error = %e, "failed to run query-gpu");
                continue;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = out.send(metrics) => {
                if sent.is_err() {
                    debug!(gpu_uuid = %gpu.uuid, "query consumer dropped");
                    break;
                }
            }
        }
    }

    debug!(gpu_uuid = %gpu.uuid, "query runner stopped");
}
