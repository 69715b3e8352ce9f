//! nvidia-smi invocation
//!
//! Handles:
//! - GPU enumeration (`--query-gpu index,gpu_name,gpu_uuid`)
//! - Long-lived `dmon` streaming per GPU
//! - One-shot `--query-gpu` sampling per GPU

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::BufReader;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::discovery::Gpu;
use crate::sources::{LineReader, PollSource, SourceError, StreamProcess, StreamSource};

const DMON_ARGS: &[&str] = &["dmon", "-s", "pucvmet", "--format", "csv,noheader,nounit"];

const QUERY_ARGS: &[&str] = &[
    "--query-gpu=utilization.gpu,memory.used,memory.free,driver_version,fan.speed,pstate",
    "--format=csv,noheader,nounits",
];

const LIST_ARGS: &[&str] = &["--query-gpu", "index,gpu_name,gpu_uuid", "--format", "csv,noheader,nounits"];

/// Handle on the nvidia-smi binary
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    program: PathBuf,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

impl NvidiaSmi {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Raw CSV listing of every installed GPU
    pub async fn list_gpus(&self) -> Result<String, SourceError> {
        self.capture(LIST_ARGS).await
    }

    /// Run to completion and return stdout
    async fn capture<I, A>(&self, args: I) -> Result<String, SourceError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        let output = AsyncCommand::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SourceError::Spawn {
                program: self.program_name(),
                source,
            })?;

        if !output.status.success() {
            return Err(SourceError::Exit {
                program: self.program_name(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8(output.stdout)?)
    }
}

impl PollSource for NvidiaSmi {
    async fn sample(&self, gpu: &Gpu) -> Result<String, SourceError> {
        let mut args: Vec<&str> = QUERY_ARGS.to_vec();
        args.extend(["-i", gpu.uuid.as_str()]);
        self.capture(args).await
    }
}

impl StreamSource for NvidiaSmi {
    fn spawn(&self, gpu: &Gpu) -> Result<StreamProcess, SourceError> {
        let mut child = AsyncCommand::new(&self.program)
            .args(DMON_ARGS)
            .args(["-i", gpu.uuid.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                program: self.program_name(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(SourceError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .map(|stderr| Box::new(BufReader::new(stderr)) as LineReader);

        debug!(gpu_uuid = %gpu.uuid, pid = ?child.id(), "started nvidia-smi dmon");

        Ok(StreamProcess {
            stdout: Box::new(BufReader::new(stdout)),
            stderr,
            child: Some(child),
        })
    }
}
