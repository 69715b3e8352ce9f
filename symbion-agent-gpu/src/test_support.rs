//! In-memory sources and sink glue shared by the unit tests

use std::collections::VecDeque;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rumqttc::QoS;
use symbion_devkit::{fixtures, MockMqttClient};
use tokio::io::{BufReader, DuplexStream};

use crate::discovery::Gpu;
use crate::sink::{PublishError, Publisher};
use crate::sources::{LineReader, PollSource, SourceError, StreamProcess, StreamSource};

pub const TEST_UUID: &str = "GPU-00000000-0000-0000-0000-000000000000";

pub fn test_gpu() -> Gpu {
    Gpu {
        index: 0,
        name: "GPU-A".to_string(),
        uuid: TEST_UUID.to_string(),
    }
}

pub fn other_gpu() -> Gpu {
    Gpu {
        index: 1,
        name: "GPU-B".to_string(),
        uuid: "GPU-11111111-1111-1111-1111-111111111111".to_string(),
    }
}

pub fn dmon_fixture(pwr: i64) -> String {
    fixtures::dmon_line(&[("pwr", pwr)])
}

pub fn query_fixture(utilgpu: i64) -> String {
    fixtures::query_line(utilgpu, "P2")
}

/// Streaming source whose process prints a fixed script then exits
pub struct ScriptedStream {
    lines: Option<Vec<String>>,
    spawned: AtomicUsize,
}

impl ScriptedStream {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines: Some(lines),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Source whose process can never be started
    pub fn failing() -> Self {
        Self {
            lines: None,
            spawned: AtomicUsize::new(0),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl StreamSource for ScriptedStream {
    fn spawn(&self, _gpu: &Gpu) -> Result<StreamProcess, SourceError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let lines = self
            .lines
            .as_ref()
            .ok_or_else(|| SourceError::Io(io::Error::new(io::ErrorKind::NotFound, "no such binary")))?;

        let stdout: String = lines.iter().map(|line| format!("{}\n", line)).collect();
        Ok(StreamProcess {
            stdout: Box::new(Cursor::new(stdout.into_bytes())),
            stderr: Some(Box::new(Cursor::new(b"Warning: persistence mode is disabled\n".to_vec()))),
            child: None,
        })
    }
}

const PIPE_CAPACITY: usize = 4096;

/// Streaming source fed by the test through in-memory pipes
pub struct PipeStream {
    stdout: Mutex<Option<DuplexStream>>,
    stderr: Mutex<Option<DuplexStream>>,
}

impl PipeStream {
    /// Process with only a primary output
    pub fn new() -> (Self, DuplexStream) {
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);
        (
            Self {
                stdout: Mutex::new(Some(reader)),
                stderr: Mutex::new(None),
            },
            writer,
        )
    }

    /// Process with both outputs; returns the stdout and stderr writers
    pub fn with_stderr() -> (Self, DuplexStream, DuplexStream) {
        let (out_reader, out_writer) = tokio::io::duplex(PIPE_CAPACITY);
        let (err_reader, err_writer) = tokio::io::duplex(PIPE_CAPACITY);
        (
            Self {
                stdout: Mutex::new(Some(out_reader)),
                stderr: Mutex::new(Some(err_reader)),
            },
            out_writer,
            err_writer,
        )
    }
}

impl StreamSource for PipeStream {
    fn spawn(&self, _gpu: &Gpu) -> Result<StreamProcess, SourceError> {
        let stdout = self
            .stdout
            .lock()
            .unwrap()
            .take()
            .ok_or(SourceError::MissingPipe("stdout"))?;
        let stderr = self.stderr.lock().unwrap().take();
        Ok(StreamProcess {
            stdout: Box::new(BufReader::new(stdout)),
            stderr: stderr.map(|reader| Box::new(BufReader::new(reader)) as LineReader),
            child: None,
        })
    }
}

/// Polling source answering from a script; an exhausted script fails every call
pub struct ScriptedPoll {
    responses: Mutex<VecDeque<Result<String, String>>>,
    repeat: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedPoll {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            repeat: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn repeating(line: String) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            repeat: Some(line),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PollSource for ScriptedPoll {
    async fn sample(&self, _gpu: &Gpu) -> Result<String, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        match (next, &self.repeat) {
            (Some(Ok(line)), _) => Ok(line),
            (Some(Err(msg)), _) => Err(SourceError::Io(io::Error::new(io::ErrorKind::Other, msg))),
            (None, Some(line)) => Ok(line.clone()),
            (None, None) => Err(SourceError::Io(io::Error::new(io::ErrorKind::Other, "script exhausted"))),
        }
    }
}

impl Publisher for MockMqttClient {
    async fn publish(&self, payload: String, topic: &str, retained: bool) -> Result<(), PublishError> {
        MockMqttClient::publish(self, topic, QoS::AtMostOnce, retained, payload)
            .await
            .map_err(|e| PublishError::Rejected(e.to_string()))
    }
}
