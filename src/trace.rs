//! Oracle call traces, written as JSONL off the async path.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationPhase, CashChoice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleCallKind {
    Rank,
    Calibration,
}

/// One oracle attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleTrace {
    pub timestamp_ms: i64,
    pub kind: OracleCallKind,
    pub respondent: String,
    pub attempt: u32,
    #[serde(default)]
    pub task_id: Option<usize>,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub best: Option<String>,
    #[serde(default)]
    pub worst: Option<String>,
    #[serde(default)]
    pub feature_id: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub step: Option<usize>,
    #[serde(default)]
    pub phase: Option<CalibrationPhase>,
    #[serde(default)]
    pub choice: Option<CashChoice>,
    /// Answer arrived but could not be used.
    #[serde(default)]
    pub invalid: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl OracleTrace {
    pub fn rank(respondent: &str, task_id: usize, items: &[String], attempt: u32) -> Self {
        Self {
            timestamp_ms: now_epoch_ms(),
            kind: OracleCallKind::Rank,
            respondent: respondent.to_string(),
            attempt,
            task_id: Some(task_id),
            items: items.to_vec(),
            best: None,
            worst: None,
            feature_id: None,
            amount: None,
            step: None,
            phase: None,
            choice: None,
            invalid: false,
            error: None,
        }
    }

    pub fn calibration(
        respondent: &str,
        feature_id: &str,
        amount: f64,
        step: usize,
        phase: CalibrationPhase,
        attempt: u32,
    ) -> Self {
        Self {
            timestamp_ms: now_epoch_ms(),
            kind: OracleCallKind::Calibration,
            respondent: respondent.to_string(),
            attempt,
            task_id: None,
            items: Vec::new(),
            best: None,
            worst: None,
            feature_id: Some(feature_id.to_string()),
            amount: Some(amount),
            step: Some(step),
            phase: Some(phase),
            choice: None,
            invalid: false,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: OracleTrace) -> Result<(), TraceError>;
}

/// Sends traces to a writer thread; drop every clone before joining the worker.
#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<OracleTrace>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    pub fn join(mut self) -> Result<(), TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<OracleTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: OracleTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<OracleTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Parse a JSONL trace file back into records.
pub fn read_traces(path: impl AsRef<Path>) -> Result<Vec<OracleTrace>, TraceError> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| TraceError::Serde(e.to_string())))
        .collect()
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
