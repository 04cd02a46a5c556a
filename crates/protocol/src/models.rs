//! Pipeline run data models.
//!
//! These structures are exchanged between the orchestrator and plugins as
//! frame payloads, and between the orchestrator and its job/result sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One step a plugin declares during the metadata handshake.
///
/// Produced by the plugin's `describe` call, never user-authored. Within a
/// descriptor, `index` values are contiguous starting at 0 and `name` is
/// unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step name, unique within the declaring plugin.
    pub name: String,

    /// Zero-based sequence position.
    pub index: usize,

    /// Optional schema describing the step's expected input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// The outcome of one executed step. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Index of the step this result belongs to.
    pub step_index: usize,

    /// Step exit status; non-zero means the step's logic failed.
    pub exit_status: i32,

    /// Wall-clock duration of the step as measured by the plugin.
    pub duration_ms: u64,

    /// Human-readable failure description for non-zero exits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepResult {
    /// Whether the step's logic succeeded.
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// Which output stream a log line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One streamed log line as it appears inside a stream chunk frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    pub line: String,
    pub stream: LogStream,
}

/// An append-only log record produced by an execution session.
///
/// Created as chunk frames arrive and forwarded to the sink immediately;
/// ordering within a step matches emission order from the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub job_id: Uuid,
    pub step_index: usize,
    pub timestamp: DateTime<Utc>,
    pub line: String,
    pub stream: LogStream,
}

/// The per-step context sent with an `execute_step` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInvocation {
    pub pipeline_id: String,
    pub job_id: Uuid,
    pub step_index: usize,
    pub step_name: String,
}

/// Lifecycle status of one pipeline run.
///
/// Normal progression: Pending -> Running -> Succeeded. Every status other
/// than Pending and Running is terminal, and a session never leaves a
/// terminal status.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Session constructed, plugin not yet driving steps.
    Pending,

    /// Steps are being executed.
    Running,

    /// A step reported a non-zero exit status; later steps were not issued.
    StepFailed,

    /// All declared steps completed with exit status 0.
    Succeeded,

    /// An infrastructure-level failure that was not a process crash
    /// (e.g. a step exceeded its execution ceiling).
    Failed,

    /// The run was cancelled by an external caller.
    Cancelled,

    /// The plugin process died or violated the protocol mid-run.
    Crashed,
}

impl RunStatus {
    /// Whether this status ends the session.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Whether this status represents a successful run.
    pub fn is_success(self) -> bool {
        self == RunStatus::Succeeded
    }
}

/// Validate that declared steps carry exactly the indices `0..n`, in order.
///
/// Returns the offending description on failure; the registry turns this
/// into a describe failure for the plugin.
pub fn validate_step_indices(steps: &[StepSpec]) -> Result<(), String> {
    for (expected, step) in steps.iter().enumerate() {
        if step.index != expected {
            return Err(format!(
                "step {:?} declares index {} but position {} was expected",
                step.name, step.index, expected
            ));
        }
    }
    Ok(())
}
