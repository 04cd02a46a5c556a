//! Job/result sink interface.
//!
//! The sink is the durable store sessions write status, step results, and
//! logs into. It is consumed, not owned: the core only assumes appends are
//! idempotent and therefore safe to retry. A sink failure is logged by the
//! session and never treated as a pipeline failure.

use async_trait::async_trait;
use pf_protocol::models::{LogRecord, RunStatus, StepResult};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Errors a sink implementation can surface.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The consumed interface to the job/result store.
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Append one log record for a job.
    async fn append_log(&self, record: LogRecord) -> Result<(), SinkError>;

    /// Record the immutable result of one completed step.
    async fn record_step_result(&self, job_id: Uuid, result: StepResult) -> Result<(), SinkError>;

    /// Update a job's lifecycle status.
    async fn set_job_status(&self, job_id: Uuid, status: RunStatus) -> Result<(), SinkError>;
}

#[derive(Default)]
struct MemorySinkState {
    logs: Vec<LogRecord>,
    step_results: Vec<(Uuid, StepResult)>,
    statuses: Vec<(Uuid, RunStatus)>,
}

/// In-memory sink for tests and embedded use.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All log records appended so far, in arrival order.
    pub fn logs(&self) -> Vec<LogRecord> {
        self.lock().logs.clone()
    }

    /// All recorded step results, in arrival order.
    pub fn step_results(&self, job_id: Uuid) -> Vec<StepResult> {
        self.lock()
            .step_results
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// The most recently set status for a job.
    pub fn last_status(&self, job_id: Uuid) -> Option<RunStatus> {
        self.lock()
            .statuses
            .iter()
            .rev()
            .find(|(id, _)| *id == job_id)
            .map(|(_, s)| *s)
    }

    /// Every status ever set, for any job, in order.
    pub fn statuses(&self) -> Vec<(Uuid, RunStatus)> {
        self.lock().statuses.clone()
    }

    /// Every status ever set for a job, in order.
    pub fn status_history(&self, job_id: Uuid) -> Vec<RunStatus> {
        self.lock()
            .statuses
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, s)| *s)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl JobSink for MemorySink {
    async fn append_log(&self, record: LogRecord) -> Result<(), SinkError> {
        self.lock().logs.push(record);
        Ok(())
    }

    async fn record_step_result(&self, job_id: Uuid, result: StepResult) -> Result<(), SinkError> {
        self.lock().step_results.push((job_id, result));
        Ok(())
    }

    async fn set_job_status(&self, job_id: Uuid, status: RunStatus) -> Result<(), SinkError> {
        self.lock().statuses.push((job_id, status));
        Ok(())
    }
}

/// File-backed sink writing one JSONL journal per job under a root directory.
///
/// Mirrors the original server's per-run log file: everything a run produced
/// lives in `<root>/<job_id>.jsonl`, one tagged JSON object per line.
pub struct FileSink {
    root: PathBuf,
}

#[derive(serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEntry<'a> {
    Log(&'a LogRecord),
    StepResult(&'a StepResult),
    Status { status: RunStatus },
}

impl FileSink {
    /// Create a sink rooted at `root`, creating the directory if needed.
    pub async fn new(root: PathBuf) -> Result<Self, SinkError> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Path of the journal file for a job.
    pub fn journal_path(&self, job_id: Uuid) -> PathBuf {
        self.root.join(format!("{job_id}.jsonl"))
    }

    async fn append(&self, job_id: Uuid, entry: JournalEntry<'_>) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(job_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl JobSink for FileSink {
    async fn append_log(&self, record: LogRecord) -> Result<(), SinkError> {
        self.append(record.job_id, JournalEntry::Log(&record)).await
    }

    async fn record_step_result(&self, job_id: Uuid, result: StepResult) -> Result<(), SinkError> {
        self.append(job_id, JournalEntry::StepResult(&result)).await
    }

    async fn set_job_status(&self, job_id: Uuid, status: RunStatus) -> Result<(), SinkError> {
        self.append(job_id, JournalEntry::Status { status }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pf_protocol::models::LogStream;

    fn record(job_id: Uuid, line: &str) -> LogRecord {
        LogRecord {
            job_id,
            step_index: 0,
            timestamp: Utc::now(),
            line: line.to_string(),
            stream: LogStream::Stdout,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_tracks_per_job_state() {
        let sink = MemorySink::new();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();

        sink.append_log(record(job_a, "hello")).await.unwrap();
        sink.set_job_status(job_a, RunStatus::Running).await.unwrap();
        sink.set_job_status(job_a, RunStatus::Succeeded).await.unwrap();
        sink.set_job_status(job_b, RunStatus::Crashed).await.unwrap();

        assert_eq!(sink.logs().len(), 1);
        assert_eq!(sink.last_status(job_a), Some(RunStatus::Succeeded));
        assert_eq!(sink.last_status(job_b), Some(RunStatus::Crashed));
        assert_eq!(
            sink.status_history(job_a),
            vec![RunStatus::Running, RunStatus::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_file_sink_appends_journal_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("jobs")).await.unwrap();
        let job_id = Uuid::new_v4();

        sink.append_log(record(job_id, "building")).await.unwrap();
        sink.record_step_result(
            job_id,
            StepResult {
                step_index: 0,
                exit_status: 0,
                duration_ms: 5,
                error_message: None,
            },
        )
        .await
        .unwrap();
        sink.set_job_status(job_id, RunStatus::Succeeded).await.unwrap();

        let content = tokio::fs::read_to_string(sink.journal_path(job_id))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"kind\":\"log\""));
        assert!(lines[1].contains("\"kind\":\"step_result\""));
        assert!(lines[2].contains("\"kind\":\"status\""));
        assert!(lines[2].contains("SUCCEEDED"));
    }
}
