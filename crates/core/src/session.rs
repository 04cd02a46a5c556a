//! Execution session state machine.
//!
//! An [`ExecutionSession`] drives one pipeline run against one plugin
//! process: it issues one `execute_step` call per declared step in index
//! order, converts streamed chunks into log records, collects each step's
//! result, and settles on exactly one terminal status.
//!
//! ```text
//! Pending -> Running -> { Succeeded, StepFailed, Failed, Cancelled, Crashed }
//! ```
//!
//! A step with a non-zero exit status stops the run (fail-fast: later steps
//! assume earlier ones succeeded). A channel-level failure means the plugin
//! process died or violated the protocol and ends the run as Crashed.
//! Cancellation notifies the plugin best-effort and never blocks on a
//! non-responsive plugin.
//!
//! Log records are handed to the sink through a bounded queue serviced by a
//! forwarder task, so a slow sink applies backpressure to the session rather
//! than stalling unboundedly buffered frames. Sink failures are logged and
//! never fail the run.

use crate::channel::Channel;
use crate::sink::JobSink;
use crate::supervisor::{PluginHandle, PluginSupervisor, TerminateMode};
use chrono::{DateTime, Utc};
use pf_protocol::frame::{methods, ChannelError, Frame};
use pf_protocol::models::{LogChunk, LogRecord, RunStatus, StepInvocation, StepResult, StepSpec};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, timeout_at, Instant};
use uuid::Uuid;

/// Capacity of the session-to-sink queue. Bounded so a slow sink applies
/// backpressure instead of queuing without limit.
const LOG_QUEUE_CAPACITY: usize = 256;

/// Bounded wait for the best-effort cancel notification.
const CANCEL_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Session-level timeouts.
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    /// Ceiling for one step: its method call must produce a result within
    /// this window or the run fails and the process is force-terminated.
    pub step: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(300),
        }
    }
}

/// Internal result of driving the step loop, before termination policy and
/// terminal status are applied.
#[derive(Debug, PartialEq)]
enum Outcome {
    Succeeded,
    StepFailed,
    Failed { reason: String },
    Crashed { reason: String },
    Cancelled,
}

/// Writes forwarded from the session to the sink.
enum SinkOp {
    Log(LogRecord),
    Step(Uuid, StepResult),
}

/// The stateful driver of one pipeline run against one plugin instance.
pub struct ExecutionSession {
    pipeline_id: String,
    job_id: Uuid,
    status: RunStatus,
    current_step_index: usize,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    timeouts: SessionTimeouts,
}

impl ExecutionSession {
    /// Create a session in `Pending` for the given pipeline and job.
    pub fn new(pipeline_id: impl Into<String>, job_id: Uuid, timeouts: SessionTimeouts) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            job_id,
            status: RunStatus::Pending,
            current_step_index: 0,
            started_at: Utc::now(),
            finished_at: None,
            timeouts,
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Index of the step currently (or last) being executed.
    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Drive the run to completion or failure.
    ///
    /// Sends one `execute_step` call per entry of `steps` in order,
    /// forwarding log records and step results to `sink` as they arrive.
    /// The plugin process is terminated on every path before this returns:
    /// gracefully after a clean or fail-fast end, forcibly after a crash or
    /// timeout. The returned status equals [`ExecutionSession::status`].
    pub async fn run(
        &mut self,
        supervisor: &PluginSupervisor,
        handle: &mut PluginHandle,
        steps: &[StepSpec],
        sink: Arc<dyn JobSink>,
        cancel: watch::Receiver<bool>,
    ) -> RunStatus {
        self.transition(RunStatus::Running);
        if let Err(e) = sink.set_job_status(self.job_id, RunStatus::Running).await {
            tracing::warn!(job = %self.job_id, error = %e, "job sink write failed");
        }

        let (ops_tx, ops_rx) = mpsc::channel(LOG_QUEUE_CAPACITY);
        let forwarder = tokio::spawn(forward_to_sink(ops_rx, Arc::clone(&sink)));

        let outcome = match handle.channel_mut() {
            Some(channel) => self.drive(channel, steps, &ops_tx, cancel).await,
            None => Outcome::Crashed {
                reason: "plugin channel already released".to_string(),
            },
        };

        // Flush queued log records and step results before the terminal
        // status becomes visible.
        drop(ops_tx);
        if forwarder.await.is_err() {
            tracing::warn!(job = %self.job_id, "sink forwarder task panicked");
        }

        let (mode, status) = match &outcome {
            Outcome::Succeeded => (TerminateMode::Graceful, RunStatus::Succeeded),
            Outcome::StepFailed => (TerminateMode::Graceful, RunStatus::StepFailed),
            Outcome::Cancelled => (TerminateMode::Graceful, RunStatus::Cancelled),
            Outcome::Failed { reason } => {
                tracing::error!(
                    pipeline = %self.pipeline_id,
                    job = %self.job_id,
                    step = self.current_step_index,
                    %reason,
                    "pipeline run failed"
                );
                (TerminateMode::Forced, RunStatus::Failed)
            }
            Outcome::Crashed { reason } => {
                tracing::error!(
                    pipeline = %self.pipeline_id,
                    job = %self.job_id,
                    step = self.current_step_index,
                    %reason,
                    "plugin crashed"
                );
                (TerminateMode::Forced, RunStatus::Crashed)
            }
        };

        supervisor.terminate(handle, mode).await;
        self.transition(status);
        if let Err(e) = sink.set_job_status(self.job_id, self.status).await {
            tracing::warn!(job = %self.job_id, error = %e, "job sink write failed");
        }
        self.status
    }

    /// The step loop: one call per step, strict sequential ordering.
    async fn drive(
        &mut self,
        channel: &mut Channel,
        steps: &[StepSpec],
        ops: &mpsc::Sender<SinkOp>,
        mut cancel: watch::Receiver<bool>,
    ) -> Outcome {
        let mut cancel_alive = true;

        for step in steps {
            self.current_step_index = step.index;

            if cancel_alive && *cancel.borrow_and_update() {
                return Self::notify_cancelled(channel).await;
            }

            let invocation = StepInvocation {
                pipeline_id: self.pipeline_id.clone(),
                job_id: self.job_id,
                step_index: step.index,
                step_name: step.name.clone(),
            };
            let body = match serde_json::to_value(&invocation) {
                Ok(body) => body,
                Err(e) => {
                    return Outcome::Failed {
                        reason: format!("failed to encode step invocation: {e}"),
                    }
                }
            };
            let call_id = match channel.call(methods::EXECUTE_STEP, body).await {
                Ok(id) => id,
                Err(e) => return Self::channel_outcome(e),
            };

            let deadline = Instant::now() + self.timeouts.step;
            let mut stream_ended = false;

            // Read frames for this call until its result arrives. The
            // session does not move on until StreamEnd + MethodResult have
            // both been observed.
            loop {
                let frame = tokio::select! {
                    changed = cancel.changed(), if cancel_alive => {
                        match changed {
                            Ok(()) => {
                                if *cancel.borrow_and_update() {
                                    return Self::notify_cancelled(channel).await;
                                }
                                continue;
                            }
                            Err(_) => {
                                cancel_alive = false;
                                continue;
                            }
                        }
                    }
                    frame = timeout_at(deadline, channel.recv()) => match frame {
                        Err(_) => {
                            return Outcome::Failed {
                                reason: format!(
                                    "step {} produced no result within {:?}",
                                    step.index, self.timeouts.step
                                ),
                            }
                        }
                        Ok(Err(e)) => return Self::channel_outcome(e),
                        Ok(Ok(frame)) => frame,
                    },
                };

                if frame.call_id() != call_id {
                    return Outcome::Crashed {
                        reason: format!(
                            "frame for call {} while call {call_id} was in flight",
                            frame.call_id()
                        ),
                    };
                }

                match frame {
                    Frame::StreamChunk { data, .. } => {
                        if stream_ended {
                            return Outcome::Crashed {
                                reason: "stream chunk after stream end".to_string(),
                            };
                        }
                        let chunk: LogChunk = match serde_json::from_value(data) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                return Outcome::Crashed {
                                    reason: format!("undecodable log chunk: {e}"),
                                }
                            }
                        };
                        let record = LogRecord {
                            job_id: self.job_id,
                            step_index: step.index,
                            timestamp: Utc::now(),
                            line: chunk.line,
                            stream: chunk.stream,
                        };
                        if ops.send(SinkOp::Log(record)).await.is_err() {
                            tracing::warn!(job = %self.job_id, "sink forwarder gone, dropping log record");
                        }
                    }
                    Frame::StreamEnd { .. } => {
                        stream_ended = true;
                    }
                    Frame::MethodResult { body, error, .. } => {
                        if !stream_ended {
                            return Outcome::Crashed {
                                reason: "method result before stream end".to_string(),
                            };
                        }
                        if let Some(message) = error {
                            return Outcome::Failed { reason: message };
                        }
                        let result: StepResult =
                            match body.map(serde_json::from_value).transpose() {
                                Ok(Some(result)) => result,
                                Ok(None) | Err(_) => {
                                    return Outcome::Crashed {
                                        reason: "undecodable step result".to_string(),
                                    }
                                }
                            };
                        if result.step_index != step.index {
                            return Outcome::Crashed {
                                reason: format!(
                                    "result for step {} while step {} was executing",
                                    result.step_index, step.index
                                ),
                            };
                        }
                        let failed = !result.succeeded();
                        if ops.send(SinkOp::Step(self.job_id, result)).await.is_err() {
                            tracing::warn!(job = %self.job_id, "sink forwarder gone, dropping step result");
                        }
                        if failed {
                            return Outcome::StepFailed;
                        }
                        break;
                    }
                    Frame::MethodCall { method, .. } => {
                        return Outcome::Crashed {
                            reason: format!("unexpected method call {method:?} from plugin"),
                        };
                    }
                }
            }
        }

        Outcome::Succeeded
    }

    /// Best-effort cancel notification; never blocks on an unresponsive plugin.
    async fn notify_cancelled(channel: &mut Channel) -> Outcome {
        let notify = async {
            let _ = channel.call(methods::CANCEL, Value::Null).await;
        };
        let _ = timeout(CANCEL_NOTIFY_TIMEOUT, notify).await;
        Outcome::Cancelled
    }

    fn channel_outcome(error: ChannelError) -> Outcome {
        match error {
            ChannelError::Closed => Outcome::Crashed {
                reason: "plugin process closed the channel mid-step".to_string(),
            },
            ChannelError::Corrupt { reason } => Outcome::Crashed {
                reason: format!("protocol violation: {reason}"),
            },
        }
    }

    /// Status transitions are monotonic: once terminal, never left.
    fn transition(&mut self, status: RunStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Drains the session's queue into the sink. Sink failures are logged, not
/// propagated: a broken sink must not fail the pipeline.
async fn forward_to_sink(mut ops: mpsc::Receiver<SinkOp>, sink: Arc<dyn JobSink>) {
    while let Some(op) = ops.recv().await {
        let result = match op {
            SinkOp::Log(record) => sink.append_log(record).await,
            SinkOp::Step(job_id, step_result) => {
                sink.record_step_result(job_id, step_result).await
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "job sink write failed");
        }
    }
}
