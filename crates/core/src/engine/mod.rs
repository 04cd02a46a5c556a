//! Pipeline execution engine.
//!
//! The engine composes the registry, supervisor, session, and sink for one
//! run: resolve the pipeline's descriptor, launch a fresh plugin process,
//! drive the session to a terminal status, and guarantee the process is
//! gone afterwards. Failures before a session exists (registry, launch) are
//! reported once to the sink as a Failed job and surfaced as typed errors.
//!
//! Retrying a run is a caller decision, never an engine behavior: plugin
//! side effects may not be idempotent.

use crate::registry::{PluginRegistry, RegistryError};
use crate::session::{ExecutionSession, SessionTimeouts};
use crate::sink::JobSink;
use crate::supervisor::{LaunchError, PluginSupervisor};
use chrono::{DateTime, Utc};
use pf_protocol::models::RunStatus;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Errors that prevent a session from starting at all.
///
/// Once a session is running, failures are expressed through its terminal
/// [`RunStatus`] instead.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Summary of one completed (or failed-to-complete) run.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub pipeline_id: String,
    pub job_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The main pipeline execution engine.
pub struct PipelineEngine {
    supervisor: PluginSupervisor,
    registry: Arc<PluginRegistry>,
    sink: Arc<dyn JobSink>,
    timeouts: SessionTimeouts,
}

impl PipelineEngine {
    pub fn new(
        supervisor: PluginSupervisor,
        registry: Arc<PluginRegistry>,
        sink: Arc<dyn JobSink>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            supervisor,
            registry,
            sink,
            timeouts,
        }
    }

    /// Execute one pipeline run to a terminal status.
    ///
    /// Each run gets a fresh job id and a fresh plugin process. `cancel`
    /// flipping to `true` cancels the run cooperatively; the plugin process
    /// is terminated regardless of whether it acknowledges.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the run could not start (pipeline not
    /// built, describe failed, launch failed). The failure is also recorded
    /// in the sink under the allocated job id.
    pub async fn run_pipeline(
        &self,
        pipeline_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> Result<SessionReport, EngineError> {
        let job_id = Uuid::new_v4();

        let descriptor = match self.registry.resolve(pipeline_id).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.report_start_failure(pipeline_id, job_id, &e).await;
                return Err(e.into());
            }
        };

        let mut handle = match self.supervisor.launch(&descriptor.executable_path).await {
            Ok(handle) => handle,
            Err(e) => {
                self.report_start_failure(pipeline_id, job_id, &e).await;
                return Err(e.into());
            }
        };

        let mut session = ExecutionSession::new(pipeline_id, job_id, self.timeouts.clone());
        let status = session
            .run(
                &self.supervisor,
                &mut handle,
                &descriptor.declared_steps,
                Arc::clone(&self.sink),
                cancel,
            )
            .await;

        Ok(SessionReport {
            pipeline_id: pipeline_id.to_string(),
            job_id,
            status,
            started_at: session.started_at(),
            finished_at: session.finished_at(),
        })
    }

    /// Report a run that never reached a session, exactly once, with context.
    async fn report_start_failure(
        &self,
        pipeline_id: &str,
        job_id: Uuid,
        error: &dyn std::error::Error,
    ) {
        tracing::error!(pipeline = pipeline_id, job = %job_id, %error, "pipeline run could not start");
        if let Err(e) = self.sink.set_job_status(job_id, RunStatus::Failed).await {
            tracing::warn!(job = %job_id, error = %e, "job sink write failed");
        }
    }
}
