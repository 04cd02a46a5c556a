//! Plugin registry: pipeline id to descriptor resolution.
//!
//! The registry maps a pipeline identifier to its built executable and the
//! step metadata that executable declares. Metadata is obtained by launching
//! the plugin once in a metadata-only run, issuing a `describe` call, and
//! terminating the process immediately. A describe process is never reused
//! for execution, so runs always start from a fresh process.
//!
//! Descriptors are cached per pipeline id and invalidated when the binary's
//! on-disk fingerprint changes. Refreshes for the same pipeline id are
//! mutually exclusive while resolutions of other ids proceed unblocked.

use crate::supervisor::{LaunchError, PluginSupervisor, TerminateMode};
use pf_protocol::frame::{methods, ChannelError, Frame};
use pf_protocol::models::{validate_step_indices, StepSpec};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::time::timeout;

/// Bounded wait for a plugin's answer to `describe`.
const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque comparable token for an executable's on-disk identity.
///
/// Size plus modification time is enough to notice a rebuild without
/// hashing the binary on every resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: SystemTime,
}

/// Where the registry finds executables on disk. Consumed interface.
pub trait RegistrySource: Send + Sync {
    /// The path the pipeline's built executable is expected at.
    fn lookup_executable_path(&self, pipeline_id: &str) -> Option<PathBuf>;

    /// Fingerprint the executable at `path`.
    fn fingerprint(&self, path: &Path) -> std::io::Result<Fingerprint>;
}

/// Production source: one executable per pipeline under a root directory.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl RegistrySource for DirectorySource {
    fn lookup_executable_path(&self, pipeline_id: &str) -> Option<PathBuf> {
        let path = self.root.join(pipeline_id);
        path.is_file().then_some(path)
    }

    fn fingerprint(&self, path: &Path) -> std::io::Result<Fingerprint> {
        let metadata = std::fs::metadata(path)?;
        Ok(Fingerprint {
            len: metadata.len(),
            modified: metadata.modified()?,
        })
    }
}

/// Cached metadata about one pipeline's plugin.
///
/// Immutable between fingerprint changes.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub pipeline_id: String,
    pub executable_path: PathBuf,
    pub fingerprint: Fingerprint,
    pub declared_steps: Vec<StepSpec>,
}

/// Why a describe run failed.
#[derive(thiserror::Error, Debug)]
pub enum DescribeError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("describe protocol error: {reason}")]
    Protocol { reason: String },
}

/// Errors resolving a pipeline to a descriptor.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    /// No executable exists at the expected path.
    #[error("no built executable for pipeline {pipeline_id:?}")]
    NotBuilt { pipeline_id: String },

    /// The metadata-only describe run failed.
    #[error("describe failed for pipeline {pipeline_id:?}: {source}")]
    DescribeFailed {
        pipeline_id: String,
        #[source]
        source: DescribeError,
    },
}

type Slot = Arc<tokio::sync::Mutex<Option<PluginDescriptor>>>;

/// Process-wide descriptor cache.
///
/// Explicitly owned and passed by reference into whatever needs it, so
/// tests can construct isolated instances.
pub struct PluginRegistry {
    source: Arc<dyn RegistrySource>,
    supervisor: PluginSupervisor,
    slots: Mutex<HashMap<String, Slot>>,
}

impl PluginRegistry {
    pub fn new(source: Arc<dyn RegistrySource>, supervisor: PluginSupervisor) -> Self {
        Self {
            source,
            supervisor,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a pipeline id to its plugin descriptor.
    ///
    /// Returns the cached descriptor when the executable's fingerprint is
    /// unchanged; otherwise performs a describe run and caches the result.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotBuilt`] when no executable exists at the expected
    /// path, [`RegistryError::DescribeFailed`] wrapping whatever launch,
    /// handshake, or channel failure the describe run hit.
    pub async fn resolve(&self, pipeline_id: &str) -> Result<PluginDescriptor, RegistryError> {
        let path = self
            .source
            .lookup_executable_path(pipeline_id)
            .ok_or_else(|| RegistryError::NotBuilt {
                pipeline_id: pipeline_id.to_string(),
            })?;
        let fingerprint =
            self.source
                .fingerprint(&path)
                .map_err(|_| RegistryError::NotBuilt {
                    pipeline_id: pipeline_id.to_string(),
                })?;

        // The outer map lock is held only to fetch this pipeline's slot;
        // the describe run itself serializes on the per-id slot lock.
        let slot: Slot = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(pipeline_id.to_string()).or_default())
        };
        let mut cached = slot.lock().await;

        if let Some(descriptor) = cached.as_ref() {
            if descriptor.fingerprint == fingerprint {
                return Ok(descriptor.clone());
            }
            tracing::info!(
                pipeline = pipeline_id,
                "plugin binary changed, refreshing descriptor"
            );
        }

        let declared_steps = self.describe(&path).await.map_err(|source| {
            RegistryError::DescribeFailed {
                pipeline_id: pipeline_id.to_string(),
                source,
            }
        })?;

        let descriptor = PluginDescriptor {
            pipeline_id: pipeline_id.to_string(),
            executable_path: path,
            fingerprint,
            declared_steps,
        };
        *cached = Some(descriptor.clone());
        Ok(descriptor)
    }

    /// Launch the plugin in metadata-only mode and fetch its declared steps.
    ///
    /// The process is terminated before this returns, on success and on
    /// every error path.
    async fn describe(&self, executable: &Path) -> Result<Vec<StepSpec>, DescribeError> {
        let mut handle = self.supervisor.launch(executable).await?;

        let result = async {
            let channel = handle.channel_mut().ok_or(ChannelError::Closed)?;
            let call_id = channel.call(methods::DESCRIBE, Value::Null).await?;

            loop {
                let frame = timeout(DESCRIBE_TIMEOUT, channel.recv())
                    .await
                    .map_err(|_| DescribeError::Protocol {
                        reason: format!("no describe result within {DESCRIBE_TIMEOUT:?}"),
                    })??;

                match frame {
                    Frame::MethodResult { id, body, error } if id == call_id => {
                        if let Some(message) = error {
                            return Err(DescribeError::Protocol {
                                reason: format!("plugin rejected describe: {message}"),
                            });
                        }
                        let steps: Vec<StepSpec> = body
                            .map(serde_json::from_value)
                            .transpose()
                            .map_err(|e| DescribeError::Protocol {
                                reason: format!("undecodable step list: {e}"),
                            })?
                            .ok_or_else(|| DescribeError::Protocol {
                                reason: "describe result carried no step list".to_string(),
                            })?;
                        validate_step_indices(&steps)
                            .map_err(|reason| DescribeError::Protocol { reason })?;
                        return Ok(steps);
                    }
                    other => {
                        return Err(DescribeError::Protocol {
                            reason: format!("unexpected frame during describe: {other:?}"),
                        })
                    }
                }
            }
        }
        .await;

        self.supervisor
            .terminate(&mut handle, TerminateMode::Graceful)
            .await;
        result
    }
}
