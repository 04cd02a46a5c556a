//! Plugin process lifecycle management.
//!
//! The supervisor turns an on-disk executable into a connected
//! [`PluginHandle`]: it spawns the process with a constrained environment,
//! reads the single handshake line from stdout under a bounded wait,
//! connects the advertised endpoint, and wires up a [`Channel`].
//!
//! Exactly one OS process and one open channel exist per handle. Both are
//! released when [`PluginSupervisor::terminate`] completes, and the child is
//! spawned with `kill_on_drop` so the process is reclaimed even if the
//! caller unwinds without terminating.

use crate::channel::{Channel, ChannelIo};
use chrono::{DateTime, Utc};
use pf_protocol::frame::{methods, Frame};
use pf_protocol::handshake::{parse_handshake_line, Endpoint, Handshake, HandshakeError};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

/// Bounded wait for the best-effort shutdown call during graceful termination.
const SHUTDOWN_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that can occur while launching a plugin.
#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    /// No executable exists at the expected path.
    #[error("plugin executable not found: {0}")]
    ExecNotFound(PathBuf),

    /// The executable exists but cannot be run.
    #[error("plugin executable not runnable: {0}")]
    PermissionDenied(PathBuf),

    /// Any other spawn failure.
    #[error("failed to spawn plugin {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The plugin never became usable during the startup handshake.
    #[error("plugin handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The advertised endpoint could not be connected.
    #[error("failed to connect plugin endpoint: {0}")]
    Connect(std::io::Error),
}

/// How to terminate a plugin process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateMode {
    /// Ask the plugin to exit via a `shutdown` call, then wait up to the
    /// grace period before escalating to a kill.
    Graceful,
    /// Kill the process immediately.
    Forced,
}

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a freshly spawned plugin has to print its handshake line.
    pub handshake_timeout: Duration,

    /// How long a gracefully terminated plugin has to exit on its own.
    pub grace_period: Duration,

    /// Environment variables forwarded to the plugin process. Everything
    /// else is stripped, so inherited secrets never reach plugin code.
    pub env_allowlist: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(3),
            env_allowlist: vec![
                "PATH".to_string(),
                "HOME".to_string(),
                "TMPDIR".to_string(),
            ],
        }
    }
}

/// A running plugin process together with its RPC channel.
///
/// Exclusively owned for the lifetime of one run; destroyed (process
/// reaped) when the session ends or on forced kill.
pub struct PluginHandle {
    child: Child,
    pid: Option<u32>,
    executable: PathBuf,
    started_at: DateTime<Utc>,
    handshake: Handshake,
    channel: Option<Channel>,
    terminated: bool,
}

impl PluginHandle {
    /// OS process id, if the process was ever observed alive.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The executable this handle was launched from.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// When the process was spawned.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The handshake the plugin announced at startup.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// The RPC channel, if not yet released by termination.
    ///
    /// The channel is lent to exactly one execution session at a time.
    pub fn channel_mut(&mut self) -> Option<&mut Channel> {
        self.channel.as_mut()
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("pid", &self.pid)
            .field("executable", &self.executable)
            .field("terminated", &self.terminated)
            .finish()
    }
}

/// Spawns, handshakes, observes, and terminates plugin processes.
#[derive(Debug, Clone, Default)]
pub struct PluginSupervisor {
    config: SupervisorConfig,
}

impl PluginSupervisor {
    /// Create a supervisor with the given configuration.
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Launch a plugin executable and perform the startup handshake.
    ///
    /// On success the returned handle owns the child process and an open
    /// channel to the plugin's RPC endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::ExecNotFound`] / [`LaunchError::PermissionDenied`]
    /// for configuration problems, and propagates [`HandshakeError`] when the
    /// plugin never announces a usable endpoint. The child is killed before
    /// any error is returned.
    pub async fn launch(&self, executable: &Path) -> Result<PluginHandle, LaunchError> {
        let mut cmd = Command::new(executable);
        cmd.env_clear();
        for key in &self.config.env_allowlist {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => LaunchError::ExecNotFound(executable.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => {
                LaunchError::PermissionDenied(executable.to_path_buf())
            }
            _ => LaunchError::Spawn {
                path: executable.to_path_buf(),
                source,
            },
        })?;
        let pid = child.id();
        let started_at = Utc::now();

        let stdout = child.stdout.take().ok_or_else(|| LaunchError::Spawn {
            path: executable.to_path_buf(),
            source: std::io::Error::other("stdout was not captured"),
        })?;

        // Drain stderr from the start: a plugin that logs heavily before its
        // handshake must not fill the pipe and stall behind it, and startup
        // diagnostics should reach tracing even when the launch fails.
        if let Some(stderr) = child.stderr.take() {
            drain_output(BufReader::new(stderr).lines(), pid, "stderr");
        }

        let handshake = match self.read_handshake(stdout, pid).await {
            Ok(handshake) => handshake,
            Err(e) => {
                Self::reap(&mut child).await;
                return Err(e.into());
            }
        };

        if handshake.tls {
            // The local process boundary is the trust boundary here; a TLS
            // endpoint would need certificate material this core does not
            // manage.
            Self::reap(&mut child).await;
            return Err(LaunchError::Connect(std::io::Error::other(
                "tls plugin endpoints are not supported",
            )));
        }

        let io: Box<dyn ChannelIo> = match &handshake.endpoint {
            Endpoint::Tcp(addr) => {
                match timeout(self.config.handshake_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => Box::new(stream),
                    Ok(Err(e)) => {
                        Self::reap(&mut child).await;
                        return Err(LaunchError::Connect(e));
                    }
                    Err(_) => {
                        Self::reap(&mut child).await;
                        return Err(LaunchError::Connect(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "endpoint connect timed out",
                        )));
                    }
                }
            }
            Endpoint::Unix(path) => match UnixStream::connect(path).await {
                Ok(stream) => Box::new(stream),
                Err(e) => {
                    Self::reap(&mut child).await;
                    return Err(LaunchError::Connect(e));
                }
            },
        };

        tracing::debug!(
            pid,
            executable = %executable.display(),
            app_version = handshake.app_version,
            "plugin launched and connected"
        );

        Ok(PluginHandle {
            child,
            pid,
            executable: executable.to_path_buf(),
            started_at,
            handshake,
            channel: Some(Channel::new(io)),
            terminated: false,
        })
    }

    /// Read and parse the single authoritative handshake line.
    async fn read_handshake(
        &self,
        stdout: tokio::process::ChildStdout,
        pid: Option<u32>,
    ) -> Result<Handshake, HandshakeError> {
        let mut lines = BufReader::new(stdout).lines();

        let line = match timeout(self.config.handshake_timeout, lines.next_line()).await {
            Err(_) => {
                return Err(HandshakeError::Timeout {
                    waited_ms: self.config.handshake_timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) | Ok(Ok(None)) => {
                return Err(HandshakeError::Malformed {
                    reason: "plugin exited before announcing an endpoint".to_string(),
                })
            }
            Ok(Ok(Some(line))) => line,
        };

        let handshake = parse_handshake_line(&line)?;

        // Anything the plugin prints to stdout after the handshake is noise
        // for diagnostics, but the pipe must stay drained.
        drain_output(lines, pid, "stdout");

        Ok(handshake)
    }

    /// Whether the plugin process is still running.
    pub fn is_alive(&self, handle: &mut PluginHandle) -> bool {
        if handle.terminated {
            return false;
        }
        matches!(handle.child.try_wait(), Ok(None))
    }

    /// Terminate a plugin process and release its resources.
    ///
    /// Graceful termination sends a best-effort `shutdown` call and waits up
    /// to the grace period before escalating to a kill. Idempotent:
    /// terminating an already-exited handle only reaps it. The channel is
    /// closed on every path.
    pub async fn terminate(&self, handle: &mut PluginHandle, mode: TerminateMode) {
        if handle.terminated {
            return;
        }

        if mode == TerminateMode::Graceful {
            if let Some(channel) = handle.channel.as_mut() {
                let shutdown = async {
                    let id = channel.next_call_id();
                    channel
                        .send(&Frame::MethodCall {
                            id,
                            method: methods::SHUTDOWN.to_string(),
                            body: Value::Null,
                        })
                        .await
                };
                if timeout(SHUTDOWN_SEND_TIMEOUT, shutdown).await.is_err() {
                    tracing::debug!(pid = handle.pid, "shutdown call did not go out in time");
                }
            }

            match timeout(self.config.grace_period, handle.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        pid = handle.pid,
                        "plugin ignored graceful shutdown, escalating to kill"
                    );
                    Self::reap(&mut handle.child).await;
                }
            }
        } else {
            Self::reap(&mut handle.child).await;
        }

        handle.channel = None;
        handle.terminated = true;
        tracing::debug!(pid = handle.pid, ?mode, "plugin terminated");
    }

    /// Kill and wait on the child; safe to call on an already-exited process.
    async fn reap(child: &mut Child) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Forward a plugin output stream to tracing, keeping the pipe drained.
fn drain_output<R>(lines: tokio::io::Lines<BufReader<R>>, pid: Option<u32>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = LinesStream::new(lines);
    tokio::spawn(async move {
        while let Some(Ok(line)) = lines.next().await {
            tracing::debug!(pid, stream, "{line}");
        }
    });
}
