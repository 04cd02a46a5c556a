//! Configuration structures.

use crate::session::SessionTimeouts;
use crate::supervisor::SupervisorConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_listen_port() -> u16 {
    8080
}

fn default_home_path() -> PathBuf {
    PathBuf::from(".pipeflow")
}

fn default_handshake_timeout_secs() -> u64 {
    5
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_grace_period_secs() -> u64 {
    3
}

fn default_env_allowlist() -> Vec<String> {
    vec![
        "PATH".to_string(),
        "HOME".to_string(),
        "TMPDIR".to_string(),
    ]
}

/// Top-level orchestrator configuration.
///
/// Every field has a default, so an empty (or absent) config file yields a
/// usable configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Port the orchestrator's own API listens on. Operational surface
    /// only: consumed by the embedding server, not by the core.
    pub listen_port: u16,

    /// Filesystem root for persisted job data.
    pub home_path: PathBuf,

    /// Directory plugin executables are resolved under. Defaults to
    /// `<home_path>/plugins` when not set.
    pub plugins_root: Option<PathBuf>,

    /// Seconds a freshly spawned plugin has to print its handshake line.
    pub handshake_timeout_secs: u64,

    /// Seconds one step may run before the session fails it.
    pub step_timeout_secs: u64,

    /// Seconds a gracefully terminated plugin has to exit on its own.
    pub grace_period_secs: u64,

    /// Environment variables forwarded to plugin processes.
    pub env_allowlist: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            home_path: default_home_path(),
            plugins_root: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            grace_period_secs: default_grace_period_secs(),
            env_allowlist: default_env_allowlist(),
        }
    }
}

impl OrchestratorConfig {
    /// Effective plugin executable root.
    pub fn plugins_root(&self) -> PathBuf {
        self.plugins_root
            .clone()
            .unwrap_or_else(|| self.home_path.join("plugins"))
    }

    /// Directory job journals are written under.
    pub fn jobs_root(&self) -> PathBuf {
        self.home_path.join("jobs")
    }

    /// Supervisor settings derived from this configuration.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            grace_period: Duration::from_secs(self.grace_period_secs),
            env_allowlist: self.env_allowlist.clone(),
        }
    }

    /// Session timeouts derived from this configuration.
    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            step: Duration::from_secs(self.step_timeout_secs),
        }
    }
}
