//! Integration tests for the plugin process supervisor.
//!
//! These spawn real fake-plugin processes (python3 scripts) and verify the
//! handshake, liveness observation, and termination discipline.

mod common;

use common::{ok_step, plugin_config, write_fake_plugin};
use pf_core::supervisor::{LaunchError, PluginSupervisor, SupervisorConfig, TerminateMode};
use pf_protocol::handshake::HandshakeError;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

fn supervisor() -> PluginSupervisor {
    PluginSupervisor::new(SupervisorConfig {
        handshake_timeout: Duration::from_secs(5),
        grace_period: Duration::from_millis(500),
        ..SupervisorConfig::default()
    })
}

#[tokio::test]
async fn launch_handshake_and_graceful_terminate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = plugin_config(vec![ok_step("build", 0, &[])]);
    let path = write_fake_plugin(dir.path(), "demo", &config);

    let supervisor = supervisor();
    let mut handle = supervisor.launch(&path).await.expect("launch");

    assert!(handle.pid().is_some());
    assert_eq!(handle.handshake().app_version, 1);
    assert!(supervisor.is_alive(&mut handle));
    assert!(handle.channel_mut().is_some());

    supervisor.terminate(&mut handle, TerminateMode::Graceful).await;
    assert!(!supervisor.is_alive(&mut handle));
    assert!(handle.channel_mut().is_none());

    // Terminating an already-exited handle is a no-op.
    supervisor.terminate(&mut handle, TerminateMode::Graceful).await;
    supervisor.terminate(&mut handle, TerminateMode::Forced).await;
    assert!(!supervisor.is_alive(&mut handle));
}

#[tokio::test]
async fn forced_terminate_kills_immediately() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_fake_plugin(dir.path(), "demo", &plugin_config(vec![]));

    let supervisor = supervisor();
    let mut handle = supervisor.launch(&path).await.expect("launch");
    supervisor.terminate(&mut handle, TerminateMode::Forced).await;
    assert!(!supervisor.is_alive(&mut handle));
}

#[tokio::test]
async fn graceful_terminate_escalates_when_shutdown_is_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plugin_config(vec![]);
    config["ignore_shutdown"] = json!(true);
    let path = write_fake_plugin(dir.path(), "stubborn", &config);

    let supervisor = supervisor();
    let mut handle = supervisor.launch(&path).await.expect("launch");

    let started = std::time::Instant::now();
    supervisor.terminate(&mut handle, TerminateMode::Graceful).await;

    assert!(!supervisor.is_alive(&mut handle));
    // Bounded by the grace period, not by the plugin's cooperation.
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn launch_strips_non_allowlisted_environment() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = dir.path().join("env-keys");

    let mut config = plugin_config(vec![]);
    config["env_dump"] = json!(dump.to_str().expect("utf-8 path"));
    let path = write_fake_plugin(dir.path(), "snoop", &config);

    std::env::set_var("PIPEFLOW_TEST_SECRET", "hunter2");
    let supervisor = supervisor();
    let mut handle = supervisor.launch(&path).await.expect("launch");
    supervisor.terminate(&mut handle, TerminateMode::Graceful).await;
    std::env::remove_var("PIPEFLOW_TEST_SECRET");

    let keys: Vec<String> = std::fs::read_to_string(&dump)
        .expect("env dump")
        .lines()
        .map(str::to_string)
        .collect();
    // The inherited secret never reaches plugin code; allow-listed
    // variables survive.
    assert!(!keys.iter().any(|k| k == "PIPEFLOW_TEST_SECRET"));
    assert!(keys.iter().any(|k| k == "PATH"));
}

#[tokio::test]
async fn launch_survives_noisy_stderr_before_handshake() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plugin_config(vec![]);
    // ~512 KiB of stderr, well past any pipe buffer. The handshake must
    // still come through without the plugin blocking on a full pipe.
    config["stderr_flood"] = json!(512);
    let path = write_fake_plugin(dir.path(), "chatty", &config);

    let supervisor = PluginSupervisor::new(SupervisorConfig {
        handshake_timeout: Duration::from_secs(2),
        grace_period: Duration::from_millis(500),
        ..SupervisorConfig::default()
    });
    let mut handle = supervisor.launch(&path).await.expect("launch");
    assert!(supervisor.is_alive(&mut handle));
    supervisor.terminate(&mut handle, TerminateMode::Graceful).await;
}

#[tokio::test]
async fn launch_missing_executable() {
    let supervisor = supervisor();
    let err = supervisor
        .launch(Path::new("/nonexistent/plugin-binary"))
        .await
        .unwrap_err();
    assert!(matches!(err, LaunchError::ExecNotFound(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn launch_non_executable_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("not-executable");
    std::fs::write(&path, "#!/usr/bin/env python3\n").expect("write");

    let supervisor = supervisor();
    let err = supervisor.launch(&path).await.unwrap_err();
    assert!(matches!(err, LaunchError::PermissionDenied(_)));
}

#[tokio::test]
async fn handshake_timeout_when_plugin_is_slow() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plugin_config(vec![]);
    config["sleep_before_handshake"] = json!(30.0);
    let path = write_fake_plugin(dir.path(), "sleepy", &config);

    let supervisor = PluginSupervisor::new(SupervisorConfig {
        handshake_timeout: Duration::from_millis(300),
        ..SupervisorConfig::default()
    });

    let err = supervisor.launch(&path).await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::Handshake(HandshakeError::Timeout { .. })
    ));
}

#[tokio::test]
async fn handshake_garbage_line_is_malformed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plugin_config(vec![]);
    config["bad_handshake"] = json!("hello, I am not a handshake");
    let path = write_fake_plugin(dir.path(), "noisy", &config);

    let err = supervisor().launch(&path).await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::Handshake(HandshakeError::Malformed { .. })
    ));
}

#[tokio::test]
async fn handshake_wrong_core_version_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = plugin_config(vec![]);
    config["bad_handshake"] = json!("1|1|tcp|127.0.0.1:1");
    let path = write_fake_plugin(dir.path(), "old-proto", &config);

    let err = supervisor().launch(&path).await.unwrap_err();
    assert!(matches!(
        err,
        LaunchError::Handshake(HandshakeError::UnsupportedVersion { advertised: 1 })
    ));
}
