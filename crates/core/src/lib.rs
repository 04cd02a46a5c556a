//! # pf-core
//!
//! Plugin process supervision and pipeline run execution for pipeflow.
//!
//! This crate provides:
//! - Spawning and handshaking plugin executables ([`supervisor`])
//! - The framed RPC connection to a running plugin ([`channel`])
//! - The per-run state machine driving step execution ([`session`])
//! - The pipeline-id to plugin-descriptor cache ([`registry`])
//! - The consumed job/result sink interface ([`sink`])
//! - The engine composing all of the above for one run ([`engine`])
//! - Configuration loading ([`config`])

pub mod channel;
pub mod config;
pub mod engine;
pub mod registry;
pub mod session;
pub mod sink;
pub mod supervisor;
