//! # pf-protocol
//!
//! Wire protocol and shared data models for pipeflow.
//!
//! This crate defines everything the orchestrator and a plugin executable
//! must agree on:
//! - The one-line startup handshake a plugin prints to announce its RPC
//!   endpoint ([`handshake`])
//! - The length-delimited frame format carried over that endpoint ([`frame`])
//! - The step metadata and result structures exchanged through those frames
//!   ([`models`])
//!
//! ## Design Principles
//!
//! - Minimal dependencies: serde, uuid, chrono, and tokio's io utilities
//! - No behavior beyond encoding/decoding: process management and run
//!   orchestration live in `pf-core`
//! - Wire payloads are JSON, not bit-exact: the framing is the contract, the
//!   payload shapes are versioned through the handshake's app version

pub mod frame;
pub mod handshake;
pub mod models;

// Re-export all public types for convenience
pub use frame::*;
pub use handshake::*;
pub use models::*;
