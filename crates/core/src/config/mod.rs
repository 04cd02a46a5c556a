//! Orchestrator configuration.
//!
//! The core consumes operational settings (ports, filesystem roots,
//! timeouts) as inputs; it does not implement the surfaces they describe.

pub mod error;
pub mod loader;
pub mod models;

pub use error::{ConfigError, ConfigResult};
pub use loader::load_config;
pub use models::OrchestratorConfig;
