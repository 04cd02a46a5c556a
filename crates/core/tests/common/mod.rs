//! Common test utilities for the pf-core integration tests.

pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::*;
