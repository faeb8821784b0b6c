#![deny(unsafe_code)]

//! Shared test utilities for the Colloquy workspace.
//!
//! Provides reusable fixtures, config builders, scripted provider backends,
//! and tracing helpers so that individual crate tests stay concise and
//! consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! colloquy-test-utils = { workspace = true }
//! ```

pub mod backend;
pub mod config;
pub mod fixtures;
pub mod tracing_setup;
