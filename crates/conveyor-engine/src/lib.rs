//! Build execution.
//!
//! The [`Engine`] walks a build's compiled plan, placing leaf steps on
//! workers and recording everything that happens in the build's event log.

pub mod config;
pub mod engine;
mod exec;
mod steps;

pub use config::EngineConfig;
pub use engine::{Engine, RecoverySummary};
