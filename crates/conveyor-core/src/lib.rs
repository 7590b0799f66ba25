//! Conveyor CI Core
//!
//! Domain types, port traits, and error handling shared by every Conveyor
//! component. Pipelines, versions, plans, builds, events and workers are
//! defined here; storage and execution adapters implement the traits in
//! [`ports`].

pub mod build;
pub mod check;
pub mod error;
pub mod events;
pub mod ids;
pub mod lock;
pub mod pipeline;
pub mod plan;
pub mod ports;
pub mod version;
pub mod worker;

pub use error::{Error, Result};
pub use ids::*;
