//! Integration test infrastructure for Conveyor CI.
//!
//! [`TestSystem`] wires every component the way the server does, backed by
//! in-memory stores and scripted fakes for checking and running processes.
//! With the `integration` feature, tests can swap in PostgreSQL running in a
//! testcontainer.
//!
//! # Usage
//!
//! ```ignore
//! use conveyor_tests::TestSystem;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let system = TestSystem::new().await;
//!     // Use system.stores, system.scheduler, system.router(), etc.
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fakes;
pub mod fixtures;
pub mod helpers;

pub use context::{TestContext, TestSystem};
pub use fakes::{FakeCapability, FakeRuntime};
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,conveyor=debug")),
        )
        .with_test_writer()
        .try_init();
}
