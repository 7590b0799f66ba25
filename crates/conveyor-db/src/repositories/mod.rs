//! Repository implementations for PostgreSQL.

mod build;
mod event;
mod lock;
mod pipeline;
mod version;
mod worker;

pub use build::PgBuildRepository;
pub use event::PgEventStore;
pub use lock::PgLockFactory;
pub use pipeline::PgPipelineRepository;
pub use version::PgVersionStore;
pub use worker::PgWorkerRepository;
