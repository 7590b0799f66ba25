//! Worker pool management for Conveyor CI.
//!
//! Tracks registered workers through their lifecycle, places leaf steps onto
//! eligible workers and owns container and volume bookkeeping.

pub mod heartbeat;
pub mod placement;
pub mod pool;

pub use heartbeat::HeartbeatService;
pub use placement::{PlacementError, select_worker};
pub use pool::{Placement, PoolConfig, WorkerPool};
