//! HTTP API server for Conveyor CI.
//!
//! Everything lives under `/api/v1`; build events are streamed as
//! server-sent events.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
