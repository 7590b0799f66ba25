//! Job scheduling for Conveyor CI.
//!
//! Each active pipeline gets a [`SchedulerContext`] that repeatedly evaluates
//! its jobs. A ready job has its inputs resolved against the version history,
//! its step tree compiled into a [`Plan`](conveyor_core::plan::Plan), and a
//! build created and handed to the build dispatcher.

pub mod compiler;
pub mod context;
pub mod resolver;
pub mod runner;

pub use compiler::{CompileError, CompileInputs, JobInput, compile_job, compile_one_off, job_inputs};
pub use context::{JobDecision, NotReadyReason, SchedulerContext, SchedulerDeps, TickSummary, TriggerOutcome};
pub use resolver::{InputResolver, Resolution, ResolvedInput};
pub use runner::SchedulerRunner;
