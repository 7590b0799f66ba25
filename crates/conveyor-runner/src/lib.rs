//! Process execution for Conveyor CI.
//!
//! [`HostRuntime`] runs get, put and task processes directly on the host,
//! with volumes as plain directories. Resource types are provided as script
//! directories laid out as `<scripts_dir>/<type>/{check,in,out}`, speaking JSON
//! on stdin and stdout. [`ScriptChecker`] drives the `check` script.

pub mod config;
pub mod host;
pub mod process;
pub mod script;

pub use config::RuntimeConfig;
pub use host::HostRuntime;
pub use script::ScriptChecker;
