//! Server configuration.
//!
//! Layered from built-in defaults, an optional YAML file and `CONVEYOR__`
//! environment variables, in that order. Nested keys use `__` in the
//! environment, e.g. `CONVEYOR__DATABASE__URL`.

use conveyor_checker::CheckerConfig;
use conveyor_core::worker::WorkerRegistration;
use conveyor_engine::EngineConfig;
use conveyor_runner::RuntimeConfig;
use conveyor_workers::PoolConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub log_format: LogFormat,
    /// Keep all state in memory instead of PostgreSQL.
    pub in_memory: bool,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerSettings,
    pub checker: CheckerSettings,
    pub workers: WorkerSettings,
    pub engine: EngineSettings,
    pub events: EventSettings,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
    /// How often the set of active pipelines is re-read.
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerSettings {
    pub tick_interval_secs: u64,
    pub default_interval_secs: u64,
    pub timeout_secs: u64,
    pub max_concurrent: usize,
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub heartbeat_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub local: LocalWorker,
}

/// The worker hosted by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalWorker {
    pub enabled: bool,
    pub name: String,
    pub platform: String,
    /// Empty lists do not survive the defaults layer.
    #[serde(default)]
    pub tags: Vec<String>,
    pub resource_types: Vec<String>,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub abort_poll_interval_ms: u64,
    pub output_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// How often SSE followers re-read the store for events from other processes.
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            log_format: LogFormat::Plain,
            in_memory: false,
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
            },
            scheduler: SchedulerSettings {
                tick_interval_secs: 10,
                sync_interval_secs: 10,
            },
            checker: CheckerSettings {
                tick_interval_secs: 10,
                default_interval_secs: 60,
                timeout_secs: 300,
                max_concurrent: 32,
                sync_interval_secs: 10,
            },
            workers: WorkerSettings {
                heartbeat_ttl_secs: 30,
                sweep_interval_secs: 10,
                local: LocalWorker {
                    enabled: true,
                    name: "local".to_string(),
                    platform: "linux".to_string(),
                    tags: vec![],
                    resource_types: vec!["git".to_string(), "time".to_string()],
                    heartbeat_interval_secs: 10,
                },
            },
            engine: EngineSettings {
                abort_poll_interval_ms: 2000,
                output_buffer: 256,
            },
            events: EventSettings {
                poll_interval_ms: 500,
            },
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load defaults, then `file` if given, then the environment.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("CONVEYOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn checker_config(&self) -> CheckerConfig {
        CheckerConfig {
            tick_interval: Duration::from_secs(self.checker.tick_interval_secs),
            default_interval: Duration::from_secs(self.checker.default_interval_secs),
            timeout: Duration::from_secs(self.checker.timeout_secs),
            max_concurrent: self.checker.max_concurrent,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            heartbeat_ttl: Duration::from_secs(self.workers.heartbeat_ttl_secs),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            abort_poll_interval: Duration::from_millis(self.engine.abort_poll_interval_ms),
            output_buffer: self.engine.output_buffer,
        }
    }

    pub fn local_registration(&self) -> WorkerRegistration {
        let local = &self.workers.local;
        WorkerRegistration {
            name: local.name.clone(),
            platform: local.platform.clone(),
            tags: local.tags.clone(),
            team: None,
            resource_types: local.resource_types.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.log_format, LogFormat::Plain);
        assert_eq!(config.checker_config().default_interval, Duration::from_secs(60));
        assert_eq!(config.checker_config().timeout, Duration::from_secs(300));
        assert_eq!(config.checker_config().max_concurrent, 32);
        assert_eq!(config.pool_config().heartbeat_ttl, Duration::from_secs(30));
        assert!(config.database.url.is_none());
        assert!(config.local_registration().tags.is_empty());
        assert_eq!(config.local_registration().resource_types, vec!["git", "time"]);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "listen: 127.0.0.1:9090\nlog_format: json\nchecker:\n  max_concurrent: 4\nworkers:\n  local:\n    name: builder-1\n    tags: [gpu]"
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9090");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.checker.max_concurrent, 4);
        // Untouched siblings keep their defaults.
        assert_eq!(config.checker.timeout_secs, 300);
        assert_eq!(config.local_registration().name, "builder-1");
        assert_eq!(config.local_registration().tags, vec!["gpu"]);
        assert!(config.workers.local.enabled);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ServerConfig::load(Some(Path::new("/nonexistent/conveyor.yaml"))).is_err());
    }
}
