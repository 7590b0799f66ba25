//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root for volume and container directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Root of the resource type script directories.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    /// Shell used when a task's run path is not executable on its own.
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("conveyor")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("/opt/conveyor/resource-types")
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            scripts_dir: default_scripts_dir(),
            shell: default_shell(),
        }
    }
}

impl RuntimeConfig {
    pub fn volumes_dir(&self) -> PathBuf {
        self.work_dir.join("volumes")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.work_dir.join("containers")
    }

    /// Path of a resource type script, preferring the exact type over its base.
    pub fn script_path(&self, resource_type: &str, base_type: Option<&str>, script: &str) -> PathBuf {
        let exact = self.scripts_dir.join(resource_type).join(script);
        match base_type {
            Some(base) if !exists(&exact) => self.scripts_dir.join(base).join(script),
            _ => exact,
        }
    }
}

fn exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}
