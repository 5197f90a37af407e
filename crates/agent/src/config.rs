//! Environment-derived configuration, resolved once at startup.

use std::path::{Path, PathBuf};

const DEFAULT_WORKDIR: &str = "/opt/healthagent";
const DEFAULT_NOTIFIER: &str = "/opt/cycle/jetpack/bin/jetpack";

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Process-wide configuration: working directory layout and the external
/// notifier binary path. `PUBLISH_CC` and `DCGM_TEST_MODE` are read directly
/// by [`healthagent_reporter::Reporter`] and the GPU monitor respectively,
/// since both are narrowly scoped to those components.
#[derive(Debug, Clone)]
pub struct Config {
    pub workdir: PathBuf,
    pub debug_mode: bool,
    pub notifier_path: PathBuf,
}

impl Config {
    /// Resolve from the environment, then apply CLI overrides.
    #[must_use]
    pub fn load(cli_debug: bool, cli_workdir: Option<PathBuf>) -> Self {
        let workdir = cli_workdir
            .or_else(|| std::env::var("HEALTHAGENT_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR));
        let debug_mode =
            cli_debug || std::env::var("DEBUG_MODE").map(|v| truthy(&v)).unwrap_or(false);
        let notifier_path = std::env::var("HEALTHAGENT_NOTIFIER")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_NOTIFIER));

        Self { workdir, debug_mode, notifier_path }
    }

    #[must_use]
    pub fn rundir(&self) -> PathBuf {
        self.workdir.join("run")
    }

    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.rundir().join("health.sock")
    }

    #[must_use]
    pub fn module_state_path(&self, module: &str) -> PathBuf {
        self.rundir().join(format!("{module}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_workdir_overrides_environment() {
        // SAFETY: tests run single-threaded within this process's env block.
        unsafe {
            std::env::set_var("HEALTHAGENT_DIR", "/from/env");
        }
        let config = Config::load(false, Some(PathBuf::from("/from/cli")));
        assert_eq!(config.workdir, Path::new("/from/cli"));
        unsafe {
            std::env::remove_var("HEALTHAGENT_DIR");
        }
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        // SAFETY: tests run single-threaded within this process's env block.
        unsafe {
            std::env::remove_var("HEALTHAGENT_DIR");
            std::env::remove_var("DEBUG_MODE");
            std::env::remove_var("HEALTHAGENT_NOTIFIER");
        }
        let config = Config::load(false, None);
        assert_eq!(config.workdir, Path::new(DEFAULT_WORKDIR));
        assert!(!config.debug_mode);
        assert_eq!(config.notifier_path, Path::new(DEFAULT_NOTIFIER));
    }

    #[test]
    fn module_state_path_is_under_rundir() {
        let config = Config { workdir: PathBuf::from("/opt/healthagent"), debug_mode: false, notifier_path: PathBuf::from("/x") };
        assert_eq!(config.module_state_path("gpu"), Path::new("/opt/healthagent/run/gpu.json"));
    }
}
