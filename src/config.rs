//! Configuration loading and persistence.
//!
//! Reads the optional `.orca.json` at the project root, then applies
//! environment overrides. Everything has a usable default so a bare checkout
//! runs without any configuration.

use std::path::PathBuf;
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{JOB_QUEUE_CAPACITY, MAX_HISTORY_RUNS};

/// Default warm pool size.
pub const DEFAULT_WARM: usize = 2;
/// Default pool cap.
pub const DEFAULT_MAX: usize = 4;

/// Configuration for the orca controller and client.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Eagerly maintained baseline number of workers.
    pub warm: usize,
    /// Hard cap on pool size (`max >= warm`).
    pub max: usize,
    /// Project root mounted read-only into every guest.
    pub project_root: PathBuf,
    /// Build directory: writable guest share, logs, history.
    pub build_dir: PathBuf,
    /// Directory walked for `*_test.sh` when no paths are given.
    pub test_dir: PathBuf,
    /// Base qcow2 image the per-VM overlays derive from.
    pub base_image: PathBuf,
    /// Guest kernel image passed to the hypervisor.
    pub kernel_image: PathBuf,
    /// Executions retained per test path.
    pub max_history_runs: usize,
    /// Dispatch queue capacity.
    pub queue_capacity: usize,
    /// Boot guests with normally-skipped tests enabled.
    pub run_skipped: bool,
}

impl Default for Config {
    fn default() -> Self {
        let project_root = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let build_dir = project_root.join("build");
        Self {
            warm: DEFAULT_WARM,
            max: DEFAULT_MAX,
            test_dir: project_root.join("tests"),
            base_image: build_dir.join("images/guest.qcow2"),
            kernel_image: build_dir.join("images/bzImage"),
            project_root,
            build_dir,
            max_history_runs: MAX_HISTORY_RUNS,
            queue_capacity: JOB_QUEUE_CAPACITY,
            run_skipped: false,
        }
    }
}

impl Config {
    /// Load configuration: file (if present), then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Read `.orca.json` from the current directory.
    fn load_from_file() -> Result<Self> {
        let path = env::current_dir()?.join(".orca.json");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Apply `ORCA_*` environment overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var("ORCA_BUILD_DIR") {
            self.build_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("ORCA_PROJECT_ROOT") {
            self.project_root = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("ORCA_TEST_DIR") {
            self.test_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("ORCA_BASE_IMAGE") {
            self.base_image = PathBuf::from(path);
        }
        if let Ok(path) = env::var("ORCA_KERNEL_IMAGE") {
            self.kernel_image = PathBuf::from(path);
        }
        if let Ok(n) = env::var("ORCA_MAX_HISTORY_RUNS") {
            if let Ok(n) = n.parse() {
                self.max_history_runs = n;
            }
        }
    }

    /// Override pool sizing from a `-j W[:M]` argument.
    ///
    /// `W` alone raises `max` to `W` when needed so the invariant
    /// `max >= warm` holds.
    pub fn apply_pool_sizes(&mut self, spec: &str) -> Result<()> {
        let (warm, max) = parse_pool_spec(spec)?;
        self.warm = warm;
        self.max = max.unwrap_or_else(|| self.max.max(warm));
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.warm >= 1, "warm pool size must be at least 1");
        anyhow::ensure!(
            self.max >= self.warm,
            "max pool size {} must be >= warm size {}",
            self.max,
            self.warm
        );
        Ok(())
    }

    /// Per-test log root: `<build>/test-results`.
    #[must_use]
    pub fn log_root(&self) -> PathBuf {
        self.build_dir.join("test-results")
    }

    /// History store path: `<build>/test-history.json`.
    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.build_dir.join("test-history.json")
    }

    /// Daemon log path: `<build>/orca-server.log`.
    #[must_use]
    pub fn server_log_path(&self) -> PathBuf {
        self.build_dir.join("orca-server.log")
    }

    /// Resource sample log path: `<build>/orca-resources.log`.
    #[must_use]
    pub fn resources_log_path(&self) -> PathBuf {
        self.build_dir.join("orca-resources.log")
    }
}

/// Parse a `-j W[:M]` pool spec into `(warm, Option<max>)`.
fn parse_pool_spec(spec: &str) -> Result<(usize, Option<usize>)> {
    let spec = spec.trim();
    match spec.split_once(':') {
        Some((w, m)) => {
            let warm = w.parse().with_context(|| format!("bad warm size {w:?}"))?;
            let max = m.parse().with_context(|| format!("bad max size {m:?}"))?;
            anyhow::ensure!(max >= warm, "max {max} must be >= warm {warm}");
            Ok((warm, Some(max)))
        }
        None => {
            let warm = spec
                .parse()
                .with_context(|| format!("bad pool size {spec:?}"))?;
            Ok((warm, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = Config::default();
        assert!(config.max >= config.warm);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_pool_spec_forms() {
        assert_eq!(parse_pool_spec("4").unwrap(), (4, None));
        assert_eq!(parse_pool_spec("2:8").unwrap(), (2, Some(8)));
        assert!(parse_pool_spec("8:2").is_err());
        assert!(parse_pool_spec("x").is_err());
    }

    #[test]
    fn test_apply_pool_sizes_keeps_invariant() {
        let mut config = Config::default();
        config.apply_pool_sizes("6").unwrap();
        assert_eq!(config.warm, 6);
        assert!(config.max >= 6);

        config.apply_pool_sizes("1:3").unwrap();
        assert_eq!((config.warm, config.max), (1, 3));
    }

    #[test]
    fn test_derived_paths_live_under_build_dir() {
        let config = Config::default();
        assert!(config.log_root().starts_with(&config.build_dir));
        assert!(config.history_path().starts_with(&config.build_dir));
        assert!(config.server_log_path().starts_with(&config.build_dir));
    }
}
