//! On-disk execution history, one record list per test path.
//!
//! The history feeds two decisions on the next run: the dynamic timeout
//! (from the average duration of passing executions) and streak-based test
//! skipping. It lives in a flat JSON file under the build directory and is
//! written by exactly one client process at a time, so no cross-process
//! locking is needed.
//!
//! A schema `version` field guards against drift: any file that fails to
//! parse or carries a different version resets the store to empty with a
//! warning, so a schema change never blocks a run.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk schema version. Bump on any incompatible change.
const SCHEMA_VERSION: u32 = 1;

/// Outcome of one recorded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Test passed (exit 0 or TODO-directed failure).
    Pass,
    /// Test failed.
    Fail,
    /// Test was skipped without running.
    Skip,
}

/// One recorded execution of a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Run id the execution belonged to.
    pub run_id: String,
    /// When the execution finished.
    pub timestamp: DateTime<Utc>,
    /// Measured duration in seconds.
    pub duration_seconds: f64,
    /// Outcome.
    pub status: ExecutionStatus,
    /// Log file written for this execution, if any output arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Per-test record list plus the running pass-duration aggregate.
///
/// `pass_duration_sum` / `pass_count` are maintained on both append and
/// eviction so the average always reflects exactly the retained passing
/// executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestHistory {
    /// Executions, oldest first.
    pub runs: Vec<Execution>,
    /// Sum of durations over retained passing executions.
    pass_duration_sum: f64,
    /// Count of retained passing executions.
    pass_count: u64,
}

impl TestHistory {
    /// Average duration of retained passing executions.
    #[must_use]
    pub fn expected_duration(&self) -> Option<Duration> {
        if self.pass_count == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            self.pass_duration_sum / self.pass_count as f64,
        ))
    }

    /// Consecutive passes counting back from the newest execution.
    #[must_use]
    pub fn streak(&self) -> u32 {
        self.runs
            .iter()
            .rev()
            .take_while(|e| e.status == ExecutionStatus::Pass)
            .count() as u32
    }

    /// Timestamp of the most recent execution.
    #[must_use]
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.runs.last().map(|e| e.timestamp)
    }
}

/// Serialized file shape.
#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    tests: HashMap<String, TestHistory>,
}

/// The history store: per-test execution lists backed by one JSON file.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    max_runs: usize,
    tests: HashMap<String, TestHistory>,
}

impl HistoryStore {
    /// Load the store, or start empty when the file is absent, unparseable,
    /// or carries a different schema version.
    pub fn load(path: PathBuf, max_runs: usize) -> Self {
        let tests = match fs::read_to_string(&path) {
            Err(_) => HashMap::new(),
            Ok(contents) => match serde_json::from_str::<StoreFile>(&contents) {
                Ok(file) if file.version == SCHEMA_VERSION => file.tests,
                Ok(file) => {
                    log::warn!(
                        "[history] Schema version {} != {SCHEMA_VERSION}, resetting {}",
                        file.version,
                        path.display()
                    );
                    HashMap::new()
                }
                Err(e) => {
                    log::warn!(
                        "[history] Unparseable history {} ({e}), resetting",
                        path.display()
                    );
                    HashMap::new()
                }
            },
        };
        Self {
            path,
            max_runs,
            tests,
        }
    }

    /// Append an execution for `test_path`, evicting over-budget records.
    ///
    /// Evicted executions have their on-disk log files deleted before the
    /// record is dropped, so the store never leaves orphan logs behind.
    pub fn append(&mut self, test_path: &str, execution: Execution) {
        let history = self.tests.entry(test_path.to_string()).or_default();
        if execution.status == ExecutionStatus::Pass {
            history.pass_duration_sum += execution.duration_seconds;
            history.pass_count += 1;
        }
        history.runs.push(execution);

        while history.runs.len() > self.max_runs {
            let evicted = history.runs.remove(0);
            if evicted.status == ExecutionStatus::Pass {
                history.pass_duration_sum -= evicted.duration_seconds;
                history.pass_count = history.pass_count.saturating_sub(1);
                if history.pass_count == 0 {
                    // Clear float residue so an empty aggregate is exactly zero.
                    history.pass_duration_sum = 0.0;
                }
            }
            if let Some(log) = &evicted.log_path {
                if let Err(e) = fs::remove_file(log) {
                    if log.exists() {
                        log::warn!("[history] Failed to delete evicted log {}: {e}", log.display());
                    }
                }
            }
        }
    }

    /// Write the store back, atomically (write-then-rename).
    pub fn save(&self) -> Result<()> {
        let file = StoreFile {
            version: SCHEMA_VERSION,
            tests: self.tests.clone(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(&file).context("history serialize failed")?;
        fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to rename into {}", self.path.display()))?;
        Ok(())
    }

    /// Expected duration for a test, from retained passing executions.
    #[must_use]
    pub fn expected_duration(&self, test_path: &str) -> Option<Duration> {
        self.tests.get(test_path)?.expected_duration()
    }

    /// Consecutive-pass streak for a test.
    #[must_use]
    pub fn streak(&self, test_path: &str) -> u32 {
        self.tests.get(test_path).map_or(0, TestHistory::streak)
    }

    /// Full record for one test path.
    #[must_use]
    pub fn test(&self, test_path: &str) -> Option<&TestHistory> {
        self.tests.get(test_path)
    }

    /// Test paths ordered by most recent execution, newest first.
    #[must_use]
    pub fn recent(&self) -> Vec<(&str, &TestHistory)> {
        let mut entries: Vec<(&str, &TestHistory)> = self
            .tests
            .iter()
            .map(|(path, history)| (path.as_str(), history))
            .collect();
        entries.sort_by_key(|(_, h)| std::cmp::Reverse(h.last_run()));
        entries
    }

    /// Number of tracked test paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// True when no test has history yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
