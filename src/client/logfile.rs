//! Per-test log files.
//!
//! Each execution that produces output gets
//! `<log_root>/<test_path>/<run_id>.log`: a short metadata header followed
//! by the raw output bytes, verbatim. The file is created lazily on the
//! first output byte, so a test that stays silent leaves no file behind.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Metadata recorded at the top of every log file.
#[derive(Debug)]
pub struct LogHeader<'a> {
    /// Test name (path relative to the project root).
    pub test: &'a str,
    /// Worker the job landed on.
    pub worker: &'a str,
    /// Wall-clock start (first output byte).
    pub start: chrono::DateTime<chrono::Local>,
    /// One-line history summary (expected duration, streak).
    pub history: &'a str,
    /// Jobs active on the worker at start.
    pub active_jobs: u32,
}

/// An open per-test log file.
#[derive(Debug)]
pub struct TestLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TestLog {
    /// Create the log file and write the metadata header.
    pub fn create(
        log_root: &Path,
        test_path: &str,
        run_id: &str,
        header: &LogHeader<'_>,
    ) -> Result<Self> {
        let dir = log_root.join(test_path);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(format!("{run_id}.log"));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "# Test: {}", header.test)?;
        writeln!(writer, "# Worker: vm{}", header.worker)?;
        writeln!(writer, "# Start: {}", header.start.format("%Y-%m-%d %H:%M:%S%.3f"))?;
        writeln!(writer, "# History: {}", header.history)?;
        writeln!(writer, "# ActiveJobs: {}", header.active_jobs)?;
        writeln!(writer)?;

        Ok(Self { path, writer })
    }

    /// Append raw output bytes, verbatim.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    /// Flush and close, returning the final path.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {}", self.path.display()))?;
        Ok(self.path)
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
