//! The client driver for `orca test`.
//!
//! Discovers tests, submits them as jobs, consumes the streamed frames,
//! assembles per-test log files, parses TAP incrementally, and records
//! everything in the history store. The per-test clock starts at the first
//! output byte, not at submission, so queueing delay never counts against a
//! test's timeout verdict.
//!
//! On SIGINT the driver prints a synthetic summary covering finished,
//! in-progress, and never-started tests, shuts down a controller it
//! auto-started, and exits 130.

pub mod commands;
pub mod logfile;
pub mod tap;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::UnixStream;

use crate::config::Config;
use crate::constants::{
    DAEMON_START_BUDGET, EXIT_CODE_INTERRUPTED, EXIT_CODE_TIMEOUT, TIMEOUT_SAFETY_FACTOR,
};
use crate::dilation;
use crate::discover::{self, DiscoveryOptions, SkipMode, TestCase};
use crate::history::{Execution, ExecutionStatus, HistoryStore};
use crate::protocol::{ControlRequest, Frame, FrameReader, FrameWriter, JobSpec};
use crate::server::daemon;

use logfile::{LogHeader, TestLog};
use tap::TapParser;

/// Options for one `orca test` invocation.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Test paths (files or directories); empty means the configured dir.
    pub paths: Vec<std::path::PathBuf>,
    /// Name filter regex.
    pub filter: Option<String>,
    /// Exclude tests with a pass streak above this.
    pub streak_max: Option<u32>,
    /// Skip-annotation handling.
    pub skip_mode: SkipMode,
    /// Disable the seeded shuffle.
    pub no_shuffle: bool,
    /// Pin every job to one worker.
    pub target: Option<String>,
    /// Run tests one at a time (no pool-level concurrency).
    pub strict_isolation: bool,
}

/// Outcome of one executed test.
#[derive(Debug)]
struct TestResult {
    name: String,
    passed: bool,
    timed_out: bool,
    todo: bool,
    all_skipped: bool,
    exit_code: i32,
    duration: Duration,
    log_path: Option<std::path::PathBuf>,
    error: Option<String>,
}

/// In-flight state for one submitted job.
struct JobState {
    test: TestCase,
    tap: TapParser,
    log: Option<TestLog>,
    started: Option<Instant>,
    worker: Option<String>,
}

impl JobState {
    fn new(test: TestCase) -> Self {
        Self {
            test,
            tap: TapParser::new(),
            log: None,
            started: None,
            worker: None,
        }
    }
}

/// Run a test invocation end to end. Returns the process exit code.
pub async fn run_tests(config: &Config, opts: RunOptions) -> Result<i32> {
    let run_id = generate_run_id();
    let mut history = HistoryStore::load(config.history_path(), config.max_history_runs);

    let discovery = DiscoveryOptions {
        filter: opts
            .filter
            .as_deref()
            .map(regex::Regex::new)
            .transpose()
            .context("bad --filter regex")?,
        streak_max: opts.streak_max,
        skip_mode: opts.skip_mode,
        shuffle: !opts.no_shuffle,
        seed: seed_from(&run_id),
    };
    let paths = if opts.paths.is_empty() {
        vec![config.test_dir.clone()]
    } else {
        opts.paths.clone()
    };
    let tests = discover::discover(&paths, &config.project_root, &history, &discovery)?;
    if tests.is_empty() {
        println!("No tests found.");
        return Ok(0);
    }
    println!(
        "Running {} test(s), run {run_id} (dilation {:.2})",
        tests.len(),
        dilation::factor()
    );

    let (stream, started_daemon) = connect_or_start(config).await?;
    let (read, write) = stream.into_split();
    let writer = FrameWriter::new(write);
    let mut reader = FrameReader::new(read);

    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))?;

    let total = tests.len();
    let mut pending: VecDeque<(usize, TestCase)> = tests.into_iter().enumerate().collect();
    let mut jobs: HashMap<String, JobState> = HashMap::new();
    let mut results: Vec<TestResult> = Vec::new();
    let run_started = Instant::now();

    // Strict isolation keeps exactly one job in flight so tests never share
    // the pool window; otherwise everything is queued upfront and the
    // bounded server queue provides back-pressure.
    let window = if opts.strict_isolation { 1 } else { usize::MAX };

    while jobs.len() < window {
        let Some((idx, test)) = pending.pop_front() else {
            break;
        };
        let job_id = submit_test(&writer, &run_id, idx, &test, &opts).await?;
        jobs.insert(job_id, JobState::new(test));
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    while results.len() < total {
        if interrupted.load(Ordering::Relaxed) {
            print_interrupt_summary(&results, &jobs, &pending);
            if started_daemon {
                let _ = writer.send_value(&ControlRequest::Shutdown {}).await;
            }
            history.save().context("failed to save history")?;
            return Ok(EXIT_CODE_INTERRUPTED);
        }

        let frame = tokio::select! {
            frame = reader.next_frame() => match frame? {
                Some(frame) => frame,
                None => anyhow::bail!("controller connection closed mid-run"),
            },
            _ = ticker.tick() => continue,
        };

        let Some(job_id) = frame.job_ref().map(str::to_string) else {
            continue;
        };
        let Some(state) = jobs.get_mut(&job_id) else {
            continue;
        };

        match frame {
            Frame::Stdout { data, worker_id, .. } | Frame::Stderr { data, worker_id, .. } => {
                if let Some(id) = worker_id {
                    state.worker.get_or_insert(id);
                }
                on_output(state, config, &run_id, &history, &data);
            }
            Frame::Exit { exit_code, .. } => {
                let state = jobs.remove(&job_id).expect("state checked above");
                let result = finalize(state, exit_code, None);
                record(&mut history, &run_id, &result);
                print_result_line(&result);
                results.push(result);

                if let Some((idx, test)) = pending.pop_front() {
                    let job_id = submit_test(&writer, &run_id, idx, &test, &opts).await?;
                    jobs.insert(job_id, JobState::new(test));
                }
            }
            Frame::Error { error, .. } => {
                let state = jobs.remove(&job_id).expect("state checked above");
                let result = finalize(state, 1, Some(error));
                record(&mut history, &run_id, &result);
                print_result_line(&result);
                results.push(result);

                if let Some((idx, test)) = pending.pop_front() {
                    let job_id = submit_test(&writer, &run_id, idx, &test, &opts).await?;
                    jobs.insert(job_id, JobState::new(test));
                }
            }
            _ => {}
        }
    }

    history.save().context("failed to save history")?;
    print_summary(&results, run_started.elapsed());

    let failed = results.iter().any(|r| !r.passed);
    Ok(i32::from(failed))
}

/// Submit one test as a job; returns the job id.
async fn submit_test(
    writer: &FrameWriter<tokio::net::unix::OwnedWriteHalf>,
    run_id: &str,
    idx: usize,
    test: &TestCase,
    opts: &RunOptions,
) -> Result<String> {
    let job_id = format!("{run_id}-{idx:03}");
    let mut env = HashMap::new();
    env.insert("TEST_NAME".to_string(), test.name.clone());
    env.insert(
        dilation::TIME_DILATION_ENV.to_string(),
        format!("{:.2}", dilation::factor()),
    );
    let job = JobSpec {
        id: job_id.clone(),
        command: Vec::new(),
        // Relative to the agent's working directory, which is the guest's
        // project mount.
        script: Some(std::path::PathBuf::from(&test.name)),
        env,
        tty: false,
        timeout_seconds: test.effective_timeout,
        target_worker: opts.target.clone(),
    };
    writer
        .send_value(&ControlRequest::SubmitJob { job })
        .await
        .context("job submission failed")?;
    Ok(job_id)
}

/// Handle an output chunk: lazy log creation, verbatim append, TAP feed.
fn on_output(
    state: &mut JobState,
    config: &Config,
    run_id: &str,
    history: &HistoryStore,
    data: &[u8],
) {
    if state.log.is_none() {
        // The clock starts at first output, not submission.
        state.started = Some(Instant::now());
        let worker = state.worker.clone().unwrap_or_else(|| "?".to_string());
        let history_line = match history.expected_duration(&state.test.name) {
            Some(expected) => format!(
                "expected {:.1}s, streak {}",
                expected.as_secs_f64(),
                history.streak(&state.test.name)
            ),
            None => "no prior runs".to_string(),
        };
        let header = LogHeader {
            test: &state.test.name,
            worker: &worker,
            start: chrono::Local::now(),
            history: &history_line,
            active_jobs: 1,
        };
        match TestLog::create(&config.log_root(), &state.test.name, run_id, &header) {
            Ok(log) => {
                println!("[start] {} (vm{worker})", state.test.name);
                state.log = Some(log);
            }
            Err(e) => log::error!("[client] Log create failed for {}: {e:#}", state.test.name),
        }
    }
    if let Some(log) = &mut state.log {
        if let Err(e) = log.append(data) {
            log::error!("[client] Log write failed: {e:#}");
        }
    }
    state.tap.feed(data);
}

/// Close out a finished job and judge it.
fn finalize(mut state: JobState, exit_code: i32, error: Option<String>) -> TestResult {
    state.tap.finish();
    let duration = state.started.map(|s| s.elapsed()).unwrap_or_default();
    let log_path = state.log.and_then(|log| log.finish().ok());

    let static_cap = state.test.effective_timeout as f64 * TIMEOUT_SAFETY_FACTOR;
    let timed_out = exit_code == EXIT_CODE_TIMEOUT
        || (state.test.effective_timeout > 0 && duration.as_secs_f64() > static_cap);

    // A TODO directive promises eventual success; it turns failure into a
    // tolerated pass. A timeout always fails.
    let passed = if timed_out {
        false
    } else {
        state.tap.todo || exit_code == 0
    };

    TestResult {
        name: state.test.name,
        passed,
        timed_out,
        todo: state.tap.todo,
        all_skipped: state.tap.all_skipped(),
        exit_code,
        duration,
        log_path,
        error,
    }
}

/// Append one result to the history store.
fn record(history: &mut HistoryStore, run_id: &str, result: &TestResult) {
    let status = if result.passed {
        if result.all_skipped {
            ExecutionStatus::Skip
        } else {
            ExecutionStatus::Pass
        }
    } else {
        ExecutionStatus::Fail
    };
    history.append(
        &result.name,
        Execution {
            run_id: run_id.to_string(),
            timestamp: chrono::Utc::now(),
            duration_seconds: result.duration.as_secs_f64(),
            status,
            log_path: result.log_path.clone(),
        },
    );
}

fn print_result_line(result: &TestResult) {
    let secs = result.duration.as_secs_f64();
    if result.passed {
        let annotation = if result.todo && result.exit_code == 0 {
            " [TODO (unexpected pass)]"
        } else if result.todo {
            " [TODO]"
        } else if result.all_skipped {
            " [all skipped]"
        } else {
            ""
        };
        println!("[ pass ] {} ({secs:.1}s){annotation}", result.name);
    } else {
        let cause = if result.timed_out {
            " [timeout]"
        } else {
            ""
        };
        let log = result
            .log_path
            .as_ref()
            .map(|p| format!(" -> {}", p.display()))
            .unwrap_or_default();
        println!(
            "[ FAIL ] {} (exit {}, {secs:.1}s){cause}{log}",
            result.name, result.exit_code
        );
        if let Some(error) = &result.error {
            println!("         {error}");
        }
    }
}

fn print_summary(results: &[TestResult], elapsed: Duration) {
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.len() - passed;
    println!();
    println!(
        "=== {passed} passed, {failed} failed of {} in {:.1}s",
        results.len(),
        elapsed.as_secs_f64()
    );
    if failed > 0 {
        println!("failed:");
        for result in results.iter().filter(|r| !r.passed) {
            let log = result
                .log_path
                .as_ref()
                .map(|p| format!(" -> {}", p.display()))
                .unwrap_or_default();
            println!("  {}{log}", result.name);
        }
    }

    let mut slowest: Vec<&TestResult> = results.iter().collect();
    slowest.sort_by(|a, b| b.duration.cmp(&a.duration));
    let notable: Vec<&TestResult> = slowest
        .into_iter()
        .take(3)
        .filter(|r| r.duration >= Duration::from_secs(5))
        .collect();
    if !notable.is_empty() {
        println!("slowest:");
        for result in notable {
            println!("  {} ({:.1}s)", result.name, result.duration.as_secs_f64());
        }
    }
}

/// The synthetic summary printed on SIGINT.
fn print_interrupt_summary(
    results: &[TestResult],
    jobs: &HashMap<String, JobState>,
    pending: &VecDeque<(usize, TestCase)>,
) {
    println!();
    println!("Interrupted.");
    let passed = results.iter().filter(|r| r.passed).count();
    println!(
        "  finished: {passed} passed, {} failed",
        results.len() - passed
    );
    let in_progress: Vec<&JobState> = jobs.values().filter(|s| s.log.is_some()).collect();
    if !in_progress.is_empty() {
        println!("  in progress:");
        for state in in_progress {
            let log = state
                .log
                .as_ref()
                .map(|l| l.path().display().to_string())
                .unwrap_or_default();
            println!("    {} -> {log}", state.test.name);
        }
    }
    let never_started = pending.len() + jobs.values().filter(|s| s.log.is_none()).count();
    println!("  never started: {never_started}");
}

/// Connect to the controller, auto-starting a transient daemon if absent.
///
/// Returns the stream and whether this invocation started the daemon.
pub async fn connect_or_start(config: &Config) -> Result<(UnixStream, bool)> {
    let path = daemon::control_socket_path()?;
    if let Ok(stream) = UnixStream::connect(&path).await {
        return Ok((stream, false));
    }

    daemon::cleanup_stale_files();
    log::info!("[client] No controller at {}, starting one", path.display());
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("server")
        .arg("--daemon")
        .arg("-j")
        .arg(format!("{}:{}", config.warm, config.max))
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    // Detach from our process group so a client SIGINT does not take the
    // daemon down with it.
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
    cmd.spawn().context("failed to start orca server --daemon")?;

    let deadline = Instant::now() + DAEMON_START_BUDGET;
    loop {
        match UnixStream::connect(&path).await {
            Ok(stream) => return Ok((stream, true)),
            Err(e) if Instant::now() >= deadline => {
                return Err(e).context("auto-started controller never came up");
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
}

/// Run id: local timestamp plus a random suffix, unique per invocation.
pub fn generate_run_id() -> String {
    let now = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let suffix: u16 = rand::random();
    format!("{now}-{suffix:04x}")
}

/// Stable shuffle seed derived from the run id.
fn seed_from(run_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    run_id.hash(&mut hasher);
    hasher.finish()
}

/// Synthetic job id for `shell`/`exec` invocations.
pub fn generate_job_id(kind: &str) -> String {
    let suffix: u32 = rand::random();
    format!("{kind}-{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_case(effective_timeout: u64) -> TestCase {
        TestCase {
            path: "tests/a_test.sh".into(),
            name: "tests/a_test.sh".into(),
            static_timeout: effective_timeout,
            effective_timeout,
            skip: None,
        }
    }

    fn state_with_output(timeout: u64, output: &str) -> JobState {
        let mut state = JobState::new(test_case(timeout));
        state.started = Some(Instant::now());
        state.tap.feed(output.as_bytes());
        state
    }

    #[test]
    fn test_exit_zero_passes() {
        let result = finalize(state_with_output(30, "1..1\nok 1\n"), 0, None);
        assert!(result.passed);
        assert!(!result.timed_out);
        assert!(!result.todo);
    }

    #[test]
    fn test_exit_nonzero_fails() {
        let result = finalize(state_with_output(30, "1..1\nnot ok 1\n"), 1, None);
        assert!(!result.passed);
    }

    #[test]
    fn test_exit_code_decides_over_tap_results() {
        // The verdict is exit_code OR todo; TAP failures alone do not
        // flip an exit-0 script.
        let result = finalize(
            state_with_output(30, "1..3\nok 1\nok 2 # SKIP missing nft\nnot ok 3\n"),
            0,
            None,
        );
        assert!(result.passed);

        let result = finalize(
            state_with_output(30, "1..3\nok 1\nok 2 # SKIP missing nft\nnot ok 3\n"),
            1,
            None,
        );
        assert!(!result.passed);
    }

    #[test]
    fn test_todo_turns_failure_into_pass() {
        let result = finalize(
            state_with_output(30, "1..1\nnot ok 1 # TODO: not yet\n"),
            1,
            None,
        );
        assert!(result.passed);
        assert!(result.todo);
    }

    #[test]
    fn test_exit_124_is_timeout_fail() {
        let result = finalize(state_with_output(30, ""), EXIT_CODE_TIMEOUT, None);
        assert!(result.timed_out);
        assert!(!result.passed);
    }

    #[test]
    fn test_timeout_beats_todo() {
        let result = finalize(
            state_with_output(30, "not ok 1 # TODO: someday\n"),
            EXIT_CODE_TIMEOUT,
            None,
        );
        assert!(result.timed_out);
        assert!(!result.passed);
    }

    #[test]
    fn test_error_frame_fails_job() {
        let result = finalize(
            state_with_output(30, ""),
            1,
            Some("VM 3 disconnected".into()),
        );
        assert!(!result.passed);
        assert_eq!(result.error.as_deref(), Some("VM 3 disconnected"));
    }

    #[test]
    fn test_no_output_job_has_no_log() {
        let state = JobState::new(test_case(30));
        let result = finalize(state, 0, None);
        assert!(result.log_path.is_none());
        assert!(result.passed);
        assert_eq!(result.duration, Duration::ZERO);
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
    }

    #[test]
    fn test_seed_is_stable() {
        assert_eq!(seed_from("20260801-abc"), seed_from("20260801-abc"));
        assert_ne!(seed_from("a"), seed_from("b"));
    }
}
