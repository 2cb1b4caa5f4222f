//! Child execution for the in-VM agent.
//!
//! Both execution modes (pty and pipes) produce the same [`RunningChild`]
//! shape: a process-group id, a channel feeding the child's stdin, a wait
//! receiver, and the forwarder tasks that must drain before `exit` is
//! emitted. [`StreamSink`] is the seam between the two; everything above it
//! (deadline enforcement, exit-code mapping, stdin routing) is shared.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::constants::{DEFAULT_CHILD_PATH, EXIT_CODE_TIMEOUT, STREAM_CHUNK_BYTES};
use crate::protocol::{ExecPayload, Frame};

use super::AgentWriter;

/// Guest path where the project root is mounted read-only.
pub const PROJECT_MOUNT: &str = "/mnt/project";

/// Grace period for pty drain after child exit.
const PTY_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Input routed to a running child's stdin.
#[derive(Debug)]
pub enum StdinMsg {
    /// Write these bytes.
    Data(Vec<u8>),
    /// Close the child's stdin.
    Close,
}

/// Registry of running jobs, shared between the dispatch loop and job tasks.
pub type JobTable = Arc<Mutex<HashMap<String, JobControl>>>;

/// Handle the dispatch loop keeps for a running job.
#[derive(Debug)]
pub struct JobControl {
    /// Child pid; also its process-group id (children are session leaders).
    pub pid: i32,
    /// Channel into the job's stdin pump.
    pub stdin_tx: mpsc::UnboundedSender<StdinMsg>,
}

/// A launched child with its stream plumbing.
pub struct RunningChild {
    /// Child pid / process-group id.
    pub pid: i32,
    /// Sender feeding the stdin pump task.
    pub stdin_tx: mpsc::UnboundedSender<StdinMsg>,
    /// Resolves with the raw exit code (`None` when killed by a signal).
    pub wait_rx: oneshot::Receiver<Option<i32>>,
    /// Output forwarder tasks; awaited before the `exit` frame so every
    /// produced byte is on the wire first.
    pub drain: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RunningChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningChild").field("pid", &self.pid).finish_non_exhaustive()
    }
}

/// Resolved launch parameters, shared by both sinks.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Argument vector; `command[0]` is the executable.
    pub command: Vec<String>,
    /// Environment overlay applied on top of the agent's environment.
    pub env: Vec<(String, String)>,
    /// Resolved working directory.
    pub cwd: PathBuf,
}

impl LaunchSpec {
    /// Resolve an exec payload against the guest filesystem.
    ///
    /// Working directory defaults to `/`, upgraded to the project mount when
    /// present, overridden by the payload. `PATH` is pinned to a fixed safe
    /// value when neither the agent nor the payload provides one.
    pub fn resolve(payload: &ExecPayload) -> Result<Self> {
        anyhow::ensure!(!payload.command.is_empty(), "exec payload has no command");

        let cwd = match &payload.cwd {
            Some(dir) => dir.clone(),
            None => {
                let mount = Path::new(PROJECT_MOUNT);
                if mount.is_dir() {
                    mount.to_path_buf()
                } else {
                    PathBuf::from("/")
                }
            }
        };

        let mut env: Vec<(String, String)> = payload
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let has_path =
            env.iter().any(|(k, _)| k == "PATH") || std::env::var_os("PATH").is_some();
        if !has_path {
            env.push(("PATH".to_string(), DEFAULT_CHILD_PATH.to_string()));
        }

        Ok(Self {
            command: payload.command.clone(),
            env,
            cwd,
        })
    }
}

/// Stamps job output frames and hides the writer type from the sinks.
#[derive(Debug, Clone)]
pub struct OutputSender {
    writer: AgentWriter,
    job: String,
}

impl OutputSender {
    /// Forward a stdout chunk.
    pub async fn stdout(&self, data: Vec<u8>) {
        let frame = Frame::Stdout {
            job: self.job.clone(),
            data,
            worker_id: None,
        };
        if let Err(e) = self.writer.send(&frame).await {
            log::warn!("[agent] Dropping stdout chunk for {}: {e}", self.job);
        }
    }

    /// Forward a stderr chunk.
    pub async fn stderr(&self, data: Vec<u8>) {
        let frame = Frame::Stderr {
            job: self.job.clone(),
            data,
            worker_id: None,
        };
        if let Err(e) = self.writer.send(&frame).await {
            log::warn!("[agent] Dropping stderr chunk for {}: {e}", self.job);
        }
    }
}

/// The seam between the shared job lifecycle and the two stream plumbings.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Launch the child and wire its streams to `out`.
    async fn launch(&self, spec: &LaunchSpec, out: &OutputSender) -> Result<RunningChild>;
}

/// Pipe-backed execution: separate stdout/stderr flows, real stdin handle.
#[derive(Debug)]
pub struct PipeSink;

/// Pty-backed execution: a single interleaved output flow from the master.
#[derive(Debug)]
pub struct PtySink;

#[async_trait]
impl StreamSink for PipeSink {
    async fn launch(&self, spec: &LaunchSpec, out: &OutputSender) -> Result<RunningChild> {
        let mut cmd = Command::new(&spec.command[0]);
        cmd.args(&spec.command[1..])
            .current_dir(&spec.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        // New session: the child and all descendants share a process group
        // distinct from the agent, so the deadline can kill the whole tree.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", spec.command[0]))?;
        let pid = child.id().context("spawned child has no pid")? as i32;

        let stdout = child.stdout.take().context("child stdout missing")?;
        let stderr = child.stderr.take().context("child stderr missing")?;
        let stdin = child.stdin.take().context("child stdin missing")?;

        let mut drain = Vec::new();
        drain.push(tokio::spawn(forward_pipe(stdout, out.clone(), false)));
        drain.push(tokio::spawn(forward_pipe(stderr, out.clone(), true)));

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_pipe_stdin(stdin, stdin_rx));

        let (wait_tx, wait_rx) = oneshot::channel();
        tokio::spawn(async move {
            let raw = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    log::error!("[agent] wait() failed: {e}");
                    None
                }
            };
            let _ = wait_tx.send(raw);
        });

        Ok(RunningChild {
            pid,
            stdin_tx,
            wait_rx,
            drain,
        })
    }
}

#[async_trait]
impl StreamSink for PtySink {
    async fn launch(&self, spec: &LaunchSpec, out: &OutputSender) -> Result<RunningChild> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open pty")?;

        let mut cmd = CommandBuilder::new(&spec.command[0]);
        for arg in &spec.command[1..] {
            cmd.arg(arg);
        }
        cmd.cwd(&spec.cwd);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {:?} on pty", spec.command[0]))?;
        let pid = child.process_id().context("pty child has no pid")? as i32;
        // Drop the slave so master reads see EOF once the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take pty writer")?;

        // Blocking reader thread chunks master output into a channel; an
        // async task turns the chunks into stdout frames. The master handle
        // lives in the reader thread so the fd stays open until EOF.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let master = pair.master;
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; STREAM_CHUNK_BYTES];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            drop(master);
        });

        let forward_out = out.clone();
        let drain = vec![tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                forward_out.stdout(chunk).await;
            }
        })];

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        tokio::task::spawn_blocking(move || pump_pty_stdin(writer, stdin_rx));

        let (wait_tx, wait_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let raw = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    log::error!("[agent] pty wait() failed: {e}");
                    None
                }
            };
            let _ = wait_tx.send(raw);
        });

        Ok(RunningChild {
            pid,
            stdin_tx,
            wait_rx,
            drain,
        })
    }
}

/// Forward one pipe in fixed-size chunks until EOF.
async fn forward_pipe<R: tokio::io::AsyncRead + Unpin>(
    mut pipe: R,
    out: OutputSender,
    is_stderr: bool,
) {
    let mut buf = [0u8; STREAM_CHUNK_BYTES];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = buf[..n].to_vec();
                if is_stderr {
                    out.stderr(chunk).await;
                } else {
                    out.stdout(chunk).await;
                }
            }
        }
    }
}

/// Stdin pump for pipe mode; dropping the handle closes the stream.
async fn pump_pipe_stdin(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<StdinMsg>,
) {
    use tokio::io::AsyncWriteExt;
    while let Some(msg) = rx.recv().await {
        match msg {
            StdinMsg::Data(data) => {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
            StdinMsg::Close => break,
        }
    }
    // stdin drops here, delivering EOF.
}

/// Stdin pump for pty mode (blocking writer).
///
/// A pty has no half-close; `Close` drops the writer, which stops further
/// input without signalling EOF to the child.
fn pump_pty_stdin(
    mut writer: Box<dyn std::io::Write + Send>,
    mut rx: mpsc::UnboundedReceiver<StdinMsg>,
) {
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            StdinMsg::Data(data) => {
                if std::io::Write::write_all(&mut writer, &data).is_err() {
                    break;
                }
                let _ = std::io::Write::flush(&mut writer);
            }
            StdinMsg::Close => break,
        }
    }
}

/// Send a signal to a whole process group.
pub fn kill_process_group(pgid: i32, signal: i32) {
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        log::debug!(
            "[agent] killpg({pgid}, {signal}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Send a signal to a single process.
pub fn kill_process(pid: i32, signal: i32) {
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        log::debug!(
            "[agent] kill({pid}, {signal}) failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// Run one job to completion: launch, enforce the deadline, drain, report.
///
/// Emits either `error` (spawn failure, terminal) or exactly one `exit`
/// frame. The job is removed from `jobs` before the terminal frame goes out.
pub async fn run_job(writer: AgentWriter, jobs: JobTable, id: String, payload: ExecPayload) {
    let out = OutputSender {
        writer: writer.clone(),
        job: id.clone(),
    };

    let launched = async {
        let spec = LaunchSpec::resolve(&payload)?;
        let sink: &dyn StreamSink = if payload.tty { &PtySink } else { &PipeSink };
        sink.launch(&spec, &out).await
    }
    .await;

    let mut child = match launched {
        Ok(child) => child,
        Err(e) => {
            log::warn!("[agent] Spawn failed for {id}: {e:#}");
            let frame = Frame::Error {
                job: Some(id),
                error: format!("{e:#}"),
                worker_id: None,
            };
            let _ = writer.send(&frame).await;
            return;
        }
    };

    jobs.lock().expect("job table poisoned").insert(
        id.clone(),
        JobControl {
            pid: child.pid,
            stdin_tx: child.stdin_tx.clone(),
        },
    );

    let deadline_secs = payload.timeout_seconds;
    let deadline = async {
        if deadline_secs > 0 {
            tokio::time::sleep(Duration::from_secs(deadline_secs)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    let mut timed_out = false;
    let raw_code = loop {
        tokio::select! {
            raw = &mut child.wait_rx => break raw.ok().flatten(),
            () = &mut deadline, if !timed_out => {
                log::info!("[agent] Job {id} exceeded {deadline_secs}s, killing group {}", child.pid);
                timed_out = true;
                kill_process_group(child.pid, libc::SIGKILL);
            }
        }
    };

    // Drain forwarders so every output byte precedes the exit frame. The
    // pty reader can outlive the child if something re-opened the slave,
    // hence the grace cap.
    for handle in child.drain {
        let _ = tokio::time::timeout(PTY_DRAIN_GRACE, handle).await;
    }

    let exit_code = if timed_out {
        EXIT_CODE_TIMEOUT
    } else {
        raw_code.unwrap_or(1)
    };

    jobs.lock().expect("job table poisoned").remove(&id);

    let frame = Frame::Exit {
        job: id,
        exit_code,
        worker_id: None,
    };
    if let Err(e) = writer.send(&frame).await {
        log::error!("[agent] Failed to send exit frame: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_empty_command() {
        let payload = ExecPayload {
            command: vec![],
            env: HashMap::new(),
            tty: false,
            timeout_seconds: 0,
            cwd: None,
        };
        assert!(LaunchSpec::resolve(&payload).is_err());
    }

    #[test]
    fn test_resolve_honours_cwd_override() {
        let payload = ExecPayload {
            command: vec!["/bin/true".into()],
            env: HashMap::new(),
            tty: false,
            timeout_seconds: 0,
            cwd: Some(PathBuf::from("/var/tmp")),
        };
        let spec = LaunchSpec::resolve(&payload).unwrap();
        assert_eq!(spec.cwd, PathBuf::from("/var/tmp"));
    }

    #[test]
    fn test_resolve_keeps_payload_path() {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/custom/bin".to_string());
        let payload = ExecPayload {
            command: vec!["/bin/true".into()],
            env,
            tty: false,
            timeout_seconds: 0,
            cwd: None,
        };
        let spec = LaunchSpec::resolve(&payload).unwrap();
        let paths: Vec<&str> = spec
            .env
            .iter()
            .filter(|(k, _)| k == "PATH")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(paths, vec!["/custom/bin"]);
    }
}
