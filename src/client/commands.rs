//! One-shot client commands: `status`, `stop`, `exec`, `shell`, `history`.
//!
//! Each opens its own control connection. `exec` and `shell` stay attached,
//! pumping local stdin into `stdin` frames and printing output frames until
//! the remote job exits.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::history::HistoryStore;
use crate::protocol::{
    ControlRequest, Frame, FrameReader, FrameWriter, JobRef, StatusReply,
};
use crate::server::daemon;

use super::{connect_or_start, generate_job_id};

/// `orca status`: print the pool snapshot, or report no controller.
pub async fn show_status(_config: &Config) -> Result<i32> {
    let path = daemon::control_socket_path()?;
    let stream = match UnixStream::connect(&path).await {
        Ok(stream) => stream,
        Err(_) => {
            println!("No controller running.");
            return Ok(1);
        }
    };
    let (read, write) = stream.into_split();
    let writer = FrameWriter::new(write);
    let mut reader = FrameReader::new(read);

    writer.send_value(&ControlRequest::Status {}).await?;
    let reply: StatusReply = tokio::time::timeout(
        Duration::from_secs(5),
        reader.next_message::<StatusReply>(),
    )
    .await
    .context("status request timed out")??
    .context("controller closed the connection")?;

    println!("workers: {} (warm {}, max {})", reply.vms.len(), reply.warm_size, reply.max_size);
    for vm in &reply.vms {
        let last_job = vm.last_job.as_deref().unwrap_or("-");
        println!(
            "  vm{}  {:<12} busy={} jobs={} heartbeat {:.0}s ago  last: {last_job}",
            vm.id, vm.status, vm.busy, vm.active_jobs, vm.last_health
        );
    }
    Ok(0)
}

/// `orca stop`: ask a running controller to shut down.
pub async fn stop_server(_config: &Config) -> Result<i32> {
    let path = daemon::control_socket_path()?;
    let stream = match UnixStream::connect(&path).await {
        Ok(stream) => stream,
        Err(_) => {
            println!("No controller running.");
            return Ok(0);
        }
    };
    let (_read, write) = stream.into_split();
    let writer = FrameWriter::new(write);
    writer.send_value(&ControlRequest::Shutdown {}).await?;
    println!("Controller stopping.");
    Ok(0)
}

/// `orca exec` / `orca shell`: run an attached remote command.
///
/// Returns the remote exit code. `shell` is `exec` with a tty and `/bin/sh`.
pub async fn run_attached(
    config: &Config,
    command: Vec<String>,
    shell: bool,
    target_vm: Option<String>,
) -> Result<i32> {
    let (stream, _started) = connect_or_start(config).await?;
    let (read, write) = stream.into_split();
    let writer = FrameWriter::new(write);
    let mut reader = FrameReader::new(read);

    let job_id = generate_job_id(if shell { "shell" } else { "exec" });
    let request = if shell {
        ControlRequest::Shell {
            target_vm,
            job: JobRef { id: job_id.clone() },
        }
    } else {
        ControlRequest::Exec {
            command,
            tty: false,
            target_vm,
            job: JobRef { id: job_id.clone() },
        }
    };
    writer.send_value(&request).await?;

    // Local stdin runs on a blocking thread; chunks become stdin frames,
    // EOF becomes the empty close frame.
    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => {
                    let _ = stdin_tx.send(Vec::new());
                    break;
                }
                Ok(n) => {
                    if stdin_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut stdin_open = true;
    loop {
        tokio::select! {
            chunk = stdin_rx.recv(), if stdin_open => {
                match chunk {
                    Some(data) => {
                        let frame = Frame::Stdin { job: job_id.clone(), data };
                        if writer.send(&frame).await.is_err() {
                            break Ok(1);
                        }
                    }
                    None => stdin_open = false,
                }
            }
            frame = reader.next_frame() => {
                match frame? {
                    Some(Frame::Stdout { data, .. }) => {
                        use std::io::Write;
                        let mut out = std::io::stdout();
                        out.write_all(&data)?;
                        out.flush()?;
                    }
                    Some(Frame::Stderr { data, .. }) => {
                        use std::io::Write;
                        let mut err = std::io::stderr();
                        err.write_all(&data)?;
                        err.flush()?;
                    }
                    Some(Frame::Exit { exit_code, .. }) => break Ok(exit_code),
                    Some(Frame::Error { error, .. }) => {
                        eprintln!("error: {error}");
                        break Ok(1);
                    }
                    Some(_) => {}
                    None => break Ok(1),
                }
            }
        }
    }
}

/// `orca history [N]`: list recent tests with their aggregates.
pub fn show_history(config: &Config, limit: usize) -> Result<i32> {
    let history = HistoryStore::load(config.history_path(), config.max_history_runs);
    if history.is_empty() {
        println!("No history at {}.", history.path().display());
        return Ok(0);
    }
    let recent = history.recent();
    for (i, (name, test)) in recent.iter().take(limit).enumerate() {
        let expected = test
            .expected_duration()
            .map(|d| format!("{:.1}s", d.as_secs_f64()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3}. {name}  runs={} streak={} expected={expected}",
            i + 1,
            test.runs.len(),
            test.streak()
        );
    }
    Ok(0)
}

/// `orca history detail <i>`: full execution list for the i-th listed test.
pub fn show_history_detail(config: &Config, index: usize) -> Result<i32> {
    let history = HistoryStore::load(config.history_path(), config.max_history_runs);
    let recent = history.recent();
    let Some((name, test)) = recent.get(index.saturating_sub(1)) else {
        anyhow::bail!("history index {index} out of range (1..={})", recent.len());
    };
    println!("{name}");
    for execution in test.runs.iter().rev() {
        let log = execution
            .log_path
            .as_ref()
            .map(|p| format!("  {}", p.display()))
            .unwrap_or_default();
        println!(
            "  {}  {:?}  {:.1}s  run {}{log}",
            execution.timestamp.format("%Y-%m-%d %H:%M:%S"),
            execution.status,
            execution.duration_seconds,
            execution.run_id
        );
    }
    Ok(0)
}
