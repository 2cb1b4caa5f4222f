//! The in-VM agent.
//!
//! Runs as pid-adjacent init inside each guest, speaking the frame protocol
//! on the host-visible control port. It launches child processes on `exec`,
//! streams their output back in chunked frames, honours `stdin` and
//! `signal`, enforces per-job deadlines with process-group kills, and
//! heartbeats every 5 seconds so the controller can track liveness.
//!
//! The agent exits cleanly on EOF of the control port, which is how the
//! controller tears a guest down.

pub mod exec;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::constants::HEARTBEAT_INTERVAL;
use crate::protocol::{Frame, FrameReader, FrameWriter};

use exec::{JobTable, StdinMsg};

/// Boxed write half so job tasks do not carry the transport type.
pub type AgentWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Guest device paths probed for the control port, in order.
const DEVICE_CANDIDATES: &[&str] = &["/dev/virtio-ports/org.orca.agent", "/dev/vport0p1"];

/// Entry point for `orca agent`: open the control port and serve it.
///
/// The port is the first of: the explicit `--port` path, the virtio-serial
/// device names, in that order. A path that is a Unix socket is connected;
/// a character device is opened twice (separate read and write handles) so
/// a parked read never stalls heartbeat writes.
pub async fn run(port: Option<PathBuf>) -> Result<()> {
    let path = resolve_port(port)?;
    log::info!("[agent] Control port: {}", path.display());

    let meta = std::fs::metadata(&path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;

    use std::os::unix::fs::FileTypeExt;
    if meta.file_type().is_socket() {
        let stream = tokio::net::UnixStream::connect(&path)
            .await
            .with_context(|| format!("Failed to connect {}", path.display()))?;
        let (read, write) = stream.into_split();
        serve(read, write).await
    } else {
        let read = tokio::fs::OpenOptions::new()
            .read(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {} for reading", path.display()))?;
        let write = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {} for writing", path.display()))?;
        serve(read, write).await
    }
}

fn resolve_port(port: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = port {
        return Ok(path);
    }
    for candidate in DEVICE_CANDIDATES {
        if Path::new(candidate).exists() {
            return Ok(PathBuf::from(candidate));
        }
    }
    anyhow::bail!("No agent control port found; pass --port")
}

/// Serve the frame protocol over a connected transport.
///
/// Emits an initial heartbeat, starts the heartbeat ticker, then loops on
/// inbound frames until EOF. Unknown frame types are silently ignored.
pub async fn serve<R, W>(read: R, write: W) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer: AgentWriter = FrameWriter::new(Box::new(write));
    let mut reader = FrameReader::new(read);
    let jobs: JobTable = JobTable::default();

    writer.send(&Frame::Heartbeat { worker_id: None }).await?;
    let heartbeat = tokio::spawn(heartbeat_loop(writer.clone()));

    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("[agent] Control port closed, exiting");
                break;
            }
            Err(e) => {
                log::error!("[agent] Read failed: {e:#}");
                break;
            }
        };

        match frame {
            Frame::Exec { id, payload } => {
                log::info!("[agent] exec {id}: {:?}", payload.command);
                tokio::spawn(exec::run_job(
                    writer.clone(),
                    jobs.clone(),
                    id,
                    payload,
                ));
            }
            Frame::Stdin { job, data } => {
                let tx = {
                    let table = jobs.lock().expect("job table poisoned");
                    table.get(&job).map(|c| c.stdin_tx.clone())
                };
                match tx {
                    Some(tx) => {
                        let msg = if data.is_empty() {
                            StdinMsg::Close
                        } else {
                            StdinMsg::Data(data)
                        };
                        let _ = tx.send(msg);
                    }
                    None => log::debug!("[agent] stdin for unknown job {job}"),
                }
            }
            Frame::Signal { job, signal } => {
                let pid = {
                    let table = jobs.lock().expect("job table poisoned");
                    table.get(&job).map(|c| c.pid)
                };
                match pid {
                    Some(pid) => exec::kill_process(pid, signal),
                    None => log::debug!("[agent] signal for unknown job {job}"),
                }
            }
            // The agent only initiates these; ignore echoes silently.
            Frame::Stdout { .. }
            | Frame::Stderr { .. }
            | Frame::Exit { .. }
            | Frame::Heartbeat { .. }
            | Frame::Error { .. } => {}
        }
    }

    heartbeat.abort();
    Ok(())
}

async fn heartbeat_loop(writer: AgentWriter) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The initial beat was sent synchronously before the loop started.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if writer.send(&Frame::Heartbeat { worker_id: None }).await.is_err() {
            break;
        }
    }
}
