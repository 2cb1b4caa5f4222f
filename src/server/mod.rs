//! The orchestrator server (controller).
//!
//! Owns the control socket, the worker pool, the router, and the scheduler.
//! Clients connect to a per-uid Unix socket and speak JSON-line frames;
//! workers are QEMU guests whose agents connect back over per-VM sockets.
//! One reader task per connection, one scheduler, one health ticker, and a
//! process-wide shutdown channel tie it together.

pub mod daemon;
pub mod pool;
pub mod router;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::constants::RESOURCE_SAMPLE_INTERVAL;
use crate::protocol::{ClientMessage, ControlRequest, Frame, FrameReader, FrameWriter, JobSpec};
use crate::vm::Hypervisor;

use pool::WorkerPool;
use router::Router;
use scheduler::DispatchRequest;

/// Run the controller until shutdown.
///
/// Binds the control socket (0600), writes the PID file, brings the warm
/// pool up, and serves client connections. Returns after a clean teardown:
/// guests stopped, socket and PID file removed.
pub async fn run(config: Config, hypervisor: Arc<dyn Hypervisor>) -> Result<()> {
    daemon::cleanup_stale_files();

    let socket_path = daemon::control_socket_path()?;
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("Failed to remove stale socket {}", socket_path.display()))?;
    }

    let listener = std::os::unix::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
    }
    listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(listener)?;
    daemon::write_pid_file()?;
    log::info!("[server] Control socket: {}", socket_path.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // Teardown on SIGINT/SIGTERM; the flag is polled because signal-hook
    // handlers may only set flags.
    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&interrupted))?;
    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
            loop {
                ticker.tick().await;
                if interrupted.load(Ordering::Relaxed) {
                    log::info!("[server] Signal received, shutting down");
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
        });
    }

    let router = Arc::new(Router::new());
    let pool = WorkerPool::new(
        &config,
        hypervisor,
        Arc::clone(&router),
        shutdown_rx.clone(),
    );
    pool.start().await;

    let (queue_tx, queue_rx) = mpsc::channel::<DispatchRequest>(config.queue_capacity);
    tokio::spawn(scheduler::run(
        Arc::clone(&pool),
        Arc::clone(&router),
        queue_rx,
        shutdown_rx.clone(),
    ));

    tokio::spawn(resource_sampler(
        config.resources_log_path(),
        shutdown_rx.clone(),
    ));

    let accept = tokio::spawn(accept_loop(
        listener,
        Arc::clone(&pool),
        Arc::clone(&router),
        queue_tx,
        Arc::clone(&shutdown_tx),
    ));

    // Park until something flips the shutdown channel.
    let mut shutdown = shutdown_rx;
    let _ = shutdown.changed().await;

    accept.abort();
    pool.stop_all().await;
    daemon::cleanup_on_shutdown();
    log::info!("[server] Shutdown complete");
    Ok(())
}

/// Accept loop for the control socket.
async fn accept_loop(
    listener: UnixListener,
    pool: Arc<WorkerPool>,
    router: Arc<Router>,
    queue_tx: mpsc::Sender<DispatchRequest>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let client_id = generate_client_id();
                log::info!("[server] Client connected: {client_id}");
                tokio::spawn(handle_client(
                    client_id,
                    stream,
                    Arc::clone(&pool),
                    Arc::clone(&router),
                    queue_tx.clone(),
                    Arc::clone(&shutdown_tx),
                ));
            }
            Err(e) => {
                log::error!("[server] Accept error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Reader task for one client connection.
///
/// Accepts control requests (queued or answered inline) and `stdin`/
/// `signal` stream frames, which are forwarded to the worker that owns the
/// referenced job.
async fn handle_client(
    client_id: String,
    stream: UnixStream,
    pool: Arc<WorkerPool>,
    router: Arc<Router>,
    queue_tx: mpsc::Sender<DispatchRequest>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    let (read, write) = stream.into_split();
    let writer = FrameWriter::new(write);
    let mut reader = FrameReader::new(read);

    loop {
        let msg = match reader.next_message::<ClientMessage>().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                log::warn!("[server] Client {client_id} read error: {e:#}");
                break;
            }
        };

        match msg {
            ClientMessage::Control(ControlRequest::SubmitJob { job }) => {
                submit(&queue_tx, job, &writer).await;
            }
            ClientMessage::Control(ControlRequest::Exec {
                command,
                tty,
                target_vm,
                job,
            }) => {
                let job = JobSpec {
                    id: job.id,
                    command,
                    script: None,
                    env: std::collections::HashMap::new(),
                    tty,
                    timeout_seconds: 0,
                    target_worker: target_vm,
                };
                submit(&queue_tx, job, &writer).await;
            }
            ClientMessage::Control(ControlRequest::Shell { target_vm, job }) => {
                let job = JobSpec {
                    id: job.id,
                    command: vec!["/bin/sh".to_string()],
                    script: None,
                    env: std::collections::HashMap::new(),
                    tty: true,
                    timeout_seconds: 0,
                    target_worker: target_vm,
                };
                submit(&queue_tx, job, &writer).await;
            }
            ClientMessage::Control(ControlRequest::Status {}) => {
                if let Err(e) = writer.send_value(&pool.status()).await {
                    log::warn!("[server] Status reply to {client_id} failed: {e}");
                }
            }
            ClientMessage::Control(ControlRequest::Shutdown {}) => {
                log::info!("[server] Shutdown requested by {client_id}");
                let _ = shutdown_tx.send(true);
            }
            ClientMessage::Stream(frame @ (Frame::Stdin { .. } | Frame::Signal { .. })) => {
                forward_to_worker(&pool, &router, frame).await;
            }
            ClientMessage::Stream(frame) => {
                log::debug!("[server] Client {client_id} sent unexpected frame {frame:?}");
            }
        }
    }

    log::info!("[server] Client disconnected: {client_id}");
}

/// Queue a job, back-pressuring on a full queue.
async fn submit(
    queue_tx: &mpsc::Sender<DispatchRequest>,
    job: JobSpec,
    client: &router::ClientWriter,
) {
    let id = job.id.clone();
    let request = DispatchRequest {
        job,
        client: client.clone(),
    };
    if queue_tx.send(request).await.is_err() {
        let frame = Frame::Error {
            job: Some(id),
            error: "controller is shutting down".to_string(),
            worker_id: None,
        };
        let _ = client.send(&frame).await;
    }
}

/// Forward a client stream frame to the worker bound to its job.
async fn forward_to_worker(pool: &Arc<WorkerPool>, router: &Arc<Router>, frame: Frame) {
    let Some(job_id) = frame.job_ref() else { return };
    let Some(worker_id) = router.worker_for(job_id) else {
        log::debug!("[server] Stream frame for unrouted job {job_id}");
        return;
    };
    let Some(conn) = pool.get(&worker_id).and_then(|w| w.conn()) else {
        log::debug!("[server] No connection for vm{worker_id}");
        return;
    };
    if let Err(e) = conn.send(&frame).await {
        log::warn!("[server] Forward to vm{worker_id} failed: {e}");
    }
}

/// Unique client id: monotonic counter plus a random suffix.
fn generate_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("client:{seq:x}{rand:04x}")
}

/// Append load/memory samples to the resources log (Linux only).
async fn resource_sampler(path: std::path::PathBuf, mut shutdown: watch::Receiver<bool>) {
    if !cfg!(target_os = "linux") {
        return;
    }
    let mut ticker = tokio::time::interval(RESOURCE_SAMPLE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        let Some(line) = sample_resources() else { continue };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        use std::io::Write;
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = appended {
            log::debug!("[server] Resource sample write failed: {e}");
        }
    }
}

/// One resource sample line: timestamp, 1-minute load, available memory.
fn sample_resources() -> Option<String> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load1 = loadavg.split_whitespace().next()?.to_string();
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let avail_kb = meminfo
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("0");
    let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    Some(format!("{now} load1={load1} mem_avail_kb={avail_kb}"))
}
