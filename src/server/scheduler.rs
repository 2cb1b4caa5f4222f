//! The dispatch loop.
//!
//! Consumes one [`DispatchRequest`] at a time from the bounded job queue,
//! picks a worker (targeted or general), registers the route, and sends the
//! `exec` frame. Worker boot never blocks the loop: scale-up launches the
//! VM and keeps polling for an idle claim.
//!
//! A dispatcher task per dispatched job blocks on the route's done-signal
//! and releases the worker when it fires.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::constants::TARGETED_RETRY_BACKOFF;
use crate::protocol::{Frame, JobSpec};

use super::pool::{TargetClaim, Worker, WorkerPool};
use super::router::{ClientWriter, Router};

/// Poll interval while every worker is busy and the pool is growing.
const IDLE_POLL: std::time::Duration = std::time::Duration::from_millis(100);

/// Backoff after a failed scale-up attempt, so a broken hypervisor does not
/// spin the loop.
const SPAWN_FAILURE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(500);

/// One queued unit of work: the job plus the client awaiting its frames.
#[derive(Debug)]
pub struct DispatchRequest {
    /// The job to dispatch.
    pub job: JobSpec,
    /// Connection that submitted it; receives all reply frames.
    pub client: ClientWriter,
}

/// Run the scheduler until the queue closes or shutdown is signalled.
pub async fn run(
    pool: Arc<WorkerPool>,
    router: Arc<Router>,
    mut queue: mpsc::Receiver<DispatchRequest>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("[sched] Scheduler started");
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = queue.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        dispatch(&pool, &router, &mut shutdown, request).await;
    }
    log::info!("[sched] Scheduler stopped");
}

/// Select a worker for one request and send the job to it.
async fn dispatch(
    pool: &Arc<WorkerPool>,
    router: &Arc<Router>,
    shutdown: &mut watch::Receiver<bool>,
    request: DispatchRequest,
) {
    let DispatchRequest { job, client } = request;

    let worker = loop {
        if *shutdown.borrow() {
            return;
        }

        if let Some(target) = &job.target_worker {
            match pool.claim_target(target) {
                TargetClaim::Claimed(worker) => break worker,
                TargetClaim::NotFound => {
                    log::warn!("[sched] Job {} targets unknown VM {target}", job.id);
                    let frame = Frame::Error {
                        job: Some(job.id.clone()),
                        error: format!("VM {target} not found"),
                        worker_id: None,
                    };
                    if let Err(e) = client.send(&frame).await {
                        log::warn!("[sched] Client write failed: {e}");
                    }
                    return;
                }
                TargetClaim::NotReady => {
                    tokio::time::sleep(TARGETED_RETRY_BACKOFF).await;
                }
            }
        } else {
            if let Some(worker) = pool.claim_idle() {
                break worker;
            }
            if !pool.at_capacity() {
                match pool.spawn_worker().await {
                    Ok(worker) => {
                        log::info!("[sched] Queue pressure: scaling up, vm{}", worker.id)
                    }
                    Err(e) => {
                        log::error!("[sched] Scale-up failed: {e:#}");
                        tokio::time::sleep(SPAWN_FAILURE_BACKOFF).await;
                    }
                }
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    };

    send_to_worker(router, worker, job, client).await;
}

/// Register the route, emit `exec`, and arm the release waiter.
async fn send_to_worker(
    router: &Arc<Router>,
    worker: Arc<Worker>,
    job: JobSpec,
    client: ClientWriter,
) {
    worker.record_job(&job_display(&job));

    let Some(conn) = worker.conn() else {
        // Claimed workers are connected; losing the connection in this
        // window is a transport race.
        log::warn!("[sched] vm{} lost its connection before dispatch", worker.id);
        let frame = Frame::Error {
            job: Some(job.id.clone()),
            error: format!("VM {} disconnected", worker.id),
            worker_id: Some(worker.id.clone()),
        };
        let _ = client.send(&frame).await;
        worker.release();
        return;
    };

    let done = router.register(job.id.clone(), client, worker.id.clone());
    let frame = Frame::Exec {
        id: job.id.clone(),
        payload: job.to_exec_payload(),
    };

    log::info!("[sched] Dispatching {} to vm{}", job.id, worker.id);
    if let Err(e) = conn.send(&frame).await {
        log::warn!("[sched] exec write to vm{} failed: {e}", worker.id);
        router
            .fail_job(&job.id, &format!("VM {} unreachable", worker.id))
            .await;
        // fail_job signalled done; fall through to the waiter which
        // releases the claim.
    }

    tokio::spawn(async move {
        // Resolves on exit/error routing, or on sender drop if the route
        // is torn down abnormally. Either way the claim is returned.
        let _ = done.await;
        worker.release();
    });
}

/// Human-readable job name for worker history.
fn job_display(job: &JobSpec) -> String {
    match &job.script {
        Some(path) => path.display().to_string(),
        None => job.command.join(" "),
    }
}
