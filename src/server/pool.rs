//! Worker pool: VM records, lifecycle, and health.
//!
//! The pool keeps one [`Worker`] record per guest. Records are created
//! eagerly up to the warm baseline, grown on demand up to the hard cap, and
//! destroyed when their hypervisor process or transport dies. Lifecycle:
//!
//! ```text
//! starting ──connect──▶ connected ──first heartbeat──▶ ready
//!     │                     │                            │
//!     └──────── failed      └────── stale ◀──watermark───┘
//!                                (heartbeat lifts back to ready)
//! ```
//!
//! The worker map is behind a read/write mutex; lookups take shared
//! acquisition. No network call happens while the map lock is held.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::watch;

use crate::config::Config;
use crate::constants::{
    AGENT_CONNECT_BUDGET, AGENT_CONNECT_POLL, HEALTH_CHECK_INTERVAL, STALE_AFTER,
    WORKER_JOB_HISTORY,
};
use crate::protocol::{Frame, FrameReader, FrameWriter, StatusReply, VmStatus};
use crate::vm::{Hypervisor, VmHandle, VmSpec};

use super::router::Router;

/// Write half of a worker's agent connection.
pub type AgentConn = FrameWriter<OwnedWriteHalf>;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// VM launched, agent not yet reachable.
    Starting,
    /// Transport established, no heartbeat seen yet.
    Connected,
    /// Heartbeat seen; full dispatch target.
    Ready,
    /// Heartbeat watermark exceeded; not a dispatch target, connection kept.
    Stale,
    /// Transport died; record is being removed.
    Disconnected,
    /// Agent never became reachable.
    Failed,
}

impl WorkerState {
    /// Wire label used in `status` replies.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Stale => "stale",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One guest and its dispatch bookkeeping.
pub struct Worker {
    /// Worker id (stringified integer).
    pub id: String,
    /// The guest this record tracks.
    pub vm: VmHandle,
    state: Mutex<WorkerState>,
    busy: AtomicBool,
    active_jobs: AtomicU32,
    last_heartbeat: Mutex<Instant>,
    last_job: Mutex<Option<String>>,
    job_history: Mutex<VecDeque<String>>,
    conn: Mutex<Option<AgentConn>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Worker {
    fn new(vm: VmHandle) -> Self {
        Self {
            id: vm.id.clone(),
            vm,
            state: Mutex::new(WorkerState::Starting),
            busy: AtomicBool::new(false),
            active_jobs: AtomicU32::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            last_job: Mutex::new(None),
            job_history: Mutex::new(VecDeque::new()),
            conn: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.lock().expect("worker state poisoned")
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().expect("worker state poisoned");
        if *state != next {
            log::info!("[pool] vm{} {} -> {}", self.id, *state, next);
            *state = next;
        }
    }

    /// Record an inbound heartbeat: refresh the watermark and lift the
    /// worker to ready.
    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock().expect("heartbeat poisoned") = Instant::now();
        let mut state = self.state.lock().expect("worker state poisoned");
        if matches!(*state, WorkerState::Connected | WorkerState::Stale) {
            log::info!("[pool] vm{} {} -> ready", self.id, *state);
            *state = WorkerState::Ready;
        }
    }

    /// Seconds since the last heartbeat.
    pub fn heartbeat_age(&self) -> f64 {
        self.last_heartbeat
            .lock()
            .expect("heartbeat poisoned")
            .elapsed()
            .as_secs_f64()
    }

    /// True when this worker can receive dispatches.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self.state(), WorkerState::Connected | WorkerState::Ready)
    }

    /// Clone out the agent connection, if established.
    pub fn conn(&self) -> Option<AgentConn> {
        self.conn.lock().expect("conn poisoned").clone()
    }

    /// Claim for general dispatch: `busy` flips false→true, one job.
    pub fn claim_general(&self) -> bool {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.active_jobs.store(1, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Claim for targeted dispatch: stack another job onto the worker.
    pub fn claim_targeted(&self) {
        self.active_jobs.fetch_add(1, Ordering::AcqRel);
        self.busy.store(true, Ordering::Release);
    }

    /// Release one job: decrement (clamped at zero), clear `busy` at zero.
    pub fn release(&self) {
        let prev = self
            .active_jobs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        if prev <= 1 {
            self.busy.store(false, Ordering::Release);
        }
    }

    /// Whether the worker currently holds at least one job.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Number of jobs currently on the worker.
    pub fn active_jobs(&self) -> u32 {
        self.active_jobs.load(Ordering::Acquire)
    }

    /// Remember a dispatched job path for `status`.
    pub fn record_job(&self, name: &str) {
        *self.last_job.lock().expect("last_job poisoned") = Some(name.to_string());
        let mut history = self.job_history.lock().expect("job history poisoned");
        history.push_back(name.to_string());
        while history.len() > WORKER_JOB_HISTORY {
            history.pop_front();
        }
    }

    fn status_entry(&self) -> VmStatus {
        VmStatus {
            id: self.id.clone(),
            status: self.state().label().to_string(),
            busy: self.is_busy(),
            active_jobs: self.active_jobs(),
            last_health: self.heartbeat_age(),
            last_job: self.last_job.lock().expect("last_job poisoned").clone(),
            job_history: self
                .job_history
                .lock()
                .expect("job history poisoned")
                .iter()
                .cloned()
                .collect(),
        }
    }
}

/// Outcome of a targeted claim attempt.
#[derive(Debug)]
pub enum TargetClaim {
    /// Claimed; dispatch may proceed.
    Claimed(Arc<Worker>),
    /// No such worker; the request fails once.
    NotFound,
    /// Worker exists but is not yet reachable; retry with backoff.
    NotReady,
}

/// The worker pool.
pub struct WorkerPool {
    hypervisor: Arc<dyn Hypervisor>,
    router: Arc<Router>,
    warm: usize,
    max: usize,
    vm_template: VmSpec,
    workers: RwLock<HashMap<String, Arc<Worker>>>,
    /// Ids allocated but not yet inserted (hypervisor launch in flight).
    pending_ids: Mutex<HashSet<u32>>,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("warm", &self.warm)
            .field("max", &self.max)
            .field("workers", &self.worker_count())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Build a pool; no workers are started until [`WorkerPool::start`].
    pub fn new(
        config: &Config,
        hypervisor: Arc<dyn Hypervisor>,
        router: Arc<Router>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hypervisor,
            router,
            warm: config.warm,
            max: config.max,
            vm_template: VmSpec {
                worker_id: 0,
                project_root: config.project_root.clone(),
                build_dir: config.build_dir.clone(),
                base_image: config.base_image.clone(),
                kernel_image: config.kernel_image.clone(),
                run_skipped: config.run_skipped,
            },
            workers: RwLock::new(HashMap::new()),
            pending_ids: Mutex::new(HashSet::new()),
            shutdown,
        })
    }

    /// Bring the pool up to the warm baseline and start the health checker.
    pub async fn start(self: &Arc<Self>) {
        for _ in 0..self.warm {
            if let Err(e) = self.spawn_worker().await {
                log::error!("[pool] Warm worker launch failed: {e:#}");
            }
        }
        tokio::spawn(Self::health_loop(Arc::clone(self)));
    }

    /// Launch one worker: allocate the smallest unused id, boot the VM,
    /// insert the record, and start the connect task in the background.
    ///
    /// Returns quickly; guest boot and agent connect proceed asynchronously.
    pub async fn spawn_worker(self: &Arc<Self>) -> Result<Arc<Worker>> {
        let id_num = self.allocate_id().context("worker pool is at capacity")?;
        // Release the reservation if launch fails.
        let reservation = scopeguard::guard((Arc::clone(self), id_num), |(pool, id)| {
            pool.pending_ids.lock().expect("pending poisoned").remove(&id);
        });

        let mut spec = self.vm_template.clone();
        spec.worker_id = id_num;
        let handle = self.hypervisor.launch(&spec).await?;
        let worker = Arc::new(Worker::new(handle));

        {
            let mut workers = self.workers.write().expect("worker map poisoned");
            workers.insert(worker.id.clone(), Arc::clone(&worker));
        }
        // Reservation is now backed by the map entry.
        let (pool, id) = scopeguard::ScopeGuard::into_inner(reservation);
        pool.pending_ids.lock().expect("pending poisoned").remove(&id);

        tokio::spawn(Self::connect_agent(Arc::clone(self), Arc::clone(&worker)));
        Ok(worker)
    }

    /// Smallest positive integer not used by a live or in-flight worker.
    fn allocate_id(&self) -> Option<u32> {
        let workers = self.workers.read().expect("worker map poisoned");
        let mut pending = self.pending_ids.lock().expect("pending poisoned");
        if workers.len() + pending.len() >= self.max {
            return None;
        }
        let mut id = 1u32;
        loop {
            let taken =
                pending.contains(&id) || workers.contains_key(id.to_string().as_str());
            if !taken {
                pending.insert(id);
                return Some(id);
            }
            id += 1;
        }
    }

    /// Connect to a freshly booted agent, retrying within the budget.
    async fn connect_agent(pool: Arc<Self>, worker: Arc<Worker>) {
        let deadline = Instant::now() + AGENT_CONNECT_BUDGET;
        let stream = loop {
            if *pool.shutdown.borrow() {
                return;
            }
            match tokio::net::UnixStream::connect(&worker.vm.control_socket).await {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(AGENT_CONNECT_POLL).await;
                }
                Err(e) => {
                    log::error!(
                        "[pool] vm{} agent unreachable after {:?}: {e}",
                        worker.id,
                        AGENT_CONNECT_BUDGET
                    );
                    worker.set_state(WorkerState::Failed);
                    pool.remove_worker(&worker.id).await;
                    return;
                }
            }
        };

        let (read, write) = stream.into_split();
        *worker.conn.lock().expect("conn poisoned") = Some(FrameWriter::new(write));
        worker.set_state(WorkerState::Connected);

        tokio::spawn(Self::agent_reader(pool, worker, read));
    }

    /// Per-worker reader: the single consumer of the agent's frame stream.
    ///
    /// Heartbeats update the worker; ref'd frames go through the router in
    /// arrival order, which is what preserves per-job ordering end to end.
    async fn agent_reader(
        pool: Arc<Self>,
        worker: Arc<Worker>,
        read: tokio::net::unix::OwnedReadHalf,
    ) {
        let mut reader = FrameReader::new(read);
        loop {
            match reader.next_frame().await {
                Ok(Some(Frame::Heartbeat { .. })) => worker.heartbeat(),
                Ok(Some(frame)) if frame.job_ref().is_some() => {
                    pool.router.route_agent_frame(&worker.id, frame).await;
                }
                Ok(Some(frame)) => {
                    log::debug!("[pool] vm{} sent unexpected frame {frame:?}", worker.id);
                }
                Ok(None) => {
                    log::info!("[pool] vm{} transport closed", worker.id);
                    break;
                }
                Err(e) => {
                    log::warn!("[pool] vm{} transport error: {e:#}", worker.id);
                    break;
                }
            }
        }

        if *pool.shutdown.borrow() {
            return;
        }
        worker.set_state(WorkerState::Disconnected);
        pool.remove_worker(&worker.id).await;
        pool.router
            .fail_worker_routes(&worker.id, &format!("VM {} disconnected", worker.id))
            .await;
    }

    /// Periodic heartbeat-watermark sweep.
    async fn health_loop(pool: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        let mut shutdown = pool.shutdown.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            let workers: Vec<Arc<Worker>> = {
                let map = pool.workers.read().expect("worker map poisoned");
                map.values().cloned().collect()
            };
            for worker in workers {
                if matches!(worker.state(), WorkerState::Ready | WorkerState::Connected)
                    && worker.heartbeat_age() > STALE_AFTER.as_secs_f64()
                {
                    log::warn!(
                        "[pool] vm{} heartbeat {}s overdue, marking stale",
                        worker.id,
                        worker.heartbeat_age() as u64
                    );
                    worker.set_state(WorkerState::Stale);
                }
            }
        }
    }

    /// Drop a worker record and stop its guest.
    pub async fn remove_worker(&self, id: &str) {
        let worker = {
            let mut workers = self.workers.write().expect("worker map poisoned");
            workers.remove(id)
        };
        if let Some(worker) = worker {
            worker.vm.stop().await;
        }
    }

    /// Look up a worker by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers
            .read()
            .expect("worker map poisoned")
            .get(id)
            .cloned()
    }

    /// Claim an idle dispatchable worker (linear scan, first hit wins).
    #[must_use]
    pub fn claim_idle(&self) -> Option<Arc<Worker>> {
        let workers = self.workers.read().expect("worker map poisoned");
        for worker in workers.values() {
            if worker.is_dispatchable() && !worker.is_busy() && worker.claim_general() {
                return Some(Arc::clone(worker));
            }
        }
        None
    }

    /// Claim a specific worker for targeted dispatch.
    #[must_use]
    pub fn claim_target(&self, id: &str) -> TargetClaim {
        let worker = {
            let workers = self.workers.read().expect("worker map poisoned");
            workers.get(id).cloned()
        };
        match worker {
            None => TargetClaim::NotFound,
            Some(worker) if worker.is_dispatchable() => {
                worker.claim_targeted();
                TargetClaim::Claimed(worker)
            }
            Some(_) => TargetClaim::NotReady,
        }
    }

    /// Live worker count, including records whose launch is in flight.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        let workers = self.workers.read().expect("worker map poisoned").len();
        let pending = self.pending_ids.lock().expect("pending poisoned").len();
        workers + pending
    }

    /// True when the pool may not grow further.
    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.worker_count() >= self.max
    }

    /// Snapshot for the `status` control reply, sorted by worker id.
    #[must_use]
    pub fn status(&self) -> StatusReply {
        let mut vms: Vec<VmStatus> = {
            let workers = self.workers.read().expect("worker map poisoned");
            workers.values().map(|w| w.status_entry()).collect()
        };
        vms.sort_by_key(|v| v.id.parse::<u32>().unwrap_or(u32::MAX));
        StatusReply {
            vms,
            warm_size: self.warm,
            max_size: self.max,
        }
    }

    /// Stop every guest and clear the map. Called on controller shutdown.
    pub async fn stop_all(&self) {
        let workers: Vec<Arc<Worker>> = {
            let mut map = self.workers.write().expect("worker map poisoned");
            map.drain().map(|(_, w)| w).collect()
        };
        for worker in workers {
            worker.vm.stop().await;
        }
    }
}
