//! Job-id keyed message routing between agents and clients.
//!
//! A route binds a job id to the client connection that submitted it, the
//! worker running it, and the done-signal that unblocks the dispatcher. The
//! agent reader task pushes every inbound frame through here; the route
//! dies when its terminal frame (`exit` or `error`) passes through.
//!
//! The route map mutex is held only around registration, lookup, and
//! removal. Sends to client connections happen strictly outside the
//! critical section.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::oneshot;

use crate::protocol::{Frame, FrameWriter};

/// Write half of a client control connection.
pub type ClientWriter = FrameWriter<OwnedWriteHalf>;

/// One live job's routing state.
struct Route {
    client: ClientWriter,
    worker_id: String,
    done: Option<oneshot::Sender<()>>,
}

/// The frame router.
#[derive(Default)]
pub struct Router {
    routes: Mutex<HashMap<String, Route>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.routes.lock().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("Router").field("routes", &len).finish()
    }
}

impl Router {
    /// New, empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route for a dispatched job.
    ///
    /// The returned receiver resolves when the job's terminal frame passes
    /// through (or the route is failed); the dispatcher blocks on it to
    /// release the worker.
    pub fn register(
        &self,
        job_id: String,
        client: ClientWriter,
        worker_id: String,
    ) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let mut routes = self.routes.lock().expect("route map poisoned");
        if routes
            .insert(
                job_id.clone(),
                Route {
                    client,
                    worker_id,
                    done: Some(done_tx),
                },
            )
            .is_some()
        {
            // Job ids are unique per controller lifetime; a collision means
            // a client reused one. The old route is replaced.
            log::warn!("[router] Duplicate job id {job_id}, replacing route");
        }
        done_rx
    }

    /// Worker currently bound to a job, if the route is live.
    #[must_use]
    pub fn worker_for(&self, job_id: &str) -> Option<String> {
        self.routes
            .lock()
            .expect("route map poisoned")
            .get(job_id)
            .map(|r| r.worker_id.clone())
    }

    /// Number of live routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.lock().expect("route map poisoned").len()
    }

    /// True when no routes are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forward a frame from a worker's agent to the owning client.
    ///
    /// Stamps `worker_id` into the frame, forwards it, and on a terminal
    /// frame tears the route down and signals done. Frames whose `ref`
    /// matches no route are dropped (the route may already be closed by a
    /// prior terminal frame).
    pub async fn route_agent_frame(&self, worker_id: &str, frame: Frame) {
        let Some(job_id) = frame.job_ref().map(str::to_string) else {
            return;
        };
        let terminal = frame.is_terminal();

        // Clone the writer out, and on terminal frames take the whole
        // route, so no send happens under the lock.
        let (client, done) = {
            let mut routes = self.routes.lock().expect("route map poisoned");
            if terminal {
                match routes.remove(&job_id) {
                    Some(route) => (route.client, route.done),
                    None => return,
                }
            } else {
                match routes.get(&job_id) {
                    Some(route) => (route.client.clone(), None),
                    None => return,
                }
            }
        };

        let stamped = frame.with_worker(worker_id);
        if let Err(e) = client.send(&stamped).await {
            log::warn!("[router] Client write for job {job_id} failed: {e}");
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// Fail a single route with a synthetic error frame.
    ///
    /// Used when dispatch itself fails after registration (e.g. the exec
    /// frame could not be written to the agent).
    pub async fn fail_job(&self, job_id: &str, message: &str) {
        let Some(route) = self
            .routes
            .lock()
            .expect("route map poisoned")
            .remove(job_id)
        else {
            return;
        };
        let frame = Frame::Error {
            job: Some(job_id.to_string()),
            error: message.to_string(),
            worker_id: Some(route.worker_id.clone()),
        };
        if let Err(e) = route.client.send(&frame).await {
            log::warn!("[router] Client write for failed job {job_id} failed: {e}");
        }
        if let Some(done) = route.done {
            let _ = done.send(());
        }
    }

    /// Fail every in-flight route bound to a worker.
    ///
    /// Called when a worker's transport dies: each affected client receives
    /// a synthetic `error` frame naming the worker, and every dispatcher
    /// waiter is unblocked.
    pub async fn fail_worker_routes(&self, worker_id: &str, message: &str) {
        let failed: Vec<(String, Route)> = {
            let mut routes = self.routes.lock().expect("route map poisoned");
            let ids: Vec<String> = routes
                .iter()
                .filter(|(_, r)| r.worker_id == worker_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| routes.remove(&id).map(|r| (id, r)))
                .collect()
        };

        for (job_id, route) in failed {
            let frame = Frame::Error {
                job: Some(job_id.clone()),
                error: message.to_string(),
                worker_id: Some(worker_id.to_string()),
            };
            if let Err(e) = route.client.send(&frame).await {
                log::warn!("[router] Client write for orphaned job {job_id} failed: {e}");
            }
            if let Some(done) = route.done {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameReader;

    async fn client_pair() -> (ClientWriter, FrameReader<tokio::net::unix::OwnedReadHalf>) {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let (_ra, wa) = a.into_split();
        let (rb, _wb) = b.into_split();
        // Leak the unused halves so the pair stays open for the test body.
        std::mem::forget(_ra);
        std::mem::forget(_wb);
        (FrameWriter::new(wa), FrameReader::new(rb))
    }

    #[tokio::test]
    async fn test_forwards_and_stamps_worker_id() {
        let router = Router::new();
        let (writer, mut reader) = client_pair().await;
        let _done = router.register("J1".into(), writer, "2".into());

        router
            .route_agent_frame(
                "2",
                Frame::Stdout {
                    job: "J1".into(),
                    data: b"out".to_vec(),
                    worker_id: None,
                },
            )
            .await;

        match reader.next_frame().await.unwrap().unwrap() {
            Frame::Stdout { worker_id, data, .. } => {
                assert_eq!(worker_id.as_deref(), Some("2"));
                assert_eq!(data, b"out");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn test_exit_tears_down_route_and_signals_done() {
        let router = Router::new();
        let (writer, mut reader) = client_pair().await;
        let done = router.register("J1".into(), writer, "1".into());

        router
            .route_agent_frame(
                "1",
                Frame::Exit {
                    job: "J1".into(),
                    exit_code: 0,
                    worker_id: None,
                },
            )
            .await;

        assert!(router.is_empty());
        assert!(done.await.is_ok());
        match reader.next_frame().await.unwrap().unwrap() {
            Frame::Exit { exit_code, .. } => assert_eq!(exit_code, 0),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frames_after_terminal_are_dropped() {
        let router = Router::new();
        let (writer, _reader) = client_pair().await;
        let _done = router.register("J1".into(), writer, "1".into());

        router
            .route_agent_frame(
                "1",
                Frame::Exit {
                    job: "J1".into(),
                    exit_code: 0,
                    worker_id: None,
                },
            )
            .await;
        // Late chunk for a closed route must not panic or resurrect it.
        router
            .route_agent_frame(
                "1",
                Frame::Stdout {
                    job: "J1".into(),
                    data: b"late".to_vec(),
                    worker_id: None,
                },
            )
            .await;
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn test_fail_worker_routes_targets_only_that_worker() {
        let router = Router::new();
        let (w1, mut r1) = client_pair().await;
        let (w2, _r2) = client_pair().await;
        let done1 = router.register("J1".into(), w1, "1".into());
        let _done2 = router.register("J2".into(), w2, "2".into());

        router.fail_worker_routes("1", "VM 1 disconnected").await;

        assert_eq!(router.len(), 1);
        assert!(done1.await.is_ok());
        match r1.next_frame().await.unwrap().unwrap() {
            Frame::Error { error, worker_id, .. } => {
                assert!(error.contains("disconnected"));
                assert_eq!(worker_id.as_deref(), Some("1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_without_ref_is_ignored() {
        let router = Router::new();
        router
            .route_agent_frame("1", Frame::Heartbeat { worker_id: None })
            .await;
        assert!(router.is_empty());
    }
}
