//! Full-controller test: control socket, client protocol, shutdown.
//!
//! Drives `orca::server::run` with an in-process hypervisor stand-in and a
//! real client connection, covering submit/status/shutdown end to end.
//! A single test owns the whole flow because the runtime directory is
//! selected through a process-wide environment variable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orca::protocol::{ControlRequest, Frame, FrameReader, FrameWriter, JobSpec, StatusReply};
use orca::{Config, Hypervisor, Transport, VmHandle, VmSpec};

struct StubHypervisor {
    dir: PathBuf,
}

#[async_trait]
impl Hypervisor for StubHypervisor {
    async fn launch(&self, spec: &VmSpec) -> anyhow::Result<VmHandle> {
        let socket = self.dir.join(format!("stub-vm{}.sock", spec.worker_id));
        let listener = tokio::net::UnixListener::bind(&socket)?;
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let (read, write) = stream.into_split();
                let _ = orca::agent::serve(read, write).await;
            }
        });
        Ok(VmHandle::new(
            spec.worker_id.to_string(),
            Transport::Serial,
            socket,
            None,
            None,
        ))
    }
}

#[tokio::test]
async fn test_controller_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("ORCA_RUNTIME_DIR", dir.path());

    let mut config = Config::default();
    config.warm = 1;
    config.max = 2;
    config.build_dir = dir.path().join("build");

    let hypervisor = Arc::new(StubHypervisor {
        dir: dir.path().to_path_buf(),
    });
    let server = tokio::spawn(orca::server::run(config, hypervisor));

    // The control socket appears once the controller is up.
    let socket_path = dir.path().join("orca.sock");
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let stream = loop {
        match tokio::net::UnixStream::connect(&socket_path).await {
            Ok(stream) => break stream,
            Err(e) => {
                assert!(
                    std::time::Instant::now() < deadline,
                    "control socket never appeared: {e}"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    };
    let (read, write) = stream.into_split();
    let writer = FrameWriter::new(write);
    let mut reader = FrameReader::new(read);

    // Status reflects the warm pool (eventually ready).
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        writer.send_value(&ControlRequest::Status {}).await.unwrap();
        let reply: StatusReply = tokio::time::timeout(
            Duration::from_secs(5),
            reader.next_message::<StatusReply>(),
        )
        .await
        .expect("status timed out")
        .expect("transport error")
        .expect("connection closed");
        assert_eq!(reply.warm_size, 1);
        assert_eq!(reply.max_size, 2);
        if reply.vms.iter().any(|vm| vm.status == "ready") {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "worker never became ready: {reply:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Submit a job and collect its frames.
    let job = JobSpec {
        id: "E2E-1".to_string(),
        command: vec!["/bin/sh".into(), "-c".into(), "printf hello".into()],
        script: None,
        env: HashMap::new(),
        tty: false,
        timeout_seconds: 10,
        target_worker: None,
    };
    writer
        .send_value(&ControlRequest::SubmitJob { job })
        .await
        .unwrap();

    let mut stdout = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(20), reader.next_frame())
            .await
            .expect("timed out waiting for job frames")
            .expect("transport error")
            .expect("connection closed");
        match frame {
            Frame::Stdout { data, .. } => stdout.extend_from_slice(&data),
            Frame::Exit { exit_code, worker_id, .. } => {
                assert_eq!(exit_code, 0);
                assert_eq!(worker_id.as_deref(), Some("1"));
                break;
            }
            Frame::Error { error, .. } => panic!("job failed: {error}"),
            _ => {}
        }
    }
    assert_eq!(stdout, b"hello");

    // Shutdown tears the controller down and removes its socket.
    writer
        .send_value(&ControlRequest::Shutdown {})
        .await
        .unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("controller did not shut down")
        .expect("controller task panicked");
    assert!(result.is_ok(), "controller exited with {result:?}");
    assert!(!socket_path.exists(), "socket file must be cleaned up");
}
