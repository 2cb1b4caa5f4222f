//! End-to-end tests for the in-VM agent over a socketpair.
//!
//! The agent is transport-agnostic, so these drive the real dispatch loop,
//! child spawning, and deadline enforcement without any VM.

use std::time::Duration;

use orca::protocol::{ExecPayload, Frame, FrameReader, FrameWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Start an agent on one end of a socketpair; return our end's halves.
fn start_agent() -> (FrameWriter<OwnedWriteHalf>, FrameReader<OwnedReadHalf>) {
    let (ours, theirs) = tokio::net::UnixStream::pair().unwrap();
    let (agent_read, agent_write) = theirs.into_split();
    tokio::spawn(async move {
        let _ = orca::agent::serve(agent_read, agent_write).await;
    });
    let (read, write) = ours.into_split();
    (FrameWriter::new(write), FrameReader::new(read))
}

fn exec_frame(id: &str, command: &[&str], tty: bool, timeout_seconds: u64) -> Frame {
    Frame::Exec {
        id: id.to_string(),
        payload: ExecPayload {
            command: command.iter().map(ToString::to_string).collect(),
            env: std::collections::HashMap::new(),
            tty,
            timeout_seconds,
            cwd: Some("/tmp".into()),
        },
    }
}

async fn next_frame(
    reader: &mut FrameReader<OwnedReadHalf>,
    budget: Duration,
) -> Frame {
    tokio::time::timeout(budget, reader.next_frame())
        .await
        .expect("timed out waiting for frame")
        .expect("transport error")
        .expect("unexpected EOF")
}

/// Collect frames for one job until its terminal frame, skipping heartbeats.
async fn collect_job_frames(
    reader: &mut FrameReader<OwnedReadHalf>,
    job: &str,
    budget: Duration,
) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(reader, budget).await;
        if matches!(frame, Frame::Heartbeat { .. }) {
            continue;
        }
        if frame.job_ref() != Some(job) {
            continue;
        }
        let terminal = frame.is_terminal();
        frames.push(frame);
        if terminal {
            return frames;
        }
    }
}

fn stdout_bytes(frames: &[Frame]) -> Vec<u8> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Stdout { data, .. } => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn exit_code(frames: &[Frame]) -> Option<i32> {
    frames.iter().find_map(|f| match f {
        Frame::Exit { exit_code, .. } => Some(*exit_code),
        _ => None,
    })
}

#[tokio::test]
async fn test_initial_heartbeat_arrives_first() {
    let (_writer, mut reader) = start_agent();
    let frame = next_frame(&mut reader, Duration::from_secs(5)).await;
    assert!(matches!(frame, Frame::Heartbeat { .. }), "got {frame:?}");
}

#[tokio::test]
async fn test_happy_path_stdout_then_exit_zero() {
    let (writer, mut reader) = start_agent();
    writer
        .send(&exec_frame("J1", &["/bin/sh", "-c", "printf 'hello\\n'"], false, 10))
        .await
        .unwrap();

    let frames = collect_job_frames(&mut reader, "J1", Duration::from_secs(10)).await;
    assert_eq!(stdout_bytes(&frames), b"hello\n");
    assert_eq!(exit_code(&frames), Some(0));
}

#[tokio::test]
async fn test_nonzero_exit_code_is_reported() {
    let (writer, mut reader) = start_agent();
    writer
        .send(&exec_frame("J2", &["/bin/sh", "-c", "exit 3"], false, 10))
        .await
        .unwrap();
    let frames = collect_job_frames(&mut reader, "J2", Duration::from_secs(10)).await;
    assert_eq!(exit_code(&frames), Some(3));
}

#[tokio::test]
async fn test_stderr_flows_separately_in_pipe_mode() {
    let (writer, mut reader) = start_agent();
    writer
        .send(&exec_frame(
            "J3",
            &["/bin/sh", "-c", "echo out; echo err 1>&2"],
            false,
            10,
        ))
        .await
        .unwrap();
    let frames = collect_job_frames(&mut reader, "J3", Duration::from_secs(10)).await;
    let stderr: Vec<u8> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Stderr { data, .. } => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(stdout_bytes(&frames), b"out\n");
    assert_eq!(stderr, b"err\n");
    assert_eq!(exit_code(&frames), Some(0));
}

#[tokio::test]
async fn test_no_output_job_still_exits() {
    let (writer, mut reader) = start_agent();
    writer
        .send(&exec_frame("J4", &["/bin/true"], false, 10))
        .await
        .unwrap();
    let frames = collect_job_frames(&mut reader, "J4", Duration::from_secs(10)).await;
    assert_eq!(frames.len(), 1, "expected exit only, got {frames:?}");
    assert_eq!(exit_code(&frames), Some(0));
}

#[tokio::test]
async fn test_timeout_kills_process_group_with_124() {
    let (writer, mut reader) = start_agent();
    // The sleep runs in a background subshell; only a group kill reaps it
    // fast enough for the exit frame to arrive promptly.
    writer
        .send(&exec_frame(
            "J5",
            &["/bin/sh", "-c", "sleep 600 & wait"],
            false,
            1,
        ))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let frames = collect_job_frames(&mut reader, "J5", Duration::from_secs(30)).await;
    assert_eq!(exit_code(&frames), Some(124));
    assert!(
        started.elapsed() < Duration::from_secs(20),
        "group kill took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_timeout_zero_means_no_deadline() {
    let (writer, mut reader) = start_agent();
    writer
        .send(&exec_frame("J6", &["/bin/sh", "-c", "sleep 2; echo done"], false, 0))
        .await
        .unwrap();
    let frames = collect_job_frames(&mut reader, "J6", Duration::from_secs(30)).await;
    assert_eq!(exit_code(&frames), Some(0));
    assert_eq!(stdout_bytes(&frames), b"done\n");
}

#[tokio::test]
async fn test_stdin_delivery_and_close() {
    let (writer, mut reader) = start_agent();
    writer.send(&exec_frame("J7", &["/bin/cat"], false, 10)).await.unwrap();

    writer
        .send(&Frame::Stdin {
            job: "J7".into(),
            data: b"over the wire\n".to_vec(),
        })
        .await
        .unwrap();
    // Empty data closes stdin, which lets cat exit.
    writer
        .send(&Frame::Stdin {
            job: "J7".into(),
            data: Vec::new(),
        })
        .await
        .unwrap();

    let frames = collect_job_frames(&mut reader, "J7", Duration::from_secs(10)).await;
    assert_eq!(stdout_bytes(&frames), b"over the wire\n");
    assert_eq!(exit_code(&frames), Some(0));
}

#[tokio::test]
async fn test_signal_is_forwarded_to_child() {
    let (writer, mut reader) = start_agent();
    writer
        .send(&exec_frame("J8", &["/bin/sh", "-c", "sleep 600"], false, 0))
        .await
        .unwrap();

    // Give the child a moment to start, then terminate it.
    tokio::time::sleep(Duration::from_millis(300)).await;
    writer
        .send(&Frame::Signal {
            job: "J8".into(),
            signal: libc::SIGKILL,
        })
        .await
        .unwrap();

    let frames = collect_job_frames(&mut reader, "J8", Duration::from_secs(10)).await;
    // Killed by signal: not a recognised exit status, mapped to 1.
    assert_eq!(exit_code(&frames), Some(1));
}

#[tokio::test]
async fn test_spawn_failure_emits_error_not_exit() {
    let (writer, mut reader) = start_agent();
    writer
        .send(&exec_frame("J9", &["/nonexistent/binary"], false, 10))
        .await
        .unwrap();

    let frames = collect_job_frames(&mut reader, "J9", Duration::from_secs(10)).await;
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        Frame::Error { job, error, .. } => {
            assert_eq!(job.as_deref(), Some("J9"));
            assert!(!error.is_empty());
        }
        other => panic!("expected error frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_tty_mode_streams_single_stdout_flow() {
    let (writer, mut reader) = start_agent();
    writer
        .send(&exec_frame(
            "J10",
            &["/bin/sh", "-c", "echo pty-out; echo pty-err 1>&2"],
            true,
            10,
        ))
        .await
        .unwrap();

    let frames = collect_job_frames(&mut reader, "J10", Duration::from_secs(15)).await;
    assert_eq!(exit_code(&frames), Some(0));
    // On a pty both streams interleave into one stdout flow, and the pty
    // translates \n to \r\n.
    let out = stdout_bytes(&frames);
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("pty-out"), "missing stdout in {text:?}");
    assert!(text.contains("pty-err"), "missing stderr in {text:?}");
    assert!(
        !frames.iter().any(|f| matches!(f, Frame::Stderr { .. })),
        "tty mode must not emit stderr frames"
    );
}

#[tokio::test]
async fn test_concurrent_jobs_interleave_but_each_terminates_once() {
    let (writer, mut reader) = start_agent();
    for i in 0..4 {
        writer
            .send(&exec_frame(
                &format!("C{i}"),
                &["/bin/sh", "-c", &format!("echo job{i}")],
                false,
                10,
            ))
            .await
            .unwrap();
    }

    let mut exits = std::collections::HashMap::new();
    let deadline = Duration::from_secs(15);
    while exits.len() < 4 {
        let frame = next_frame(&mut reader, deadline).await;
        if let Frame::Exit { job, exit_code, .. } = frame {
            assert!(
                exits.insert(job.clone(), exit_code).is_none(),
                "duplicate exit for {job}"
            );
        }
    }
    assert!(exits.values().all(|&code| code == 0));
}

#[tokio::test]
async fn test_agent_exits_cleanly_on_eof() {
    let (ours, theirs) = tokio::net::UnixStream::pair().unwrap();
    let (agent_read, agent_write) = theirs.into_split();
    let agent = tokio::spawn(orca::agent::serve(agent_read, agent_write));

    // Wait for the initial heartbeat so the agent is fully up before we
    // hang up on it.
    let (read, _write) = ours.into_split();
    let mut reader = FrameReader::new(read);
    let frame = next_frame(&mut reader, Duration::from_secs(5)).await;
    assert!(matches!(frame, Frame::Heartbeat { .. }));
    drop(reader);
    drop(_write);

    let result = tokio::time::timeout(Duration::from_secs(5), agent)
        .await
        .expect("agent did not exit on EOF")
        .expect("agent task panicked");
    assert!(result.is_ok());
}
