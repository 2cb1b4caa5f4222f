//! Wire protocol types for the orca control plane.
//!
//! All three legs (client ↔ controller ↔ agent) speak the same JSON-line
//! protocol: one JSON object per line, `\n` terminated. [`Frame`] covers the
//! streaming leg (exec/stdin/signal/stdout/stderr/exit/heartbeat/error);
//! [`ControlRequest`] covers the structured requests a client sends to the
//! controller (submit_job/exec/shell/status/shutdown). Byte payloads travel
//! base64-encoded in the `data` field and are reproduced byte-for-byte.
//!
//! Consumers must ignore unknown fields, which serde does by default, so
//! either side can grow the protocol without breaking the other.

pub mod framing;

pub use framing::{FrameReader, FrameWriter};

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Base64 (de)serialization for the `data` field of frames.
///
/// Raw process output is not generally valid UTF-8, so it cannot ride in a
/// JSON string directly without corruption.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// A single protocol frame.
///
/// Initiating frames carry `id`; reply frames carry `ref` (the job id they
/// answer). Exactly one of the two is meaningful per frame type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Launch a child process (controller → agent).
    Exec {
        /// Job id; every reply frame for this job carries it as `ref`.
        id: String,
        /// Process launch parameters.
        payload: ExecPayload,
    },

    /// Deliver bytes to a child's stdin, or close it (client → agent).
    ///
    /// Empty `data` closes the child's stdin.
    Stdin {
        /// Job id this input belongs to.
        #[serde(rename = "ref")]
        job: String,
        /// Raw input bytes; empty means close.
        #[serde(with = "b64", default)]
        data: Vec<u8>,
    },

    /// Forward a numeric signal to a child (client → agent).
    Signal {
        /// Job id the signal targets.
        #[serde(rename = "ref")]
        job: String,
        /// Signal number (e.g. 15 for SIGTERM).
        signal: i32,
    },

    /// A chunk of child stdout (agent → client).
    Stdout {
        /// Job id that produced the output.
        #[serde(rename = "ref")]
        job: String,
        /// Raw output bytes.
        #[serde(with = "b64", default)]
        data: Vec<u8>,
        /// Worker id, injected by the router on the way through.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
    },

    /// A chunk of child stderr (agent → client, pipe mode only).
    Stderr {
        /// Job id that produced the output.
        #[serde(rename = "ref")]
        job: String,
        /// Raw output bytes.
        #[serde(with = "b64", default)]
        data: Vec<u8>,
        /// Worker id, injected by the router on the way through.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
    },

    /// Terminal frame: the child exited (agent → client).
    Exit {
        /// Job id that finished.
        #[serde(rename = "ref")]
        job: String,
        /// Mapped exit code (124 = killed by the timeout deadline).
        exit_code: i32,
        /// Worker id, injected by the router on the way through.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
    },

    /// Agent liveness beacon; also lifts a connected worker to ready.
    Heartbeat {
        /// Worker id, injected by the router on the way through.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
    },

    /// Terminal frame: something went wrong before or instead of `exit`.
    Error {
        /// Job id, when the error concerns a specific job.
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        job: Option<String>,
        /// Human-readable description.
        error: String,
        /// Worker id, injected by the router on the way through.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
    },
}

impl Frame {
    /// The job id this frame replies to, if it is a reply frame.
    #[must_use]
    pub fn job_ref(&self) -> Option<&str> {
        match self {
            Self::Stdin { job, .. }
            | Self::Signal { job, .. }
            | Self::Stdout { job, .. }
            | Self::Stderr { job, .. }
            | Self::Exit { job, .. } => Some(job),
            Self::Error { job, .. } => job.as_deref(),
            Self::Exec { .. } | Self::Heartbeat { .. } => None,
        }
    }

    /// True for frame types that end a route (`exit` and `error`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exit { .. } | Self::Error { .. })
    }

    /// Stamp the frame with the worker it came from.
    ///
    /// The router applies this to every inbound agent frame so clients can
    /// attribute output without tracking dispatch decisions.
    #[must_use]
    pub fn with_worker(mut self, id: &str) -> Self {
        match &mut self {
            Self::Stdout { worker_id, .. }
            | Self::Stderr { worker_id, .. }
            | Self::Exit { worker_id, .. }
            | Self::Heartbeat { worker_id }
            | Self::Error { worker_id, .. } => *worker_id = Some(id.to_string()),
            Self::Exec { .. } | Self::Stdin { .. } | Self::Signal { .. } => {}
        }
        self
    }
}

/// Launch parameters carried by an `exec` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecPayload {
    /// Argument vector; `command[0]` is the executable.
    pub command: Vec<String>,
    /// Extra environment entries for the child.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Allocate a pseudo-terminal instead of pipes.
    #[serde(default)]
    pub tty: bool,
    /// Deadline in seconds; 0 disables the deadline.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Working directory override; the agent picks a default otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// A job as submitted by a client.
///
/// Either `command` or `script` must be set; a script path is compiled into
/// `["/bin/sh", path]` at dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique id, opaque to the controller.
    pub id: String,
    /// Argument vector (takes precedence over `script` when non-empty).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Shell script path inside the guest, run as `/bin/sh <path>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    /// Extra environment entries for the child.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Allocate a pseudo-terminal.
    #[serde(default)]
    pub tty: bool,
    /// Deadline in seconds; 0 disables the deadline.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Pin the job to a named worker instead of general dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_worker: Option<String>,
}

impl JobSpec {
    /// Compile this job into the payload the agent receives.
    ///
    /// A `script` path becomes `["/bin/sh", path]`; an explicit `command`
    /// vector is passed through untouched.
    #[must_use]
    pub fn to_exec_payload(&self) -> ExecPayload {
        let command = if self.command.is_empty() {
            match &self.script {
                Some(path) => vec!["/bin/sh".to_string(), path.display().to_string()],
                None => Vec::new(),
            }
        } else {
            self.command.clone()
        };
        ExecPayload {
            command,
            env: self.env.clone(),
            tty: self.tty,
            timeout_seconds: self.timeout_seconds,
            cwd: None,
        }
    }
}

/// Reference to a job inside a control request (`exec`/`shell`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRef {
    /// Client-chosen job id.
    pub id: String,
}

/// Structured requests a client sends to the controller.
///
/// These share the connection with [`Frame`]s; the server tries this enum
/// first and falls back to frame parsing for `stdin`/`signal` lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Queue a job for dispatch.
    SubmitJob {
        /// The job to run.
        job: JobSpec,
    },

    /// Run an ad-hoc command (non-interactive, pipes).
    Exec {
        /// Argument vector to run.
        command: Vec<String>,
        /// Allocate a pty anyway (rarely useful for exec).
        #[serde(default)]
        tty: bool,
        /// Worker to pin to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_vm: Option<String>,
        /// Client-chosen job id for the synthesized job.
        job: JobRef,
    },

    /// Open an interactive shell (tty).
    Shell {
        /// Worker to pin to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_vm: Option<String>,
        /// Client-chosen job id for the synthesized job.
        job: JobRef,
    },

    /// Request a [`StatusReply`] snapshot.
    Status {},

    /// Stop the controller.
    Shutdown {},
}

/// Anything a client connection may send: a control request or a stream
/// frame (`stdin`/`signal`) addressed to a running job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    /// Structured control request.
    Control(ControlRequest),
    /// Stream frame forwarded toward the job's worker.
    Stream(Frame),
}

/// Point-in-time pool snapshot returned for `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    /// One entry per live worker record.
    pub vms: Vec<VmStatus>,
    /// Eagerly maintained baseline pool size.
    pub warm_size: usize,
    /// Hard cap on pool size.
    pub max_size: usize,
}

/// Status of one worker as reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmStatus {
    /// Worker id (stringified integer).
    pub id: String,
    /// Lifecycle state (`starting`, `connected`, `ready`, `stale`, ...).
    pub status: String,
    /// Whether the worker currently holds at least one job.
    pub busy: bool,
    /// Number of jobs currently running on the worker.
    pub active_jobs: u32,
    /// Seconds since the last heartbeat.
    pub last_health: f64,
    /// Path of the most recent job, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_job: Option<String>,
    /// Recent job paths, newest last.
    #[serde(default)]
    pub job_history: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip_preserves_bytes() {
        let frame = Frame::Stdout {
            job: "J1".to_string(),
            data: vec![0x00, 0xff, 0xfe, b'\n', 0x80],
            worker_id: None,
        };
        let line = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&line).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_frame_tag_names_are_snake_case() {
        let frame = Frame::Heartbeat { worker_id: None };
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "heartbeat");

        let frame = Frame::Exit {
            job: "J".into(),
            exit_code: 0,
            worker_id: None,
        };
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], "exit");
        assert_eq!(v["ref"], "J");
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let line = r#"{"type":"exit","ref":"J9","exit_code":3,"future_field":true}"#;
        let frame: Frame = serde_json::from_str(line).unwrap();
        assert_eq!(
            frame,
            Frame::Exit {
                job: "J9".into(),
                exit_code: 3,
                worker_id: None
            }
        );
    }

    #[test]
    fn test_with_worker_stamps_reply_frames_only() {
        let stamped = Frame::Exit {
            job: "J".into(),
            exit_code: 0,
            worker_id: None,
        }
        .with_worker("3");
        match stamped {
            Frame::Exit { worker_id, .. } => assert_eq!(worker_id.as_deref(), Some("3")),
            other => panic!("unexpected frame: {other:?}"),
        }

        // Exec has no worker_id field; stamping is a no-op.
        let exec = Frame::Exec {
            id: "J".into(),
            payload: ExecPayload {
                command: vec!["/bin/true".into()],
                env: HashMap::new(),
                tty: false,
                timeout_seconds: 0,
                cwd: None,
            },
        };
        assert_eq!(exec.clone().with_worker("3"), exec);
    }

    #[test]
    fn test_empty_stdin_means_close() {
        let line = r#"{"type":"stdin","ref":"J1"}"#;
        let frame: Frame = serde_json::from_str(line).unwrap();
        match frame {
            Frame::Stdin { data, .. } => assert!(data.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_job_spec_script_compiles_to_sh() {
        let job = JobSpec {
            id: "J1".into(),
            command: Vec::new(),
            script: Some(PathBuf::from("/mnt/project/tests/net_test.sh")),
            env: HashMap::new(),
            tty: false,
            timeout_seconds: 30,
            target_worker: None,
        };
        let payload = job.to_exec_payload();
        assert_eq!(
            payload.command,
            vec!["/bin/sh", "/mnt/project/tests/net_test.sh"]
        );
        assert_eq!(payload.timeout_seconds, 30);
    }

    #[test]
    fn test_client_message_distinguishes_control_and_stream() {
        let submit = r#"{"type":"submit_job","job":{"id":"J1","command":["/bin/true"]}}"#;
        match serde_json::from_str::<ClientMessage>(submit).unwrap() {
            ClientMessage::Control(ControlRequest::SubmitJob { job }) => {
                assert_eq!(job.id, "J1");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let stdin = r#"{"type":"stdin","ref":"J1","data":"aGk="}"#;
        match serde_json::from_str::<ClientMessage>(stdin).unwrap() {
            ClientMessage::Stream(Frame::Stdin { job, data }) => {
                assert_eq!(job, "J1");
                assert_eq!(data, b"hi");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_status_request_parses() {
        let line = r#"{"type":"status"}"#;
        match serde_json::from_str::<ClientMessage>(line).unwrap() {
            ClientMessage::Control(ControlRequest::Status {}) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
