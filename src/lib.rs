// Library modules
pub mod agent;
pub mod client;
pub mod config;
pub mod constants;
pub mod dilation;
pub mod discover;
pub mod history;
pub mod protocol;
pub mod server;
pub mod vm;

// Re-export commonly used types
pub use config::Config;
pub use history::{Execution, ExecutionStatus, HistoryStore};
pub use protocol::{ControlRequest, Frame, FrameReader, FrameWriter, JobSpec, StatusReply};
pub use server::pool::{Worker, WorkerPool, WorkerState};
pub use server::router::Router;
pub use vm::{Hypervisor, Transport, VmHandle, VmSpec};
