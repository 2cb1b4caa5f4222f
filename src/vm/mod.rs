//! Worker VM lifecycle.
//!
//! The pool asks a [`Hypervisor`] for guests; the production implementation
//! ([`qemu::QemuHypervisor`]) boots a QEMU microvm per worker. The trait is
//! the seam that lets integration tests supply an in-process stand-in
//! serving the agent protocol on a plain Unix socket.

pub mod qemu;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// What a guest needs at boot.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// Numeric worker id; also selects the overlay, sockets, and MACs.
    pub worker_id: u32,
    /// Host project root, shared read-only into the guest.
    pub project_root: PathBuf,
    /// Host build directory, shared writable into the guest.
    pub build_dir: PathBuf,
    /// Base qcow2 image the per-VM overlay derives from.
    pub base_image: PathBuf,
    /// Guest kernel image.
    pub kernel_image: PathBuf,
    /// Boot the guest with normally-skipped tests enabled.
    pub run_skipped: bool,
}

/// Guest-side addressing of the agent control device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// vsock context id (Linux hosts; CID ≥ 3).
    Vsock {
        /// Guest context id.
        cid: u32,
    },
    /// virtio-serial port surfaced on the host as a Unix socket.
    Serial,
}

/// A launched guest.
///
/// The agent is always reachable on `control_socket`; `transport` records
/// how the guest side addresses the device. Stopping tears down the
/// hypervisor process and deletes the overlay.
pub struct VmHandle {
    /// Worker id (stringified [`VmSpec::worker_id`]).
    pub id: String,
    /// Guest-side transport in use.
    pub transport: Transport,
    /// Host socket the pool connects to.
    pub control_socket: PathBuf,
    overlay: Option<PathBuf>,
    child: Mutex<Option<tokio::process::Child>>,
}

impl std::fmt::Debug for VmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmHandle")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("control_socket", &self.control_socket)
            .finish_non_exhaustive()
    }
}

impl VmHandle {
    /// Build a handle from its parts. Used by hypervisor implementations;
    /// test stand-ins pass `child: None`.
    #[must_use]
    pub fn new(
        id: String,
        transport: Transport,
        control_socket: PathBuf,
        overlay: Option<PathBuf>,
        child: Option<tokio::process::Child>,
    ) -> Self {
        Self {
            id,
            transport,
            control_socket,
            overlay,
            child: Mutex::new(child),
        }
    }

    /// Stop the guest: terminate the hypervisor, reap it, drop the overlay.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            // Give QEMU a moment to flush, then force.
            let graceful =
                tokio::time::timeout(std::time::Duration::from_secs(3), child.wait()).await;
            if graceful.is_err() {
                let _ = child.kill().await;
            }
            log::info!("[vm] Stopped hypervisor for vm{}", self.id);
        }
        drop(guard);

        if let Some(overlay) = &self.overlay {
            if let Err(e) = std::fs::remove_file(overlay) {
                if overlay.exists() {
                    log::warn!("[vm] Failed to remove overlay {}: {e}", overlay.display());
                }
            }
        }
        let _ = std::fs::remove_file(&self.control_socket);
    }
}

/// Seam between the pool and the machinery that boots guests.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Boot a guest for `spec` and return its handle.
    ///
    /// The returned handle's `control_socket` may not accept connections
    /// yet; callers retry within their connect budget.
    async fn launch(&self, spec: &VmSpec) -> Result<VmHandle>;
}
