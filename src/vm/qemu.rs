//! QEMU microvm launcher.
//!
//! Each worker is a minimal guest: virtio-blk root on a per-VM qcow2
//! overlay, a read-only 9p share of the project root, a writable 9p share
//! of the build directory, four virtio-net interfaces with deterministic
//! MACs, and a virtio-serial control port carrying the agent protocol. The
//! port is exposed to the host as a Unix socket; on Linux a vsock device
//! with a deterministic CID is attached as well so the guest can use
//! native addressing.
//!
//! Kernel arguments boot the guest straight into agent mode.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::server::daemon;

use super::{Hypervisor, Transport, VmHandle, VmSpec};

/// Deterministic MAC prefix; the last two octets are worker id and NIC
/// index, so captures are attributable at a glance.
const MAC_PREFIX: &str = "52:54:00:6f";

/// Name the guest sees for the agent control port.
pub const AGENT_PORT_NAME: &str = "org.orca.agent";

/// Number of virtio-net interfaces per guest.
const NIC_COUNT: u32 = 4;

/// Guest memory.
const GUEST_MEMORY: &str = "256M";

/// Boots QEMU microvm guests.
#[derive(Debug, Default)]
pub struct QemuHypervisor;

impl QemuHypervisor {
    /// Pick the guest transport for this platform.
    ///
    /// Linux hosts get a vsock device (CID = id + 2, keeping CIDs ≥ 3 since
    /// 0–2 are reserved); the virtio-serial port backs the host socket on
    /// every platform.
    fn transport_for(worker_id: u32) -> Transport {
        if cfg!(target_os = "linux") {
            Transport::Vsock {
                cid: worker_id + 2,
            }
        } else {
            Transport::Serial
        }
    }

    /// Per-VM overlay path under the build directory.
    fn overlay_path(spec: &VmSpec) -> PathBuf {
        spec.build_dir
            .join("images")
            .join(format!("overlay-vm{}.qcow2", spec.worker_id))
    }

    /// Create the qcow2 overlay backed by the base image.
    async fn create_overlay(spec: &VmSpec, overlay: &Path) -> Result<()> {
        if let Some(parent) = overlay.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let output = Command::new("qemu-img")
            .arg("create")
            .arg("-q")
            .arg("-f")
            .arg("qcow2")
            .arg("-F")
            .arg("qcow2")
            .arg("-b")
            .arg(&spec.base_image)
            .arg(overlay)
            .output()
            .await
            .context("Failed to run qemu-img")?;
        if !output.status.success() {
            bail!(
                "qemu-img create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Kernel command line booting the guest into agent mode.
    fn kernel_args(spec: &VmSpec) -> String {
        let mut args = String::from("console=ttyS0 reboot=t quiet orca.agent=1");
        if spec.run_skipped {
            args.push_str(" orca.run_skipped=1");
        }
        args
    }

    /// Assemble the QEMU argument vector.
    fn build_command(
        spec: &VmSpec,
        overlay: &Path,
        socket: &Path,
        transport: &Transport,
    ) -> Command {
        let mut cmd = Command::new("qemu-system-x86_64");
        cmd.arg("-M")
            .arg("microvm,acpi=off")
            .arg("-m")
            .arg(GUEST_MEMORY)
            .arg("-smp")
            .arg("2")
            .arg("-no-reboot")
            .arg("-nodefaults")
            .arg("-display")
            .arg("none")
            .arg("-serial")
            .arg("none");

        cmd.arg("-kernel")
            .arg(&spec.kernel_image)
            .arg("-append")
            .arg(Self::kernel_args(spec));

        cmd.arg("-drive")
            .arg(format!(
                "id=root,file={},format=qcow2,if=none",
                overlay.display()
            ))
            .arg("-device")
            .arg("virtio-blk-device,drive=root");

        // Read-only project share and writable build share.
        cmd.arg("-fsdev")
            .arg(format!(
                "local,id=project,path={},security_model=none,readonly=on",
                spec.project_root.display()
            ))
            .arg("-device")
            .arg("virtio-9p-device,fsdev=project,mount_tag=project");
        cmd.arg("-fsdev")
            .arg(format!(
                "local,id=build,path={},security_model=none",
                spec.build_dir.display()
            ))
            .arg("-device")
            .arg("virtio-9p-device,fsdev=build,mount_tag=build");

        for nic in 0..NIC_COUNT {
            cmd.arg("-netdev")
                .arg(format!("user,id=net{nic}"))
                .arg("-device")
                .arg(format!(
                    "virtio-net-device,netdev=net{nic},mac={}",
                    Self::mac_address(spec.worker_id, nic)
                ));
        }

        // Agent control port, surfaced on the host as a Unix socket.
        cmd.arg("-chardev")
            .arg(format!(
                "socket,id=agent0,path={},server=on,wait=off",
                socket.display()
            ))
            .arg("-device")
            .arg("virtio-serial-device")
            .arg("-device")
            .arg(format!("virtserialport,chardev=agent0,name={AGENT_PORT_NAME}"));

        if let Transport::Vsock { cid } = transport {
            cmd.arg("-device")
                .arg(format!("vhost-vsock-device,guest-cid={cid}"));
        }

        cmd.kill_on_drop(true);
        cmd
    }

    /// Deterministic MAC for one NIC of one worker.
    fn mac_address(worker_id: u32, nic: u32) -> String {
        format!("{MAC_PREFIX}:{:02x}:{:02x}", worker_id & 0xff, nic & 0xff)
    }
}

#[async_trait]
impl Hypervisor for QemuHypervisor {
    async fn launch(&self, spec: &VmSpec) -> Result<VmHandle> {
        let socket = daemon::vm_socket_path(spec.worker_id)?;
        // A stale socket from a previous run would make QEMU fail to bind.
        let _ = std::fs::remove_file(&socket);

        let overlay = Self::overlay_path(spec);
        Self::create_overlay(spec, &overlay).await?;
        // Until the handle owns the overlay, clean it up on any early
        // return.
        let overlay_guard = scopeguard::guard(overlay.clone(), |path| {
            let _ = std::fs::remove_file(path);
        });

        let transport = Self::transport_for(spec.worker_id);
        let mut cmd = Self::build_command(spec, &overlay, &socket, &transport);
        let child = cmd
            .spawn()
            .context("Failed to spawn qemu-system-x86_64")?;

        log::info!(
            "[vm] Launched vm{} ({:?}, socket {})",
            spec.worker_id,
            transport,
            socket.display()
        );

        scopeguard::ScopeGuard::into_inner(overlay_guard);
        Ok(VmHandle::new(
            spec.worker_id.to_string(),
            transport,
            socket,
            Some(overlay),
            Some(child),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(worker_id: u32) -> VmSpec {
        VmSpec {
            worker_id,
            project_root: PathBuf::from("/srv/project"),
            build_dir: PathBuf::from("/srv/project/build"),
            base_image: PathBuf::from("/srv/project/build/images/guest.qcow2"),
            kernel_image: PathBuf::from("/srv/project/build/images/bzImage"),
            run_skipped: false,
        }
    }

    #[test]
    fn test_mac_addresses_are_deterministic_and_distinct() {
        let a = QemuHypervisor::mac_address(3, 0);
        let b = QemuHypervisor::mac_address(3, 1);
        let c = QemuHypervisor::mac_address(4, 0);
        assert_eq!(a, "52:54:00:6f:03:00");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_vsock_cids_start_at_three() {
        if let Transport::Vsock { cid } = QemuHypervisor::transport_for(1) {
            assert!(cid >= 3);
        }
    }

    #[test]
    fn test_kernel_args_carry_agent_mode() {
        let args = QemuHypervisor::kernel_args(&spec(1));
        assert!(args.contains("orca.agent=1"));
        assert!(!args.contains("run_skipped"));

        let mut s = spec(1);
        s.run_skipped = true;
        assert!(QemuHypervisor::kernel_args(&s).contains("orca.run_skipped=1"));
    }

    #[test]
    fn test_overlay_path_is_per_vm() {
        assert_ne!(
            QemuHypervisor::overlay_path(&spec(1)),
            QemuHypervisor::overlay_path(&spec(2))
        );
    }
}
