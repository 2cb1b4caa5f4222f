//! Daemon infrastructure: socket paths, PID file, stale-file hygiene.
//!
//! # File layout
//!
//! ```text
//! /tmp/orca-{uid}/
//!   orca.sock          # controller control socket
//!   orca.pid           # PID of the running controller
//!   vm{id}.sock        # per-VM agent control sockets
//! ```
//!
//! Sockets live in `/tmp` because macOS limits Unix socket paths to 104
//! bytes and build directories routinely exceed that.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Per-uid runtime directory, created 0700 on first use.
///
/// `ORCA_RUNTIME_DIR` overrides the default so tests and parallel
/// controllers can isolate their sockets.
pub fn runtime_dir() -> Result<PathBuf> {
    let dir = match std::env::var("ORCA_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/orca-{uid}"))
        }
    };
    if !dir.exists() {
        // Restrictive umask avoids a TOCTOU window between mkdir and chmod
        // on shared /tmp.
        let old_umask = unsafe { libc::umask(0o077) };
        let result = fs::create_dir_all(&dir);
        unsafe {
            libc::umask(old_umask);
        }
        result.with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(dir)
}

/// Path of the controller's control socket.
pub fn control_socket_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("orca.sock"))
}

/// Path of the control socket for one VM's agent.
pub fn vm_socket_path(id: u32) -> Result<PathBuf> {
    Ok(runtime_dir()?.join(format!("vm{id}.sock")))
}

/// Path of the controller PID file.
pub fn pid_file_path() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("orca.pid"))
}

/// Record the current process as the running controller.
pub fn write_pid_file() -> Result<()> {
    let path = pid_file_path()?;
    fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// PID from the controller PID file, if present and parseable.
pub fn read_pid_file() -> Option<u32> {
    let path = pid_file_path().ok()?;
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// True when a controller process is alive per the PID file.
pub fn is_server_running() -> bool {
    let Some(pid) = read_pid_file() else {
        return false;
    };
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Remove PID, control-socket, and VM-socket files left by a dead
/// controller. No-op while a controller is alive.
pub fn cleanup_stale_files() {
    if is_server_running() {
        return;
    }
    let Ok(dir) = runtime_dir() else { return };
    let Ok(entries) = fs::read_dir(&dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".sock") || name == "orca.pid" {
            if fs::remove_file(&path).is_ok() {
                log::debug!("[daemon] Removed stale {}", path.display());
            }
        }
    }
}

/// Remove the controller's own files on shutdown.
pub fn cleanup_on_shutdown() {
    if let Ok(path) = pid_file_path() {
        let _ = fs::remove_file(path);
    }
    if let Ok(path) = control_socket_path() {
        let _ = fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_share_runtime_dir() {
        let dir = runtime_dir().unwrap();
        assert!(control_socket_path().unwrap().starts_with(&dir));
        assert!(vm_socket_path(3).unwrap().starts_with(&dir));
        assert!(
            vm_socket_path(3)
                .unwrap()
                .to_string_lossy()
                .ends_with("vm3.sock")
        );
    }

    #[test]
    fn test_pid_file_cycle() {
        write_pid_file().unwrap();
        assert_eq!(read_pid_file(), Some(std::process::id()));
        assert!(is_server_running());
        cleanup_on_shutdown();
        assert!(read_pid_file().is_none());
    }
}
