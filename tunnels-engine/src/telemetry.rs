//! Host usage for heartbeats, and the privilege check

use tnl_protocol::HostStats;

use crate::error::{Error, Result};

fn percent(used: f64, total: f64) -> u8 {
    if total <= 0.0 {
        return 0;
    }
    (used / total * 100.0).clamp(0.0, 100.0).round() as u8
}

/// CPU (1-minute load over cores), memory and root-disk usage in percent
///
/// Anything the platform cannot report is zero.
pub fn host_stats() -> HostStats {
    HostStats {
        cpu: cpu_percent(),
        mem: mem_percent(),
        disk: disk_percent(),
    }
}

#[cfg(target_os = "linux")]
fn cpu_percent() -> u8 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;
    nix::sys::sysinfo::sysinfo()
        .map(|info| percent(info.load_average().0, cores))
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn mem_percent() -> u8 {
    nix::sys::sysinfo::sysinfo()
        .map(|info| {
            let total = info.ram_total() as f64;
            percent(total - info.ram_unused() as f64, total)
        })
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn cpu_percent() -> u8 {
    0
}

#[cfg(not(target_os = "linux"))]
fn mem_percent() -> u8 {
    0
}

#[cfg(unix)]
fn disk_percent() -> u8 {
    nix::sys::statvfs::statvfs("/")
        .map(|fs| {
            let total = fs.blocks() as f64;
            percent(total - fs.blocks_available() as f64, total)
        })
        .unwrap_or(0)
}

#[cfg(not(unix))]
fn disk_percent() -> u8 {
    0
}

/// Creating interfaces and raw sockets needs root
#[cfg(unix)]
pub fn require_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(Error::Permission(
            "must run as root (or with CAP_NET_ADMIN and CAP_NET_RAW)".into(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn require_privileges() -> Result<()> {
    Ok(())
}
