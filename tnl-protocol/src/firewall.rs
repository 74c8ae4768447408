//! Per-session LAN firewall
//!
//! Each session keeps a list of LAN hosts allowed to reach it. `Auto` entries
//! appear when the session itself opens a TCP connection (SYN) to a LAN peer
//! and match on `(ip, port)`; `Manual` entries come from the client's firewall
//! sync and match on the IP alone. An auto entry goes away on RST in either
//! direction or once FIN has been seen both ways.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::flags::TcpFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKind {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedHost {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub kind: HostKind,
    /// FIN sent by this session
    pub from_fin: bool,
    /// FIN received by this session
    pub to_fin: bool,
}

impl AllowedHost {
    fn matches(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.ip == ip && (self.kind == HostKind::Manual || self.port == port)
    }
}

/// Allow-list for one session
#[derive(Debug, Default)]
pub struct LanFirewall {
    hosts: Mutex<Vec<AllowedHost>>,
    disabled: AtomicBool,
}

impl LanFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AllowedHost>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    /// Insert an entry; returns false if `(ip, port, kind)` already exists
    pub fn add_host(&self, ip: Ipv4Addr, port: u16, kind: HostKind) -> bool {
        let port = if kind == HostKind::Manual { 0 } else { port };
        let mut hosts = self.lock();
        if hosts
            .iter()
            .any(|h| h.ip == ip && h.port == port && h.kind == kind)
        {
            return false;
        }
        hosts.push(AllowedHost {
            ip,
            port,
            kind,
            from_fin: false,
            to_fin: false,
        });
        true
    }

    /// Remove every entry of `kind` for `ip`
    pub fn del_host(&self, ip: Ipv4Addr, kind: HostKind) -> usize {
        let mut hosts = self.lock();
        let before = hosts.len();
        hosts.retain(|h| !(h.ip == ip && h.kind == kind));
        before - hosts.len()
    }

    pub fn is_host_allowed(&self, ip: Ipv4Addr, port: u16) -> Option<AllowedHost> {
        self.lock().iter().find(|h| h.matches(ip, port)).copied()
    }

    /// Replace all manual entries
    pub fn set_manual_hosts(&self, ips: &[Ipv4Addr]) {
        let mut hosts = self.lock();
        hosts.retain(|h| h.kind != HostKind::Manual);
        for ip in ips {
            if !hosts.iter().any(|h| h.kind == HostKind::Manual && h.ip == *ip) {
                hosts.push(AllowedHost {
                    ip: *ip,
                    port: 0,
                    kind: HostKind::Manual,
                    from_fin: false,
                    to_fin: false,
                });
            }
        }
    }

    pub fn hosts(&self) -> Vec<AllowedHost> {
        self.lock().clone()
    }

    fn mark_fin(&self, ip: Ipv4Addr, port: u16, outbound: bool) {
        let mut hosts = self.lock();
        let Some(pos) = hosts
            .iter()
            .position(|h| h.kind == HostKind::Auto && h.ip == ip && h.port == port)
        else {
            return;
        };
        let host = &mut hosts[pos];
        if outbound {
            host.from_fin = true;
        } else {
            host.to_fin = true;
        }
        if host.from_fin && host.to_fin {
            hosts.remove(pos);
        }
    }

    /// Bookkeeping for a packet this session sends to LAN peer `dst`
    ///
    /// `target_present` is false when no session holds `dst`.
    pub fn on_outbound(
        &self,
        dst: Ipv4Addr,
        dst_port: u16,
        flags: Option<TcpFlags>,
        target_present: bool,
    ) {
        if !target_present {
            self.del_host(dst, HostKind::Auto);
            return;
        }
        let Some(flags) = flags else {
            return;
        };
        if flags.is_rst() {
            self.del_host(dst, HostKind::Auto);
        } else if flags.is_syn() {
            self.add_host(dst, dst_port, HostKind::Auto);
        } else if flags.is_fin() {
            self.mark_fin(dst, dst_port, true);
        }
    }

    /// Verdict and bookkeeping for a packet from LAN peer `src` to this session
    ///
    /// With `enforce` false (firewall disabled or net-admin) everything passes.
    pub fn on_inbound(
        &self,
        src: Ipv4Addr,
        src_port: u16,
        flags: Option<TcpFlags>,
        enforce: bool,
    ) -> bool {
        if enforce && !self.is_disabled() && self.is_host_allowed(src, src_port).is_none() {
            return false;
        }
        if let Some(flags) = flags {
            if flags.is_rst() {
                self.del_host(src, HostKind::Auto);
            } else if flags.is_fin() {
                self.mark_fin(src, src_port, false);
            }
        }
        true
    }
}
