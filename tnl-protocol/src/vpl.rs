//! Virtual private LAN: DHCP-style leases and the cross-tenant switch
//!
//! Leases cover every host address of the LAN CIDR except the network
//! address, `.1` (the server's own LAN address) and broadcast. For example,
//! from `10.0.0.0/24` the first lease is `10.0.0.2` and the last `10.0.0.254`.
//!
//! A lease is sticky to the device token that first took it: after the
//! session goes away the address stays reserved for that token until the
//! lease timeout passes.
//!
//! The packet path resolves a destination address to the session that holds
//! it through a dense table indexed by host offset, read without locking.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use ipnet::Ipv4Net;

use crate::{Error, Result};

/// Largest LAN the switch will index (a /16)
pub const MIN_PREFIX_LEN: u8 = 16;

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VplLease {
    pub ip: Ipv4Addr,
    pub token: String,
    pub hostname: String,
}

#[derive(Debug, Default)]
struct LeaseSlot {
    token: Option<String>,
    hostname: String,
    active: bool,
    expires: Option<Instant>,
}

impl LeaseSlot {
    fn is_free(&self, now: Instant) -> bool {
        !self.active
            && (self.token.is_none() || self.expires.is_some_and(|deadline| deadline <= now))
    }
}

/// Lease table plus `ip -> session` index for one LAN
pub struct VplSwitch<H> {
    cidr: Ipv4Net,
    timeout: Duration,
    leases: Mutex<Vec<LeaseSlot>>,
    index: Box<[ArcSwapOption<H>]>,
}

impl<H> VplSwitch<H> {
    pub fn new(cidr: Ipv4Net, timeout: Duration) -> Result<Self> {
        if cidr.prefix_len() < MIN_PREFIX_LEN || cidr.prefix_len() > 30 {
            return Err(Error::InvalidNetwork(format!(
                "LAN {} must be between /{} and /30",
                cidr, MIN_PREFIX_LEN
            )));
        }
        let cidr = cidr.trunc();
        let size = 1usize << (32 - cidr.prefix_len());
        Ok(Self {
            cidr,
            timeout,
            leases: Mutex::new((0..size).map(|_| LeaseSlot::default()).collect()),
            index: (0..size).map(|_| ArcSwapOption::empty()).collect(),
        })
    }

    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    /// Whether `addr` is a LAN address
    #[inline]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.cidr.contains(&addr)
    }

    /// The server's own LAN address (`.1`)
    pub fn gateway(&self) -> Ipv4Addr {
        self.addr_at(1)
    }

    fn offset(&self, addr: Ipv4Addr) -> Option<usize> {
        self.contains(addr)
            .then(|| (u32::from(addr) - u32::from(self.cidr.network())) as usize)
    }

    fn addr_at(&self, offset: usize) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.cidr.network()) + offset as u32)
    }

    fn assignable(&self, offset: usize, size: usize) -> bool {
        offset >= 2 && offset + 1 < size
    }

    /// Lease an address for `token`, reusing its previous one if still held
    pub fn assign_at(&self, token: &str, hostname: &str, now: Instant) -> Result<VplLease> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let size = leases.len();

        let sticky = leases.iter().enumerate().position(|(offset, slot)| {
            self.assignable(offset, size)
                && slot.token.as_deref() == Some(token)
                && (slot.active || slot.expires.is_some_and(|deadline| deadline > now))
        });
        let offset = match sticky {
            Some(offset) => offset,
            None => leases
                .iter()
                .enumerate()
                .position(|(offset, slot)| self.assignable(offset, size) && slot.is_free(now))
                .ok_or(Error::Exhausted("LAN lease"))?,
        };

        let slot = &mut leases[offset];
        slot.token = Some(token.to_string());
        slot.hostname = hostname.to_string();
        slot.active = true;
        slot.expires = Some(now + self.timeout);

        let ip = self.addr_at(offset);
        log::debug!("LAN lease {} -> {} ({})", ip, token, hostname);
        Ok(VplLease {
            ip,
            token: token.to_string(),
            hostname: hostname.to_string(),
        })
    }

    pub fn assign(&self, token: &str, hostname: &str) -> Result<VplLease> {
        self.assign_at(token, hostname, Instant::now())
    }

    /// Point `ip` at a session so the packet path can reach it
    pub fn attach(&self, ip: Ipv4Addr, handle: Arc<H>) -> Result<()> {
        let offset = self
            .offset(ip)
            .ok_or_else(|| Error::InvalidNetwork(format!("{} outside {}", ip, self.cidr)))?;
        self.index[offset].store(Some(handle));
        Ok(())
    }

    /// Detach the session and keep the lease reserved until the timeout
    pub fn release_at(&self, ip: Ipv4Addr, now: Instant) {
        let Some(offset) = self.offset(ip) else {
            return;
        };
        self.index[offset].store(None);
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = leases.get_mut(offset) {
            slot.active = false;
            slot.expires = Some(now + self.timeout);
        }
    }

    pub fn release(&self, ip: Ipv4Addr) {
        self.release_at(ip, Instant::now())
    }

    /// Session currently holding `ip`
    #[inline]
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<Arc<H>> {
        self.offset(ip).and_then(|offset| self.index[offset].load_full())
    }

    /// Hostname recorded for `ip`
    pub fn hostname(&self, ip: Ipv4Addr) -> Option<String> {
        let offset = self.offset(ip)?;
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .get(offset)
            .filter(|slot| slot.token.is_some())
            .map(|slot| slot.hostname.clone())
    }

    /// Number of leases held by live sessions
    pub fn active(&self) -> usize {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases.iter().filter(|slot| slot.active).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switch(cidr: &str) -> VplSwitch<&'static str> {
        VplSwitch::new(cidr.parse().unwrap(), Duration::from_secs(600)).unwrap()
    }

    #[test]
    fn test_first_lease_skips_reserved() {
        let lan = switch("10.0.0.0/24");
        let lease = lan.assign("dev-a", "alpha").unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(lan.gateway(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(lan.hostname(lease.ip).as_deref(), Some("alpha"));
    }

    #[test]
    fn test_sticky_within_timeout() {
        let lan = switch("10.0.0.0/24");
        let now = Instant::now();
        let a = lan.assign_at("dev-a", "alpha", now).unwrap();
        let b = lan.assign_at("dev-b", "beta", now).unwrap();
        assert_ne!(a.ip, b.ip);

        lan.release_at(a.ip, now);
        let c = lan.assign_at("dev-c", "gamma", now).unwrap();
        assert_ne!(c.ip, a.ip);

        let again = lan
            .assign_at("dev-a", "alpha", now + Duration::from_secs(60))
            .unwrap();
        assert_eq!(again.ip, a.ip);
    }

    #[test]
    fn test_expired_lease_is_reusable() {
        let lan = switch("10.0.0.0/30");
        let now = Instant::now();
        // /30 has exactly one assignable host (.2)
        let a = lan.assign_at("dev-a", "alpha", now).unwrap();
        assert!(matches!(
            lan.assign_at("dev-b", "beta", now),
            Err(Error::Exhausted(_))
        ));

        lan.release_at(a.ip, now);
        assert!(lan.assign_at("dev-b", "beta", now).is_err());
        let b = lan
            .assign_at("dev-b", "beta", now + Duration::from_secs(601))
            .unwrap();
        assert_eq!(b.ip, a.ip);
    }

    #[test]
    fn test_index_attach_lookup() {
        let lan = switch("10.0.0.0/16");
        let lease = lan.assign("dev-a", "alpha").unwrap();
        lan.attach(lease.ip, Arc::new("session-a")).unwrap();
        assert_eq!(*lan.lookup(lease.ip).unwrap(), "session-a");
        assert!(lan.lookup(Ipv4Addr::new(10, 0, 9, 9)).is_none());
        assert!(lan.lookup(Ipv4Addr::new(192, 168, 0, 1)).is_none());
        assert!(lan.attach(Ipv4Addr::new(192, 168, 0, 1), Arc::new("x")).is_err());

        lan.release(lease.ip);
        assert!(lan.lookup(lease.ip).is_none());
        assert_eq!(lan.active(), 0);
    }

    #[test]
    fn test_rejects_oversized_lan() {
        assert!(VplSwitch::<()>::new("10.0.0.0/8".parse().unwrap(), Duration::ZERO).is_err());
    }
}
