//! Prefix NAT between a tunnel's advertised networks and their local aliases
//!
//! A [`NatRule`] pairs a real `network` behind the server with the `nat`
//! prefix the client addresses it by. Egress destinations inside `nat` are
//! rewritten into `network` keeping the host bits; ingress sources inside
//! `network` are rewritten back. [`NatMaps`] memoizes both directions the
//! first time an address is seen.

use std::net::Ipv4Addr;

use dashmap::DashMap;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Replace the prefix bits of `addr` with those of `to`
#[inline]
pub fn rewrite_prefix(addr: Ipv4Addr, to: Ipv4Net) -> Ipv4Addr {
    let mask = u32::from(to.netmask());
    Ipv4Addr::from((u32::from(to.network()) & mask) | (u32::from(addr) & !mask))
}

/// One `network <-> nat` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRule {
    pub network: Ipv4Net,
    pub nat: Ipv4Net,
}

impl NatRule {
    pub fn new(network: Ipv4Net, nat: Ipv4Net) -> Result<Self> {
        if network.prefix_len() != nat.prefix_len() {
            return Err(Error::InvalidNetwork(format!(
                "{} and {} have different prefix lengths",
                network, nat
            )));
        }
        Ok(Self { network, nat })
    }

    /// Identity rule: traffic is not rewritten
    pub fn is_identity(&self) -> bool {
        self.network.network() == self.nat.network()
    }

    pub fn to_network(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        self.nat
            .contains(&addr)
            .then(|| rewrite_prefix(addr, self.network))
    }

    pub fn to_nat(&self, addr: Ipv4Addr) -> Option<Ipv4Addr> {
        self.network
            .contains(&addr)
            .then(|| rewrite_prefix(addr, self.nat))
    }
}

/// Per-session translation caches
#[derive(Debug, Default)]
pub struct NatMaps {
    rules: Vec<NatRule>,
    egress: DashMap<Ipv4Addr, Ipv4Addr>,
    ingress: DashMap<Ipv4Addr, Ipv4Addr>,
}

impl NatMaps {
    pub fn new(rules: Vec<NatRule>) -> Self {
        Self {
            rules: rules.into_iter().filter(|r| !r.is_identity()).collect(),
            egress: DashMap::new(),
            ingress: DashMap::new(),
        }
    }

    pub fn rules(&self) -> &[NatRule] {
        &self.rules
    }

    /// Rewrite an outbound destination, if a rule covers it
    pub fn egress(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        if let Some(hit) = self.egress.get(&dst) {
            return Some(*hit);
        }
        let translated = self.rules.iter().find_map(|r| r.to_network(dst))?;
        self.egress.insert(dst, translated);
        self.ingress.insert(translated, dst);
        Some(translated)
    }

    /// Restore an inbound source, if a rule covers it
    pub fn ingress(&self, src: Ipv4Addr) -> Option<Ipv4Addr> {
        if let Some(hit) = self.ingress.get(&src) {
            return Some(*hit);
        }
        let restored = self.rules.iter().find_map(|r| r.to_nat(src))?;
        self.ingress.insert(src, restored);
        Some(restored)
    }

    pub fn clear(&self) {
        self.egress.clear();
        self.ingress.clear();
    }
}
