//! Port slots and per-session port mapping
//!
//! The server's ephemeral range `[start_port, end_port)` is cut into
//! `available_mbps / available_user_mbps` slots. [`SlotTable`] maps every port
//! in the range to exactly one slot (the last slot absorbs the remainder) and
//! every slot to at most one session, so an inbound packet's destination port
//! identifies its session with two array loads.
//!
//! [`PortMapper`] is the per-session, per-protocol flow table:
//!
//! - `by_flow`: `(src, dst, src_port, dst_port)` to mapping, used on egress.
//! - `by_mapped`: per mapped port, `(dst, dst_port)` to mapping, used on ingress.
//!
//! One mapped port multiplexes any number of flows as long as their foreign
//! peers differ. Per-port tables are copy-on-write behind [`ArcSwap`], so the
//! ingress lookup never locks; allocation and the sweeper take the per-port
//! mutex only.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::flags::TcpFlags;
use crate::ipv4::Transport;
use crate::{Error, Result};

/// Idle time after which a closed (RST or double FIN) TCP mapping is reclaimed
pub const TCP_CLOSED_IDLE: Duration = Duration::from_secs(10);
/// Idle time after which any TCP mapping is reclaimed
pub const TCP_IDLE: Duration = Duration::from_secs(360);
/// Idle time for UDP mappings towards a DNS server
pub const UDP_DNS_IDLE: Duration = Duration::from_secs(15);
/// Idle time for other UDP mappings
pub const UDP_IDLE: Duration = Duration::from_secs(150);
/// Sweeper period
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Half-open port range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(Error::InvalidConfig(format!(
                "empty port range {}..{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..self.end
    }
}

/// How the server range is divided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub range: PortRange,
    pub slot_count: usize,
    pub ports_per_slot: usize,
}

impl SlotLayout {
    pub fn new(
        start_port: u16,
        end_port: u16,
        available_mbps: u32,
        available_user_mbps: u32,
    ) -> Result<Self> {
        let range = PortRange::new(start_port, end_port)?;
        if available_user_mbps == 0 {
            return Err(Error::InvalidConfig("available_user_mbps is zero".into()));
        }
        let slot_count = (available_mbps / available_user_mbps) as usize;
        if slot_count == 0 {
            return Err(Error::InvalidConfig(
                "available_mbps / available_user_mbps yields no slots".into(),
            ));
        }
        let ports_per_slot = range.len() / slot_count;
        if ports_per_slot == 0 {
            return Err(Error::InvalidConfig(format!(
                "{} ports cannot be split into {} slots",
                range.len(),
                slot_count
            )));
        }
        Ok(Self {
            range,
            slot_count,
            ports_per_slot,
        })
    }

    /// Ports owned by `slot`
    pub fn slot_range(&self, slot: usize) -> PortRange {
        let start = self.range.start as usize + slot * self.ports_per_slot;
        let end = if slot + 1 == self.slot_count {
            self.range.end as usize
        } else {
            start + self.ports_per_slot
        };
        PortRange {
            start: start as u16,
            end: end as u16,
        }
    }
}

/// Dense `port -> slot -> session` table
pub struct SlotTable<H> {
    layout: SlotLayout,
    port_to_slot: Box<[u32]>,
    slots: Box<[ArcSwapOption<H>]>,
    assign: Mutex<()>,
}

impl<H> SlotTable<H> {
    pub fn new(layout: SlotLayout) -> Self {
        let port_to_slot = (0..layout.range.len())
            .map(|offset| (offset / layout.ports_per_slot).min(layout.slot_count - 1) as u32)
            .collect();
        let slots = (0..layout.slot_count)
            .map(|_| ArcSwapOption::empty())
            .collect();
        Self {
            layout,
            port_to_slot,
            slots,
            assign: Mutex::new(()),
        }
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Bind `handle` to the first free slot
    pub fn assign(&self, handle: Arc<H>) -> Result<(usize, PortRange)> {
        let _guard = self.assign.lock().unwrap_or_else(|e| e.into_inner());
        let slot = self
            .slots
            .iter()
            .position(|s| s.load().is_none())
            .ok_or(Error::Exhausted("port slot"))?;
        self.slots[slot].store(Some(handle));
        Ok((slot, self.layout.slot_range(slot)))
    }

    pub fn release(&self, slot: usize) {
        let _guard = self.assign.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = self.slots.get(slot) {
            s.store(None);
        }
    }

    /// Session owning `port`, if any
    #[inline]
    pub fn lookup(&self, port: u16) -> Option<Arc<H>> {
        if !self.layout.range.contains(port) {
            return None;
        }
        let slot = self.port_to_slot[(port - self.layout.range.start) as usize] as usize;
        self.slots[slot].load_full()
    }

    pub fn slot_of(&self, port: u16) -> Option<usize> {
        self.layout
            .range
            .contains(port)
            .then(|| self.port_to_slot[(port - self.layout.range.start) as usize] as usize)
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.load().is_none()).count()
    }
}

/// Original 4-tuple of an outbound flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// One mapped flow
#[derive(Debug)]
pub struct Mapping {
    pub key: FlowKey,
    pub mapped_port: u16,
    last_used_ms: AtomicU64,
    fin_count: AtomicU8,
    rst_seen: AtomicBool,
}

impl Mapping {
    fn new(key: FlowKey, mapped_port: u16, now_ms: u64) -> Self {
        Self {
            key,
            mapped_port,
            last_used_ms: AtomicU64::new(now_ms),
            fin_count: AtomicU8::new(0),
            rst_seen: AtomicBool::new(false),
        }
    }

    pub fn orig_src(&self) -> Ipv4Addr {
        self.key.src
    }

    pub fn orig_src_port(&self) -> u16 {
        self.key.src_port
    }

    pub fn fin_count(&self) -> u8 {
        self.fin_count.load(Ordering::Relaxed)
    }

    pub fn rst_seen(&self) -> bool {
        self.rst_seen.load(Ordering::Relaxed)
    }

    /// Apply TCP state from a segment seen in either direction
    pub fn observe(&self, flags: TcpFlags) {
        if flags.is_syn() {
            self.rst_seen.store(false, Ordering::Relaxed);
            self.fin_count.store(0, Ordering::Relaxed);
        }
        if flags.is_rst() {
            self.rst_seen.store(true, Ordering::Relaxed);
        }
        if flags.is_fin() {
            let _ = self
                .fin_count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    (n < 2).then_some(n + 1)
                });
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_used_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    fn idle(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_used_ms.load(Ordering::Relaxed)))
    }
}

type Peer = (Ipv4Addr, u16);

struct PortEntry {
    lock: Mutex<()>,
    peers: ArcSwap<HashMap<Peer, Arc<Mapping>>>,
}

/// Per-session flow table for one transport protocol
pub struct PortMapper {
    transport: Transport,
    range: PortRange,
    epoch: Instant,
    dns_servers: Vec<Ipv4Addr>,
    by_flow: DashMap<FlowKey, Arc<Mapping>>,
    by_mapped: Box<[PortEntry]>,
}

impl PortMapper {
    pub fn new(transport: Transport, range: PortRange, dns_servers: Vec<Ipv4Addr>) -> Self {
        Self::with_epoch(transport, range, dns_servers, Instant::now())
    }

    /// Mapper whose clock starts at `epoch`
    pub fn with_epoch(
        transport: Transport,
        range: PortRange,
        dns_servers: Vec<Ipv4Addr>,
        epoch: Instant,
    ) -> Self {
        let by_mapped = range
            .iter()
            .map(|_| PortEntry {
                lock: Mutex::new(()),
                peers: ArcSwap::from_pointee(HashMap::new()),
            })
            .collect();
        Self {
            transport,
            range,
            epoch,
            dns_servers,
            by_flow: DashMap::new(),
            by_mapped,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn len(&self) -> usize {
        self.by_flow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_flow.is_empty()
    }

    fn millis(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Existing mapping for `key`, or a new one on the first free port
    pub fn get_or_map_at(&self, key: FlowKey, now: Instant) -> Result<Arc<Mapping>> {
        let now_ms = self.millis(now);
        if let Some(existing) = self.by_flow.get(&key) {
            existing.touch(now_ms);
            return Ok(existing.clone());
        }

        let peer = (key.dst, key.dst_port);
        for (offset, entry) in self.by_mapped.iter().enumerate() {
            if entry.peers.load().contains_key(&peer) {
                continue;
            }
            let mapped_port = self.range.start + offset as u16;
            let mapping = Arc::new(Mapping::new(key, mapped_port, now_ms));
            {
                let _guard = entry.lock.lock().unwrap_or_else(|e| e.into_inner());
                let current = entry.peers.load_full();
                if current.contains_key(&peer) {
                    continue;
                }
                let mut next = HashMap::clone(&current);
                next.insert(peer, mapping.clone());
                entry.peers.store(Arc::new(next));
            }

            return match self.by_flow.entry(key) {
                Entry::Occupied(occupied) => {
                    let winner = occupied.get().clone();
                    drop(occupied);
                    self.unlink(&mapping);
                    Ok(winner)
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(mapping.clone());
                    log::debug!(
                        "{} {}:{} -> {}:{} mapped to port {}",
                        self.transport,
                        key.src,
                        key.src_port,
                        key.dst,
                        key.dst_port,
                        mapped_port
                    );
                    Ok(mapping)
                }
            };
        }

        Err(Error::Exhausted("mapped port"))
    }

    pub fn get_or_map(&self, key: FlowKey) -> Result<Arc<Mapping>> {
        self.get_or_map_at(key, Instant::now())
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Mapping>> {
        self.by_flow.get(key).map(|m| m.clone())
    }

    /// Reverse lookup for a reply from `peer` to `mapped_port`
    pub fn lookup_reverse_at(
        &self,
        mapped_port: u16,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        now: Instant,
    ) -> Option<Arc<Mapping>> {
        if !self.range.contains(mapped_port) {
            return None;
        }
        let entry = &self.by_mapped[(mapped_port - self.range.start) as usize];
        let mapping = entry.peers.load().get(&(peer_ip, peer_port)).cloned()?;
        mapping.touch(self.millis(now));
        Some(mapping)
    }

    pub fn lookup_reverse(
        &self,
        mapped_port: u16,
        peer_ip: Ipv4Addr,
        peer_port: u16,
    ) -> Option<Arc<Mapping>> {
        self.lookup_reverse_at(mapped_port, peer_ip, peer_port, Instant::now())
    }

    fn is_reclaimable(&self, mapping: &Mapping, now_ms: u64) -> bool {
        let idle = mapping.idle(now_ms);
        match self.transport {
            Transport::Tcp => {
                ((mapping.rst_seen() || mapping.fin_count() >= 2) && idle > TCP_CLOSED_IDLE)
                    || idle > TCP_IDLE
            }
            Transport::Udp => {
                if self.dns_servers.contains(&mapping.key.dst) {
                    idle > UDP_DNS_IDLE
                } else {
                    idle > UDP_IDLE
                }
            }
        }
    }

    fn unlink(&self, mapping: &Arc<Mapping>) {
        let Some(entry) = self
            .by_mapped
            .get((mapping.mapped_port - self.range.start) as usize)
        else {
            return;
        };
        let peer = (mapping.key.dst, mapping.key.dst_port);
        let _guard = entry.lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = entry.peers.load_full();
        if current
            .get(&peer)
            .is_some_and(|existing| Arc::ptr_eq(existing, mapping))
        {
            let mut next = HashMap::clone(&current);
            next.remove(&peer);
            entry.peers.store(Arc::new(next));
        }
    }

    /// Remove reclaimable mappings, returning how many went
    pub fn sweep_at(&self, now: Instant) -> usize {
        let now_ms = self.millis(now);
        let expired: Vec<Arc<Mapping>> = self
            .by_flow
            .iter()
            .filter(|e| self.is_reclaimable(e.value(), now_ms))
            .map(|e| e.value().clone())
            .collect();

        for mapping in &expired {
            self.by_flow
                .remove_if(&mapping.key, |_, v| Arc::ptr_eq(v, mapping));
            self.unlink(mapping);
        }
        expired.len()
    }

    /// Drop every mapping
    pub fn clear(&self) {
        self.by_flow.clear();
        for entry in self.by_mapped.iter() {
            let _guard = entry.lock.lock().unwrap_or_else(|e| e.into_inner());
            entry.peers.store(Arc::new(HashMap::new()));
        }
    }
}

/// The TCP and UDP mappers of one session
pub struct PortMappers {
    pub tcp: PortMapper,
    pub udp: PortMapper,
}

impl PortMappers {
    pub fn new(range: PortRange, dns_servers: Vec<Ipv4Addr>) -> Self {
        let epoch = Instant::now();
        Self::with_epoch(range, dns_servers, epoch)
    }

    pub fn with_epoch(range: PortRange, dns_servers: Vec<Ipv4Addr>, epoch: Instant) -> Self {
        Self {
            tcp: PortMapper::with_epoch(Transport::Tcp, range, dns_servers.clone(), epoch),
            udp: PortMapper::with_epoch(Transport::Udp, range, dns_servers, epoch),
        }
    }

    pub fn for_transport(&self, transport: Transport) -> &PortMapper {
        match transport {
            Transport::Tcp => &self.tcp,
            Transport::Udp => &self.udp,
        }
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        self.tcp.sweep_at(now) + self.udp.sweep_at(now)
    }

    pub fn clear(&self) {
        self.tcp.clear();
        self.udp.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::consts::*;

    fn key(src_port: u16, dst: [u8; 4], dst_port: u16) -> FlowKey {
        FlowKey {
            src: Ipv4Addr::new(10, 0, 0, 2),
            dst: Ipv4Addr::from(dst),
            src_port,
            dst_port,
        }
    }

    #[test]
    fn test_slot_layout() {
        let layout = SlotLayout::new(40000, 41000, 1000, 100).unwrap();
        assert_eq!(layout.slot_count, 10);
        assert_eq!(layout.ports_per_slot, 100);
        assert_eq!(layout.slot_range(0), PortRange { start: 40000, end: 40100 });
        assert_eq!(layout.slot_range(9), PortRange { start: 40900, end: 41000 });

        assert!(SlotLayout::new(40000, 41000, 1000, 0).is_err());
        assert!(SlotLayout::new(40000, 41000, 50, 100).is_err());
        assert!(SlotLayout::new(41000, 40000, 1000, 100).is_err());
    }

    #[test]
    fn test_remainder_goes_to_last_slot() {
        let layout = SlotLayout::new(1000, 1010, 3, 1).unwrap();
        assert_eq!(layout.ports_per_slot, 3);
        assert_eq!(layout.slot_range(2), PortRange { start: 1006, end: 1010 });

        let table: SlotTable<u32> = SlotTable::new(layout);
        for port in 1000..1010 {
            let slot = table.slot_of(port).unwrap();
            assert!(layout.slot_range(slot).contains(port));
        }
        assert_eq!(table.slot_of(1010), None);
    }

    #[test]
    fn test_slot_assign_release() {
        let table = SlotTable::new(SlotLayout::new(40000, 40004, 2, 1).unwrap());
        let (a, range_a) = table.assign(Arc::new("a")).unwrap();
        let (b, _) = table.assign(Arc::new("b")).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            table.assign(Arc::new("c")),
            Err(Error::Exhausted(_))
        ));

        assert_eq!(*table.lookup(range_a.start).unwrap(), "a");
        assert_eq!(*table.lookup(40003).unwrap(), "b");
        assert!(table.lookup(39999).is_none());

        table.release(a);
        assert!(table.lookup(range_a.start).is_none());
        assert_eq!(table.free_slots(), 1);
    }

    #[test]
    fn test_same_peer_needs_distinct_ports() {
        let mapper = PortMapper::new(Transport::Tcp, PortRange::new(40000, 40002).unwrap(), vec![]);
        let a = mapper.get_or_map(key(50000, [1, 1, 1, 1], 443)).unwrap();
        let b = mapper.get_or_map(key(50001, [1, 1, 1, 1], 443)).unwrap();
        assert_ne!(a.mapped_port, b.mapped_port);

        // A different peer may reuse the first port
        let c = mapper.get_or_map(key(50002, [8, 8, 8, 8], 443)).unwrap();
        assert_eq!(c.mapped_port, 40000);

        // Lookup of an existing flow returns the same mapping
        let again = mapper.get_or_map(key(50000, [1, 1, 1, 1], 443)).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[test]
    fn test_exhaustion_with_single_port() {
        let mapper = PortMapper::new(Transport::Tcp, PortRange::new(40000, 40001).unwrap(), vec![]);
        mapper.get_or_map(key(50000, [1, 1, 1, 1], 443)).unwrap();
        let err = mapper.get_or_map(key(50001, [1, 1, 1, 1], 443)).unwrap_err();
        assert!(matches!(err, Error::Exhausted(_)));
        assert_eq!(mapper.len(), 1);
    }

    #[test]
    fn test_reverse_lookup() {
        let mapper = PortMapper::new(Transport::Udp, PortRange::new(40000, 40010).unwrap(), vec![]);
        let m = mapper.get_or_map(key(5353, [9, 9, 9, 9], 53)).unwrap();
        let found = mapper
            .lookup_reverse(m.mapped_port, Ipv4Addr::new(9, 9, 9, 9), 53)
            .unwrap();
        assert_eq!(found.orig_src(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(found.orig_src_port(), 5353);
        assert!(mapper
            .lookup_reverse(m.mapped_port, Ipv4Addr::new(9, 9, 9, 9), 54)
            .is_none());
        assert!(mapper.lookup_reverse(39999, Ipv4Addr::new(9, 9, 9, 9), 53).is_none());
    }

    #[test]
    fn test_flag_bookkeeping() {
        let mapper = PortMapper::new(Transport::Tcp, PortRange::new(40000, 40010).unwrap(), vec![]);
        let m = mapper.get_or_map(key(50000, [1, 1, 1, 1], 443)).unwrap();
        m.observe(TcpFlags::new(TCP_FIN | TCP_ACK));
        m.observe(TcpFlags::new(TCP_FIN | TCP_ACK));
        m.observe(TcpFlags::new(TCP_FIN));
        assert_eq!(m.fin_count(), 2);
        m.observe(TcpFlags::new(TCP_RST));
        assert!(m.rst_seen());
        m.observe(TcpFlags::new(TCP_SYN));
        assert_eq!(m.fin_count(), 0);
        assert!(!m.rst_seen());
    }

    #[test]
    fn test_sweeper_tcp() {
        let epoch = Instant::now();
        let mapper = PortMapper::with_epoch(
            Transport::Tcp,
            PortRange::new(40000, 40010).unwrap(),
            vec![],
            epoch,
        );
        let reset = mapper.get_or_map_at(key(1, [1, 1, 1, 1], 80), epoch).unwrap();
        mapper.get_or_map_at(key(2, [1, 1, 1, 1], 81), epoch).unwrap();
        reset.observe(TcpFlags::new(TCP_RST));

        assert_eq!(mapper.sweep_at(epoch + Duration::from_secs(5)), 0);
        assert_eq!(mapper.sweep_at(epoch + Duration::from_secs(11)), 1);
        assert!(mapper.get(&key(1, [1, 1, 1, 1], 80)).is_none());
        assert!(mapper
            .lookup_reverse(reset.mapped_port, Ipv4Addr::new(1, 1, 1, 1), 80)
            .is_none());

        assert_eq!(mapper.sweep_at(epoch + Duration::from_secs(300)), 0);
        assert_eq!(mapper.sweep_at(epoch + Duration::from_secs(361)), 1);
        assert!(mapper.is_empty());
    }

    #[test]
    fn test_sweeper_udp_dns() {
        let epoch = Instant::now();
        let dns = Ipv4Addr::new(10, 8, 0, 1);
        let mapper = PortMapper::with_epoch(
            Transport::Udp,
            PortRange::new(40000, 40010).unwrap(),
            vec![dns],
            epoch,
        );
        mapper.get_or_map_at(key(1, dns.octets(), 53), epoch).unwrap();
        let other = mapper.get_or_map_at(key(2, [1, 2, 3, 4], 5000), epoch).unwrap();

        assert_eq!(mapper.sweep_at(epoch + Duration::from_secs(16)), 1);

        // Traffic keeps a mapping alive
        mapper
            .lookup_reverse_at(
                other.mapped_port,
                Ipv4Addr::new(1, 2, 3, 4),
                5000,
                epoch + Duration::from_secs(100),
            )
            .unwrap();
        assert_eq!(mapper.sweep_at(epoch + Duration::from_secs(200)), 0);
        assert_eq!(mapper.sweep_at(epoch + Duration::from_secs(251)), 1);
    }

    #[test]
    fn test_freed_port_is_reused() {
        let epoch = Instant::now();
        let mapper = PortMapper::with_epoch(
            Transport::Tcp,
            PortRange::new(40000, 40001).unwrap(),
            vec![],
            epoch,
        );
        let first = mapper.get_or_map_at(key(1, [1, 1, 1, 1], 80), epoch).unwrap();
        first.observe(TcpFlags::new(TCP_RST));
        mapper.sweep_at(epoch + Duration::from_secs(11));

        let second = mapper
            .get_or_map_at(key(2, [1, 1, 1, 1], 80), epoch + Duration::from_secs(12))
            .unwrap();
        assert_eq!(second.mapped_port, 40000);
    }
}
