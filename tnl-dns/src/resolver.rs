//! Query pipeline
//!
//! For each query, in order:
//!
//! 1. Global lock held: echo the query back unchanged.
//! 2. Reverse-lookup (`.arpa.`) names are dropped.
//! 3. Fresh cache entry: answer from it.
//! 4. Override with records: synthesize A (TTL 5) / TXT (TTL 30) answers.
//! 5. Blocklisted: empty NXDOMAIN.
//! 6. Override without records: forward through the owning tunnel.
//! 7. Otherwise forward upstream; cache the answers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hickory_proto::op::{Header, Message, ResponseCode};
use hickory_proto::rr::rdata::{A, TXT};
use hickory_proto::rr::{RData, Record, RecordType};

use crate::blocklist::Blocklist;
use crate::cache::{CacheKey, DnsCache};
use crate::error::{Error, Result};
use crate::overrides::{OverrideEntry, Overrides};
use crate::upstream::Upstream;

pub const OVERRIDE_A_TTL: u32 = 5;
pub const OVERRIDE_TXT_TTL: u32 = 30;

#[derive(Debug, Default)]
struct Counters {
    queries: AtomicU64,
    locked: AtomicU64,
    dropped: AtomicU64,
    cache_hits: AtomicU64,
    overridden: AtomicU64,
    blocked: AtomicU64,
    tunneled: AtomicU64,
    forwarded: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub queries: u64,
    pub locked: u64,
    pub dropped: u64,
    pub cache_hits: u64,
    pub overridden: u64,
    pub blocked: u64,
    pub tunneled: u64,
    pub forwarded: u64,
    pub failures: u64,
}

pub struct Resolver {
    cache: Arc<DnsCache>,
    blocklist: Arc<Blocklist>,
    overrides: Arc<Overrides>,
    upstream: Arc<dyn Upstream>,
    /// Live `DnsLock` guards
    locks: AtomicUsize,
    counters: Counters,
}

impl Resolver {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        cache: Arc<DnsCache>,
        blocklist: Arc<Blocklist>,
        overrides: Arc<Overrides>,
    ) -> Self {
        Self {
            cache,
            blocklist,
            overrides,
            upstream,
            locks: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub fn overrides(&self) -> &Arc<Overrides> {
        &self.overrides
    }

    /// Stall resolution while connections switch
    ///
    /// Clears the cache; queries are echoed back until every guard drops.
    pub fn lock(self: &Arc<Self>) -> DnsLock {
        let holders = self.locks.fetch_add(1, Ordering::AcqRel) + 1;
        self.cache.clear();
        log::debug!("DNS locked ({} holders)", holders);
        DnsLock {
            resolver: self.clone(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locks.load(Ordering::Acquire) > 0
    }

    pub fn stats(&self) -> ResolverStats {
        let c = &self.counters;
        ResolverStats {
            queries: c.queries.load(Ordering::Relaxed),
            locked: c.locked.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            overridden: c.overridden.load(Ordering::Relaxed),
            blocked: c.blocked.load(Ordering::Relaxed),
            tunneled: c.tunneled.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Answer one raw query; `None` means no reply is sent
    pub async fn resolve(&self, query: &[u8]) -> Result<Option<Vec<u8>>> {
        let c = &self.counters;
        c.queries.fetch_add(1, Ordering::Relaxed);

        if self.is_locked() {
            c.locked.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(query.to_vec()));
        }

        let request = Message::from_vec(query)?;
        let Some(question) = request.queries().first().cloned() else {
            return Err(Error::Dns("DNS query has no questions".into()));
        };

        let name = question.name().to_ascii().to_ascii_lowercase();
        if name.trim_end_matches('.').ends_with(".arpa") {
            c.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let key = CacheKey::new(name.as_str(), question.query_type());
        if let Some(records) = self.cache.get(&key) {
            c.cache_hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("DNS cache hit for {}", name);
            return reply(&request, ResponseCode::NoError, records, true).map(Some);
        }

        let entry = self.overrides.lookup(&name);
        if let Some(ref entry) = entry {
            if entry.record.has_answers() {
                c.overridden.fetch_add(1, Ordering::Relaxed);
                let answers = synthesize(entry, &question);
                return reply(&request, ResponseCode::NoError, answers, true).map(Some);
            }
        }

        if self.blocklist.contains(&name) {
            c.blocked.fetch_add(1, Ordering::Relaxed);
            log::debug!("DNS blocked {}", name);
            return reply(&request, ResponseCode::NXDomain, Vec::new(), false).map(Some);
        }

        let result = match entry.and_then(|e| e.tunnel.clone()) {
            Some(tunnel) => {
                c.tunneled.fetch_add(1, Ordering::Relaxed);
                log::debug!("DNS {} via tunnel {} ({})", name, tunnel.tag, tunnel.server);
                self.upstream
                    .exchange_via(tunnel.server, tunnel.bind, query)
                    .await
            }
            None => {
                c.forwarded.fetch_add(1, Ordering::Relaxed);
                self.upstream.exchange(query).await
            }
        };

        let response = result.inspect_err(|_| {
            c.failures.fetch_add(1, Ordering::Relaxed);
        })?;

        match Message::from_vec(&response) {
            Ok(message) if message.response_code() == ResponseCode::NoError => {
                self.cache.insert(key, message.answers().to_vec());
            }
            Ok(_) => {}
            Err(e) => log::debug!("Uncacheable reply for {}: {}", name, e),
        }

        Ok(Some(response))
    }
}

/// Releases the global DNS lock on drop
pub struct DnsLock {
    resolver: Arc<Resolver>,
}

impl Drop for DnsLock {
    fn drop(&mut self) {
        if self.resolver.locks.fetch_sub(1, Ordering::AcqRel) == 1 {
            log::debug!("DNS unlocked");
        }
    }
}

fn synthesize(entry: &OverrideEntry, question: &hickory_proto::op::Query) -> Vec<Record> {
    let name = question.name().clone();
    match question.query_type() {
        RecordType::A => entry
            .record
            .ipv4
            .iter()
            .map(|ip| Record::from_rdata(name.clone(), OVERRIDE_A_TTL, RData::A(A(*ip))))
            .collect(),
        RecordType::TXT if !entry.record.txt.is_empty() => vec![Record::from_rdata(
            name,
            OVERRIDE_TXT_TTL,
            RData::TXT(TXT::new(entry.record.txt.clone())),
        )],
        _ => Vec::new(),
    }
}

fn reply(
    request: &Message,
    code: ResponseCode,
    answers: Vec<Record>,
    authoritative: bool,
) -> Result<Vec<u8>> {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(code);
    header.set_recursion_available(true);
    header.set_authoritative(authoritative);

    let mut response = Message::new();
    response.set_header(header);
    response.add_queries(request.queries().to_vec());
    response.add_answers(answers);
    Ok(response.to_vec()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::{DnsRecord, TunnelDns};
    use async_trait::async_trait;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::rr::Name;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::str::FromStr;
    use std::sync::Mutex;

    /// Answers every A query with 93.184.216.34, TTL 60
    #[derive(Default)]
    struct FakeUpstream {
        calls: AtomicU64,
        via: Mutex<Vec<(SocketAddr, Ipv4Addr)>>,
    }

    impl FakeUpstream {
        fn answer(query: &[u8]) -> Result<Vec<u8>> {
            let request = Message::from_vec(query)?;
            let question = request.queries()[0].clone();
            let answers = vec![Record::from_rdata(
                question.name().clone(),
                60,
                RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
            )];
            reply(&request, ResponseCode::NoError, answers, false)
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Self::answer(query)
        }

        async fn exchange_via(
            &self,
            server: SocketAddr,
            bind: Ipv4Addr,
            query: &[u8],
        ) -> Result<Vec<u8>> {
            self.via.lock().unwrap().push((server, bind));
            Self::answer(query)
        }
    }

    fn query(id: u16, name: &str, rtype: RecordType) -> Vec<u8> {
        let mut header = Header::new();
        header.set_id(id);
        header.set_message_type(MessageType::Query);
        header.set_op_code(OpCode::Query);
        header.set_recursion_desired(true);
        let mut message = Message::new();
        message.set_header(header);
        message.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
        message.to_vec().unwrap()
    }

    fn resolver() -> (Arc<Resolver>, Arc<FakeUpstream>) {
        let upstream = Arc::new(FakeUpstream::default());
        let resolver = Arc::new(Resolver::new(
            upstream.clone(),
            Arc::new(DnsCache::new(100)),
            Arc::new(Blocklist::new("/nonexistent", vec![])),
            Arc::new(Overrides::new()),
        ));
        (resolver, upstream)
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upstream() {
        let (resolver, upstream) = resolver();

        let first = resolver
            .resolve(&query(1, "example.com.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        let second = resolver
            .resolve(&query(2, "example.com.", RecordType::A))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        let first = Message::from_vec(&first).unwrap();
        let second = Message::from_vec(&second).unwrap();
        assert_eq!(second.id(), 2);
        assert_eq!(second.message_type(), MessageType::Response);
        assert_eq!(first.answers(), second.answers());
        assert_eq!(resolver.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_blocked_name_gets_empty_nxdomain() {
        let (resolver, upstream) = resolver();
        resolver.blocklist().replace(vec!["ads.example.com".to_string()]);

        let bytes = resolver
            .resolve(&query(7, "pixel.ads.example.com.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        let message = Message::from_vec(&bytes).unwrap();
        assert_eq!(message.response_code(), ResponseCode::NXDomain);
        assert!(message.answers().is_empty());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_override_beats_blocklist() {
        let (resolver, _) = resolver();
        resolver.blocklist().replace(vec!["corp.test".to_string()]);
        resolver.overrides().install(
            "office",
            &[DnsRecord {
                domain: "wiki.corp.test".into(),
                ipv4: vec![Ipv4Addr::new(10, 0, 0, 20)],
                txt: vec!["v=1".into()],
                wildcard: false,
            }],
            None,
        );

        let bytes = resolver
            .resolve(&query(3, "wiki.corp.test.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        let message = Message::from_vec(&bytes).unwrap();
        assert_eq!(message.answers().len(), 1);
        assert_eq!(message.answers()[0].ttl(), OVERRIDE_A_TTL);
        assert_eq!(
            message.answers()[0].data(),
            &RData::A(A(Ipv4Addr::new(10, 0, 0, 20)))
        );

        let bytes = resolver
            .resolve(&query(4, "wiki.corp.test.", RecordType::TXT))
            .await
            .unwrap()
            .unwrap();
        let message = Message::from_vec(&bytes).unwrap();
        assert_eq!(message.answers()[0].ttl(), OVERRIDE_TXT_TTL);
    }

    #[tokio::test]
    async fn test_tunnel_names_resolve_through_tunnel() {
        let (resolver, upstream) = resolver();
        let server: SocketAddr = "10.0.0.1:53".parse().unwrap();
        resolver.overrides().install(
            "office",
            &[DnsRecord {
                domain: "corp.test".into(),
                ipv4: vec![],
                txt: vec![],
                wildcard: true,
            }],
            Some(TunnelDns {
                tag: "office".into(),
                server,
                bind: Ipv4Addr::new(10, 255, 0, 2),
            }),
        );

        resolver
            .resolve(&query(5, "git.corp.test.", RecordType::A))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            upstream.via.lock().unwrap().as_slice(),
            &[(server, Ipv4Addr::new(10, 255, 0, 2))]
        );
    }

    #[tokio::test]
    async fn test_lock_echoes_queries_and_clears_cache() {
        let (resolver, upstream) = resolver();
        resolver
            .resolve(&query(1, "example.com.", RecordType::A))
            .await
            .unwrap();
        assert_eq!(resolver.cache().len(), 1);

        let guard = resolver.lock();
        assert!(resolver.cache().is_empty());
        let raw = query(9, "example.com.", RecordType::A);
        assert_eq!(resolver.resolve(&raw).await.unwrap().unwrap(), raw);
        drop(guard);

        assert!(!resolver.is_locked());
        resolver.resolve(&raw).await.unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_overlapping_locks_hold_until_last_release() {
        let (resolver, upstream) = resolver();
        let first = resolver.lock();
        let second = resolver.lock();

        drop(first);
        assert!(resolver.is_locked());
        let raw = query(3, "example.com.", RecordType::A);
        assert_eq!(resolver.resolve(&raw).await.unwrap().unwrap(), raw);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);

        drop(second);
        assert!(!resolver.is_locked());
        resolver.resolve(&raw).await.unwrap();
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_arpa_dropped() {
        let (resolver, upstream) = resolver();
        let out = resolver
            .resolve(&query(1, "4.3.2.1.in-addr.arpa.", RecordType::PTR))
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }
}
