//! Static and per-tunnel name overrides
//!
//! Each connected tunnel contributes the names it serves. A name with
//! records is answered locally; a name without records belongs to the
//! tunnel and is resolved by the tunnel's DNS server from the tunnel's local
//! address. The table is rebuilt and swapped whenever a tunnel comes or goes.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// A configured override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    pub domain: String,
    #[serde(default)]
    pub ipv4: Vec<Ipv4Addr>,
    #[serde(default)]
    pub txt: Vec<String>,
    /// Also match every subdomain
    #[serde(default)]
    pub wildcard: bool,
}

impl DnsRecord {
    pub fn has_answers(&self) -> bool {
        !self.ipv4.is_empty() || !self.txt.is_empty()
    }
}

/// How a tunnel's own names are resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDns {
    pub tag: String,
    /// DNS server reachable through the tunnel
    pub server: SocketAddr,
    /// Local interface address of the tunnel
    pub bind: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideEntry {
    pub tag: String,
    pub record: DnsRecord,
    pub tunnel: Option<TunnelDns>,
}

fn key(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Default)]
pub struct Overrides {
    table: ArcSwap<HashMap<String, Arc<OverrideEntry>>>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything `tag` contributes
    pub fn install(&self, tag: &str, records: &[DnsRecord], tunnel: Option<TunnelDns>) {
        self.table.rcu(|current| {
            let mut next: HashMap<String, Arc<OverrideEntry>> = current
                .iter()
                .filter(|(_, entry)| entry.tag != tag)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for record in records {
                next.insert(
                    key(&record.domain),
                    Arc::new(OverrideEntry {
                        tag: tag.to_string(),
                        record: record.clone(),
                        tunnel: tunnel.clone(),
                    }),
                );
            }
            next
        });
        log::debug!("DNS overrides for {}: {} names", tag, records.len());
    }

    pub fn remove(&self, tag: &str) {
        self.table.rcu(|current| {
            current
                .iter()
                .filter(|(_, entry)| entry.tag != tag)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>()
        });
    }

    /// Exact match first, then the closest wildcard parent
    pub fn lookup(&self, name: &str) -> Option<Arc<OverrideEntry>> {
        let table = self.table.load();
        if table.is_empty() {
            return None;
        }
        let name = key(name);
        if let Some(entry) = table.get(&name) {
            return Some(entry.clone());
        }
        let mut candidate = name.as_str();
        while let Some((_, parent)) = candidate.split_once('.') {
            if let Some(entry) = table.get(parent) {
                if entry.record.wildcard {
                    return Some(entry.clone());
                }
            }
            candidate = parent;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}
