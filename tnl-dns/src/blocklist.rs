//! Domain blocklists
//!
//! Each enabled [`BlockListSource`] is downloaded through a [`ListFetcher`],
//! kept on disk as `<dir>/<tag>.txt`, and merged into one domain set. The
//! merged set sits behind an `ArcSwap`: lookups are lock-free and a refresh
//! builds the new set off to the side before swapping it in.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// Hard cap on merged entries
pub const MAX_DOMAINS: usize = 2_000_000;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One configured list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockListSource {
    pub tag: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Domains in the last successful download
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub last_download: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl BlockListSource {
    pub fn new(tag: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            url: url.into(),
            enabled: true,
            count: 0,
            last_download: None,
        }
    }

    /// `<dir>/<tag>.txt`
    pub fn disk_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.txt", self.tag))
    }
}

/// Produces the domains of a list on demand
#[async_trait]
pub trait ListFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<String>>;
}

/// Downloads lists over HTTPS
pub struct HttpListFetcher {
    client: reqwest::Client,
}

impl HttpListFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ListFetcher for HttpListFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(Error::Fetch(format!("{}: HTTP {}", url, response.status())));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::Fetch(format!("{}: {}", url, e)))?;
        Ok(parse_list(&body))
    }
}

/// Parse plain or hosts-file formatted lists
///
/// `# comments`, blank lines and loopback hostnames are skipped; for
/// `0.0.0.0 ads.example.com` lines the last column is the domain.
pub fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.split('#').next()?.trim();
            let domain = line.split_whitespace().last()?;
            let domain = normalize(domain);
            if domain.is_empty()
                || matches!(
                    domain.as_str(),
                    "localhost" | "localhost.localdomain" | "local" | "broadcasthost"
                )
                || domain.parse::<std::net::IpAddr>().is_ok()
            {
                return None;
            }
            Some(domain)
        })
        .collect()
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

pub struct Blocklist {
    domains: ArcSwap<HashSet<String>>,
    sources: Mutex<Vec<BlockListSource>>,
    dir: PathBuf,
}

impl Blocklist {
    pub fn new(dir: impl Into<PathBuf>, sources: Vec<BlockListSource>) -> Self {
        Self {
            domains: ArcSwap::from_pointee(HashSet::new()),
            sources: Mutex::new(sources),
            dir: dir.into(),
        }
    }

    /// True if `name` or any parent domain is listed
    pub fn contains(&self, name: &str) -> bool {
        let domains = self.domains.load();
        if domains.is_empty() {
            return false;
        }
        let name = normalize(name);
        let mut candidate = name.as_str();
        loop {
            if domains.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return false,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.domains.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.load().is_empty()
    }

    pub fn sources(&self) -> Vec<BlockListSource> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configured lists and rebuild from disk
    pub async fn set_sources(&self, sources: Vec<BlockListSource>) -> Result<usize> {
        *self.sources.lock().unwrap_or_else(|e| e.into_inner()) = sources;
        self.load_from_disk().await
    }

    /// Swap in a merged set built from `domains`
    pub fn replace<I: IntoIterator<Item = String>>(&self, domains: I) -> usize {
        let merged: HashSet<String> = domains
            .into_iter()
            .map(|d| normalize(&d))
            .take(MAX_DOMAINS)
            .collect();
        let count = merged.len();
        self.domains.store(Arc::new(merged));
        count
    }

    /// Rebuild the merged set from the files of enabled lists
    pub async fn load_from_disk(&self) -> Result<usize> {
        let mut merged = Vec::new();
        for source in self.sources().iter().filter(|s| s.enabled) {
            let path = source.disk_path(&self.dir);
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => merged.extend(parse_list(&text)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::debug!("Blocklist {} not downloaded yet", source.tag);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let count = self.replace(merged);
        log::info!("Blocklist loaded: {} domains", count);
        Ok(count)
    }

    /// Download every enabled list, persist it and swap in the merged set
    ///
    /// A list that fails to download keeps its previous file.
    pub async fn refresh(&self, fetcher: &dyn ListFetcher) -> Result<usize> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut sources = self.sources();
        let mut merged = Vec::new();

        for source in sources.iter_mut().filter(|s| s.enabled) {
            let path = source.disk_path(&self.dir);
            match fetcher.fetch(&source.url).await {
                Ok(domains) => {
                    let tmp = path.with_extension("txt.tmp");
                    tokio::fs::write(&tmp, domains.join("\n")).await?;
                    tokio::fs::rename(&tmp, &path).await?;
                    source.count = domains.len();
                    source.last_download = Some(Utc::now());
                    log::info!("Blocklist {}: {} domains", source.tag, domains.len());
                    merged.extend(domains);
                }
                Err(e) => {
                    log::warn!("Blocklist {} refresh failed: {}", source.tag, e);
                    if let Ok(text) = tokio::fs::read_to_string(&path).await {
                        merged.extend(parse_list(&text));
                    }
                }
            }
        }

        {
            let mut current = self.sources.lock().unwrap_or_else(|e| e.into_inner());
            for updated in &sources {
                if let Some(slot) = current.iter_mut().find(|s| s.tag == updated.tag) {
                    slot.count = updated.count;
                    slot.last_download = updated.last_download;
                }
            }
        }

        Ok(self.replace(merged))
    }

    /// Refresh on a fixed period until shutdown
    pub async fn run_refresher(
        self: Arc<Self>,
        fetcher: Arc<dyn ListFetcher>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh(fetcher.as_ref()).await {
                        log::warn!("Blocklist refresh failed: {}", e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Blocklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blocklist")
            .field("domains", &self.len())
            .field("dir", &self.dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetcher(Vec<&'static str>);

    #[async_trait]
    impl ListFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<String>> {
            if url.contains("broken") {
                return Err(Error::Fetch("offline".into()));
            }
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    #[test]
    fn test_parse_hosts_format() {
        let text = "# ads\n0.0.0.0 ads.example.com\n127.0.0.1 localhost\ntracker.net # inline\n\n1.2.3.4\n";
        assert_eq!(parse_list(text), vec!["ads.example.com", "tracker.net"]);
    }

    #[test]
    fn test_contains_matches_parents() {
        let list = Blocklist::new("/nonexistent", vec![]);
        list.replace(vec!["Ads.Example.com.".to_string()]);
        assert!(list.contains("ads.example.com."));
        assert!(list.contains("x.ads.example.com"));
        assert!(!list.contains("example.com"));
        assert!(!list.contains("notads.example.com"));
    }

    #[tokio::test]
    async fn test_refresh_persists_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let list = Blocklist::new(
            dir.path(),
            vec![
                BlockListSource::new("ads", "https://lists.test/ads"),
                BlockListSource {
                    enabled: false,
                    ..BlockListSource::new("off", "https://lists.test/off")
                },
            ],
        );

        let fetcher = StaticFetcher(vec!["ads.example.com", "tracker.net"]);
        assert_eq!(list.refresh(&fetcher).await.unwrap(), 2);
        assert!(list.contains("tracker.net"));
        assert!(dir.path().join("ads.txt").exists());
        assert!(!dir.path().join("off.txt").exists());

        let ads = &list.sources()[0];
        assert_eq!(ads.count, 2);
        assert!(ads.last_download.is_some());

        // A fresh instance picks the list up from disk
        let reloaded = Blocklist::new(dir.path(), list.sources());
        assert_eq!(reloaded.load_from_disk().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.txt"), "kept.example\n").unwrap();
        let list = Blocklist::new(
            dir.path(),
            vec![BlockListSource::new("old", "https://broken.test/list")],
        );
        assert_eq!(list.refresh(&StaticFetcher(vec![])).await.unwrap(), 1);
        assert!(list.contains("kept.example"));
        assert_eq!(list.sources()[0].count, 0);
    }
}
