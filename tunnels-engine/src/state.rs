//! Persisted client state under the base path
//!
//! ```text
//! <base>/tunnels.json          root config
//! <base>/tunnel/<tag>.tun.json one file per tunnel
//! <base>/blocklists/<tag>.txt  downloaded lists
//! <base>/logs/YYYY-MM-DD.log   daily logs
//! <base>/credentials           encrypted user credentials
//! ```
//!
//! The in-memory copies live behind [`ArcSwap`]; every edit builds the new
//! value, writes it to disk through a temp file and rename, then swaps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::config::{RootConfig, TunnelConfig};
use crate::error::{Error, Result};

pub const ROOT_FILE: &str = "tunnels.json";
pub const TUNNEL_DIR: &str = "tunnel";
pub const TUNNEL_SUFFIX: &str = ".tun.json";
pub const BLOCKLIST_DIR: &str = "blocklists";
pub const LOG_DIR: &str = "logs";
pub const CREDENTIALS_FILE: &str = "credentials";

/// Directory layout rooted at the base path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    base: PathBuf,
}

impl StatePaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn root_file(&self) -> PathBuf {
        self.base.join(ROOT_FILE)
    }

    pub fn tunnel_dir(&self) -> PathBuf {
        self.base.join(TUNNEL_DIR)
    }

    pub fn tunnel_file(&self, tag: &str) -> PathBuf {
        self.tunnel_dir().join(format!("{}{}", tag, TUNNEL_SUFFIX))
    }

    pub fn blocklist_dir(&self) -> PathBuf {
        self.base.join(BLOCKLIST_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base.join(LOG_DIR)
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.base.join(CREDENTIALS_FILE)
    }

    /// Create every directory of the layout
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.tunnel_dir(), self.blocklist_dir(), self.log_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::BadInput(format!("invalid state path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

type TunnelMap = BTreeMap<String, Arc<TunnelConfig>>;

/// Root and tunnel configs, loaded once and edited copy-on-write
pub struct AppState {
    paths: StatePaths,
    root: ArcSwap<RootConfig>,
    tunnels: ArcSwap<TunnelMap>,
    /// Serializes writers; readers never take it
    edit: Mutex<()>,
}

impl AppState {
    /// Load the state under `base`, creating a default root config if missing
    pub fn load(base: impl Into<PathBuf>) -> Result<Self> {
        let paths = StatePaths::new(base);
        paths.ensure_dirs()?;

        let root_file = paths.root_file();
        let root = if root_file.exists() {
            let content = std::fs::read_to_string(&root_file)?;
            let root: RootConfig = serde_json::from_str(&content)?;
            root.validate()?;
            root
        } else {
            let root = RootConfig::default();
            write_json(&root_file, &root)?;
            log::info!("Created default config at {}", root_file.display());
            root
        };

        let mut tunnels = TunnelMap::new();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(paths.tunnel_dir())?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(TUNNEL_SUFFIX))
            })
            .collect();
        entries.sort();

        for path in entries {
            let content = std::fs::read_to_string(&path)?;
            let tunnel: TunnelConfig = serde_json::from_str(&content)?;
            tunnel.validate()?;
            if tunnels.contains_key(&tunnel.tag) {
                return Err(Error::Conflict(format!(
                    "duplicate tunnel tag '{}' in {}",
                    tunnel.tag,
                    path.display()
                )));
            }
            tunnels.insert(tunnel.tag.clone(), Arc::new(tunnel));
        }
        log::debug!("Loaded {} tunnel(s) from {}", tunnels.len(), paths.base().display());

        Ok(Self {
            paths,
            root: ArcSwap::from_pointee(root),
            tunnels: ArcSwap::from_pointee(tunnels),
            edit: Mutex::new(()),
        })
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn root(&self) -> Arc<RootConfig> {
        self.root.load_full()
    }

    pub fn tunnel(&self, tag: &str) -> Option<Arc<TunnelConfig>> {
        self.tunnels.load().get(tag).cloned()
    }

    pub fn tunnels(&self) -> Vec<Arc<TunnelConfig>> {
        self.tunnels.load().values().cloned().collect()
    }

    /// Apply `edit` to a copy of the root config, persist it, then swap
    pub fn update_root<F>(&self, edit: F) -> Result<Arc<RootConfig>>
    where
        F: FnOnce(&mut RootConfig),
    {
        let _guard = self.edit.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = RootConfig::clone(&self.root.load());
        edit(&mut next);
        next.validate()?;
        write_json(&self.paths.root_file(), &next)?;
        let next = Arc::new(next);
        self.root.store(next.clone());
        Ok(next)
    }

    /// Add a new tunnel; its tag must be unused
    pub fn add_tunnel(&self, tunnel: TunnelConfig) -> Result<Arc<TunnelConfig>> {
        let _guard = self.edit.lock().unwrap_or_else(|e| e.into_inner());
        if self.tunnels.load().contains_key(&tunnel.tag) {
            return Err(Error::Conflict(format!("tunnel '{}' already exists", tunnel.tag)));
        }
        self.store_tunnel(tunnel)
    }

    /// Replace an existing tunnel's config
    pub fn save_tunnel(&self, tunnel: TunnelConfig) -> Result<Arc<TunnelConfig>> {
        let _guard = self.edit.lock().unwrap_or_else(|e| e.into_inner());
        if !self.tunnels.load().contains_key(&tunnel.tag) {
            return Err(Error::NotFound(format!("tunnel '{}'", tunnel.tag)));
        }
        self.store_tunnel(tunnel)
    }

    fn store_tunnel(&self, tunnel: TunnelConfig) -> Result<Arc<TunnelConfig>> {
        tunnel.validate()?;
        write_json(&self.paths.tunnel_file(&tunnel.tag), &tunnel)?;
        let tunnel = Arc::new(tunnel);
        let mut next = TunnelMap::clone(&self.tunnels.load());
        next.insert(tunnel.tag.clone(), tunnel.clone());
        self.tunnels.store(Arc::new(next));
        Ok(tunnel)
    }

    pub fn remove_tunnel(&self, tag: &str) -> Result<()> {
        let _guard = self.edit.lock().unwrap_or_else(|e| e.into_inner());
        if !self.tunnels.load().contains_key(tag) {
            return Err(Error::NotFound(format!("tunnel '{}'", tag)));
        }
        match std::fs::remove_file(self.paths.tunnel_file(tag)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut next = TunnelMap::clone(&self.tunnels.load());
        next.remove(tag);
        self.tunnels.store(Arc::new(next));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_load_creates_default_root() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::load(dir.path()).unwrap();
        assert!(dir.path().join(ROOT_FILE).exists());
        assert!(dir.path().join(TUNNEL_DIR).is_dir());
        assert!(dir.path().join(BLOCKLIST_DIR).is_dir());
        assert_eq!(state.root().auth_host, "api.tunnels.is");
        assert!(state.tunnels().is_empty());
    }

    #[test]
    fn test_tunnels_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let state = AppState::load(dir.path()).unwrap();
            state.add_tunnel(TunnelConfig::new("home", "s1")).unwrap();
            state.add_tunnel(TunnelConfig::new("work", "s2")).unwrap();
            state.update_root(|root| root.kill_switch = true).unwrap();
        }
        let state = AppState::load(dir.path()).unwrap();
        assert_eq!(state.tunnels().len(), 2);
        assert_eq!(state.tunnel("work").unwrap().server_id, "s2");
        assert!(state.root().kill_switch);
        assert!(dir.path().join("tunnel/home.tun.json").exists());
    }

    #[test]
    fn test_duplicate_tag_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::load(dir.path()).unwrap();
        state.add_tunnel(TunnelConfig::new("home", "s1")).unwrap();
        let err = state.add_tunnel(TunnelConfig::new("home", "s2")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(state.tunnel("home").unwrap().server_id, "s1");
    }

    #[test]
    fn test_duplicate_tag_on_disk_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        AppState::load(dir.path()).unwrap();
        let body = serde_json::to_vec(&TunnelConfig::new("home", "s1")).unwrap();
        std::fs::write(dir.path().join("tunnel/a.tun.json"), &body).unwrap();
        std::fs::write(dir.path().join("tunnel/b.tun.json"), &body).unwrap();
        let err = AppState::load(dir.path()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_invalid_edit_keeps_old_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::load(dir.path()).unwrap();
        let err = state.update_root(|root| root.auth_host.clear()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
        assert_eq!(state.root().auth_host, "api.tunnels.is");
    }

    #[test]
    fn test_remove_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::load(dir.path()).unwrap();
        state.add_tunnel(TunnelConfig::new("home", "s1")).unwrap();
        state.remove_tunnel("home").unwrap();
        assert!(state.tunnel("home").is_none());
        assert!(!dir.path().join("tunnel/home.tun.json").exists());
        assert_eq!(
            state.remove_tunnel("home").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
