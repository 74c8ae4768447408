//! Routes through the tunnel interface
//!
//! Thin layer over `net-route`. Routes added through a [`RouteManager`] are
//! remembered so they can be withdrawn when the interface closes.

#[cfg(unix)]
use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Convert an interface name to its index
#[cfg(unix)]
fn interface_index(name: &str) -> Result<u32> {
    let c_name = CString::new(name).map_err(|_| Error::Config("invalid interface name".into()))?;

    // SAFETY: if_nametoindex only reads the NUL-terminated string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        return Err(Error::Route(format!(
            "interface '{}' not found ({})",
            name,
            std::io::Error::last_os_error()
        )));
    }

    Ok(index)
}

#[cfg(windows)]
fn interface_index(name: &str) -> Result<u32> {
    Err(Error::Config(format!(
        "interface routing by name not supported on Windows: {}",
        name
    )))
}

/// An IPv4 route entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Net,
    /// Gateway address (None for interface routes)
    pub gateway: Option<Ipv4Addr>,
    pub interface: Option<String>,
}

impl Route {
    /// Send `destination` straight into `interface`
    pub fn interface_route(destination: Ipv4Net, interface: impl Into<String>) -> Self {
        Self {
            destination,
            gateway: None,
            interface: Some(interface.into()),
        }
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    fn to_net_route(&self, strict: bool) -> Result<net_route::Route> {
        let mut route = net_route::Route::new(
            IpAddr::V4(self.destination.network()),
            self.destination.prefix_len(),
        );
        if let Some(gw) = self.gateway {
            route = route.with_gateway(IpAddr::V4(gw));
        }
        if let Some(ref iface) = self.interface {
            match interface_index(iface) {
                Ok(ifindex) => route = route.with_ifindex(ifindex),
                // The interface may already be gone during cleanup
                Err(e) if strict => return Err(e),
                Err(_) => {}
            }
        }
        Ok(route)
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(ref gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(ref iface) = self.interface {
            write!(f, " dev {}", iface)?;
        }
        Ok(())
    }
}

/// Adds and withdraws routes, tracking what it installed
///
/// Requires root / `CAP_NET_ADMIN` (Linux), root (macOS) or Administrator.
pub struct RouteManager {
    handle: net_route::Handle,
    applied: Mutex<Vec<Route>>,
}

impl RouteManager {
    pub fn new() -> Result<Self> {
        let handle = net_route::Handle::new()
            .map_err(|e| Error::Route(format!("failed to create route handle: {}", e)))?;
        Ok(Self {
            handle,
            applied: Mutex::new(Vec::new()),
        })
    }

    /// Add a route; an existing identical route is not an error
    pub async fn add(&self, route: &Route) -> Result<()> {
        let net_route = route.to_net_route(true)?;

        match self.handle.add(&net_route).await {
            Ok(()) => log::info!("Added route: {}", route),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists || e.raw_os_error() == Some(17) => {
                log::debug!("Route already exists: {}", route);
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(Error::PermissionDenied(format!("add route {}: {}", route, e)));
            }
            Err(e) => return Err(Error::Route(format!("failed to add route {}: {}", route, e))),
        }

        let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        if !applied.contains(route) {
            applied.push(route.clone());
        }
        Ok(())
    }

    pub async fn delete(&self, route: &Route) -> Result<()> {
        let net_route = route.to_net_route(false)?;
        self.handle
            .delete(&net_route)
            .await
            .map_err(|e| Error::Route(format!("failed to delete route {}: {}", route, e)))?;

        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| r != route);
        log::info!("Deleted route: {}", route);
        Ok(())
    }

    /// Routes installed through this manager, oldest first
    pub fn applied(&self) -> Vec<Route> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Withdraw every installed route, newest first, ignoring failures
    pub async fn cleanup(&self) {
        let routes = std::mem::take(&mut *self.applied.lock().unwrap_or_else(|e| e.into_inner()));
        for route in routes.iter().rev() {
            if let Ok(net_route) = route.to_net_route(false) {
                if let Err(e) = self.handle.delete(&net_route).await {
                    log::debug!("Route {} not removed: {}", route, e);
                }
            }
        }
    }
}
