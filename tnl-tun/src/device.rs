//! TUN device behind the [`VirtualNic`] seam
//!
//! Wraps `tun_rs::AsyncDevice`. Reads and writes carry bare IPv4 packets;
//! platform framing is handled here by [`Framing`].
//!
//! ```rust,ignore
//! let config = TunConfig::builder()
//!     .ipv4(Ipv4Addr::new(10, 255, 0, 2), 24)
//!     .mtu(1420)
//!     .build()?;
//! let device = TunDevice::create(config).await?;
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tnl_protocol::{NicConfig, NicFactory, NicInfo, VirtualNic};
use tokio::sync::watch;

#[cfg(unix)]
use std::os::unix::io::RawFd;

use crate::config::{Ipv4Config, TunConfig};
use crate::error::{Error, Result};
use crate::framing::Framing;
use crate::route::{Route, RouteManager};

/// A platform TUN interface
pub struct TunDevice {
    inner: tun_rs::AsyncDevice,
    info: Mutex<NicInfo>,
    framing: Framing,
    routes: Option<RouteManager>,
    closed: watch::Sender<bool>,
    read_scratch: tokio::sync::Mutex<Vec<u8>>,
    write_scratch: tokio::sync::Mutex<Vec<u8>>,
}

impl TunDevice {
    /// Create and bring up a TUN interface
    ///
    /// - **Linux**: requires root or `CAP_NET_ADMIN`
    /// - **macOS**: requires root
    /// - **Windows**: requires Administrator and the WinTun driver
    pub async fn create(config: TunConfig) -> Result<Self> {
        config.validate()?;
        let ipv4 = config
            .ipv4
            .clone()
            .ok_or_else(|| Error::Config("an IPv4 address must be configured".into()))?;

        let mut builder = tun_rs::DeviceBuilder::new();
        if let Some(ref name) = config.name {
            builder = builder.name(name);
        }
        builder = builder
            .ipv4(ipv4.address, ipv4.prefix_len, ipv4.destination)
            .mtu(config.mtu);

        let device = builder.build_async().map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::PermissionDenied(e.to_string())
            } else {
                Error::DeviceCreation(e.to_string())
            }
        })?;
        let name = device
            .name()
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        log::info!(
            "Created TUN device: {} {}/{} (MTU: {})",
            name,
            ipv4.address,
            ipv4.prefix_len,
            config.mtu
        );

        Ok(Self::wrap(device, name, &ipv4, config.mtu, config.packet_info))
    }

    /// Wrap a descriptor handed over by the platform (e.g. a utun fd)
    ///
    /// # Safety
    ///
    /// `fd` must be an open TUN descriptor that stays valid for the lifetime
    /// of the device; the device takes ownership and closes it on drop.
    #[cfg(unix)]
    pub unsafe fn from_fd(
        fd: RawFd,
        name: impl Into<String>,
        ipv4: Ipv4Config,
        mtu: u16,
        packet_info: bool,
    ) -> Result<Self> {
        let device = tun_rs::AsyncDevice::from_fd(fd).map_err(|e| {
            Error::DeviceCreation(format!("failed to create device from fd: {}", e))
        })?;
        let name = name.into();
        log::info!("Created TUN device from fd {}: {} (MTU: {})", fd, name, mtu);
        Ok(Self::wrap(device, name, &ipv4, mtu, packet_info))
    }

    fn wrap(
        inner: tun_rs::AsyncDevice,
        name: String,
        ipv4: &Ipv4Config,
        mtu: u16,
        packet_info: bool,
    ) -> Self {
        let routes = match RouteManager::new() {
            Ok(routes) => Some(routes),
            Err(e) => {
                log::warn!("Route management unavailable for {}: {}", name, e);
                None
            }
        };
        let (closed, _) = watch::channel(false);
        let framing = Framing::from_packet_info(packet_info);
        Self {
            inner,
            info: Mutex::new(NicInfo {
                name,
                mtu,
                address: ipv4.address,
                prefix_len: ipv4.prefix_len,
            }),
            framing,
            routes,
            closed,
            read_scratch: tokio::sync::Mutex::new(Vec::new()),
            write_scratch: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> String {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).name.clone()
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Routes installed on this interface
    pub fn routes(&self) -> Vec<Route> {
        self.routes.as_ref().map(|r| r.applied()).unwrap_or_default()
    }

    async fn recv_framed(&self, buf: &mut [u8]) -> Result<usize> {
        match self.framing {
            Framing::Raw => Ok(self.inner.recv(buf).await?),
            Framing::AfPrefix => {
                let mut scratch = self.read_scratch.lock().await;
                scratch.resize(buf.len() + self.framing.overhead(), 0);
                let n = self.inner.recv(&mut scratch).await?;
                self.framing.strip(&scratch[..n], buf)
            }
        }
    }

    async fn send_framed(&self, packet: &[u8]) -> Result<usize> {
        match self.framing {
            Framing::Raw => Ok(self.inner.send(packet).await?),
            Framing::AfPrefix => {
                let mut scratch = self.write_scratch.lock().await;
                self.framing.frame(packet, &mut scratch);
                let n = self.inner.send(&scratch).await?;
                Ok(n.saturating_sub(self.framing.overhead()))
            }
        }
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("info", &*self.info.lock().unwrap_or_else(|e| e.into_inner()))
            .field("framing", &self.framing)
            .finish()
    }
}

#[async_trait]
impl VirtualNic for TunDevice {
    async fn read(&self, buf: &mut [u8]) -> tnl_protocol::Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(Error::Closed(self.name()).into());
        }
        tokio::select! {
            res = self.recv_framed(buf) => Ok(res?),
            _ = closed.wait_for(|c| *c) => Err(Error::Closed(self.name()).into()),
        }
    }

    async fn write(&self, buf: &[u8]) -> tnl_protocol::Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed(self.name()).into());
        }
        Ok(self.send_framed(buf).await?)
    }

    async fn add_route(&self, net: Ipv4Net) -> tnl_protocol::Result<()> {
        let Some(ref routes) = self.routes else {
            return Err(Error::Route("route management unavailable".into()).into());
        };
        routes.add(&Route::interface_route(net, self.name())).await?;
        Ok(())
    }

    fn set_mtu(&self, mtu: u16) -> tnl_protocol::Result<()> {
        self.inner
            .set_mtu(mtu)
            .map_err(|e| Error::Config(format!("failed to set MTU: {}", e)))?;
        self.info.lock().unwrap_or_else(|e| e.into_inner()).mtu = mtu;
        Ok(())
    }

    async fn close(&self) -> tnl_protocol::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        if let Some(ref routes) = self.routes {
            routes.cleanup().await;
        }
        log::info!("Closed TUN device {}", self.name());
        Ok(())
    }

    fn info(&self) -> NicInfo {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Opens [`TunDevice`]s for the engine
#[derive(Debug, Default, Clone)]
pub struct TunNicFactory {
    /// Expect utun address-family prefixes on every frame
    pub packet_info: bool,
}

#[async_trait]
impl NicFactory for TunNicFactory {
    async fn open(&self, config: &NicConfig) -> tnl_protocol::Result<Arc<dyn VirtualNic>> {
        let mut tun = TunConfig::from(config);
        tun.packet_info = self.packet_info;
        let device = TunDevice::create(tun).await?;
        Ok(Arc::new(device))
    }
}
