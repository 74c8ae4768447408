//! Interface configuration

use std::net::Ipv4Addr;

use tnl_protocol::NicConfig;

use crate::error::{Error, Result};
use crate::DEFAULT_MTU;

/// IPv4 address of the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Config {
    pub address: Ipv4Addr,
    /// Network prefix length (e.g., 24 for /24)
    pub prefix_len: u8,
    /// Peer address for point-to-point links
    pub destination: Option<Ipv4Addr>,
}

impl Ipv4Config {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
            destination: None,
        }
    }

    pub fn netmask(&self) -> Ipv4Addr {
        match self.prefix_len {
            0 => Ipv4Addr::UNSPECIFIED,
            p if p >= 32 => Ipv4Addr::BROADCAST,
            p => Ipv4Addr::from(!((1u32 << (32 - p)) - 1)),
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & u32::from(self.netmask()))
    }
}

/// Configuration for opening a TUN interface
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Interface name (auto-generated if not specified)
    pub name: Option<String>,
    pub ipv4: Option<Ipv4Config>,
    pub mtu: u16,
    /// Frames carry the 4-byte address-family prefix (raw utun descriptors)
    pub packet_info: bool,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: None,
            ipv4: None,
            mtu: DEFAULT_MTU,
            packet_info: false,
        }
    }
}

impl TunConfig {
    pub fn builder() -> TunConfigBuilder {
        TunConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        let Some(ref ipv4) = self.ipv4 else {
            return Err(Error::Config("an IPv4 address must be configured".into()));
        };

        if ipv4.prefix_len > 32 {
            return Err(Error::InvalidPrefix(format!(
                "IPv4 prefix length {} is invalid (max 32)",
                ipv4.prefix_len
            )));
        }

        // 20-byte IPv4 header plus the largest transport header we rewrite
        if self.mtu < 68 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 68)",
                self.mtu
            )));
        }

        Ok(())
    }
}

impl From<&NicConfig> for TunConfig {
    fn from(nic: &NicConfig) -> Self {
        Self {
            name: nic.name.clone(),
            ipv4: Some(Ipv4Config::new(nic.address, nic.prefix_len)),
            mtu: nic.mtu,
            packet_info: false,
        }
    }
}

/// Builder for TunConfig
#[derive(Debug, Default)]
pub struct TunConfigBuilder {
    config: TunConfig,
}

impl TunConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn ipv4(mut self, address: impl Into<Ipv4Addr>, prefix_len: u8) -> Self {
        self.config.ipv4 = Some(Ipv4Config::new(address.into(), prefix_len));
        self
    }

    /// Point-to-point peer
    pub fn destination(mut self, dest: impl Into<Ipv4Addr>) -> Self {
        if let Some(ref mut ipv4) = self.config.ipv4 {
            ipv4.destination = Some(dest.into());
        }
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.config.mtu = mtu;
        self
    }

    pub fn packet_info(mut self, enabled: bool) -> Self {
        self.config.packet_info = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<TunConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_netmask() {
        let config = Ipv4Config::new(Ipv4Addr::new(10, 0, 0, 1), 24);
        assert_eq!(config.netmask(), Ipv4Addr::new(255, 255, 255, 0));

        let config = Ipv4Config::new(Ipv4Addr::new(10, 0, 0, 1), 32);
        assert_eq!(config.netmask(), Ipv4Addr::BROADCAST);

        let config = Ipv4Config::new(Ipv4Addr::new(10, 0, 0, 1), 0);
        assert_eq!(config.netmask(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_ipv4_network() {
        let config = Ipv4Config::new(Ipv4Addr::new(192, 168, 1, 50), 16);
        assert_eq!(config.network(), Ipv4Addr::new(192, 168, 0, 0));
    }

    #[test]
    fn test_config_builder() {
        let config = TunConfig::builder()
            .name("tun0")
            .ipv4(Ipv4Addr::new(10, 0, 0, 1), 24)
            .destination(Ipv4Addr::new(10, 0, 0, 254))
            .mtu(1420)
            .build()
            .unwrap();

        assert_eq!(config.name.as_deref(), Some("tun0"));
        assert_eq!(config.mtu, 1420);
        assert_eq!(
            config.ipv4.unwrap().destination,
            Some(Ipv4Addr::new(10, 0, 0, 254))
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(TunConfig::builder().name("tun0").build().is_err());
        assert!(TunConfig::builder()
            .ipv4(Ipv4Addr::new(10, 0, 0, 1), 33)
            .build()
            .is_err());
        assert!(TunConfig::builder()
            .ipv4(Ipv4Addr::new(10, 0, 0, 1), 24)
            .mtu(10)
            .build()
            .is_err());
    }

    #[test]
    fn test_from_nic_config() {
        let nic = NicConfig {
            name: Some("tunnels0".into()),
            address: Ipv4Addr::new(10, 255, 0, 2),
            prefix_len: 24,
            mtu: 1420,
        };
        let config = TunConfig::from(&nic);
        assert!(config.validate().is_ok());
        assert_eq!(config.ipv4.unwrap().address, nic.address);
        assert!(!config.packet_info);
    }
}
