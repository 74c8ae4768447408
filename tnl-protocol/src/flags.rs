//! TCP control flags as seen by the NAT and firewall bookkeeping

use std::fmt;

/// TCP flag bits (byte 13 of the TCP header)
pub mod consts {
    pub const TCP_FIN: u8 = 0x01;
    pub const TCP_SYN: u8 = 0x02;
    pub const TCP_RST: u8 = 0x04;
    pub const TCP_PSH: u8 = 0x08;
    pub const TCP_ACK: u8 = 0x10;
}

/// TCP flags wrapper with helper methods
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    /// Create flags from the raw header byte
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// ACK|RST, the normalized form of a bare reset
    pub const fn ack_rst() -> Self {
        Self(consts::TCP_ACK | consts::TCP_RST)
    }

    pub const fn is_syn(&self) -> bool {
        self.0 & consts::TCP_SYN != 0
    }

    pub const fn is_fin(&self) -> bool {
        self.0 & consts::TCP_FIN != 0
    }

    pub const fn is_rst(&self) -> bool {
        self.0 & consts::TCP_RST != 0
    }

    pub const fn is_ack(&self) -> bool {
        self.0 & consts::TCP_ACK != 0
    }

    /// RST observed without SYN in the same segment
    pub const fn is_bare_rst(&self) -> bool {
        self.is_rst() && !self.is_syn()
    }

    /// Get raw byte value
    pub const fn as_u8(&self) -> u8 {
        self.0
    }
}

impl From<u8> for TcpFlags {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<TcpFlags> for u8 {
    fn from(flags: TcpFlags) -> Self {
        flags.0
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if self.is_syn() {
            parts.push("SYN");
        }
        if self.is_fin() {
            parts.push("FIN");
        }
        if self.is_rst() {
            parts.push("RST");
        }
        if self.0 & consts::TCP_PSH != 0 {
            parts.push("PSH");
        }
        if self.is_ack() {
            parts.push("ACK");
        }

        if parts.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_predicates() {
        let syn = TcpFlags::new(consts::TCP_SYN);
        assert!(syn.is_syn());
        assert!(!syn.is_rst());

        let rst = TcpFlags::new(consts::TCP_RST);
        assert!(rst.is_bare_rst());

        let syn_rst = TcpFlags::new(consts::TCP_SYN | consts::TCP_RST);
        assert!(!syn_rst.is_bare_rst());

        assert_eq!(TcpFlags::ack_rst().as_u8(), 0b0001_0100);
    }

    #[test]
    fn test_flag_display() {
        assert_eq!(format!("{}", TcpFlags::new(0)), "-");
        assert_eq!(format!("{}", TcpFlags::new(0x12)), "SYN|ACK");
        assert_eq!(format!("{}", TcpFlags::ack_rst()), "RST|ACK");
        assert_eq!(format!("{}", TcpFlags::new(0x11)), "FIN|ACK");
    }
}
