//! Two sessions on one LAN: leases, lookups and firewall lifecycle

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tnl_protocol::flags::consts::*;
use tnl_protocol::{LanFirewall, TcpFlags, VplSwitch};

struct Tenant {
    name: &'static str,
    firewall: LanFirewall,
}

#[test]
fn test_syn_then_rst_between_tenants() {
    let lan: VplSwitch<Tenant> =
        VplSwitch::new("10.0.0.0/16".parse().unwrap(), Duration::from_secs(3600)).unwrap();

    // Burn .2 .3 .4 so the tenants land on .5 and .6
    for token in ["x", "y", "z"] {
        lan.assign(token, token).unwrap();
    }
    let a_lease = lan.assign("dev-a", "alpha").unwrap();
    let b_lease = lan.assign("dev-b", "beta").unwrap();
    assert_eq!(a_lease.ip, Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(b_lease.ip, Ipv4Addr::new(10, 0, 0, 6));

    let a = Arc::new(Tenant {
        name: "a",
        firewall: LanFirewall::new(),
    });
    let b = Arc::new(Tenant {
        name: "b",
        firewall: LanFirewall::new(),
    });
    lan.attach(a_lease.ip, a.clone()).unwrap();
    lan.attach(b_lease.ip, b.clone()).unwrap();

    // A -> B SYN to port 22
    let target = lan.lookup(b_lease.ip).unwrap();
    assert_eq!(target.name, "b");
    a.firewall
        .on_outbound(b_lease.ip, 22, Some(TcpFlags::new(TCP_SYN)), true);
    assert!(a.firewall.is_host_allowed(b_lease.ip, 22).is_some());

    // B has no entry for A, so unsolicited traffic is blocked at B
    assert!(!b
        .firewall
        .on_inbound(a_lease.ip, 41000, Some(TcpFlags::new(TCP_SYN)), true));

    // B -> A RST clears A's auto entry
    let back = lan.lookup(a_lease.ip).unwrap();
    b.firewall
        .on_outbound(a_lease.ip, 41000, Some(TcpFlags::new(TCP_RST)), true);
    assert!(back
        .firewall
        .on_inbound(b_lease.ip, 22, Some(TcpFlags::new(TCP_RST | TCP_ACK)), true));
    assert!(a.firewall.is_host_allowed(b_lease.ip, 22).is_none());
}

#[test]
fn test_reconnect_keeps_address() {
    let lan: VplSwitch<()> =
        VplSwitch::new("10.0.0.0/24".parse().unwrap(), Duration::from_secs(600)).unwrap();
    let first = lan.assign("device-token", "laptop").unwrap();
    lan.attach(first.ip, Arc::new(())).unwrap();
    lan.release(first.ip);
    assert!(lan.lookup(first.ip).is_none());

    let second = lan.assign("device-token", "laptop").unwrap();
    assert_eq!(first.ip, second.ip);
}
