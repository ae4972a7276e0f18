use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::constants::{DEFAULT_PER_TRY_TIMEOUT, DEFAULT_PHYSICAL_LINK_MTU, DEFAULT_PROBE_FWMARK};
use crate::error::{Error, Result};
use crate::firewall::Firewall;
use crate::icmp::IcmpProber;
use crate::net::{Network, SystemNetwork};
use crate::packet::Family;
use crate::rawsock::RawProtocol;
use crate::search::Timing;
use crate::tcp::TcpProber;

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    /// Starting ceiling, the MTU of our own link
    pub physical_link_mtu: u32,
    /// Time each round of probes gets
    pub per_try_timeout: Duration,
    /// Mark on the TCP probe socket, exempting our own RSTs from suppression
    pub fwmark: u32,
    /// Give up on the whole discovery at this point, None for no limit
    pub deadline: Option<Instant>,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            physical_link_mtu: DEFAULT_PHYSICAL_LINK_MTU,
            per_try_timeout: DEFAULT_PER_TRY_TIMEOUT,
            fwmark: DEFAULT_PROBE_FWMARK,
            deadline: None,
        }
    }
}

impl DiscoverOptions {
    /// Zero means default.
    pub fn normalized(self) -> DiscoverOptions {
        let default = DiscoverOptions::default();
        DiscoverOptions {
            physical_link_mtu: if self.physical_link_mtu == 0 { default.physical_link_mtu } else { self.physical_link_mtu },
            per_try_timeout: if self.per_try_timeout.is_zero() { default.per_try_timeout } else { self.per_try_timeout },
            ..self
        }
    }
}

pub struct Discoverer<'a> {
    network: &'a dyn Network,
    firewall: &'a dyn Firewall,
    options: DiscoverOptions,
}

impl<'a> Discoverer<'a> {
    pub fn new(network: &'a dyn Network, firewall: &'a dyn Firewall, options: DiscoverOptions) -> Discoverer<'a> {
        Discoverer {
            network,
            firewall,
            options: options.normalized(),
        }
    }

    /// ICMP targets first, each one that answers lowers the ceiling. Then the
    /// TCP targets in order, the first to yield an MTU wins.
    ///
    /// Missing privileges, a failing firewall and the overall deadline end the
    /// discovery at once, other errors only fail their target.
    pub fn discover(&self, icmp_targets: &[IpAddr], tcp_targets: &[SocketAddr]) -> Result<u32> {
        let timing = Timing { per_try: self.options.per_try_timeout, deadline: self.options.deadline };
        let mut ceiling = self.options.physical_link_mtu;
        let mut icmp_found = false;

        let mut icmp_probers: HashMap<Family, IcmpProber> = HashMap::new();
        for &target in icmp_targets {
            if timing.expired() {
                return Err(Error::DeadlineExceeded);
            }
            let family = Family::of(target);
            if !icmp_probers.contains_key(&family) {
                match self.network.open_raw(family, RawProtocol::Icmp) {
                    Ok(transport) => {
                        icmp_probers.insert(family, IcmpProber::new(transport));
                    }
                    Err(e) if e.is_permission_denied() => return Err(e),
                    Err(e) => {
                        warn!("Cannot open {family} ICMP socket: {e}");
                        continue;
                    }
                }
            }
            match icmp_probers[&family].discover(target, ceiling, timing) {
                Ok(mtu) => {
                    info!("ICMP target {target}: mtu {mtu}");
                    ceiling = mtu;
                    icmp_found = true;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("ICMP target {target}: {e}"),
            }
        }
        // done with ICMP, close the sockets
        drop(icmp_probers);

        if tcp_targets.is_empty() {
            return if icmp_found { Ok(ceiling) } else { Err(Error::MtuNotFound) };
        }
        debug!("TCP discovery with ceiling {ceiling}");

        let mut tcp_probers: HashMap<Family, TcpProber> = HashMap::new();
        let mut last_err = None;
        for &target in tcp_targets {
            if timing.expired() {
                return Err(Error::DeadlineExceeded);
            }
            let family = Family::of(target.ip());
            if !tcp_probers.contains_key(&family) {
                match self.network.open_raw(family, RawProtocol::Tcp) {
                    Ok(transport) => {
                        let prober = TcpProber::new(self.network, self.firewall, transport, self.options.fwmark);
                        tcp_probers.insert(family, prober);
                    }
                    Err(e) if e.is_permission_denied() => return Err(e),
                    Err(e) => {
                        warn!("Cannot open {family} TCP socket: {e}");
                        last_err = Some(Error::TcpTarget { target, source: Box::new(e) });
                        continue;
                    }
                }
            }
            match tcp_probers[&family].discover(target, family.min_mtu(), ceiling, timing) {
                Ok(mtu) => {
                    info!("TCP target {target}: mtu {mtu}");
                    return Ok(mtu);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("TCP target {target}: {e}");
                    last_err = Some(Error::TcpTarget { target, source: Box::new(e) });
                }
            }
        }
        Err(last_err.unwrap_or(Error::MtuNotFound))
    }
}

#[cfg(target_os = "linux")]
fn system_firewall() -> crate::firewall::Iptables {
    crate::firewall::Iptables
}

#[cfg(not(target_os = "linux"))]
fn system_firewall() -> crate::firewall::NoopFirewall {
    crate::firewall::NoopFirewall
}

/// Discover the path MTU with raw sockets of this host.
///
/// `physical_link_mtu` of 0 means 1500, `per_try_timeout` of 0 means one second.
/// Past `deadline` the discovery fails with `Error::DeadlineExceeded`.
pub fn path_mtu_discover(icmp_targets: &[IpAddr], tcp_targets: &[SocketAddr], physical_link_mtu: u32,
                         per_try_timeout: Duration, deadline: Option<Instant>) -> Result<u32> {
    let options = DiscoverOptions {
        physical_link_mtu,
        per_try_timeout,
        deadline,
        ..DiscoverOptions::default()
    };
    let network = SystemNetwork::new(options.fwmark);
    let firewall = system_firewall();
    Discoverer::new(&network, &firewall, options).discover(icmp_targets, tcp_targets)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::firewall::NoopFirewall;
    use crate::testing::{FailingFirewall, IcmpPeer, PathModel, SimulatedNetwork, TcpPeer};

    fn options(physical_link_mtu: u32) -> DiscoverOptions {
        DiscoverOptions {
            physical_link_mtu,
            per_try_timeout: Duration::from_millis(100),
            fwmark: 0,
            deadline: None,
        }
    }

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_options() {
        let default = DiscoverOptions::default();
        assert_eq!(default.physical_link_mtu, 1500);
        assert_eq!(default.per_try_timeout, Duration::from_secs(1));

        let zeros = DiscoverOptions { physical_link_mtu: 0, per_try_timeout: Duration::ZERO, fwmark: 7, deadline: None };
        let normalized = zeros.normalized();
        assert_eq!(normalized.physical_link_mtu, 1500);
        assert_eq!(normalized.per_try_timeout, Duration::from_secs(1));
        assert_eq!(normalized.fwmark, 7);
    }

    #[test]
    fn test_next_hop_mtu_without_further_probing() -> Result<()> {
        let network = SimulatedNetwork::new(PathModel { path_mtu: 1400, tcp: TcpPeer::Silent, icmp: IcmpPeer::Reporting });
        let mtu = Discoverer::new(&network, &NoopFirewall, options(1500)).discover(&[v4("192.0.2.1")], &[])?;
        assert_eq!(mtu, 1400);
        assert_eq!(network.sent(RawProtocol::Icmp).len(), 1);
        assert!(network.sent(RawProtocol::Tcp).is_empty());
        Ok(())
    }

    #[test]
    fn test_blackhole() {
        let network = SimulatedNetwork::new(PathModel { path_mtu: 1500, tcp: TcpPeer::Silent, icmp: IcmpPeer::Silent });
        let discoverer = Discoverer::new(&network, &NoopFirewall, options(1500));

        let err = discoverer.discover(&[v4("192.0.2.1")], &[sock("192.0.2.1:443")]).unwrap_err();
        assert!(err.is_mtu_not_found());
        assert!(matches!(err, Error::TcpTarget { target, .. } if target == sock("192.0.2.1:443")));

        let err = discoverer.discover(&[v4("192.0.2.1")], &[]).unwrap_err();
        assert!(matches!(err, Error::MtuNotFound));
    }

    #[test]
    fn test_icmp_lowers_tcp_ceiling() -> Result<()> {
        let network = SimulatedNetwork::new(PathModel {
            path_mtu: 1400,
            tcp: TcpPeer::Listening { mss: None },
            icmp: IcmpPeer::Reporting,
        });
        let mtu = Discoverer::new(&network, &NoopFirewall, options(1500))
            .discover(&[v4("192.0.2.1")], &[sock("192.0.2.1:443")])?;
        assert_eq!(mtu, 1400);
        let largest = network.sent(RawProtocol::Tcp).iter().map(|pkt| pkt.len()).max();
        assert_eq!(largest, Some(1400));
        Ok(())
    }

    #[test]
    fn test_prohibited_icmp_falls_through_to_tcp() -> Result<()> {
        let network = SimulatedNetwork::new(PathModel {
            path_mtu: 1400,
            tcp: TcpPeer::Listening { mss: None },
            icmp: IcmpPeer::Unreachable(13),
        });
        let mtu = Discoverer::new(&network, &NoopFirewall, options(1500))
            .discover(&[v4("192.0.2.1")], &[sock("192.0.2.1:443")])?;
        assert_eq!(mtu, 1400);
        Ok(())
    }

    #[test]
    fn test_tcp_without_icmp() -> Result<()> {
        let network = SimulatedNetwork::new(PathModel {
            path_mtu: 1420,
            tcp: TcpPeer::Closed,
            icmp: IcmpPeer::Silent,
        });
        let mtu = Discoverer::new(&network, &NoopFirewall, options(1500))
            .discover(&[], &[sock("[2001:db8::1]:443")])?;
        assert_eq!(mtu, 1420);
        Ok(())
    }

    #[test]
    fn test_failing_tcp_targets() -> Result<()> {
        let network = SimulatedNetwork::new(PathModel {
            path_mtu: 1500,
            tcp: TcpPeer::Listening { mss: None },
            icmp: IcmpPeer::Silent,
        });
        // too low a ceiling for IPv6
        let discoverer = Discoverer::new(&network, &NoopFirewall, options(1200));
        let v6 = sock("[2001:db8::1]:443");

        assert_eq!(discoverer.discover(&[], &[v6, sock("192.0.2.1:443")])?, 1200);

        let err = discoverer.discover(&[], &[v6]).unwrap_err();
        assert!(matches!(&err, Error::TcpTarget { target, source }
                         if *target == v6 && matches!(**source, Error::InvalidRange { .. })));
        Ok(())
    }

    #[test]
    fn test_permission_denied_is_fatal() {
        let model = PathModel { path_mtu: 1500, tcp: TcpPeer::Listening { mss: None }, icmp: IcmpPeer::Echo };
        let network = SimulatedNetwork::unprivileged(model);
        let discoverer = Discoverer::new(&network, &NoopFirewall, options(1500));
        assert!(discoverer.discover(&[v4("192.0.2.1")], &[sock("192.0.2.1:443")]).unwrap_err().is_permission_denied());
        assert!(discoverer.discover(&[], &[sock("192.0.2.1:443")]).unwrap_err().is_permission_denied());
    }

    #[test]
    fn test_firewall_failure_is_fatal() {
        let model = PathModel { path_mtu: 1400, tcp: TcpPeer::Listening { mss: None }, icmp: IcmpPeer::Silent };
        let network = SimulatedNetwork::new(model);
        let discoverer = Discoverer::new(&network, &FailingFirewall, options(1500));
        let err = discoverer.discover(&[], &[sock("192.0.2.1:443"), sock("192.0.2.2:443")]).unwrap_err();
        assert!(matches!(err, Error::Firewall(_)), "{err:?}");
        assert!(network.sent(RawProtocol::Tcp).is_empty());
    }

    #[test]
    fn test_deadline_spans_all_targets() {
        let network = SimulatedNetwork::new(PathModel { path_mtu: 1500, tcp: TcpPeer::Silent, icmp: IcmpPeer::Silent });
        let icmp_targets = [v4("192.0.2.1"), v4("192.0.2.2"), v4("192.0.2.3")];
        let tcp_targets = [sock("192.0.2.1:443"), sock("192.0.2.2:443"), sock("192.0.2.3:443")];

        // unbounded, each ICMP target takes two rounds and each TCP target one
        let started = Instant::now();
        let options = DiscoverOptions { deadline: Some(started + Duration::from_millis(250)), ..options(1500) };
        let err = Discoverer::new(&network, &NoopFirewall, options).discover(&icmp_targets, &tcp_targets).unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded), "{err:?}");
        assert!(started.elapsed() < Duration::from_millis(600));
        // the second ICMP target was cut short, no TCP target was tried
        assert!(network.sent(RawProtocol::Tcp).is_empty());
    }

    #[test]
    fn test_past_deadline() {
        let network = SimulatedNetwork::new(PathModel { path_mtu: 1500, tcp: TcpPeer::Closed, icmp: IcmpPeer::Echo });
        let options = DiscoverOptions { deadline: Some(Instant::now()), ..options(1500) };
        let err = Discoverer::new(&network, &NoopFirewall, options)
            .discover(&[v4("192.0.2.1")], &[sock("192.0.2.1:443")]).unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(network.sent(RawProtocol::Icmp).is_empty());
    }

    // needs CAP_NET_RAW and CAP_NET_ADMIN: cargo test -- --ignored
    #[test]
    #[ignore]
    fn test_loopback_closed_port() -> Result<()> {
        let lo = IpAddr::from([127, 0, 0, 1]);
        // bound, never listening: the kernel answers every SYN with an RST
        let closed = SystemNetwork::new(0).reserve_port(lo)?;
        let mtu = path_mtu_discover(&[], &[SocketAddr::new(lo, closed.port())], 1500, Duration::ZERO, None)?;
        assert_eq!(mtu, 1500);
        Ok(())
    }
}
