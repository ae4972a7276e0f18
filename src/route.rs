// Read-only route and link information, used to pick a sensible ceiling.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};

use log::debug;

/// Local address the kernel would use to reach `dst`.
///
/// Connecting a UDP socket only resolves the route, nothing is sent.
pub fn source_addr_for(dst: IpAddr) -> io::Result<IpAddr> {
    let bind_addr: SocketAddr = match dst {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let sock = UdpSocket::bind(bind_addr)?;
    sock.connect(SocketAddr::new(dst, 9))?;  // discard
    Ok(sock.local_addr()?.ip())
}

/// Name of the interface holding `addr`.
pub fn interface_for(addr: IpAddr) -> io::Result<Option<String>> {
    for ifaddr in nix::ifaddrs::getifaddrs()? {
        let Some(storage) = ifaddr.address else {
            continue;
        };
        let ip = if let Some(sin) = storage.as_sockaddr_in() {
            IpAddr::V4(*SocketAddrV4::from(*sin).ip())
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            IpAddr::V6(*SocketAddrV6::from(*sin6).ip())
        } else {
            continue;
        };
        if ip == addr {
            return Ok(Some(ifaddr.interface_name));
        }
    }
    Ok(None)
}

#[cfg(target_os = "linux")]
pub fn interface_mtu(name: &str) -> io::Result<u32> {
    let content = std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))?;
    content.trim().parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad mtu of {name}: {e}")))
}

#[cfg(not(target_os = "linux"))]
pub fn interface_mtu(_name: &str) -> io::Result<u32> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// MTU of the interface traffic to `dst` leaves through, if it can be found.
pub fn link_mtu_for(dst: IpAddr) -> io::Result<Option<u32>> {
    let src = source_addr_for(dst)?;
    let Some(name) = interface_for(src)? else {
        debug!("No interface holds {src}");
        return Ok(None);
    };
    let mtu = interface_mtu(&name)?;
    debug!("Route to {dst} leaves {name} ({src}), mtu {mtu}");
    Ok(Some(mtu))
}
