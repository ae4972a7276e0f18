use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use nix::sys::socket::{bind, getsockname, socket, AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6};

use crate::error::{Error, Result};
use crate::packet::Family;
use crate::rawsock::{RawProtocol, RawSocket, RawTransport};
use crate::route;

/// A local port held for the length of one probe, released on drop.
pub struct ReservedPort {
    port: u16,
    _socket: Option<OwnedFd>,
}

impl ReservedPort {
    /// A port nothing in the kernel backs, for simulated networks.
    pub fn unbacked(port: u16) -> ReservedPort {
        ReservedPort { port, _socket: None }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Everything the probers need from the host.
pub trait Network: Send + Sync {
    fn open_raw(&self, family: Family, protocol: RawProtocol) -> Result<Arc<dyn RawTransport>>;
    fn source_addr(&self, dst: IpAddr) -> Result<IpAddr>;
    fn reserve_port(&self, src: IpAddr) -> Result<ReservedPort>;
}

pub struct SystemNetwork {
    mark: u32,
}

impl SystemNetwork {
    /// `mark` is put on raw TCP sockets, 0 for none.
    pub fn new(mark: u32) -> SystemNetwork {
        SystemNetwork { mark }
    }
}

impl Network for SystemNetwork {
    fn open_raw(&self, family: Family, protocol: RawProtocol) -> Result<Arc<dyn RawTransport>> {
        // only the TCP probes send RSTs that must get past the firewall
        let mark = if protocol == RawProtocol::Tcp { self.mark } else { 0 };
        Ok(Arc::new(RawSocket::open(family, protocol, mark)?))
    }

    fn source_addr(&self, dst: IpAddr) -> Result<IpAddr> {
        route::source_addr_for(dst).map_err(|e| Error::NoSourceAddress(dst, e))
    }

    // Bound but never listening: the port is ours, yet the kernel has no connection for it.
    fn reserve_port(&self, src: IpAddr) -> Result<ReservedPort> {
        let (port, fd) = match src {
            IpAddr::V4(ip) => {
                let fd = socket(AddressFamily::Inet, SockType::Stream, SockFlag::empty(), None)?;
                bind(fd.as_raw_fd(), &SockaddrIn::from(SocketAddrV4::new(ip, 0)))?;
                (getsockname::<SockaddrIn>(fd.as_raw_fd())?.port(), fd)
            }
            IpAddr::V6(ip) => {
                let fd = socket(AddressFamily::Inet6, SockType::Stream, SockFlag::empty(), None)?;
                bind(fd.as_raw_fd(), &SockaddrIn6::from(SocketAddrV6::new(ip, 0, 0, 0)))?;
                (getsockname::<SockaddrIn6>(fd.as_raw_fd())?.port(), fd)
            }
        };
        Ok(ReservedPort { port, _socket: Some(fd) })
    }
}
