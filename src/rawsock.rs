use std::io;
use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd};

use log::debug;
use nix::errno::Errno;
use nix::libc;
use nix::sys::socket::{MsgFlags, SockaddrIn, SockaddrIn6};

use crate::error::{Error, Result};
use crate::packet::Family;

/// Packet level access to the network, shared by one receiver and many senders.
///
/// `send_to` must be safe to call from several threads at once.
pub trait RawTransport: Send + Sync {
    fn family(&self) -> Family;
    fn send_to(&self, pkt: &[u8], dst: IpAddr) -> io::Result<()>;
    /// Non-blocking receive, `Ok(None)` when nothing is queued.
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawProtocol {
    Tcp,
    Icmp,
}

/// What a platform must offer to probe from raw sockets.
pub trait SocketCapabilities {
    fn open_raw_socket(family: Family, protocol: RawProtocol) -> io::Result<OwnedFd>;
    /// We write the IP header ourselves.
    fn set_header_included(fd: &OwnedFd, family: Family) -> io::Result<()>;
    /// Set DF but ignore the kernel's cached path MTU.
    fn set_mtu_discovery_probe(fd: &OwnedFd, family: Family) -> io::Result<()>;
    fn set_non_blocking(fd: &OwnedFd) -> io::Result<()>;
    fn set_mark(fd: &OwnedFd, mark: u32) -> io::Result<()>;
}

/// Integer socket option, for the ones `nix` has no wrapper for.
fn setsockopt_int(fd: &OwnedFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of_val(&value) as libc::socklen_t,
        )
    };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
type Platform = linux::Linux;

#[cfg(not(target_os = "linux"))]
mod unix;
#[cfg(not(target_os = "linux"))]
type Platform = unix::Unix;

pub struct RawSocket {
    fd: OwnedFd,
    family: Family,
}

impl RawSocket {
    /// Open a non-blocking raw socket. TCP sockets expect full IP packets,
    /// ICMP sockets expect bare ICMP messages.
    pub fn open(family: Family, protocol: RawProtocol, mark: u32) -> Result<RawSocket> {
        let fd = Platform::open_raw_socket(family, protocol).map_err(Error::from_socket_error)?;
        if protocol == RawProtocol::Tcp {
            Platform::set_header_included(&fd, family)?;
        }
        Platform::set_mtu_discovery_probe(&fd, family)?;
        Platform::set_non_blocking(&fd)?;
        if mark != 0 {
            // SO_MARK wants CAP_NET_ADMIN
            Platform::set_mark(&fd, mark).map_err(Error::from_socket_error)?;
        }
        debug!("Opened raw {protocol:?} socket for {family} (fd {})", fd.as_raw_fd());
        Ok(RawSocket { fd, family })
    }
}

impl RawTransport for RawSocket {
    fn family(&self) -> Family {
        self.family
    }

    fn send_to(&self, pkt: &[u8], dst: IpAddr) -> io::Result<()> {
        let fd = self.fd.as_raw_fd();
        let written = match dst {
            IpAddr::V4(ip) => nix::sys::socket::sendto(
                fd, pkt, &SockaddrIn::from(SocketAddrV4::new(ip, 0)), MsgFlags::empty())?,
            IpAddr::V6(ip) => nix::sys::socket::sendto(
                fd, pkt, &SockaddrIn6::from(SocketAddrV6::new(ip, 0, 0, 0)), MsgFlags::empty())?,
        };
        if written == pkt.len() {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::WriteZero))
        }
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match nix::sys::socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
            Ok(n) => Ok(Some(n)),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Sends that failed because the packet is bigger than the outgoing device allows.
pub fn is_msg_size_error(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::libc::EMSGSIZE)
}
