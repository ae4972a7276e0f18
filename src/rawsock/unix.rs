use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use log::debug;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};

use crate::packet::Family;
use super::{setsockopt_int, RawProtocol, SocketCapabilities};

/// BSD-like systems: no header inclusion for IPv6 and no packet marks.
pub struct Unix;

impl SocketCapabilities for Unix {
    fn open_raw_socket(family: Family, protocol: RawProtocol) -> io::Result<OwnedFd> {
        let (domain, protocol) = match (family, protocol) {
            (Family::V4, RawProtocol::Tcp) => (AddressFamily::Inet, SockProtocol::Tcp),
            (Family::V4, RawProtocol::Icmp) => (AddressFamily::Inet, SockProtocol::Icmp),
            (Family::V6, RawProtocol::Tcp) => (AddressFamily::Inet6, SockProtocol::Tcp),
            (Family::V6, RawProtocol::Icmp) => (AddressFamily::Inet6, SockProtocol::IcmpV6),
        };
        Ok(socket(domain, SockType::Raw, SockFlag::empty(), protocol)?)
    }

    fn set_header_included(fd: &OwnedFd, family: Family) -> io::Result<()> {
        match family {
            Family::V4 => setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_HDRINCL, 1),
            Family::V6 => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }

    fn set_mtu_discovery_probe(fd: &OwnedFd, _family: Family) -> io::Result<()> {
        // DF is set in the headers we build; ICMP probes go out with the system default
        debug!("No path MTU discovery mode on this platform (fd {})", fd.as_raw_fd());
        Ok(())
    }

    fn set_non_blocking(fd: &OwnedFd) -> io::Result<()> {
        let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        Ok(())
    }

    fn set_mark(_fd: &OwnedFd, mark: u32) -> io::Result<()> {
        debug!("Ignoring packet mark {mark:#x}, not supported on this platform");
        Ok(())
    }
}
