use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};

use crate::packet::Family;
use super::{setsockopt_int, RawProtocol, SocketCapabilities};

// linux/in6.h, missing from older libc releases
const IPV6_HDRINCL: libc::c_int = 36;

pub struct Linux;

impl SocketCapabilities for Linux {
    fn open_raw_socket(family: Family, protocol: RawProtocol) -> io::Result<OwnedFd> {
        let (domain, protocol) = match (family, protocol) {
            (Family::V4, RawProtocol::Tcp) => (AddressFamily::Inet, SockProtocol::Tcp),
            (Family::V4, RawProtocol::Icmp) => (AddressFamily::Inet, SockProtocol::Icmp),
            (Family::V6, RawProtocol::Tcp) => (AddressFamily::Inet6, SockProtocol::Tcp),
            (Family::V6, RawProtocol::Icmp) => (AddressFamily::Inet6, SockProtocol::IcmpV6),
        };
        Ok(socket(domain, SockType::Raw, SockFlag::SOCK_CLOEXEC, protocol)?)
    }

    fn set_header_included(fd: &OwnedFd, family: Family) -> io::Result<()> {
        match family {
            Family::V4 => setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_HDRINCL, 1),
            Family::V6 => setsockopt_int(fd, libc::IPPROTO_IPV6, IPV6_HDRINCL, 1),
        }
    }

    fn set_mtu_discovery_probe(fd: &OwnedFd, family: Family) -> io::Result<()> {
        match family {
            Family::V4 => setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER,
                                         libc::IP_PMTUDISC_PROBE),
            Family::V6 => setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER,
                                         libc::IPV6_PMTUDISC_PROBE),
        }
    }

    fn set_non_blocking(fd: &OwnedFd) -> io::Result<()> {
        let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        Ok(())
    }

    fn set_mark(fd: &OwnedFd, mark: u32) -> io::Result<()> {
        setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_MARK, mark as libc::c_int)
    }
}
