use std::io;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::packet::tcp::TcpKind;
use crate::tcp::tracker::PortPair;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Not even the floor of a round was accepted.
    #[error("path MTU not found")]
    MtuNotFound,
    #[error("invalid MTU range: min {min} > max {max}")]
    InvalidRange { min: u32, max: u32 },
    #[error("operation not permitted (raw sockets need CAP_NET_RAW): {0}")]
    PermissionDenied(#[source] io::Error),
    #[error("packet too short: need {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("unknown IP version {0}")]
    UnknownIpVersion(u8),
    #[error("unknown TCP packet type: flags {0:#04x}")]
    UnknownTcpType(u8),
    #[error("unexpected {kind:?} packet while {state}")]
    UnexpectedPacket { kind: TcpKind, state: &'static str },
    #[error("unexpected final packet {0:?}")]
    UnexpectedFinalPacket(TcpKind),
    #[error("destination unreachable (code {0})")]
    DestinationUnreachable(u8),
    #[error("destination administratively prohibited")]
    AdministrativelyProhibited,
    #[error("port pair {0} is already registered")]
    PortPairInUse(PortPair),
    #[error("MTU {mtu} cannot hold {overhead} bytes of headers")]
    MtuTooSmall { mtu: u32, overhead: usize },
    #[error("firewall: {0}")]
    Firewall(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("discovery deadline exceeded")]
    DeadlineExceeded,
    #[error("address family mismatch between {0} and {1}")]
    FamilyMismatch(IpAddr, IpAddr),
    #[error("no source address for {0}: {1}")]
    NoSourceAddress(IpAddr, #[source] io::Error),
    #[error("TCP target {target}: {source}")]
    TcpTarget {
        target: SocketAddr,
        #[source]
        source: Box<Error>,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Error {
        Error::Io(e.into())
    }
}

impl Error {
    /// Map socket creation failures, so missing capabilities are reported as such.
    pub fn from_socket_error(e: io::Error) -> Error {
        match e.raw_os_error() {
            Some(nix::libc::EPERM) | Some(nix::libc::EACCES) => Error::PermissionDenied(e),
            _ => Error::Io(e),
        }
    }

    fn root(&self) -> &Error {
        match self {
            Error::TcpTarget { source, .. } => source.root(),
            e => e,
        }
    }

    pub fn is_mtu_not_found(&self) -> bool {
        matches!(self.root(), Error::MtuNotFound)
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self.root(), Error::PermissionDenied(_))
    }

    /// The peer sent something a handshake cannot make sense of. Fails one
    /// candidate, not the search.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self.root(), Error::TooShort { .. } | Error::UnknownIpVersion(_) | Error::UnknownTcpType(_)
                 | Error::UnexpectedPacket { .. } | Error::UnexpectedFinalPacket(_))
    }

    /// Local failures no other target would get past.
    pub fn is_fatal(&self) -> bool {
        matches!(self.root(), Error::PermissionDenied(_) | Error::Firewall(_) | Error::DeadlineExceeded)
    }
}
