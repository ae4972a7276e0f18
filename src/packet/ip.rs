use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use crate::constants::{IP_TTL, MIN_IPV4_MTU, MIN_IPV6_MTU};
use crate::error::{Error, Result};
use super::checksum::checksum;
use super::ensure_len;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_ICMPV6: u8 = 58;

const IPV4_FLAG_DF: u16 = 0x4000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: IpAddr) -> Family {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            Family::V4 => IPV4_HEADER_LEN,
            Family::V6 => IPV6_HEADER_LEN,
        }
    }

    pub fn min_mtu(self) -> u32 {
        match self {
            Family::V4 => MIN_IPV4_MTU,
            Family::V6 => MIN_IPV6_MTU,
        }
    }

    pub fn icmp_protocol(self) -> u8 {
        match self {
            Family::V4 => PROTO_ICMP,
            Family::V6 => PROTO_ICMPV6,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Append an IPv4 header (DF set, no options) for `payload_len` bytes of payload.
pub fn put_ipv4_header(buf: &mut BytesMut, src: Ipv4Addr, dst: Ipv4Addr,
                       protocol: u8, payload_len: usize) {
    let start = buf.len();
    buf.put_u8(0x45);  // version 4, 5 words
    buf.put_u8(0);  // tos
    buf.put_u16((IPV4_HEADER_LEN + payload_len) as u16);
    buf.put_u16(rand::random());  // identification
    buf.put_u16(IPV4_FLAG_DF);
    buf.put_u8(IP_TTL);
    buf.put_u8(protocol);
    buf.put_u16(0);  // checksum, patched below
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());

    let sum = checksum(&[&buf[start..]]);
    buf[start + 10..start + 12].copy_from_slice(&sum.to_be_bytes());
}

/// Append an IPv6 header for `payload_len` bytes of payload. There is no header checksum.
pub fn put_ipv6_header(buf: &mut BytesMut, src: Ipv6Addr, dst: Ipv6Addr,
                       next_header: u8, payload_len: usize) {
    buf.put_u32(6 << 28);  // version 6, traffic class 0, flow label 0
    buf.put_u16(payload_len as u16);
    buf.put_u8(next_header);
    buf.put_u8(IP_TTL);  // hop limit
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());
}

pub fn put_ip_header(buf: &mut BytesMut, src: IpAddr, dst: IpAddr,
                     protocol: u8, payload_len: usize) -> Result<()> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => put_ipv4_header(buf, src, dst, protocol, payload_len),
        (IpAddr::V6(src), IpAddr::V6(dst)) => put_ipv6_header(buf, src, dst, protocol, payload_len),
        _ => return Err(Error::FamilyMismatch(src, dst)),
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpHeader {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub header_len: usize,
    pub total_len: usize,
}

/// Parse the IPv4 or IPv6 header at the start of `buf`, by its version nibble.
pub fn parse_ip_header(buf: &[u8]) -> Result<IpHeader> {
    ensure_len(buf, 1)?;
    match buf[0] >> 4 {
        4 => {
            ensure_len(buf, IPV4_HEADER_LEN)?;
            let header_len = ((buf[0] & 0x0f) as usize) * 4;
            ensure_len(buf, usize::max(header_len, IPV4_HEADER_LEN))?;
            let src: [u8; 4] = buf[12..16].try_into().unwrap();
            let dst: [u8; 4] = buf[16..20].try_into().unwrap();
            Ok(IpHeader {
                src: IpAddr::from(src),
                dst: IpAddr::from(dst),
                protocol: buf[9],
                header_len,
                total_len: u16::from_be_bytes([buf[2], buf[3]]) as usize,
            })
        }
        6 => {
            ensure_len(buf, IPV6_HEADER_LEN)?;
            let src: [u8; 16] = buf[8..24].try_into().unwrap();
            let dst: [u8; 16] = buf[24..40].try_into().unwrap();
            Ok(IpHeader {
                src: IpAddr::from(src),
                dst: IpAddr::from(dst),
                protocol: buf[6],
                header_len: IPV6_HEADER_LEN,
                total_len: IPV6_HEADER_LEN + u16::from_be_bytes([buf[4], buf[5]]) as usize,
            })
        }
        v => Err(Error::UnknownIpVersion(v)),
    }
}

/// Raw IPv4 sockets deliver the IP header in front of the payload, IPv6 ones do not.
pub fn strip_ip_header(family: Family, buf: &[u8]) -> Result<&[u8]> {
    match family {
        Family::V4 => {
            let header = parse_ip_header(buf)?;
            Ok(&buf[header.header_len..])
        }
        Family::V6 => Ok(buf),
    }
}
