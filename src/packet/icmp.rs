use bytes::{BufMut, BytesMut};
use rand::RngCore;

use crate::error::Result;
use super::checksum::checksum;
use super::ensure_len;
use super::ip::{parse_ip_header, Family, IPV6_HEADER_LEN};

pub const ICMP_HEADER_LEN: usize = 8;

pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_DEST_UNREACHABLE: u8 = 3;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV4_FRAGMENTATION_NEEDED: u8 = 4;  // code of DEST_UNREACHABLE
// RFC 1812: net/host prohibited (9, 10) and communication prohibited (13)
const ICMPV4_PROHIBITED_CODES: [u8; 3] = [9, 10, 13];

pub const ICMPV6_DEST_UNREACHABLE: u8 = 1;
pub const ICMPV6_PACKET_TOO_BIG: u8 = 2;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;
pub const ICMPV6_ADMIN_PROHIBITED: u8 = 1;  // code of DEST_UNREACHABLE

pub fn echo_request_type(family: Family) -> u8 {
    match family {
        Family::V4 => ICMPV4_ECHO_REQUEST,
        Family::V6 => ICMPV6_ECHO_REQUEST,
    }
}

pub fn echo_reply_type(family: Family) -> u8 {
    match family {
        Family::V4 => ICMPV4_ECHO_REPLY,
        Family::V6 => ICMPV6_ECHO_REPLY,
    }
}

pub fn is_prohibited(family: Family, code: u8) -> bool {
    match family {
        Family::V4 => ICMPV4_PROHIBITED_CODES.contains(&code),
        Family::V6 => code == ICMPV6_ADMIN_PROHIBITED,
    }
}

/// An ICMP message: type, code, the 4 header bytes after the checksum, then `body`.
///
/// ICMPv4 is checksummed here. ICMPv6 needs the pseudo header and is left for the
/// kernel to fill, which raw ICMPv6 sockets always do.
pub fn build_icmp_message(family: Family, kind: u8, code: u8, rest: u32, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(ICMP_HEADER_LEN + body.len());
    buf.put_u8(kind);
    buf.put_u8(code);
    buf.put_u16(0);  // checksum
    buf.put_u32(rest);
    buf.put_slice(body);

    if family == Family::V4 {
        let sum = checksum(&[&buf]);
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    buf
}

pub fn build_echo_request(family: Family, id: u16, seq: u16, data: &[u8]) -> BytesMut {
    build_icmp_message(family, echo_request_type(family), 0,
                       ((id as u32) << 16) | seq as u32, data)
}

/// Echo request with random data, `mtu` bytes long once the kernel adds the IP header.
pub fn build_echo_probe(family: Family, id: u16, mtu: u32) -> Result<BytesMut> {
    let overhead = family.header_len() + ICMP_HEADER_LEN;
    let data_len = (mtu as usize).checked_sub(overhead)
        .ok_or(crate::error::Error::MtuTooSmall { mtu, overhead })?;
    let mut data = vec![0u8; data_len];
    rand::thread_rng().fill_bytes(&mut data);
    Ok(build_echo_request(family, id, 0, &data))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcmpMessage<'a> {
    EchoRequest { id: u16, seq: u16, data: &'a [u8] },
    EchoReply { id: u16, seq: u16, data: &'a [u8] },
    /// IPv4 destination unreachable, code 4 (RFC 1191)
    FragmentationNeeded { next_hop_mtu: u16, original: &'a [u8] },
    /// RFC 1885
    PacketTooBig { mtu: u32, original: &'a [u8] },
    DestinationUnreachable { code: u8, original: &'a [u8] },
    Other { kind: u8, code: u8 },
}

/// Parse an ICMP message with the IP header already stripped.
pub fn parse_icmp(family: Family, buf: &[u8]) -> Result<IcmpMessage<'_>> {
    ensure_len(buf, ICMP_HEADER_LEN)?;
    let (kind, code) = (buf[0], buf[1]);
    let id = u16::from_be_bytes([buf[4], buf[5]]);
    let seq = u16::from_be_bytes([buf[6], buf[7]]);
    let body = &buf[ICMP_HEADER_LEN..];

    let msg = match (family, kind) {
        (_, k) if k == echo_request_type(family) => IcmpMessage::EchoRequest { id, seq, data: body },
        (_, k) if k == echo_reply_type(family) => IcmpMessage::EchoReply { id, seq, data: body },
        (Family::V4, ICMPV4_DEST_UNREACHABLE) if code == ICMPV4_FRAGMENTATION_NEEDED => {
            // bytes 6-7 of the header
            IcmpMessage::FragmentationNeeded { next_hop_mtu: seq, original: body }
        }
        (Family::V4, ICMPV4_DEST_UNREACHABLE) | (Family::V6, ICMPV6_DEST_UNREACHABLE) => {
            IcmpMessage::DestinationUnreachable { code, original: body }
        }
        (Family::V6, ICMPV6_PACKET_TOO_BIG) => IcmpMessage::PacketTooBig {
            mtu: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            original: body,
        },
        _ => IcmpMessage::Other { kind, code },
    };
    Ok(msg)
}

/// Identifier and (possibly truncated) data of the echo request quoted in an ICMP error.
pub fn quoted_echo_request(family: Family, original: &[u8]) -> Option<(u16, &[u8])> {
    let header_len = match family {
        Family::V4 => parse_ip_header(original).ok()?.header_len,
        Family::V6 => IPV6_HEADER_LEN,
    };
    let inner = original.get(header_len..)?;
    match parse_icmp(family, inner).ok()? {
        IcmpMessage::EchoRequest { id, data, .. } => Some((id, data)),
        _ => None,
    }
}
