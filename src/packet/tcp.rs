use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};

use crate::constants::TCP_WINDOW_SIZE;
use crate::error::{Error, Result};
use super::checksum::{ones_complement_add_by_16bit, pseudo_header_sum};
use super::ensure_len;
use super::ip::{put_ip_header, Family, PROTO_TCP};

pub const TCP_HEADER_LEN: usize = 20;
pub const MSS_OPTION_LEN: usize = 4;

pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;

const TCP_OPTION_END: u8 = 0;
const TCP_OPTION_NOP: u8 = 1;
const TCP_OPTION_MSS: u8 = 2;

/// The only flag combinations a probe ever expects to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpKind {
    Syn,
    SynAck,
    Ack,
    Rst,
    RstAck,
}

impl TcpKind {
    pub fn from_flags(flags: u8) -> Result<TcpKind> {
        // PSH and friends do not change what a segment means to us
        match flags & (TCP_FLAG_SYN | TCP_FLAG_RST | TCP_FLAG_ACK) {
            TCP_FLAG_SYN => Ok(TcpKind::Syn),
            x if x == TCP_FLAG_SYN | TCP_FLAG_ACK => Ok(TcpKind::SynAck),
            TCP_FLAG_ACK => Ok(TcpKind::Ack),
            TCP_FLAG_RST => Ok(TcpKind::Rst),
            x if x == TCP_FLAG_RST | TCP_FLAG_ACK => Ok(TcpKind::RstAck),
            _ => Err(Error::UnknownTcpType(flags)),
        }
    }

    pub fn flags(self) -> u8 {
        match self {
            TcpKind::Syn => TCP_FLAG_SYN,
            TcpKind::SynAck => TCP_FLAG_SYN | TCP_FLAG_ACK,
            TcpKind::Ack => TCP_FLAG_ACK,
            TcpKind::Rst => TCP_FLAG_RST,
            TcpKind::RstAck => TCP_FLAG_RST | TCP_FLAG_ACK,
        }
    }

    pub fn is_rst(self) -> bool {
        matches!(self, TcpKind::Rst | TcpKind::RstAck)
    }
}

/// Header fields of a segment we are about to send.
#[derive(Debug, Clone)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub mss: Option<u16>,
}

impl TcpHeader {
    pub fn header_len(&self) -> usize {
        TCP_HEADER_LEN + if self.mss.is_some() { MSS_OPTION_LEN } else { 0 }
    }

    /// Append header and a zero-filled payload of `payload_len` bytes, checksummed
    /// over the pseudo header of `src` -> `dst`.
    pub fn put(&self, buf: &mut BytesMut, src: SocketAddr, dst: SocketAddr, payload_len: usize) {
        let start = buf.len();
        let segment_len = self.header_len() + payload_len;

        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(((self.header_len() / 4) as u8) << 4);  // data offset shift 4
        buf.put_u8(self.flags);
        buf.put_u16(TCP_WINDOW_SIZE);
        buf.put_u16(0);  // checksum, patched below
        buf.put_u16(0);  // urgent pointer
        if let Some(mss) = self.mss {
            buf.put_u8(TCP_OPTION_MSS);
            buf.put_u8(MSS_OPTION_LEN as u8);
            buf.put_u16(mss);
        }
        buf.put_bytes(0, payload_len);

        let sum = pseudo_header_sum(src.ip(), dst.ip(), PROTO_TCP, segment_len);
        let sum = !ones_complement_add_by_16bit(&buf[start..], sum);
        buf[start + 16..start + 18].copy_from_slice(&sum.to_be_bytes());
    }
}

/// A complete IP packet carrying `header` and `payload_len` zero bytes.
pub fn build_tcp_packet(src: SocketAddr, dst: SocketAddr,
                        header: &TcpHeader, payload_len: usize) -> Result<BytesMut> {
    let family = Family::of(src.ip());
    let segment_len = header.header_len() + payload_len;
    let mut buf = BytesMut::with_capacity(family.header_len() + segment_len);
    put_ip_header(&mut buf, src.ip(), dst.ip(), PROTO_TCP, segment_len)?;
    header.put(&mut buf, src, dst, payload_len);
    Ok(buf)
}

/// Payload length that makes a segment with a `header_len` byte header exactly `mtu` long on the wire.
pub fn payload_len_for_mtu(family: Family, mtu: u32, header_len: usize) -> Result<usize> {
    let overhead = family.header_len() + header_len;
    (mtu as usize).checked_sub(overhead).ok_or(Error::MtuTooSmall { mtu, overhead })
}

/// MSS we advertise when probing `mtu`.
pub fn mss_for_mtu(family: Family, mtu: u32) -> u16 {
    let mss = (mtu as usize).saturating_sub(family.header_len() + TCP_HEADER_LEN);
    u16::try_from(mss).unwrap_or(u16::MAX)
}

/// Parsed view of a received segment (IP header already stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpView {
    pub kind: TcpKind,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub mss: Option<u16>,
    pub payload_len: usize,
}

/// Source and destination port, readable even when the rest of the segment is not.
pub fn parse_ports(buf: &[u8]) -> Result<(u16, u16)> {
    ensure_len(buf, 4)?;
    Ok((u16::from_be_bytes([buf[0], buf[1]]), u16::from_be_bytes([buf[2], buf[3]])))
}

pub fn parse_tcp(buf: &[u8]) -> Result<TcpView> {
    ensure_len(buf, TCP_HEADER_LEN)?;
    let (src_port, dst_port) = parse_ports(buf)?;
    let header_len = ((buf[12] >> 4) as usize) * 4;
    ensure_len(buf, usize::max(header_len, TCP_HEADER_LEN))?;
    let kind = TcpKind::from_flags(buf[13])?;

    Ok(TcpView {
        kind,
        src_port,
        dst_port,
        seq: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
        ack: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        mss: parse_mss_option(&buf[TCP_HEADER_LEN..usize::max(header_len, TCP_HEADER_LEN)]),
        payload_len: buf.len() - usize::max(header_len, TCP_HEADER_LEN),
    })
}

fn parse_mss_option(mut options: &[u8]) -> Option<u16> {
    while let Some(&kind) = options.first() {
        match kind {
            TCP_OPTION_END => return None,
            TCP_OPTION_NOP => options = &options[1..],
            _ => {
                let len = *options.get(1)? as usize;
                if len < 2 || len > options.len() {
                    return None;
                }
                if kind == TCP_OPTION_MSS && len == MSS_OPTION_LEN {
                    return Some(u16::from_be_bytes([options[2], options[3]]));
                }
                options = &options[len..];
            }
        }
    }
    None
}
