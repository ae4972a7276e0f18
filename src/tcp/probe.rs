use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use log::{debug, trace};
use rand::Rng;

use crate::error::{Error, Result};
use crate::firewall::{Firewall, RstSuppression};
use crate::net::Network;
use crate::packet::tcp::{build_tcp_packet, mss_for_mtu, payload_len_for_mtu, TcpHeader, TcpKind, TcpView,
                         MSS_OPTION_LEN, TCP_FLAG_ACK, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_FLAG_SYN, TCP_HEADER_LEN};
use crate::packet::Family;
use crate::rawsock::{is_msg_size_error, RawTransport};
use super::tracker::{PortPair, Tracker};

/// Everything one probe shares with the other probes of its round.
pub struct ProbeContext<'a> {
    pub transport: &'a dyn RawTransport,
    pub tracker: &'a Tracker,
    pub network: &'a dyn Network,
    pub firewall: &'a dyn Firewall,
    pub fwmark: u32,
    pub src_ip: IpAddr,
    pub dst: SocketAddr,
    /// floor of the whole search, bounds how far an MSS may shrink our payload
    pub min_mtu: u32,
}

// Our side of the fake connection. Sequence numbers are the next ones we
// would use; `ack` is what we acknowledged of the peer.
#[derive(Debug)]
enum State {
    SynSent { seq: u32 },
    /// The port is closed, a SYN carrying the payload went out instead.
    SynWithPayloadSent { seq: u32 },
    Established { seq: u32, ack: u32 },
    Done(bool),
}

struct Connection<'a> {
    transport: &'a dyn RawTransport,
    src: SocketAddr,
    dst: SocketAddr,
    family: Family,
    mtu: u32,
    min_mtu: u32,
}

impl Connection<'_> {
    fn send(&self, flags: u8, seq: u32, ack: u32, mss: Option<u16>, payload_len: usize) -> Result<()> {
        let header = TcpHeader {
            src_port: self.src.port(),
            dst_port: self.dst.port(),
            seq,
            ack,
            flags,
            mss,
        };
        let pkt = build_tcp_packet(self.src, self.dst, &header, payload_len)?;
        trace!("{} -> {}: flags {flags:#04x} seq {seq} ack {ack} len {}", self.src, self.dst, pkt.len());
        self.transport.send_to(&pkt, self.dst.ip())?;
        Ok(())
    }

    fn send_syn(&self, with_payload: bool) -> Result<u32> {
        // 0 to half, do not want to handle overflow
        let seq = rand::thread_rng().gen_range(0..(u32::MAX / 2));
        let payload_len = if with_payload {
            payload_len_for_mtu(self.family, self.mtu, TCP_HEADER_LEN + MSS_OPTION_LEN)?
        } else {
            0
        };
        self.send(TCP_FLAG_SYN, seq, 0, Some(mss_for_mtu(self.family, self.mtu)), payload_len)?;
        Ok(seq)
    }

    /// Payload of the handshake-completing ACK: sized to the MTU, unless the
    /// peer cannot take that much in one segment.
    fn ack_payload_len(&self, peer_mss: Option<u16>) -> Result<usize> {
        let payload_len = payload_len_for_mtu(self.family, self.mtu, TCP_HEADER_LEN)?;
        match peer_mss {
            Some(mss) if (mss as usize) < payload_len => {
                let reduction = usize::min(payload_len - mss as usize, (self.mtu - self.min_mtu) as usize);
                debug!("Peer {} advertises MSS {mss}, sending {} bytes for mtu {}",
                       self.dst, payload_len - reduction, self.mtu);
                Ok(payload_len - reduction)
            }
            _ => Ok(payload_len),
        }
    }

    fn advance(&self, state: &State, reply: TcpView) -> Result<State> {
        let next = match (state, reply.kind) {
            (State::SynSent { .. }, kind) if kind.is_rst() => {
                debug!("{} refused the connection, retrying with payload in the SYN", self.dst);
                State::SynWithPayloadSent { seq: self.send_syn(true)? }
            }
            (State::SynSent { seq }, TcpKind::SynAck) if reply.ack == seq.wrapping_add(1) => {
                let seq = seq.wrapping_add(1);
                let ack = reply.seq.wrapping_add(1);
                let payload_len = self.ack_payload_len(reply.mss)?;
                self.send(TCP_FLAG_ACK | TCP_FLAG_PSH, seq, ack, None, payload_len)?;
                State::Established { seq: seq.wrapping_add(payload_len as u32), ack }
            }
            (State::SynSent { .. }, kind) => {
                return Err(Error::UnexpectedPacket { kind, state: "waiting for SYN-ACK" });
            }
            (State::SynWithPayloadSent { .. }, kind) if kind.is_rst() => State::Done(true),
            (State::SynWithPayloadSent { .. }, kind) => {
                return Err(Error::UnexpectedPacket { kind, state: "waiting for RST" });
            }
            (State::Established { seq, ack }, TcpKind::Ack) => {
                self.send(TCP_FLAG_RST | TCP_FLAG_ACK, *seq, *ack, None, 0)?;
                State::Done(true)
            }
            (State::Established { .. }, kind) if kind.is_rst() => State::Done(true),
            (State::Established { seq, ack }, TcpKind::SynAck) => {
                // the peer never saw our ACK and retransmits
                debug!("Packet of {} bytes to {} lost", self.mtu, self.dst);
                self.send(TCP_FLAG_RST | TCP_FLAG_ACK, *seq, *ack, None, 0)?;
                State::Done(false)
            }
            (State::Established { .. }, kind) => return Err(Error::UnexpectedFinalPacket(kind)),
            (State::Done(ok), _) => State::Done(*ok),
        };
        Ok(next)
    }

    /// Best effort RST so the peer can drop whatever state we left it with.
    fn abort(&self, state: &State) {
        let result = match state {
            State::SynSent { seq } | State::SynWithPayloadSent { seq } => {
                self.send(TCP_FLAG_RST, seq.wrapping_add(1), 0, None, 0)
            }
            State::Established { seq, ack } => self.send(TCP_FLAG_RST | TCP_FLAG_ACK, *seq, *ack, None, 0),
            State::Done(_) => Ok(()),
        };
        if let Err(e) = result {
            trace!("Failed to reset {} -> {}: {e}", self.src, self.dst);
        }
    }
}

/// One fake TCP handshake to `ctx.dst` carrying `mtu` bytes.
///
/// `Ok(false)` means the packet did not make it (timeout or lost). Errors are
/// replies that make no sense, or local failures setting the probe up.
pub fn probe_mtu(ctx: &ProbeContext, mtu: u32, deadline: Instant) -> Result<bool> {
    let family = Family::of(ctx.dst.ip());
    payload_len_for_mtu(family, mtu, TCP_HEADER_LEN + MSS_OPTION_LEN)?;

    let reserved = ctx.network.reserve_port(ctx.src_ip)?;
    let src = SocketAddr::new(ctx.src_ip, reserved.port());
    // dropped in reverse order: unregister, restore RSTs, release the port
    let _suppression = RstSuppression::install(ctx.firewall, src, ctx.dst, ctx.fwmark)?;
    let registration = ctx.tracker.register(PortPair { local: src.port(), remote: ctx.dst.port() })?;

    let conn = Connection {
        transport: ctx.transport,
        src,
        dst: ctx.dst,
        family,
        mtu,
        min_mtu: ctx.min_mtu,
    };

    let mut state = match conn.send_syn(false) {
        Ok(seq) => State::SynSent { seq },
        Err(Error::Io(e)) if is_msg_size_error(&e) => return Ok(false),
        Err(e) => return Err(e),
    };
    loop {
        if let State::Done(ok) = state {
            return Ok(ok);
        }
        let next = match registration.recv_until(deadline) {
            None => {
                trace!("Probe {src} -> {} for mtu {mtu} timed out in {state:?}", ctx.dst);
                conn.abort(&state);
                return Ok(false);
            }
            Some(reply) => reply.and_then(|reply| conn.advance(&state, reply)),
        };
        state = match next {
            Ok(next) => next,
            // the local link cannot carry it
            Err(Error::Io(e)) if is_msg_size_error(&e) => {
                conn.abort(&state);
                return Ok(false);
            }
            Err(e) => {
                conn.abort(&state);
                return Err(e);
            }
        };
    }
}
