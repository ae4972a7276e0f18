// A network in memory for the probers: packets sent through a simulated
// transport are answered right away according to a `PathModel`.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::firewall::{Firewall, Revert};
use crate::net::{Network, ReservedPort};
use crate::packet::icmp::{build_icmp_message, echo_reply_type, parse_icmp, IcmpMessage,
                          ICMPV4_DEST_UNREACHABLE, ICMPV4_FRAGMENTATION_NEEDED, ICMPV6_DEST_UNREACHABLE,
                          ICMPV6_PACKET_TOO_BIG};
use crate::packet::ip::{parse_ip_header, put_ip_header, PROTO_TCP};
use crate::packet::tcp::{parse_tcp, TcpHeader, TcpKind, TCP_FLAG_ACK, TCP_FLAG_RST, TCP_FLAG_SYN};
use crate::packet::Family;
use crate::rawsock::{RawProtocol, RawTransport};

pub const LOCAL_V4: [u8; 4] = [10, 0, 0, 1];
pub const LOCAL_V6: [u16; 8] = [0xfd00, 0, 0, 0, 0, 0, 0, 1];

const PEER_ISN: u32 = 0x0badcafe;
// how much of an offending packet an ICMP error quotes
const QUOTE_LEN: usize = 64;

#[derive(Debug, Clone, Copy)]
pub enum TcpPeer {
    /// Accepts connections, advertising `mss` in its SYN-ACK. Segments that
    /// do not fit the path vanish and the peer retransmits its SYN-ACK.
    Listening { mss: Option<u16> },
    /// Resets every SYN that reaches it.
    Closed,
    Silent,
    AnswersSynWithSyn,
    /// Answers SYNs with a SYN-ACK acknowledging the wrong sequence number.
    WrongAck,
    /// Completes the handshake, then answers the ACK with a fresh SYN.
    AnswersAckWithSyn,
}

#[derive(Debug, Clone, Copy)]
pub enum IcmpPeer {
    /// Echoes what fits, oversized requests vanish.
    Echo,
    /// Echoes what fits, a router reports the path MTU for the rest.
    Reporting,
    /// Every request is answered with destination unreachable with this code.
    Unreachable(u8),
    Silent,
}

#[derive(Debug, Clone, Copy)]
pub struct PathModel {
    pub path_mtu: u32,
    pub tcp: TcpPeer,
    pub icmp: IcmpPeer,
}

pub fn local_addr(family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::from(LOCAL_V4),
        Family::V6 => IpAddr::from(LOCAL_V6),
    }
}

pub struct SimulatedTransport {
    family: Family,
    // None: nothing answers, packets only arrive through `inject`
    peer: Option<(RawProtocol, PathModel)>,
    inbox: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl SimulatedTransport {
    pub fn queue(family: Family) -> SimulatedTransport {
        SimulatedTransport {
            family,
            peer: None,
            inbox: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn simulated(family: Family, protocol: RawProtocol, model: PathModel) -> SimulatedTransport {
        SimulatedTransport {
            peer: Some((protocol, model)),
            ..SimulatedTransport::queue(family)
        }
    }

    /// Queue a packet as the socket would deliver it.
    pub fn inject(&self, pkt: Vec<u8>) {
        self.inbox.lock().unwrap().push_back(pkt);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// What a raw socket of our family hands out for `payload` from `from`.
    fn frame(&self, from: IpAddr, protocol: u8, payload: &[u8]) -> Vec<u8> {
        match self.family {
            Family::V4 => {
                let mut buf = BytesMut::new();
                put_ip_header(&mut buf, from, local_addr(self.family), protocol, payload.len()).unwrap();
                buf.put_slice(payload);
                buf.to_vec()
            }
            Family::V6 => payload.to_vec(),
        }
    }

    fn answer_tcp(&self, model: &PathModel, pkt: &[u8]) -> Option<Vec<u8>> {
        let ip = parse_ip_header(pkt).ok()?;
        let view = parse_tcp(&pkt[ip.header_len..]).ok()?;
        let fits = pkt.len() as u32 <= model.path_mtu;
        let reply = |flags: u8, seq: u32, ack: u32, mss: Option<u16>| TcpHeader {
            src_port: view.dst_port,
            dst_port: view.src_port,
            seq,
            ack,
            flags,
            mss,
        };
        let received = view.payload_len as u32;

        let header = match (model.tcp, view.kind) {
            (TcpPeer::Silent, _) => return None,
            (_, kind) if kind.is_rst() => return None,
            (TcpPeer::AnswersSynWithSyn, TcpKind::Syn) => reply(TCP_FLAG_SYN, PEER_ISN, 0, None),
            (TcpPeer::WrongAck, TcpKind::Syn) => {
                reply(TCP_FLAG_SYN | TCP_FLAG_ACK, PEER_ISN, view.seq.wrapping_add(2), None)
            }
            (TcpPeer::AnswersAckWithSyn, TcpKind::Syn) => {
                reply(TCP_FLAG_SYN | TCP_FLAG_ACK, PEER_ISN, view.seq.wrapping_add(1), None)
            }
            (TcpPeer::AnswersAckWithSyn, TcpKind::Ack) => reply(TCP_FLAG_SYN, PEER_ISN, 0, None),
            (TcpPeer::Closed, TcpKind::Syn) if fits => {
                reply(TCP_FLAG_RST | TCP_FLAG_ACK, 0, view.seq.wrapping_add(1 + received), None)
            }
            (TcpPeer::Listening { mss }, TcpKind::Syn) if fits => {
                reply(TCP_FLAG_SYN | TCP_FLAG_ACK, PEER_ISN, view.seq.wrapping_add(1), mss)
            }
            (TcpPeer::Listening { .. }, TcpKind::Ack) if fits => {
                reply(TCP_FLAG_ACK, PEER_ISN.wrapping_add(1), view.seq.wrapping_add(received), None)
            }
            // lost on the way, the handshake never completed for the peer
            (TcpPeer::Listening { mss }, TcpKind::Ack) => {
                reply(TCP_FLAG_SYN | TCP_FLAG_ACK, PEER_ISN, view.seq, mss)
            }
            _ => return None,
        };

        let mut segment = BytesMut::new();
        header.put(&mut segment, SocketAddr::new(ip.dst, view.dst_port), SocketAddr::new(ip.src, view.src_port), 0);
        Some(self.frame(ip.dst, PROTO_TCP, &segment))
    }

    fn answer_icmp(&self, model: &PathModel, msg: &[u8], remote: IpAddr) -> Option<Vec<u8>> {
        let family = self.family;
        let (id, seq, data) = match parse_icmp(family, msg).ok()? {
            IcmpMessage::EchoRequest { id, seq, data } => (id, seq, data),
            _ => return None,
        };
        let fits = (msg.len() + family.header_len()) as u32 <= model.path_mtu;

        let mut quoted = BytesMut::new();
        put_ip_header(&mut quoted, local_addr(family), remote, family.icmp_protocol(), msg.len()).ok()?;
        quoted.put_slice(&msg[..usize::min(msg.len(), QUOTE_LEN)]);

        let reply = match model.icmp {
            IcmpPeer::Silent => return None,
            IcmpPeer::Unreachable(code) => {
                let kind = match family {
                    Family::V4 => ICMPV4_DEST_UNREACHABLE,
                    Family::V6 => ICMPV6_DEST_UNREACHABLE,
                };
                build_icmp_message(family, kind, code, 0, &quoted)
            }
            IcmpPeer::Echo | IcmpPeer::Reporting if fits => {
                build_icmp_message(family, echo_reply_type(family), 0, ((id as u32) << 16) | seq as u32, data)
            }
            IcmpPeer::Reporting => match family {
                Family::V4 => build_icmp_message(family, ICMPV4_DEST_UNREACHABLE, ICMPV4_FRAGMENTATION_NEEDED,
                                                 model.path_mtu & 0xffff, &quoted),
                Family::V6 => build_icmp_message(family, ICMPV6_PACKET_TOO_BIG, 0, model.path_mtu, &quoted),
            },
            IcmpPeer::Echo => return None,
        };
        Some(self.frame(remote, family.icmp_protocol(), &reply))
    }
}

impl RawTransport for SimulatedTransport {
    fn family(&self) -> Family {
        self.family
    }

    fn send_to(&self, pkt: &[u8], dst: IpAddr) -> io::Result<()> {
        self.sent.lock().unwrap().push(pkt.to_vec());
        let answer = match &self.peer {
            Some((RawProtocol::Tcp, model)) => self.answer_tcp(model, pkt),
            Some((RawProtocol::Icmp, model)) => self.answer_icmp(model, pkt, dst),
            None => None,
        };
        if let Some(answer) = answer {
            self.inject(answer);
        }
        Ok(())
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.inbox.lock().unwrap().pop_front() {
            Some(pkt) => {
                let len = usize::min(pkt.len(), buf.len());
                buf[..len].copy_from_slice(&pkt[..len]);
                Ok(Some(len))
            }
            None => Ok(None),
        }
    }
}

pub struct SimulatedNetwork {
    model: PathModel,
    privileged: bool,
    next_port: AtomicU16,
    transports: Mutex<Vec<(RawProtocol, Arc<SimulatedTransport>)>>,
}

impl SimulatedNetwork {
    pub fn new(model: PathModel) -> SimulatedNetwork {
        SimulatedNetwork {
            model,
            privileged: true,
            next_port: AtomicU16::new(40000),
            transports: Mutex::new(Vec::new()),
        }
    }

    /// A host where opening raw sockets is denied.
    pub fn unprivileged(model: PathModel) -> SimulatedNetwork {
        SimulatedNetwork {
            privileged: false,
            ..SimulatedNetwork::new(model)
        }
    }

    /// Everything sent so far on sockets of `protocol`.
    pub fn sent(&self, protocol: RawProtocol) -> Vec<Vec<u8>> {
        self.transports.lock().unwrap().iter()
            .filter(|(p, _)| *p == protocol)
            .flat_map(|(_, t)| t.sent())
            .collect()
    }
}

impl Network for SimulatedNetwork {
    fn open_raw(&self, family: Family, protocol: RawProtocol) -> Result<Arc<dyn RawTransport>> {
        if !self.privileged {
            return Err(Error::from_socket_error(io::Error::from_raw_os_error(nix::libc::EPERM)));
        }
        let transport = Arc::new(SimulatedTransport::simulated(family, protocol, self.model));
        self.transports.lock().unwrap().push((protocol, transport.clone()));
        Ok(transport)
    }

    fn source_addr(&self, dst: IpAddr) -> Result<IpAddr> {
        Ok(local_addr(Family::of(dst)))
    }

    fn reserve_port(&self, _src: IpAddr) -> Result<ReservedPort> {
        Ok(ReservedPort::unbacked(self.next_port.fetch_add(1, Ordering::SeqCst)))
    }
}

/// Counts suppressions, `active` drops back to zero once all are reverted.
#[derive(Default)]
pub struct CountingFirewall {
    pub installed: AtomicUsize,
    pub active: Arc<AtomicUsize>,
}

impl Firewall for CountingFirewall {
    fn temp_drop_output_tcp_rst(&self, _src: SocketAddr, _dst: SocketAddr,
                                _exclude_mark: u32) -> anyhow::Result<Revert> {
        self.installed.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = self.active.clone();
        Ok(Box::new(move || {
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }))
    }
}

/// A firewall whose tool is missing.
pub struct FailingFirewall;

impl Firewall for FailingFirewall {
    fn temp_drop_output_tcp_rst(&self, _src: SocketAddr, _dst: SocketAddr,
                                _exclude_mark: u32) -> anyhow::Result<Revert> {
        Err(anyhow::Error::new(io::Error::from(io::ErrorKind::NotFound)).context("cannot run iptables"))
    }
}
