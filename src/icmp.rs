// Path MTU discovery with ICMP echo requests.
//
// One echo at the ceiling size usually settles it: either it comes back, or a
// router on the way reports the MTU of its next hop. When nobody reports, the
// search falls back to rounds of echoes of different sizes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, trace, warn};

use crate::constants::{BUF_CAPACITY, POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::packet::icmp::{build_echo_probe, is_prohibited, parse_icmp, quoted_echo_request, IcmpMessage,
                          ICMP_HEADER_LEN};
use crate::packet::ip::strip_ip_header;
use crate::packet::Family;
use crate::rawsock::{is_msg_size_error, RawTransport};
use crate::search::{search, Timing};

/// Echo request in flight.
struct Echo {
    id: u16,
    probe: BytesMut,
}

impl Echo {
    fn data(&self) -> &[u8] {
        &self.probe[ICMP_HEADER_LEN..]
    }

    /// The ICMP error quotes this request. Routers may cut the quote short.
    fn is_quoted_in(&self, family: Family, original: &[u8]) -> bool {
        match quoted_echo_request(family, original) {
            Some((id, data)) => id == self.id && self.data().starts_with(data),
            None => false,
        }
    }
}

/// Outcome of the single echo at the ceiling.
enum Direct {
    Mtu(u32),
    Inconclusive,
    Prohibited,
}

pub struct IcmpProber {
    transport: Arc<dyn RawTransport>,
    family: Family,
}

impl IcmpProber {
    /// `transport` must be a raw ICMP (or ICMPv6) socket.
    pub fn new(transport: Arc<dyn RawTransport>) -> IcmpProber {
        let family = transport.family();
        IcmpProber { transport, family }
    }

    /// Largest MTU up to `ceiling` an echo to `dst` gets through with.
    pub fn discover(&self, dst: IpAddr, ceiling: u32, timing: Timing) -> Result<u32> {
        let min_mtu = self.family.min_mtu();
        if ceiling < min_mtu {
            return Err(Error::InvalidRange { min: min_mtu, max: ceiling });
        }
        let prohibited = match self.probe_direct(dst, ceiling, timing)? {
            Direct::Mtu(mtu) => return Ok(mtu),
            Direct::Inconclusive => false,
            Direct::Prohibited => true,
        };
        debug!("No MTU signal from {dst}, searching [{min_mtu}, {ceiling}]");
        match search(min_mtu, ceiling, &mut |mtus: &[u32]| self.echo_round(dst, mtus, timing)) {
            Err(Error::MtuNotFound) if prohibited => Err(Error::AdministrativelyProhibited),
            result => result,
        }
    }

    /// Length of the next packet in `buf`, None once `deadline` passed.
    fn recv_until(&self, buf: &mut [u8], deadline: Instant) -> Result<Option<usize>> {
        while Instant::now() < deadline {
            match self.transport.try_recv(buf)? {
                Some(len) => return Ok(Some(len)),
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }
        Ok(None)
    }

    /// Send one echo at `ceiling`. Anything but `Direct::Mtu` leaves it to the search.
    fn probe_direct(&self, dst: IpAddr, ceiling: u32, timing: Timing) -> Result<Direct> {
        let family = self.family;
        let deadline = timing.round_deadline()?;
        let id = rand::random();
        let echo = Echo { id, probe: build_echo_probe(family, id, ceiling)? };

        match self.transport.send_to(&echo.probe, dst) {
            Err(e) if is_msg_size_error(&e) => {
                debug!("Echo of {ceiling} bytes does not fit the local link");
                return Ok(Direct::Inconclusive);
            }
            r => r?,
        }

        let mut buf = vec![0u8; BUF_CAPACITY];
        while let Some(len) = self.recv_until(&mut buf, deadline)? {
            let Ok(pkt) = strip_ip_header(family, &buf[..len]) else {
                continue;
            };
            let msg = match parse_icmp(family, pkt) {
                Ok(msg) => msg,
                Err(e) => {
                    trace!("Ignoring ICMP packet: {e}");
                    continue;
                }
            };
            let reported = match msg {
                IcmpMessage::EchoReply { id, data, .. } if id == echo.id && data == echo.data() => {
                    debug!("Echo of {ceiling} bytes to {dst} came back");
                    return Ok(Direct::Mtu(ceiling));
                }
                IcmpMessage::FragmentationNeeded { next_hop_mtu, original } if echo.is_quoted_in(family, original) => {
                    next_hop_mtu as u32
                }
                IcmpMessage::PacketTooBig { mtu, original } if echo.is_quoted_in(family, original) => mtu,
                IcmpMessage::DestinationUnreachable { code, original } if echo.is_quoted_in(family, original) => {
                    if is_prohibited(family, code) {
                        debug!("{dst} is administratively prohibited (code {code})");
                        return Ok(Direct::Prohibited);
                    }
                    return Err(Error::DestinationUnreachable(code));
                }
                _ => continue,
            };
            if (family.min_mtu()..=ceiling).contains(&reported) {
                debug!("Path to {dst} reports MTU {reported}");
                return Ok(Direct::Mtu(reported));
            }
            debug!("Ignoring implausible MTU {reported} reported for {dst}");
            return Ok(Direct::Inconclusive);
        }
        debug!("Echo of {ceiling} bytes to {dst} timed out");
        Ok(Direct::Inconclusive)
    }

    /// One echo per candidate, all in flight at once, told apart by identifier.
    fn echo_round(&self, dst: IpAddr, mtus: &[u32], timing: Timing) -> Result<Vec<bool>> {
        let family = self.family;
        let deadline = timing.round_deadline()?;
        let mut ok = vec![false; mtus.len()];
        let mut pending: HashMap<u16, (usize, Echo)> = HashMap::new();

        for (idx, &mtu) in mtus.iter().enumerate() {
            let id = loop {
                let id = rand::random();
                if !pending.contains_key(&id) {
                    break id;
                }
            };
            let probe = match build_echo_probe(family, id, mtu) {
                Ok(probe) => probe,
                Err(e) => {
                    warn!("Cannot probe {dst} with mtu {mtu}: {e}");
                    continue;
                }
            };
            match self.transport.send_to(&probe, dst) {
                Ok(()) => {
                    pending.insert(id, (idx, Echo { id, probe }));
                }
                Err(e) if is_msg_size_error(&e) => trace!("Echo of {mtu} bytes does not fit the local link"),
                Err(e) => warn!("Failed to send echo of {mtu} bytes to {dst}: {e}"),
            }
        }

        let mut buf = vec![0u8; BUF_CAPACITY];
        while !pending.is_empty() {
            let len = match self.recv_until(&mut buf, deadline) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    warn!("ICMP receive error: {e}");
                    break;
                }
            };
            let Ok(pkt) = strip_ip_header(family, &buf[..len]) else {
                continue;
            };
            if let Ok(IcmpMessage::EchoReply { id, data, .. }) = parse_icmp(family, pkt) {
                if pending.get(&id).is_some_and(|(_, echo)| echo.data() == data) {
                    if let Some((idx, _)) = pending.remove(&id) {
                        ok[idx] = true;
                    }
                }
            }
        }
        trace!("Echo round {mtus:?} -> {ok:?}");
        timing.check_round(ok)
    }
}
