// Path MTU discovery with fake TCP handshakes over a raw socket.
//
// Every candidate MTU gets its own handshake from its own local port. The SYN
// is small; the ACK completing the handshake carries a payload sized to the
// candidate. A peer that acknowledges it (or resets after seeing it) proves
// the packet fit through the path.

pub mod probe;
pub mod tracker;

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, warn};

use crate::error::Result;
use crate::firewall::Firewall;
use crate::net::Network;
use crate::rawsock::RawTransport;
use crate::search::{search, Timing};
use probe::{probe_mtu, ProbeContext};
use tracker::Tracker;

pub struct TcpProber<'a> {
    network: &'a dyn Network,
    firewall: &'a dyn Firewall,
    transport: Arc<dyn RawTransport>,
    tracker: Tracker,
    fwmark: u32,
}

impl<'a> TcpProber<'a> {
    /// `transport` must be a raw TCP socket expecting complete IP packets.
    pub fn new(network: &'a dyn Network, firewall: &'a dyn Firewall,
               transport: Arc<dyn RawTransport>, fwmark: u32) -> TcpProber<'a> {
        let tracker = Tracker::start(transport.clone());
        TcpProber {
            network,
            firewall,
            transport,
            tracker,
            fwmark,
        }
    }

    /// Largest MTU in `[min_mtu, max_mtu]` a handshake with `dst` gets through.
    pub fn discover(&self, dst: SocketAddr, min_mtu: u32, max_mtu: u32, timing: Timing) -> Result<u32> {
        let src_ip = self.network.source_addr(dst.ip())?;
        let ctx = ProbeContext {
            transport: self.transport.as_ref(),
            tracker: &self.tracker,
            network: self.network,
            firewall: self.firewall,
            fwmark: self.fwmark,
            src_ip,
            dst,
            min_mtu,
        };
        debug!("TCP discovery {src_ip} -> {dst} in [{min_mtu}, {max_mtu}]");
        search(min_mtu, max_mtu, &mut |mtus: &[u32]| run_round(&ctx, mtus, timing))
    }
}

/// Probe all `mtus` in parallel. Whatever has not finished by the round's
/// deadline, or got a reply making no sense, counts as rejected. Local
/// failures (port, firewall, socket) end the round with an error once every
/// probe has returned.
fn run_round(ctx: &ProbeContext, mtus: &[u32], timing: Timing) -> Result<Vec<bool>> {
    let deadline = timing.round_deadline()?;
    let outcomes = std::thread::scope(|s| {
        let handles: Vec<_> = mtus.iter()
            .map(|&mtu| s.spawn(move || probe_mtu(ctx, mtu, deadline)))
            .collect();
        handles.into_iter().zip(mtus)
            .map(|(handle, mtu)| match handle.join() {
                Ok(Err(e)) if e.is_protocol_error() => {
                    warn!("TCP probe of {} with mtu {mtu} failed: {e}", ctx.dst);
                    Ok(false)
                }
                Ok(result) => result,
                Err(_) => {
                    warn!("TCP probe of {} with mtu {mtu} panicked", ctx.dst);
                    Ok(false)
                }
            })
            .collect::<Vec<Result<bool>>>()
    });
    let ok = outcomes.into_iter().collect::<Result<Vec<bool>>>()?;
    timing.check_round(ok)
}
