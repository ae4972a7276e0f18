use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::time::Instant;

use log::{debug, trace, warn};

use crate::constants::{BUF_CAPACITY, POLL_INTERVAL};
use crate::error::{Error, Result};
use crate::packet::ip::strip_ip_header;
use crate::packet::tcp::{parse_ports, parse_tcp, TcpView};
use crate::packet::Family;
use crate::rawsock::RawTransport;

/// Identifies the fake connection a received segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl std::fmt::Display for PortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}

type Reply = Result<TcpView>;

struct TrackerState {
    // Unbounded senders: delivering to a probe that already gave up fails
    // immediately instead of blocking the receive loop.
    dispatch: RwLock<HashMap<PortPair, mpsc::Sender<Reply>>>,
    keep_running: AtomicBool,
}

impl TrackerState {
    fn run_recv_loop(&self, transport: &dyn RawTransport) {
        let family = transport.family();
        let mut buf = vec![0u8; BUF_CAPACITY];
        while self.keep_running.load(Ordering::SeqCst) {
            match transport.try_recv(&mut buf) {
                Ok(Some(len)) => self.dispatch_packet(family, &buf[..len]),
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    warn!("Raw TCP socket receive error: {e}");
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
        debug!("Tracker for {family} stopped");
    }

    fn dispatch_packet(&self, family: Family, pkt: &[u8]) {
        let Ok(segment) = strip_ip_header(family, pkt) else {
            trace!("Dropping packet without a valid IP header");
            return;
        };
        let Ok((remote, local)) = parse_ports(segment) else {
            return;
        };
        let key = PortPair { local, remote };

        let dispatch = self.dispatch.read().unwrap();
        if let Some(sender) = dispatch.get(&key) {
            if sender.send(parse_tcp(segment)).is_err() {
                trace!("Probe {key} is gone, dropping reply");
            }
        }
    }
}

/// Owns the receive side of a raw TCP socket and hands each segment to the
/// probe registered for its port pair. Segments for unknown pairs are dropped.
pub struct Tracker {
    state: Arc<TrackerState>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.state.keep_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Tracker receive loop panicked");
            }
        }
    }
}

impl Tracker {
    pub fn start(transport: Arc<dyn RawTransport>) -> Tracker {
        let state = Arc::new(TrackerState {
            dispatch: RwLock::new(HashMap::new()),
            keep_running: AtomicBool::new(true),
        });
        let thread = {
            let state = state.clone();
            std::thread::spawn(move || {
                state.run_recv_loop(transport.as_ref());
            })
        };
        Tracker {
            state,
            thread: Some(thread),
        }
    }

    /// Claim `key` until the returned registration is dropped.
    pub fn register(&self, key: PortPair) -> Result<Registration<'_>> {
        let (sender, receiver) = mpsc::channel();
        let mut dispatch = self.state.dispatch.write().unwrap();
        if dispatch.contains_key(&key) {
            return Err(Error::PortPairInUse(key));
        }
        dispatch.insert(key, sender);
        Ok(Registration {
            state: &self.state,
            key,
            replies: receiver,
        })
    }
}

pub struct Registration<'a> {
    state: &'a TrackerState,
    key: PortPair,
    replies: mpsc::Receiver<Reply>,
}

impl Registration<'_> {
    /// Next segment for our pair, or None once `deadline` has passed.
    pub fn recv_until(&self, deadline: Instant) -> Option<Reply> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        self.replies.recv_timeout(timeout).ok()
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.state.dispatch.write().unwrap().remove(&self.key);
    }
}
