use std::time::Duration;

// RFC 791: every IPv4 host must accept 68 byte datagrams.
pub const MIN_IPV4_MTU: u32 = 68;
// RFC 8200 (and RFC 1885 before it)
pub const MIN_IPV6_MTU: u32 = 1280;

pub const DEFAULT_PHYSICAL_LINK_MTU: u32 = 1500;
pub const DEFAULT_PER_TRY_TIMEOUT: Duration = Duration::from_secs(1);

// Largest jumbo frame we are willing to probe.
pub const MAX_PROBE_MTU: u32 = 9216;

// IPv4 header = 20, TCP header with MSS option = 24
static_assertions::const_assert!(MIN_IPV4_MTU >= 20 + 24);
static_assertions::const_assert!(DEFAULT_PHYSICAL_LINK_MTU <= MAX_PROBE_MTU);

/// Receive buffer, large enough for any packet we could be sent back.
pub const BUF_CAPACITY: usize = 65536;

static_assertions::const_assert!(MAX_PROBE_MTU as usize <= BUF_CAPACITY);

/// Sleep between two non-blocking receive attempts on a raw socket.
pub const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Default packet mark set on our raw sockets. Firewall rules that suppress the
/// kernel's RSTs exclude packets carrying it, so our own RSTs still go out.
pub const DEFAULT_PROBE_FWMARK: u32 = 0x1e7e;

pub const TCP_WINDOW_SIZE: u16 = 0xffff;
pub const IP_TTL: u8 = 64;
