// Just enough IPv4/IPv6, TCP and ICMP to probe a path from a raw socket.
// No IP options, no fragmentation, the only TCP option is MSS.

pub mod checksum;
pub mod icmp;
pub mod ip;
pub mod tcp;

pub use ip::Family;

use crate::error::{Error, Result};

fn ensure_len(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        return Err(Error::TooShort { need, got: buf.len() });
    }
    Ok(())
}
