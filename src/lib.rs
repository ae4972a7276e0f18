pub mod constants;
pub mod discover;
pub mod error;
pub mod firewall;
pub mod icmp;
pub mod net;
pub mod packet;
pub mod rawsock;
pub mod route;
pub mod search;
pub mod tcp;

#[cfg(test)]
mod testing;

pub use discover::{path_mtu_discover, DiscoverOptions, Discoverer};
pub use error::{Error, Result};
