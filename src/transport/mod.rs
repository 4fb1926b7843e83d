//! Transport Module
//!
//! Bottom layers of a stack. They stamp outgoing messages with the local
//! address, put them on the wire and pass received messages up.
//!
//! ## Core Concepts
//! - **`LocalTransport`**: Routes between stacks in the same process through a shared
//!   `LocalNetwork`. Members can be detached to simulate a crash or a partition.
//! - **`UdpTransport`**: One bincode-encoded message per datagram. Broadcasts fan out to
//!   every known peer, since plain UDP has no group addressing.

pub mod local;
pub mod udp;

pub use local::{LocalNetwork, LocalTransport};
pub use udp::UdpTransport;

#[cfg(test)]
mod tests;
