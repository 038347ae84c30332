//! covert-channel — moves covert messages over crafted TCP carriers.
//!
//! A [`HandshakeChannel`] opens a real TCP connection per message so the
//! exchange starts with a genuine three-way handshake, then carries the
//! message in raw packets whose header fields are chosen by the configured
//! embedder. Packets coming back in are split per port by two
//! [`PacketRouter`]s, one per direction.

use std::future::Future;

pub mod error;
pub mod handshake;
pub mod raw;
pub mod router;
pub mod shutdown;
pub mod wait;

pub use error::{ChannelError, Partial, ProtocolError};
pub use handshake::HandshakeChannel;
pub use raw::CapturedPacket;
pub use router::{PacketRouter, PortLease, RouteBy, RouterLimits, StoreInfo};
pub use shutdown::Shutdown;

/// The contract every channel variant offers.
///
/// Both transfers report the bytes they moved even when they fail; the
/// count rides in [`Partial`].
pub trait Channel: Send + Sync {
    /// Send `data` as one message.
    fn send(&self, data: &[u8]) -> impl Future<Output = Result<u64, Partial>> + Send;

    /// Receive one message into `buf`, up to its length.
    fn receive(&self, buf: &mut [u8]) -> impl Future<Output = Result<u64, Partial>> + Send;

    /// Stop every pending and future transfer. Safe to call repeatedly.
    fn close(&self) -> Result<(), ChannelError>;
}
