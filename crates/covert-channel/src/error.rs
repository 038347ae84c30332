//! Error taxonomy for channel operations.

use covert_core::{ConfigError, EmbedError, EmbedderKind, MaskError, WireError};

/// Ways the carrier exchange can break the handshake state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("carrier reset by peer")]
    Reset,

    #[error("duplicate SYN on an open exchange")]
    DuplicateSyn,

    #[error("no SYN-ACK seen for the carrier connection")]
    NoSynAck,

    #[error("{0} rewrites the carrier sequence number")]
    UnsupportedEmbedder(EmbedderKind),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Mask(#[from] MaskError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no port store available for port {port}")]
    Capacity { port: u16 },

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("channel closed")]
    Cancelled,

    #[error("receive buffer full at {len} bytes")]
    BufferFull { len: usize },

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChannelError::Cancelled)
    }

    /// Attach the byte count moved before this error.
    pub fn after(self, transferred: u64) -> Partial {
        Partial {
            transferred,
            source: self,
        }
    }
}

/// A failed send or receive, with the bytes it moved anyway.
#[derive(Debug, thiserror::Error)]
#[error("{source} ({transferred} bytes transferred)")]
pub struct Partial {
    pub transferred: u64,
    #[source]
    pub source: ChannelError,
}

impl From<ChannelError> for Partial {
    fn from(source: ChannelError) -> Self {
        source.after(0)
    }
}

impl From<MaskError> for Partial {
    fn from(e: MaskError) -> Self {
        ChannelError::from(e).after(0)
    }
}
