//! covert-core — wire format, bit-packing codec, field embedders and
//! configuration. The channel crate and the daemon depend on this one.

pub mod config;
pub mod embed;
pub mod mask;
pub mod wire;

pub use config::{ChannelConfig, ConfigError, CovertConfig, Delimiter, LimitsConfig};
pub use embed::{CodecState, EmbedError, EmbedderKind, EmbedderMemory, FieldEmbedder, Placement};
pub use mask::{Mask, MaskError, ValidSize};
pub use wire::{Ipv4Header, Segment, TcpFlags, TcpHeader, TcpOption, WireError};
