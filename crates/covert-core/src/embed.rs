//! Field embedders — strategies that place one packed unit into a carrier
//! packet's headers and read it back out.
//!
//! Each embedder owns a mask describing how many bits a single packet
//! carries, and a slice of [`CodecState`] memory for whatever it has to
//! remember between packets (the previous sequence number, the running
//! timestamp clock, whether the timing clock has been primed).
//!
//! Placement may ask the sender to wait before transmitting; timing
//! embedders encode their bit in that wait.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::mask::Mask;
use crate::wire::{Ipv4Header, TcpFlags, TcpHeader};

// ── ECN codepoints (RFC 3168) ─────────────────────────────────────────────────

const ECT_1: u8 = 0b01;
const ECT_0: u8 = 0b10;

// ── State ─────────────────────────────────────────────────────────────────────

/// Per-embedder memory carried between packets of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbedderMemory {
    #[default]
    Empty,
    /// The timing clock has been started by a packet that carried nothing.
    Primed,
    /// Last sequence number emitted.
    Sequence(u32),
    /// Current TSval of the outgoing timestamp clock.
    Timestamp(u32),
    /// Frequency sender: packets of the current burst sent, burst size, and
    /// the last packet's offset from the first one in milliseconds.
    Burst { sent: u8, total: u8, at_ms: u8 },
    /// Frequency receiver: packets counted since the burst began.
    Counting { received: u16, elapsed: Duration },
}

impl EmbedderMemory {
    fn label(&self) -> &'static str {
        match self {
            EmbedderMemory::Empty => "empty",
            EmbedderMemory::Primed => "primed",
            EmbedderMemory::Sequence(_) => "sequence",
            EmbedderMemory::Timestamp(_) => "timestamp",
            EmbedderMemory::Burst { .. } => "burst",
            EmbedderMemory::Counting { .. } => "counting",
        }
    }
}

/// Rolling codec state, created fresh for every send or receive.
#[derive(Debug, Clone)]
pub struct CodecState {
    pub packet_number: u64,
    pub mask_index: usize,
    mask_len: usize,
    pub memory: EmbedderMemory,
}

impl CodecState {
    pub fn new(mask: &Mask) -> Self {
        Self {
            packet_number: 0,
            mask_index: 0,
            mask_len: mask.cycle_len(),
            memory: EmbedderMemory::Empty,
        }
    }

    /// Step past one processed packet.
    pub fn advance(&mut self) {
        self.packet_number += 1;
        self.mask_index += 1;
        if self.mask_index >= self.mask_len {
            self.mask_index = 0;
        }
    }
}

/// What a placement did to the outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placement {
    /// False when the packet carries no unit and the same unit must be
    /// offered again for the next packet.
    pub consumed: bool,
    /// How long to wait before transmitting this packet.
    pub delay: Duration,
}

impl Placement {
    fn now() -> Self {
        Self {
            consumed: true,
            delay: Duration::ZERO,
        }
    }

    fn after(delay: Duration) -> Self {
        Self {
            consumed: true,
            delay,
        }
    }

    fn skip() -> Self {
        Self::default()
    }

    fn hold(delay: Duration) -> Self {
        Self {
            consumed: false,
            delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmbedError {
    #[error("carrier packet has no TCP timestamp option")]
    MissingTimestamp,

    #[error("{embedder} embedder cannot use {found} state")]
    UnexpectedMemory {
        embedder: EmbedderKind,
        found: &'static str,
    },
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// One header field strategy.
pub trait FieldEmbedder: Send + Sync + fmt::Debug {
    fn kind(&self) -> EmbedderKind;

    /// Slot masks; one slot per carrier packet.
    fn mask(&self) -> Mask;

    /// Write `unit` into the outgoing headers.
    fn set_unit(
        &self,
        ip: &mut Ipv4Header,
        tcp: &mut TcpHeader,
        unit: u8,
        state: &mut CodecState,
    ) -> Result<Placement, EmbedError>;

    /// Read a unit from a captured packet. `gap` is the time since the
    /// previous valid packet. `None` means the packet carried nothing.
    fn get_unit(
        &self,
        ip: &Ipv4Header,
        tcp: &TcpHeader,
        gap: Duration,
        state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError>;

    /// Carrier packets must echo the peer's timestamp option.
    fn needs_timestamp(&self) -> bool {
        false
    }

    /// The embedder overwrites the carrier's sequence number.
    fn rewrites_sequence(&self) -> bool {
        false
    }
}

// ── Selection ─────────────────────────────────────────────────────────────────

/// Embedder names as they appear in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    Id,
    UrgPtr,
    UrgFlg,
    Timestamp,
    Ecn,
    Temporal,
    EcnTemporal,
    Frequency,
    Sequence,
}

impl EmbedderKind {
    pub const ALL: [EmbedderKind; 9] = [
        EmbedderKind::Id,
        EmbedderKind::UrgPtr,
        EmbedderKind::UrgFlg,
        EmbedderKind::Timestamp,
        EmbedderKind::Ecn,
        EmbedderKind::Temporal,
        EmbedderKind::EcnTemporal,
        EmbedderKind::Frequency,
        EmbedderKind::Sequence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedderKind::Id => "id",
            EmbedderKind::UrgPtr => "urgptr",
            EmbedderKind::UrgFlg => "urgflg",
            EmbedderKind::Timestamp => "timestamp",
            EmbedderKind::Ecn => "ecn",
            EmbedderKind::Temporal => "temporal",
            EmbedderKind::EcnTemporal => "ecntemporal",
            EmbedderKind::Frequency => "frequency",
            EmbedderKind::Sequence => "sequence",
        }
    }

    /// Instantiate the embedder. `midpoint` only matters to timing variants.
    pub fn build(self, midpoint: Duration) -> Arc<dyn FieldEmbedder> {
        match self {
            EmbedderKind::Id => Arc::new(IdEmbedder),
            EmbedderKind::UrgPtr => Arc::new(UrgPtrEmbedder),
            EmbedderKind::UrgFlg => Arc::new(UrgFlagEmbedder),
            EmbedderKind::Timestamp => Arc::new(TimestampEmbedder),
            EmbedderKind::Ecn => Arc::new(EcnEmbedder),
            EmbedderKind::Temporal => Arc::new(TemporalEmbedder { midpoint }),
            EmbedderKind::EcnTemporal => Arc::new(EcnTemporalEmbedder { midpoint }),
            EmbedderKind::Frequency => Arc::new(FrequencyEmbedder),
            EmbedderKind::Sequence => Arc::new(SequenceEmbedder),
        }
    }
}

impl fmt::Display for EmbedderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown embedder '{0}'")]
pub struct UnknownEmbedder(pub String);

impl FromStr for EmbedderKind {
    type Err = UnknownEmbedder;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or(UnknownEmbedder(s.to_string()))
    }
}

fn bit_slots() -> Mask {
    Mask::from_slots(&[0x01; 8])
}

fn byte_slot() -> Mask {
    Mask::from_slots(&[0xFF])
}

// ── IP identification ─────────────────────────────────────────────────────────

/// Low byte of the IPv4 identification field; the high byte is random.
#[derive(Debug)]
pub struct IdEmbedder;

impl FieldEmbedder for IdEmbedder {
    fn kind(&self) -> EmbedderKind {
        EmbedderKind::Id
    }

    fn mask(&self) -> Mask {
        byte_slot()
    }

    fn set_unit(
        &self,
        ip: &mut Ipv4Header,
        _tcp: &mut TcpHeader,
        unit: u8,
        _state: &mut CodecState,
    ) -> Result<Placement, EmbedError> {
        let mut rng = rand::thread_rng();
        // Raw sockets replace a zero ID with one of their own.
        loop {
            ip.id = (rng.gen::<u16>() & 0xFF00) | unit as u16;
            if ip.id != 0 {
                break;
            }
        }
        Ok(Placement::now())
    }

    fn get_unit(
        &self,
        ip: &Ipv4Header,
        _tcp: &TcpHeader,
        _gap: Duration,
        _state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError> {
        Ok(Some(ip.id as u8))
    }
}

// ── Urgent pointer / flag ─────────────────────────────────────────────────────

/// Low byte of the urgent pointer with URG left clear, so receivers
/// ignore the pointer.
#[derive(Debug)]
pub struct UrgPtrEmbedder;

impl FieldEmbedder for UrgPtrEmbedder {
    fn kind(&self) -> EmbedderKind {
        EmbedderKind::UrgPtr
    }

    fn mask(&self) -> Mask {
        byte_slot()
    }

    fn set_unit(
        &self,
        _ip: &mut Ipv4Header,
        tcp: &mut TcpHeader,
        unit: u8,
        _state: &mut CodecState,
    ) -> Result<Placement, EmbedError> {
        tcp.flags.remove(TcpFlags::URG);
        tcp.urgent_ptr = (rand::thread_rng().gen::<u16>() & 0xFF00) | unit as u16;
        Ok(Placement::now())
    }

    fn get_unit(
        &self,
        _ip: &Ipv4Header,
        tcp: &TcpHeader,
        _gap: Duration,
        _state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError> {
        Ok(Some(tcp.urgent_ptr as u8))
    }
}

/// One bit per packet in the URG flag.
#[derive(Debug)]
pub struct UrgFlagEmbedder;

impl FieldEmbedder for UrgFlagEmbedder {
    fn kind(&self) -> EmbedderKind {
        EmbedderKind::UrgFlg
    }

    fn mask(&self) -> Mask {
        bit_slots()
    }

    fn set_unit(
        &self,
        _ip: &mut Ipv4Header,
        tcp: &mut TcpHeader,
        unit: u8,
        _state: &mut CodecState,
    ) -> Result<Placement, EmbedError> {
        tcp.flags.set(TcpFlags::URG, unit & 0x01 != 0);
        Ok(Placement::now())
    }

    fn get_unit(
        &self,
        _ip: &Ipv4Header,
        tcp: &TcpHeader,
        _gap: Duration,
        _state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError> {
        Ok(Some(tcp.is(TcpFlags::URG) as u8))
    }
}

// ── Timestamp option ──────────────────────────────────────────────────────────

/// Low byte of TSval. The clock only moves forward, so reaching a given
/// low byte costs up to 255 ms, which becomes the send delay and keeps
/// the clock honest.
#[derive(Debug)]
pub struct TimestampEmbedder;

impl FieldEmbedder for TimestampEmbedder {
    fn kind(&self) -> EmbedderKind {
        EmbedderKind::Timestamp
    }

    fn mask(&self) -> Mask {
        byte_slot()
    }

    fn set_unit(
        &self,
        _ip: &mut Ipv4Header,
        tcp: &mut TcpHeader,
        unit: u8,
        state: &mut CodecState,
    ) -> Result<Placement, EmbedError> {
        let (value, _) = tcp.timestamp_mut().ok_or(EmbedError::MissingTimestamp)?;
        let current = match state.memory {
            EmbedderMemory::Empty => *value,
            EmbedderMemory::Timestamp(v) => v,
            other => {
                return Err(EmbedError::UnexpectedMemory {
                    embedder: self.kind(),
                    found: other.label(),
                })
            }
        };
        let advance = unit.wrapping_sub(current as u8) as u32;
        let next = current.wrapping_add(advance);
        *value = next;
        state.memory = EmbedderMemory::Timestamp(next);
        Ok(Placement::after(Duration::from_millis(advance as u64)))
    }

    fn get_unit(
        &self,
        _ip: &Ipv4Header,
        tcp: &TcpHeader,
        _gap: Duration,
        _state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError> {
        let (value, _) = tcp.timestamp().ok_or(EmbedError::MissingTimestamp)?;
        Ok(Some(value as u8))
    }

    fn needs_timestamp(&self) -> bool {
        true
    }
}

// ── ECN ───────────────────────────────────────────────────────────────────────

fn set_ecn_bit(ip: &mut Ipv4Header, bit: u8) {
    ip.set_ecn(if bit & 0x01 != 0 { ECT_1 } else { ECT_0 });
}

fn ecn_bit(ip: &Ipv4Header) -> u8 {
    (ip.ecn() == ECT_1) as u8
}

/// One bit per packet as ECT(1) versus ECT(0).
#[derive(Debug)]
pub struct EcnEmbedder;

impl FieldEmbedder for EcnEmbedder {
    fn kind(&self) -> EmbedderKind {
        EmbedderKind::Ecn
    }

    fn mask(&self) -> Mask {
        bit_slots()
    }

    fn set_unit(
        &self,
        ip: &mut Ipv4Header,
        _tcp: &mut TcpHeader,
        unit: u8,
        _state: &mut CodecState,
    ) -> Result<Placement, EmbedError> {
        set_ecn_bit(ip, unit);
        Ok(Placement::now())
    }

    fn get_unit(
        &self,
        ip: &Ipv4Header,
        _tcp: &TcpHeader,
        _gap: Duration,
        _state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError> {
        Ok(Some(ecn_bit(ip)))
    }
}

// ── Timing ────────────────────────────────────────────────────────────────────

/// Shared priming rule: the first packet of a message starts the clock and
/// carries nothing. Returns true once primed.
fn prime(state: &mut CodecState, kind: EmbedderKind) -> Result<bool, EmbedError> {
    match state.memory {
        EmbedderMemory::Empty => {
            state.memory = EmbedderMemory::Primed;
            Ok(false)
        }
        EmbedderMemory::Primed => Ok(true),
        other => Err(EmbedError::UnexpectedMemory {
            embedder: kind,
            found: other.label(),
        }),
    }
}

fn gap_delay(midpoint: Duration, bit: u8) -> Duration {
    if bit & 0x01 != 0 {
        midpoint * 3 / 2
    } else {
        midpoint / 2
    }
}

fn gap_bit(midpoint: Duration, gap: Duration) -> u8 {
    (gap >= midpoint) as u8
}

/// One bit per inter-packet gap: short for 0, long for 1.
#[derive(Debug)]
pub struct TemporalEmbedder {
    pub midpoint: Duration,
}

impl FieldEmbedder for TemporalEmbedder {
    fn kind(&self) -> EmbedderKind {
        EmbedderKind::Temporal
    }

    fn mask(&self) -> Mask {
        bit_slots()
    }

    fn set_unit(
        &self,
        _ip: &mut Ipv4Header,
        _tcp: &mut TcpHeader,
        unit: u8,
        state: &mut CodecState,
    ) -> Result<Placement, EmbedError> {
        if !prime(state, self.kind())? {
            return Ok(Placement::skip());
        }
        Ok(Placement::after(gap_delay(self.midpoint, unit)))
    }

    fn get_unit(
        &self,
        _ip: &Ipv4Header,
        _tcp: &TcpHeader,
        gap: Duration,
        state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError> {
        if !prime(state, self.kind())? {
            return Ok(None);
        }
        Ok(Some(gap_bit(self.midpoint, gap)))
    }
}

/// Two bits per packet: bit 0 in the gap, bit 1 in ECN.
#[derive(Debug)]
pub struct EcnTemporalEmbedder {
    pub midpoint: Duration,
}

impl FieldEmbedder for EcnTemporalEmbedder {
    fn kind(&self) -> EmbedderKind {
        EmbedderKind::EcnTemporal
    }

    fn mask(&self) -> Mask {
        Mask::from_slots(&[0x03; 4])
    }

    fn set_unit(
        &self,
        ip: &mut Ipv4Header,
        _tcp: &mut TcpHeader,
        unit: u8,
        state: &mut CodecState,
    ) -> Result<Placement, EmbedError> {
        if !prime(state, self.kind())? {
            return Ok(Placement::skip());
        }
        set_ecn_bit(ip, unit >> 1);
        Ok(Placement::after(gap_delay(self.midpoint, unit)))
    }

    fn get_unit(
        &self,
        ip: &Ipv4Header,
        _tcp: &TcpHeader,
        gap: Duration,
        state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError> {
        if !prime(state, self.kind())? {
            return Ok(None);
        }
        Ok(Some(gap_bit(self.midpoint, gap) | (ecn_bit(ip) << 1)))
    }
}

// ── Burst frequency ───────────────────────────────────────────────────────────

/// Packets in a burst carrying a 1 or a 0.
const BURST_ONE: u8 = 8;
const BURST_ZERO: u8 = 2;
/// Burst packets all fall within this many ms of the first one.
const BURST_SPREAD_MS: u8 = 40;
/// The closing packet of a burst, which carries the bit.
const BURST_CLOSE_MS: u8 = 55;
/// Receivers close a burst on the first packet at least this late.
const BURST_WINDOW: Duration = Duration::from_millis(50);
/// Bursts with fewer packets than this read as 0.
const BURST_THRESHOLD: u16 = 4;

/// One bit per burst: many packets for 1, few for 0, spread at random
/// inside the burst window and closed by one late packet.
#[derive(Debug)]
pub struct FrequencyEmbedder;

impl FieldEmbedder for FrequencyEmbedder {
    fn kind(&self) -> EmbedderKind {
        EmbedderKind::Frequency
    }

    fn mask(&self) -> Mask {
        bit_slots()
    }

    fn set_unit(
        &self,
        _ip: &mut Ipv4Header,
        _tcp: &mut TcpHeader,
        unit: u8,
        state: &mut CodecState,
    ) -> Result<Placement, EmbedError> {
        let mut rng = rand::thread_rng();
        match state.memory {
            EmbedderMemory::Empty => {
                let total = if unit & 0x01 != 0 { BURST_ONE } else { BURST_ZERO };
                state.memory = EmbedderMemory::Burst {
                    sent: 1,
                    total,
                    at_ms: 0,
                };
                let lead = rng.gen_range(1..=BURST_SPREAD_MS);
                Ok(Placement::hold(Duration::from_millis(lead as u64)))
            }
            EmbedderMemory::Burst { sent, total, at_ms } if sent < total => {
                // Leave room for the packets still to come.
                let room = (BURST_SPREAD_MS - at_ms) / (total - sent);
                let step = rng.gen_range(0..=room);
                state.memory = EmbedderMemory::Burst {
                    sent: sent + 1,
                    total,
                    at_ms: at_ms + step,
                };
                Ok(Placement::hold(Duration::from_millis(step as u64)))
            }
            EmbedderMemory::Burst { at_ms, .. } => {
                state.memory = EmbedderMemory::Empty;
                let close = (BURST_CLOSE_MS - at_ms) as u64;
                Ok(Placement::after(Duration::from_millis(close)))
            }
            other => Err(EmbedError::UnexpectedMemory {
                embedder: self.kind(),
                found: other.label(),
            }),
        }
    }

    fn get_unit(
        &self,
        _ip: &Ipv4Header,
        _tcp: &TcpHeader,
        gap: Duration,
        state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError> {
        match state.memory {
            // The first packet of a burst starts its clock.
            EmbedderMemory::Empty => {
                state.memory = EmbedderMemory::Counting {
                    received: 1,
                    elapsed: Duration::ZERO,
                };
                Ok(None)
            }
            EmbedderMemory::Counting { received, elapsed } => {
                let elapsed = elapsed + gap;
                if elapsed >= BURST_WINDOW {
                    state.memory = EmbedderMemory::Empty;
                    return Ok(Some((received >= BURST_THRESHOLD) as u8));
                }
                state.memory = EmbedderMemory::Counting {
                    received: received + 1,
                    elapsed,
                };
                Ok(None)
            }
            other => Err(EmbedError::UnexpectedMemory {
                embedder: self.kind(),
                found: other.label(),
            }),
        }
    }
}

// ── Sequence number ───────────────────────────────────────────────────────────

/// Low byte of the sequence number, high bytes random. Consecutive packets
/// never repeat a sequence number since receivers treat a repeat as a
/// retransmission.
#[derive(Debug)]
pub struct SequenceEmbedder;

impl FieldEmbedder for SequenceEmbedder {
    fn kind(&self) -> EmbedderKind {
        EmbedderKind::Sequence
    }

    fn mask(&self) -> Mask {
        byte_slot()
    }

    fn set_unit(
        &self,
        _ip: &mut Ipv4Header,
        tcp: &mut TcpHeader,
        unit: u8,
        state: &mut CodecState,
    ) -> Result<Placement, EmbedError> {
        let previous = match state.memory {
            EmbedderMemory::Empty => None,
            EmbedderMemory::Sequence(seq) => Some(seq),
            other => {
                return Err(EmbedError::UnexpectedMemory {
                    embedder: self.kind(),
                    found: other.label(),
                })
            }
        };
        let mut rng = rand::thread_rng();
        loop {
            tcp.seq = (rng.gen::<u32>() & 0xFFFF_FF00) | unit as u32;
            if Some(tcp.seq) != previous {
                break;
            }
        }
        state.memory = EmbedderMemory::Sequence(tcp.seq);
        Ok(Placement::now())
    }

    fn get_unit(
        &self,
        _ip: &Ipv4Header,
        tcp: &TcpHeader,
        _gap: Duration,
        _state: &mut CodecState,
    ) -> Result<Option<u8>, EmbedError> {
        Ok(Some(tcp.seq as u8))
    }

    fn rewrites_sequence(&self) -> bool {
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
