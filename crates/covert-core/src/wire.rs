//! Carrier wire format — the IPv4 and TCP headers that covert data rides in.
//!
//! Nothing here is a new protocol. These are the standard RFC 791 / RFC 793
//! layouts, parsed into owned structs so a captured packet never borrows the
//! read buffer it arrived in, and rebuilt with correct lengths and checksums
//! before a crafted packet hits the raw socket.
//!
//! The fixed parts of both headers are #[repr(C)] zerocopy types with
//! network-endian fields. Options are handled by hand.

use std::net::Ipv4Addr;

use bitflags::bitflags;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// IP protocol number for TCP.
pub const PROTO_TCP: u8 = 6;

/// Length of an IPv4 header without options.
pub const IPV4_MIN_HEADER: usize = 20;

/// Length of a TCP header without options.
pub const TCP_MIN_HEADER: usize = 20;

/// Default TTL for crafted packets.
pub const DEFAULT_TTL: u8 = 64;

/// Receive window advertised by crafted packets.
pub const CRAFTED_WINDOW: u16 = 512;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_TIMESTAMP: u8 = 8;
const OPT_TIMESTAMP_LEN: u8 = 10;

// ── Fixed headers ─────────────────────────────────────────────────────────────

/// The 20 fixed bytes of an IPv4 header.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Ipv4Fixed {
    /// Version in the high nibble, header length in 32-bit words in the low.
    pub version_ihl: u8,
    /// DSCP in the high six bits, ECN codepoint in the low two.
    pub tos: u8,
    pub total_len: U16,
    pub id: U16,
    /// Flags in the high three bits, fragment offset below.
    pub flags_frag: U16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: U16,
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

assert_eq_size!(Ipv4Fixed, [u8; 20]);

/// The 20 fixed bytes of a TCP header.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TcpFixed {
    pub src_port: U16,
    pub dst_port: U16,
    pub seq: U32,
    pub ack: U32,
    /// Data offset in the high nibble, then three reserved bits, then the
    /// nine flag bits (NS down to FIN).
    pub offset_flags: U16,
    pub window: U16,
    pub checksum: U16,
    pub urgent_ptr: U16,
}

assert_eq_size!(TcpFixed, [u8; 20]);

bitflags! {
    /// TCP control bits.
    pub struct TcpFlags: u16 {
        const FIN = 0x001;
        const SYN = 0x002;
        const RST = 0x004;
        const PSH = 0x008;
        const ACK = 0x010;
        const URG = 0x020;
        const ECE = 0x040;
        const CWR = 0x080;
        const NS  = 0x100;
    }
}

// ── Parsed headers ────────────────────────────────────────────────────────────

/// An owned IPv4 header. Options, if any, are skipped on parse and never
/// emitted on build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub id: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Header length in bytes as seen on the wire.
    pub header_len: usize,
    /// Total datagram length as seen on the wire.
    pub total_len: usize,
}

impl Ipv4Header {
    /// A plain TCP-carrying header from `src` to `dst`.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        Self {
            tos: 0,
            id: 0,
            flags_frag: 0,
            ttl: DEFAULT_TTL,
            protocol: PROTO_TCP,
            src,
            dst,
            header_len: IPV4_MIN_HEADER,
            total_len: 0,
        }
    }

    /// The two ECN bits of the type-of-service byte.
    pub fn ecn(&self) -> u8 {
        self.tos & 0x03
    }

    pub fn set_ecn(&mut self, codepoint: u8) {
        self.tos = (self.tos & 0xFC) | (codepoint & 0x03);
    }
}

/// A single TCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpOption {
    Nop,
    /// RFC 7323 timestamps: TSval and TSecr.
    Timestamp { value: u32, echo: u32 },
    /// Anything else, kept verbatim (kind, data without the kind/len bytes).
    Other { kind: u8, data: Vec<u8> },
}

impl TcpOption {
    fn encoded_len(&self) -> usize {
        match self {
            TcpOption::Nop => 1,
            TcpOption::Timestamp { .. } => OPT_TIMESTAMP_LEN as usize,
            TcpOption::Other { data, .. } => 2 + data.len(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            TcpOption::Nop => out.push(OPT_NOP),
            TcpOption::Timestamp { value, echo } => {
                out.push(OPT_TIMESTAMP);
                out.push(OPT_TIMESTAMP_LEN);
                out.extend_from_slice(&value.to_be_bytes());
                out.extend_from_slice(&echo.to_be_bytes());
            }
            TcpOption::Other { kind, data } => {
                out.push(*kind);
                out.push((2 + data.len()) as u8);
                out.extend_from_slice(data);
            }
        }
    }
}

/// An owned TCP header. Option data is copied out of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub urgent_ptr: u16,
    pub options: Vec<TcpOption>,
}

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq: 0,
            ack: 0,
            flags: TcpFlags::empty(),
            window: CRAFTED_WINDOW,
            urgent_ptr: 0,
            options: Vec::new(),
        }
    }

    pub fn is(&self, flags: TcpFlags) -> bool {
        self.flags.contains(flags)
    }

    /// The first timestamp option, if present.
    pub fn timestamp(&self) -> Option<(u32, u32)> {
        self.options.iter().find_map(|o| match o {
            TcpOption::Timestamp { value, echo } => Some((*value, *echo)),
            _ => None,
        })
    }

    /// Mutable access to the first timestamp option, if present.
    pub fn timestamp_mut(&mut self) -> Option<(&mut u32, &mut u32)> {
        self.options.iter_mut().find_map(|o| match o {
            TcpOption::Timestamp { value, echo } => Some((value, echo)),
            _ => None,
        })
    }

    /// Options length on the wire, padded to a 32-bit boundary.
    fn options_len(&self) -> usize {
        let raw: usize = self.options.iter().map(TcpOption::encoded_len).sum();
        (raw + 3) & !3
    }
}

/// A TCP segment parsed from a raw IPv4 datagram.
#[derive(Debug, Clone)]
pub struct Segment {
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    /// Bytes of TCP payload following the headers.
    pub payload_len: usize,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting captured bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated {layer} header: need {need} bytes, have {have}")]
    Truncated {
        layer: &'static str,
        need: usize,
        have: usize,
    },

    #[error("not an IPv4 datagram (version {0})")]
    NotIpv4(u8),

    #[error("not a TCP segment (protocol {0})")]
    NotTcp(u8),

    #[error("malformed TCP option kind {kind} at offset {offset}")]
    BadOption { kind: u8, offset: usize },

    #[error("TCP options too long: {0} bytes")]
    OptionsTooLong(usize),
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse an IPv4 datagram carrying TCP, as returned by a raw socket read.
pub fn parse_segment(buf: &[u8]) -> Result<Segment, WireError> {
    let fixed = Ipv4Fixed::read_from_prefix(buf).ok_or(WireError::Truncated {
        layer: "ipv4",
        need: IPV4_MIN_HEADER,
        have: buf.len(),
    })?;

    let version = fixed.version_ihl >> 4;
    if version != 4 {
        return Err(WireError::NotIpv4(version));
    }
    if fixed.protocol != PROTO_TCP {
        return Err(WireError::NotTcp(fixed.protocol));
    }

    let header_len = ((fixed.version_ihl & 0x0F) as usize) * 4;
    if header_len < IPV4_MIN_HEADER || buf.len() < header_len {
        return Err(WireError::Truncated {
            layer: "ipv4",
            need: header_len.max(IPV4_MIN_HEADER),
            have: buf.len(),
        });
    }

    // Trust the buffer over the header when they disagree; some stacks
    // hand back datagrams with the length already stripped or padded.
    let total_len = (fixed.total_len.get() as usize).clamp(header_len, buf.len());

    let ip = Ipv4Header {
        tos: fixed.tos,
        id: fixed.id.get(),
        flags_frag: fixed.flags_frag.get(),
        ttl: fixed.ttl,
        protocol: fixed.protocol,
        src: Ipv4Addr::from(fixed.src),
        dst: Ipv4Addr::from(fixed.dst),
        header_len,
        total_len,
    };

    let (tcp, tcp_len) = parse_tcp(&buf[header_len..total_len])?;

    Ok(Segment {
        ip,
        tcp,
        payload_len: total_len - header_len - tcp_len,
    })
}

/// Parse a TCP header, returning it and its length in bytes.
fn parse_tcp(buf: &[u8]) -> Result<(TcpHeader, usize), WireError> {
    let fixed = TcpFixed::read_from_prefix(buf).ok_or(WireError::Truncated {
        layer: "tcp",
        need: TCP_MIN_HEADER,
        have: buf.len(),
    })?;

    let offset_flags = fixed.offset_flags.get();
    let header_len = ((offset_flags >> 12) as usize) * 4;
    if header_len < TCP_MIN_HEADER || buf.len() < header_len {
        return Err(WireError::Truncated {
            layer: "tcp",
            need: header_len.max(TCP_MIN_HEADER),
            have: buf.len(),
        });
    }

    let options = parse_options(&buf[TCP_MIN_HEADER..header_len])?;

    let header = TcpHeader {
        src_port: fixed.src_port.get(),
        dst_port: fixed.dst_port.get(),
        seq: fixed.seq.get(),
        ack: fixed.ack.get(),
        flags: TcpFlags::from_bits_truncate(offset_flags & 0x01FF),
        window: fixed.window.get(),
        urgent_ptr: fixed.urgent_ptr.get(),
        options,
    };
    Ok((header, header_len))
}

fn parse_options(mut buf: &[u8]) -> Result<Vec<TcpOption>, WireError> {
    let mut options = Vec::new();
    let mut offset = TCP_MIN_HEADER;

    while let Some(&kind) = buf.first() {
        match kind {
            OPT_END => break,
            OPT_NOP => {
                options.push(TcpOption::Nop);
                buf = &buf[1..];
                offset += 1;
            }
            _ => {
                let len = *buf.get(1).ok_or(WireError::BadOption { kind, offset })? as usize;
                if len < 2 || len > buf.len() {
                    return Err(WireError::BadOption { kind, offset });
                }
                let data = &buf[2..len];
                if kind == OPT_TIMESTAMP {
                    if len != OPT_TIMESTAMP_LEN as usize {
                        return Err(WireError::BadOption { kind, offset });
                    }
                    options.push(TcpOption::Timestamp {
                        value: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                        echo: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                    });
                } else {
                    options.push(TcpOption::Other {
                        kind,
                        data: data.to_vec(),
                    });
                }
                buf = &buf[len..];
                offset += len;
            }
        }
    }
    Ok(options)
}

// ── Building ──────────────────────────────────────────────────────────────────

/// Serialize a complete IPv4 datagram carrying `tcp` and `payload`.
///
/// Lengths, data offset and both checksums are computed here; whatever the
/// caller left in `ip.total_len` / `ip.header_len` is ignored.
pub fn build_segment(
    ip: &Ipv4Header,
    tcp: &TcpHeader,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    let options_len = tcp.options_len();
    // Data offset is four bits of 32-bit words.
    if TCP_MIN_HEADER + options_len > 60 {
        return Err(WireError::OptionsTooLong(options_len));
    }
    let tcp_len = TCP_MIN_HEADER + options_len;
    let total_len = IPV4_MIN_HEADER + tcp_len + payload.len();

    let mut segment = Vec::with_capacity(tcp_len + payload.len());
    let fixed = TcpFixed {
        src_port: U16::new(tcp.src_port),
        dst_port: U16::new(tcp.dst_port),
        seq: U32::new(tcp.seq),
        ack: U32::new(tcp.ack),
        offset_flags: U16::new((((tcp_len / 4) as u16) << 12) | tcp.flags.bits()),
        window: U16::new(tcp.window),
        checksum: U16::new(0),
        urgent_ptr: U16::new(tcp.urgent_ptr),
    };
    segment.extend_from_slice(fixed.as_bytes());
    for option in &tcp.options {
        option.write(&mut segment);
    }
    segment.resize(tcp_len, OPT_END);
    segment.extend_from_slice(payload);

    let sum = tcp_checksum(ip.src, ip.dst, &segment);
    segment[16..18].copy_from_slice(&sum.to_be_bytes());

    let mut header = Ipv4Fixed {
        version_ihl: 0x45,
        tos: ip.tos,
        total_len: U16::new(total_len as u16),
        id: U16::new(ip.id),
        flags_frag: U16::new(ip.flags_frag),
        ttl: ip.ttl,
        protocol: ip.protocol,
        checksum: U16::new(0),
        src: ip.src.octets(),
        dst: ip.dst.octets(),
    };
    header.checksum = U16::new(checksum(header.as_bytes()));

    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&segment);
    Ok(out)
}

// ── Checksums ─────────────────────────────────────────────────────────────────

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    finish(sum_words(0, data))
}

/// TCP checksum over the IPv4 pseudo-header and `segment`, which must have
/// its checksum field zeroed.
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = PROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let acc = sum_words(0, &pseudo);
    finish(sum_words(acc, segment))
}

fn sum_words(mut acc: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        acc = acc.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        acc = acc.wrapping_add((*last as u32) << 8);
    }
    acc
}

fn finish(mut acc: u32) -> u16 {
    while acc >> 16 != 0 {
        acc = (acc & 0xFFFF) + (acc >> 16);
    }
    !(acc as u16)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
