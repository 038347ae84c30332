//! Receive side: accept a carrier, follow its handshake, decode its packets.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

use covert_core::{CodecState, Delimiter, FieldEmbedder, MaskError, TcpFlags};

use super::Inner;
use crate::error::{ChannelError, Partial, ProtocolError};
use crate::raw::CapturedPacket;
use crate::wait::{bounded, PacketWait};

/// Largest single read when draining the carrier socket.
const DRAIN_CHUNK: usize = 256;
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitSyn,
    AwaitAck,
    Established,
}

/// What one packet meant to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Step {
    /// Not part of this exchange (yet).
    Ignored,
    Valid,
    /// The message is complete.
    Done,
}

/// Packet-by-packet state of one receive.
pub(super) struct ReceiveMachine<'a> {
    embedder: &'a dyn FieldEmbedder,
    delimiter: Delimiter,
    friend_port: u16,
    stage: Stage,
    previous: Option<Instant>,
    state: CodecState,
    packed: Vec<u8>,
    filled: usize,
    /// Decoded size of a full buffer, reported on overflow.
    buffer_len: usize,
}

impl<'a> ReceiveMachine<'a> {
    pub(super) fn new(
        embedder: &'a dyn FieldEmbedder,
        delimiter: Delimiter,
        friend_port: u16,
        packed_capacity: usize,
        buffer_len: usize,
    ) -> Self {
        let mask = embedder.mask();
        Self {
            embedder,
            delimiter,
            friend_port,
            stage: Stage::AwaitSyn,
            previous: None,
            state: CodecState::new(&mask),
            packed: vec![0u8; packed_capacity],
            filled: 0,
            buffer_len,
        }
    }

    /// Packed units collected so far.
    pub(super) fn filled(&self) -> &[u8] {
        &self.packed[..self.filled]
    }

    pub(super) fn handle(&mut self, packet: &CapturedPacket) -> Result<Step, ChannelError> {
        let tcp = &packet.tcp;
        if tcp.src_port != self.friend_port {
            return Ok(Step::Ignored);
        }

        match self.stage {
            Stage::AwaitSyn if tcp.is(TcpFlags::SYN) => {
                self.stage = Stage::AwaitAck;
                tracing::debug!(friend_port = self.friend_port, "carrier SYN");
                return Ok(Step::Valid);
            }
            Stage::AwaitAck if tcp.is(TcpFlags::ACK) => {
                self.stage = Stage::Established;
                self.previous = Some(packet.captured_at);
                tracing::debug!(friend_port = self.friend_port, "carrier established");
                return Ok(Step::Valid);
            }
            _ => {}
        }

        if tcp.is(TcpFlags::RST) {
            return Err(ProtocolError::Reset.into());
        }
        // A second SYN means a lost FIN left us on a stale exchange.
        if tcp.is(TcpFlags::SYN) {
            return Err(ProtocolError::DuplicateSyn.into());
        }
        if self.stage != Stage::Established {
            return Ok(Step::Ignored);
        }
        if tcp.is(TcpFlags::FIN) {
            tracing::debug!(friend_port = self.friend_port, "carrier FIN");
            return Ok(Step::Done);
        }
        // Crafted packets always carry a payload; bare ACKs come from the
        // sender's own stack reacting to our acknowledgements.
        if packet.payload_len == 0 {
            return Ok(Step::Ignored);
        }
        if self.delimiter == Delimiter::Protocol && !tcp.is(TcpFlags::PSH) {
            tracing::debug!(friend_port = self.friend_port, "message terminator");
            return Ok(Step::Done);
        }

        let gap = self
            .previous
            .map(|at| packet.captured_at.saturating_duration_since(at))
            .unwrap_or_default();
        self.previous = Some(packet.captured_at);

        let unit = self
            .embedder
            .get_unit(&packet.ip, tcp, gap, &mut self.state)?;
        self.state.advance();
        if let Some(unit) = unit {
            self.push(unit)?;
        }
        Ok(Step::Valid)
    }

    /// A full buffer may still await its terminator, but a unit beyond it
    /// fails the receive in either delimiter mode.
    fn push(&mut self, unit: u8) -> Result<(), ChannelError> {
        if self.filled == self.packed.len() {
            tracing::warn!(
                friend_port = self.friend_port,
                len = self.buffer_len,
                "receive buffer full before the message ended"
            );
            return Err(ChannelError::BufferFull {
                len: self.buffer_len,
            });
        }
        self.packed[self.filled] = unit;
        self.filled += 1;
        Ok(())
    }
}

/// Bytes the real stack has buffered for the carrier socket. One byte is
/// always left unread so closing the socket resets the connection rather
/// than starting an orderly FIN exchange with a desynchronised peer.
#[derive(Debug, Default)]
struct Drain {
    owed: usize,
}

impl Drain {
    fn owe(&mut self, bytes: usize) {
        self.owed += bytes;
    }

    async fn run(&mut self, stream: &mut TcpStream) {
        let mut scratch = [0u8; DRAIN_CHUNK];
        while self.owed > 1 {
            let want = (self.owed - 1).min(DRAIN_CHUNK);
            let read = stream.read(&mut scratch[..want]);
            match tokio::time::timeout(DRAIN_READ_TIMEOUT, read).await {
                Ok(Ok(n)) if n > 0 => self.owed -= n,
                _ => break,
            }
        }
    }
}

impl Inner {
    pub(super) async fn receive(&self, buf: &mut [u8]) -> Result<u64, Partial> {
        if self.shutdown.is_triggered() {
            return Err(ChannelError::Cancelled.into());
        }
        // Nothing fits, and only a terminator could end an empty message.
        if buf.is_empty() && self.config.delimiter == Delimiter::Buffer {
            return Ok(0);
        }

        let mask = self.embedder.mask();
        let packed_capacity = mask.encoded_size(buf.len())?;

        let conn = bounded(
            "accept",
            self.config.accept_timeout(),
            &self.shutdown,
            async { self.accepted.lock().await.recv().await },
        )
        .await?
        .ok_or(ChannelError::Cancelled)?;
        let mut stream = conn.stream;
        let friend_port = conn.friend_port;

        let mut lease = self.inbound.acquire(friend_port, true).await?;
        let mut machine = ReceiveMachine::new(
            self.embedder.as_ref(),
            self.config.delimiter,
            friend_port,
            packed_capacity,
            buf.len(),
        );
        let mut wait = PacketWait::new("read", self.config.read_timeout());
        let mut drain = Drain::default();

        let outcome = loop {
            let packet = match wait.next(&mut lease, &self.shutdown).await {
                Ok(p) => p,
                Err(e) => break Err(e),
            };
            match machine.handle(&packet) {
                Ok(Step::Ignored) => {}
                Ok(Step::Valid) => {
                    wait.touch();
                    drain.owe(packet.payload_len);
                    drain.run(&mut stream).await;
                }
                Ok(Step::Done) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        // Release the port before the carrier closes, so a message sent
        // right behind this one finds its SYN kept.
        drop(lease);
        drop(stream);

        let filled = machine.filled();
        let n = mask.decode_into(filled, buf)? as u64;
        tracing::debug!(friend_port, bytes = n, packed = filled.len(), "receive finished");

        match outcome {
            Err(e) => Err(e.after(n)),
            Ok(()) => {
                let valid = mask.valid_size(filled.len())?;
                if valid.remainder != 0 {
                    let e = MaskError::Misaligned {
                        len: filled.len(),
                        unit: mask.cycle_len(),
                    };
                    return Err(ChannelError::from(e).after(n));
                }
                Ok(n)
            }
        }
    }
}
