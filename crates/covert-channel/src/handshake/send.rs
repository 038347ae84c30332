//! Send side: dial a carrier, take over its sequence space, and write the
//! message into crafted packets.

use std::net::SocketAddrV4;
use std::time::Duration;

use tokio::net::TcpSocket;
use tokio::time::Instant;

use covert_core::wire::build_segment;
use covert_core::{
    ChannelConfig, CodecState, Delimiter, EmbedError, Ipv4Header, Mask, TcpFlags, TcpHeader,
    TcpOption,
};

use super::{Inner, CARRIER_PAYLOAD};
use crate::error::{ChannelError, Partial, ProtocolError};
use crate::raw::CapturedPacket;
use crate::router::PortLease;
use crate::wait::{bounded, pause, PacketWait};

/// How long the kernel gets to show us its SYN-ACK.
const SYNACK_WAIT: Duration = Duration::from_secs(3);
/// How long to wait for the peer to answer our FIN.
const CLOSE_WAIT: Duration = Duration::from_secs(1);
/// Either answer to our FIN ends the exchange.
const CLOSING: TcpFlags = TcpFlags::from_bits_truncate(TcpFlags::FIN.bits() | TcpFlags::RST.bits());

/// Header template for the packets of one carrier, tracking the sequence
/// number as payload goes out.
#[derive(Debug, Clone)]
pub(super) struct Carrier {
    ip: Ipv4Header,
    tcp: TcpHeader,
}

impl Carrier {
    /// Take over the carrier negotiated by `synack`. With `echo_timestamp`
    /// the peer's timestamp option is mirrored back, advanced by the time
    /// since the dial completed.
    pub(super) fn new(
        config: &ChannelConfig,
        origin_port: u16,
        synack: &CapturedPacket,
        dialed_at: Instant,
        echo_timestamp: bool,
    ) -> Result<Self, EmbedError> {
        let ip = Ipv4Header::new(config.origin_ip, config.friend_ip);
        let mut tcp = TcpHeader::new(origin_port, config.friend_port);
        tcp.flags = TcpFlags::ACK | TcpFlags::PSH;
        tcp.seq = synack.tcp.ack;
        tcp.ack = synack.tcp.seq.wrapping_add(1);

        if echo_timestamp {
            let (value, echo) = synack.tcp.timestamp().ok_or(EmbedError::MissingTimestamp)?;
            let elapsed = dialed_at.elapsed().as_millis() as u32;
            tcp.options = vec![
                TcpOption::Nop,
                TcpOption::Nop,
                TcpOption::Timestamp {
                    value: echo.wrapping_add(elapsed),
                    echo: value,
                },
            ];
        }
        Ok(Self { ip, tcp })
    }

    /// Fresh headers for the next data packet.
    pub(super) fn headers(&self) -> (Ipv4Header, TcpHeader) {
        (self.ip.clone(), self.tcp.clone())
    }

    /// Account for a transmitted packet: advance the sequence number and
    /// keep the options it carried (the timestamp clock only moves forward).
    pub(super) fn sent(&mut self, tcp: &TcpHeader, payload_len: usize) {
        self.tcp.seq = self.tcp.seq.wrapping_add(payload_len as u32);
        self.tcp.options = tcp.options.clone();
    }

    pub(super) fn fin(&self) -> (Ipv4Header, TcpHeader) {
        let mut tcp = self.tcp.clone();
        tcp.flags = TcpFlags::FIN | TcpFlags::ACK;
        (self.ip.clone(), tcp)
    }
}

impl Inner {
    pub(super) async fn send(&self, data: &[u8]) -> Result<u64, Partial> {
        if self.shutdown.is_triggered() {
            return Err(ChannelError::Cancelled.into());
        }

        let mask = self.embedder.mask();
        let packed = mask.encode(data)?;

        tracing::debug!(
            bytes = data.len(),
            packets = packed.len(),
            head = %hex::encode(&data[..data.len().min(16)]),
            "sending message"
        );

        let socket = TcpSocket::new_v4().map_err(ChannelError::from)?;
        socket
            .bind(SocketAddrV4::new(self.config.origin_ip, 0).into())
            .map_err(ChannelError::from)?;
        // Dropping the socket must reset, not FIN with a stale sequence number.
        socket
            .set_linger(Some(Duration::ZERO))
            .map_err(ChannelError::from)?;
        let friend = SocketAddrV4::new(self.config.friend_ip, self.config.friend_port);
        let stream = bounded(
            "dial",
            self.config.dial_timeout(),
            &self.shutdown,
            socket.connect(friend.into()),
        )
        .await?
        .map_err(ChannelError::from)?;
        let dialed_at = Instant::now();

        let origin_port = stream.local_addr().map_err(ChannelError::from)?.port();
        let mut lease = self.replies.acquire(origin_port, false).await?;

        let synack = self.await_synack(&mut lease).await?;
        let mut carrier = Carrier::new(
            &self.config,
            origin_port,
            &synack,
            dialed_at,
            self.embedder.needs_timestamp(),
        )
        .map_err(ChannelError::from)?;
        tracing::debug!(
            origin_port,
            seq = carrier.tcp.seq,
            ack = carrier.tcp.ack,
            "carrier taken over"
        );

        let mut state = CodecState::new(&mask);
        let mut units_sent = 0usize;
        let result = self
            .send_units(&packed, &mut carrier, &mut state, &mut units_sent)
            .await;
        let transferred = mask.sent_size(units_sent)? as u64;
        result.map_err(|e| e.after(transferred))?;

        if self.config.delimiter == Delimiter::Protocol {
            self.send_terminator(&mask, &mut carrier, &mut state)
                .await
                .map_err(|e| e.after(transferred))?;
        }

        let (ip, tcp) = carrier.fin();
        self.transmit(&ip, &tcp, &[])
            .await
            .map_err(|e| e.after(transferred))?;

        // The peer answers with FIN/ACK or a reset; either is fine, and so
        // is silence.
        let close = PacketWait::new("close", Some(CLOSE_WAIT));
        loop {
            match close.next(&mut lease, &self.shutdown).await {
                Ok(p) if p.tcp.is(TcpFlags::ACK) && p.tcp.flags.intersects(CLOSING) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(origin_port, error = %e, "no close from peer");
                    break;
                }
            }
        }

        drop(lease);
        drop(stream);
        tracing::debug!(origin_port, bytes = transferred, "send finished");
        Ok(transferred)
    }

    async fn await_synack(&self, lease: &mut PortLease) -> Result<CapturedPacket, ChannelError> {
        let wait = PacketWait::new("handshake", Some(SYNACK_WAIT));
        loop {
            let packet = wait.next(lease, &self.shutdown).await.map_err(|e| match e {
                ChannelError::Timeout(_) => ChannelError::Protocol(ProtocolError::NoSynAck),
                other => other,
            })?;
            if packet.tcp.is(TcpFlags::SYN | TcpFlags::ACK) {
                return Ok(packet);
            }
        }
    }

    async fn send_units(
        &self,
        packed: &[u8],
        carrier: &mut Carrier,
        state: &mut CodecState,
        units_sent: &mut usize,
    ) -> Result<(), ChannelError> {
        for &unit in packed {
            loop {
                let (mut ip, mut tcp) = carrier.headers();
                let placement = self.embedder.set_unit(&mut ip, &mut tcp, unit, state)?;
                state.advance();

                pause(placement.delay, &self.shutdown).await?;
                self.transmit(&ip, &tcp, &CARRIER_PAYLOAD).await?;
                carrier.sent(&tcp, CARRIER_PAYLOAD.len());

                tracing::trace!(
                    port = tcp.src_port,
                    unit = %hex::encode([unit]),
                    consumed = placement.consumed,
                    "carrier packet sent"
                );
                if placement.consumed {
                    *units_sent += 1;
                    break;
                }
            }
        }
        Ok(())
    }

    /// One more packet shaped like data but without PSH.
    async fn send_terminator(
        &self,
        mask: &Mask,
        carrier: &mut Carrier,
        state: &mut CodecState,
    ) -> Result<(), ChannelError> {
        let (mut ip, mut tcp) = carrier.headers();
        let filler = rand::random::<u8>() & mask.slot(state.mask_index);
        let placement = self.embedder.set_unit(&mut ip, &mut tcp, filler, state)?;
        state.advance();
        tcp.flags.remove(TcpFlags::PSH);

        pause(placement.delay, &self.shutdown).await?;
        self.transmit(&ip, &tcp, &CARRIER_PAYLOAD).await?;
        carrier.sent(&tcp, CARRIER_PAYLOAD.len());
        Ok(())
    }

    /// Build and write one packet under the write timeout.
    async fn transmit(
        &self,
        ip: &Ipv4Header,
        tcp: &TcpHeader,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let datagram = build_segment(ip, tcp, payload)?;
        bounded(
            "write",
            self.config.write_timeout(),
            &self.shutdown,
            self.raw.send_to(&datagram, ip.dst),
        )
        .await??;
        Ok(())
    }
}
