//! Handshake channel — covert messages inside camouflaged TCP exchanges.
//!
//! Every message rides its own real TCP connection: the sender dials, the
//! kernels complete a genuine three-way handshake, and from then on the
//! sender writes raw packets with the negotiated sequence numbers and the
//! covert data in their headers. The receiver watches the raw socket for
//! packets from the dialing port and decodes them.
//!
//! Two background tasks run per channel:
//!   read loop   — raw socket → inbound router (messages to us) or reply
//!                 router (answers to our sends)
//!   accept loop — listener → accepted-connection queue
//!
//! Both stop when the channel closes.

mod receive;
mod send;

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use covert_core::{ChannelConfig, CovertConfig, FieldEmbedder};

use crate::error::{ChannelError, Partial, ProtocolError};
use crate::raw::{shutdown_quietly, CapturedPacket, RawSocket, MAX_DATAGRAM};
use crate::router::{PacketRouter, RouteBy, RouterLimits, StoreInfo};
use crate::shutdown::Shutdown;
use crate::Channel;

/// Zero-filled payload every carrier data packet holds.
const CARRIER_PAYLOAD: [u8; 5] = [0; 5];

/// A carrier connection waiting for a receive.
struct AcceptedConn {
    stream: TcpStream,
    /// The friend's ephemeral port, which keys its packets.
    friend_port: u16,
}

struct Inner {
    config: ChannelConfig,
    embedder: Arc<dyn FieldEmbedder>,
    raw: RawSocket,
    listener: TcpListener,
    inbound: PacketRouter,
    replies: PacketRouter,
    accepted: Mutex<mpsc::Receiver<AcceptedConn>>,
    shutdown: Shutdown,
}

pub struct HandshakeChannel {
    inner: Arc<Inner>,
}

impl HandshakeChannel {
    /// Open the raw socket and listener and start the background loops.
    pub async fn open(config: &CovertConfig) -> Result<Self, ChannelError> {
        config.validate()?;
        let channel = config.channel.clone();

        let embedder = channel.embedder.build(channel.temporal_midpoint());
        // The carrier's sequence numbers belong to the handshake.
        if embedder.rewrites_sequence() {
            return Err(ProtocolError::UnsupportedEmbedder(channel.embedder).into());
        }

        let raw = RawSocket::open()?;
        let listener =
            TcpListener::bind(SocketAddrV4::new(channel.origin_ip, channel.origin_port)).await?;

        let shutdown = Shutdown::new();
        let limits = RouterLimits {
            max_ports: config.limits.max_ports,
            queue_depth: config.limits.port_queue_depth,
            inbound_depth: config.limits.inbound_queue_depth,
        };
        let inbound = PacketRouter::spawn("inbound", RouteBy::Source, limits, shutdown.clone());
        let replies =
            PacketRouter::spawn("replies", RouteBy::Destination, limits, shutdown.clone());
        let (accept_tx, accept_rx) = mpsc::channel(config.limits.accept_queue_depth);

        tracing::info!(
            friend = %SocketAddrV4::new(channel.friend_ip, channel.friend_port),
            origin = %SocketAddrV4::new(channel.origin_ip, channel.origin_port),
            embedder = %channel.embedder,
            delimiter = ?channel.delimiter,
            "handshake channel open"
        );

        let inner = Arc::new(Inner {
            config: channel,
            embedder,
            raw,
            listener,
            inbound,
            replies,
            accepted: Mutex::new(accept_rx),
            shutdown,
        });

        tokio::spawn(read_loop(inner.clone()));
        tokio::spawn(accept_loop(inner.clone(), accept_tx));

        Ok(Self { inner })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Port stores of the inbound and reply routers.
    pub async fn router_snapshot(&self) -> Result<(Vec<StoreInfo>, Vec<StoreInfo>), ChannelError> {
        let inbound = self.inner.inbound.snapshot().await?;
        let replies = self.inner.replies.snapshot().await?;
        Ok((inbound, replies))
    }
}

impl Channel for HandshakeChannel {
    async fn send(&self, data: &[u8]) -> Result<u64, Partial> {
        self.inner.send(data).await
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<u64, Partial> {
        self.inner.receive(buf).await
    }

    fn close(&self) -> Result<(), ChannelError> {
        if !self.inner.shutdown.trigger() {
            return Ok(());
        }
        tracing::info!("handshake channel closing");
        self.inner.release()
    }
}

impl Inner {
    /// Cut off the listener and the raw socket. Waiters have already been
    /// cancelled; the descriptors close when the loops let go of `Inner`.
    fn release(&self) -> Result<(), ChannelError> {
        let listener = shutdown_quietly(&SockRef::from(&self.listener));
        let raw = self.raw.shutdown();
        if let Err(e) = &listener {
            tracing::warn!(error = %e, "listener shutdown failed");
        }
        if let Err(e) = &raw {
            tracing::warn!(error = %e, "raw socket shutdown failed");
        }
        listener?;
        raw?;
        Ok(())
    }
}

impl Drop for HandshakeChannel {
    fn drop(&mut self) {
        if self.inner.shutdown.trigger() {
            let _ = self.inner.release();
        }
    }
}

// ── Background loops ──────────────────────────────────────────────────────────

/// Route every TCP datagram from the friend to the router that wants it.
async fn read_loop(inner: Arc<Inner>) {
    let friend_ip = inner.config.friend_ip;
    let friend_port = inner.config.friend_port;
    let origin_port = inner.config.origin_port;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    tracing::info!("raw read loop starting");

    loop {
        let len = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            result = inner.raw.recv(&mut buf) => match result {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!(error = %e, "raw recv failed");
                    continue;
                }
            },
        };

        let packet = match CapturedPacket::parse(&buf[..len], Instant::now()) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!(error = %e, "ignoring unparseable datagram");
                continue;
            }
        };

        if packet.ip.src != friend_ip {
            continue;
        }

        tracing::trace!(
            src_port = packet.tcp.src_port,
            dst_port = packet.tcp.dst_port,
            flags = ?packet.tcp.flags,
            "captured"
        );

        if packet.tcp.dst_port == origin_port {
            inner.inbound.dispatch(packet);
        } else if packet.tcp.src_port == friend_port {
            inner.replies.dispatch(packet);
        }
    }

    tracing::info!("raw read loop stopped");
}

/// Accept carrier connections from the friend and queue them for receives.
async fn accept_loop(inner: Arc<Inner>, queue: mpsc::Sender<AcceptedConn>) {
    let friend_ip = inner.config.friend_ip;

    tracing::info!("carrier accept loop starting");

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            result = inner.listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let peer = match peer {
            SocketAddr::V4(v4) if *v4.ip() == friend_ip => v4,
            other => {
                tracing::debug!(peer = %other, "rejecting carrier from unexpected peer");
                continue;
            }
        };

        let conn = AcceptedConn {
            stream,
            friend_port: peer.port(),
        };
        match queue.try_send(conn) {
            Ok(()) => tracing::debug!(friend_port = peer.port(), "carrier accepted"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(friend_port = peer.port(), "accept queue full, dropping carrier");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    // Close carriers nobody will receive on.
    let mut pending = inner.accepted.lock().await;
    let mut dropped = 0usize;
    while let Ok(conn) = pending.try_recv() {
        drop(conn);
        dropped += 1;
    }
    tracing::info!(dropped, "carrier accept loop stopped");
}
