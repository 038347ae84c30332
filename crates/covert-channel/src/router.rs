//! Port router — groups captured packets into per-port queues.
//!
//! One task owns the port table. The read loop feeds it packets and
//! sends/receives talk to it through requests; nothing else touches the
//! table. A store is created by a SYN for an unseen port or by a caller
//! acquiring the port first. Callers take the store's receiving half and
//! hand it back on release.
//!
//! Capacity: at most `max_ports` stores. When full, the unclaimed store
//! with the fewest queued packets is evicted. Claimed stores are never
//! evicted; if every store is claimed the newcomer is refused.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::error::ChannelError;
use crate::raw::CapturedPacket;
use crate::shutdown::Shutdown;
use covert_core::TcpFlags;

/// Which port of a packet selects its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteBy {
    /// Inbound messages, keyed by the friend's ephemeral port.
    Source,
    /// Replies to our sends, keyed by our ephemeral port.
    Destination,
}

impl RouteBy {
    fn port(self, packet: &CapturedPacket) -> u16 {
        match self {
            RouteBy::Source => packet.tcp.src_port,
            RouteBy::Destination => packet.tcp.dst_port,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouterLimits {
    pub max_ports: usize,
    pub queue_depth: usize,
    pub inbound_depth: usize,
}

/// One row of a router snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreInfo {
    pub port: u16,
    pub queued: usize,
    pub claimed: bool,
}

enum Request {
    Acquire {
        port: u16,
        reply: oneshot::Sender<Option<mpsc::Receiver<CapturedPacket>>>,
    },
    Release {
        port: u16,
        keep_next: bool,
        queue: mpsc::Receiver<CapturedPacket>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<StoreInfo>>,
    },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap handle to a running router task.
#[derive(Clone)]
pub struct PacketRouter {
    name: &'static str,
    packets: mpsc::Sender<CapturedPacket>,
    requests: mpsc::UnboundedSender<Request>,
}

impl PacketRouter {
    /// Start the router task. It exits when `shutdown` fires.
    pub fn spawn(
        name: &'static str,
        route_by: RouteBy,
        limits: RouterLimits,
        shutdown: Shutdown,
    ) -> Self {
        let (packets, packet_rx) = mpsc::channel(limits.inbound_depth);
        let (requests, request_rx) = mpsc::unbounded_channel();
        let table = PortTable::new(name, route_by, limits);
        tokio::spawn(table.run(packet_rx, request_rx, shutdown));
        Self {
            name,
            packets,
            requests,
        }
    }

    /// Hand a packet to the router without waiting. Returns false if the
    /// router's inbound queue is full or the router has stopped.
    pub fn dispatch(&self, packet: CapturedPacket) -> bool {
        match self.packets.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(router = self.name, "router inbound queue full, dropping packet");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Claim the store for `port`, creating it if needed. When the lease
    /// drops, `keep_next` decides whether a buffered follow-up message
    /// survives the release.
    pub async fn acquire(&self, port: u16, keep_next: bool) -> Result<PortLease, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Acquire { port, reply })
            .map_err(|_| ChannelError::Cancelled)?;
        match rx.await {
            Ok(Some(queue)) => Ok(PortLease {
                port,
                keep_next,
                queue: Some(queue),
                requests: self.requests.clone(),
            }),
            Ok(None) => Err(ChannelError::Capacity { port }),
            Err(_) => Err(ChannelError::Cancelled),
        }
    }

    /// Current stores, sorted by port.
    pub async fn snapshot(&self) -> Result<Vec<StoreInfo>, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Snapshot { reply })
            .map_err(|_| ChannelError::Cancelled)?;
        rx.await.map_err(|_| ChannelError::Cancelled)
    }
}

/// A claimed port store. Releases itself on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    keep_next: bool,
    queue: Option<mpsc::Receiver<CapturedPacket>>,
    requests: mpsc::UnboundedSender<Request>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next packet for this port in arrival order. `None` once the router
    /// has stopped.
    pub async fn recv(&mut self) -> Option<CapturedPacket> {
        match self.queue.as_mut() {
            Some(queue) => queue.recv().await,
            None => None,
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            // A stopped router has nothing left to release.
            let _ = self.requests.send(Request::Release {
                port: self.port,
                keep_next: self.keep_next,
                queue,
            });
        }
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

struct PortStore {
    tx: mpsc::Sender<CapturedPacket>,
    /// Present until a caller claims the store.
    rx: Option<mpsc::Receiver<CapturedPacket>>,
    claimed: bool,
}

impl PortStore {
    fn new(depth: usize, claimed: bool) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        Self {
            tx,
            rx: Some(rx),
            claimed,
        }
    }

    fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

struct PortTable {
    name: &'static str,
    route_by: RouteBy,
    limits: RouterLimits,
    stores: HashMap<u16, PortStore>,
}

impl PortTable {
    fn new(name: &'static str, route_by: RouteBy, limits: RouterLimits) -> Self {
        Self {
            name,
            route_by,
            limits,
            stores: HashMap::new(),
        }
    }

    async fn run(
        mut self,
        mut packets: mpsc::Receiver<CapturedPacket>,
        mut requests: mpsc::UnboundedReceiver<Request>,
        shutdown: Shutdown,
    ) {
        tracing::debug!(router = self.name, "port router started");
        loop {
            // Packets first, so a request sees every packet queued before it.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(packet) = packets.recv() => self.dispatch(packet),
                Some(request) = requests.recv() => self.handle(request),
                else => break,
            }
        }
        tracing::debug!(router = self.name, "port router stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Acquire { port, reply } => {
                let _ = reply.send(self.acquire(port));
            }
            Request::Release {
                port,
                keep_next,
                queue,
            } => self.release(port, keep_next, queue),
            Request::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn dispatch(&mut self, packet: CapturedPacket) {
        let port = self.route_by.port(&packet);

        if let Some(store) = self.stores.get(&port) {
            match store.tx.try_send(packet) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(router = self.name, port, "port store full, dropping packet");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::trace!(
                        router = self.name,
                        port,
                        "port store closing, dropping packet"
                    );
                }
            }
            return;
        }

        // Only a SYN can open a message.
        if !packet.tcp.is(TcpFlags::SYN) {
            tracing::trace!(router = self.name, port, "no store and not a SYN, dropping");
            return;
        }
        if !self.make_room() {
            tracing::warn!(router = self.name, port, "all port stores claimed, dropping SYN");
            return;
        }

        let store = PortStore::new(self.limits.queue_depth, false);
        let _ = store.tx.try_send(packet);
        self.stores.insert(port, store);
        tracing::trace!(router = self.name, port, "port store opened by SYN");
    }

    fn acquire(&mut self, port: u16) -> Option<mpsc::Receiver<CapturedPacket>> {
        if let Some(store) = self.stores.get_mut(&port) {
            store.claimed = true;
            let queue = store.rx.take();
            if queue.is_none() {
                tracing::warn!(router = self.name, port, "port already claimed");
            }
            return queue;
        }

        if !self.make_room() {
            tracing::warn!(router = self.name, port, "no port store available");
            return None;
        }
        let mut store = PortStore::new(self.limits.queue_depth, true);
        let queue = store.rx.take();
        self.stores.insert(port, store);
        queue
    }

    fn release(&mut self, port: u16, keep_next: bool, mut queue: mpsc::Receiver<CapturedPacket>) {
        self.stores.remove(&port);
        if !keep_next {
            return;
        }

        // Skip the finished message; anything from the next SYN on belongs
        // to a message sent straight after it from the same port.
        let mut next = None;
        while let Ok(packet) = queue.try_recv() {
            if next.is_none() && packet.tcp.is(TcpFlags::SYN) {
                next = Some(PortStore::new(self.limits.queue_depth, false));
            }
            if let Some(store) = &next {
                let _ = store.tx.try_send(packet);
            }
        }

        if let Some(store) = next {
            tracing::debug!(
                router = self.name,
                port,
                queued = store.queued(),
                "kept trailing message"
            );
            self.stores.insert(port, store);
        }
    }

    /// Ensure there is space for one more store, evicting if needed.
    fn make_room(&mut self) -> bool {
        self.stores.len() < self.limits.max_ports || self.evict_unused()
    }

    /// Evict the unclaimed store holding the fewest packets.
    fn evict_unused(&mut self) -> bool {
        let victim = self
            .stores
            .iter()
            .filter(|(_, store)| !store.claimed)
            .min_by_key(|(port, store)| (store.queued(), **port))
            .map(|(port, _)| *port);

        match victim {
            Some(port) => {
                if let Some(store) = self.stores.remove(&port) {
                    tracing::info!(
                        router = self.name,
                        port,
                        queued = store.queued(),
                        "evicted port store"
                    );
                }
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<StoreInfo> {
        let mut rows: Vec<StoreInfo> = self
            .stores
            .iter()
            .map(|(port, store)| StoreInfo {
                port: *port,
                queued: store.queued(),
                claimed: store.claimed,
            })
            .collect();
        rows.sort_by_key(|r| r.port);
        rows
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
