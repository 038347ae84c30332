//! Raw IPv4/TCP socket with the IP header supplied by us.
//!
//! Reads return every TCP datagram the host sees, headers included. Writes
//! are serialised behind a mutex; concurrent raw writes from several sends
//! have been seen to corrupt each other.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;
use tokio::time::Instant;

use covert_core::wire::{parse_segment, Ipv4Header, TcpHeader, WireError};

/// Largest IPv4 datagram.
pub const MAX_DATAGRAM: usize = 65_535;

/// A parsed packet stamped with its arrival time. Owns all of its data.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub ip: Ipv4Header,
    pub tcp: TcpHeader,
    pub payload_len: usize,
    pub captured_at: Instant,
}

impl CapturedPacket {
    pub fn parse(buf: &[u8], captured_at: Instant) -> Result<Self, WireError> {
        let segment = parse_segment(buf)?;
        Ok(Self {
            ip: segment.ip,
            tcp: segment.tcp,
            payload_len: segment.payload_len,
            captured_at,
        })
    }
}

pub struct RawSocket {
    fd: AsyncFd<Socket>,
    write: Mutex<()>,
}

impl RawSocket {
    /// Open the socket. Needs CAP_NET_RAW.
    pub fn open() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))?;
        socket.set_header_included(true)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            fd: AsyncFd::new(socket)?,
            write: Mutex::new(()),
        })
    }

    /// Read one datagram into `buf`.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let read = guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            });
            match read {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Send a complete datagram built by [`covert_core::wire::build_segment`].
    pub async fn send_to(&self, datagram: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let _serial = self.write.lock().await;
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(datagram, &addr)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Stop both directions now; pending and later reads return nothing.
    /// The descriptor itself closes on drop.
    pub fn shutdown(&self) -> io::Result<()> {
        shutdown_quietly(self.fd.get_ref())
    }
}

/// `shutdown(2)` on an unconnected socket reports ENOTCONN after it has
/// already cut the socket off; only other errors matter.
pub(crate) fn shutdown_quietly(socket: &Socket) -> io::Result<()> {
    match socket.shutdown(std::net::Shutdown::Both) {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl std::fmt::Debug for RawSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSocket").finish_non_exhaustive()
    }
}
