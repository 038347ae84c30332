//! Composite waits: every blocking step races its own event, an optional
//! timeout and channel cancellation. Cancellation wins ties.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::error::ChannelError;
use crate::raw::CapturedPacket;
use crate::router::PortLease;
use crate::shutdown::Shutdown;

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Run `fut` unless `limit` passes or the channel closes first.
/// A `None` limit waits forever.
pub async fn bounded<F: Future>(
    what: &'static str,
    limit: Option<Duration>,
    shutdown: &Shutdown,
    fut: F,
) -> Result<F::Output, ChannelError> {
    let deadline = limit.map(|d| Instant::now() + d);
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(ChannelError::Cancelled),
        out = fut => Ok(out),
        _ = sleep_opt(deadline) => Err(ChannelError::Timeout(what)),
    }
}

/// Sleep for `delay`, cut short by cancellation.
pub async fn pause(delay: Duration, shutdown: &Shutdown) -> Result<(), ChannelError> {
    if delay.is_zero() {
        return if shutdown.is_triggered() {
            Err(ChannelError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(ChannelError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Packet wait whose deadline is measured from the last valid packet,
/// not from when waiting began. Unrelated packets do not extend it.
#[derive(Debug)]
pub struct PacketWait {
    what: &'static str,
    limit: Option<Duration>,
    deadline: Option<Instant>,
}

impl PacketWait {
    pub fn new(what: &'static str, limit: Option<Duration>) -> Self {
        Self {
            what,
            limit,
            deadline: limit.map(|d| Instant::now() + d),
        }
    }

    /// Restart the clock after a valid packet.
    pub fn touch(&mut self) {
        self.deadline = self.limit.map(|d| Instant::now() + d);
    }

    pub async fn next(
        &self,
        lease: &mut PortLease,
        shutdown: &Shutdown,
    ) -> Result<CapturedPacket, ChannelError> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(ChannelError::Cancelled),
            packet = lease.recv() => packet.ok_or(ChannelError::Cancelled),
            _ = sleep_opt(self.deadline) => Err(ChannelError::Timeout(self.what)),
        }
    }
}
