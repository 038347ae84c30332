//! Covert channel integration test harness.
//!
//! Tests here open real raw sockets and exchange messages over loopback
//! between two channel endpoints in the same process. They need root or
//! CAP_NET_RAW:
//!
//!   sudo cargo test --test integration
//!
//! Without the privilege every test prints SKIP and returns. Each pair of
//! endpoints gets its own ports, so tests may run in parallel.

mod exchange;
mod failures;

use std::future::Future;
use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use anyhow::{Context, Result};

use covert_channel::raw::RawSocket;
use covert_channel::HandshakeChannel;
use covert_core::{ChannelConfig, CovertConfig};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for any single exchange in these tests.
pub const EXCHANGE_LIMIT: Duration = Duration::from_secs(20);

/// Check whether raw sockets can be opened here. Must run inside a runtime.
pub fn skip_unless_ready() -> bool {
    match RawSocket::open() {
        Ok(_) => true,
        Err(e) => {
            let euid = unsafe { libc::geteuid() };
            eprintln!("SKIP: raw sockets unavailable (euid {euid}): {e}");
            false
        }
    }
}

/// A loopback port nothing is listening on right now.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("bind a spare listener")?;
    Ok(listener.local_addr()?.port())
}

/// Two endpoints pointed at each other.
pub struct Pair {
    pub alice: HandshakeChannel,
    pub bob: HandshakeChannel,
}

/// Open a pair on loopback. `tune` adjusts the settings both sides share.
pub async fn open_pair(tune: impl Fn(&mut ChannelConfig)) -> Result<Pair> {
    open_pair_split(&tune, &tune).await
}

/// Open a pair whose two sides are tuned separately.
pub async fn open_pair_split(
    tune_alice: impl Fn(&mut ChannelConfig),
    tune_bob: impl Fn(&mut ChannelConfig),
) -> Result<Pair> {
    let alice_port = free_port()?;
    let bob_port = free_port()?;

    let endpoint = |origin_port: u16, friend_port: u16, tune: &dyn Fn(&mut ChannelConfig)| {
        let mut config = CovertConfig::default();
        config.channel.origin_port = origin_port;
        config.channel.friend_port = friend_port;
        config.channel.dial_timeout_ms = 2_000;
        config.channel.read_timeout_ms = 2_000;
        config.channel.write_timeout_ms = 2_000;
        tune(&mut config.channel);
        config
    };

    let alice = HandshakeChannel::open(&endpoint(alice_port, bob_port, &tune_alice))
        .await
        .context("open alice")?;
    let bob = HandshakeChannel::open(&endpoint(bob_port, alice_port, &tune_bob))
        .await
        .context("open bob")?;
    Ok(Pair { alice, bob })
}

/// Await `fut`, failing the test if it takes longer than the exchange limit.
pub async fn within<F: Future>(what: &str, fut: F) -> Result<F::Output> {
    tokio::time::timeout(EXCHANGE_LIMIT, fut)
        .await
        .with_context(|| format!("{what} did not finish in {EXCHANGE_LIMIT:?}"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pair_opens_and_closes() {
    if !skip_unless_ready() {
        return;
    }
    use covert_channel::Channel;

    let pair = open_pair(|_| {}).await.expect("pair should open");
    assert!(!pair.alice.is_closed());
    pair.alice.close().expect("close");
    pair.alice.close().expect("second close is a no-op");
    assert!(pair.alice.is_closed());
    assert!(!pair.bob.is_closed());
}
