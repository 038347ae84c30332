use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use covert_channel::{Channel, ChannelError, HandshakeChannel, ProtocolError};
use covert_core::{CovertConfig, Delimiter, EmbedderKind};

use crate::*;

#[tokio::test]
async fn test_sequence_embedder_rejected_at_open() {
    if !skip_unless_ready() {
        return;
    }

    let mut config = CovertConfig::default();
    config.channel.origin_port = free_port().expect("port");
    config.channel.embedder = EmbedderKind::Sequence;

    match HandshakeChannel::open(&config).await {
        Err(ChannelError::Protocol(ProtocolError::UnsupportedEmbedder(kind))) => {
            assert_eq!(kind, EmbedderKind::Sequence);
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("sequence embedder should be rejected"),
    }
}

#[tokio::test]
async fn test_close_unblocks_pending_receive() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|_| {}).await.expect("pair");

    let started = Instant::now();
    let mut buf = [0u8; 16];
    let (received, ()) = tokio::join!(pair.bob.receive(&mut buf), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        pair.bob.close().expect("close");
    });

    let err = received.expect_err("receive should fail after close");
    assert!(err.source.is_cancelled(), "got {err}");
    assert_eq!(err.transferred, 0);
    assert!(started.elapsed() < Duration::from_secs(1));

    // Nothing works on a closed channel.
    assert!(pair.bob.receive(&mut buf).await.unwrap_err().source.is_cancelled());
    assert!(pair.bob.send(b"late").await.unwrap_err().source.is_cancelled());
}

/// In buffer mode a message longer than the buffer fails, keeping what fit.
#[tokio::test]
async fn test_buffer_mode_overflow_reports_full() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|c| c.delimiter = Delimiter::Buffer).await.expect("pair");
    let mut buf = [0u8; 4];
    let (sent, received) = within("overflow", async {
        tokio::join!(pair.alice.send(b"0123456789abcdef"), pair.bob.receive(&mut buf))
    })
    .await
    .expect("exchange");

    let err = received.expect_err("receive should overflow");
    assert!(
        matches!(err.source, ChannelError::BufferFull { len: 4 }),
        "got {err}"
    );
    assert_eq!(err.transferred, 4);
    assert_eq!(&buf, b"0123");
    // Raw writes do not notice the receiver giving up.
    assert_eq!(sent.expect("send"), 16);
}

/// In protocol mode a full buffer may wait for the terminator, but one
/// unit more fails the receive.
#[tokio::test]
async fn test_protocol_mode_overflow_reports_full() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|c| c.delimiter = Delimiter::Protocol).await.expect("pair");
    let mut buf = [0u8; 4];
    let (sent, received) = within("overflow", async {
        tokio::join!(pair.alice.send(b"0123456789abcdef"), pair.bob.receive(&mut buf))
    })
    .await
    .expect("exchange");

    let err = received.expect_err("receive should overflow");
    assert!(
        matches!(err.source, ChannelError::BufferFull { len: 4 }),
        "got {err}"
    );
    assert_eq!(err.transferred, 4);
    assert_eq!(&buf, b"0123");
    assert_eq!(sent.expect("send"), 16);
}

#[tokio::test]
async fn test_protocol_mode_exact_fit() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|c| c.delimiter = Delimiter::Protocol).await.expect("pair");
    let mut buf = [0u8; 4];
    let (sent, received) = within("exact fit", async {
        tokio::join!(pair.alice.send(b"0123"), pair.bob.receive(&mut buf))
    })
    .await
    .expect("exchange");

    assert_eq!(sent.expect("send"), 4);
    assert_eq!(received.expect("receive"), 4);
    assert_eq!(&buf, b"0123");
}

/// A protocol-mode receiver takes a FIN as the end of the message even
/// when no terminator came first.
#[tokio::test]
async fn test_protocol_mode_accepts_fin_without_terminator() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair_split(
        |c| c.delimiter = Delimiter::Buffer,
        |c| c.delimiter = Delimiter::Protocol,
    )
    .await
    .expect("pair");
    let mut buf = [0u8; 16];
    let (sent, received) = within("fin only", async {
        tokio::join!(pair.alice.send(b"fin only"), pair.bob.receive(&mut buf))
    })
    .await
    .expect("exchange");

    assert_eq!(sent.expect("send"), 8);
    let n = received.expect("receive") as usize;
    assert_eq!(&buf[..n], b"fin only");
}

#[tokio::test]
async fn test_zero_length_buffer_returns_at_once() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|c| c.delimiter = Delimiter::Buffer).await.expect("pair");
    let mut empty = [0u8; 0];
    let n = tokio::time::timeout(Duration::from_secs(1), pair.bob.receive(&mut empty))
        .await
        .expect("zero-length receive should not wait for a sender")
        .expect("receive");
    assert_eq!(n, 0);
}

/// The read timeout runs from the last valid packet: many short gaps in a
/// row are fine, one long gap ends the receive with what was decoded.
#[tokio::test]
async fn test_read_timeout_counts_from_last_valid_packet() {
    if !skip_unless_ready() {
        return;
    }

    // A 0 bit waits 200 ms, a 1 bit 600 ms; the receiver gives up after 500.
    let pair = open_pair(|c| {
        c.embedder = EmbedderKind::Temporal;
        c.temporal_midpoint_ms = 400;
        c.read_timeout_ms = 500;
    })
    .await
    .expect("pair");

    let mut buf = [0xAAu8; 4];
    let started = Instant::now();
    let (_, received) = within("stalled exchange", async {
        tokio::join!(pair.alice.send(&[0x00, 0x80]), pair.bob.receive(&mut buf))
    })
    .await
    .expect("exchange");

    let err = received.expect_err("receive should time out");
    assert!(matches!(err.source, ChannelError::Timeout("read")), "got {err}");
    assert_eq!(err.transferred, 1);
    assert_eq!(buf[0], 0x00);
    // Eight 200 ms gaps passed before the timeout.
    assert!(started.elapsed() > Duration::from_millis(1_500));
}

/// A send cut short still reports the bytes that fully went out.
#[tokio::test]
async fn test_cancelled_send_reports_partial_count() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|c| c.embedder = EmbedderKind::Temporal).await.expect("pair");
    // 25 ms per zero bit: about 200 ms per byte.
    let message = [0u8; 40];

    let (sent, ()) = within("cancelled send", async {
        tokio::join!(pair.alice.send(&message), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            pair.alice.close().expect("close");
        })
    })
    .await
    .expect("send should stop");

    let err = sent.expect_err("send should be cancelled");
    assert!(err.source.is_cancelled(), "got {err}");
    assert!(err.transferred > 0, "no bytes reported");
    assert!(err.transferred < message.len() as u64);
}

#[tokio::test]
async fn test_close_shuts_listener() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|_| {}).await.expect("pair");
    let port = pair.bob.config().origin_port;
    pair.bob.close().expect("close");

    let dial = tokio::time::timeout(
        Duration::from_secs(2),
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
    )
    .await;
    assert!(!matches!(dial, Ok(Ok(_))), "listener still accepting after close");
    pair.bob.close().expect("second close is a no-op");
}

#[tokio::test]
async fn test_send_without_listener_times_out() {
    if !skip_unless_ready() {
        return;
    }

    let mut config = CovertConfig::default();
    config.channel.origin_port = free_port().expect("port");
    config.channel.friend_port = free_port().expect("port");
    config.channel.dial_timeout_ms = 500;
    let channel = HandshakeChannel::open(&config).await.expect("open");

    let err = channel.send(b"nobody home").await.unwrap_err();
    assert_eq!(err.transferred, 0);
    assert!(
        matches!(err.source, ChannelError::Io(_) | ChannelError::Timeout("dial")),
        "got {err}"
    );
}
