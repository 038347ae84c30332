use std::collections::HashSet;

use covert_channel::Channel;
use covert_core::{Delimiter, EmbedderKind};

use crate::*;

/// Send `message` alice → bob and return what bob received.
async fn exchange(pair: &Pair, message: &[u8], capacity: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; capacity];
    let (sent, received) = within("exchange", async {
        tokio::join!(pair.alice.send(message), pair.bob.receive(&mut buf))
    })
    .await?;
    let sent = sent.context("send")?;
    assert_eq!(sent, message.len() as u64);
    let n = received.context("receive")? as usize;
    buf.truncate(n);
    Ok(buf)
}

/// Every embedder that works on a real carrier moves a message intact.
#[tokio::test]
async fn test_round_trip_every_embedder() {
    if !skip_unless_ready() {
        return;
    }

    for kind in EmbedderKind::ALL {
        if kind == EmbedderKind::Sequence {
            continue;
        }
        let pair = open_pair(|c| c.embedder = kind).await.expect("pair should open");
        // The timing embedders pay a delay per bit; keep their message short.
        let message: &[u8] = match kind {
            EmbedderKind::Temporal | EmbedderKind::EcnTemporal | EmbedderKind::Frequency => {
                b"ok"
            }
            _ => b"covert hello",
        };

        let got = exchange(&pair, message, 64)
            .await
            .unwrap_or_else(|e| panic!("{kind} exchange failed: {e:#}"));
        assert_eq!(got, message, "{kind} corrupted the message");
        println!("{kind}: {} bytes ok", got.len());
    }
}

#[tokio::test]
async fn test_buffer_delimiter_ends_at_carrier_close() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|c| c.delimiter = Delimiter::Buffer).await.expect("pair");
    let got = exchange(&pair, b"until fin", 64).await.expect("exchange");
    assert_eq!(got, b"until fin");
}

/// Two sends in flight at once land as two whole messages.
#[tokio::test]
async fn test_concurrent_sends_stay_separate() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|_| {}).await.expect("pair");

    let receive_two = async {
        let mut got = HashSet::new();
        for _ in 0..2 {
            let mut buf = [0u8; 16];
            let n = pair.bob.receive(&mut buf).await.expect("receive") as usize;
            got.insert(buf[..n].to_vec());
        }
        got
    };
    let (a, b, got) = within("concurrent exchange", async {
        tokio::join!(pair.alice.send(b"AAAA"), pair.alice.send(b"BBBB"), receive_two)
    })
    .await
    .expect("exchange");

    assert_eq!(a.expect("send A"), 4);
    assert_eq!(b.expect("send B"), 4);
    let want: HashSet<Vec<u8>> = [b"AAAA".to_vec(), b"BBBB".to_vec()].into_iter().collect();
    assert_eq!(got, want);
}

#[tokio::test]
async fn test_messages_flow_both_ways() {
    if !skip_unless_ready() {
        return;
    }

    let pair = open_pair(|_| {}).await.expect("pair");
    let got = exchange(&pair, b"ping", 16).await.expect("alice to bob");
    assert_eq!(got, b"ping");

    let mut buf = [0u8; 16];
    let (sent, received) = within("reply", async {
        tokio::join!(pair.bob.send(b"pong"), pair.alice.receive(&mut buf))
    })
    .await
    .expect("reply");
    assert_eq!(sent.expect("send"), 4);
    let n = received.expect("receive") as usize;
    assert_eq!(&buf[..n], b"pong");
}
