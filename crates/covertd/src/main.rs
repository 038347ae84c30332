//! covertd — command-line endpoint for a handshake covert channel.
//!
//!   covertd send <message>     send one message to the friend
//!   covertd receive [size]     receive one message (default 1024 bytes)
//!   covertd listen [size]      receive messages until Ctrl-C
//!
//! Configuration comes from the usual file and COVERT_* overrides; see
//! `covert_core::config`. Raw sockets need CAP_NET_RAW.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use covert_channel::{Channel, HandshakeChannel};
use covert_core::CovertConfig;

const DEFAULT_RECEIVE_SIZE: usize = 1024;

enum Command {
    Send(Vec<u8>),
    Receive(usize),
    Listen(usize),
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let command = args.next().unwrap_or_default();
    let size = |arg: Option<String>| -> Result<usize> {
        match arg {
            Some(s) => s.parse().with_context(|| format!("invalid size '{s}'")),
            None => Ok(DEFAULT_RECEIVE_SIZE),
        }
    };
    match command.as_str() {
        "send" => {
            let rest: Vec<String> = args.collect();
            if rest.is_empty() {
                bail!("usage: covertd send <message>");
            }
            Ok(Command::Send(rest.join(" ").into_bytes()))
        }
        "receive" => Ok(Command::Receive(size(args.next())?)),
        "listen" => Ok(Command::Listen(size(args.next())?)),
        other => bail!("unknown command '{other}'; expected send, receive or listen"),
    }
}

fn print_message(buf: &[u8]) {
    match std::str::from_utf8(buf) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{}", hex::encode(buf)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let command = parse_args(std::env::args().skip(1))?;

    if let Err(e) = CovertConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CovertConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CovertConfig::default()
    });
    tracing::info!(
        path = %CovertConfig::file_path().display(),
        embedder = %config.channel.embedder,
        "config loaded"
    );

    let channel = Arc::new(
        HandshakeChannel::open(&config)
            .await
            .context("failed to open channel (raw sockets need CAP_NET_RAW)")?,
    );

    let closer = channel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted");
            if let Err(e) = closer.close() {
                tracing::warn!(error = %e, "close failed");
            }
        }
    });

    match command {
        Command::Send(message) => {
            let sent = channel
                .send(&message)
                .await
                .context("send failed")?;
            tracing::info!(bytes = sent, "message sent");
        }
        Command::Receive(size) => {
            let mut buf = vec![0u8; size];
            match channel.receive(&mut buf).await {
                Ok(n) => print_message(&buf[..n as usize]),
                Err(partial) => {
                    print_message(&buf[..partial.transferred as usize]);
                    return Err(partial).context("receive failed");
                }
            }
        }
        Command::Listen(size) => loop {
            let mut buf = vec![0u8; size];
            match channel.receive(&mut buf).await {
                Ok(n) => print_message(&buf[..n as usize]),
                Err(partial) if partial.source.is_cancelled() => break,
                Err(partial) => {
                    tracing::warn!(
                        error = %partial.source,
                        bytes = partial.transferred,
                        "receive failed"
                    );
                    if partial.transferred > 0 {
                        print_message(&buf[..partial.transferred as usize]);
                    }
                }
            }
        },
    }

    channel.close()?;
    Ok(())
}
