//! Configuration for a covert channel endpoint.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $COVERT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/covert/config.toml
//!   3. ~/.config/covert/config.toml

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::embed::EmbedderKind;

/// Largest timeout accepted, in milliseconds.
pub const MAX_TIMEOUT_MS: u32 = u16::MAX as u32;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CovertConfig {
    pub channel: ChannelConfig,
    pub limits: LimitsConfig,
}

/// How the end of a message is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    /// The message ends when the receive buffer is full or the carrier closes.
    Buffer,
    /// The sender marks the end with a terminator packet.
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Address of the peer we exchange messages with.
    pub friend_ip: Ipv4Addr,
    /// Our own address; crafted packets carry it as source.
    pub origin_ip: Ipv4Addr,
    /// Port the friend listens on for carrier connections.
    pub friend_port: u16,
    /// Port we listen on for carrier connections.
    pub origin_port: u16,
    pub embedder: EmbedderKind,
    pub delimiter: Delimiter,
    /// Timeouts in milliseconds. 0 = wait forever.
    pub dial_timeout_ms: u32,
    pub accept_timeout_ms: u32,
    /// Longest silence between valid packets of one message.
    pub read_timeout_ms: u32,
    pub write_timeout_ms: u32,
    /// Gap separating a 0 from a 1 for the timing embedders.
    pub temporal_midpoint_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Port stores a router keeps at once.
    pub max_ports: usize,
    /// Packets buffered per port store.
    pub port_queue_depth: usize,
    /// Packets buffered between the read loop and a router.
    pub inbound_queue_depth: usize,
    /// Accepted carrier connections waiting for a receive.
    pub accept_queue_depth: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            friend_ip: Ipv4Addr::LOCALHOST,
            origin_ip: Ipv4Addr::LOCALHOST,
            friend_port: 8123,
            origin_port: 8124,
            embedder: EmbedderKind::Id,
            delimiter: Delimiter::Protocol,
            dial_timeout_ms: 500,
            accept_timeout_ms: 0,
            read_timeout_ms: 500,
            write_timeout_ms: 500,
            temporal_midpoint_ms: 50,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ports: 32,
            port_queue_depth: 512,
            inbound_queue_depth: 1024,
            accept_queue_depth: 32,
        }
    }
}

fn timeout(ms: u32) -> Option<Duration> {
    (ms != 0).then(|| Duration::from_millis(ms as u64))
}

impl ChannelConfig {
    pub fn dial_timeout(&self) -> Option<Duration> {
        timeout(self.dial_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        timeout(self.accept_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        timeout(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        timeout(self.write_timeout_ms)
    }

    pub fn temporal_midpoint(&self) -> Duration {
        Duration::from_millis(self.temporal_midpoint_ms as u64)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("covert")
}

fn home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CovertConfig {
    /// Load config: env vars → file → defaults, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CovertConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("COVERT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CovertConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Range checks applied after every load.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.channel;
        if c.friend_port == 0 {
            return Err(invalid("channel.friend_port", "must be non-zero"));
        }
        if c.origin_port == 0 {
            return Err(invalid("channel.origin_port", "must be non-zero"));
        }
        for (field, ms) in [
            ("channel.dial_timeout_ms", c.dial_timeout_ms),
            ("channel.accept_timeout_ms", c.accept_timeout_ms),
            ("channel.read_timeout_ms", c.read_timeout_ms),
            ("channel.write_timeout_ms", c.write_timeout_ms),
        ] {
            if ms > MAX_TIMEOUT_MS {
                return Err(invalid(field, format!("{ms} exceeds {MAX_TIMEOUT_MS}")));
            }
        }
        if c.temporal_midpoint_ms == 0 || c.temporal_midpoint_ms > MAX_TIMEOUT_MS {
            return Err(invalid(
                "channel.temporal_midpoint_ms",
                format!("must be in 1..={MAX_TIMEOUT_MS}"),
            ));
        }

        let l = &self.limits;
        for (field, n) in [
            ("limits.max_ports", l.max_ports),
            ("limits.port_queue_depth", l.port_queue_depth),
            ("limits.inbound_queue_depth", l.inbound_queue_depth),
            ("limits.accept_queue_depth", l.accept_queue_depth),
        ] {
            if n == 0 {
                return Err(invalid(field, "must be non-zero"));
            }
        }
        Ok(())
    }

    /// Apply COVERT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let c = &mut self.channel;
        if let Some(ip) = lookup("COVERT_CHANNEL__FRIEND_IP").and_then(|v| v.parse().ok()) {
            c.friend_ip = ip;
        }
        if let Some(ip) = lookup("COVERT_CHANNEL__ORIGIN_IP").and_then(|v| v.parse().ok()) {
            c.origin_ip = ip;
        }
        if let Some(p) = lookup("COVERT_CHANNEL__FRIEND_PORT").and_then(|v| v.parse().ok()) {
            c.friend_port = p;
        }
        if let Some(p) = lookup("COVERT_CHANNEL__ORIGIN_PORT").and_then(|v| v.parse().ok()) {
            c.origin_port = p;
        }
        if let Some(kind) = lookup("COVERT_CHANNEL__EMBEDDER").and_then(|v| v.parse().ok()) {
            c.embedder = kind;
        }
        if let Some(v) = lookup("COVERT_CHANNEL__DELIMITER") {
            match v.trim().to_ascii_lowercase().as_str() {
                "buffer" => c.delimiter = Delimiter::Buffer,
                "protocol" => c.delimiter = Delimiter::Protocol,
                _ => {}
            }
        }
        for (key, slot) in [
            ("COVERT_CHANNEL__DIAL_TIMEOUT_MS", &mut c.dial_timeout_ms),
            ("COVERT_CHANNEL__ACCEPT_TIMEOUT_MS", &mut c.accept_timeout_ms),
            ("COVERT_CHANNEL__READ_TIMEOUT_MS", &mut c.read_timeout_ms),
            ("COVERT_CHANNEL__WRITE_TIMEOUT_MS", &mut c.write_timeout_ms),
            ("COVERT_CHANNEL__TEMPORAL_MIDPOINT_MS", &mut c.temporal_midpoint_ms),
        ] {
            if let Some(ms) = lookup(key).and_then(|v| v.trim().parse().ok()) {
                *slot = ms;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        let config = CovertConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channel.friend_port, 8123);
        assert_eq!(config.channel.delimiter, Delimiter::Protocol);
        assert_eq!(config.channel.accept_timeout(), None);
        assert_eq!(
            config.channel.read_timeout(),
            Some(Duration::from_millis(500))
        );
        assert_eq!(config.limits.max_ports, 32);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let text = r#"
            [channel]
            friend_ip = "10.1.2.3"
            embedder = "ecntemporal"
            delimiter = "buffer"
        "#;
        let config: CovertConfig = toml::from_str(text).unwrap();
        assert_eq!(config.channel.friend_ip, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(config.channel.embedder, EmbedderKind::EcnTemporal);
        assert_eq!(config.channel.delimiter, Delimiter::Buffer);
        assert_eq!(config.channel.origin_port, 8124);
        assert_eq!(config.limits, LimitsConfig::default());
    }

    #[test]
    fn defaults_survive_serialization() {
        let text = toml::to_string_pretty(&CovertConfig::default()).unwrap();
        let back: CovertConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, CovertConfig::default());
    }

    #[test]
    fn unknown_embedder_fails_to_parse() {
        let text = "[channel]\nembedder = \"frequency\"\n";
        assert!(toml::from_str::<CovertConfig>(text).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let mut config = CovertConfig::default();
        config.channel.read_timeout_ms = 70_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "channel.read_timeout_ms",
                ..
            })
        ));

        let mut config = CovertConfig::default();
        config.channel.friend_port = 0;
        assert!(config.validate().is_err());

        let mut config = CovertConfig::default();
        config.limits.port_queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = CovertConfig::default();
        config.channel.temporal_midpoint_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = [
            ("COVERT_CHANNEL__FRIEND_IP", "192.168.7.9"),
            ("COVERT_CHANNEL__FRIEND_PORT", "9001"),
            ("COVERT_CHANNEL__ORIGIN_PORT", "not-a-port"),
            ("COVERT_CHANNEL__EMBEDDER", "Timestamp"),
            ("COVERT_CHANNEL__DELIMITER", "buffer"),
            ("COVERT_CHANNEL__DIAL_TIMEOUT_MS", "1500"),
            ("COVERT_CHANNEL__ACCEPT_TIMEOUT_MS", " 250 "),
            ("COVERT_CHANNEL__READ_TIMEOUT_MS", "0"),
            ("COVERT_CHANNEL__WRITE_TIMEOUT_MS", "-3"),
            ("COVERT_CHANNEL__TEMPORAL_MIDPOINT_MS", "80"),
        ]
        .into_iter()
        .collect();

        let mut config = CovertConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.channel.friend_ip, Ipv4Addr::new(192, 168, 7, 9));
        assert_eq!(config.channel.friend_port, 9001);
        assert_eq!(config.channel.origin_port, 8124);
        assert_eq!(config.channel.embedder, EmbedderKind::Timestamp);
        assert_eq!(config.channel.delimiter, Delimiter::Buffer);
        assert_eq!(config.channel.dial_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.channel.accept_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.channel.read_timeout(), None);
        assert_eq!(config.channel.write_timeout_ms, 500);
        assert_eq!(config.channel.temporal_midpoint(), Duration::from_millis(80));
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("covert-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("COVERT_CONFIG", config_path.to_str().unwrap());
        }

        let path =
            CovertConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());

        let config = CovertConfig::load().expect("load should succeed");
        assert_eq!(config.channel.embedder, EmbedderKind::Id);

        unsafe {
            std::env::remove_var("COVERT_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
