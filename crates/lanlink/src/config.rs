//! Host and peer configuration.
//!
//! Every struct has sensible defaults and deserialises with missing fields
//! filled in, so a game can keep these in its own settings file.

use std::time::Duration;

use lanlink_protocol::CodecConfig;
use lanlink_session::{DEFAULT_NICKNAME, MAX_PEERS};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// HostConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`Host`](crate::Host).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Interface to listen on. Default: `"0.0.0.0"`.
    pub bind_address: String,

    /// Highest peer id handed out; at most this many peers can be
    /// identified at once. Default: 255.
    pub max_peers: u8,

    /// Close connections that send nothing for this long. Default: `None`
    /// (never).
    pub idle_timeout: Option<Duration>,

    pub codec: CodecConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            max_peers: MAX_PEERS,
            idle_timeout: None,
            codec: CodecConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReconnectConfig
// ---------------------------------------------------------------------------

/// How a [`Peer`](crate::Peer) retries after losing its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before each attempt. Default: 1 s.
    pub interval: Duration,

    /// Jitter factor (0.0–1.0), applied as ±jitter to the interval.
    /// Default: 0.0.
    pub jitter: f64,

    /// Give up after this many failed attempts. Default: `None` (retry
    /// until `disconnect`).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            jitter: 0.0,
            max_attempts: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PeerConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`Peer`](crate::Peer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Nickname requested from the host. The host may hand back a
    /// suffixed variant if it is taken. Default: `"Player"`.
    pub nickname: String,

    pub reconnect: ReconnectConfig,

    pub codec: CodecConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            nickname: DEFAULT_NICKNAME.to_string(),
            reconnect: ReconnectConfig::default(),
            codec: CodecConfig::default(),
        }
    }
}
