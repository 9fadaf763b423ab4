use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::ReclaimBackoff;

/// Where lease keys come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySource {
    /// The caller picks the key; it must be unique among held resources.
    #[default]
    ClientSupplied,
    /// The manager mints a fresh random key for every grant.
    ServerGenerated,
}

impl FromStr for KeySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "client" | "client-supplied" | "client_supplied" => Ok(KeySource::ClientSupplied),
            "server" | "server-generated" | "server_generated" => Ok(KeySource::ServerGenerated),
            _ => Err(format!(
                "Invalid key source '{}'. Must be one of: client, server",
                s
            )),
        }
    }
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::ClientSupplied => write!(f, "client"),
            KeySource::ServerGenerated => write!(f, "server"),
        }
    }
}

/// Tunables of the lease manager and its expiry scheduler.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub key_source: KeySource,
    /// Exact length of client keys, and the length of minted keys
    pub key_length: usize,
    /// The one pause granted to an acquire that finds the resource held
    pub contention_wait: Duration,
    pub reclaim_backoff: ReclaimBackoff,
    /// Maximum number of due reclaim jobs handled per sweep
    pub reclaim_batch: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            key_source: KeySource::ClientSupplied,
            key_length: 10,
            contention_wait: Duration::from_secs(5),
            reclaim_backoff: ReclaimBackoff::default(),
            reclaim_batch: 100,
        }
    }
}
