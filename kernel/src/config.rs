//! Kernel resource limits.
//!
//! The configuration is a JSON document, parsed without allocation by `serde-json-core`. Every
//! field is optional and falls back to its default.
use serde::Deserialize;
use snafu::ensure;

use crate::error::{ConfigSnafu, Error};

/// Limits applied to every channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelLimits {
    /// Largest payload a single message may carry, in bytes.
    pub max_message_bytes: usize,
    /// Largest number of handles a single message may carry.
    pub max_message_handles: usize,
    /// Number of unread messages an endpoint may hold before writes to it fail with `ShouldWait`.
    pub max_pending_messages: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: 65536,
            max_message_handles: 64,
            max_pending_messages: 4096,
        }
    }
}

/// Limits applied to every port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortLimits {
    /// Number of packets a port may hold before new ones are refused.
    pub max_queued_packets: usize,
}

impl Default for PortLimits {
    fn default() -> Self {
        Self {
            max_queued_packets: 2048,
        }
    }
}

/// Configuration shared by every process of a kernel instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub channel: ChannelLimits,
    pub port: PortLimits,
    /// Yield the calling thread after an operation wakes another one.
    pub yield_on_wake: bool,
}

impl KernelConfig {
    /// Parse a configuration from JSON and validate it.
    pub fn from_json(src: &[u8]) -> Result<Self, Error> {
        let (config, _) = serde_json_core::from_slice::<KernelConfig>(src).map_err(|e| {
            ConfigSnafu {
                reason: e.to_string(),
            }
            .build()
        })?;
        config.validate()?;
        log::debug!("loaded kernel configuration {config:?}");
        Ok(config)
    }

    /// Check that every limit permits at least some progress.
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(
            self.channel.max_message_bytes > 0,
            ConfigSnafu {
                reason: "channel.max_message_bytes must be non-zero"
            }
        );
        ensure!(
            self.channel.max_pending_messages > 0,
            ConfigSnafu {
                reason: "channel.max_pending_messages must be non-zero"
            }
        );
        ensure!(
            self.port.max_queued_packets > 0,
            ConfigSnafu {
                reason: "port.max_queued_packets must be non-zero"
            }
        );
        Ok(())
    }
}
