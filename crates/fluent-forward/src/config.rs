// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client configuration and its environment variable overrides.
//!
//! | Variable | Example |
//! |----------|---------|
//! | `FLUENT_FORWARD_TARGETS` | `10.0.0.1:24224,10.0.0.2:24224` |
//! | `FLUENT_FORWARD_BUFFER` | `packed_forward` or `message` |
//! | `FLUENT_FORWARD_MAX_BUFFER_SIZE` | `536870912` |
//! | `FLUENT_FORWARD_ACK` | `true` |
//! | `FLUENT_FORWARD_BACKUP_DIR` | `/var/lib/forward` |
//! | `FLUENT_FORWARD_FLUSH` | `sync` or `periodic,600` |

use crate::buffer::packed_forward::PackedForwardConfig;
use crate::buffer::BufferConfig;
use crate::errors::ConfigError;
use crate::sender::tcp::{TcpSenderConfig, DEFAULT_HOST, DEFAULT_PORT};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(600);

/// When buffered data is handed to the sender.
///
/// Parsed leniently from strings: `"sync"`, `"periodic"` or `"periodic,<millis>"`. Anything
/// else falls back to the default periodic mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Flush on the producer's task right after every append.
    Sync,
    /// Flush from a background task every `interval`.
    Periodic { interval: Duration },
}

impl Default for FlushMode {
    fn default() -> Self {
        FlushMode::Periodic {
            interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl<'de> Deserialize<'de> for FlushMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        let mut split_value = value.as_str().split(',');
        let mode = split_value.next().map(str::trim);
        let interval = split_value.next().map(|v| v.trim().parse::<u64>());

        match (mode, interval) {
            (Some("sync"), None) => Ok(FlushMode::Sync),
            (Some("periodic"), None) => Ok(FlushMode::default()),
            (Some("periodic"), Some(Ok(millis))) if millis > 0 => Ok(FlushMode::Periodic {
                interval: Duration::from_millis(millis),
            }),
            (Some("periodic"), _) => {
                debug!("Invalid flush interval: {}, using default", value);
                Ok(FlushMode::default())
            }
            _ => {
                debug!("Invalid flush mode: {}, using default", value);
                Ok(FlushMode::default())
            }
        }
    }
}

/// Which buffer strategy accumulates records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferKind {
    /// Per-tag chunks sent as `[tag, bin(entries)]`.
    #[default]
    PackedForward,
    /// One `[tag, timestamp, fields]` frame per record.
    Message,
}

impl<'de> Deserialize<'de> for BufferKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.trim().to_lowercase().as_str() {
            "packed_forward" | "packed" => Ok(BufferKind::PackedForward),
            "message" => Ok(BufferKind::Message),
            _ => {
                debug!("Invalid buffer kind: {}, using default", value);
                Ok(BufferKind::default())
            }
        }
    }
}

/// A collector address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Default for Target {
    fn default() -> Self {
        Target {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl FromStr for Target {
    type Err = ConfigError;

    /// Accepts `host:port`, or a bare `host` using the default port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidTarget(s.to_string()))?;
                (host, port)
            }
            None => (s, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(ConfigError::InvalidTarget(s.to_string()));
        }
        Ok(Target {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Collectors in failover order.
    pub targets: Vec<Target>,
    pub buffer: BufferConfig,
    pub buffer_kind: BufferKind,
    pub packed_forward: PackedForwardConfig,
    pub flush_mode: FlushMode,
    /// Where undelivered data is saved on close and restored from on start.
    pub file_backup_dir: Option<PathBuf>,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let tcp = TcpSenderConfig::default();
        ClientConfig {
            targets: vec![Target::default()],
            buffer: BufferConfig::default(),
            buffer_kind: BufferKind::default(),
            packed_forward: PackedForwardConfig::default(),
            flush_mode: FlushMode::default(),
            file_backup_dir: None,
            connect_timeout: tcp.connect_timeout,
            write_timeout: tcp.write_timeout,
            read_timeout: tcp.read_timeout,
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `FLUENT_FORWARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = ClientConfig::default();

        if let Some(targets) = lookup("FLUENT_FORWARD_TARGETS") {
            config.targets = targets
                .split(',')
                .filter(|t| !t.trim().is_empty())
                .map(Target::from_str)
                .collect::<Result<_, _>>()?;
            if config.targets.is_empty() {
                return Err(ConfigError::NoTargets);
            }
        }
        if let Some(kind) = lookup("FLUENT_FORWARD_BUFFER") {
            config.buffer_kind = BufferKind::deserialize(serde_json::Value::String(kind))
                .unwrap_or_default();
        }
        if let Some(size) = lookup("FLUENT_FORWARD_MAX_BUFFER_SIZE") {
            config.buffer.max_buffer_size =
                size.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    name: "FLUENT_FORWARD_MAX_BUFFER_SIZE",
                    value: size.clone(),
                })?;
        }
        if let Some(ack) = lookup("FLUENT_FORWARD_ACK") {
            config.buffer.ack_response_mode = match ack.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "FLUENT_FORWARD_ACK",
                        value: ack,
                    })
                }
            };
        }
        if let Some(dir) = lookup("FLUENT_FORWARD_BACKUP_DIR").filter(|d| !d.is_empty()) {
            config.file_backup_dir = Some(PathBuf::from(dir));
        }
        if let Some(mode) = lookup("FLUENT_FORWARD_FLUSH") {
            config.flush_mode =
                FlushMode::deserialize(serde_json::Value::String(mode)).unwrap_or_default();
        }
        Ok(config)
    }

    #[must_use]
    pub fn tcp_sender_configs(&self) -> Vec<TcpSenderConfig> {
        self.targets
            .iter()
            .map(|target| TcpSenderConfig {
                host: target.host.clone(),
                port: target.port,
                connect_timeout: self.connect_timeout,
                write_timeout: self.write_timeout,
                read_timeout: self.read_timeout,
            })
            .collect()
    }
}
