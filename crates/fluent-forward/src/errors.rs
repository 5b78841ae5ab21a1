// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::backup::BackupError;
use crate::buffer::pool::PoolFull;
use crate::sender::SenderError;

/// Failure to turn a record or frame header into MessagePack bytes.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to serialize record: {0}")]
    Record(#[from] rmp_serde::encode::Error),
    #[error("failed to write frame header: {0}")]
    Header(#[from] rmp::encode::ValueWriteError),
    #[error("payload of {0} bytes does not fit in a forward frame")]
    PayloadTooLarge(usize),
    #[error("unexpected message header byte {0:#04x}")]
    UnexpectedHeader(u8),
}

/// Errors surfaced by buffer strategies.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer is full: allocated={allocated}, requested={requested}, max={max}")]
    Full {
        allocated: usize,
        requested: usize,
        max: usize,
    },
    #[error(transparent)]
    Encoding(#[from] EncodeError),
    #[error(transparent)]
    Transport(#[from] SenderError),
    #[error("invalid saved buffer: {0}")]
    Restore(String),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("{remaining} bytes could not be flushed and no backup directory is configured")]
    Unflushed { remaining: usize },
    #[error("client is closed")]
    Closed,
}

impl BufferError {
    /// True when a failed transmission left the payload untouched, so it can be requeued.
    #[must_use]
    pub fn nothing_sent(&self) -> bool {
        match self {
            BufferError::Transport(e) => e.nothing_sent(),
            _ => false,
        }
    }
}

impl From<PoolFull> for BufferError {
    fn from(e: PoolFull) -> Self {
        BufferError::Full {
            allocated: e.allocated,
            requested: e.requested,
            max: e.max,
        }
    }
}

/// Invalid client or buffer configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid target '{0}': expected host:port")]
    InvalidTarget(String),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("no targets configured")]
    NoTargets,
}
