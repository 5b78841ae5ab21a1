// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Strategies that accumulate encoded records until a flush hands them to a [`Sender`].

use crate::backup::{BackupError, FileBackup};
use crate::errors::BufferError;
use crate::sender::Sender;
use crate::Fields;
use async_trait::async_trait;
use tracing::{debug, info};

pub mod message;
pub mod packed_forward;
pub mod pool;

/// 512 MiB
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Upper bound of [`Buffer::allocated_size`].
    pub max_buffer_size: usize,
    /// Attach an ack token to every frame and wait for the collector to echo it.
    pub ack_response_mode: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            ack_response_mode: false,
        }
    }
}

#[async_trait]
pub trait Buffer: Send + Sync + std::fmt::Debug {
    /// Identifies the frame layout; backup files of this buffer are named after it.
    fn format_type(&self) -> &'static str;

    /// Encodes and stores one record.
    ///
    /// Fails with [`BufferError::Full`] or [`BufferError::Encoding`], leaving the buffer as it
    /// was before the call.
    fn append(&self, tag: &str, timestamp: i64, fields: &Fields) -> Result<(), BufferError>;

    /// Sends pending data. `force` also sends data that would otherwise keep accumulating.
    async fn flush(&self, sender: &dyn Sender, force: bool) -> Result<(), BufferError>;

    /// Bytes currently held for pending data.
    fn allocated_size(&self) -> usize;

    /// Writes everything still pending to `backup` and drops it from the buffer.
    /// Returns the number of payload bytes saved.
    async fn save_pending(&self, backup: &FileBackup) -> Result<usize, BackupError>;

    /// Re-inserts a payload written by [`Buffer::save_pending`].
    fn load_saved(&self, params: &[String], data: &[u8]) -> Result<(), BufferError>;
}

/// Replays every saved payload of `buffer`'s format. Returns how many were restored.
///
/// A payload that fails to load stays on disk and does not stop the others.
pub fn restore_from_backup(buffer: &dyn Buffer, backup: &FileBackup) -> Result<usize, BackupError> {
    let mut restored = 0;
    for saved in backup.saved_buffers()? {
        debug!("Restoring backup {}", saved.path().display());
        if saved.open(|params, data| buffer.load_saved(params, data)) {
            restored += 1;
        }
    }
    if restored > 0 {
        info!(
            "Restored {} saved {} buffers from {}",
            restored,
            buffer.format_type(),
            backup.dir().display()
        );
    }
    Ok(restored)
}
