// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::backup::{BackupError, FileBackup};
use crate::buffer::Buffer;
use crate::config::FlushMode;
use crate::errors::BufferError;
use crate::sender::Sender;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlusherConfig {
    pub mode: FlushMode,
    /// Directory receiving whatever is left in the buffer on close.
    pub file_backup_dir: Option<PathBuf>,
}

/// Decides when a buffer is flushed to its sender.
#[derive(Debug)]
pub struct Flusher {
    buffer: Arc<dyn Buffer>,
    sender: Arc<dyn Sender>,
    mode: FlushMode,
    backup: Option<FileBackup>,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Flusher {
    pub fn new(
        buffer: Arc<dyn Buffer>,
        sender: Arc<dyn Sender>,
        config: FlusherConfig,
    ) -> Result<Self, BackupError> {
        let backup = config
            .file_backup_dir
            .map(|dir| FileBackup::new(dir, buffer.format_type()))
            .transpose()?;
        Ok(Flusher {
            buffer,
            sender,
            mode: config.mode,
            backup,
            cancel_token: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn backup(&self) -> Option<&FileBackup> {
        self.backup.as_ref()
    }

    /// True once [`Flusher::close`] has begun.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    fn task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        #[allow(clippy::expect_used)]
        self.task.lock().expect("lock poisoned")
    }

    /// Spawns the periodic flush loop. Does nothing in sync mode or if already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let FlushMode::Periodic { interval } = self.mode else {
            return;
        };
        let mut task = self.task();
        if task.is_some() || self.cancel_token.is_cancelled() {
            return;
        }

        let buffer = Arc::clone(&self.buffer);
        let sender = Arc::clone(&self.sender);
        let cancel_token = self.cancel_token.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // discard first tick, which is instantaneous
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = buffer.flush(sender.as_ref(), false).await {
                            warn!("Failed to flush buffer, retrying on next tick: {}", e);
                        }
                    }
                }
            }
            debug!("Flush loop stopped");
        }));
    }

    /// Called after every successful append. Flushes right away in sync mode.
    pub async fn on_update(&self) -> Result<(), BufferError> {
        match self.mode {
            FlushMode::Sync => self.buffer.flush(self.sender.as_ref(), false).await,
            FlushMode::Periodic { .. } => Ok(()),
        }
    }

    /// Sends everything pending, including chunks still accumulating.
    pub async fn flush(&self) -> Result<(), BufferError> {
        self.buffer.flush(self.sender.as_ref(), true).await
    }

    /// Stops the flush loop, drains the buffer one last time and closes the sender.
    ///
    /// Data that still could not be sent is saved to the backup directory. Without one, it is
    /// reported as [`BufferError::Unflushed`].
    pub async fn close(&self) -> Result<(), BufferError> {
        self.cancel_token.cancel();
        let task = self.task().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Flush loop ended abnormally: {}", e);
            }
        }

        let flushed = self.flush().await;
        if let Err(e) = &flushed {
            warn!("Final flush failed: {}", e);
        }
        if let Err(e) = self.sender.close().await {
            warn!("Failed to close sender {}: {}", self.sender.target(), e);
        }

        let remaining = self.buffer.allocated_size();
        if remaining == 0 {
            return flushed;
        }
        match &self.backup {
            Some(backup) => {
                let saved = self.buffer.save_pending(backup).await?;
                info!("Saved {} unsent bytes to {}", saved, backup.dir().display());
                Ok(())
            }
            None => {
                error!("Dropping {} unsent bytes, no backup directory configured", remaining);
                Err(BufferError::Unflushed { remaining })
            }
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
