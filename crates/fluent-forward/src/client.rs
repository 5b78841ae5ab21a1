// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point tying a buffer, a flusher and a sender together.

use crate::backup::BackupError;
use crate::buffer::message::MessageBuffer;
use crate::buffer::packed_forward::PackedForwardBuffer;
use crate::buffer::{restore_from_backup, Buffer};
use crate::config::{BufferKind, ClientConfig};
use crate::errors::{BufferError, ConfigError};
use crate::flusher::{Flusher, FlusherConfig};
use crate::sender::heartbeat::{AlwaysAlive, Heartbeat};
use crate::sender::multi::MultiSender;
use crate::sender::tcp::TcpSender;
use crate::sender::Sender;
use crate::Fields;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backup(#[from] BackupError),
}

pub struct ClientBuilder {
    config: ClientConfig,
    sender: Option<Arc<dyn Sender>>,
    heartbeat: Option<Arc<dyn Heartbeat>>,
}

impl ClientBuilder {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        ClientBuilder {
            config,
            sender: None,
            heartbeat: None,
        }
    }

    /// Replaces the TCP senders built from the configured targets.
    #[must_use]
    pub fn sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Liveness source used to order failover between several targets.
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: Arc<dyn Heartbeat>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    fn default_sender(&self) -> Result<Arc<dyn Sender>, ConfigError> {
        let mut senders: Vec<Arc<dyn Sender>> = self
            .config
            .tcp_sender_configs()
            .into_iter()
            .map(|config| Arc::new(TcpSender::new(config)) as Arc<dyn Sender>)
            .collect();
        match senders.len() {
            0 => Err(ConfigError::NoTargets),
            1 if self.heartbeat.is_none() => Ok(senders.remove(0)),
            _ => {
                let heartbeat = self
                    .heartbeat
                    .clone()
                    .unwrap_or_else(|| Arc::new(AlwaysAlive));
                Ok(Arc::new(MultiSender::new(senders, heartbeat)))
            }
        }
    }

    /// Builds the client, replaying any saved backups before it accepts records.
    ///
    /// Must be called from within a tokio runtime when flushing periodically.
    pub fn build(self) -> Result<Client, ClientError> {
        let buffer: Arc<dyn Buffer> = match self.config.buffer_kind {
            BufferKind::PackedForward => Arc::new(PackedForwardBuffer::new(
                &self.config.buffer,
                self.config.packed_forward.clone(),
            )?),
            BufferKind::Message => Arc::new(MessageBuffer::new(&self.config.buffer)),
        };
        let sender = match &self.sender {
            Some(sender) => Arc::clone(sender),
            None => self.default_sender()?,
        };
        debug!(
            "Forwarding {} records to {}",
            buffer.format_type(),
            sender.target()
        );

        let flusher = Flusher::new(
            Arc::clone(&buffer),
            sender,
            FlusherConfig {
                mode: self.config.flush_mode,
                file_backup_dir: self.config.file_backup_dir.clone(),
            },
        )?;
        if let Some(backup) = flusher.backup() {
            restore_from_backup(buffer.as_ref(), backup)?;
        }
        flusher.start();

        Ok(Client { buffer, flusher })
    }
}

#[derive(Debug)]
pub struct Client {
    buffer: Arc<dyn Buffer>,
    flusher: Flusher,
}

impl Client {
    pub fn from_config(config: ClientConfig) -> Result<Self, ClientError> {
        ClientBuilder::new(config).build()
    }

    /// Emits a record stamped with the current Unix time in seconds.
    pub async fn emit(&self, tag: &str, fields: &Fields) -> Result<(), BufferError> {
        #[allow(clippy::cast_possible_wrap)]
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        self.emit_with_time(tag, now, fields).await
    }

    /// Fails with [`BufferError::Closed`] once [`Client::close`] has been called.
    pub async fn emit_with_time(
        &self,
        tag: &str,
        timestamp: i64,
        fields: &Fields,
    ) -> Result<(), BufferError> {
        if self.flusher.is_closed() {
            return Err(BufferError::Closed);
        }
        self.buffer.append(tag, timestamp, fields)?;
        self.flusher.on_update().await
    }

    /// Sends everything buffered so far.
    pub async fn flush(&self) -> Result<(), BufferError> {
        self.flusher.flush().await
    }

    pub async fn close(&self) -> Result<(), BufferError> {
        self.flusher.close().await
    }

    #[must_use]
    pub fn allocated_size(&self) -> usize {
        self.buffer.allocated_size()
    }
}
