// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-tag chunked buffer.
//!
//! Every tag owns at most one retention chunk that accepts writes. A retention chunk is
//! closed and queued for sending once it grows past `retention_size`, once it has been idle
//! for `retention_time`, or on a forced flush. Each queued chunk goes out as a single
//! `[tag, bin(entries)]` frame. Chunk memory comes from a [`BufferPool`] bounded by the
//! buffer's maximum size.

use crate::backup::{BackupError, FileBackup};
use crate::buffer::pool::{BufferPool, Region};
use crate::buffer::{Buffer, BufferConfig};
use crate::encode;
use crate::errors::{BufferError, ConfigError};
use crate::sender::Sender;
use crate::Fields;
use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};
use uuid::Uuid;

pub const FORMAT_TYPE: &str = "packed_forward";

/// Backup parameter marking a chunk that was already closed.
const KIND_FLUSHABLE: &str = "0";
/// Backup parameter marking a chunk that was still accepting writes.
const KIND_RETENTION: &str = "1";

#[derive(Debug, Clone, PartialEq)]
pub struct PackedForwardConfig {
    /// Size of the first region a tag receives.
    pub initial_buffer_size: usize,
    /// Growth factor between region size classes.
    pub buffer_expand_ratio: f64,
    /// A chunk holding more bytes than this is queued right away.
    pub retention_size: usize,
    /// A chunk left untouched for this long is queued on the next flush.
    pub retention_time: Duration,
}

impl Default for PackedForwardConfig {
    fn default() -> Self {
        PackedForwardConfig {
            initial_buffer_size: 1024 * 1024,
            buffer_expand_ratio: 2.0,
            retention_size: 4 * 1024 * 1024,
            retention_time: Duration::from_millis(400),
        }
    }
}

impl PackedForwardConfig {
    pub fn validate(&self, max_buffer_size: usize) -> Result<(), ConfigError> {
        if self.initial_buffer_size == 0 || self.initial_buffer_size > max_buffer_size {
            return Err(ConfigError::InvalidValue {
                name: "initial_buffer_size",
                value: self.initial_buffer_size.to_string(),
            });
        }
        if self.buffer_expand_ratio.is_nan() || self.buffer_expand_ratio <= 1.0 {
            return Err(ConfigError::InvalidValue {
                name: "buffer_expand_ratio",
                value: self.buffer_expand_ratio.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct RetentionChunk {
    region: Region,
    last_updated: Instant,
}

#[derive(Debug)]
struct FlushableChunk {
    tag: String,
    region: Region,
}

/// A chunk taken off the queue for sending. Its region goes back to the pool when this is
/// dropped, including when the flush future is cancelled mid-send.
struct InFlight<'a> {
    pool: &'a BufferPool,
    chunk: Option<FlushableChunk>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.pool.release(chunk.region);
        }
    }
}

#[derive(Debug)]
pub struct PackedForwardBuffer {
    config: PackedForwardConfig,
    ack_response_mode: bool,
    pool: BufferPool,
    retention: Mutex<HashMap<String, RetentionChunk>>,
    flushable: Mutex<VecDeque<FlushableChunk>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl PackedForwardBuffer {
    pub fn new(
        buffer_config: &BufferConfig,
        config: PackedForwardConfig,
    ) -> Result<Self, ConfigError> {
        config.validate(buffer_config.max_buffer_size)?;
        let pool = BufferPool::new(
            config.initial_buffer_size,
            config.buffer_expand_ratio,
            buffer_config.max_buffer_size,
        );
        Ok(PackedForwardBuffer {
            config,
            ack_response_mode: buffer_config.ack_response_mode,
            pool,
            retention: Mutex::new(HashMap::new()),
            flushable: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn retention(&self) -> MutexGuard<'_, HashMap<String, RetentionChunk>> {
        #[allow(clippy::expect_used)]
        self.retention.lock().expect("lock poisoned")
    }

    fn flushable(&self) -> MutexGuard<'_, VecDeque<FlushableChunk>> {
        #[allow(clippy::expect_used)]
        self.flushable.lock().expect("lock poisoned")
    }

    fn next_flushable(&self) -> Option<FlushableChunk> {
        self.flushable().pop_front()
    }

    /// Appends encoded entries to the tag's retention chunk, creating or growing it as needed.
    fn write(&self, tag: &str, bytes: &[u8]) -> Result<(), BufferError> {
        let mut retention = self.retention();
        let chunk = match retention.entry(tag.to_string()) {
            Entry::Occupied(entry) => {
                let chunk = entry.into_mut();
                if chunk.region.remaining() <= bytes.len() {
                    let needed = chunk.region.len() + bytes.len() + 1;
                    self.pool.grow(&mut chunk.region, needed)?;
                }
                chunk
            }
            Entry::Vacant(entry) => {
                let region = self.pool.acquire(bytes.len() + 1)?;
                entry.insert(RetentionChunk {
                    region,
                    last_updated: Instant::now(),
                })
            }
        };
        chunk.region.put(bytes);
        chunk.last_updated = Instant::now();

        if chunk.region.len() > self.config.retention_size {
            if let Some(chunk) = retention.remove(tag) {
                trace!(
                    "Chunk for {} reached {} bytes, queueing it",
                    tag,
                    chunk.region.len()
                );
                self.flushable().push_back(FlushableChunk {
                    tag: tag.to_string(),
                    region: chunk.region,
                });
            }
        }
        Ok(())
    }

    /// Queues retention chunks idle for `retention_time`, or all of them when `force` is set.
    fn sweep(&self, force: bool) {
        let now = Instant::now();
        let mut retention = self.retention();
        let expired: Vec<String> = retention
            .iter()
            .filter(|(_, chunk)| {
                force || now.duration_since(chunk.last_updated) >= self.config.retention_time
            })
            .map(|(tag, _)| tag.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut flushable = self.flushable();
        for tag in expired {
            if let Some(chunk) = retention.remove(&tag) {
                flushable.push_back(FlushableChunk {
                    tag,
                    region: chunk.region,
                });
            }
        }
    }

    async fn send_chunk(
        &self,
        sender: &dyn Sender,
        chunk: &FlushableChunk,
    ) -> Result<(), BufferError> {
        let payload = chunk.region.as_bytes();
        let header =
            encode::packed_forward_header(&chunk.tag, payload.len(), self.ack_response_mode)?;
        trace!(
            "Sending {} bytes for {} to {}",
            payload.len(),
            chunk.tag,
            sender.target()
        );
        if self.ack_response_mode {
            let token = Uuid::new_v4().to_string();
            sender
                .send_with_ack(&[header.as_slice(), payload], token.as_bytes())
                .await?;
        } else {
            sender.send(&[header.as_slice(), payload]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Buffer for PackedForwardBuffer {
    fn format_type(&self) -> &'static str {
        FORMAT_TYPE
    }

    fn append(&self, tag: &str, timestamp: i64, fields: &Fields) -> Result<(), BufferError> {
        let entry = encode::entry(timestamp, fields)?;
        self.write(tag, &entry)
    }

    async fn flush(&self, sender: &dyn Sender, force: bool) -> Result<(), BufferError> {
        let _flushing = self.flush_lock.lock().await;
        self.sweep(force);

        while let Some(chunk) = self.next_flushable() {
            let mut in_flight = InFlight {
                pool: &self.pool,
                chunk: Some(chunk),
            };
            let Some(chunk) = in_flight.chunk.as_ref() else {
                continue;
            };
            if let Err(e) = self.send_chunk(sender, chunk).await {
                if e.nothing_sent() {
                    if let Some(chunk) = in_flight.chunk.take() {
                        debug!("Nothing was sent for {}, requeueing its chunk", chunk.tag);
                        self.flushable().push_front(chunk);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn allocated_size(&self) -> usize {
        self.pool.allocated_size()
    }

    async fn save_pending(&self, backup: &FileBackup) -> Result<usize, BackupError> {
        let _flushing = self.flush_lock.lock().await;
        let mut pending: Vec<(&str, FlushableChunk)> = self
            .flushable()
            .drain(..)
            .map(|chunk| (KIND_FLUSHABLE, chunk))
            .collect();
        pending.extend(
            std::mem::take(&mut *self.retention())
                .into_iter()
                .map(|(tag, chunk)| {
                    (
                        KIND_RETENTION,
                        FlushableChunk {
                            tag,
                            region: chunk.region,
                        },
                    )
                }),
        );

        let mut saved = 0;
        let mut first_error = None;
        for (kind, chunk) in pending {
            let params = vec![kind.to_string(), chunk.tag.clone()];
            match backup.save(params, chunk.region.as_bytes()) {
                Ok(_) => {
                    saved += chunk.region.len();
                    self.pool.release(chunk.region);
                }
                Err(e) => {
                    error!("Failed to back up chunk for {}: {}", chunk.tag, e);
                    // kept pending so a later flush can still deliver it
                    self.flushable().push_back(chunk);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(saved), Err)
    }

    fn load_saved(&self, params: &[String], data: &[u8]) -> Result<(), BufferError> {
        let [kind, tag] = params else {
            return Err(BufferError::Restore(format!(
                "expected [kind, tag] parameters, got {params:?}"
            )));
        };
        if data.is_empty() {
            return Ok(());
        }
        match kind.as_str() {
            KIND_FLUSHABLE => {
                let mut region = self.pool.acquire(data.len())?;
                region.put(data);
                self.flushable().push_back(FlushableChunk {
                    tag: tag.clone(),
                    region,
                });
                Ok(())
            }
            KIND_RETENTION => self.write(tag, data),
            other => Err(BufferError::Restore(format!("unknown chunk kind '{other}'"))),
        }
    }
}
