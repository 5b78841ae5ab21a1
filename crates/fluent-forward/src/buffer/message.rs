// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffer that queues every record as its own `[tag, timestamp, fields]` message.
//!
//! Producers reserve bytes with a compare-and-swap on the allocated counter and only take the
//! queue mutex for the push. Flushing pops one message at a time, so sends never happen under
//! that mutex.

use crate::backup::{BackupError, FileBackup};
use crate::buffer::{Buffer, BufferConfig};
use crate::encode::{self, MESSAGE_HEADER, MESSAGE_HEADER_WITH_ACK};
use crate::errors::{BufferError, EncodeError};
use crate::sender::Sender;
use crate::Fields;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};
use uuid::Uuid;

pub const FORMAT_TYPE: &str = "message";

/// Bytes of one message taken off the queue. They stop counting against the buffer when this
/// is dropped unless the message was put back.
struct Reservation<'a> {
    allocated: &'a AtomicUsize,
    len: usize,
}

impl Reservation<'_> {
    fn keep(mut self) {
        self.len = 0;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.len > 0 {
            self.allocated.fetch_sub(self.len, Ordering::AcqRel);
        }
    }
}

#[derive(Debug)]
pub struct MessageBuffer {
    max_buffer_size: usize,
    ack_response_mode: bool,
    allocated: AtomicUsize,
    messages: Mutex<VecDeque<Bytes>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl MessageBuffer {
    #[must_use]
    pub fn new(config: &BufferConfig) -> Self {
        MessageBuffer {
            max_buffer_size: config.max_buffer_size,
            ack_response_mode: config.ack_response_mode,
            allocated: AtomicUsize::new(0),
            messages: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn messages(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        #[allow(clippy::expect_used)]
        self.messages.lock().expect("lock poisoned")
    }

    fn next_message(&self) -> Option<Bytes> {
        self.messages().pop_front()
    }

    /// Counts `len` more bytes against the maximum, or fails leaving the counter untouched.
    fn reserve(&self, len: usize) -> Result<(), BufferError> {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(len)
                    .filter(|&total| total <= self.max_buffer_size)
            })
            .map(|_| ())
            .map_err(|allocated| BufferError::Full {
                allocated,
                requested: len,
                max: self.max_buffer_size,
            })
    }

    /// Rewrites the header of a 3 element message so the ack token becomes its 4th element.
    fn apply_ack_header(&self, message: &mut [u8]) -> Result<(), EncodeError> {
        if !self.ack_response_mode {
            return Ok(());
        }
        match message.first_mut() {
            Some(header) if *header == MESSAGE_HEADER => {
                *header = MESSAGE_HEADER_WITH_ACK;
                Ok(())
            }
            Some(header) => Err(EncodeError::UnexpectedHeader(*header)),
            None => Err(EncodeError::UnexpectedHeader(0)),
        }
    }

    async fn send_message(&self, sender: &dyn Sender, message: &[u8]) -> Result<(), BufferError> {
        trace!("Sending {} byte message to {}", message.len(), sender.target());
        if self.ack_response_mode {
            let token = Uuid::new_v4().to_string();
            sender.send_with_ack(&[message], token.as_bytes()).await?;
        } else {
            sender.send(&[message]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Buffer for MessageBuffer {
    fn format_type(&self) -> &'static str {
        FORMAT_TYPE
    }

    fn append(&self, tag: &str, timestamp: i64, fields: &Fields) -> Result<(), BufferError> {
        let mut message = encode::message(tag, timestamp, fields)?;
        self.apply_ack_header(&mut message)?;
        self.reserve(message.len())?;
        self.messages().push_back(Bytes::from(message));
        Ok(())
    }

    async fn flush(&self, sender: &dyn Sender, _force: bool) -> Result<(), BufferError> {
        let _flushing = self.flush_lock.lock().await;
        while let Some(message) = self.next_message() {
            let reservation = Reservation {
                allocated: &self.allocated,
                len: message.len(),
            };
            if let Err(e) = self.send_message(sender, &message).await {
                if e.nothing_sent() {
                    debug!("Nothing was sent, requeueing message");
                    reservation.keep();
                    self.messages().push_front(message);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn allocated_size(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Saves all pending messages as one file, each with a plain 3 element header.
    async fn save_pending(&self, backup: &FileBackup) -> Result<usize, BackupError> {
        let _flushing = self.flush_lock.lock().await;
        let pending: Vec<Bytes> = self.messages().drain(..).collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut data = Vec::with_capacity(pending.iter().map(Bytes::len).sum());
        for message in &pending {
            let start = data.len();
            data.extend_from_slice(message);
            if let Some(header) = data.get_mut(start) {
                *header = MESSAGE_HEADER;
            }
        }

        match backup.save(Vec::new(), &data) {
            Ok(_) => {
                self.allocated.fetch_sub(data.len(), Ordering::AcqRel);
                Ok(data.len())
            }
            Err(e) => {
                let mut messages = self.messages();
                for message in pending.into_iter().rev() {
                    messages.push_front(message);
                }
                Err(e)
            }
        }
    }

    fn load_saved(&self, params: &[String], data: &[u8]) -> Result<(), BufferError> {
        if !params.is_empty() {
            return Err(BufferError::Restore(format!(
                "unexpected parameters {params:?}"
            )));
        }

        let mut messages = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let start = rest;
            rmpv::decode::read_value(&mut rest)
                .map_err(|e| BufferError::Restore(e.to_string()))?;
            let mut message = start[..start.len() - rest.len()].to_vec();
            if message.first() != Some(&MESSAGE_HEADER) {
                return Err(BufferError::Restore(
                    "saved message is not a 3 element array".to_string(),
                ));
            }
            self.apply_ack_header(&mut message)?;
            messages.push(Bytes::from(message));
        }

        self.reserve(messages.iter().map(Bytes::len).sum())?;
        self.messages().extend(messages);
        Ok(())
    }
}
