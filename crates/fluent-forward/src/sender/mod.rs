// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transports that deliver encoded frames to collectors.

use async_trait::async_trait;

pub mod heartbeat;
pub mod multi;
pub mod tcp;

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error talking to {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out talking to {target}")]
    Timeout { target: String, written: bool },
    #[error("ack token mismatch from {target}: expected={expected}, got={actual}")]
    AckMismatch {
        target: String,
        expected: String,
        actual: String,
    },
    #[error("failed to encode ack token: {0}")]
    Encoding(#[from] crate::errors::EncodeError),
    #[error("no sender targets configured")]
    NoTargets,
    #[error("all {attempts} targets failed, last error: {last}")]
    AllTargetsFailed {
        attempts: usize,
        nothing_sent: bool,
        #[source]
        last: Box<SenderError>,
    },
}

impl SenderError {
    /// True when no byte of the payload can have reached a collector.
    #[must_use]
    pub fn nothing_sent(&self) -> bool {
        match self {
            SenderError::Connect { .. } | SenderError::NoTargets | SenderError::Encoding(_) => {
                true
            }
            SenderError::Timeout { written, .. } => !written,
            SenderError::AllTargetsFailed { nothing_sent, .. } => *nothing_sent,
            SenderError::Io { .. } | SenderError::AckMismatch { .. } => false,
        }
    }
}

/// A transport for forward protocol frames.
///
/// A frame handed over as several segments is written contiguously: no other frame's bytes
/// are interleaved on the same connection.
#[async_trait]
pub trait Sender: Send + Sync + std::fmt::Debug {
    /// Human readable destination, used in logs and failover bookkeeping.
    fn target(&self) -> &str;

    async fn send(&self, segments: &[&[u8]]) -> Result<(), SenderError>;

    /// Sends the segments followed by `ack_token`, then waits for the collector to echo it.
    async fn send_with_ack(&self, segments: &[&[u8]], ack_token: &[u8])
        -> Result<(), SenderError>;

    async fn close(&self) -> Result<(), SenderError>;
}
