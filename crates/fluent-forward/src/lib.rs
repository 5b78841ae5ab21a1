// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side forwarding of structured records to fluentd-compatible collectors.
//!
//! Records are accumulated by a [`buffer::Buffer`] strategy, drained by a [`flusher::Flusher`]
//! through a [`sender::Sender`], and persisted by [`backup::FileBackup`] when they cannot be
//! delivered before shutdown. [`client::Client`] wires the pieces together.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backup;
pub mod buffer;
pub mod client;
pub mod config;
pub mod encode;
pub mod errors;
pub mod flusher;
pub mod sender;

/// Key/value payload of a single record. Keys keep their insertion order on the wire.
pub type Fields = serde_json::Map<String, serde_json::Value>;
