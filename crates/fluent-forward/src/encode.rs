// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! MessagePack encoding for the forward protocol.
//!
//! A packed forward frame is `[tag, bin(entries), ack_token?]` where `entries` is the
//! concatenation of `[timestamp, fields]` arrays. A single message frame is
//! `[tag, timestamp, fields, ack_token?]`.
//!
//! The entries of a packed frame are carried as msgpack `bin`. Fluentd and fluent-bit accept
//! `bin` as well as the legacy raw `str` header for this element.

use crate::errors::EncodeError;
use crate::Fields;

/// Header byte of a fixarray with three elements.
pub const MESSAGE_HEADER: u8 = 0x93;

/// Header byte of a fixarray with four elements, used when an ack token trails the message.
pub const MESSAGE_HEADER_WITH_ACK: u8 = 0x94;

/// Encodes one `[timestamp, fields]` entry for a packed forward chunk.
pub fn entry(timestamp: i64, fields: &Fields) -> Result<Vec<u8>, EncodeError> {
    Ok(rmp_serde::to_vec(&(timestamp, fields))?)
}

/// Encodes a self-contained `[tag, timestamp, fields]` message.
pub fn message(tag: &str, timestamp: i64, fields: &Fields) -> Result<Vec<u8>, EncodeError> {
    Ok(rmp_serde::to_vec(&(tag, timestamp, fields))?)
}

/// Builds the header that precedes a packed forward payload of `payload_len` bytes.
pub fn packed_forward_header(
    tag: &str,
    payload_len: usize,
    with_ack: bool,
) -> Result<Vec<u8>, EncodeError> {
    let len = u32::try_from(payload_len).map_err(|_| EncodeError::PayloadTooLarge(payload_len))?;
    let mut header = Vec::with_capacity(tag.len() + 16);
    rmp::encode::write_array_len(&mut header, if with_ack { 3 } else { 2 })?;
    rmp::encode::write_str(&mut header, tag)?;
    rmp::encode::write_bin_len(&mut header, len)?;
    Ok(header)
}

/// Encodes the ack token trailer appended as the last frame element.
pub fn ack_token(token: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let len = u32::try_from(token.len()).map_err(|_| EncodeError::PayloadTooLarge(token.len()))?;
    let mut trailer = Vec::with_capacity(token.len() + 5);
    rmp::encode::write_str_len(&mut trailer, len)?;
    trailer.extend_from_slice(token);
    Ok(trailer)
}

/// Extracts the echoed token from an ack response.
///
/// Collectors answer either with the bare token or with a `{"ack": token}` map.
pub fn decode_ack_token(response: &[u8]) -> Option<Vec<u8>> {
    let mut reader = response;
    let value = rmpv::decode::read_value(&mut reader).ok()?;
    token_bytes(&value)
}

fn token_bytes(value: &rmpv::Value) -> Option<Vec<u8>> {
    match value {
        rmpv::Value::String(s) => Some(s.as_bytes().to_vec()),
        rmpv::Value::Binary(b) => Some(b.clone()),
        rmpv::Value::Map(entries) => entries
            .iter()
            .find(|(k, _)| k.as_str() == Some("ack"))
            .and_then(|(_, v)| token_bytes(v)),
        _ => None,
    }
}
