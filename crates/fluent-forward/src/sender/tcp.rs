// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::encode;
use crate::sender::{Sender, SenderError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 24224;

/// Upper bound of a single ack response read.
const ACK_RESPONSE_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSenderConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Bound on writing one frame. A collector that stops reading fails the send after this.
    pub write_timeout: Duration,
    /// How long to wait for the ack response.
    pub read_timeout: Duration,
}

impl Default for TcpSenderConfig {
    fn default() -> Self {
        TcpSenderConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpSenderConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpSenderConfig {
            host: host.into(),
            port,
            ..Default::default()
        }
    }
}

/// Sends frames over a single, lazily opened TCP connection.
///
/// A connection that hits any error is dropped; the next call opens a new one.
#[derive(Debug)]
pub struct TcpSender {
    config: TcpSenderConfig,
    target: String,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpSender {
    #[must_use]
    pub fn new(config: TcpSenderConfig) -> Self {
        let target = format!("{}:{}", config.host, config.port);
        TcpSender {
            config,
            target,
            stream: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream, SenderError> {
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(SenderError::Connect {
                    target: self.target.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(SenderError::Timeout {
                    target: self.target.clone(),
                    written: false,
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", self.target, e);
        }
        debug!("Connected to {}", self.target);
        Ok(stream)
    }

    async fn write_segments(
        &self,
        stream: &mut TcpStream,
        segments: &[&[u8]],
    ) -> Result<(), SenderError> {
        let write = async {
            for segment in segments {
                stream.write_all(segment).await?;
            }
            stream.flush().await
        };
        match timeout(self.config.write_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.io_error(e)),
            Err(_) => Err(SenderError::Timeout {
                target: self.target.clone(),
                written: true,
            }),
        }
    }

    fn io_error(&self, source: std::io::Error) -> SenderError {
        SenderError::Io {
            target: self.target.clone(),
            source,
        }
    }

    /// Reads until the response holds one complete msgpack value, the response limit is
    /// reached or the peer closes the connection.
    async fn read_ack(&self, stream: &mut TcpStream) -> Result<Vec<u8>, SenderError> {
        let mut response = [0u8; ACK_RESPONSE_SIZE];
        let mut filled = 0;
        let read = async {
            while filled < response.len() {
                let read = stream.read(&mut response[filled..]).await?;
                if read == 0 {
                    break;
                }
                filled += read;
                if rmpv::decode::read_value(&mut &response[..filled]).is_ok() {
                    break;
                }
            }
            Ok::<(), std::io::Error>(())
        };
        match timeout(self.config.read_timeout, read).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.io_error(e)),
            Err(_) => {
                return Err(SenderError::Timeout {
                    target: self.target.clone(),
                    written: true,
                })
            }
        }
        if filled == 0 {
            return Err(self.io_error(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            )));
        }
        Ok(response[..filled].to_vec())
    }
}

#[async_trait]
impl Sender for TcpSender {
    fn target(&self) -> &str {
        &self.target
    }

    async fn send(&self, segments: &[&[u8]]) -> Result<(), SenderError> {
        let mut guard = self.stream.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };
        trace!("Sending {} segments to {}", segments.len(), self.target);
        self.write_segments(&mut stream, segments).await?;
        *guard = Some(stream);
        Ok(())
    }

    async fn send_with_ack(
        &self,
        segments: &[&[u8]],
        ack_token: &[u8],
    ) -> Result<(), SenderError> {
        let trailer = encode::ack_token(ack_token)?;
        let mut guard = self.stream.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };
        let mut framed = segments.to_vec();
        framed.push(trailer.as_slice());
        self.write_segments(&mut stream, &framed).await?;

        let response = self.read_ack(&mut stream).await?;
        match encode::decode_ack_token(&response) {
            Some(echoed) if echoed == ack_token => {
                *guard = Some(stream);
                Ok(())
            }
            echoed => Err(SenderError::AckMismatch {
                target: self.target.clone(),
                expected: String::from_utf8_lossy(ack_token).into_owned(),
                actual: String::from_utf8_lossy(echoed.as_deref().unwrap_or(&response))
                    .into_owned(),
            }),
        }
    }

    async fn close(&self) -> Result<(), SenderError> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            debug!("Closing connection to {}", self.target);
            // the peer may already be gone; the socket is released either way
            if let Err(e) = stream.shutdown().await {
                debug!("Failed to shut down connection to {}: {}", self.target, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, TcpSenderConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, TcpSenderConfig::new("127.0.0.1", port))
    }

    /// Accepts one connection, reads `expected_len` bytes and optionally answers with `reply`.
    fn spawn_peer(
        listener: TcpListener,
        expected_len: usize,
        reply: Option<Vec<u8>>,
    ) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = vec![0u8; expected_len];
            socket.read_exact(&mut received).await.unwrap();
            if let Some(reply) = reply {
                socket.write_all(&reply).await.unwrap();
            }
            received
        })
    }

    #[tokio::test]
    async fn test_send_writes_segments_in_order() {
        let (listener, config) = listener().await;
        let peer = spawn_peer(listener, 6, None);

        let sender = TcpSender::new(config);
        sender.send(&[&b"abc"[..], &b"def"[..]]).await.unwrap();

        assert_eq!(peer.await.unwrap(), b"abcdef".to_vec());
        sender.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_with_ack_accepts_echoed_token() {
        let (listener, config) = listener().await;
        let trailer = encode::ack_token(b"token-1").unwrap();
        let peer = spawn_peer(listener, 3 + trailer.len(), Some(trailer.clone()));

        let sender = TcpSender::new(config);
        sender.send_with_ack(&[&b"abc"[..]], b"token-1").await.unwrap();

        let received = peer.await.unwrap();
        assert_eq!(&received[..3], b"abc");
        assert_eq!(&received[3..], trailer.as_slice());
    }

    #[tokio::test]
    async fn test_ack_split_across_reads_is_accepted() {
        let (listener, config) = listener().await;
        let trailer = encode::ack_token(b"token-1").unwrap();
        let expected_len = 3 + trailer.len();
        let reply = trailer.clone();
        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = vec![0u8; expected_len];
            socket.read_exact(&mut received).await.unwrap();
            socket.write_all(&reply[..3]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            socket.write_all(&reply[3..]).await.unwrap();
            socket
        });

        let sender = TcpSender::new(config);
        sender.send_with_ack(&[&b"abc"[..]], b"token-1").await.unwrap();
        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_that_stops_reading_times_out_write() {
        let (listener, mut config) = listener().await;
        config.write_timeout = Duration::from_millis(200);
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            // keep the connection open without ever reading from it
            let _ = hold_rx.await;
            drop(socket);
        });

        let sender = TcpSender::new(config);
        let payload = vec![0u8; 64 * 1024 * 1024];
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            sender.send(&[payload.as_slice()]),
        )
        .await
        .expect("send should give up on its own");
        let err = result.unwrap_err();
        assert!(matches!(err, SenderError::Timeout { written: true, .. }));
        assert!(!err.nothing_sent());
        assert!(sender.stream.lock().await.is_none());
        drop(hold_tx);
    }

    #[tokio::test]
    async fn test_send_with_ack_rejects_other_token() {
        let (listener, config) = listener().await;
        let trailer = encode::ack_token(b"token-1").unwrap();
        let wrong = encode::ack_token(b"token-2").unwrap();
        let peer = spawn_peer(listener, 3 + trailer.len(), Some(wrong));

        let sender = TcpSender::new(config);
        let err = sender
            .send_with_ack(&[&b"abc"[..]], b"token-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::AckMismatch { ref actual, .. } if actual == "token-2"));
        assert!(!err.nothing_sent());
        peer.await.unwrap();
        // the connection is discarded after a mismatch
        assert!(sender.stream.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_connection_refused_reports_nothing_sent() {
        let (listener, config) = listener().await;
        drop(listener);

        let sender = TcpSender::new(config);
        let err = sender.send(&[&b"abc"[..]]).await.unwrap_err();
        assert!(matches!(err, SenderError::Connect { .. }));
        assert!(err.nothing_sent());
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_goes_away() {
        let (listener, config) = listener().await;
        let sender = TcpSender::new(config);

        let one: [&[u8]; 1] = [&b"one"[..]];
        let (accepted, sent) = tokio::join!(listener.accept(), sender.send(&one));
        sent.unwrap();
        let (mut socket, _) = accepted.unwrap();
        let mut first = [0u8; 3];
        socket.read_exact(&mut first).await.unwrap();
        drop(socket);

        // writes to a closed peer eventually fail; keep sending until the sender notices
        let mut failed = false;
        for _ in 0..50 {
            if sender.send(&[&b"two"[..]]).await.is_err() {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed);
        assert!(sender.stream.lock().await.is_none());

        let peer = spawn_peer(listener, 5, None);
        sender.send(&[&b"three"[..]]).await.unwrap();
        assert_eq!(peer.await.unwrap(), b"three".to_vec());
    }
}
