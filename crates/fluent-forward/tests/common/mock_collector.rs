// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal forward protocol collector for testing senders end to end

use rmpv::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone, Debug)]
pub struct ReceivedRecord {
    pub tag: String,
    pub timestamp: i64,
    pub fields: Value,
}

impl ReceivedRecord {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields
            .as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }
}

#[derive(Default, Debug)]
struct Received {
    records: Vec<ReceivedRecord>,
    frames: usize,
    tokens: Vec<String>,
}

#[derive(Clone)]
pub struct MockCollector {
    pub addr: SocketAddr,
    received: Arc<Mutex<Received>>,
    bad_ack: Arc<AtomicBool>,
}

impl MockCollector {
    /// Start a collector on a random port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock collector");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let collector = MockCollector {
            addr,
            received: Arc::new(Mutex::new(Received::default())),
            bad_ack: Arc::new(AtomicBool::new(false)),
        };

        let accepting = collector.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connection = accepting.clone();
                tokio::spawn(async move { connection.serve(stream).await });
            }
        });
        collector
    }

    /// Answer every ack request with a token that was never sent
    pub fn answer_wrong_acks(&self) {
        self.bad_ack.store(true, Ordering::SeqCst);
    }

    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    pub fn records(&self) -> Vec<ReceivedRecord> {
        self.received.lock().unwrap().records.clone()
    }

    pub fn records_for(&self, tag: &str) -> Vec<ReceivedRecord> {
        self.records().into_iter().filter(|r| r.tag == tag).collect()
    }

    pub fn frames(&self) -> usize {
        self.received.lock().unwrap().frames
    }

    pub fn tokens(&self) -> Vec<String> {
        self.received.lock().unwrap().tokens.clone()
    }

    /// Poll until at least `count` records arrived or the timeout elapses
    pub async fn wait_for_records(&self, count: usize, timeout: Duration) -> Vec<ReceivedRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let records = self.records();
            if records.len() >= count || tokio::time::Instant::now() >= deadline {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn serve(self, mut stream: TcpStream) {
        let mut pending = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let read = match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(read) => read,
            };
            pending.extend_from_slice(&chunk[..read]);

            // decode as many complete frames as the bytes so far contain
            loop {
                let mut cursor = pending.as_slice();
                let Ok(frame) = rmpv::decode::read_value(&mut cursor) else {
                    break;
                };
                let consumed = pending.len() - cursor.len();
                pending.drain(..consumed);

                if let Some(token) = self.record_frame(frame) {
                    let token = if self.bad_ack.load(Ordering::SeqCst) {
                        format!("not-{token}")
                    } else {
                        token
                    };
                    let mut response = Vec::new();
                    rmpv::encode::write_value(
                        &mut response,
                        &Value::Map(vec![(Value::from("ack"), Value::from(token))]),
                    )
                    .unwrap();
                    if stream.write_all(&response).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Stores the records of one frame and returns its ack token, if any
    fn record_frame(&self, frame: Value) -> Option<String> {
        let Value::Array(elements) = frame else {
            panic!("frame is not an array");
        };
        let tag = elements[0].as_str().expect("tag is not a string").to_string();
        let mut received = self.received.lock().unwrap();
        received.frames += 1;

        let token = match &elements[1] {
            // [tag, bin(entries), token?]
            Value::Binary(entries) => {
                let mut cursor = entries.as_slice();
                while !cursor.is_empty() {
                    let entry = rmpv::decode::read_value(&mut cursor).expect("corrupt entry");
                    let entry = entry.as_array().expect("entry is not an array");
                    received.records.push(ReceivedRecord {
                        tag: tag.clone(),
                        timestamp: entry[0].as_i64().expect("timestamp"),
                        fields: entry[1].clone(),
                    });
                }
                elements.get(2)
            }
            // [tag, timestamp, fields, token?]
            timestamp => {
                received.records.push(ReceivedRecord {
                    tag,
                    timestamp: timestamp.as_i64().expect("timestamp"),
                    fields: elements[2].clone(),
                });
                elements.get(3)
            }
        };

        let token = token.and_then(Value::as_str).map(str::to_string);
        if let Some(token) = &token {
            received.tokens.push(token.clone());
        }
        token
    }
}

/// A local port nothing listens on
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
