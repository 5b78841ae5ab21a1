// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use fluent_forward::client::Client;
use fluent_forward::config::ClientConfig;
use fluent_forward::errors::BufferError;
use fluent_forward::Fields;

const DEFAULT_TAG: &str = "forward.relay";
const FULL_BUFFER_RETRIES: u32 = 50;
const FULL_BUFFER_BACKOFF: Duration = Duration::from_millis(100);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("FLUENT_FORWARD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error reading forward configuration: {e}");
            return;
        }
    };
    let tag = env::var("FLUENT_FORWARD_TAG").unwrap_or_else(|_| DEFAULT_TAG.to_string());

    let client = match Client::from_config(config) {
        Ok(client) => client,
        Err(e) => {
            error!("Error creating forward client: {e}");
            return;
        }
    };
    info!("Relaying stdin to forward collectors with tag {tag}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    relay(&client, &tag, &record_from_line(&line)).await;
                }
                Ok(None) => {
                    debug!("Reached end of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read from stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    match client.close().await {
        Ok(()) => info!("Forward client closed"),
        Err(e) => error!("Forward client closed with unsent data: {e}"),
    }
}

/// JSON objects are forwarded as is. Anything else is wrapped under a `message` key.
fn record_from_line(line: &str) -> Fields {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(serde_json::Value::Object(fields)) => fields,
        _ => {
            let mut fields = Fields::new();
            fields.insert(
                "message".to_string(),
                serde_json::Value::String(line.to_string()),
            );
            fields
        }
    }
}

async fn relay(client: &Client, tag: &str, fields: &Fields) {
    for _ in 0..FULL_BUFFER_RETRIES {
        match client.emit(tag, fields).await {
            Ok(()) => return,
            Err(BufferError::Full { .. }) => {
                if let Err(e) = client.flush().await {
                    debug!("Flush while buffer full failed: {e}");
                }
                sleep(FULL_BUFFER_BACKOFF).await;
            }
            // the record is buffered, a later flush retries delivery
            Err(e) if e.nothing_sent() => {
                debug!("Record buffered, collector unavailable: {e}");
                return;
            }
            Err(e) => {
                warn!("Failed to relay record: {e}");
                return;
            }
        }
    }
    error!("Dropping record, buffer still full after {FULL_BUFFER_RETRIES} attempts");
}
