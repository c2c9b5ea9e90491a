//! # Text-Generation Forwarder
//!
//! Sends one finalized utterance to the streaming generation endpoint and
//! yields the response as an ordered sequence of text fragments on a channel.
//! The endpoint streams newline-delimited chunks; each line is either a JSON
//! object `{"text": "..."}` or a raw text chunk.
//!
//! Cancellation is cooperative: when the session abandons a turn it drops the
//! receiving end, the pump task notices on its next send and stops reading.
//! The in-flight HTTP request completes on the vendor side but its results
//! are discarded.

use crate::config::GenerationConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

/// Text fragments buffered toward the session.
const FRAGMENT_CHANNEL_SIZE: usize = 32;

/// Call contract for the generation vendor.
///
/// `stream` resolves once the endpoint accepted the request; the returned
/// channel then yields fragments in generation order. An `Err` item means the
/// stream broke mid-turn and the turn must be aborted.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn stream(&self, input: &str, user_id: &str) -> Result<mpsc::Receiver<Result<String>>>;
}

#[derive(Debug, Deserialize)]
struct WireFragment {
    #[serde(default)]
    text: String,
}

/// Streaming HTTP generator.
pub struct HttpGenerator {
    client: reqwest::Client,
    config: GenerationConfig,
}

impl HttpGenerator {
    pub fn new(config: GenerationConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl TextGenerator for HttpGenerator {
    async fn stream(&self, input: &str, user_id: &str) -> Result<mpsc::Receiver<Result<String>>> {
        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_SIZE);

        // Without a configured endpoint the assistant just echoes the
        // utterance back as a single fragment.
        if self.config.endpoint.is_empty() {
            debug!("no generation endpoint configured, echoing input");
            let input = input.to_string();
            tokio::spawn(async move {
                let _ = tx.send(Ok(input)).await;
            });
            return Ok(rx);
        }

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "input": input, "user_id": user_id }))
            .send()
            .await
            .context("generation request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("generation endpoint returned {}", response.status());
        }

        tokio::spawn(pump_fragments(response, tx));
        Ok(rx)
    }
}

/// Read the response body chunk by chunk, re-assemble newline-delimited
/// fragments, and forward them until the stream ends or the turn is
/// abandoned.
async fn pump_fragments(response: reqwest::Response, tx: mpsc::Sender<Result<String>>) {
    let mut body = response.bytes_stream();
    let mut partial: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tx
                    .send(Err(anyhow!("generation stream error: {err}")))
                    .await;
                return;
            }
        };

        partial.extend_from_slice(&bytes);
        while let Some(pos) = partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(fragment) = parse_fragment_line(&line) {
                if tx.send(Ok(fragment)).await.is_err() {
                    // Turn abandoned; stop reading.
                    return;
                }
            }
        }
    }

    // The endpoint may not terminate its last chunk with a newline.
    if !partial.is_empty() {
        let line = String::from_utf8_lossy(&partial).into_owned();
        if let Some(fragment) = parse_fragment_line(&line) {
            let _ = tx.send(Ok(fragment)).await;
        }
    }
}

/// Extract the fragment text from one line of the response stream.
fn parse_fragment_line(raw: &str) -> Option<String> {
    let line = raw.strip_suffix('\n').unwrap_or(raw);
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<WireFragment>(line.trim()) {
        Ok(wire) if !wire.text.is_empty() => Some(wire.text),
        // Valid JSON without text (e.g. metadata lines) carries nothing to say.
        Ok(_) => None,
        // Not JSON: treat the whole line as a raw text chunk.
        Err(_) => Some(line.to_string()),
    }
}
