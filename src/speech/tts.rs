//! # Text-to-Speech Synthesizer
//!
//! One sentence in, one audio payload out. The session calls this serially,
//! never more than one outstanding synthesis call per session, so audio
//! chunks reach the client in sentence-flush order.

use crate::config::SynthesisConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Synthesized audio for one flushed sentence.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub data: Vec<u8>,
    pub encoding: String,
}

/// Call contract for the synthesis vendor.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, config: &SynthesisConfig) -> Result<SynthesizedAudio>;
}

#[derive(Debug, Deserialize)]
struct SynthesisResponse {
    audio_content: String,
}

/// HTTP synthesizer: POSTs the sentence, receives base64 audio back.
pub struct HttpSynthesizer {
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn build_request(text: &str, config: &SynthesisConfig) -> serde_json::Value {
        json!({
            "input": { "text": text },
            "voice": {
                "language_code": config.language,
                "name": config.voice,
            },
            "audio_config": {
                "encoding": config.encoding,
                "sample_rate_hertz": config.sample_rate,
            },
        })
    }
}

impl Default for HttpSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, config: &SynthesisConfig) -> Result<SynthesizedAudio> {
        anyhow::ensure!(
            !config.endpoint.is_empty(),
            "no synthesis endpoint configured"
        );

        debug!(chars = text.len(), voice = %config.voice, "synthesizing sentence");

        let response = self
            .client
            .post(&config.endpoint)
            .json(&Self::build_request(text, config))
            .send()
            .await
            .context("synthesis request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("synthesis endpoint error {status}: {body}");
        }

        let body: SynthesisResponse = response
            .json()
            .await
            .context("invalid synthesis response")?;
        let data = BASE64
            .decode(body.audio_content)
            .context("synthesis payload is not valid base64")?;
        anyhow::ensure!(!data.is_empty(), "synthesis returned empty audio");

        Ok(SynthesizedAudio {
            data,
            encoding: config.encoding.clone(),
        })
    }
}
