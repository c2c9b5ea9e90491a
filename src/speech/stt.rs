//! # Speech-to-Text Adapter
//!
//! Wraps a duplex streaming recognition endpoint behind the
//! [`SpeechRecognizer`] trait: raw PCM16LE audio frames go out as binary
//! WebSocket messages, interim/final transcript events come back as JSON.
//!
//! Each opened stream covers at most one utterance; after a final event the
//! session drops the handle and opens a fresh stream. A transport fault simply
//! ends the event channel, which the session treats as a recoverable
//! condition, never a fatal one.

use crate::config::RecognitionConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Audio frames buffered toward the vendor before backpressure drops them.
const AUDIO_CHANNEL_SIZE: usize = 64;

/// Transcript events buffered toward the session.
const EVENT_CHANNEL_SIZE: usize = 16;

/// One recognition result for the current utterance. Interim events may be
/// superseded by later interim events; exactly one final event closes the
/// utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

/// Live handle to one recognition stream.
///
/// Dropping the audio sender asks the vendor stream to close; the event
/// channel ends when the vendor side is done (or faulted).
pub struct RecognizerStream {
    pub audio: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::Receiver<TranscriptEvent>,
}

/// Call contract for the recognition vendor.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn open_stream(&self, config: &RecognitionConfig) -> Result<RecognizerStream>;
}

/// Transcript event as the vendor endpoint sends it.
#[derive(Debug, Deserialize)]
struct WireTranscript {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
}

/// Duplex WebSocket recognizer.
pub struct WsRecognizer;

impl WsRecognizer {
    pub fn new() -> Self {
        Self
    }

    fn stream_url(config: &RecognitionConfig) -> String {
        format!(
            "{}?encoding=linear16&sample_rate={}&language={}",
            config.endpoint, config.sample_rate, config.language
        )
    }
}

impl Default for WsRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechRecognizer for WsRecognizer {
    async fn open_stream(&self, config: &RecognitionConfig) -> Result<RecognizerStream> {
        anyhow::ensure!(
            !config.endpoint.is_empty(),
            "no recognition endpoint configured"
        );

        let url = Self::stream_url(config);
        let (ws, _) = connect_async(&url)
            .await
            .context("failed to connect recognition stream")?;
        let (mut sink, mut stream) = ws.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel::<TranscriptEvent>(EVENT_CHANNEL_SIZE);

        tokio::spawn(async move {
            let mut audio_open = true;
            loop {
                tokio::select! {
                    frame = audio_rx.recv(), if audio_open => match frame {
                        Some(bytes) => {
                            if sink.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Session dropped its sender: tell the vendor we
                            // are done but keep draining pending events.
                            audio_open = false;
                            let _ = sink.send(Message::Close(None)).await;
                        }
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let wire = match serde_json::from_str::<WireTranscript>(&text) {
                                Ok(wire) => wire,
                                Err(err) => {
                                    debug!(%err, "discarding unparseable transcript event");
                                    continue;
                                }
                            };
                            if wire.text.is_empty() {
                                continue;
                            }
                            let event = TranscriptEvent {
                                text: wire.text,
                                is_final: wire.is_final,
                            };
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(%err, "recognition stream transport error");
                            break;
                        }
                    },
                }
            }
        });

        Ok(RecognizerStream {
            audio: audio_tx,
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_transcript_parsing() {
        let wire: WireTranscript =
            serde_json::from_str(r#"{"text":"hello there","is_final":true}"#).unwrap();
        assert_eq!(wire.text, "hello there");
        assert!(wire.is_final);
    }

    #[test]
    fn test_wire_transcript_defaults_to_interim() {
        let wire: WireTranscript = serde_json::from_str(r#"{"text":"hel"}"#).unwrap();
        assert!(!wire.is_final);
    }

    #[test]
    fn test_stream_url_carries_audio_format() {
        let config = RecognitionConfig {
            endpoint: "wss://stt.example.com/v1/stream".to_string(),
            language: "pt-PT".to_string(),
            sample_rate: 16000,
        };
        let url = WsRecognizer::stream_url(&config);
        assert!(url.starts_with("wss://stt.example.com/v1/stream?"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("language=pt-PT"));
    }
}
