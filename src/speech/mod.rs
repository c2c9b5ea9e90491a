//! # Speech Pipeline Components
//!
//! The per-utterance building blocks of the voice pipeline:
//!
//! - **stt**: duplex streaming speech recognition (audio frames in,
//!   transcript events out)
//! - **segmenter**: pure sentence-flush policy over streamed text fragments
//! - **tts**: per-sentence speech synthesis
//!
//! The voice session (`crate::voice`) wires these together; nothing in this
//! module knows about WebSocket connections or session state.

pub mod segmenter;
pub mod stt;
pub mod tts;

pub use segmenter::{FlushPolicy, SentenceBuffer};
pub use stt::{RecognizerStream, SpeechRecognizer, TranscriptEvent, WsRecognizer};
pub use tts::{HttpSynthesizer, SpeechSynthesizer, SynthesizedAudio};
