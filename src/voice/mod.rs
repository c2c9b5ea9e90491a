//! # Voice Session Management
//!
//! Ties the speech pipeline components into one per-connection session:
//! the state machine that routes audio to recognition, final transcripts to
//! generation, and generated sentences to synthesis, plus the process-wide
//! registry that caps concurrent sessions per user.

pub mod registry;
pub mod session;

pub use registry::{AdmissionDenied, SessionRegistry};
pub use session::{EngineClients, ServerMessage, SessionState, VoiceSession};
