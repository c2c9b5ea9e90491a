//! # Voice Session State Machine
//!
//! One `VoiceSession` per accepted connection. Three logical flows run
//! concurrently inside it, coordinated by the state machine:
//!
//! 1. inbound audio frames → recognition sink (`push_audio`, never blocks)
//! 2. recognition read-loop → transcript events → client
//! 3. turn pipeline: generation read-loop → sentence segmenter → serial
//!    synthesis → audio chunks to the client
//!
//! Flow 3 is cancellable as a unit through a per-turn `CancellationToken`:
//! a stop control message ("barge-in") aborts it at its current suspension
//! point, discards the sentence buffer unflushed, and suppresses all further
//! audio for that turn. Outstanding vendor calls complete but their results
//! are discarded.
//!
//! ## States:
//! `Listening → Thinking → Speaking → Listening`, with `Stopping` entered on
//! barge-in and `Closed` terminal on connection teardown.

use crate::config::{AppConfig, RecognitionConfig, SynthesisConfig};
use crate::generation::TextGenerator;
use crate::speech::{FlushPolicy, SentenceBuffer, SpeechRecognizer, SpeechSynthesizer};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before recreating a faulted recognition stream.
const RECOGNIZER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Messages the session emits toward the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Interim or final transcript of the user's speech.
    #[serde(rename = "stt")]
    Transcript { interim: bool, text: String },

    /// One generated text fragment, in generation order.
    #[serde(rename = "assistantText")]
    AssistantText { text: String, sequence: u64 },

    /// One synthesized sentence, in sentence-flush order.
    #[serde(rename = "audioChunk")]
    AudioChunk {
        data: String,
        encoding: String,
        sequence: u64,
    },

    /// Acknowledgement of a barge-in.
    #[serde(rename = "stopped")]
    Stopped,

    /// Non-fatal notice; never closes the connection.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Resting; audio is being recognized, no turn in flight.
    Listening,
    /// A final transcript was dispatched; generation is streaming.
    Thinking,
    /// Sentences are being synthesized and delivered.
    Speaking,
    /// Barge-in received; cooling down before accepting new input.
    Stopping,
    /// Terminal; all resources released.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
            SessionState::Stopping => "stopping",
            SessionState::Closed => "closed",
        }
    }
}

/// Vendor clients shared by all sessions.
#[derive(Clone)]
pub struct EngineClients {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// How a turn's fragment loop ended.
enum TurnEnd {
    Completed,
    Cancelled,
    Aborted,
}

/// Per-connection voice pipeline.
///
/// Owned exclusively by the gateway actor that created it; internal mutability
/// lets the actor thread and the spawned pipeline tasks coordinate without
/// sharing the session across connections.
pub struct VoiceSession {
    pub session_id: String,
    pub user_id: String,

    recognition: RecognitionConfig,
    synthesis: SynthesisConfig,
    stop_cooldown: Duration,

    engines: EngineClients,

    /// Outbound path to the client; drained by the gateway actor.
    outbound: mpsc::UnboundedSender<ServerMessage>,

    state: RwLock<SessionState>,

    /// Audio sink of the currently open recognition stream, if any.
    stt_sink: RwLock<Option<mpsc::Sender<Vec<u8>>>>,

    /// Cancellation for the in-flight turn, if any.
    turn_cancel: Mutex<Option<CancellationToken>>,

    /// Cancelled exactly once, on connection teardown.
    closing: CancellationToken,

    transcript_seq: AtomicU64,
    fragment_seq: AtomicU64,
    audio_seq: AtomicU64,
}

impl VoiceSession {
    pub fn new(
        session_id: String,
        user_id: String,
        config: &AppConfig,
        engines: EngineClients,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            user_id,
            recognition: config.recognition.clone(),
            synthesis: config.synthesis.clone(),
            stop_cooldown: Duration::from_millis(config.session.stop_cooldown_ms),
            engines,
            outbound,
            state: RwLock::new(SessionState::Listening),
            stt_sink: RwLock::new(None),
            turn_cancel: Mutex::new(None),
            closing: CancellationToken::new(),
            transcript_seq: AtomicU64::new(0),
            fragment_seq: AtomicU64::new(0),
            audio_seq: AtomicU64::new(0),
        })
    }

    /// Start the recognition read-loop. Called once by the gateway when the
    /// connection is established.
    pub fn start(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move { session.recognizer_loop().await });
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    /// Forward one inbound audio frame to the recognition stream.
    ///
    /// Never blocks the transport: frames arriving while no stream is open,
    /// while the vendor is backed up, or after teardown are dropped silently.
    pub fn push_audio(&self, frame: &[u8]) {
        if self.state() == SessionState::Closed {
            return;
        }

        // PCM16LE frames must carry whole samples.
        if frame.is_empty() || frame.len() % 2 != 0 {
            debug!(
                session_id = %self.session_id,
                len = frame.len(),
                "dropping malformed audio frame"
            );
            return;
        }

        if let Some(sink) = self.stt_sink.read().unwrap().as_ref() {
            if sink.try_send(frame.to_vec()).is_err() {
                debug!(session_id = %self.session_id, "recognition sink full, dropping frame");
            }
        }
    }

    /// Barge-in: abandon the in-flight turn, discard buffered text, and
    /// return to `Listening` after a short cooldown.
    pub fn handle_stop(self: &Arc<Self>) {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                SessionState::Thinking | SessionState::Speaking => {
                    *state = SessionState::Stopping;
                }
                other => {
                    debug!(
                        session_id = %self.session_id,
                        state = other.as_str(),
                        "stop ignored"
                    );
                    return;
                }
            }
        }

        if let Some(token) = self.turn_cancel.lock().unwrap().take() {
            token.cancel();
        }
        self.emit(ServerMessage::Stopped);
        info!(session_id = %self.session_id, "turn interrupted by client");

        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(session.stop_cooldown).await;
            let mut state = session.state.write().unwrap();
            if *state == SessionState::Stopping {
                *state = SessionState::Listening;
                debug!(session_id = %session.session_id, "cooldown elapsed, listening again");
            }
        });
    }

    /// Release everything. Idempotent; reachable from any state.
    pub fn close(&self) {
        {
            let mut state = self.state.write().unwrap();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        self.closing.cancel();
        if let Some(token) = self.turn_cancel.lock().unwrap().take() {
            token.cancel();
        }
        *self.stt_sink.write().unwrap() = None;

        info!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            transcripts = self.transcript_seq.load(Ordering::Relaxed),
            fragments = self.fragment_seq.load(Ordering::Relaxed),
            audio_chunks = self.audio_seq.load(Ordering::Relaxed),
            "voice session closed"
        );
    }

    /// Flow 2: keep exactly one recognition stream open, forward its events,
    /// and recreate it after each utterance or vendor fault. A fault surfaces
    /// to the client only as a non-fatal notice; the connection stays up.
    async fn recognizer_loop(self: Arc<Self>) {
        let mut notified_failure = false;

        loop {
            if self.closing.is_cancelled() {
                break;
            }

            let opened = tokio::select! {
                _ = self.closing.cancelled() => break,
                opened = self.engines.recognizer.open_stream(&self.recognition) => opened,
            };

            let mut stream = match opened {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(session_id = %self.session_id, %err, "failed to open recognition stream");
                    if !notified_failure {
                        self.emit(ServerMessage::Error {
                            message: "speech recognition unavailable, retrying".to_string(),
                        });
                        notified_failure = true;
                    }
                    if !self.sleep_unless_closing(RECOGNIZER_RETRY_DELAY).await {
                        break;
                    }
                    continue;
                }
            };
            notified_failure = false;
            *self.stt_sink.write().unwrap() = Some(stream.audio.clone());

            let mut saw_final = false;
            loop {
                let event = tokio::select! {
                    _ = self.closing.cancelled() => {
                        *self.stt_sink.write().unwrap() = None;
                        return;
                    }
                    event = stream.events.recv() => event,
                };
                let Some(event) = event else { break };

                let sequence = self.transcript_seq.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(
                    session_id = %self.session_id,
                    sequence,
                    is_final = event.is_final,
                    "transcript event"
                );
                self.emit(ServerMessage::Transcript {
                    interim: !event.is_final,
                    text: event.text.clone(),
                });

                if event.is_final {
                    saw_final = true;
                    info!(session_id = %self.session_id, text = %event.text, "final transcript");
                    self.start_turn(event.text);
                    break;
                }
            }

            // The utterance is over (or the stream faulted): a fresh stream
            // serves the next one.
            *self.stt_sink.write().unwrap() = None;
            drop(stream);

            if !saw_final && !self.closing.is_cancelled() {
                warn!(session_id = %self.session_id, "recognition stream ended unexpectedly, recreating");
                self.emit(ServerMessage::Error {
                    message: "speech recognition interrupted, recovering".to_string(),
                });
                if !self.sleep_unless_closing(RECOGNIZER_RETRY_DELAY).await {
                    break;
                }
            }
        }
    }

    /// Dispatch one final transcript into a turn. Finals arriving while a
    /// turn is already active are delivered as transcripts but start nothing.
    fn start_turn(self: &Arc<Self>, transcript: String) {
        {
            let mut state = self.state.write().unwrap();
            if *state != SessionState::Listening {
                debug!(
                    session_id = %self.session_id,
                    state = state.as_str(),
                    "turn already active, not dispatching transcript"
                );
                return;
            }
            *state = SessionState::Thinking;
        }

        let token = CancellationToken::new();
        *self.turn_cancel.lock().unwrap() = Some(token.clone());

        let session = Arc::clone(self);
        tokio::spawn(async move { session.run_turn(transcript, token).await });
    }

    /// Flow 3: generation read-loop → segmenter → serial synthesis.
    async fn run_turn(self: Arc<Self>, transcript: String, cancel: CancellationToken) {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = self.engines.generator.stream(&transcript, &self.user_id) => opened,
        };

        let mut fragments = match opened {
            Ok(fragments) => fragments,
            Err(err) => {
                error!(session_id = %self.session_id, %err, "generation request failed");
                self.emit(ServerMessage::Error {
                    message: "failed to generate a response".to_string(),
                });
                self.finish_turn();
                return;
            }
        };

        let mut buffer = SentenceBuffer::new(FlushPolicy::default());

        let outcome = 'turn: loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break 'turn TurnEnd::Cancelled,
                item = fragments.recv() => item,
            };
            let Some(item) = item else {
                break 'turn TurnEnd::Completed;
            };

            let fragment = match item {
                Ok(fragment) => fragment,
                Err(err) => {
                    error!(session_id = %self.session_id, %err, "generation stream broke mid-turn");
                    self.emit(ServerMessage::Error {
                        message: "response generation was interrupted".to_string(),
                    });
                    break 'turn TurnEnd::Aborted;
                }
            };

            let sequence = self.fragment_seq.fetch_add(1, Ordering::Relaxed) + 1;
            self.emit(ServerMessage::AssistantText {
                text: fragment.clone(),
                sequence,
            });

            for sentence in buffer.push(&fragment) {
                if !self.speak(&sentence, &cancel).await {
                    break 'turn TurnEnd::Cancelled;
                }
            }
        };

        match outcome {
            TurnEnd::Completed => {
                if let Some(rest) = buffer.finish() {
                    self.speak(&rest, &cancel).await;
                }
                debug!(session_id = %self.session_id, "turn complete");
                self.finish_turn();
            }
            TurnEnd::Aborted => {
                buffer.clear();
                self.finish_turn();
            }
            TurnEnd::Cancelled => {
                // Barge-in owns the state transition; just drop the text.
                buffer.clear();
                debug!(session_id = %self.session_id, "turn cancelled, buffered text discarded");
            }
        }
    }

    /// Synthesize one flushed sentence and deliver its audio chunk.
    ///
    /// Serial per session: the turn loop awaits this before flushing the next
    /// sentence, which is what keeps audio in generation order. Returns false
    /// when the turn was cancelled; a synthesis failure only skips the
    /// sentence.
    async fn speak(&self, sentence: &str, cancel: &CancellationToken) -> bool {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                SessionState::Thinking => *state = SessionState::Speaking,
                SessionState::Speaking => {}
                _ => return false,
            }
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = self.engines.synthesizer.synthesize(sentence, &self.synthesis) => result,
        };
        if cancel.is_cancelled() {
            // The call completed after the barge-in; discard the result.
            return false;
        }

        match result {
            Ok(audio) => {
                let sequence = self.audio_seq.fetch_add(1, Ordering::Relaxed) + 1;
                self.emit(ServerMessage::AudioChunk {
                    data: BASE64.encode(&audio.data),
                    encoding: audio.encoding,
                    sequence,
                });
            }
            Err(err) => {
                warn!(session_id = %self.session_id, %err, "synthesis failed, skipping sentence");
            }
        }
        true
    }

    /// Return to `Listening` after a turn, unless a barge-in or teardown
    /// already moved the state on.
    fn finish_turn(&self) {
        *self.turn_cancel.lock().unwrap() = None;
        let mut state = self.state.write().unwrap();
        if matches!(*state, SessionState::Thinking | SessionState::Speaking) {
            *state = SessionState::Listening;
        }
    }

    /// Sleep for `delay`, returning false if the session closed first.
    async fn sleep_unless_closing(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.closing.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn emit(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(session_id = %self.session_id, "client connection gone, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, GenerationConfig, ServerConfig, SessionConfig};
    use crate::speech::stt::{RecognizerStream, TranscriptEvent};
    use crate::speech::tts::SynthesizedAudio;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    fn test_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            session: SessionConfig {
                max_sessions_per_user: 3,
                stop_cooldown_ms: 100,
            },
            recognition: RecognitionConfig {
                endpoint: "wss://stt.example.com/v1/stream".to_string(),
                language: "en-US".to_string(),
                sample_rate: 16000,
            },
            synthesis: SynthesisConfig {
                endpoint: "https://tts.example.com/v1/synthesize".to_string(),
                language: "en-US".to_string(),
                voice: "test-voice".to_string(),
                sample_rate: 24000,
                encoding: "LINEAR16".to_string(),
            },
            generation: GenerationConfig {
                endpoint: "https://gen.example.com/v1/stream".to_string(),
                api_key: "secret".to_string(),
            },
        }
    }

    /// Recognizer whose streams replay scripted transcript events. A stream
    /// whose script ends with `hold = true` keeps its event channel open.
    struct ScriptedRecognizer {
        scripts: StdMutex<VecDeque<(Vec<TranscriptEvent>, bool)>>,
        audio_taps: StdMutex<Vec<mpsc::Receiver<Vec<u8>>>>,
        holds: StdMutex<Vec<mpsc::Sender<TranscriptEvent>>>,
    }

    impl ScriptedRecognizer {
        fn new(scripts: Vec<(Vec<TranscriptEvent>, bool)>) -> Self {
            Self {
                scripts: StdMutex::new(scripts.into()),
                audio_taps: StdMutex::new(Vec::new()),
                holds: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SpeechRecognizer for ScriptedRecognizer {
        async fn open_stream(&self, _config: &RecognitionConfig) -> Result<RecognizerStream> {
            let (script, hold) = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no more scripted streams"))?;

            let (audio_tx, audio_rx) = mpsc::channel(64);
            let (event_tx, event_rx) = mpsc::channel(16);
            self.audio_taps.lock().unwrap().push(audio_rx);

            for event in script {
                event_tx.send(event).await.unwrap();
            }
            if hold {
                self.holds.lock().unwrap().push(event_tx);
            }

            Ok(RecognizerStream {
                audio: audio_tx,
                events: event_rx,
            })
        }
    }

    /// Generator whose streams replay scripted fragment sequences. A script
    /// ending with `hold = true` keeps the channel open until cancelled.
    struct ScriptedGenerator {
        scripts: StdMutex<VecDeque<(Vec<Result<String, String>>, bool)>>,
        holds: StdMutex<Vec<mpsc::Sender<Result<String>>>>,
    }

    impl ScriptedGenerator {
        fn new(scripts: Vec<(Vec<Result<String, String>>, bool)>) -> Self {
            Self {
                scripts: StdMutex::new(scripts.into()),
                holds: StdMutex::new(Vec::new()),
            }
        }

        fn remaining_scripts(&self) -> usize {
            self.scripts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn stream(
            &self,
            _input: &str,
            _user_id: &str,
        ) -> Result<mpsc::Receiver<Result<String>>> {
            let (script, hold) = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("generation endpoint unavailable"))?;

            let (tx, rx) = mpsc::channel(32);
            for item in script {
                let item = item.map_err(|msg| anyhow!(msg));
                tx.send(item).await.unwrap();
            }
            if hold {
                self.holds.lock().unwrap().push(tx);
            }
            Ok(rx)
        }
    }

    /// Synthesizer returning the sentence bytes themselves, or failing for
    /// sentences that contain a marker.
    struct EchoSynthesizer {
        fail_on: Option<String>,
    }

    #[async_trait]
    impl SpeechSynthesizer for EchoSynthesizer {
        async fn synthesize(
            &self,
            text: &str,
            config: &SynthesisConfig,
        ) -> Result<SynthesizedAudio> {
            if let Some(marker) = &self.fail_on {
                if text.contains(marker) {
                    anyhow::bail!("scripted synthesis failure");
                }
            }
            Ok(SynthesizedAudio {
                data: text.as_bytes().to_vec(),
                encoding: config.encoding.clone(),
            })
        }
    }

    struct Harness {
        session: Arc<VoiceSession>,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
        generator: Arc<ScriptedGenerator>,
        recognizer: Arc<ScriptedRecognizer>,
    }

    fn harness(
        recognizer: ScriptedRecognizer,
        generator: ScriptedGenerator,
        synthesizer: EchoSynthesizer,
    ) -> Harness {
        let recognizer = Arc::new(recognizer);
        let generator = Arc::new(generator);
        let engines = EngineClients {
            recognizer: recognizer.clone(),
            generator: generator.clone(),
            synthesizer: Arc::new(synthesizer),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let session = VoiceSession::new(
            "session-1".to_string(),
            "user-1".to_string(),
            &test_config(),
            engines,
            tx,
        );
        Harness {
            session,
            outbound: rx,
            generator,
            recognizer,
        }
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbound channel closed")
    }

    async fn wait_for_state(session: &VoiceSession, expected: SessionState) {
        for _ in 0..200 {
            if session.state() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "session never reached {:?}, still {:?}",
            expected,
            session.state()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_emits_text_and_ordered_audio() {
        let generator = ScriptedGenerator::new(vec![(
            vec![
                Ok("I'm".to_string()),
                Ok(" great.".to_string()),
                Ok(" Thanks!".to_string()),
            ],
            false,
        )]);
        let mut h = harness(
            ScriptedRecognizer::new(vec![]),
            generator,
            EchoSynthesizer { fail_on: None },
        );

        h.session.start_turn("hello how are you".to_string());
        wait_for_state(&h.session, SessionState::Listening).await;

        let mut texts = Vec::new();
        let mut chunks = Vec::new();
        while let Ok(message) = h.outbound.try_recv() {
            match message {
                ServerMessage::AssistantText { text, .. } => texts.push(text),
                ServerMessage::AudioChunk { data, sequence, .. } => push_chunk(
                    &mut chunks,
                    String::from_utf8(BASE64.decode(data).unwrap()).unwrap(),
                    sequence,
                ),
                other => panic!("unexpected message: {:?}", other),
            }
        }

        assert_eq!(texts, vec!["I'm", " great.", " Thanks!"]);
        assert_eq!(
            chunks,
            vec![("I'm great.".to_string(), 1), ("Thanks!".to_string(), 2)]
        );
    }

    fn push_chunk(chunks: &mut Vec<(String, u64)>, text: String, sequence: u64) {
        if let Some((_, last)) = chunks.last() {
            assert!(sequence > *last, "audio sequence must be strictly increasing");
        }
        chunks.push((text, sequence));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_suppresses_audio_and_accepts_next_turn() {
        // First turn: one complete sentence, then the stream stays open.
        let generator = ScriptedGenerator::new(vec![
            (vec![Ok("First sentence. ".to_string())], true),
            (vec![Ok("Ok.".to_string())], false),
        ]);
        let mut h = harness(
            ScriptedRecognizer::new(vec![]),
            generator,
            EchoSynthesizer { fail_on: None },
        );

        h.session.start_turn("question one".to_string());

        // Wait for the first audio chunk, then barge in.
        loop {
            match next_message(&mut h.outbound).await {
                ServerMessage::AudioChunk { sequence, .. } => {
                    assert_eq!(sequence, 1);
                    break;
                }
                ServerMessage::AssistantText { .. } => {}
                other => panic!("unexpected message: {:?}", other),
            }
        }
        h.session.handle_stop();

        assert!(matches!(
            next_message(&mut h.outbound).await,
            ServerMessage::Stopped
        ));

        // Cooldown returns the session to listening; a new turn is accepted.
        wait_for_state(&h.session, SessionState::Listening).await;
        h.session.start_turn("question two".to_string());
        wait_for_state(&h.session, SessionState::Listening).await;

        let mut audio_after_stop = Vec::new();
        while let Ok(message) = h.outbound.try_recv() {
            if let ServerMessage::AudioChunk { data, sequence, .. } = message {
                audio_after_stop.push((
                    String::from_utf8(BASE64.decode(data).unwrap()).unwrap(),
                    sequence,
                ));
            }
        }

        // No audio from the interrupted turn, exactly one from the new turn.
        assert_eq!(audio_after_stop, vec![("Ok.".to_string(), 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_failure_returns_to_listening() {
        let generator = ScriptedGenerator::new(vec![]);
        let mut h = harness(
            ScriptedRecognizer::new(vec![]),
            generator,
            EchoSynthesizer { fail_on: None },
        );

        h.session.start_turn("anyone there".to_string());
        wait_for_state(&h.session, SessionState::Listening).await;

        let message = next_message(&mut h.outbound).await;
        assert!(matches!(message, ServerMessage::Error { .. }));
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_stream_generation_error_aborts_turn_without_flushing() {
        let generator = ScriptedGenerator::new(vec![(
            vec![
                Ok("Done. ".to_string()),
                Ok("half a thou".to_string()),
                Err("stream reset".to_string()),
            ],
            false,
        )]);
        let mut h = harness(
            ScriptedRecognizer::new(vec![]),
            generator,
            EchoSynthesizer { fail_on: None },
        );

        h.session.start_turn("go on".to_string());
        wait_for_state(&h.session, SessionState::Listening).await;

        let mut audio = 0;
        let mut errors = 0;
        while let Ok(message) = h.outbound.try_recv() {
            match message {
                ServerMessage::AudioChunk { .. } => audio += 1,
                ServerMessage::Error { .. } => errors += 1,
                _ => {}
            }
        }
        // The complete sentence was spoken; the dangling remainder was not.
        assert_eq!(audio, 1);
        assert_eq!(errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_failure_skips_sentence_only() {
        let generator = ScriptedGenerator::new(vec![(
            vec![Ok("Bad one. ".to_string()), Ok("Good one.".to_string())],
            false,
        )]);
        let mut h = harness(
            ScriptedRecognizer::new(vec![]),
            generator,
            EchoSynthesizer {
                fail_on: Some("Bad".to_string()),
            },
        );

        h.session.start_turn("speak".to_string());
        wait_for_state(&h.session, SessionState::Listening).await;

        let mut audio = Vec::new();
        while let Ok(message) = h.outbound.try_recv() {
            if let ServerMessage::AudioChunk { data, .. } = message {
                audio.push(String::from_utf8(BASE64.decode(data).unwrap()).unwrap());
            }
        }
        assert_eq!(audio, vec!["Good one.".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_transcript_during_turn_does_not_start_second_turn() {
        let generator = ScriptedGenerator::new(vec![
            (vec![Ok("Thinking".to_string())], true),
            (vec![Ok("never".to_string())], false),
        ]);
        let h = harness(
            ScriptedRecognizer::new(vec![]),
            generator,
            EchoSynthesizer { fail_on: None },
        );

        h.session.start_turn("first".to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.session.start_turn("second".to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only the first turn consumed a generation script.
        assert_eq!(h.generator.remaining_scripts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognizer_fault_recovers_without_dropping_connection() {
        // First stream dies without a final; second delivers a full utterance.
        let recognizer = ScriptedRecognizer::new(vec![
            (
                vec![TranscriptEvent {
                    text: "hel".to_string(),
                    is_final: false,
                }],
                false,
            ),
            (
                vec![TranscriptEvent {
                    text: "hello there".to_string(),
                    is_final: true,
                }],
                true,
            ),
        ]);
        let generator = ScriptedGenerator::new(vec![(vec![Ok("Hi.".to_string())], false)]);
        let mut h = harness(recognizer, generator, EchoSynthesizer { fail_on: None });

        h.session.start();

        let mut saw_fault_notice = false;
        let mut transcripts = Vec::new();
        loop {
            match next_message(&mut h.outbound).await {
                ServerMessage::Transcript { text, interim } => {
                    transcripts.push((text, interim));
                    if let Some((_, false)) = transcripts.last() {
                        break;
                    }
                }
                ServerMessage::Error { .. } => saw_fault_notice = true,
                other => panic!("unexpected message: {:?}", other),
            }
        }

        assert!(saw_fault_notice, "expected a non-fatal recognition notice");
        assert_eq!(
            transcripts,
            vec![
                ("hel".to_string(), true),
                ("hello there".to_string(), false),
            ]
        );
        assert_ne!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_audio_forwards_whole_frames_only() {
        let recognizer = ScriptedRecognizer::new(vec![(vec![], true)]);
        let h = harness(
            recognizer,
            ScriptedGenerator::new(vec![]),
            EchoSynthesizer { fail_on: None },
        );

        h.session.start();
        // Let the recognizer loop install the audio sink.
        for _ in 0..50 {
            if !h.recognizer.audio_taps.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.session.push_audio(&[1, 2, 3, 4]);
        h.session.push_audio(&[9]); // not a whole PCM16 sample, dropped
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut tap = h.recognizer.audio_taps.lock().unwrap().remove(0);
        assert_eq!(tap.try_recv().unwrap(), vec![1, 2, 3, 4]);
        assert!(tap.try_recv().is_err());
    }

    #[test]
    fn test_server_message_wire_format() {
        let message = ServerMessage::AudioChunk {
            data: "AAAA".to_string(),
            encoding: "LINEAR16".to_string(),
            sequence: 3,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"audioChunk\""));
        assert!(json.contains("\"sequence\":3"));

        let json = serde_json::to_string(&ServerMessage::Stopped).unwrap();
        assert_eq!(json, "{\"type\":\"stopped\"}");

        let json = serde_json::to_string(&ServerMessage::Transcript {
            interim: true,
            text: "hel".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"stt\""));
        assert!(json.contains("\"interim\":true"));
    }
}
