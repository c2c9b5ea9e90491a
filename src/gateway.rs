//! # Voice WebSocket Gateway
//!
//! Handles real-time voice conversations via WebSocket. Clients connect to
//! `/ws/voice` and stream binary PCM audio; the server streams back
//! transcripts, generated text, and synthesized audio.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: `GET /ws/voice?token=...&user_id=...` upgrades to a
//!    WebSocket. Missing token is rejected with 401, a user over the session
//!    cap with 429, both before the upgrade.
//! 2. **Audio Streaming**: binary messages carry PCM16LE 16kHz mono frames.
//! 3. **Control**: text messages carry JSON, currently only
//!    `{"type": "stop"}` for barge-in.
//! 4. **Server Messages**: JSON text frames with `stt`, `assistantText`,
//!    `audioChunk`, `stopped`, and `error` types.
//!
//! The actor is a thin transport shell: all pipeline behavior lives in
//! `crate::voice::VoiceSession`, which emits outbound messages on a channel
//! this actor drains into the socket.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::voice::{EngineClients, ServerMessage, SessionRegistry, VoiceSession};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

/// Ping cadence for idle-connection detection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Connections silent for this long are dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Control messages from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Barge-in: stop the in-flight response.
    Stop,
}

#[derive(Debug, Deserialize)]
pub struct VoiceQuery {
    token: Option<String>,
    user_id: Option<String>,
}

/// WebSocket actor for one voice connection.
pub struct VoiceWebSocket {
    session: Arc<VoiceSession>,
    registry: web::Data<SessionRegistry>,
    /// Taken once in `started` and attached to the context.
    outbound: Option<mpsc::UnboundedReceiver<ServerMessage>>,
    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    fn new(
        session: Arc<VoiceSession>,
        registry: web::Data<SessionRegistry>,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        Self {
            session,
            registry,
            outbound: Some(outbound),
            last_heartbeat: Instant::now(),
        }
    }

    /// Any inbound frame proves the client is alive, not just control frames.
    /// Proxies sometimes strip pings and pongs while audio keeps flowing.
    fn note_activity(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    fn heartbeat_expired(&self) -> bool {
        Instant::now().duration_since(self.last_heartbeat) > CLIENT_TIMEOUT
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        let error = ServerMessage::Error {
            message: message.to_string(),
        };
        if let Ok(json) = serde_json::to_string(&error) {
            ctx.text(json);
        }
        warn!(session_id = %self.session.session_id, "WebSocket error: {}", message);
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            session_id = %self.session.session_id,
            user_id = %self.session.user_id,
            "voice connection started"
        );

        // Drain the session's outbound channel into the socket.
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }

        self.session.start();

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if act.heartbeat_expired() {
                warn!(
                    session_id = %act.session.session_id,
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.session.close();
        self.registry
            .release(&self.session.user_id, &self.session.session_id);
        info!(
            session_id = %self.session.session_id,
            user_id = %self.session.user_id,
            "voice connection stopped"
        );
    }
}

/// Inbound frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        if msg.is_ok() {
            self.note_activity();
        }
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.session.push_audio(&data);
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Stop) => {
                    self.session.handle_stop();
                }
                Err(err) => {
                    self.send_error(ctx, &format!("unrecognized message: {}", err));
                }
            },
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session.session_id, "WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session_id = %self.session.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Outbound messages from the session pipeline.
impl StreamHandler<ServerMessage> for VoiceWebSocket {
    fn handle(&mut self, msg: ServerMessage, ctx: &mut Self::Context) {
        match serde_json::to_string(&msg) {
            Ok(json) => ctx.text(json),
            Err(err) => debug!("failed to serialize server message: {}", err),
        }
    }
}

/// Voice WebSocket endpoint handler.
///
/// Admission runs before the upgrade: a rejected client receives a plain
/// HTTP error response rather than a socket that closes immediately.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<VoiceQuery>,
    app_state: web::Data<AppState>,
    registry: web::Data<SessionRegistry>,
    engines: web::Data<EngineClients>,
) -> AppResult<HttpResponse> {
    let query = query.into_inner();
    let token = query.token.filter(|t| !t.is_empty());
    let Some(token) = token else {
        return Err(AppError::MissingToken);
    };

    // Clients that don't identify themselves are bucketed by token.
    let user_id = query
        .user_id
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| token.clone());

    let session_id = registry.admit(&user_id)?;
    info!(
        session_id = %session_id,
        user_id = %user_id,
        peer = ?req.connection_info().peer_addr(),
        "admitting voice connection"
    );

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session = VoiceSession::new(
        session_id.clone(),
        user_id.clone(),
        &app_state.get_config(),
        engines.get_ref().clone(),
        outbound_tx,
    );

    app_state.record_connection();

    let actor = VoiceWebSocket::new(session.clone(), registry.clone(), outbound_rx);
    match ws::start(actor, &req, stream) {
        Ok(response) => Ok(response),
        Err(err) => {
            // The upgrade failed before the actor ran; undo the admission.
            session.close();
            registry.release(&user_id, &session_id);
            Err(AppError::BadRequest(format!(
                "WebSocket upgrade failed: {}",
                err
            )))
        }
    }
}
