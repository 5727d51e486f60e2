//! # Realtime WebSocket Handler
//!
//! One actor per connection. Clients connect to the configured realtime path
//! (default `/api-ws/v1/realtime`) and exchange JSON text frames.
//!
//! ## Connection Flow:
//! 1. **Upgrade**: a session id is reserved in the registry; a full registry
//!    answers 503 before the handshake
//! 2. **Open**: the actor sends `session.created` with the default config
//! 3. **Streaming**: every text frame is parsed into a client command and fed
//!    to the session's state machine; the machine's effects are carried out
//!    here (write events, submit inference jobs, close)
//! 4. **Results**: inference outcomes arrive as actor messages, so they are
//!    serialized with client frames and never race session state
//! 5. **Close**: `session.finish`, a fatal error, idle timeout or a dropped
//!    connection all end in `FINISHED` and release the registry slot
//!
//! ## Backpressure:
//! Job submission is awaited with `ctx.wait`. While a session waits for a
//! scheduler slot it reads no further frames; other sessions are unaffected.

use crate::error::SessionError;
use crate::protocol::{encode, generate_session_id, parse_client_event};
use crate::session::{SessionEffect, SessionMachine};
use crate::state::AppState;
use crate::transcription::{InferenceJob, InferenceOutcome, OutcomeSink};
use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Largest text frame accepted. Base64 audio inflates PCM by a third.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub struct RealtimeSocket {
    machine: SessionMachine,
    state: AppState,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    idle_timeout: Duration,
    last_heartbeat: Instant,
}

impl RealtimeSocket {
    pub fn new(machine: SessionMachine, state: AppState) -> Self {
        let config = state.get_config();
        Self {
            machine,
            heartbeat_interval: Duration::from_secs(config.server.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(config.server.client_timeout_secs),
            idle_timeout: Duration::from_secs(config.session.idle_timeout_secs),
            last_heartbeat: Instant::now(),
            state,
        }
    }

    /// Carry out the machine's effects in order.
    fn apply(&mut self, effects: Vec<SessionEffect>, ctx: &mut ws::WebsocketContext<Self>) {
        for effect in effects {
            match effect {
                SessionEffect::Send(event) => {
                    self.state.record_event(&event);
                    match encode(&event) {
                        Ok(json) => ctx.text(json),
                        Err(err) => error!(
                            session_id = %self.machine.id(),
                            event = event.type_name(),
                            error = %err,
                            "Failed to serialize server event"
                        ),
                    }
                }
                SessionEffect::Submit(job) => self.submit(job, ctx),
                SessionEffect::Close => {
                    ctx.close(Some(ws::CloseReason {
                        code: ws::CloseCode::Normal,
                        description: Some("session finished".to_string()),
                    }));
                    ctx.stop();
                }
            }
        }
        self.state.registry.touch(self.machine.id(), self.machine.state());
    }

    fn submit(&mut self, job: InferenceJob, ctx: &mut ws::WebsocketContext<Self>) {
        let ticket = job.ticket.clone();
        let scheduler = self.state.scheduler.clone();
        let cancel = self.machine.cancel_flag();
        let sink: Arc<dyn OutcomeSink> = Arc::new(ctx.address().recipient::<InferenceOutcome>());

        ctx.wait(
            async move { scheduler.submit(job, cancel, sink).await }
                .into_actor(self)
                .map(move |result, act, ctx| {
                    if let Err(err) = result {
                        let effects = act.machine.on_submit_rejected(ticket, err);
                        act.apply(effects, ctx);
                    }
                }),
        );
    }

    fn on_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let effects = match parse_client_event(text) {
            Ok(event) => {
                debug!(
                    session_id = %self.machine.id(),
                    event_id = ?event.event_id,
                    "Client event received"
                );
                self.machine.handle(event.command, event.event_id)
            }
            Err(rejected) => self.machine.reject(rejected.error, rejected.event_id),
        };
        self.apply(effects, ctx);
    }
}

impl Actor for RealtimeSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.machine.id(), "Realtime connection started");
        self.state.connection_opened();

        let effects = self.machine.open();
        self.apply(effects, ctx);

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.machine.id(), "Heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }

            if act.machine.idle_for() >= act.idle_timeout {
                info!(session_id = %act.machine.id(), "Session idle timeout");
                let effects = act.machine.expire();
                act.apply(effects, ctx);
                return;
            }

            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.machine.abort();
        self.state.registry.remove(self.machine.id());
        self.state.connection_closed(self.machine.received_ms());

        info!(
            session_id = %self.machine.id(),
            audio_ms = self.machine.received_ms(),
            "Realtime connection stopped"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RealtimeSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.on_text(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                self.last_heartbeat = Instant::now();
                let effects = self.machine.reject(
                    SessionError::protocol(
                        "invalid_event",
                        "Binary frames are not supported; send JSON text events",
                    ),
                    None,
                );
                self.apply(effects, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.machine.id(), ?reason, "Client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.machine.id(), "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.machine.id(), error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<InferenceOutcome> for RealtimeSocket {
    type Result = ();

    fn handle(&mut self, outcome: InferenceOutcome, ctx: &mut Self::Context) {
        let effects = self.machine.on_outcome(outcome);
        self.apply(effects, ctx);
    }
}

/// WebSocket upgrade endpoint for realtime sessions.
pub async fn realtime_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let session_id = generate_session_id();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "Realtime connection request"
    );

    if let Err(err) = state.registry.register(&session_id) {
        state.connection_rejected();
        warn!(session_id = %session_id, error = %err, "Rejecting realtime connection");
        return Err(err.into());
    }

    let config = state.get_config();
    let machine = SessionMachine::new(session_id.clone(), config.backend.model, config.session);
    let socket = RealtimeSocket::new(machine, state.get_ref().clone());

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(MAX_FRAME_BYTES)
        .start()
        .map_err(|err| {
            state.registry.remove(&session_id);
            err
        })
}
