//! WebSocket actor for the producer control channel.

use actix::prelude::*;
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::Owner;
use crate::protocol::close_codes;
use crate::protocol::control::ControlEvent;
use crate::services::session::{ControlAttachError, ControlMessage, Session};
use crate::services::session_registry::SessionRegistry;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ControlWs {
    pub connection_id: Uuid,
    session_id: String,
    registry: Arc<SessionRegistry>,
    /// None when the bearer credential was missing or invalid; the actor
    /// closes with 4401 right after the upgrade.
    principal: Option<Owner>,
    session: Option<Arc<Session>>,
    attached: bool,
    last_heartbeat: Instant,
    close_frame: Option<(u16, Option<String>)>,
}

impl ControlWs {
    pub fn new(
        session_id: String,
        registry: Arc<SessionRegistry>,
        principal: Option<Owner>,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            session_id,
            registry,
            principal,
            session: None,
            attached: false,
            last_heartbeat: Instant::now(),
            close_frame: None,
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    connection_id = %act.connection_id,
                    session_id = %act.session_id,
                    "Producer control heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"heartbeat");
        });
    }

    fn handle_line(&mut self, text: &str) {
        let Some(session) = &self.session else {
            return;
        };
        let event = match serde_json::from_str::<ControlEvent>(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    error = %err,
                    "Dropping malformed control message"
                );
                return;
            }
        };
        match event {
            ControlEvent::ControlHandshake(info) => session.on_control_handshake(info),
            ControlEvent::TerminalStarted {
                name,
                request_id,
                success,
                error,
            } => session.on_terminal_started(&name, &request_id, success, error),
            ControlEvent::TerminalClosed { name, exit_code } => {
                session.on_terminal_closed(&name, exit_code)
            }
        }
    }
}

impl Actor for ControlWs {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let Some(principal) = self.principal.clone() else {
            warn!(
                connection_id = %self.connection_id,
                session_id = %self.session_id,
                "Producer control without valid credential"
            );
            ctx.close(Some(close_codes::close_reason(
                close_codes::UNAUTHENTICATED,
                "missing or invalid credential",
            )));
            ctx.stop();
            return;
        };

        let session = self.registry.get_or_create(&self.session_id);
        match session.attach_control(self.connection_id, ctx.address().recipient(), &principal) {
            Ok(()) => {
                info!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    subject = %principal.subject,
                    "Producer control connected"
                );
                self.session = Some(session);
                self.attached = true;
                self.start_heartbeat(ctx);
            }
            Err(ControlAttachError::AlreadyConnected) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    "Rejecting duplicate producer control"
                );
                ctx.close(Some(close_codes::close_reason(
                    close_codes::ALREADY_CONNECTED,
                    "a live control channel already exists",
                )));
                ctx.stop();
            }
            Err(ControlAttachError::NotOwner) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    subject = %principal.subject,
                    "Producer is not the session owner"
                );
                ctx.close(Some(close_codes::close_reason(
                    close_codes::NOT_OWNER,
                    "not the session owner",
                )));
                ctx.stop();
            }
            Err(ControlAttachError::SessionClosed) => {
                ctx.close(Some(close_codes::close_reason(
                    close_codes::NOT_FOUND,
                    "session is closed",
                )));
                ctx.stop();
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if !self.attached {
            return;
        }
        if let Some(session) = &self.session {
            let (code, reason) = self.close_frame.clone().unwrap_or((1006, None));
            debug!(
                connection_id = %self.connection_id,
                session_id = %self.session_id,
                close_code = code,
                "Producer control stopped"
            );
            session.detach_control(self.connection_id, code, reason.as_deref());
        }
    }
}

impl Handler<ControlMessage> for ControlWs {
    type Result = ();

    fn handle(&mut self, msg: ControlMessage, ctx: &mut Self::Context) {
        match msg {
            ControlMessage::Line(line) => ctx.text(line),
            ControlMessage::Close { code, reason } => {
                ctx.close(Some(close_codes::close_reason(code, &reason)));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ControlWs {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_line(&text);
            }
            Ok(ws::Message::Binary(_)) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    "Dropping binary frame on control channel"
                );
            }
            Ok(ws::Message::Close(reason)) => {
                self.close_frame = reason
                    .as_ref()
                    .map(|r| (u16::from(r.code), r.description.clone()));
                info!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    reason = ?reason,
                    "Producer control close received"
                );
                ctx.stop();
            }
            Err(err) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    error = %err,
                    "Producer control protocol error"
                );
                ctx.stop();
            }
            _ => {}
        }
    }
}
