//! WebSocket actor for a producer terminal data channel.

use actix::prelude::*;
use actix_web_actors::ws;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::close_codes;
use crate::protocol::frames::ProducerFrame;
use crate::services::session::{DataMessage, JoinError, Session};
use crate::services::session_registry::SessionRegistry;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

lazy_static! {
    static ref FRAME_WARNINGS: Mutex<HashMap<String, Instant>> = Mutex::new(HashMap::new());
}

/// Rate-limits repeated decode warnings per session/terminal to one a minute.
fn should_warn(key: &str) -> bool {
    let mut warnings = match FRAME_WARNINGS.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let now = Instant::now();
    match warnings.get(key) {
        Some(last) if now.duration_since(*last) < Duration::from_secs(60) => false,
        _ => {
            warnings.insert(key.to_string(), now);
            true
        }
    }
}

pub struct TerminalDataWs {
    pub connection_id: Uuid,
    session_id: String,
    terminal_name: String,
    registry: Arc<SessionRegistry>,
    session: Option<Arc<Session>>,
    attached: bool,
    last_heartbeat: Instant,
}

impl TerminalDataWs {
    pub fn new(session_id: String, terminal_name: String, registry: Arc<SessionRegistry>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            session_id,
            terminal_name,
            registry,
            session: None,
            attached: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    connection_id = %act.connection_id,
                    session_id = %act.session_id,
                    terminal = %act.terminal_name,
                    "Data channel heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"heartbeat");
        });
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let Some(session) = &self.session else {
            return;
        };
        match ProducerFrame::decode(frame) {
            Ok(ProducerFrame::Output(bytes)) => session.on_output(&self.terminal_name, bytes),
            Ok(ProducerFrame::Handshake(handshake)) => {
                session.on_data_handshake(&self.terminal_name, self.connection_id, handshake)
            }
            Ok(ProducerFrame::Exit(code)) => session.on_terminal_closed(&self.terminal_name, code),
            Ok(ProducerFrame::Snapshot(snapshot)) => match BASE64.decode(&snapshot.screen) {
                Ok(screen) => session.on_snapshot(
                    &self.terminal_name,
                    &snapshot.request_id,
                    Bytes::from(screen),
                ),
                Err(err) => {
                    warn!(
                        session_id = %self.session_id,
                        terminal = %self.terminal_name,
                        error = %err,
                        "Dropping snapshot with invalid base64 screen"
                    );
                }
            },
            Err(err) => {
                let key = format!("{}:{}", self.session_id, self.terminal_name);
                if should_warn(&key) {
                    warn!(
                        session_id = %self.session_id,
                        terminal = %self.terminal_name,
                        len = frame.len(),
                        error = %err,
                        "Dropping undecodable data frame"
                    );
                }
            }
        }
    }
}

impl Actor for TerminalDataWs {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let Some(session) = self.registry.get(&self.session_id) else {
            warn!(
                connection_id = %self.connection_id,
                session_id = %self.session_id,
                terminal = %self.terminal_name,
                "Data channel for unknown session"
            );
            ctx.close(Some(close_codes::close_reason(
                close_codes::NOT_FOUND,
                "session not found",
            )));
            ctx.stop();
            return;
        };
        match session.attach_data(
            &self.terminal_name,
            self.connection_id,
            ctx.address().recipient(),
        ) {
            Ok(()) => {
                info!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    terminal = %self.terminal_name,
                    "Data channel connected"
                );
                self.session = Some(session);
                self.attached = true;
                self.start_heartbeat(ctx);
            }
            Err(JoinError::SessionClosed) | Err(JoinError::TerminalNotFound) => {
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
            session.on_data_closed(&self.terminal_name, self.connection_id);
        }
    }
}

impl Handler<DataMessage> for TerminalDataWs {
    type Result = ();

    fn handle(&mut self, msg: DataMessage, ctx: &mut Self::Context) {
        match msg {
            DataMessage::Frame(bytes) => ctx.binary(bytes),
            DataMessage::Close { code, reason } => {
                ctx.close(Some(close_codes::close_reason(code, &reason)));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TerminalDataWs {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Binary(bin)) => {
                self.last_heartbeat = Instant::now();
                self.handle_frame(&bin);
            }
            Ok(ws::Message::Text(_)) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    terminal = %self.terminal_name,
                    "Dropping text frame on data channel"
                );
            }
            Ok(ws::Message::Close(reason)) => {
                info!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    terminal = %self.terminal_name,
                    reason = ?reason,
                    "Data channel close received"
                );
                ctx.stop();
            }
            Err(err) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    terminal = %self.terminal_name,
                    error = %err,
                    "Data channel protocol error"
                );
                ctx.stop();
            }
            _ => {}
        }
    }
}
