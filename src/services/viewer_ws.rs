//! WebSocket actor for browser viewers. The first frame must be a JSON
//! setup message; after that the channel carries input/resize JSON or raw
//! input bytes, and receives raw terminal output plus control JSON.

use actix::prelude::*;
use actix_web_actors::ws;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::protocol::close_codes;
use crate::protocol::viewer::{SetupAction, ViewerEvent, ViewerRequest};
use crate::services::session::{
    JoinError, Session, SpawnRequestError, ViewerMessage, ViewerRole,
};
use crate::services::session_registry::SessionRegistry;
use crate::services::token_bucket::TokenBucket;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

enum ViewerStage {
    AwaitingSetup,
    SpawnRequested,
    Live { terminal: String },
}

pub struct ViewerWs {
    pub connection_id: Uuid,
    session_id: String,
    registry: Arc<SessionRegistry>,
    config: Arc<RelayConfig>,
    session: Option<Arc<Session>>,
    stage: ViewerStage,
    setup_timer: Option<SpawnHandle>,
    last_heartbeat: Instant,
    rate: TokenBucket,
}

impl ViewerWs {
    pub fn new(
        session_id: String,
        registry: Arc<SessionRegistry>,
        config: Arc<RelayConfig>,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            session_id,
            registry,
            config,
            session: None,
            stage: ViewerStage::AwaitingSetup,
            setup_timer: None,
            last_heartbeat: Instant::now(),
            rate: TokenBucket::new(50, 25),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    connection_id = %act.connection_id,
                    session_id = %act.session_id,
                    "Viewer heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"heartbeat");
        });
    }

    fn close_with(&self, ctx: &mut ws::WebsocketContext<Self>, code: u16, description: &str) {
        ctx.close(Some(close_codes::close_reason(code, description)));
        ctx.stop();
    }

    fn cancel_setup_timer(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(handle) = self.setup_timer.take() {
            ctx.cancel_future(handle);
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let request = match serde_json::from_str::<ViewerRequest>(text) {
            Ok(request) => request,
            Err(err) => {
                if matches!(self.stage, ViewerStage::AwaitingSetup) {
                    warn!(
                        connection_id = %self.connection_id,
                        session_id = %self.session_id,
                        error = %err,
                        "Invalid setup message"
                    );
                    self.close_with(ctx, close_codes::BAD_SETUP, "invalid setup");
                } else {
                    warn!(
                        connection_id = %self.connection_id,
                        session_id = %self.session_id,
                        error = %err,
                        "Dropping malformed viewer message"
                    );
                }
                return;
            }
        };

        match request {
            ViewerRequest::Setup {
                action,
                name,
                cols,
                rows,
                created_by,
            } => {
                if !matches!(self.stage, ViewerStage::AwaitingSetup) {
                    warn!(
                        connection_id = %self.connection_id,
                        session_id = %self.session_id,
                        "Dropping duplicate setup message"
                    );
                    return;
                }
                self.cancel_setup_timer(ctx);
                self.dispatch_setup(action, name, cols, rows, created_by, ctx);
            }
            ViewerRequest::Input { data } => {
                if let ViewerStage::Live { terminal } = &self.stage {
                    if let Some(session) = &self.session {
                        session.on_input(
                            self.connection_id,
                            terminal,
                            Bytes::from(data.into_bytes()),
                        );
                    }
                }
            }
            ViewerRequest::Resize { cols, rows } => {
                if let ViewerStage::Live { terminal } = &self.stage {
                    if let Some(session) = &self.session {
                        session.on_resize(self.connection_id, terminal, cols, rows);
                    }
                }
            }
        }
    }

    fn dispatch_setup(
        &mut self,
        action: SetupAction,
        name: String,
        cols: Option<u16>,
        rows: Option<u16>,
        created_by: Option<crate::models::Owner>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let Some(session) = self.session.clone() else {
            return;
        };
        match action {
            SetupAction::New => {
                // "new" against a live terminal name joins it instead of
                // spawning a second one.
                if session.has_terminal(&name) {
                    match session.join_existing_terminal(
                        self.connection_id,
                        ctx.address().recipient(),
                        &name,
                        ViewerRole::Interactive,
                    ) {
                        Ok((cols, rows)) => {
                            self.stage = ViewerStage::Live {
                                terminal: name.clone(),
                            };
                            ctx.text(ViewerEvent::setup_ok(&name, cols, rows).to_json());
                            return;
                        }
                        Err(JoinError::SessionClosed) => {
                            self.close_with(ctx, close_codes::NOT_FOUND, "session is closed");
                            return;
                        }
                        // Terminal vanished between the check and the join;
                        // fall through to a spawn request.
                        Err(JoinError::TerminalNotFound) => {}
                    }
                }
                let cols = cols.unwrap_or(self.config.default_cols);
                let rows = rows.unwrap_or(self.config.default_rows);
                match session.request_spawn(
                    self.connection_id,
                    ctx.address().recipient(),
                    &name,
                    cols,
                    rows,
                    created_by,
                ) {
                    Ok(request_id) => {
                        debug!(
                            connection_id = %self.connection_id,
                            session_id = %self.session_id,
                            request_id = %request_id,
                            "Spawn requested for viewer"
                        );
                        self.stage = ViewerStage::SpawnRequested;
                    }
                    Err(SpawnRequestError::NoControl) => {
                        self.close_with(ctx, close_codes::BAD_SETUP, "session not ready");
                    }
                    Err(SpawnRequestError::SessionClosed) => {
                        self.close_with(ctx, close_codes::NOT_FOUND, "session is closed");
                    }
                }
            }
            SetupAction::Mirror => {
                match session.join_existing_terminal(
                    self.connection_id,
                    ctx.address().recipient(),
                    &name,
                    ViewerRole::Mirror,
                ) {
                    Ok((cols, rows)) => {
                        self.stage = ViewerStage::Live {
                            terminal: name.clone(),
                        };
                        ctx.text(ViewerEvent::setup_ok(&name, cols, rows).to_json());
                    }
                    Err(JoinError::TerminalNotFound) => {
                        ctx.text(ViewerEvent::setup_failed(&name, "Terminal not found").to_json());
                    }
                    Err(JoinError::SessionClosed) => {
                        self.close_with(ctx, close_codes::NOT_FOUND, "session is closed");
                    }
                }
            }
        }
    }
}

impl Actor for ViewerWs {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let Some(session) = self.registry.get(&self.session_id) else {
            warn!(
                connection_id = %self.connection_id,
                session_id = %self.session_id,
                "Viewer for unknown session"
            );
            self.close_with(ctx, close_codes::NOT_FOUND, "session not found");
            return;
        };
        self.session = Some(session);
        self.start_heartbeat(ctx);

        let window = Duration::from_millis(self.config.viewer_setup_timeout_ms);
        self.setup_timer = Some(ctx.run_later(window, |act, ctx| {
            warn!(
                connection_id = %act.connection_id,
                session_id = %act.session_id,
                "Viewer sent no setup in time"
            );
            act.close_with(ctx, close_codes::SETUP_TIMEOUT, "setup timeout");
        }));
        info!(
            connection_id = %self.connection_id,
            session_id = %self.session_id,
            "Viewer connected"
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session) = &self.session {
            session.detach_viewer(self.connection_id);
        }
    }
}

impl Handler<ViewerMessage> for ViewerWs {
    type Result = ();

    fn handle(&mut self, msg: ViewerMessage, ctx: &mut Self::Context) {
        match msg {
            ViewerMessage::Text(text) => ctx.text(text),
            ViewerMessage::Binary(bytes) => ctx.binary(bytes),
            ViewerMessage::Attached { terminal } => {
                if matches!(self.stage, ViewerStage::SpawnRequested) {
                    self.stage = ViewerStage::Live { terminal };
                }
            }
            ViewerMessage::Close { code, reason } => {
                ctx.close(Some(close_codes::close_reason(code, &reason)));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ViewerWs {
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
                if !self.rate.allow() {
                    warn!(
                        connection_id = %self.connection_id,
                        session_id = %self.session_id,
                        "Rate limit exceeded; dropping message"
                    );
                    return;
                }
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(bin)) => {
                self.last_heartbeat = Instant::now();
                match &self.stage {
                    // Raw bytes in steady state are input.
                    ViewerStage::Live { terminal } => {
                        if let Some(session) = &self.session {
                            session.on_input(self.connection_id, terminal, bin);
                        }
                    }
                    ViewerStage::AwaitingSetup => {
                        self.close_with(ctx, close_codes::BAD_SETUP, "first frame must be setup");
                    }
                    ViewerStage::SpawnRequested => {}
                }
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    reason = ?reason,
                    "Viewer close received"
                );
                ctx.stop();
            }
            Err(err) => {
                warn!(
                    connection_id = %self.connection_id,
                    session_id = %self.session_id,
                    error = %err,
                    "Viewer protocol error"
                );
                ctx.stop();
            }
            _ => {}
        }
    }
}
