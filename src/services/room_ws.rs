//! WebSocket actor for a collaboration-room participant. Membership is
//! verified before the upgrade; the actor only registers with the broker
//! and shuttles JSON both ways.

use actix::prelude::*;
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::AuthenticatedUser;
use crate::services::room_broker::{ErrorMessage, RoomBroker, RoomClientMessage, RoomMessage};
use crate::services::token_bucket::TokenBucket;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RoomWs {
    pub connection_id: Uuid,
    room_id: String,
    user: AuthenticatedUser,
    broker: Arc<RoomBroker>,
    last_heartbeat: Instant,
    rate: TokenBucket,
}

impl RoomWs {
    pub fn new(room_id: String, user: AuthenticatedUser, broker: Arc<RoomBroker>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            room_id,
            user,
            broker,
            last_heartbeat: Instant::now(),
            rate: TokenBucket::new(50, 25),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    connection_id = %act.connection_id,
                    room_id = %act.room_id,
                    login = %act.user.login,
                    "Room participant heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"heartbeat");
        });
    }
}

impl Actor for RoomWs {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            connection_id = %self.connection_id,
            room_id = %self.room_id,
            login = %self.user.login,
            "Room participant connected"
        );
        self.start_heartbeat(ctx);
        self.broker.join(
            self.room_id.clone(),
            self.connection_id,
            self.user.clone(),
            ctx.address().recipient(),
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(
            connection_id = %self.connection_id,
            room_id = %self.room_id,
            login = %self.user.login,
            "Room participant disconnected"
        );
        self.broker.leave(self.room_id.clone(), self.connection_id);
    }
}

impl Handler<RoomMessage> for RoomWs {
    type Result = ();

    fn handle(&mut self, msg: RoomMessage, ctx: &mut Self::Context) {
        let RoomMessage::Text(text) = msg;
        ctx.text(text);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RoomWs {
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
                        room_id = %self.room_id,
                        "Rate limit exceeded; dropping message"
                    );
                    return;
                }
                match serde_json::from_str::<RoomClientMessage>(&text) {
                    Ok(message) => {
                        self.broker
                            .client(self.room_id.clone(), self.connection_id, message)
                    }
                    Err(err) => {
                        warn!(
                            connection_id = %self.connection_id,
                            room_id = %self.room_id,
                            error = %err,
                            "Dropping malformed room message"
                        );
                        if let Ok(json) = serde_json::to_string(&ErrorMessage::new(
                            "invalid_json",
                            "Invalid room message",
                        )) {
                            ctx.text(json);
                        }
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                warn!(
                    connection_id = %self.connection_id,
                    room_id = %self.room_id,
                    "Dropping binary frame on room channel"
                );
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(
                    connection_id = %self.connection_id,
                    room_id = %self.room_id,
                    reason = ?reason,
                    "Room participant close received"
                );
                ctx.stop();
            }
            Err(err) => {
                warn!(
                    connection_id = %self.connection_id,
                    room_id = %self.room_id,
                    error = %err,
                    "Room channel protocol error"
                );
                ctx.stop();
            }
            _ => {}
        }
    }
}
