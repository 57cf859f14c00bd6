//! In-memory fan-out for collaboration rooms. Every mutation and broadcast
//! for a room funnels through one worker task reading a single command
//! queue, so participants observe room events in one order. Durable room
//! data lives behind the [`RoomStore`] trait.

use actix::prelude::*;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::AuthenticatedUser;
use crate::services::room_store::{PanelSelection, PanelSide, PoolEntry, RoomStore};
use crate::services::session::Session;
use crate::services::session_registry::{SessionCloseReason, SessionEvent, SessionRegistry};

/// Message delivered to a room participant socket actor.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub enum RoomMessage {
    Text(String),
}

/// Client → server room messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RoomClientMessage {
    PanelSelect {
        panel: PanelSide,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminal_name: Option<String>,
    },
    AddSession {
        session_id: String,
    },
    RemoveSession {
        session_id: String,
    },
    CloseTerminal {
        session_id: String,
        terminal_name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub code: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ErrorMessage {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            message_type: "error".to_string(),
            code: code.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Clone)]
struct ParticipantHandle {
    user: AuthenticatedUser,
    peer: Recipient<RoomMessage>,
}

enum BrokerCommand {
    Join {
        room_id: String,
        conn_id: Uuid,
        user: AuthenticatedUser,
        peer: Recipient<RoomMessage>,
    },
    Leave {
        room_id: String,
        conn_id: Uuid,
    },
    Client {
        room_id: String,
        conn_id: Uuid,
        message: RoomClientMessage,
    },
    Registry(SessionEvent),
}

type RoomMap = Arc<DashMap<String, HashMap<Uuid, ParticipantHandle>>>;

pub struct RoomBroker {
    rooms: RoomMap,
    tx: mpsc::UnboundedSender<BrokerCommand>,
}

impl RoomBroker {
    pub fn start(store: Arc<dyn RoomStore>, registry: Arc<SessionRegistry>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rooms: RoomMap = Arc::new(DashMap::new());
        let broker = Arc::new(Self {
            rooms: rooms.clone(),
            tx: tx.clone(),
        });

        tokio::spawn(run_worker(rx, rooms, store, registry.clone()));

        // Registry events feed the same queue as client commands, so a
        // room's clients see one serialized stream.
        let mut events = registry.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send(BrokerCommand::Registry(event)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Room broker lagged on registry events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        broker
    }

    pub fn join(
        &self,
        room_id: String,
        conn_id: Uuid,
        user: AuthenticatedUser,
        peer: Recipient<RoomMessage>,
    ) {
        let _ = self.tx.send(BrokerCommand::Join {
            room_id,
            conn_id,
            user,
            peer,
        });
    }

    pub fn leave(&self, room_id: String, conn_id: Uuid) {
        let _ = self.tx.send(BrokerCommand::Leave { room_id, conn_id });
    }

    pub fn client(&self, room_id: String, conn_id: Uuid, message: RoomClientMessage) {
        let _ = self.tx.send(BrokerCommand::Client {
            room_id,
            conn_id,
            message,
        });
    }

    pub fn connected_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|handles| handles.len()).unwrap_or(0)
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<BrokerCommand>,
    rooms: RoomMap,
    store: Arc<dyn RoomStore>,
    registry: Arc<SessionRegistry>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            BrokerCommand::Join {
                room_id,
                conn_id,
                user,
                peer,
            } => handle_join(&rooms, &store, &registry, room_id, conn_id, user, peer).await,
            BrokerCommand::Leave { room_id, conn_id } => handle_leave(&rooms, room_id, conn_id),
            BrokerCommand::Client {
                room_id,
                conn_id,
                message,
            } => handle_client(&rooms, &store, &registry, room_id, conn_id, message).await,
            BrokerCommand::Registry(event) => {
                handle_registry_event(&rooms, &store, event).await
            }
        }
    }
}

fn broadcast_room(rooms: &RoomMap, room_id: &str, text: &str) {
    if let Some(handles) = rooms.get(room_id) {
        for handle in handles.values() {
            handle.peer.do_send(RoomMessage::Text(text.to_string()));
        }
    }
}

fn broadcast_others(rooms: &RoomMap, room_id: &str, except: Uuid, text: &str) {
    if let Some(handles) = rooms.get(room_id) {
        for (conn_id, handle) in handles.iter() {
            if *conn_id != except {
                handle.peer.do_send(RoomMessage::Text(text.to_string()));
            }
        }
    }
}

fn send_to(rooms: &RoomMap, room_id: &str, conn_id: Uuid, text: &str) {
    if let Some(handles) = rooms.get(room_id) {
        if let Some(handle) = handles.get(&conn_id) {
            handle.peer.do_send(RoomMessage::Text(text.to_string()));
        }
    }
}

fn caller(rooms: &RoomMap, room_id: &str, conn_id: Uuid) -> Option<ParticipantHandle> {
    rooms
        .get(room_id)
        .and_then(|handles| handles.get(&conn_id).cloned())
}

/// Live status of a pool session: the registry is authoritative for
/// liveness, the store only remembers the last closed state.
fn live_status(registry: &SessionRegistry, session_id: &str) -> &'static str {
    match registry.get(session_id) {
        Some(session) if session.has_control() => "online",
        Some(_) => "offline",
        None => "closed",
    }
}

fn pool_session_json(registry: &SessionRegistry, entry: &PoolEntry) -> serde_json::Value {
    json!({
        "sessionId": entry.session_id,
        "addedBy": entry.added_by,
        "hostname": entry.hostname,
        "workingDir": entry.working_dir,
        "addedAt": entry.added_at,
        "status": live_status(registry, &entry.session_id),
    })
}

async fn build_jam_state(
    rooms: &RoomMap,
    store: &Arc<dyn RoomStore>,
    registry: &SessionRegistry,
    room_id: &str,
) -> Result<String, crate::error::AppError> {
    let room = store
        .get_room(room_id)
        .await?
        .ok_or_else(|| crate::error::AppError::NotFound(format!("room {}", room_id)))?;
    let participants = store.list_participants(room_id).await?;
    let pool = store.get_pool(room_id).await?;
    let panels = store.get_shared_panel_state(room_id).await?;
    let connected: Vec<String> = rooms
        .get(room_id)
        .map(|handles| handles.values().map(|h| h.user.login.clone()).collect())
        .unwrap_or_default();
    let sessions: Vec<serde_json::Value> = pool
        .iter()
        .map(|entry| pool_session_json(registry, entry))
        .collect();
    Ok(json!({
        "type": "jam_state",
        "room": room,
        "participants": participants,
        "connected": connected,
        "sessions": sessions,
        "panels": panels,
    })
    .to_string())
}

async fn handle_join(
    rooms: &RoomMap,
    store: &Arc<dyn RoomStore>,
    registry: &Arc<SessionRegistry>,
    room_id: String,
    conn_id: Uuid,
    user: AuthenticatedUser,
    peer: Recipient<RoomMessage>,
) {
    rooms
        .entry(room_id.clone())
        .or_insert_with(HashMap::new)
        .insert(conn_id, ParticipantHandle { user: user.clone(), peer: peer.clone() });
    info!(room_id = %room_id, login = %user.login, "Participant joined room");

    let update = json!({
        "type": "participant_update",
        "action": "joined",
        "user": { "id": user.id, "login": user.login },
        "timestamp": Utc::now(),
    })
    .to_string();
    broadcast_others(rooms, &room_id, conn_id, &update);

    match build_jam_state(rooms, store, registry, &room_id).await {
        Ok(snapshot) => peer.do_send(RoomMessage::Text(snapshot)),
        Err(err) => {
            warn!(room_id = %room_id, error = %err, "Failed to build room snapshot");
            peer.do_send(RoomMessage::Text(
                ErrorMessage::new("snapshot_failed", "Failed to load room state").to_json(),
            ));
        }
    }
}

fn handle_leave(rooms: &RoomMap, room_id: String, conn_id: Uuid) {
    let left = {
        let Some(mut handles) = rooms.get_mut(&room_id) else {
            return;
        };
        handles.remove(&conn_id)
    };
    let Some(handle) = left else {
        return;
    };
    info!(room_id = %room_id, login = %handle.user.login, "Participant left room");
    rooms.remove_if(&room_id, |_, handles| handles.is_empty());

    let update = json!({
        "type": "participant_update",
        "action": "left",
        "user": { "id": handle.user.id, "login": handle.user.login },
        "timestamp": Utc::now(),
    })
    .to_string();
    broadcast_room(rooms, &room_id, &update);
}

async fn handle_client(
    rooms: &RoomMap,
    store: &Arc<dyn RoomStore>,
    registry: &Arc<SessionRegistry>,
    room_id: String,
    conn_id: Uuid,
    message: RoomClientMessage,
) {
    let Some(handle) = caller(rooms, &room_id, conn_id) else {
        return;
    };
    let user = handle.user;

    match message {
        RoomClientMessage::PanelSelect {
            panel,
            session_id,
            terminal_name,
        } => {
            let room = match store.get_room(&room_id).await {
                Ok(Some(room)) => room,
                _ => return,
            };
            let distinct_users: HashSet<String> = rooms
                .get(&room_id)
                .map(|handles| handles.values().map(|h| h.user.id.clone()).collect())
                .unwrap_or_default();
            let is_owner = room.owner_id == user.id;
            // With two or more people in the room, the owner drives the left
            // panel and guests drive the right one.
            let allowed = if distinct_users.len() >= 2 {
                match panel {
                    PanelSide::Left => is_owner,
                    PanelSide::Right => !is_owner,
                }
            } else {
                true
            };
            if !allowed {
                send_to(
                    rooms,
                    &room_id,
                    conn_id,
                    &ErrorMessage::new("panel_forbidden", "Panel is driven by the other side")
                        .to_json(),
                );
                return;
            }
            let selection = Some(PanelSelection {
                session_id,
                terminal_name,
            });
            match store.set_shared_panel_state(&room_id, panel, selection).await {
                Ok(panels) => {
                    let update = json!({
                        "type": "panel_state_update",
                        "panels": panels,
                        "updatedBy": user.login,
                    })
                    .to_string();
                    broadcast_room(rooms, &room_id, &update);
                }
                Err(err) => {
                    warn!(room_id = %room_id, error = %err, "Failed to persist panel state");
                }
            }
        }
        RoomClientMessage::AddSession { session_id } => {
            let Some(session) = registry.get(&session_id) else {
                send_to(
                    rooms,
                    &room_id,
                    conn_id,
                    &ErrorMessage::new("session_not_found", "Session is not connected").to_json(),
                );
                return;
            };
            if !session_owned_by(&session, &user) {
                send_to(
                    rooms,
                    &room_id,
                    conn_id,
                    &ErrorMessage::new("not_session_owner", "Only the session owner may add it")
                        .to_json(),
                );
                return;
            }
            let info = session.control_info();
            let entry = PoolEntry {
                session_id: session_id.clone(),
                added_by: user.id.clone(),
                hostname: info.as_ref().and_then(|i| i.hostname.clone()),
                working_dir: info.as_ref().and_then(|i| i.working_dir.clone()),
                online: session.has_control(),
                closed_gracefully: None,
                added_at: Utc::now(),
            };
            match store.add_to_pool(&room_id, entry.clone()).await {
                Ok(()) => {
                    let update = json!({
                        "type": "session_pool_update",
                        "action": "added",
                        "session": pool_session_json(registry, &entry),
                    })
                    .to_string();
                    broadcast_room(rooms, &room_id, &update);
                }
                Err(crate::error::AppError::AlreadyExists(_)) => {
                    send_to(
                        rooms,
                        &room_id,
                        conn_id,
                        &ErrorMessage::new("already_in_pool", "Session is already in the pool")
                            .to_json(),
                    );
                }
                Err(err) => {
                    warn!(room_id = %room_id, error = %err, "Failed to add session to pool");
                }
            }
        }
        RoomClientMessage::RemoveSession { session_id } => {
            let room = match store.get_room(&room_id).await {
                Ok(Some(room)) => room,
                _ => return,
            };
            let pool = match store.get_pool(&room_id).await {
                Ok(pool) => pool,
                Err(_) => return,
            };
            let Some(entry) = pool.iter().find(|e| e.session_id == session_id) else {
                send_to(
                    rooms,
                    &room_id,
                    conn_id,
                    &ErrorMessage::new("session_not_found", "Session is not in the pool").to_json(),
                );
                return;
            };
            // The adder or the room owner may remove a pool session.
            if entry.added_by != user.id && room.owner_id != user.id {
                send_to(
                    rooms,
                    &room_id,
                    conn_id,
                    &ErrorMessage::new("remove_forbidden", "Not allowed to remove this session")
                        .to_json(),
                );
                return;
            }
            match store.remove_from_pool(&room_id, &session_id).await {
                Ok(()) => {
                    let update = json!({
                        "type": "session_pool_update",
                        "action": "removed",
                        "sessionId": session_id,
                    })
                    .to_string();
                    broadcast_room(rooms, &room_id, &update);
                }
                Err(err) => {
                    warn!(room_id = %room_id, error = %err, "Failed to remove session from pool");
                }
            }
        }
        RoomClientMessage::CloseTerminal {
            session_id,
            terminal_name,
        } => {
            let Some(session) = registry.get(&session_id) else {
                send_to(
                    rooms,
                    &room_id,
                    conn_id,
                    &ErrorMessage::new("session_not_found", "Session is not connected").to_json(),
                );
                return;
            };
            if !session_owned_by(&session, &user) {
                send_to(
                    rooms,
                    &room_id,
                    conn_id,
                    &ErrorMessage::new(
                        "not_session_owner",
                        "Only the session owner may close terminals",
                    )
                    .to_json(),
                );
                return;
            }
            debug!(room_id = %room_id, session_id = %session_id, terminal = %terminal_name, "Room close_terminal");
            session.send_close_terminal(&terminal_name, None);
        }
    }
}

fn session_owned_by(session: &Session, user: &AuthenticatedUser) -> bool {
    session
        .owner()
        .map(|owner| owner.subject == user.id)
        .unwrap_or(false)
}

async fn handle_registry_event(rooms: &RoomMap, store: &Arc<dyn RoomStore>, event: SessionEvent) {
    let (session_id, owner, payload) = match &event {
        SessionEvent::Online { session_id, owner } => (
            session_id.clone(),
            owner.clone(),
            json!({
                "type": "session_status_update",
                "sessionId": session_id,
                "status": "online",
            }),
        ),
        SessionEvent::Offline { session_id, owner } => (
            session_id.clone(),
            owner.clone(),
            json!({
                "type": "session_status_update",
                "sessionId": session_id,
                "status": "offline",
            }),
        ),
        SessionEvent::Closed {
            session_id,
            owner,
            reason,
            ..
        } => {
            // Graceful close maps to closed; timeout and error are offline
            // with the reason attached.
            let payload = if *reason == SessionCloseReason::Graceful {
                json!({
                    "type": "session_status_update",
                    "sessionId": session_id,
                    "status": "closed",
                    "reason": reason.as_str(),
                })
            } else {
                json!({
                    "type": "session_status_update",
                    "sessionId": session_id,
                    "status": "offline",
                    "reason": reason.as_str(),
                })
            };
            (session_id.clone(), owner.clone(), payload)
        }
        SessionEvent::TerminalClosed {
            session_id,
            terminal,
            exit_code,
            owner,
        } => (
            session_id.clone(),
            owner.clone(),
            json!({
                "type": "terminal_closed_update",
                "sessionId": session_id,
                "terminalName": terminal,
                "exitCode": exit_code,
            }),
        ),
    };

    match &event {
        SessionEvent::Online { .. } => {
            if let Err(err) = store.mark_pool_session_online(&session_id).await {
                warn!(session_id = %session_id, error = %err, "Failed to mark pool session online");
            }
        }
        SessionEvent::Closed { reason, .. } => {
            let graceful = *reason == SessionCloseReason::Graceful;
            if let Err(err) = store.mark_pool_session_closed(&session_id, graceful).await {
                warn!(session_id = %session_id, error = %err, "Failed to mark pool session closed");
            }
        }
        _ => {}
    }

    // Rooms to notify: the session is in their pool, or its owner is
    // connected to them right now.
    let owner_subject = owner.map(|o| o.subject);
    let active: Vec<(String, bool)> = rooms
        .iter()
        .map(|entry| {
            let owner_connected = owner_subject
                .as_ref()
                .map(|subject| entry.value().values().any(|h| &h.user.id == subject))
                .unwrap_or(false);
            (entry.key().clone(), owner_connected)
        })
        .collect();

    let text = payload.to_string();
    for (room_id, owner_connected) in active {
        let in_pool = store
            .get_pool(&room_id)
            .await
            .map(|pool| pool.iter().any(|e| e.session_id == session_id))
            .unwrap_or(false);
        if in_pool || owner_connected {
            broadcast_room(rooms, &room_id, &text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::models::Owner;
    use crate::protocol::control::ControlHandshake;
    use crate::services::room_store::{MemoryRoomStore, RoomParticipant};
    use crate::services::session::ControlMessage;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RoomProbe {
        texts: Arc<StdMutex<Vec<String>>>,
    }

    impl RoomProbe {
        fn new() -> (Self, Arc<StdMutex<Vec<String>>>) {
            let texts = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    texts: texts.clone(),
                },
                texts,
            )
        }
    }

    impl Actor for RoomProbe {
        type Context = Context<Self>;
    }

    impl Handler<RoomMessage> for RoomProbe {
        type Result = ();
        fn handle(&mut self, msg: RoomMessage, _: &mut Context<Self>) {
            let RoomMessage::Text(text) = msg;
            self.texts.lock().unwrap().push(text);
        }
    }

    impl Handler<ControlMessage> for RoomProbe {
        type Result = ();
        fn handle(&mut self, _: ControlMessage, _: &mut Context<Self>) {}
    }

    fn user(id: &str, login: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            id: id.to_string(),
            login: login.to_string(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    fn parsed(texts: &Arc<StdMutex<Vec<String>>>) -> Vec<serde_json::Value> {
        texts
            .lock()
            .unwrap()
            .iter()
            .map(|t| serde_json::from_str(t).unwrap())
            .collect()
    }

    struct Fixture {
        store: Arc<dyn RoomStore>,
        registry: Arc<SessionRegistry>,
        broker: Arc<RoomBroker>,
        room_id: String,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn RoomStore> = Arc::new(MemoryRoomStore::new());
        let registry = SessionRegistry::new(Arc::new(RelayConfig::default()));
        let room = store.create_room(&user("u-1", "ada"), "pairing").await.unwrap();
        store
            .add_participant(
                &room.id,
                RoomParticipant {
                    user_id: "u-2".to_string(),
                    login: "bob".to_string(),
                    joined_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        let broker = RoomBroker::start(store.clone(), registry.clone());
        Fixture {
            store,
            registry,
            broker,
            room_id: room.id,
        }
    }

    /// Creates a live session owned by `subject` in the registry.
    fn online_session(fixture: &Fixture, id: &str, subject: &str) -> Arc<Session> {
        let session = fixture.registry.get_or_create(id);
        let probe = RoomProbe::new().0.start();
        session
            .attach_control(
                Uuid::new_v4(),
                probe.recipient::<ControlMessage>(),
                &Owner::new(subject, "ada"),
            )
            .unwrap();
        session.on_control_handshake(ControlHandshake {
            version: "1".to_string(),
            hostname: Some("devbox".to_string()),
            username: None,
            working_dir: None,
        });
        session
    }

    #[actix_rt::test]
    async fn joiner_receives_jam_state_snapshot() {
        let fixture = fixture().await;
        let (probe, texts) = RoomProbe::new();
        let addr = probe.start();
        fixture.broker.join(
            fixture.room_id.clone(),
            Uuid::new_v4(),
            user("u-1", "ada"),
            addr.recipient(),
        );
        settle().await;

        let messages = parsed(&texts);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "jam_state");
        assert_eq!(messages[0]["room"]["name"], "pairing");
    }

    #[actix_rt::test]
    async fn second_joiner_is_announced_to_the_first() {
        let fixture = fixture().await;
        let (probe_a, texts_a) = RoomProbe::new();
        let addr_a = probe_a.start();
        fixture.broker.join(
            fixture.room_id.clone(),
            Uuid::new_v4(),
            user("u-1", "ada"),
            addr_a.recipient(),
        );
        settle().await;

        let (probe_b, _texts_b) = RoomProbe::new();
        let addr_b = probe_b.start();
        fixture.broker.join(
            fixture.room_id.clone(),
            Uuid::new_v4(),
            user("u-2", "bob"),
            addr_b.recipient(),
        );
        settle().await;

        let messages = parsed(&texts_a);
        let update = messages
            .iter()
            .find(|m| m["type"] == "participant_update")
            .expect("participant update");
        assert_eq!(update["action"], "joined");
        assert_eq!(update["user"]["login"], "bob");
    }

    #[actix_rt::test]
    async fn panel_access_is_split_between_owner_and_guest() {
        let fixture = fixture().await;
        let (owner_probe, owner_texts) = RoomProbe::new();
        let owner_conn = Uuid::new_v4();
        fixture.broker.join(
            fixture.room_id.clone(),
            owner_conn,
            user("u-1", "ada"),
            owner_probe.start().recipient(),
        );
        let (guest_probe, guest_texts) = RoomProbe::new();
        let guest_conn = Uuid::new_v4();
        fixture.broker.join(
            fixture.room_id.clone(),
            guest_conn,
            user("u-2", "bob"),
            guest_probe.start().recipient(),
        );
        settle().await;

        // Guest may not drive the left panel.
        fixture.broker.client(
            fixture.room_id.clone(),
            guest_conn,
            RoomClientMessage::PanelSelect {
                panel: PanelSide::Left,
                session_id: "s-1".to_string(),
                terminal_name: None,
            },
        );
        settle().await;
        let guest_messages = parsed(&guest_texts);
        let error = guest_messages
            .iter()
            .find(|m| m["type"] == "error")
            .expect("error for guest");
        assert_eq!(error["code"], "panel_forbidden");

        // Owner drives the left panel; both sides see the update.
        fixture.broker.client(
            fixture.room_id.clone(),
            owner_conn,
            RoomClientMessage::PanelSelect {
                panel: PanelSide::Left,
                session_id: "s-1".to_string(),
                terminal_name: Some("7421".to_string()),
            },
        );
        settle().await;
        for texts in [&owner_texts, &guest_texts] {
            let messages = parsed(texts);
            let update = messages
                .iter()
                .find(|m| m["type"] == "panel_state_update")
                .expect("panel update");
            assert_eq!(update["panels"]["left"]["sessionId"], "s-1");
        }
    }

    #[actix_rt::test]
    async fn lone_participant_may_drive_both_panels() {
        let fixture = fixture().await;
        let (probe, texts) = RoomProbe::new();
        let conn = Uuid::new_v4();
        fixture.broker.join(
            fixture.room_id.clone(),
            conn,
            user("u-2", "bob"),
            probe.start().recipient(),
        );
        settle().await;

        fixture.broker.client(
            fixture.room_id.clone(),
            conn,
            RoomClientMessage::PanelSelect {
                panel: PanelSide::Left,
                session_id: "s-1".to_string(),
                terminal_name: None,
            },
        );
        settle().await;
        let messages = parsed(&texts);
        assert!(messages.iter().any(|m| m["type"] == "panel_state_update"));
        assert!(!messages.iter().any(|m| m["type"] == "error"));
    }

    #[actix_rt::test]
    async fn add_session_requires_ownership() {
        let fixture = fixture().await;
        online_session(&fixture, "s-1", "u-1");

        let (guest_probe, guest_texts) = RoomProbe::new();
        let guest_conn = Uuid::new_v4();
        fixture.broker.join(
            fixture.room_id.clone(),
            guest_conn,
            user("u-2", "bob"),
            guest_probe.start().recipient(),
        );
        settle().await;

        fixture.broker.client(
            fixture.room_id.clone(),
            guest_conn,
            RoomClientMessage::AddSession {
                session_id: "s-1".to_string(),
            },
        );
        settle().await;
        let messages = parsed(&guest_texts);
        let error = messages.iter().find(|m| m["type"] == "error").unwrap();
        assert_eq!(error["code"], "not_session_owner");
        assert!(fixture.store.get_pool(&fixture.room_id).await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn owner_adds_session_and_everyone_sees_it() {
        let fixture = fixture().await;
        online_session(&fixture, "s-1", "u-1");

        let (owner_probe, owner_texts) = RoomProbe::new();
        let owner_conn = Uuid::new_v4();
        fixture.broker.join(
            fixture.room_id.clone(),
            owner_conn,
            user("u-1", "ada"),
            owner_probe.start().recipient(),
        );
        settle().await;

        fixture.broker.client(
            fixture.room_id.clone(),
            owner_conn,
            RoomClientMessage::AddSession {
                session_id: "s-1".to_string(),
            },
        );
        settle().await;

        let messages = parsed(&owner_texts);
        let update = messages
            .iter()
            .find(|m| m["type"] == "session_pool_update")
            .expect("pool update");
        assert_eq!(update["action"], "added");
        assert_eq!(update["session"]["sessionId"], "s-1");
        assert_eq!(update["session"]["status"], "online");
        assert_eq!(update["session"]["hostname"], "devbox");

        // A second add is refused.
        fixture.broker.client(
            fixture.room_id.clone(),
            owner_conn,
            RoomClientMessage::AddSession {
                session_id: "s-1".to_string(),
            },
        );
        settle().await;
        let messages = parsed(&owner_texts);
        let error = messages.iter().find(|m| m["type"] == "error").unwrap();
        assert_eq!(error["code"], "already_in_pool");
    }

    #[actix_rt::test]
    async fn registry_events_fan_out_to_rooms_with_the_session_pooled() {
        let fixture = fixture().await;
        let session = online_session(&fixture, "s-1", "u-9");
        fixture
            .store
            .add_to_pool(
                &fixture.room_id,
                PoolEntry {
                    session_id: "s-1".to_string(),
                    added_by: "u-9".to_string(),
                    hostname: None,
                    working_dir: None,
                    online: true,
                    closed_gracefully: None,
                    added_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let (probe, texts) = RoomProbe::new();
        fixture.broker.join(
            fixture.room_id.clone(),
            Uuid::new_v4(),
            user("u-2", "bob"),
            probe.start().recipient(),
        );
        settle().await;

        // Timeout close maps to offline, not closed.
        session.close(SessionCloseReason::Timeout);
        settle().await;
        let messages = parsed(&texts);
        let update = messages
            .iter()
            .find(|m| m["type"] == "session_status_update")
            .expect("status update");
        assert_eq!(update["sessionId"], "s-1");
        assert_eq!(update["status"], "offline");
        assert_eq!(update["reason"], "timeout");
    }

    #[actix_rt::test]
    async fn graceful_close_maps_to_closed_status() {
        let fixture = fixture().await;
        let session = online_session(&fixture, "s-2", "u-1");

        // Not pooled anywhere, but the owner is connected to the room.
        let (probe, texts) = RoomProbe::new();
        fixture.broker.join(
            fixture.room_id.clone(),
            Uuid::new_v4(),
            user("u-1", "ada"),
            probe.start().recipient(),
        );
        settle().await;

        session.close(SessionCloseReason::Graceful);
        settle().await;
        let messages = parsed(&texts);
        let update = messages
            .iter()
            .find(|m| m["type"] == "session_status_update")
            .expect("status update");
        assert_eq!(update["status"], "closed");
    }
}
