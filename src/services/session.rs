//! One producer ↔ many viewers. The session owns its terminals, the viewer
//! sets attached to each terminal, in-flight spawn requests and the producer
//! reconnect timer. All mutable state sits behind a single mutex; socket
//! sends happen after the lock is released, against handles snapshotted
//! under the lock. Per-peer ordering comes from the actor mailboxes.

use actix::prelude::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::models::Owner;
use crate::protocol::control::{ControlCommand, ControlHandshake};
use crate::protocol::frames::{DataHandshake, RelayFrame};
use crate::protocol::viewer::ViewerEvent;
use crate::services::session_registry::{SessionCloseReason, SessionEvent};

/// Message delivered to a viewer socket actor.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub enum ViewerMessage {
    Text(String),
    Binary(Bytes),
    Attached { terminal: String },
    Close { code: u16, reason: String },
}

/// Message delivered to the producer control socket actor.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub enum ControlMessage {
    Line(String),
    Close { code: u16, reason: String },
}

/// Message delivered to a producer data socket actor.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub enum DataMessage {
    Frame(Bytes),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Ready,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerRole {
    Interactive,
    Mirror,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlAttachError {
    #[error("session is closed")]
    SessionClosed,
    #[error("a live control channel already exists")]
    AlreadyConnected,
    #[error("producer is not the session owner")]
    NotOwner,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("session is closed")]
    SessionClosed,
    #[error("terminal not found")]
    TerminalNotFound,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpawnRequestError {
    #[error("session is closed")]
    SessionClosed,
    #[error("no live control channel")]
    NoControl,
}

struct ControlChannel {
    conn_id: Uuid,
    peer: Recipient<ControlMessage>,
}

struct DataChannel {
    conn_id: Uuid,
    peer: Recipient<DataMessage>,
}

struct ViewerState {
    peer: Recipient<ViewerMessage>,
    needs_snapshot: bool,
    pending_snapshot_id: Option<String>,
    buffered: Vec<Bytes>,
}

struct Terminal {
    data: Option<DataChannel>,
    handshake: Option<DataHandshake>,
    cols: u16,
    rows: u16,
    creator: Option<Owner>,
    interactive: HashMap<Uuid, ViewerState>,
    mirror: HashMap<Uuid, ViewerState>,
    paused: bool,
}

impl Terminal {
    fn new(cols: u16, rows: u16, creator: Option<Owner>) -> Self {
        Self {
            data: None,
            handshake: None,
            cols,
            rows,
            creator,
            interactive: HashMap::new(),
            mirror: HashMap::new(),
            paused: false,
        }
    }

    fn has_viewers(&self) -> bool {
        !self.interactive.is_empty() || !self.mirror.is_empty()
    }

    fn viewers_mut(&mut self) -> impl Iterator<Item = &mut ViewerState> {
        self.interactive.values_mut().chain(self.mirror.values_mut())
    }
}

struct PendingSpawn {
    requested_name: String,
    cols: u16,
    rows: u16,
    viewer_id: Uuid,
    viewer: Recipient<ViewerMessage>,
    #[allow(dead_code)]
    created_at: Instant,
    timeout: JoinHandle<()>,
    creator: Option<Owner>,
}

struct SessionInner {
    state: SessionState,
    owner: Option<Owner>,
    control: Option<ControlChannel>,
    control_info: Option<ControlHandshake>,
    terminals: HashMap<String, Terminal>,
    pending: HashMap<String, PendingSpawn>,
    reconnect_timer: Option<JoinHandle<()>>,
}

/// A single producer-side lifespan, identified by an opaque id.
pub struct Session {
    pub id: String,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    config: Arc<RelayConfig>,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<SessionInner>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSummary {
    pub name: String,
    pub cols: u16,
    pub rows: u16,
    pub viewers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<Owner>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub created_at: DateTime<Utc>,
    pub terminals: Vec<TerminalSummary>,
}

impl Session {
    pub fn new(
        id: String,
        config: Arc<RelayConfig>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            config,
            events,
            inner: Mutex::new(SessionInner {
                state: SessionState::Pending,
                owner: None,
                control: None,
                control_info: None,
                terminals: HashMap::new(),
                pending: HashMap::new(),
                reconnect_timer: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(session_id = %self.id, "Session lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn owner(&self) -> Option<Owner> {
        self.lock().owner.clone()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn has_terminal(&self, name: &str) -> bool {
        self.lock().terminals.contains_key(name)
    }

    /// Whether a producer control channel is currently attached.
    pub fn has_control(&self) -> bool {
        self.lock().control.is_some()
    }

    pub fn control_info(&self) -> Option<ControlHandshake> {
        self.lock().control_info.clone()
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.lock();
        let mut terminals: Vec<TerminalSummary> = inner
            .terminals
            .iter()
            .map(|(name, term)| TerminalSummary {
                name: name.clone(),
                cols: term.cols,
                rows: term.rows,
                viewers: term.interactive.len() + term.mirror.len(),
                creator: term.creator.clone(),
            })
            .collect();
        terminals.sort_by(|a, b| a.name.cmp(&b.name));
        SessionSummary {
            id: self.id.clone(),
            state: inner.state,
            owner: inner.owner.clone(),
            hostname: inner.control_info.as_ref().and_then(|i| i.hostname.clone()),
            working_dir: inner
                .control_info
                .as_ref()
                .and_then(|i| i.working_dir.clone()),
            created_at: self.created_wall,
            terminals,
        }
    }

    // ---- producer control -------------------------------------------------

    /// Install the producer control channel. Ownership is set on the first
    /// authenticated attach and never changes afterwards.
    pub fn attach_control(
        &self,
        conn_id: Uuid,
        peer: Recipient<ControlMessage>,
        principal: &Owner,
    ) -> Result<(), ControlAttachError> {
        let mut inner = self.lock();
        if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
            return Err(ControlAttachError::SessionClosed);
        }
        if inner.control.is_some() {
            return Err(ControlAttachError::AlreadyConnected);
        }
        match &inner.owner {
            Some(owner) if owner.subject != principal.subject => {
                return Err(ControlAttachError::NotOwner);
            }
            Some(_) => {}
            None => inner.owner = Some(principal.clone()),
        }
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        inner.control = Some(ControlChannel { conn_id, peer });
        info!(session_id = %self.id, subject = %principal.subject, "Producer control attached");
        Ok(())
    }

    pub fn on_control_handshake(&self, info: ControlHandshake) {
        let owner = {
            let mut inner = self.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            inner.control_info = Some(info);
            if inner.state == SessionState::Pending {
                inner.state = SessionState::Ready;
            }
            inner.owner.clone()
        };
        info!(session_id = %self.id, "Session online");
        let _ = self.events.send(SessionEvent::Online {
            session_id: self.id.clone(),
            owner,
        });
    }

    /// Producer control channel went away. A graceful close (1000 /
    /// "client shutdown") ends the session immediately; anything else arms
    /// the reconnect timer.
    pub fn detach_control(
        self: &Arc<Self>,
        conn_id: Uuid,
        close_code: u16,
        close_reason: Option<&str>,
    ) {
        {
            let mut inner = self.lock();
            match &inner.control {
                Some(control) if control.conn_id == conn_id => {}
                // A different (or no) control is installed; stale stop.
                _ => return,
            }
            inner.control = None;
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return;
            }
        }

        let graceful = close_code == 1000 && close_reason == Some("client shutdown");
        if graceful {
            info!(session_id = %self.id, "Producer shut down gracefully");
            self.close(SessionCloseReason::Graceful);
            return;
        }

        let weak = Arc::downgrade(self);
        let window = Duration::from_millis(self.config.producer_reconnect_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(session) = weak.upgrade() {
                info!(session_id = %session.id, "Producer reconnect window expired");
                session.close(SessionCloseReason::Timeout);
            }
        });

        let owner = {
            let mut inner = self.lock();
            if inner.control.is_some()
                || matches!(inner.state, SessionState::Closing | SessionState::Closed)
            {
                // Reattached (or closed) between locks.
                handle.abort();
                return;
            }
            if let Some(old) = inner.reconnect_timer.replace(handle) {
                old.abort();
            }
            inner.owner.clone()
        };

        warn!(
            session_id = %self.id,
            close_code = close_code,
            reconnect_ms = self.config.producer_reconnect_ms,
            "Producer control lost, awaiting reconnect"
        );
        let _ = self.events.send(SessionEvent::Offline {
            session_id: self.id.clone(),
            owner,
        });
    }

    /// Ask the producer to close a terminal; teardown happens when the
    /// producer answers with `terminal_closed`.
    pub fn send_close_terminal(&self, name: &str, signal: Option<String>) {
        let control = {
            let inner = self.lock();
            inner.control.as_ref().map(|c| c.peer.clone())
        };
        let Some(control) = control else {
            warn!(session_id = %self.id, terminal = %name, "close_terminal with no live control");
            return;
        };
        let line = ControlCommand::CloseTerminal {
            name: name.to_string(),
            signal,
        };
        control.do_send(ControlMessage::Line(to_json_line(&line)));
    }

    // ---- terminal spawn ---------------------------------------------------

    /// Allocate a request id, enqueue the pending spawn and send
    /// `start_terminal` to the producer.
    pub fn request_spawn(
        self: &Arc<Self>,
        viewer_id: Uuid,
        viewer: Recipient<ViewerMessage>,
        requested_name: &str,
        cols: u16,
        rows: u16,
        creator: Option<Owner>,
    ) -> Result<String, SpawnRequestError> {
        let request_id = Uuid::new_v4().to_string();
        let control = {
            let mut inner = self.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return Err(SpawnRequestError::SessionClosed);
            }
            let control = inner
                .control
                .as_ref()
                .map(|c| c.peer.clone())
                .ok_or(SpawnRequestError::NoControl)?;

            let weak = Arc::downgrade(self);
            let rid = request_id.clone();
            let window = Duration::from_millis(self.config.spawn_timeout_ms);
            let timeout = tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(session) = weak.upgrade() {
                    session.expire_pending(&rid);
                }
            });

            inner.pending.insert(
                request_id.clone(),
                PendingSpawn {
                    requested_name: requested_name.to_string(),
                    cols,
                    rows,
                    viewer_id,
                    viewer,
                    created_at: Instant::now(),
                    timeout,
                    creator,
                },
            );
            control
        };

        debug!(
            session_id = %self.id,
            request_id = %request_id,
            requested_name = %requested_name,
            "Requesting terminal spawn"
        );
        control.do_send(ControlMessage::Line(to_json_line(
            &ControlCommand::StartTerminal {
                name: requested_name.to_string(),
                cols,
                rows,
                request_id: request_id.clone(),
            },
        )));
        Ok(request_id)
    }

    fn expire_pending(&self, request_id: &str) {
        let pending = self.lock().pending.remove(request_id);
        if let Some(pending) = pending {
            warn!(
                session_id = %self.id,
                request_id = %request_id,
                "Terminal spawn timed out"
            );
            pending.viewer.do_send(ViewerMessage::Text(
                ViewerEvent::setup_failed(&pending.requested_name, "spawn timeout").to_json(),
            ));
        }
    }

    /// Producer answered a spawn request. An unknown request id is a no-op;
    /// the producer may be answering a request whose viewer already left.
    pub fn on_terminal_started(
        &self,
        name: &str,
        request_id: &str,
        success: bool,
        error: Option<String>,
    ) {
        let mut inner = self.lock();
        let Some(pending) = inner.pending.remove(request_id) else {
            warn!(
                session_id = %self.id,
                request_id = %request_id,
                "terminal_started for unknown request"
            );
            return;
        };
        pending.timeout.abort();

        if !success {
            drop(inner);
            let message = error.unwrap_or_else(|| "spawn failed".to_string());
            warn!(session_id = %self.id, request_id = %request_id, error = %message, "Terminal spawn failed");
            pending.viewer.do_send(ViewerMessage::Text(
                ViewerEvent::setup_failed(&pending.requested_name, &message).to_json(),
            ));
            return;
        }

        if inner.terminals.contains_key(name) {
            drop(inner);
            warn!(session_id = %self.id, terminal = %name, "Producer reused a live terminal name");
            pending.viewer.do_send(ViewerMessage::Text(
                ViewerEvent::setup_failed(&pending.requested_name, "duplicate terminal name")
                    .to_json(),
            ));
            return;
        }

        let mut terminal = Terminal::new(pending.cols, pending.rows, pending.creator.clone());
        // Fresh terminal: the originating viewer attaches without a snapshot.
        terminal.interactive.insert(
            pending.viewer_id,
            ViewerState {
                peer: pending.viewer.clone(),
                needs_snapshot: false,
                pending_snapshot_id: None,
                buffered: Vec::new(),
            },
        );
        inner.terminals.insert(name.to_string(), terminal);
        if matches!(inner.state, SessionState::Pending | SessionState::Ready) {
            inner.state = SessionState::Active;
        }
        let (cols, rows) = (pending.cols, pending.rows);
        drop(inner);

        info!(session_id = %self.id, terminal = %name, "Terminal started");
        pending.viewer.do_send(ViewerMessage::Attached {
            terminal: name.to_string(),
        });
        pending.viewer.do_send(ViewerMessage::Text(
            ViewerEvent::setup_ok(name, cols, rows).to_json(),
        ));
    }

    // ---- viewers ----------------------------------------------------------

    /// Add a viewer to an existing terminal. The viewer buffers output until
    /// the snapshot arrives.
    pub fn join_existing_terminal(
        &self,
        viewer_id: Uuid,
        peer: Recipient<ViewerMessage>,
        name: &str,
        role: ViewerRole,
    ) -> Result<(u16, u16), JoinError> {
        let snapshot_id = Uuid::new_v4().to_string();
        let (dims, data, was_paused) = {
            let mut inner = self.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return Err(JoinError::SessionClosed);
            }
            let terminal = inner
                .terminals
                .get_mut(name)
                .ok_or(JoinError::TerminalNotFound)?;
            let state = ViewerState {
                peer,
                needs_snapshot: true,
                pending_snapshot_id: Some(snapshot_id.clone()),
                buffered: Vec::new(),
            };
            match role {
                ViewerRole::Interactive => terminal.interactive.insert(viewer_id, state),
                ViewerRole::Mirror => terminal.mirror.insert(viewer_id, state),
            };
            let was_paused = terminal.paused;
            terminal.paused = false;
            (
                (terminal.cols, terminal.rows),
                terminal.data.as_ref().map(|d| d.peer.clone()),
                was_paused,
            )
        };

        debug!(
            session_id = %self.id,
            terminal = %name,
            viewer_id = %viewer_id,
            role = ?role,
            "Viewer joined terminal"
        );
        if let Some(data) = data {
            if was_paused {
                send_data_frame(&data, RelayFrame::Resume);
            }
            send_data_frame(
                &data,
                RelayFrame::SnapshotRequest {
                    request_id: snapshot_id,
                },
            );
        }
        Ok(dims)
    }

    /// Drop a viewer from every terminal and cancel its in-flight spawns.
    pub fn detach_viewer(&self, viewer_id: Uuid) {
        let mut to_pause = Vec::new();
        {
            let mut inner = self.lock();
            for (name, terminal) in inner.terminals.iter_mut() {
                let removed = terminal.interactive.remove(&viewer_id).is_some()
                    || terminal.mirror.remove(&viewer_id).is_some();
                if removed && !terminal.has_viewers() && !terminal.paused {
                    terminal.paused = true;
                    if let Some(data) = &terminal.data {
                        debug!(session_id = %self.id, terminal = %name, "Last viewer left, pausing");
                        to_pause.push(data.peer.clone());
                    }
                }
            }
            let gone: Vec<String> = inner
                .pending
                .iter()
                .filter(|(_, p)| p.viewer_id == viewer_id)
                .map(|(id, _)| id.clone())
                .collect();
            for request_id in gone {
                if let Some(pending) = inner.pending.remove(&request_id) {
                    pending.timeout.abort();
                }
            }
        }
        for peer in to_pause {
            send_data_frame(&peer, RelayFrame::Pause);
        }
    }

    /// Forward viewer input iff the viewer is interactive on this terminal.
    /// Mirror viewers are silently ignored.
    pub fn on_input(&self, viewer_id: Uuid, name: &str, data: Bytes) {
        let target = {
            let inner = self.lock();
            let Some(terminal) = inner.terminals.get(name) else {
                return;
            };
            if !terminal.interactive.contains_key(&viewer_id) {
                return;
            }
            terminal.data.as_ref().map(|d| d.peer.clone())
        };
        if let Some(peer) = target {
            send_data_frame(&peer, RelayFrame::Input(data));
        }
    }

    /// Resize is permitted for interactive viewers only.
    pub fn on_resize(&self, viewer_id: Uuid, name: &str, cols: u16, rows: u16) {
        let target = {
            let mut inner = self.lock();
            let Some(terminal) = inner.terminals.get_mut(name) else {
                return;
            };
            if !terminal.interactive.contains_key(&viewer_id) {
                return;
            }
            terminal.cols = cols;
            terminal.rows = rows;
            terminal.data.as_ref().map(|d| d.peer.clone())
        };
        if let Some(peer) = target {
            send_data_frame(&peer, RelayFrame::Resize { cols, rows });
        }
    }

    // ---- producer data channel --------------------------------------------

    /// Install a terminal data channel. A data channel for a terminal the
    /// relay has not seen yet (a straggler) creates a placeholder with the
    /// session's default geometry.
    pub fn attach_data(
        &self,
        name: &str,
        conn_id: Uuid,
        peer: Recipient<DataMessage>,
    ) -> Result<(), JoinError> {
        let replaced = {
            let mut inner = self.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return Err(JoinError::SessionClosed);
            }
            if !inner.terminals.contains_key(name) {
                info!(session_id = %self.id, terminal = %name, "Adopting straggler terminal");
                inner.terminals.insert(
                    name.to_string(),
                    Terminal::new(self.config.default_cols, self.config.default_rows, None),
                );
                if matches!(inner.state, SessionState::Pending | SessionState::Ready) {
                    inner.state = SessionState::Active;
                }
            }
            match inner.terminals.get_mut(name) {
                Some(terminal) => terminal.data.replace(DataChannel { conn_id, peer }),
                None => None,
            }
        };
        if let Some(old) = replaced {
            warn!(session_id = %self.id, terminal = %name, "Replacing live data channel");
            old.peer.do_send(DataMessage::Close {
                code: 1000,
                reason: "replaced by a new data channel".to_string(),
            });
        }
        Ok(())
    }

    /// Data-side handshake: reply with the terminal's geometry and flush any
    /// snapshot requests for viewers that joined before the channel was up.
    pub fn on_data_handshake(&self, name: &str, conn_id: Uuid, handshake: DataHandshake) {
        let (peer, dims, snapshot_ids, pause) = {
            let mut inner = self.lock();
            let Some(terminal) = inner.terminals.get_mut(name) else {
                return;
            };
            let peer = match &terminal.data {
                Some(data) if data.conn_id == conn_id => data.peer.clone(),
                _ => return,
            };
            terminal.handshake = Some(handshake);
            let snapshot_ids: Vec<String> = terminal
                .viewers_mut()
                .filter(|v| v.needs_snapshot)
                .filter_map(|v| v.pending_snapshot_id.clone())
                .collect();
            let pause = if terminal.has_viewers() {
                false
            } else {
                terminal.paused = true;
                true
            };
            (peer, (terminal.cols, terminal.rows), snapshot_ids, pause)
        };

        send_data_frame(
            &peer,
            RelayFrame::Resize {
                cols: dims.0,
                rows: dims.1,
            },
        );
        for request_id in snapshot_ids {
            send_data_frame(&peer, RelayFrame::SnapshotRequest { request_id });
        }
        if pause {
            send_data_frame(&peer, RelayFrame::Pause);
        }
    }

    /// Terminal output fan-out. Viewers still waiting for their snapshot get
    /// the chunk buffered, in arrival order; everyone else gets it live.
    pub fn on_output(&self, name: &str, chunk: Bytes) {
        let targets = {
            let mut inner = self.lock();
            let Some(terminal) = inner.terminals.get_mut(name) else {
                return;
            };
            let mut live = Vec::new();
            for viewer in terminal.viewers_mut() {
                if viewer.needs_snapshot {
                    viewer.buffered.push(chunk.clone());
                } else {
                    live.push(viewer.peer.clone());
                }
            }
            live
        };
        for peer in targets {
            peer.do_send(ViewerMessage::Binary(chunk.clone()));
        }
    }

    /// Snapshot response: deliver screen bytes, then the buffered chunks in
    /// arrival order, then go live.
    pub fn on_snapshot(&self, name: &str, request_id: &str, screen: Bytes) {
        let target = {
            let mut inner = self.lock();
            let Some(terminal) = inner.terminals.get_mut(name) else {
                return;
            };
            terminal
                .viewers_mut()
                .find(|v| v.pending_snapshot_id.as_deref() == Some(request_id))
                .map(|viewer| {
                    viewer.needs_snapshot = false;
                    viewer.pending_snapshot_id = None;
                    (viewer.peer.clone(), std::mem::take(&mut viewer.buffered))
                })
        };
        let Some((peer, buffered)) = target else {
            debug!(
                session_id = %self.id,
                terminal = %name,
                request_id = %request_id,
                "Snapshot response with no waiting viewer"
            );
            return;
        };
        peer.do_send(ViewerMessage::Binary(screen));
        for chunk in buffered {
            peer.do_send(ViewerMessage::Binary(chunk));
        }
    }

    /// Terminal ended (producer `terminal_closed`, exit frame, or data-channel
    /// drop). Viewers get the exit code and a normal closure.
    pub fn on_terminal_closed(&self, name: &str, exit_code: i32) {
        let (terminal, owner) = {
            let mut inner = self.lock();
            let Some(terminal) = inner.terminals.remove(name) else {
                return;
            };
            if inner.terminals.is_empty() && inner.state == SessionState::Active {
                inner.state = SessionState::Ready;
            }
            (terminal, inner.owner.clone())
        };

        info!(session_id = %self.id, terminal = %name, exit_code = exit_code, "Terminal closed");
        let exit = ViewerEvent::Exit { code: exit_code }.to_json();
        for viewer in terminal
            .interactive
            .values()
            .chain(terminal.mirror.values())
        {
            viewer.peer.do_send(ViewerMessage::Text(exit.clone()));
            viewer.peer.do_send(ViewerMessage::Close {
                code: 1000,
                reason: "Terminal closed".to_string(),
            });
        }
        if let Some(data) = terminal.data {
            data.peer.do_send(DataMessage::Close {
                code: 1000,
                reason: "Terminal closed".to_string(),
            });
        }
        let _ = self.events.send(SessionEvent::TerminalClosed {
            session_id: self.id.clone(),
            terminal: name.to_string(),
            exit_code,
            owner,
        });
    }

    /// A terminal's data socket dropped without an exit frame.
    pub fn on_data_closed(&self, name: &str, conn_id: Uuid) {
        let live = {
            let inner = self.lock();
            match inner.terminals.get(name).and_then(|t| t.data.as_ref()) {
                Some(data) => data.conn_id == conn_id,
                None => false,
            }
        };
        if live {
            self.on_terminal_closed(name, -1);
        }
    }

    // ---- lifecycle --------------------------------------------------------

    /// Tear the whole session down. Idempotent; emits `sessionClosed`
    /// exactly once.
    pub fn close(&self, reason: SessionCloseReason) {
        let (viewers, data_channels, control, pending, owner, info) = {
            let mut inner = self.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            inner.state = SessionState::Closing;
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            let mut viewers = Vec::new();
            let mut data_channels = Vec::new();
            for (_, terminal) in inner.terminals.drain() {
                if let Some(data) = terminal.data {
                    data_channels.push(data.peer);
                }
                for state in terminal
                    .interactive
                    .into_values()
                    .chain(terminal.mirror.into_values())
                {
                    viewers.push(state.peer);
                }
            }
            let pending: Vec<PendingSpawn> = inner.pending.drain().map(|(_, p)| p).collect();
            let control = inner.control.take().map(|c| c.peer);
            let owner = inner.owner.clone();
            let info = inner.control_info.clone();
            inner.state = SessionState::Closed;
            (viewers, data_channels, control, pending, owner, info)
        };

        info!(session_id = %self.id, reason = ?reason, "Closing session");

        let disconnect = ViewerEvent::Disconnect {
            reason: reason.disconnect_reason().to_string(),
        }
        .to_json();
        for viewer in &viewers {
            viewer.do_send(ViewerMessage::Text(disconnect.clone()));
            viewer.do_send(ViewerMessage::Close {
                code: 1000,
                reason: "Session closed".to_string(),
            });
        }
        for pending in pending {
            pending.timeout.abort();
            pending.viewer.do_send(ViewerMessage::Text(
                ViewerEvent::setup_failed(&pending.requested_name, "session closed").to_json(),
            ));
        }
        for data in data_channels {
            data.do_send(DataMessage::Close {
                code: 1000,
                reason: "Session closed".to_string(),
            });
        }
        if let Some(control) = control {
            control.do_send(ControlMessage::Close {
                code: 1000,
                reason: "Session closed".to_string(),
            });
        }

        let _ = self.events.send(SessionEvent::Closed {
            session_id: self.id.clone(),
            owner,
            hostname: info.as_ref().and_then(|i| i.hostname.clone()),
            working_dir: info.as_ref().and_then(|i| i.working_dir.clone()),
            reason,
            closed_at: Utc::now(),
        });
    }
}

fn to_json_line<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn send_data_frame(peer: &Recipient<DataMessage>, frame: RelayFrame) {
    match frame.encode() {
        Ok(bytes) => peer.do_send(DataMessage::Frame(bytes)),
        Err(err) => warn!(error = %err, "Failed to encode relay frame"),
    }
}
