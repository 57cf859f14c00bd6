//! Process-wide session registry: id → session, a bounded ring of recently
//! closed sessions, and the event bus the room broker consumes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::models::Owner;
use crate::services::session::{Session, SessionState};

/// Terminal state a session closed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionCloseReason {
    Graceful,
    Timeout,
    Error,
}

impl SessionCloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionCloseReason::Graceful => "graceful",
            SessionCloseReason::Timeout => "timeout",
            SessionCloseReason::Error => "error",
        }
    }

    /// Reason string carried by the `disconnect` message viewers receive.
    pub fn disconnect_reason(&self) -> &'static str {
        match self {
            SessionCloseReason::Graceful => "session_ended",
            SessionCloseReason::Timeout => "producer_timeout",
            SessionCloseReason::Error => "session_error",
        }
    }
}

/// Events published by the registry's bus. `Closed` fires exactly once per
/// session id.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Online {
        session_id: String,
        owner: Option<Owner>,
    },
    Offline {
        session_id: String,
        owner: Option<Owner>,
    },
    Closed {
        session_id: String,
        owner: Option<Owner>,
        hostname: Option<String>,
        working_dir: Option<String>,
        reason: SessionCloseReason,
        closed_at: DateTime<Utc>,
    },
    TerminalClosed {
        session_id: String,
        terminal: String,
        exit_code: i32,
        owner: Option<Owner>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedSession {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub closed_at: DateTime<Utc>,
    pub reason: SessionCloseReason,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    closed: Mutex<VecDeque<ClosedSession>>,
    events: broadcast::Sender<SessionEvent>,
    config: Arc<RelayConfig>,
}

impl SessionRegistry {
    pub fn new(config: Arc<RelayConfig>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let registry = Arc::new(Self {
            sessions: DashMap::new(),
            closed: Mutex::new(VecDeque::new()),
            events,
            config,
        });
        registry.start_event_task();
        registry
    }

    /// Fetch the session for `id`, creating it in PENDING if absent. A
    /// closed leftover (the event task has not swept it yet) is replaced
    /// with a fresh session.
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        loop {
            let session = {
                let entry = self.sessions.entry(id.to_string()).or_insert_with(|| {
                    info!(session_id = %id, "Creating session");
                    Session::new(id.to_string(), self.config.clone(), self.events.clone())
                });
                entry.value().clone()
            };
            if !matches!(
                session.state(),
                SessionState::Closing | SessionState::Closed
            ) {
                return session;
            }
            // Closed leftover: drop exactly that instance and retry.
            self.sessions
                .remove_if(id, |_, current| Arc::ptr_eq(current, &session));
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn closed_sessions(&self) -> Vec<ClosedSession> {
        match self.closed.lock() {
            Ok(ring) => ring.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Close a session by id. Returns false when the id is unknown.
    pub fn close_session(&self, id: &str, reason: SessionCloseReason) -> bool {
        match self.get(id) {
            Some(session) => {
                session.close(reason);
                true
            }
            None => false,
        }
    }

    fn push_closed(&self, entry: ClosedSession) {
        let mut ring = match self.closed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Closed-session ring lock poisoned, recovering");
                poisoned.into_inner()
            }
        };
        ring.push_back(entry);
        while ring.len() > self.config.closed_session_ring {
            ring.pop_front();
        }
    }

    /// Mirrors `Closed` events into the ring and drops the session from the
    /// live map. Every close path funnels through the event bus, so this is
    /// the single removal site.
    fn start_event_task(self: &Arc<Self>) {
        let registry = self.clone();
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Closed {
                        session_id,
                        owner,
                        hostname,
                        working_dir,
                        reason,
                        closed_at,
                    }) => {
                        // Only drop the entry if it is still the closed
                        // instance; the id may have been reused already.
                        registry.sessions.remove_if(&session_id, |_, session| {
                            matches!(
                                session.state(),
                                SessionState::Closing | SessionState::Closed
                            )
                        });
                        registry.push_closed(ClosedSession {
                            id: session_id,
                            owner,
                            hostname,
                            working_dir,
                            closed_at,
                            reason,
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Registry event task lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Periodic sweep: close sessions past the configured max age and drop
    /// any closed leftovers.
    pub fn start_sweep_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let max_age = Duration::from_millis(registry.config.session_max_age_ms);
                let stale: Vec<(String, bool)> = registry
                    .sessions
                    .iter()
                    .filter_map(|entry| {
                        let session = entry.value();
                        if matches!(
                            session.state(),
                            SessionState::Closing | SessionState::Closed
                        ) {
                            Some((entry.key().clone(), true))
                        } else if session.age() >= max_age {
                            Some((entry.key().clone(), false))
                        } else {
                            None
                        }
                    })
                    .collect();
                for (id, leftover) in stale {
                    if leftover {
                        debug!(session_id = %id, "Sweeping closed leftover");
                        registry.sessions.remove_if(&id, |_, session| {
                            matches!(
                                session.state(),
                                SessionState::Closing | SessionState::Closed
                            )
                        });
                    } else {
                        info!(session_id = %id, "Session exceeded max age, closing");
                        registry.close_session(&id, SessionCloseReason::Timeout);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry_with(config: RelayConfig) -> Arc<SessionRegistry> {
        SessionRegistry::new(Arc::new(config))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[actix_rt::test]
    async fn get_or_create_is_idempotent() {
        let registry = registry_with(RelayConfig::default());
        let a = registry.get_or_create("s-1");
        let b = registry.get_or_create("s-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.list().len(), 1);
    }

    #[actix_rt::test]
    async fn closed_session_is_replaced_on_next_create() {
        let registry = registry_with(RelayConfig::default());
        let first = registry.get_or_create("s-1");
        first.close(SessionCloseReason::Graceful);
        let second = registry.get_or_create("s-1");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), SessionState::Pending);
    }

    #[actix_rt::test]
    async fn close_pushes_ring_entry_and_removes_session() {
        let registry = registry_with(RelayConfig::default());
        registry.get_or_create("s-1");
        assert!(registry.close_session("s-1", SessionCloseReason::Graceful));
        settle().await;

        assert!(registry.get("s-1").is_none());
        let closed = registry.closed_sessions();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, "s-1");
        assert_eq!(closed[0].reason, SessionCloseReason::Graceful);
    }

    #[actix_rt::test]
    async fn ring_is_bounded() {
        let registry = registry_with(RelayConfig {
            closed_session_ring: 3,
            ..RelayConfig::default()
        });
        for i in 0..10 {
            let id = format!("s-{}", i);
            registry.get_or_create(&id);
            registry.close_session(&id, SessionCloseReason::Graceful);
        }
        settle().await;
        let closed = registry.closed_sessions();
        assert_eq!(closed.len(), 3);
        assert_eq!(closed[0].id, "s-7");
        assert_eq!(closed[2].id, "s-9");
    }

    #[actix_rt::test]
    async fn closing_an_unknown_session_is_false() {
        let registry = registry_with(RelayConfig::default());
        assert!(!registry.close_session("nope", SessionCloseReason::Error));
    }

    #[actix_rt::test]
    async fn sweep_closes_sessions_past_max_age() {
        let registry = registry_with(RelayConfig {
            session_max_age_ms: 0,
            ..RelayConfig::default()
        });
        registry.get_or_create("s-old");
        let sweep = registry.start_sweep_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        sweep.abort();

        assert!(registry.get("s-old").is_none());
        let closed = registry.closed_sessions();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, SessionCloseReason::Timeout);
    }

    #[actix_rt::test]
    async fn subscribers_see_closed_event_once() {
        let registry = registry_with(RelayConfig::default());
        let mut rx = registry.subscribe();
        registry.get_or_create("s-1");
        registry.close_session("s-1", SessionCloseReason::Graceful);
        registry.close_session("s-1", SessionCloseReason::Graceful);
        settle().await;

        let mut closed_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::Closed { .. }) {
                closed_events += 1;
            }
        }
        assert_eq!(closed_events, 1);
    }
}
