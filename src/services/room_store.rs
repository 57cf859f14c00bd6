//! Persistent-store contract for collaboration rooms, and the in-memory
//! implementation the relay runs with. A deployment backed by a real
//! database substitutes its own `RoomStore`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::AuthenticatedUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelSide {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub owner_login: String,
    pub created_at: DateTime<Utc>,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomParticipant {
    pub user_id: String,
    pub login: String,
    pub joined_at: DateTime<Utc>,
}

/// A session surfaced inside a room, independent of who owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntry {
    pub session_id: String,
    pub added_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_gracefully: Option<bool>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelSelection {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedPanelState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<PanelSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<PanelSelection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub id: String,
    pub room_id: String,
    pub room_name: String,
    pub inviter_login: String,
    pub invitee_login: String,
    pub created_at: DateTime<Utc>,
    pub status: InvitationStatus,
}

/// Store contract used by the room broker and the room REST surface.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn create_room(&self, owner: &AuthenticatedUser, name: &str) -> AppResult<Room>;
    async fn get_room(&self, id: &str) -> AppResult<Option<Room>>;
    async fn archive_room(&self, id: &str) -> AppResult<()>;
    async fn list_rooms_for_user(&self, user_id: &str) -> AppResult<Vec<Room>>;

    async fn is_room_member(&self, id: &str, user_id: &str) -> AppResult<bool>;
    async fn list_participants(&self, id: &str) -> AppResult<Vec<RoomParticipant>>;
    async fn add_participant(&self, id: &str, participant: RoomParticipant) -> AppResult<()>;

    async fn get_pool(&self, id: &str) -> AppResult<Vec<PoolEntry>>;
    async fn add_to_pool(&self, id: &str, entry: PoolEntry) -> AppResult<()>;
    async fn remove_from_pool(&self, id: &str, session_id: &str) -> AppResult<()>;
    /// Marks the session closed in every pool containing it.
    async fn mark_pool_session_closed(&self, session_id: &str, graceful: bool) -> AppResult<()>;
    /// Marks the session online in every pool containing it.
    async fn mark_pool_session_online(&self, session_id: &str) -> AppResult<()>;

    async fn get_shared_panel_state(&self, id: &str) -> AppResult<SharedPanelState>;
    async fn set_shared_panel_state(
        &self,
        id: &str,
        panel: PanelSide,
        selection: Option<PanelSelection>,
    ) -> AppResult<SharedPanelState>;

    async fn create_invitation(
        &self,
        room_id: &str,
        inviter: &AuthenticatedUser,
        invitee_login: &str,
    ) -> AppResult<Invitation>;
    async fn list_pending_invitations(&self, login: &str) -> AppResult<Vec<Invitation>>;
    async fn accept_invitation(&self, id: &str, user: &AuthenticatedUser) -> AppResult<Room>;
    async fn decline_invitation(&self, id: &str, user: &AuthenticatedUser) -> AppResult<()>;
}

struct StoredRoom {
    room: Room,
    participants: Vec<RoomParticipant>,
    pool: Vec<PoolEntry>,
    panels: SharedPanelState,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryRoomStore {
    rooms: DashMap<String, StoredRoom>,
    invitations: DashMap<String, Invitation>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn create_room(&self, owner: &AuthenticatedUser, name: &str) -> AppResult<Room> {
        let room = Room {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner_id: owner.id.clone(),
            owner_login: owner.login.clone(),
            created_at: Utc::now(),
            archived: false,
        };
        self.rooms.insert(
            room.id.clone(),
            StoredRoom {
                room: room.clone(),
                participants: vec![RoomParticipant {
                    user_id: owner.id.clone(),
                    login: owner.login.clone(),
                    joined_at: Utc::now(),
                }],
                pool: Vec::new(),
                panels: SharedPanelState::default(),
            },
        );
        info!(room_id = %room.id, owner = %owner.login, "Room created");
        Ok(room)
    }

    async fn get_room(&self, id: &str) -> AppResult<Option<Room>> {
        Ok(self.rooms.get(id).map(|stored| stored.room.clone()))
    }

    async fn archive_room(&self, id: &str) -> AppResult<()> {
        let mut stored = self
            .rooms
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("room {}", id)))?;
        stored.room.archived = true;
        Ok(())
    }

    async fn list_rooms_for_user(&self, user_id: &str) -> AppResult<Vec<Room>> {
        Ok(self
            .rooms
            .iter()
            .filter(|stored| {
                !stored.room.archived
                    && stored.participants.iter().any(|p| p.user_id == user_id)
            })
            .map(|stored| stored.room.clone())
            .collect())
    }

    async fn is_room_member(&self, id: &str, user_id: &str) -> AppResult<bool> {
        Ok(self
            .rooms
            .get(id)
            .map(|stored| {
                !stored.room.archived
                    && stored.participants.iter().any(|p| p.user_id == user_id)
            })
            .unwrap_or(false))
    }

    async fn list_participants(&self, id: &str) -> AppResult<Vec<RoomParticipant>> {
        self.rooms
            .get(id)
            .map(|stored| stored.participants.clone())
            .ok_or_else(|| AppError::NotFound(format!("room {}", id)))
    }

    async fn add_participant(&self, id: &str, participant: RoomParticipant) -> AppResult<()> {
        let mut stored = self
            .rooms
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("room {}", id)))?;
        if stored
            .participants
            .iter()
            .any(|p| p.user_id == participant.user_id)
        {
            return Ok(());
        }
        stored.participants.push(participant);
        Ok(())
    }

    async fn get_pool(&self, id: &str) -> AppResult<Vec<PoolEntry>> {
        self.rooms
            .get(id)
            .map(|stored| stored.pool.clone())
            .ok_or_else(|| AppError::NotFound(format!("room {}", id)))
    }

    async fn add_to_pool(&self, id: &str, entry: PoolEntry) -> AppResult<()> {
        let mut stored = self
            .rooms
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("room {}", id)))?;
        if stored
            .pool
            .iter()
            .any(|e| e.session_id == entry.session_id)
        {
            return Err(AppError::AlreadyExists(format!(
                "session {} already in pool",
                entry.session_id
            )));
        }
        stored.pool.push(entry);
        Ok(())
    }

    async fn remove_from_pool(&self, id: &str, session_id: &str) -> AppResult<()> {
        let mut stored = self
            .rooms
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("room {}", id)))?;
        let before = stored.pool.len();
        stored.pool.retain(|e| e.session_id != session_id);
        if stored.pool.len() == before {
            return Err(AppError::NotFound(format!(
                "session {} not in pool",
                session_id
            )));
        }
        Ok(())
    }

    async fn mark_pool_session_closed(&self, session_id: &str, graceful: bool) -> AppResult<()> {
        for mut stored in self.rooms.iter_mut() {
            for entry in stored.pool.iter_mut() {
                if entry.session_id == session_id {
                    entry.online = false;
                    entry.closed_gracefully = Some(graceful);
                }
            }
        }
        Ok(())
    }

    async fn mark_pool_session_online(&self, session_id: &str) -> AppResult<()> {
        for mut stored in self.rooms.iter_mut() {
            for entry in stored.pool.iter_mut() {
                if entry.session_id == session_id {
                    entry.online = true;
                    entry.closed_gracefully = None;
                }
            }
        }
        Ok(())
    }

    async fn get_shared_panel_state(&self, id: &str) -> AppResult<SharedPanelState> {
        self.rooms
            .get(id)
            .map(|stored| stored.panels.clone())
            .ok_or_else(|| AppError::NotFound(format!("room {}", id)))
    }

    async fn set_shared_panel_state(
        &self,
        id: &str,
        panel: PanelSide,
        selection: Option<PanelSelection>,
    ) -> AppResult<SharedPanelState> {
        let mut stored = self
            .rooms
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("room {}", id)))?;
        match panel {
            PanelSide::Left => stored.panels.left = selection,
            PanelSide::Right => stored.panels.right = selection,
        }
        Ok(stored.panels.clone())
    }

    async fn create_invitation(
        &self,
        room_id: &str,
        inviter: &AuthenticatedUser,
        invitee_login: &str,
    ) -> AppResult<Invitation> {
        let room = self
            .get_room(room_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("room {}", room_id)))?;
        let invitation = Invitation {
            id: Uuid::new_v4().to_string(),
            room_id: room.id.clone(),
            room_name: room.name.clone(),
            inviter_login: inviter.login.clone(),
            invitee_login: invitee_login.to_string(),
            created_at: Utc::now(),
            status: InvitationStatus::Pending,
        };
        self.invitations
            .insert(invitation.id.clone(), invitation.clone());
        Ok(invitation)
    }

    async fn list_pending_invitations(&self, login: &str) -> AppResult<Vec<Invitation>> {
        Ok(self
            .invitations
            .iter()
            .filter(|inv| inv.invitee_login == login && inv.status == InvitationStatus::Pending)
            .map(|inv| inv.value().clone())
            .collect())
    }

    async fn accept_invitation(&self, id: &str, user: &AuthenticatedUser) -> AppResult<Room> {
        let (room_id, invitee) = {
            let invitation = self
                .invitations
                .get(id)
                .ok_or_else(|| AppError::NotFound(format!("invitation {}", id)))?;
            if invitation.status != InvitationStatus::Pending {
                return Err(AppError::BadRequest("invitation is not pending".to_string()));
            }
            (invitation.room_id.clone(), invitation.invitee_login.clone())
        };
        if invitee != user.login {
            return Err(AppError::Forbidden(
                "invitation addressed to another user".to_string(),
            ));
        }
        let room = self
            .get_room(&room_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("room {}", room_id)))?;
        self.add_participant(
            &room_id,
            RoomParticipant {
                user_id: user.id.clone(),
                login: user.login.clone(),
                joined_at: Utc::now(),
            },
        )
        .await?;
        if let Some(mut invitation) = self.invitations.get_mut(id) {
            invitation.status = InvitationStatus::Accepted;
        }
        Ok(room)
    }

    async fn decline_invitation(&self, id: &str, user: &AuthenticatedUser) -> AppResult<()> {
        let mut invitation = self
            .invitations
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("invitation {}", id)))?;
        if invitation.invitee_login != user.login {
            return Err(AppError::Forbidden(
                "invitation addressed to another user".to_string(),
            ));
        }
        invitation.status = InvitationStatus::Declined;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user(id: &str, login: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            id: id.to_string(),
            login: login.to_string(),
        }
    }

    fn entry(session_id: &str, added_by: &str) -> PoolEntry {
        PoolEntry {
            session_id: session_id.to_string(),
            added_by: added_by.to_string(),
            hostname: None,
            working_dir: None,
            online: true,
            closed_gracefully: None,
            added_at: Utc::now(),
        }
    }

    #[actix_rt::test]
    async fn owner_is_a_member_of_a_new_room() {
        let store = MemoryRoomStore::new();
        let owner = user("u-1", "ada");
        let room = store.create_room(&owner, "pairing").await.unwrap();
        assert!(store.is_room_member(&room.id, "u-1").await.unwrap());
        assert!(!store.is_room_member(&room.id, "u-2").await.unwrap());
    }

    #[actix_rt::test]
    async fn add_then_remove_restores_the_pool() {
        let store = MemoryRoomStore::new();
        let room = store.create_room(&user("u-1", "ada"), "pairing").await.unwrap();
        let before = store.get_pool(&room.id).await.unwrap();

        store.add_to_pool(&room.id, entry("s-1", "u-1")).await.unwrap();
        assert_eq!(store.get_pool(&room.id).await.unwrap().len(), 1);

        store.remove_from_pool(&room.id, "s-1").await.unwrap();
        assert_eq!(store.get_pool(&room.id).await.unwrap(), before);
    }

    #[actix_rt::test]
    async fn duplicate_pool_entries_are_refused() {
        let store = MemoryRoomStore::new();
        let room = store.create_room(&user("u-1", "ada"), "pairing").await.unwrap();
        store.add_to_pool(&room.id, entry("s-1", "u-1")).await.unwrap();
        assert!(matches!(
            store.add_to_pool(&room.id, entry("s-1", "u-2")).await,
            Err(AppError::AlreadyExists(_))
        ));
    }

    #[actix_rt::test]
    async fn pool_close_marks_every_room_containing_the_session() {
        let store = MemoryRoomStore::new();
        let a = store.create_room(&user("u-1", "ada"), "a").await.unwrap();
        let b = store.create_room(&user("u-2", "bob"), "b").await.unwrap();
        store.add_to_pool(&a.id, entry("s-1", "u-1")).await.unwrap();
        store.add_to_pool(&b.id, entry("s-1", "u-2")).await.unwrap();

        store.mark_pool_session_closed("s-1", true).await.unwrap();
        for room_id in [&a.id, &b.id] {
            let pool = store.get_pool(room_id).await.unwrap();
            assert!(!pool[0].online);
            assert_eq!(pool[0].closed_gracefully, Some(true));
        }
    }

    #[actix_rt::test]
    async fn panel_state_is_per_side() {
        let store = MemoryRoomStore::new();
        let room = store.create_room(&user("u-1", "ada"), "pairing").await.unwrap();
        let state = store
            .set_shared_panel_state(
                &room.id,
                PanelSide::Left,
                Some(PanelSelection {
                    session_id: "s-1".to_string(),
                    terminal_name: Some("7421".to_string()),
                }),
            )
            .await
            .unwrap();
        assert!(state.left.is_some());
        assert!(state.right.is_none());

        let state = store
            .set_shared_panel_state(&room.id, PanelSide::Left, None)
            .await
            .unwrap();
        assert_eq!(state, SharedPanelState::default());
    }

    #[actix_rt::test]
    async fn invitation_lifecycle() {
        let store = MemoryRoomStore::new();
        let owner = user("u-1", "ada");
        let invitee = user("u-2", "bob");
        let room = store.create_room(&owner, "pairing").await.unwrap();
        let invitation = store
            .create_invitation(&room.id, &owner, "bob")
            .await
            .unwrap();

        let pending = store.list_pending_invitations("bob").await.unwrap();
        assert_eq!(pending.len(), 1);

        // The wrong user cannot accept it.
        assert!(matches!(
            store.accept_invitation(&invitation.id, &user("u-3", "eve")).await,
            Err(AppError::Forbidden(_))
        ));

        let joined = store.accept_invitation(&invitation.id, &invitee).await.unwrap();
        assert_eq!(joined.id, room.id);
        assert!(store.is_room_member(&room.id, "u-2").await.unwrap());
        assert!(store.list_pending_invitations("bob").await.unwrap().is_empty());
    }
}
