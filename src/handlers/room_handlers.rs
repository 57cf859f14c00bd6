//! REST surface for collaboration rooms and invitations.

use actix_web::{HttpResponse, web};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::AppError;
use crate::models::AuthenticatedUser;
use crate::services::room_broker::RoomBroker;
use crate::services::room_store::RoomStore;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvitationRequest {
    pub invitee_login: String,
}

pub async fn create_room_handler(
    store: web::Data<dyn RoomStore>,
    user: AuthenticatedUser,
    body: web::Json<CreateRoomRequest>,
) -> Result<HttpResponse, AppError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("room name must not be empty".to_string()));
    }
    let room = store.create_room(&user, name).await?;
    Ok(HttpResponse::Created().json(room))
}

pub async fn list_rooms_handler(
    store: web::Data<dyn RoomStore>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let mut rooms = store.list_rooms_for_user(&user.id).await?;
    rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(HttpResponse::Ok().json(rooms))
}

pub async fn get_room_handler(
    store: web::Data<dyn RoomStore>,
    broker: web::Data<RoomBroker>,
    user: AuthenticatedUser,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let room_id = path.into_inner();
    let room = store
        .get_room(&room_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("room {}", room_id)))?;
    if !store.is_room_member(&room_id, &user.id).await? {
        return Err(AppError::Forbidden("not a room member".to_string()));
    }
    let participants = store.list_participants(&room_id).await?;
    let pool = store.get_pool(&room_id).await?;
    let panels = store.get_shared_panel_state(&room_id).await?;
    Ok(HttpResponse::Ok().json(json!({
        "room": room,
        "participants": participants,
        "pool": pool,
        "panels": panels,
        "connectedCount": broker.connected_count(&room_id),
    })))
}

pub async fn archive_room_handler(
    store: web::Data<dyn RoomStore>,
    user: AuthenticatedUser,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let room_id = path.into_inner();
    let room = store
        .get_room(&room_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("room {}", room_id)))?;
    if room.owner_id != user.id {
        return Err(AppError::Forbidden("only the owner may archive a room".to_string()));
    }
    store.archive_room(&room_id).await?;
    info!(room_id = %room_id, login = %user.login, "Room archived");
    Ok(HttpResponse::NoContent().finish())
}

pub async fn create_invitation_handler(
    store: web::Data<dyn RoomStore>,
    user: AuthenticatedUser,
    path: web::Path<String>,
    body: web::Json<CreateInvitationRequest>,
) -> Result<HttpResponse, AppError> {
    let room_id = path.into_inner();
    if !store.is_room_member(&room_id, &user.id).await? {
        return Err(AppError::Forbidden("not a room member".to_string()));
    }
    let invitee = body.invitee_login.trim();
    if invitee.is_empty() {
        return Err(AppError::Validation("invitee login must not be empty".to_string()));
    }
    if invitee == user.login {
        return Err(AppError::Validation("cannot invite yourself".to_string()));
    }
    let invitation = store.create_invitation(&room_id, &user, invitee).await?;
    info!(
        room_id = %room_id,
        inviter = %user.login,
        invitee = %invitee,
        "Invitation created"
    );
    Ok(HttpResponse::Created().json(invitation))
}

pub async fn list_invitations_handler(
    store: web::Data<dyn RoomStore>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let invitations = store.list_pending_invitations(&user.login).await?;
    Ok(HttpResponse::Ok().json(invitations))
}

pub async fn accept_invitation_handler(
    store: web::Data<dyn RoomStore>,
    user: AuthenticatedUser,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let invitation_id = path.into_inner();
    let room = store.accept_invitation(&invitation_id, &user).await?;
    info!(
        invitation_id = %invitation_id,
        room_id = %room.id,
        login = %user.login,
        "Invitation accepted"
    );
    Ok(HttpResponse::Ok().json(room))
}

pub async fn decline_invitation_handler(
    store: web::Data<dyn RoomStore>,
    user: AuthenticatedUser,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let invitation_id = path.into_inner();
    store.decline_invitation(&invitation_id, &user).await?;
    Ok(HttpResponse::NoContent().finish())
}
