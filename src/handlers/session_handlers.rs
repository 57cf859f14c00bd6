//! REST surface over the session registry: list live sessions, browse the
//! recently-closed ring, delete a session explicitly.

use actix_web::{HttpResponse, web};
use tracing::info;

use crate::error::AppError;
use crate::models::AuthenticatedUser;
use crate::services::session_registry::{SessionCloseReason, SessionRegistry};

/// List the caller's live sessions.
pub async fn list_sessions_handler(
    registry: web::Data<SessionRegistry>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let mut summaries: Vec<_> = registry
        .list()
        .into_iter()
        .filter(|session| {
            session
                .owner()
                .map(|owner| owner.subject == user.id)
                .unwrap_or(false)
        })
        .map(|session| session.summary())
        .collect();
    summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(HttpResponse::Ok().json(summaries))
}

/// List the caller's recently closed sessions.
pub async fn closed_sessions_handler(
    registry: web::Data<SessionRegistry>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, AppError> {
    let closed: Vec<_> = registry
        .closed_sessions()
        .into_iter()
        .filter(|entry| {
            entry
                .owner
                .as_ref()
                .map(|owner| owner.subject == user.id)
                .unwrap_or(false)
        })
        .collect();
    Ok(HttpResponse::Ok().json(closed))
}

/// Explicitly delete a session. Owner only; viewers get a normal
/// session-ended disconnect.
pub async fn delete_session_handler(
    registry: web::Data<SessionRegistry>,
    user: AuthenticatedUser,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let session = registry
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;
    let owned = session
        .owner()
        .map(|owner| owner.subject == user.id)
        .unwrap_or(false);
    if !owned {
        return Err(AppError::Forbidden("not the session owner".to_string()));
    }

    info!(session_id = %session_id, login = %user.login, "Session deleted via API");
    registry.close_session(&session_id, SessionCloseReason::Graceful);
    Ok(HttpResponse::NoContent().finish())
}
