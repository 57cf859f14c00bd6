//! The four WebSocket bind points of the relay.

use actix_web::{HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use actix_web_httpauth::extractors::bearer::BearerAuth;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppSettings;
use crate::error::AppError;
use crate::models::AuthenticatedUser;
use crate::services::auth::tokens;
use crate::services::control_ws::ControlWs;
use crate::services::room_broker::RoomBroker;
use crate::services::room_store::RoomStore;
use crate::services::room_ws::RoomWs;
use crate::services::session_registry::SessionRegistry;
use crate::services::terminal_data_ws::TerminalDataWs;
use crate::services::viewer_ws::ViewerWs;

fn start_ws<A>(
    actor: A,
    req: &HttpRequest,
    stream: web::Payload,
    max_frame_bytes: usize,
    correlation_id: Uuid,
) -> Result<HttpResponse, actix_web::Error>
where
    A: actix::Actor<Context = ws::WebsocketContext<A>>
        + actix::StreamHandler<Result<ws::Message, ws::ProtocolError>>,
{
    match ws::WsResponseBuilder::new(actor, req, stream)
        .frame_size(max_frame_bytes)
        .start()
    {
        Ok(resp) => {
            info!(
                ws_upgrade_success = true,
                correlation_id = %correlation_id,
                request_path = req.path(),
                "WebSocket upgrade success"
            );
            Ok(resp)
        }
        Err(err) => {
            error!(
                correlation_id = %correlation_id,
                request_path = req.path(),
                error = %err,
                "WebSocket handshake failed"
            );
            Ok(HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "websocket_handshake_failed"
            })))
        }
    }
}

/// Producer control channel: `GET /ws/control/{sessionId}` with a Bearer
/// token. An invalid credential still upgrades and then closes with 4401.
pub async fn control_ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    registry: web::Data<SessionRegistry>,
    settings: web::Data<AppSettings>,
    auth: Option<BearerAuth>,
) -> Result<HttpResponse, actix_web::Error> {
    let session_id = path.into_inner();
    let correlation_id = Uuid::new_v4();
    let remote_peer = req
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let principal = auth.as_ref().and_then(|bearer| {
        match tokens::verify_control_token(bearer.token()) {
            Ok(owner) => Some(owner),
            Err(err) => {
                warn!(
                    correlation_id = %correlation_id,
                    session_id = %session_id,
                    error = %err,
                    "Control token rejected"
                );
                None
            }
        }
    });

    info!(
        ws_upgrade_start = true,
        correlation_id = %correlation_id,
        session_id = %session_id,
        remote_peer = %remote_peer,
        has_credential = principal.is_some(),
        "Starting producer control connection"
    );

    let actor = ControlWs::new(session_id, registry.into_inner(), principal);
    start_ws(
        actor,
        &req,
        stream,
        settings.relay.max_frame_bytes,
        correlation_id,
    )
}

/// Producer terminal data channel: `GET /ws/terminal-data/{sessionId}/{terminalName}`.
pub async fn terminal_data_ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<(String, String)>,
    registry: web::Data<SessionRegistry>,
    settings: web::Data<AppSettings>,
) -> Result<HttpResponse, actix_web::Error> {
    let (session_id, terminal_name) = path.into_inner();
    let correlation_id = Uuid::new_v4();
    info!(
        ws_upgrade_start = true,
        correlation_id = %correlation_id,
        session_id = %session_id,
        terminal = %terminal_name,
        "Starting terminal data connection"
    );
    let actor = TerminalDataWs::new(session_id, terminal_name, registry.into_inner());
    start_ws(
        actor,
        &req,
        stream,
        settings.relay.max_frame_bytes,
        correlation_id,
    )
}

/// Viewer channel: `GET /ws/terminal/{sessionId}`. The first frame must be
/// a JSON setup message.
pub async fn viewer_ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    registry: web::Data<SessionRegistry>,
    settings: web::Data<AppSettings>,
) -> Result<HttpResponse, actix_web::Error> {
    let session_id = path.into_inner();
    let correlation_id = Uuid::new_v4();
    info!(
        ws_upgrade_start = true,
        correlation_id = %correlation_id,
        session_id = %session_id,
        "Starting viewer connection"
    );
    let actor = ViewerWs::new(
        session_id,
        registry.into_inner(),
        Arc::new(settings.relay.clone()),
    );
    start_ws(
        actor,
        &req,
        stream,
        settings.relay.max_frame_bytes,
        correlation_id,
    )
}

/// Room participant channel: `GET /ws/jam/{roomId}`. Identity comes from
/// the ambient session cookie; membership is checked before the upgrade.
pub async fn room_ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    broker: web::Data<RoomBroker>,
    store: web::Data<dyn RoomStore>,
    settings: web::Data<AppSettings>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, actix_web::Error> {
    let room_id = path.into_inner();
    let correlation_id = Uuid::new_v4();

    match store.get_room(&room_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(AppError::NotFound(format!("room {}", room_id)).into()),
        Err(err) => return Err(err.into()),
    }
    match store.is_room_member(&room_id, &user.id).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                correlation_id = %correlation_id,
                room_id = %room_id,
                login = %user.login,
                "Rejecting non-member room connection"
            );
            return Err(AppError::Forbidden("not a room member".to_string()).into());
        }
        Err(err) => return Err(err.into()),
    }

    info!(
        ws_upgrade_start = true,
        correlation_id = %correlation_id,
        room_id = %room_id,
        login = %user.login,
        "Starting room participant connection"
    );
    let actor = RoomWs::new(room_id, user, broker.into_inner());
    start_ws(
        actor,
        &req,
        stream,
        settings.relay.max_frame_bytes,
        correlation_id,
    )
}
