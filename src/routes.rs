use actix_web::web;

use crate::handlers::{health, relay_handlers, room_handlers, session_handlers};

// Configure WebSocket routes. The control and data endpoints authenticate
// inside the upgrade (bearer token / none); the jam endpoint sits behind the
// session-auth middleware applied by the caller.
pub fn configure_ws_routes(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/control/{session_id}",
        web::get().to(relay_handlers::control_ws_handler),
    )
    .route(
        "/terminal-data/{session_id}/{terminal_name}",
        web::get().to(relay_handlers::terminal_data_ws_handler),
    )
    .route(
        "/terminal/{session_id}",
        web::get().to(relay_handlers::viewer_ws_handler),
    );
}

pub fn configure_jam_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/{room_id}", web::get().to(relay_handlers::room_ws_handler));
}

// Configure protected API routes (requires the session cookie)
pub fn configure_api_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/sessions")
            .route("", web::get().to(session_handlers::list_sessions_handler))
            .route(
                "/closed",
                web::get().to(session_handlers::closed_sessions_handler),
            )
            .route(
                "/{session_id}",
                web::delete().to(session_handlers::delete_session_handler),
            ),
    );

    cfg.service(
        web::scope("/jams")
            .route("", web::post().to(room_handlers::create_room_handler))
            .route("", web::get().to(room_handlers::list_rooms_handler))
            .route("/{room_id}", web::get().to(room_handlers::get_room_handler))
            .route(
                "/{room_id}/archive",
                web::post().to(room_handlers::archive_room_handler),
            )
            .route(
                "/{room_id}/invitations",
                web::post().to(room_handlers::create_invitation_handler),
            ),
    );

    cfg.service(
        web::scope("/invitations")
            .route("", web::get().to(room_handlers::list_invitations_handler))
            .route(
                "/{invitation_id}/accept",
                web::post().to(room_handlers::accept_invitation_handler),
            )
            .route(
                "/{invitation_id}/decline",
                web::post().to(room_handlers::decline_invitation_handler),
            ),
    );
}

// Configure public routes (no authentication required)
pub fn configure_public_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(health::health_check));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;

    #[actix_rt::test]
    async fn routes_compile() {
        let _app = test::init_service(
            actix_web::App::new()
                .configure(configure_public_routes)
                .service(actix_web::web::scope("/api").configure(configure_api_routes)),
        )
        .await;
    }
}
