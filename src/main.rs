use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware::Logger, web};
use dotenv::dotenv;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod error;
mod handlers;
mod middleware;
mod models;
mod protocol;
mod routes;
mod services;

use crate::config::AppSettings;
use crate::middleware::SessionAuthentication;
use crate::routes::{
    configure_api_routes, configure_jam_routes, configure_public_routes, configure_ws_routes,
};
use crate::services::auth::tokens;
use crate::services::room_broker::RoomBroker;
use crate::services::room_store::{MemoryRoomStore, RoomStore};
use crate::services::session_registry::SessionRegistry;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // Load application settings from environment
    let app_settings = match AppSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Failed to load application settings from environment: {}", e);
            log::error!("Cannot start server without valid settings");
            std::process::exit(1);
        }
    };

    tokens::init_token_keys(&app_settings.auth);
    log::info!("Token keys initialized successfully");

    // Relay core: session registry, sweep, room broker over the in-memory store
    let relay_config = Arc::new(app_settings.relay.clone());
    let registry = SessionRegistry::new(relay_config);
    let _sweep = registry.start_sweep_task(Duration::from_secs(60));

    let store: Arc<dyn RoomStore> = Arc::new(MemoryRoomStore::new());
    let broker = RoomBroker::start(store.clone(), registry.clone());
    log::info!("Session registry and room broker initialized");

    let host = app_settings.server.host.clone();
    let port = app_settings.server.port;
    log::info!("Starting server at http://{}:{}", host, port);
    let listener = TcpListener::bind(format!("{}:{}", host, port))?;

    let cors_origins = app_settings.server.cors_origins.clone();
    let settings_data = web::Data::new(app_settings);
    let registry_data = web::Data::from(registry);
    let store_data: web::Data<dyn RoomStore> = web::Data::from(store);
    let broker_data = web::Data::from(broker);

    HttpServer::new(move || {
        let cors = if cors_origins.iter().any(|origin| origin == "*") {
            Cors::permissive()
        } else {
            let mut cors = Cors::default()
                .allow_any_method()
                .allow_any_header()
                .supports_credentials();
            for origin in &cors_origins {
                cors = cors.allowed_origin(origin);
            }
            cors
        };

        App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .app_data(settings_data.clone())
            .app_data(registry_data.clone())
            .app_data(store_data.clone())
            .app_data(broker_data.clone())
            .configure(configure_public_routes)
            // The jam scope must register before the broader /ws scope so
            // its prefix wins the route match.
            .service(
                web::scope("/ws/jam")
                    .wrap(SessionAuthentication)
                    .configure(configure_jam_routes),
            )
            .service(web::scope("/ws").configure(configure_ws_routes))
            .service(
                web::scope("/api")
                    .wrap(SessionAuthentication)
                    .configure(configure_api_routes),
            )
    })
    .listen(listener)?
    .run()
    .await
}
