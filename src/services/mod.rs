pub mod auth;
pub mod control_ws;
pub mod room_broker;
pub mod room_store;
pub mod room_ws;
pub mod session;
pub mod session_registry;
pub mod terminal_data_ws;
pub mod token_bucket;
pub mod viewer_ws;
