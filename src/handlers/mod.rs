pub mod health;
pub mod relay_handlers;
pub mod room_handlers;
pub mod session_handlers;
