//! WebSocket close codes used by the relay.

use actix_web_actors::ws::{CloseCode, CloseReason};

/// Bad or invalid setup message.
pub const BAD_SETUP: u16 = 4400;
/// Missing or invalid credential (producer control only).
pub const UNAUTHENTICATED: u16 = 4401;
/// Producer subject does not match the established session owner.
pub const NOT_OWNER: u16 = 4403;
/// Session or terminal not found.
pub const NOT_FOUND: u16 = 4404;
/// Viewer sent no setup within the setup window.
pub const SETUP_TIMEOUT: u16 = 4408;
/// A live control channel already exists for the session.
pub const ALREADY_CONNECTED: u16 = 4409;
/// Normal closure.
pub const NORMAL: u16 = 1000;
/// Viewer write queue overflowed; the peer is dropped, not the terminal.
pub const SLOW_CONSUMER: u16 = 1011;

pub fn close_reason(code: u16, description: &str) -> CloseReason {
    CloseReason {
        code: CloseCode::from(code),
        description: Some(description.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_close_code() {
        for code in [
            BAD_SETUP,
            UNAUTHENTICATED,
            NOT_OWNER,
            NOT_FOUND,
            SETUP_TIMEOUT,
            ALREADY_CONNECTED,
            NORMAL,
            SLOW_CONSUMER,
        ] {
            let reason = close_reason(code, "x");
            assert_eq!(u16::from(reason.code), code);
        }
    }
}
