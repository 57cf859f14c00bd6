//! Control-channel messages, one UTF-8 JSON object per WebSocket text frame.

use serde::{Deserialize, Serialize};

/// Handshake the producer sends right after the control channel opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlHandshake {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Relay → producer control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlCommand {
    StartTerminal {
        name: String,
        cols: u16,
        rows: u16,
        request_id: String,
    },
    CloseTerminal {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

/// Producer → relay control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlEvent {
    ControlHandshake(ControlHandshake),
    TerminalStarted {
        name: String,
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TerminalClosed {
        name: String,
        exit_code: i32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn start_terminal_wire_shape() {
        let cmd = ControlCommand::StartTerminal {
            name: "x".to_string(),
            cols: 80,
            rows: 24,
            request_id: "r-1".to_string(),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "start_terminal",
                "name": "x",
                "cols": 80,
                "rows": 24,
                "requestId": "r-1"
            })
        );
    }

    #[test]
    fn close_terminal_omits_missing_signal() {
        let cmd = ControlCommand::CloseTerminal {
            name: "7421".to_string(),
            signal: None,
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value, json!({"type": "close_terminal", "name": "7421"}));
    }

    #[test]
    fn parses_control_handshake() {
        let raw = r#"{"type":"control_handshake","version":"1","hostname":"devbox","workingDir":"/src"}"#;
        let event: ControlEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            ControlEvent::ControlHandshake(ControlHandshake {
                version: "1".to_string(),
                hostname: Some("devbox".to_string()),
                username: None,
                working_dir: Some("/src".to_string()),
            })
        );
    }

    #[test]
    fn parses_terminal_started_failure() {
        let raw = r#"{"type":"terminal_started","name":"","requestId":"r-9","success":false,"error":"fork failed"}"#;
        let event: ControlEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            ControlEvent::TerminalStarted {
                name: "".to_string(),
                request_id: "r-9".to_string(),
                success: false,
                error: Some("fork failed".to_string()),
            }
        );
    }

    #[test]
    fn parses_terminal_closed() {
        let raw = r#"{"type":"terminal_closed","name":"7421","exitCode":0}"#;
        let event: ControlEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            ControlEvent::TerminalClosed {
                name: "7421".to_string(),
                exit_code: 0,
            }
        );
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        let raw = r#"{"type":"resize_terminal","name":"x"}"#;
        assert!(serde_json::from_str::<ControlEvent>(raw).is_err());
    }
}
