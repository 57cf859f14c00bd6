//! Viewer-channel messages. Viewers speak JSON for setup and control and
//! receive raw terminal bytes as binary frames once attached.

use crate::models::Owner;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupAction {
    New,
    Mirror,
}

/// Viewer → relay messages. The first frame on a viewer channel must be
/// `Setup`; anything else closes the socket with 4400.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ViewerRequest {
    Setup {
        action: SetupAction,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_by: Option<Owner>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
}

/// Relay → viewer control messages (terminal bytes travel as binary frames).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ViewerEvent {
    SetupResponse {
        success: bool,
        name: String,
        cols: u16,
        rows: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Exit {
        code: i32,
    },
    Disconnect {
        reason: String,
    },
}

impl ViewerEvent {
    pub fn setup_ok(name: &str, cols: u16, rows: u16) -> Self {
        ViewerEvent::SetupResponse {
            success: true,
            name: name.to_string(),
            cols,
            rows,
            error: None,
        }
    }

    pub fn setup_failed(name: &str, error: &str) -> Self {
        ViewerEvent::SetupResponse {
            success: false,
            name: name.to_string(),
            cols: 0,
            rows: 0,
            error: Some(error.to_string()),
        }
    }

    pub fn to_json(&self) -> String {
        // The enum only contains plain fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_setup_with_creator() {
        let raw = r#"{"type":"setup","action":"new","name":"x","cols":80,"rows":24,"createdBy":{"subject":"u-1","username":"ada"}}"#;
        let req: ViewerRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(
            req,
            ViewerRequest::Setup {
                action: SetupAction::New,
                name: "x".to_string(),
                cols: Some(80),
                rows: Some(24),
                created_by: Some(Owner::new("u-1", "ada")),
            }
        );
    }

    #[test]
    fn parses_mirror_setup_without_geometry() {
        let raw = r#"{"type":"setup","action":"mirror","name":"7421"}"#;
        let req: ViewerRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(
            req,
            ViewerRequest::Setup {
                action: SetupAction::Mirror,
                name: "7421".to_string(),
                cols: None,
                rows: None,
                created_by: None,
            }
        );
    }

    #[test]
    fn parses_input_and_resize() {
        let input: ViewerRequest = serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert_eq!(
            input,
            ViewerRequest::Input {
                data: "ls\n".to_string()
            }
        );

        let resize: ViewerRequest =
            serde_json::from_str(r#"{"type":"resize","cols":132,"rows":43}"#).unwrap();
        assert_eq!(resize, ViewerRequest::Resize { cols: 132, rows: 43 });
    }

    #[test]
    fn setup_response_wire_shape() {
        let value = serde_json::to_value(ViewerEvent::setup_ok("7421", 80, 24)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "setup_response",
                "success": true,
                "name": "7421",
                "cols": 80,
                "rows": 24
            })
        );
    }

    #[test]
    fn disconnect_wire_shape() {
        let value = serde_json::to_value(ViewerEvent::Disconnect {
            reason: "session_ended".to_string(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "disconnect", "reason": "session_ended"})
        );
    }
}
