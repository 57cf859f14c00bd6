//! Binary framing for the producer data channels.
//!
//! Frames carry no length prefix; the first byte selects the kind and the
//! remainder is the payload (raw bytes or UTF-8 JSON). The codec fails
//! closed: an empty frame, an unknown prefix byte or malformed JSON is a
//! [`FrameError`] and the caller logs and drops the frame.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Producer → relay prefixes
pub const P_OUTPUT: u8 = 0x30;
pub const P_HANDSHAKE: u8 = 0x31;
pub const P_EXIT: u8 = 0x32;
pub const P_SNAPSHOT: u8 = 0x33;

// Relay → producer prefixes
pub const R_INPUT: u8 = 0x30;
pub const R_RESIZE: u8 = 0x31;
pub const R_PAUSE: u8 = 0x32;
pub const R_RESUME: u8 = 0x33;
pub const R_SNAPSHOT_REQUEST: u8 = 0x34;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame prefix: 0x{0:02x}")]
    UnknownPrefix(u8),
    #[error("malformed frame payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Data-channel handshake sent by the producer once per terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataHandshake {
    pub version: String,
    pub shell: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

/// Serialized screen state for a terminal at an instant; `screen` is base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub request_id: String,
    pub screen: String,
    pub cols: u16,
    pub rows: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRequestPayload {
    request_id: String,
}

/// Frames the producer sends on a terminal data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerFrame {
    Output(Bytes),
    Handshake(DataHandshake),
    Exit(i32),
    Snapshot(SnapshotResponse),
}

impl ProducerFrame {
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (&prefix, payload) = frame.split_first().ok_or(FrameError::Empty)?;
        match prefix {
            P_OUTPUT => Ok(ProducerFrame::Output(Bytes::copy_from_slice(payload))),
            P_HANDSHAKE => Ok(ProducerFrame::Handshake(serde_json::from_slice(payload)?)),
            P_EXIT => Ok(ProducerFrame::Exit(serde_json::from_slice(payload)?)),
            P_SNAPSHOT => Ok(ProducerFrame::Snapshot(serde_json::from_slice(payload)?)),
            other => Err(FrameError::UnknownPrefix(other)),
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        match self {
            ProducerFrame::Output(bytes) => Ok(prefixed(P_OUTPUT, bytes)),
            ProducerFrame::Handshake(hs) => Ok(prefixed(P_HANDSHAKE, &serde_json::to_vec(hs)?)),
            ProducerFrame::Exit(code) => Ok(prefixed(P_EXIT, &serde_json::to_vec(code)?)),
            ProducerFrame::Snapshot(snap) => Ok(prefixed(P_SNAPSHOT, &serde_json::to_vec(snap)?)),
        }
    }
}

/// Frames the relay sends back on a terminal data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Input(Bytes),
    Resize { cols: u16, rows: u16 },
    Pause,
    Resume,
    SnapshotRequest { request_id: String },
}

impl RelayFrame {
    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let (&prefix, payload) = frame.split_first().ok_or(FrameError::Empty)?;
        match prefix {
            R_INPUT => Ok(RelayFrame::Input(Bytes::copy_from_slice(payload))),
            R_RESIZE => {
                let p: ResizePayload = serde_json::from_slice(payload)?;
                Ok(RelayFrame::Resize {
                    cols: p.cols,
                    rows: p.rows,
                })
            }
            R_PAUSE => Ok(RelayFrame::Pause),
            R_RESUME => Ok(RelayFrame::Resume),
            R_SNAPSHOT_REQUEST => {
                let p: SnapshotRequestPayload = serde_json::from_slice(payload)?;
                Ok(RelayFrame::SnapshotRequest {
                    request_id: p.request_id,
                })
            }
            other => Err(FrameError::UnknownPrefix(other)),
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        match self {
            RelayFrame::Input(bytes) => Ok(prefixed(R_INPUT, bytes)),
            RelayFrame::Resize { cols, rows } => Ok(prefixed(
                R_RESIZE,
                &serde_json::to_vec(&ResizePayload {
                    cols: *cols,
                    rows: *rows,
                })?,
            )),
            RelayFrame::Pause => Ok(Bytes::from_static(&[R_PAUSE])),
            RelayFrame::Resume => Ok(Bytes::from_static(&[R_RESUME])),
            RelayFrame::SnapshotRequest { request_id } => Ok(prefixed(
                R_SNAPSHOT_REQUEST,
                &serde_json::to_vec(&SnapshotRequestPayload {
                    request_id: request_id.clone(),
                })?,
            )),
        }
    }
}

fn prefixed(prefix: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(prefix);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn decodes_output_frame() {
        let frame = [&[P_OUTPUT][..], b"hello"].concat();
        let decoded = ProducerFrame::decode(&frame).unwrap();
        assert_eq!(decoded, ProducerFrame::Output(Bytes::from_static(b"hello")));
    }

    #[test]
    fn decodes_handshake_frame() {
        let json = br#"{"version":"1","shell":"/bin/zsh","cols":120}"#;
        let frame = [&[P_HANDSHAKE][..], json].concat();
        let decoded = ProducerFrame::decode(&frame).unwrap();
        assert_eq!(
            decoded,
            ProducerFrame::Handshake(DataHandshake {
                version: "1".to_string(),
                shell: "/bin/zsh".to_string(),
                cols: Some(120),
                rows: None,
            })
        );
    }

    #[test]
    fn decodes_exit_frame() {
        let frame = [&[P_EXIT][..], b"137"].concat();
        assert_eq!(
            ProducerFrame::decode(&frame).unwrap(),
            ProducerFrame::Exit(137)
        );
    }

    #[test]
    fn empty_frame_fails_closed() {
        assert!(matches!(ProducerFrame::decode(&[]), Err(FrameError::Empty)));
        assert!(matches!(RelayFrame::decode(&[]), Err(FrameError::Empty)));
    }

    #[test]
    fn unknown_prefix_fails_closed() {
        assert!(matches!(
            ProducerFrame::decode(&[0x77, 1, 2]),
            Err(FrameError::UnknownPrefix(0x77))
        ));
        assert!(matches!(
            RelayFrame::decode(&[0x35]),
            Err(FrameError::UnknownPrefix(0x35))
        ));
    }

    #[test]
    fn malformed_json_fails_closed() {
        let frame = [&[P_SNAPSHOT][..], b"{not json"].concat();
        assert!(matches!(
            ProducerFrame::decode(&frame),
            Err(FrameError::Payload(_))
        ));
    }

    #[test]
    fn resize_payload_uses_bare_cols_rows() {
        let encoded = RelayFrame::Resize { cols: 80, rows: 24 }.encode().unwrap();
        assert_eq!(encoded[0], R_RESIZE);
        let json: serde_json::Value = serde_json::from_slice(&encoded[1..]).unwrap();
        assert_eq!(json, serde_json::json!({"cols": 80, "rows": 24}));
    }

    #[test]
    fn snapshot_request_payload_is_camel_case() {
        let encoded = RelayFrame::SnapshotRequest {
            request_id: "q-1".to_string(),
        }
        .encode()
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded[1..]).unwrap();
        assert_eq!(json, serde_json::json!({"requestId": "q-1"}));
    }

    fn producer_frame_strategy() -> impl Strategy<Value = ProducerFrame> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..512)
                .prop_map(|v| ProducerFrame::Output(Bytes::from(v))),
            ("[a-z0-9.]{1,8}", "[a-z/]{1,16}", any::<Option<u16>>(), any::<Option<u16>>())
                .prop_map(|(version, shell, cols, rows)| ProducerFrame::Handshake(
                    DataHandshake {
                        version,
                        shell,
                        cols,
                        rows
                    }
                )),
            any::<i32>().prop_map(ProducerFrame::Exit),
            ("[a-z0-9-]{1,16}", "[A-Za-z0-9+/=]{0,64}", any::<u16>(), any::<u16>(), any::<u16>(), any::<u16>())
                .prop_map(|(request_id, screen, cols, rows, cursor_x, cursor_y)| {
                    ProducerFrame::Snapshot(SnapshotResponse {
                        request_id,
                        screen,
                        cols,
                        rows,
                        cursor_x,
                        cursor_y,
                    })
                }),
        ]
    }

    fn relay_frame_strategy() -> impl Strategy<Value = RelayFrame> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..512)
                .prop_map(|v| RelayFrame::Input(Bytes::from(v))),
            (any::<u16>(), any::<u16>()).prop_map(|(cols, rows)| RelayFrame::Resize { cols, rows }),
            Just(RelayFrame::Pause),
            Just(RelayFrame::Resume),
            "[a-z0-9-]{1,16}".prop_map(|request_id| RelayFrame::SnapshotRequest { request_id }),
        ]
    }

    proptest! {
        #[test]
        fn producer_frames_round_trip(frame in producer_frame_strategy()) {
            let encoded = frame.encode().unwrap();
            prop_assert_eq!(ProducerFrame::decode(&encoded).unwrap(), frame);
        }

        #[test]
        fn relay_frames_round_trip(frame in relay_frame_strategy()) {
            let encoded = frame.encode().unwrap();
            prop_assert_eq!(RelayFrame::decode(&encoded).unwrap(), frame);
        }
    }
}
