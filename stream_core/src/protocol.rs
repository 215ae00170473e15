//! Wire frames exchanged with the speech backend.
//!
//! Frames are JSON objects tagged by `type` (`control`, `audio`, `error`,
//! `end`). Audio payloads travel as base64 PCM. The same [`WireFrame`] type is
//! used in both directions: uploads of asset audio use `audio` frames just like
//! the rendered audio the backend streams back.
use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Identity of one speak request, generated at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    AssetReplay,
    LiveText,
}

/// Mouth-shape mark attached to an audio chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisemeMark {
    pub viseme: String,
    pub offset_ms: u32,
    pub duration_ms: u32,
}

/// One decoded audio frame for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub session_id: SessionId,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub visemes: Vec<VisemeMark>,
    pub timestamp_ms: Option<u64>,
    pub end_of_stream: bool,
}

/// Parameters carried by `control` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    Start {
        mode: SessionMode,
        voice_type: String,
        encoding: String,
        sample_rate: u32,
    },
    Text {
        text: String,
    },
    TextEnd,
    Cancel,
    Ack {
        of: String,
    },
    Ping,
    Pong,
    Welcome {
        #[serde(default)]
        client_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    Control {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default)]
        sequence: u64,
        payload: ControlAction,
    },
    Audio {
        session_id: SessionId,
        sequence: u64,
        payload: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        visemes: Vec<VisemeMark>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        #[serde(default)]
        last: bool,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        message: String,
    },
    End {
        session_id: SessionId,
        #[serde(default)]
        sequence: u64,
    },
}

/// A parsed inbound frame, ready for routing.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ControlAck { session_id: SessionId, of: String },
    Audio(AudioChunk),
    Error { session_id: Option<SessionId>, message: String },
    EndOfStream { session_id: SessionId, sequence: u64 },
    /// Frames that belong to the connection rather than a session
    /// (welcome, pong, acks without a session id).
    Connection(ControlAction),
}

impl InboundMessage {
    /// Session the message is addressed to, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            InboundMessage::ControlAck { session_id, .. } => Some(*session_id),
            InboundMessage::Audio(chunk) => Some(chunk.session_id),
            InboundMessage::Error { session_id, .. } => *session_id,
            InboundMessage::EndOfStream { session_id, .. } => Some(*session_id),
            InboundMessage::Connection(_) => None,
        }
    }
}

/// Parse one text frame into a typed message.
pub fn parse_frame(raw: &str) -> Result<InboundMessage, ProtocolError> {
    let frame: WireFrame =
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let message = match frame {
        WireFrame::Control {
            session_id: Some(session_id),
            payload: ControlAction::Ack { of },
            ..
        } => InboundMessage::ControlAck { session_id, of },
        WireFrame::Control { payload, .. } => InboundMessage::Connection(payload),
        WireFrame::Audio {
            session_id,
            sequence,
            payload,
            visemes,
            timestamp,
            last,
        } => {
            let payload = general_purpose::STANDARD
                .decode(payload.as_bytes())
                .map_err(|e| ProtocolError::Malformed(format!("audio payload is not base64: {e}")))?;
            InboundMessage::Audio(AudioChunk {
                session_id,
                sequence,
                payload,
                visemes,
                timestamp_ms: timestamp,
                end_of_stream: last,
            })
        }
        WireFrame::Error {
            session_id,
            message,
        } => InboundMessage::Error {
            session_id,
            message,
        },
        WireFrame::End {
            session_id,
            sequence,
        } => InboundMessage::EndOfStream {
            session_id,
            sequence,
        },
    };
    Ok(message)
}

/// Parse a binary frame; the backend only speaks JSON so the bytes must be UTF-8.
pub fn parse_binary_frame(raw: &[u8]) -> Result<InboundMessage, ProtocolError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ProtocolError::Malformed(format!("binary frame is not utf-8: {e}")))?;
    parse_frame(text)
}

fn to_message(frame: &WireFrame) -> Result<Message, ProtocolError> {
    let text = serde_json::to_string(frame).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(Message::Text(text.into()))
}

/// Build an outbound control frame for a session.
pub fn encode_control(
    session_id: SessionId,
    sequence: u64,
    action: ControlAction,
) -> Result<Message, ProtocolError> {
    to_message(&WireFrame::Control {
        session_id: Some(session_id),
        sequence,
        payload: action,
    })
}

/// Answer to an application-level `ping` from the backend.
pub fn encode_pong() -> Result<Message, ProtocolError> {
    to_message(&WireFrame::Control {
        session_id: None,
        sequence: 0,
        payload: ControlAction::Pong,
    })
}

/// Build an outbound audio frame carrying raw PCM for the backend.
pub fn encode_audio_request(
    session_id: SessionId,
    sequence: u64,
    pcm: &[u8],
    last: bool,
) -> Result<Message, ProtocolError> {
    to_message(&WireFrame::Audio {
        session_id,
        sequence,
        payload: general_purpose::STANDARD.encode(pcm),
        visemes: Vec::new(),
        timestamp: None,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(message: Result<Message, ProtocolError>) -> String {
        match message.unwrap() {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_audio_frame() {
        let id = SessionId::new();
        let raw = serde_json::json!({
            "type": "audio",
            "session_id": id,
            "sequence": 4,
            "payload": general_purpose::STANDARD.encode([1u8, 2, 3, 4]),
            "visemes": [{ "viseme": "aa", "offset_ms": 0, "duration_ms": 40 }],
            "timestamp": 1700000000000u64
        })
        .to_string();

        match parse_frame(&raw).unwrap() {
            InboundMessage::Audio(chunk) => {
                assert_eq!(chunk.session_id, id);
                assert_eq!(chunk.sequence, 4);
                assert_eq!(chunk.payload, vec![1, 2, 3, 4]);
                assert_eq!(chunk.visemes.len(), 1);
                assert_eq!(chunk.timestamp_ms, Some(1700000000000));
                assert!(!chunk.end_of_stream);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_parse_ack_and_end() {
        let id = SessionId::new();
        let ack = serde_json::json!({
            "type": "control",
            "session_id": id,
            "payload": { "action": "ack", "of": "start" }
        })
        .to_string();
        assert_eq!(
            parse_frame(&ack).unwrap(),
            InboundMessage::ControlAck {
                session_id: id,
                of: "start".to_string()
            }
        );

        let end = serde_json::json!({ "type": "end", "session_id": id, "sequence": 9 }).to_string();
        assert_eq!(
            parse_frame(&end).unwrap(),
            InboundMessage::EndOfStream {
                session_id: id,
                sequence: 9
            }
        );
    }

    #[test]
    fn test_connection_level_frames_have_no_session() {
        let welcome = r#"{"type":"control","payload":{"action":"welcome","client_id":"abc"}}"#;
        let msg = parse_frame(welcome).unwrap();
        assert_eq!(msg.session_id(), None);

        let error = r#"{"type":"error","message":"Text is required"}"#;
        let msg = parse_frame(error).unwrap();
        assert!(matches!(msg, InboundMessage::Error { session_id: None, .. }));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(parse_frame("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            parse_frame(r#"{"type":"video","session_id":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));

        let id = SessionId::new();
        let bad_payload = serde_json::json!({
            "type": "audio",
            "session_id": id,
            "sequence": 0,
            "payload": "%%%"
        })
        .to_string();
        assert!(matches!(parse_frame(&bad_payload), Err(ProtocolError::Malformed(_))));

        assert!(matches!(
            parse_binary_frame(&[0xff, 0xfe, 0x00]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_encode_control_and_audio() {
        let id = SessionId::new();
        let start = text_of(encode_control(
            id,
            0,
            ControlAction::Start {
                mode: SessionMode::LiveText,
                voice_type: "default".into(),
                encoding: "pcm".into(),
                sample_rate: 16_000,
            },
        ));
        let value: serde_json::Value = serde_json::from_str(&start).unwrap();
        assert_eq!(value["type"], "control");
        assert_eq!(value["payload"]["action"], "start");
        assert_eq!(value["payload"]["mode"], "live_text");
        assert_eq!(value["session_id"], id.to_string());

        let audio = text_of(encode_audio_request(id, 7, &[0, 1, 2, 3], true));
        let frame: WireFrame = serde_json::from_str(&audio).unwrap();
        match frame {
            WireFrame::Audio {
                sequence, payload, last, ..
            } => {
                assert_eq!(sequence, 7);
                assert!(last);
                assert_eq!(general_purpose::STANDARD.decode(payload).unwrap(), vec![0, 1, 2, 3]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_ping_is_connection_level_and_pong_has_no_session() {
        let ping = r#"{"type":"control","payload":{"action":"ping"}}"#;
        assert_eq!(parse_frame(ping).unwrap(), InboundMessage::Connection(ControlAction::Ping));

        let value: serde_json::Value = serde_json::from_str(&text_of(encode_pong())).unwrap();
        assert_eq!(value["payload"]["action"], "pong");
        assert!(value.get("session_id").is_none());
    }
}
