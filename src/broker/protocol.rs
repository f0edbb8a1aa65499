//! Frames exchanged between a mesh connection and the broker.
//!
//! Every frame is a JSON object carried in a WebSocket text message, tagged by
//! `op`. The first client frame must be `connect`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        name: String,
    },
    Sub {
        sid: u64,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queue: Option<String>,
    },
    Unsub {
        sid: u64,
    },
    Pub {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        payload: Value,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Ok,
    Err {
        message: String,
    },
    Msg {
        sid: u64,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        payload: Value,
    },
    Pong,
}

/// Error text the broker sends before closing an unauthenticated connection.
pub const AUTH_VIOLATION: &str = "authorization violation";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_use_op_tag() {
        let frame = ClientFrame::Sub {
            sid: 7,
            subject: "lattice.presence".into(),
            queue: None,
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert_eq!(text, r#"{"op":"sub","sid":7,"subject":"lattice.presence"}"#);

        let parsed: ServerFrame = serde_json::from_value(json!({
            "op": "msg",
            "sid": 7,
            "subject": "lattice.presence",
            "payload": {"station_id": "alpha"}
        }))
        .unwrap();
        assert!(matches!(parsed, ServerFrame::Msg { sid: 7, reply: None, .. }));
    }
}
