//! Realtime wire protocol: JSON text frames exchanged over the change-notification socket.

use serde::{Deserialize, Serialize};

use crate::error::RealtimeError;

/// Close code for an intentional, clean close. Never triggers a reconnect.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the socket went away without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Auth {
        access_token: String,
    },
    Subscribe {
        collection: String,
        query: SubscriptionQuery,
    },
}

impl ClientFrame {
    pub fn auth(access_token: impl Into<String>) -> Self {
        ClientFrame::Auth {
            access_token: access_token.into(),
        }
    }

    /// Subscribe to every field of every record in `collection`.
    pub fn subscribe(collection: impl Into<String>) -> Self {
        ClientFrame::Subscribe {
            collection: collection.into(),
            query: SubscriptionQuery::default(),
        }
    }

    /// Encode as a text frame.
    pub fn to_text(&self) -> Result<String, RealtimeError> {
        serde_json::to_string(self).map_err(|e| RealtimeError::MalformedFrame(e.to_string()))
    }
}

/// Query attached to a subscribe frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionQuery {
    pub fields: Vec<String>,
    #[serde(default)]
    pub filter: serde_json::Map<String, serde_json::Value>,
}

impl Default for SubscriptionQuery {
    fn default() -> Self {
        Self {
            fields: vec!["*".to_string()],
            filter: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Ok,
    Error,
}

/// The `event` of a subscription push.
///
/// Anything other than a record change (the server's `init` confirmation,
/// for instance) lands in `Other` and is not turned into a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionEvent {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Other,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Handshake acknowledgement.
    Auth {
        status: AuthStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<serde_json::Value>,
    },
    /// A change in a subscribed collection.
    Subscription {
        event: SubscriptionEvent,
        collection: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Informational keepalive; no response expected.
    Heartbeat,
    /// Any frame with a `type` this client does not know.
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, RealtimeError> {
        serde_json::from_str(text).map_err(|e| RealtimeError::MalformedFrame(e.to_string()))
    }

    pub fn auth_ok() -> Self {
        ServerFrame::Auth {
            status: AuthStatus::Ok,
            error: None,
        }
    }

    pub fn auth_error(reason: impl Into<String>) -> Self {
        ServerFrame::Auth {
            status: AuthStatus::Error,
            error: Some(serde_json::json!({ "message": reason.into() })),
        }
    }

    pub fn to_text(&self) -> Result<String, RealtimeError> {
        serde_json::to_string(self).map_err(|e| RealtimeError::MalformedFrame(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_frame_matches_wire_shape() {
        let text = ClientFrame::auth("abc").to_text().unwrap();
        assert_eq!(text, r#"{"type":"auth","access_token":"abc"}"#);
    }

    #[test]
    fn subscribe_frame_matches_wire_shape() {
        let text = ClientFrame::subscribe("orders").to_text().unwrap();
        assert_eq!(
            text,
            r#"{"type":"subscribe","collection":"orders","query":{"fields":["*"],"filter":{}}}"#
        );
    }

    #[test]
    fn parses_auth_acknowledgements() {
        assert_eq!(
            ServerFrame::parse(r#"{"type":"auth","status":"ok"}"#).unwrap(),
            ServerFrame::auth_ok()
        );
        match ServerFrame::parse(r#"{"type":"auth","status":"error"}"#).unwrap() {
            ServerFrame::Auth { status, .. } => assert_eq!(status, AuthStatus::Error),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn parses_change_push() {
        let frame = ServerFrame::parse(
            r#"{"type":"subscription","event":"update","collection":"orders","data":{"id":7}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            ServerFrame::Subscription {
                event: SubscriptionEvent::Update,
                collection: "orders".to_string(),
                data: json!({"id": 7}),
            }
        );
    }

    #[test]
    fn init_event_is_not_a_change() {
        let frame = ServerFrame::parse(
            r#"{"type":"subscription","event":"init","collection":"orders","data":[]}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            ServerFrame::Subscription {
                event: SubscriptionEvent::Other,
                ..
            }
        ));
    }

    #[test]
    fn heartbeat_and_unknown_types() {
        assert_eq!(
            ServerFrame::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            ServerFrame::Heartbeat
        );
        assert_eq!(
            ServerFrame::parse(r#"{"type":"ping","ts":1}"#).unwrap(),
            ServerFrame::Unknown
        );
    }

    #[test]
    fn malformed_text_is_an_error() {
        assert!(matches!(
            ServerFrame::parse("not json"),
            Err(RealtimeError::MalformedFrame(_))
        ));
        assert!(matches!(
            ServerFrame::parse(r#"{"status":"ok"}"#),
            Err(RealtimeError::MalformedFrame(_))
        ));
    }
}
