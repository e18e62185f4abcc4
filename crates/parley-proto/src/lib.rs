//! Envelope definitions shared by the parley relay and peer clients.
//! Every frame on the relay socket is a flat JSON object carrying a `type`
//! discriminator plus the fields of that kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque participant identity, supplied by the client and never validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for UserId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One connectivity candidate as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub id: UserId,
    pub status: PresenceStatus,
}

/// Every message exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Register {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    Offer {
        from: UserId,
        to: UserId,
        sdp: String,
    },
    Answer {
        from: UserId,
        to: UserId,
        sdp: String,
    },
    IceCandidate {
        from: UserId,
        to: UserId,
        candidate: String,
        #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
        #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
    },
    CallEnd {
        from: UserId,
        to: UserId,
    },
    GetUsers {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    TextMessage {
        from: UserId,
        to: UserId,
        text: String,
        timestamp: DateTime<Utc>,
    },
    Registered {
        #[serde(rename = "userId")]
        user_id: UserId,
        #[serde(rename = "onlineUsers", default)]
        online_users: Vec<UserId>,
    },
    UserOnline {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    UserOffline {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    UsersList {
        users: Vec<UserPresence>,
    },
}

/// Fieldless mirror of [`Envelope`] used for logging, metrics and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Register,
    Offer,
    Answer,
    IceCandidate,
    CallEnd,
    GetUsers,
    TextMessage,
    Registered,
    UserOnline,
    UserOffline,
    UsersList,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 11] = [
        EnvelopeKind::Register,
        EnvelopeKind::Offer,
        EnvelopeKind::Answer,
        EnvelopeKind::IceCandidate,
        EnvelopeKind::CallEnd,
        EnvelopeKind::GetUsers,
        EnvelopeKind::TextMessage,
        EnvelopeKind::Registered,
        EnvelopeKind::UserOnline,
        EnvelopeKind::UserOffline,
        EnvelopeKind::UsersList,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Register => "register",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
            EnvelopeKind::IceCandidate => "ice-candidate",
            EnvelopeKind::CallEnd => "call-end",
            EnvelopeKind::GetUsers => "get-users",
            EnvelopeKind::TextMessage => "text-message",
            EnvelopeKind::Registered => "registered",
            EnvelopeKind::UserOnline => "user-online",
            EnvelopeKind::UserOffline => "user-offline",
            EnvelopeKind::UsersList => "users-list",
        }
    }

    /// Kinds that are held for an offline recipient instead of being dropped.
    pub fn is_queueable(self) -> bool {
        matches!(
            self,
            EnvelopeKind::Offer
                | EnvelopeKind::Answer
                | EnvelopeKind::IceCandidate
                | EnvelopeKind::TextMessage
        )
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvelopeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("envelope has no `type` field")]
    MissingKind,
    #[error("unknown envelope kind `{0}`")]
    UnknownKind(String),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

impl Envelope {
    /// Decode one wire frame. Unknown kinds are reported separately from
    /// frames that are not JSON or miss required fields.
    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text).map_err(EnvelopeError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingKind)?;
        kind.parse::<EnvelopeKind>()?;
        serde_json::from_value(value).map_err(EnvelopeError::Malformed)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Register { .. } => EnvelopeKind::Register,
            Envelope::Offer { .. } => EnvelopeKind::Offer,
            Envelope::Answer { .. } => EnvelopeKind::Answer,
            Envelope::IceCandidate { .. } => EnvelopeKind::IceCandidate,
            Envelope::CallEnd { .. } => EnvelopeKind::CallEnd,
            Envelope::GetUsers { .. } => EnvelopeKind::GetUsers,
            Envelope::TextMessage { .. } => EnvelopeKind::TextMessage,
            Envelope::Registered { .. } => EnvelopeKind::Registered,
            Envelope::UserOnline { .. } => EnvelopeKind::UserOnline,
            Envelope::UserOffline { .. } => EnvelopeKind::UserOffline,
            Envelope::UsersList { .. } => EnvelopeKind::UsersList,
        }
    }

    /// Originating identity for peer-to-peer kinds.
    pub fn sender(&self) -> Option<&UserId> {
        match self {
            Envelope::Offer { from, .. }
            | Envelope::Answer { from, .. }
            | Envelope::IceCandidate { from, .. }
            | Envelope::CallEnd { from, .. }
            | Envelope::TextMessage { from, .. } => Some(from),
            _ => None,
        }
    }

    /// Destination identity for peer-to-peer kinds.
    pub fn recipient(&self) -> Option<&UserId> {
        match self {
            Envelope::Offer { to, .. }
            | Envelope::Answer { to, .. }
            | Envelope::IceCandidate { to, .. }
            | Envelope::CallEnd { to, .. }
            | Envelope::TextMessage { to, .. } => Some(to),
            _ => None,
        }
    }

    pub fn candidate_for(from: UserId, to: UserId, candidate: IceCandidate) -> Self {
        Envelope::IceCandidate {
            from,
            to,
            candidate: candidate.candidate,
            sdp_mline_index: candidate.sdp_mline_index,
            sdp_mid: candidate.sdp_mid,
        }
    }

    /// The candidate carried by an `ice-candidate` envelope.
    pub fn candidate(&self) -> Option<IceCandidate> {
        match self {
            Envelope::IceCandidate {
                candidate,
                sdp_mline_index,
                sdp_mid,
                ..
            } => Some(IceCandidate {
                candidate: candidate.clone(),
                sdp_mline_index: *sdp_mline_index,
                sdp_mid: sdp_mid.clone(),
            }),
            _ => None,
        }
    }

    pub fn text(from: UserId, to: UserId, text: impl Into<String>) -> Self {
        Envelope::TextMessage {
            from,
            to,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Chat payload carried over the peer data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: UserId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(from: UserId, text: impl Into<String>) -> Self {
        Self {
            from,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(EnvelopeError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn decodes_browser_ice_candidate() {
        let frame = json!({
            "type": "ice-candidate",
            "from": "user_a",
            "to": "user_b",
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMLineIndex": 0,
            "sdpMid": "0"
        })
        .to_string();

        let envelope = Envelope::decode(&frame).expect("decode");
        assert_eq!(envelope.kind(), EnvelopeKind::IceCandidate);
        assert_eq!(envelope.sender(), Some(&UserId::from("user_a")));
        assert_eq!(envelope.recipient(), Some(&UserId::from("user_b")));
        let candidate = envelope.candidate().expect("candidate");
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
    }

    #[test_timeout::timeout]
    fn null_candidate_fields_are_accepted() {
        let frame = r#"{"type":"ice-candidate","from":"a","to":"b","candidate":"c","sdpMLineIndex":null,"sdpMid":null}"#;
        let envelope = Envelope::decode(frame).expect("decode");
        let candidate = envelope.candidate().expect("candidate");
        assert_eq!(candidate.sdp_mline_index, None);
        assert_eq!(candidate.sdp_mid, None);
    }

    #[test_timeout::timeout]
    fn registered_uses_camel_case_fields() {
        let envelope = Envelope::Registered {
            user_id: UserId::from("a"),
            online_users: vec![UserId::from("b")],
        };
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "registered");
        assert_eq!(value["userId"], "a");
        assert_eq!(value["onlineUsers"], json!(["b"]));
    }

    #[test_timeout::timeout]
    fn users_list_reports_online_status() {
        let envelope = Envelope::UsersList {
            users: vec![UserPresence {
                id: UserId::from("b"),
                status: PresenceStatus::Online,
            }],
        };
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "users-list", "users": [{"id": "b", "status": "online"}]}));
    }

    #[test_timeout::timeout]
    fn unknown_kind_is_distinguished_from_malformed() {
        match Envelope::decode(r#"{"type":"wave","from":"a"}"#) {
            Err(EnvelopeError::UnknownKind(kind)) => assert_eq!(kind, "wave"),
            other => panic!("expected unknown kind, got {other:?}"),
        }
        assert!(matches!(
            Envelope::decode("not json"),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"from":"a"}"#),
            Err(EnvelopeError::MissingKind)
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"offer","from":"a"}"#),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test_timeout::timeout]
    fn queueable_kinds() {
        let queueable: Vec<_> = EnvelopeKind::ALL
            .into_iter()
            .filter(|kind| kind.is_queueable())
            .collect();
        assert_eq!(
            queueable,
            vec![
                EnvelopeKind::Offer,
                EnvelopeKind::Answer,
                EnvelopeKind::IceCandidate,
                EnvelopeKind::TextMessage
            ]
        );
        assert!(!EnvelopeKind::CallEnd.is_queueable());
    }

    #[test_timeout::timeout]
    fn text_message_keeps_timestamp() {
        let frame = r#"{"type":"text-message","from":"a","to":"b","text":"hi","timestamp":"2024-03-01T10:00:00.000Z"}"#;
        let envelope = Envelope::decode(frame).expect("decode");
        match envelope {
            Envelope::TextMessage { text, timestamp, .. } => {
                assert_eq!(text, "hi");
                assert_eq!(timestamp.to_rfc3339(), "2024-03-01T10:00:00+00:00");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn chat_message_decode_rejects_garbage() {
        let message = ChatMessage::new(UserId::from("a"), "hello");
        let decoded = ChatMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert!(ChatMessage::decode("{\"text\":1}").is_err());
    }
}
