use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Wire envelope for every frame exchanged over a robot session, §4.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: u128,
    pub corr_id: Option<u128>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub ts: u64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Hello,
    Welcome,
    Heartbeat,
    Assign,
    Accept,
    Reject,
    Progress,
    Result,
    Cancel,
    Cancelled,
    Ping,
    Pong,
    Error,
    /// Anything not in this enum, §9 — keeps an older peer from tearing down
    /// the whole session on a type it doesn't recognize yet.
    Unknown(String),
}

impl MessageType {
    fn as_str(&self) -> &str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Welcome => "WELCOME",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Assign => "ASSIGN",
            MessageType::Accept => "ACCEPT",
            MessageType::Reject => "REJECT",
            MessageType::Progress => "PROGRESS",
            MessageType::Result => "RESULT",
            MessageType::Cancel => "CANCEL",
            MessageType::Cancelled => "CANCELLED",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Error => "ERROR",
            MessageType::Unknown(raw) => raw.as_str(),
        }
    }

    fn from_name(raw: &str) -> Self {
        match raw {
            "HELLO" => MessageType::Hello,
            "WELCOME" => MessageType::Welcome,
            "HEARTBEAT" => MessageType::Heartbeat,
            "ASSIGN" => MessageType::Assign,
            "ACCEPT" => MessageType::Accept,
            "REJECT" => MessageType::Reject,
            "PROGRESS" => MessageType::Progress,
            "RESULT" => MessageType::Result,
            "CANCEL" => MessageType::Cancel,
            "CANCELLED" => MessageType::Cancelled,
            "PING" => MessageType::Ping,
            "PONG" => MessageType::Pong,
            "ERROR" => MessageType::Error,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    /// The `type:u16` wire code, §6. `EnvelopeCodec` writes/reads this
    /// ahead of the serialized body instead of folding `kind` into it.
    pub fn code(&self) -> u16 {
        match self {
            MessageType::Hello => 1,
            MessageType::Welcome => 2,
            MessageType::Heartbeat => 3,
            MessageType::Assign => 4,
            MessageType::Accept => 5,
            MessageType::Reject => 6,
            MessageType::Progress => 7,
            MessageType::Result => 8,
            MessageType::Cancel => 9,
            MessageType::Cancelled => 10,
            MessageType::Ping => 11,
            MessageType::Pong => 12,
            MessageType::Error => 13,
            MessageType::Unknown(_) => 0,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => MessageType::Hello,
            2 => MessageType::Welcome,
            3 => MessageType::Heartbeat,
            4 => MessageType::Assign,
            5 => MessageType::Accept,
            6 => MessageType::Reject,
            7 => MessageType::Progress,
            8 => MessageType::Result,
            9 => MessageType::Cancel,
            10 => MessageType::Cancelled,
            11 => MessageType::Ping,
            12 => MessageType::Pong,
            13 => MessageType::Error,
            other => MessageType::Unknown(format!("CODE_{other}")),
        }
    }
}

// Hand-rolled rather than `#[serde(rename_all = ...)]` + `#[serde(other)]`:
// `other` only supports a fieldless fallback, and `Unknown` needs to carry
// the original string through for §9 forward compatibility.
impl Serialize for MessageType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageType::from_name(&raw))
    }
}

impl Envelope {
    pub fn new(msg_id: u128, kind: MessageType, payload: serde_json::Value) -> Self {
        Self {
            msg_id,
            corr_id: None,
            kind,
            ts: now_millis(),
            payload,
        }
    }

    pub fn reply_to(corr_id: u128, msg_id: u128, kind: MessageType, payload: serde_json::Value) -> Self {
        Self {
            msg_id,
            corr_id: Some(corr_id),
            kind,
            ts: now_millis(),
            payload,
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new(1, MessageType::Heartbeat, serde_json::json!({"cpu": 0.4}));
        let bytes = serde_json::to_vec(&env).unwrap();
        let parsed: Envelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.msg_id, 1);
        assert_eq!(parsed.kind, MessageType::Heartbeat);
    }

    #[test]
    fn unrecognized_type_deserializes_to_unknown_instead_of_failing() {
        let json = serde_json::json!({
            "msg_id": 1, "corr_id": null, "type": "FUTURE_FRAME", "ts": 0, "payload": null
        });
        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind, MessageType::Unknown("FUTURE_FRAME".to_string()));
    }

    #[test]
    fn wire_code_round_trips() {
        assert_eq!(MessageType::from_code(MessageType::Assign.code()), MessageType::Assign);
        assert_eq!(MessageType::from_code(65535), MessageType::Unknown("CODE_65535".to_string()));
    }
}
