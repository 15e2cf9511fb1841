//! The request envelope and reply sub-topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The sub-topic of a reply under a request's `replyTo` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySub {
    Ack,
    Nack,
    Error,
    Progress,
    Output,
    Status,
    FinalStatus,
}

impl ReplySub {
    /// Wire spelling of the sub-topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplySub::Ack => "ack",
            ReplySub::Nack => "nack",
            ReplySub::Error => "error",
            ReplySub::Progress => "progress",
            ReplySub::Output => "output",
            ReplySub::Status => "status",
            ReplySub::FinalStatus => "finalStatus",
        }
    }

    /// Parse the final segment of a reply topic.
    pub fn parse(segment: &str) -> Option<Self> {
        Some(match segment {
            "ack" => ReplySub::Ack,
            "nack" => ReplySub::Nack,
            "error" => ReplySub::Error,
            "progress" => ReplySub::Progress,
            "output" => ReplySub::Output,
            "status" => ReplySub::Status,
            "finalStatus" => ReplySub::FinalStatus,
            _ => return None,
        })
    }
}

/// A request as published on `<target>.<operation>`.
///
/// The operation-specific fields travel flattened next to the envelope
/// fields, matching the wire format of the other managers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "requestId")]
    pub request_id: Uuid,
    #[serde(rename = "replyTo")]
    pub reply_to: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl RequestEnvelope {
    /// Build a fresh envelope for a requester module.
    ///
    /// `replyTo` is `<module>.<requestId>`, unique per request.
    pub fn new(module: &str, payload: serde_json::Map<String, serde_json::Value>) -> Self {
        let request_id = Uuid::new_v4();
        Self {
            request_id,
            reply_to: format!("{module}.{request_id}"),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Parse an envelope out of a bus payload.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// The topic a reply sub-message is published on.
    pub fn reply_topic(&self, sub: ReplySub) -> String {
        format!("{}.{}", self.reply_to, sub.as_str())
    }

    /// A string field from the payload.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// A boolean field from the payload (absent means `false`).
    pub fn field_bool(&self, key: &str) -> bool {
        self.payload
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
