//! Identity and wire types shared by every lattice component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How this station participates in the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationRole {
    /// Hosts the embedded broker other stations connect to.
    Orchestrator,
    /// Connects to a broker hosted elsewhere.
    Member,
    /// No lattice connectivity.
    Standalone,
}

impl std::fmt::Display for StationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orchestrator => write!(f, "orchestrator"),
            Self::Member => write!(f, "member"),
            Self::Standalone => write!(f, "standalone"),
        }
    }
}

/// Identity announced in presence messages. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationIdentity {
    pub station_id: String,
    pub station_name: String,
    pub role: StationRole,
}

/// An agent as advertised by its hosting station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAdvert {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// JSON Schema of the task payload, kept as text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<String>,
    /// Sample tasks shown to callers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
}

impl AgentAdvert {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            capabilities: Vec::new(),
            input_schema: None,
            output_schema: None,
            examples: Vec::new(),
        }
    }

    pub fn with_input_schema(mut self, schema: impl Into<String>) -> Self {
        self.input_schema = Some(schema.into());
        self
    }

    pub fn with_output_schema(mut self, schema: impl Into<String>) -> Self {
        self.output_schema = Some(schema.into());
        self
    }

    pub fn with_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.examples = examples.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Published on `lattice.presence` every heartbeat and on agent-set changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub station_id: String,
    pub station_name: String,
    pub role: StationRole,
    pub agents: Vec<AgentAdvert>,
    /// Increases with every message a station publishes.
    pub sequence: u64,
    pub sent_at: DateTime<Utc>,
    /// Graceful departure announcement.
    #[serde(default)]
    pub leaving: bool,
}

/// Sent by the dispatcher on `lattice.exec.<station_id>.<agent_name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub correlation_id: String,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_station_id: Option<String>,
    pub caller_station_id: String,
    pub payload: Value,
    pub timeout_ms: u64,
}

/// Error kinds a responder can report in a `Final` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    AgentNotFound,
    Overloaded,
    ExecutionFailed,
    InvalidRequest,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AgentNotFound => write!(f, "agent_not_found"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::ExecutionFailed => write!(f, "execution_failed"),
            Self::InvalidRequest => write!(f, "invalid_request"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Replies published on `lattice.exec.reply.<correlation_id>`.
///
/// `Accepted` is the responder's liveness acknowledgement and never reaches
/// callers; callers only observe `Partial` and `Final`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvocationReply {
    Accepted {
        correlation_id: String,
        station_id: String,
    },
    Partial {
        correlation_id: String,
        seq: u64,
        chunk: String,
    },
    Final {
        correlation_id: String,
        station_id: String,
        #[serde(default)]
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
}

impl InvocationReply {
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Accepted { correlation_id, .. }
            | Self::Partial { correlation_id, .. }
            | Self::Final { correlation_id, .. } => correlation_id,
        }
    }
}

/// What a caller of `exec` observes.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationResult {
    Partial {
        correlation_id: String,
        seq: u64,
        chunk: String,
    },
    Final {
        correlation_id: String,
        station_id: String,
        output: String,
        error: Option<RemoteError>,
    },
}

impl InvocationResult {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final { .. })
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Partial { correlation_id, .. } | Self::Final { correlation_id, .. } => {
                correlation_id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_wire_format_is_tagged() {
        let reply = InvocationReply::Final {
            correlation_id: "c1".into(),
            station_id: "alpha".into(),
            output: "done".into(),
            error: Some(RemoteError::new(RemoteErrorKind::Overloaded, "busy")),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "final");
        assert_eq!(json["error"]["kind"], "overloaded");

        let partial: InvocationReply = serde_json::from_value(serde_json::json!({
            "type": "partial",
            "correlation_id": "c1",
            "seq": 3,
            "chunk": "hello"
        }))
        .unwrap();
        assert_eq!(partial.correlation_id(), "c1");
    }

    #[test]
    fn presence_defaults_leaving_to_false() {
        let msg: PresenceMessage = serde_json::from_value(serde_json::json!({
            "station_id": "alpha",
            "station_name": "Alpha",
            "role": "member",
            "agents": [{"name": "reporter"}],
            "sequence": 1,
            "sent_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(!msg.leaving);
        assert_eq!(msg.agents[0], AgentAdvert::new("reporter"));
    }

    #[test]
    fn advert_schema_fields_are_optional_on_the_wire() {
        let bare = serde_json::to_value(AgentAdvert::new("reporter")).unwrap();
        assert_eq!(bare, serde_json::json!({"name": "reporter"}));

        let advert = AgentAdvert::new("reporter")
            .with_input_schema(r#"{"type":"object"}"#)
            .with_examples(["weekly report for team A"]);
        let json = serde_json::to_value(&advert).unwrap();
        assert_eq!(json["input_schema"], r#"{"type":"object"}"#);
        assert!(json.get("output_schema").is_none());
        assert_eq!(serde_json::from_value::<AgentAdvert>(json).unwrap(), advert);
    }
}
