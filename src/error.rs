//! Error taxonomy for the lattice.
//!
//! Connection-level failures (`Connect`, `Auth`) are handled by the mesh
//! connection's reconnect loop and only surface at startup. Resolution and
//! invocation failures are returned to callers, either synchronously or as the
//! terminal element of an invocation stream.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Where an agent was last seen before it disappeared from the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastKnown {
    pub station_id: String,
    pub reason: DepartureReason,
}

/// Why a directory entry stopped being resolvable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartureReason {
    /// No presence within the TTL.
    Expired,
    /// The station stopped advertising the agent.
    Withdrawn,
    /// The station announced a graceful departure.
    StationLeft,
}

impl std::fmt::Display for DepartureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expired => write!(f, "presence expired"),
            Self::Withdrawn => write!(f, "withdrawn by station"),
            Self::StationLeft => write!(f, "station left the lattice"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("failed to connect to broker at {url}: {message}")]
    Connect { url: String, message: String },

    #[error("broker rejected credentials: {0}")]
    Auth(String),

    #[error("not connected to the lattice")]
    NotConnected,

    #[error("{}", agent_not_found_message(.agent, .last_known))]
    AgentNotFound {
        agent: String,
        last_known: Option<LastKnown>,
    },

    #[error("station '{station_id}' did not acknowledge the request within {window:?}")]
    StationUnreachable { station_id: String, window: Duration },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("station '{station_id}' is overloaded")]
    Overloaded { station_id: String },

    #[error("failed to bind broker port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("agent execution failed: {0}")]
    Execution(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection closed")]
    Closed,
}

fn agent_not_found_message(agent: &str, last_known: &Option<LastKnown>) -> String {
    match last_known {
        Some(last) => format!(
            "agent '{}' is no longer available (last seen on station '{}', {})",
            agent, last.station_id, last.reason
        ),
        None => format!("agent '{}' not found on any station", agent),
    }
}

impl LatticeError {
    pub fn agent_not_found(agent: impl Into<String>) -> Self {
        Self::AgentNotFound {
            agent: agent.into(),
            last_known: None,
        }
    }

    /// Whether the reconnect loop should keep retrying after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::NotConnected | Self::Timeout(_) | Self::Closed
        )
    }
}

impl From<serde_json::Error> for LatticeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T, E = LatticeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_not_found_distinguishes_never_existed_from_departed() {
        let never = LatticeError::agent_not_found("reporter");
        assert_eq!(
            never.to_string(),
            "agent 'reporter' not found on any station"
        );

        let departed = LatticeError::AgentNotFound {
            agent: "reporter".to_string(),
            last_known: Some(LastKnown {
                station_id: "alpha".to_string(),
                reason: DepartureReason::Expired,
            }),
        };
        let msg = departed.to_string();
        assert!(msg.contains("no longer available"));
        assert!(msg.contains("alpha"));
        assert!(msg.contains("presence expired"));
    }

    #[test]
    fn transient_classification() {
        assert!(LatticeError::NotConnected.is_transient());
        assert!(LatticeError::Connect {
            url: "ws://127.0.0.1:1".into(),
            message: "refused".into()
        }
        .is_transient());
        assert!(!LatticeError::Auth("bad token".into()).is_transient());
        assert!(!LatticeError::agent_not_found("x").is_transient());
    }
}
