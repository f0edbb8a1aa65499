//! Configuration management for a lattice station.
//!
//! Configuration is read from environment variables:
//! - `STN_LATTICE_ORCHESTRATION` - Optional. Host the embedded broker. Defaults to `false`.
//! - `STN_LATTICE_URL` - Optional. Broker URL to connect to (e.g. `ws://token@hub:4222`).
//! - `STN_LATTICE_STATION_ID` - Optional. Station id. Defaults to a random UUID.
//! - `STN_LATTICE_STATION_NAME` - Optional. Human label. Defaults to `station-<id prefix>`.
//! - `STN_LATTICE_TOKEN` - Optional. Broker token; enforced by an orchestrator.
//! - `STN_LATTICE_HOST` - Optional. Embedded broker bind host. Defaults to `127.0.0.1`.
//! - `STN_LATTICE_PORT` - Optional. Embedded broker port. Defaults to `4222`.
//! - `STN_LATTICE_MONITOR_PORT` - Optional. Embedded broker monitor port. Defaults to `8222`.
//! - `STN_LATTICE_HEARTBEAT_SEC` - Optional. Presence interval. Defaults to `10`.
//! - `STN_LATTICE_PRESENCE_TTL_SEC` - Optional. Presence TTL. Defaults to `30`.
//! - `STN_LATTICE_SWEEP_SEC` - Optional. Directory sweep interval. Defaults to `15`.
//! - `STN_LATTICE_ROUTING_TIMEOUT_SEC` - Optional. Default exec timeout. Defaults to `60`.
//! - `STN_LATTICE_LIVENESS_MS` - Optional. Acknowledgement window. Defaults to `5000`.
//! - `STN_LATTICE_WORKERS` - Optional. Concurrent executions. Defaults to `4`.
//! - `STN_LATTICE_QUEUE_DEPTH` - Optional. Queued executions. Defaults to `16`.
//! - `STN_LATTICE_RECONNECT_WAIT_MS` - Optional. Base reconnect delay. Defaults to `2000`.
//! - `STN_LATTICE_RECONNECT_MAX_MS` - Optional. Reconnect delay cap. Defaults to `30000`.
//! - `STN_LATTICE_MAX_RECONNECTS` - Optional. Reconnect attempts, `-1` for unlimited. Defaults to `-1`.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::mesh::BackoffConfig;
use crate::types::{StationIdentity, StationRole};
use crate::util::{is_subject_token, parse_bool, short_id};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Embedded broker settings (orchestrator mode).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    /// Client (WebSocket) port; `0` picks an ephemeral port.
    pub port: u16,
    /// HTTP monitoring port; `0` picks an ephemeral port.
    pub monitor_port: u16,
    /// Token clients must present. `None` disables authentication.
    pub token: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4222,
            monitor_port: 8222,
            token: None,
        }
    }
}

/// Directory freshness tunables.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub presence_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            presence_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

/// Remote invocation tunables.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Default deadline for `exec` when the caller does not give one.
    pub timeout: Duration,
    /// How long a target station has to acknowledge a request.
    pub liveness_window: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            liveness_window: Duration::from_millis(5000),
        }
    }
}

/// Responder capacity.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 16,
        }
    }
}

/// Station configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host the embedded broker (`lattice_orchestration`)
    pub orchestration: bool,

    /// Broker URL to connect to as a client (`lattice_url`)
    pub url: Option<String>,

    pub station_id: String,

    pub station_name: String,

    pub broker: BrokerConfig,

    pub presence: PresenceConfig,

    pub routing: RoutingConfig,

    pub responder: ResponderConfig,

    /// Reconnect backoff for the mesh connection
    pub reconnect: BackoffConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed or the
    /// resulting settings are inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let orchestration = get("STN_LATTICE_ORCHESTRATION")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);
        let url = get("STN_LATTICE_URL");

        let station_id = get("STN_LATTICE_STATION_ID").unwrap_or_else(|| Uuid::new_v4().to_string());
        let station_name = get("STN_LATTICE_STATION_NAME")
            .unwrap_or_else(|| format!("station-{}", short_id(&station_id)));

        let defaults = BrokerConfig::default();
        let broker = BrokerConfig {
            host: get("STN_LATTICE_HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "STN_LATTICE_PORT", defaults.port)?,
            monitor_port: parse_or(&get, "STN_LATTICE_MONITOR_PORT", defaults.monitor_port)?,
            token: get("STN_LATTICE_TOKEN"),
        };

        let presence = PresenceConfig {
            heartbeat_interval: Duration::from_secs(parse_or(&get, "STN_LATTICE_HEARTBEAT_SEC", 10u64)?),
            presence_ttl: Duration::from_secs(parse_or(&get, "STN_LATTICE_PRESENCE_TTL_SEC", 30u64)?),
            sweep_interval: Duration::from_secs(parse_or(&get, "STN_LATTICE_SWEEP_SEC", 15u64)?),
        };

        let routing = RoutingConfig {
            timeout: Duration::from_secs(parse_or(&get, "STN_LATTICE_ROUTING_TIMEOUT_SEC", 60u64)?),
            liveness_window: Duration::from_millis(parse_or(&get, "STN_LATTICE_LIVENESS_MS", 5000u64)?),
        };

        let responder = ResponderConfig {
            workers: parse_or(&get, "STN_LATTICE_WORKERS", 4usize)?,
            queue_depth: parse_or(&get, "STN_LATTICE_QUEUE_DEPTH", 16usize)?,
        };

        let max_reconnects: i64 = parse_or(&get, "STN_LATTICE_MAX_RECONNECTS", -1i64)?;
        let reconnect = BackoffConfig {
            base_delay: Duration::from_millis(parse_or(&get, "STN_LATTICE_RECONNECT_WAIT_MS", 2000u64)?),
            max_delay: Duration::from_millis(parse_or(&get, "STN_LATTICE_RECONNECT_MAX_MS", 30_000u64)?),
            max_attempts: u32::try_from(max_reconnects).ok(),
            ..BackoffConfig::default()
        };

        let config = Self {
            orchestration,
            url,
            station_id,
            station_name,
            broker,
            presence,
            routing,
            responder,
            reconnect,
        };
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a station with the given identity and default tunables.
    pub fn new(station_id: impl Into<String>, station_name: impl Into<String>) -> Self {
        Self {
            orchestration: false,
            url: None,
            station_id: station_id.into(),
            station_name: station_name.into(),
            broker: BrokerConfig::default(),
            presence: PresenceConfig::default(),
            routing: RoutingConfig::default(),
            responder: ResponderConfig::default(),
            reconnect: BackoffConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_subject_token(&self.station_id) {
            return Err(ConfigError::InvalidValue(
                "STN_LATTICE_STATION_ID".to_string(),
                format!("'{}' must not contain '.', '*', '>' or whitespace", self.station_id),
            ));
        }
        if matches!(self.station_id.as_str(), "any" | "reply") {
            return Err(ConfigError::InvalidValue(
                "STN_LATTICE_STATION_ID".to_string(),
                format!("'{}' is reserved", self.station_id),
            ));
        }
        if let Some(token) = &self.broker.token {
            let url_safe = token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
            if !url_safe {
                return Err(ConfigError::InvalidValue(
                    "STN_LATTICE_TOKEN".to_string(),
                    "token must only contain URL-safe characters".to_string(),
                ));
            }
        }
        if self.presence.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "STN_LATTICE_HEARTBEAT_SEC".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if self.presence.presence_ttl <= self.presence.heartbeat_interval {
            return Err(ConfigError::InvalidValue(
                "STN_LATTICE_PRESENCE_TTL_SEC".to_string(),
                "must be longer than the heartbeat interval".to_string(),
            ));
        }
        if self.presence.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "STN_LATTICE_SWEEP_SEC".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if self.responder.workers == 0 {
            return Err(ConfigError::InvalidValue(
                "STN_LATTICE_WORKERS".to_string(),
                "at least one worker is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Role derived from the orchestration flag and broker URL.
    pub fn role(&self) -> StationRole {
        if self.orchestration {
            StationRole::Orchestrator
        } else if self.url.is_some() {
            StationRole::Member
        } else {
            StationRole::Standalone
        }
    }

    pub fn identity(&self) -> StationIdentity {
        StationIdentity {
            station_id: self.station_id.clone(),
            station_name: self.station_name.clone(),
            role: self.role(),
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_yield_standalone_station() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.role(), StationRole::Standalone);
        assert!(config.station_name.starts_with("station-"));
        assert_eq!(config.broker.port, 4222);
        assert_eq!(config.broker.monitor_port, 8222);
        assert_eq!(config.presence.presence_ttl, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn url_makes_member_and_orchestration_wins() {
        let member = Config::from_lookup(lookup(&[("STN_LATTICE_URL", "ws://hub:4222")])).unwrap();
        assert_eq!(member.role(), StationRole::Member);

        let orchestrator = Config::from_lookup(lookup(&[
            ("STN_LATTICE_URL", "ws://hub:4222"),
            ("STN_LATTICE_ORCHESTRATION", "true"),
        ]))
        .unwrap();
        assert_eq!(orchestrator.role(), StationRole::Orchestrator);
    }

    #[test]
    fn parses_tunables() {
        let config = Config::from_lookup(lookup(&[
            ("STN_LATTICE_STATION_ID", "alpha"),
            ("STN_LATTICE_STATION_NAME", "Alpha"),
            ("STN_LATTICE_HEARTBEAT_SEC", "2"),
            ("STN_LATTICE_PRESENCE_TTL_SEC", "7"),
            ("STN_LATTICE_WORKERS", "8"),
            ("STN_LATTICE_MAX_RECONNECTS", "5"),
        ]))
        .unwrap();
        let identity = config.identity();
        assert_eq!(identity.station_id, "alpha");
        assert_eq!(identity.station_name, "Alpha");
        assert_eq!(config.presence.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.responder.workers, 8);
        assert_eq!(config.reconnect.max_attempts, Some(5));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = Config::from_lookup(lookup(&[("STN_LATTICE_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref key, _) if key == "STN_LATTICE_PORT"));

        let err = Config::from_lookup(lookup(&[("STN_LATTICE_STATION_ID", "a.b")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref key, _) if key == "STN_LATTICE_STATION_ID"));

        let err = Config::from_lookup(lookup(&[
            ("STN_LATTICE_HEARTBEAT_SEC", "30"),
            ("STN_LATTICE_PRESENCE_TTL_SEC", "30"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref key, _) if key == "STN_LATTICE_PRESENCE_TTL_SEC"));

        let err = Config::from_lookup(lookup(&[("STN_LATTICE_TOKEN", "p@ss word")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref key, _) if key == "STN_LATTICE_TOKEN"));
    }
}
