//! Mesh-wide view of which agent lives on which station.
//!
//! The directory is fed by presence messages and aged by a periodic sweep.
//! Records older than the presence TTL are never returned to resolvers even
//! before the sweep physically removes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{DepartureReason, LastKnown, LatticeError, Result};
use crate::mesh::MeshConnection;
use crate::subjects;
use crate::types::{AgentAdvert, PresenceMessage, StationRole};

/// Departed agents remembered for `AgentNotFound` diagnostics.
const MAX_DEPARTED: usize = 1024;

/// One agent on one station.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub agent_name: String,
    pub station_id: String,
    pub station_name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub input_schema: Option<String>,
    pub output_schema: Option<String>,
    pub examples: Vec<String>,
    /// Hosted by the station that owns this directory.
    pub is_local: bool,
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
}

impl AgentRecord {
    fn refresh_from(&mut self, advert: &AgentAdvert, station_name: &str) {
        self.station_name = station_name.to_string();
        self.description = advert.description.clone();
        self.capabilities = advert.capabilities.clone();
        self.input_schema = advert.input_schema.clone();
        self.output_schema = advert.output_schema.clone();
        self.examples = advert.examples.clone();
    }
}

/// A peer station as seen through its presence.
#[derive(Debug, Clone, PartialEq)]
pub struct StationInfo {
    pub station_id: String,
    pub station_name: String,
    pub role: StationRole,
    pub agent_count: usize,
    pub last_seen: Instant,
    pub last_seen_at: DateTime<Utc>,
}

/// Where one agent can be reached.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentPlacement {
    pub station_id: String,
    pub station_name: String,
    pub is_local: bool,
}

/// An agent and every live station hosting it.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentListing {
    pub agent_name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    /// Ordered like `resolve`: most recently seen first.
    pub stations: Vec<AgentPlacement>,
}

impl AgentListing {
    /// Whether one of the hosting stations is this one.
    pub fn is_local(&self) -> bool {
        self.stations.iter().any(|p| p.is_local)
    }
}

/// Full description of one agent, for callers building a task for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSchema {
    pub agent_name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
    pub is_local: bool,
    pub station_id: String,
    pub station_name: String,
}

impl AgentSchema {
    pub fn from_advert(advert: &AgentAdvert, station_id: &str, station_name: &str, is_local: bool) -> Self {
        Self {
            agent_name: advert.name.clone(),
            description: advert.description.clone(),
            input_schema: advert.input_schema.clone(),
            output_schema: advert.output_schema.clone(),
            examples: advert.examples.clone(),
            is_local,
            station_id: station_id.to_string(),
            station_name: station_name.to_string(),
        }
    }

    /// `local` or the hosting station's name.
    pub fn location(&self) -> &str {
        if self.is_local {
            "local"
        } else {
            &self.station_name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationLeftReason {
    Graceful,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    StationJoined {
        station_id: String,
        station_name: String,
    },
    StationLeft {
        station_id: String,
        reason: StationLeftReason,
    },
    AgentRegistered {
        agent_name: String,
        station_id: String,
    },
    AgentDeregistered {
        agent_name: String,
        station_id: String,
        reason: DepartureReason,
    },
}

struct AgentEntry {
    record: AgentRecord,
    /// Set when the station stopped advertising the agent or left. Withdrawn
    /// entries are invisible to readers and removed by the next sweep.
    withdrawn: Option<DepartureReason>,
}

struct StationEntry {
    station_name: String,
    role: StationRole,
    sequence: u64,
    left: bool,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
}

struct Departed {
    last_known: LastKnown,
    at: Instant,
}

#[derive(Default)]
struct DirectoryState {
    /// agent_name -> station_id -> entry
    agents: HashMap<String, HashMap<String, AgentEntry>>,
    stations: HashMap<String, StationEntry>,
    departed: HashMap<String, Departed>,
}

pub struct Directory {
    ttl: Duration,
    local_station: Option<String>,
    state: RwLock<DirectoryState>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl Directory {
    pub fn new(presence_ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            ttl: presence_ttl,
            local_station: None,
            state: RwLock::new(DirectoryState::default()),
            events,
        }
    }

    /// Mark records from `station_id` as local.
    pub fn with_local_station(mut self, station_id: impl Into<String>) -> Self {
        self.local_station = Some(station_id.into());
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_local(&self, station_id: &str) -> bool {
        self.local_station.as_deref() == Some(station_id)
    }

    /// Stream of station and agent changes. Lagging receivers lose events.
    pub fn events(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    fn is_fresh(&self, last_seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_seen) <= self.ttl
    }

    pub fn on_presence(&self, msg: &PresenceMessage) -> bool {
        self.on_presence_at(msg, Instant::now())
    }

    /// Apply one presence message observed at `now`. Returns `false` when the
    /// message is older than one already applied for the same station.
    pub fn on_presence_at(&self, msg: &PresenceMessage, now: Instant) -> bool {
        let mut events = Vec::new();
        let wall = Utc::now();

        {
            let mut state = self.state.write();
            let state = &mut *state;

            let joined = match state.stations.get(&msg.station_id) {
                Some(station) => {
                    let fresh = self.is_fresh(station.last_seen, now);
                    if fresh && msg.sequence < station.sequence {
                        debug!(
                            "Ignoring out-of-order presence from {} (seq {} < {})",
                            msg.station_id, msg.sequence, station.sequence
                        );
                        return false;
                    }
                    station.left || !fresh
                }
                None => true,
            };

            if msg.leaving {
                self.apply_leaving(state, msg, now, wall, &mut events);
            } else {
                if joined {
                    events.push(DirectoryEvent::StationJoined {
                        station_id: msg.station_id.clone(),
                        station_name: msg.station_name.clone(),
                    });
                }
                self.apply_announcement(state, msg, now, wall, &mut events);
            }
        }

        for event in events {
            let _ = self.events.send(event);
        }
        true
    }

    fn upsert_station(
        state: &mut DirectoryState,
        msg: &PresenceMessage,
        now: Instant,
        wall: DateTime<Utc>,
    ) {
        let station = state
            .stations
            .entry(msg.station_id.clone())
            .or_insert_with(|| StationEntry {
                station_name: msg.station_name.clone(),
                role: msg.role,
                sequence: msg.sequence,
                left: msg.leaving,
                last_seen: now,
                last_seen_at: wall,
            });
        station.station_name = msg.station_name.clone();
        station.role = msg.role;
        station.sequence = station.sequence.max(msg.sequence);
        station.left = msg.leaving;
        if now >= station.last_seen {
            station.last_seen = now;
            station.last_seen_at = wall;
        }
    }

    fn apply_announcement(
        &self,
        state: &mut DirectoryState,
        msg: &PresenceMessage,
        now: Instant,
        wall: DateTime<Utc>,
        events: &mut Vec<DirectoryEvent>,
    ) {
        Self::upsert_station(state, msg, now, wall);

        for advert in &msg.agents {
            let stations = state.agents.entry(advert.name.clone()).or_default();
            match stations.get_mut(&msg.station_id) {
                Some(entry) => {
                    let was_live =
                        entry.withdrawn.is_none() && self.is_fresh(entry.record.last_seen, now);
                    let record = &mut entry.record;
                    record.refresh_from(advert, &msg.station_name);
                    if now >= record.last_seen {
                        record.last_seen = now;
                        record.last_seen_at = wall;
                    }
                    entry.withdrawn = None;
                    if !was_live {
                        events.push(DirectoryEvent::AgentRegistered {
                            agent_name: advert.name.clone(),
                            station_id: msg.station_id.clone(),
                        });
                    }
                }
                None => {
                    stations.insert(
                        msg.station_id.clone(),
                        AgentEntry {
                            record: AgentRecord {
                                agent_name: advert.name.clone(),
                                station_id: msg.station_id.clone(),
                                station_name: msg.station_name.clone(),
                                description: advert.description.clone(),
                                capabilities: advert.capabilities.clone(),
                                input_schema: advert.input_schema.clone(),
                                output_schema: advert.output_schema.clone(),
                                examples: advert.examples.clone(),
                                is_local: self.is_local(&msg.station_id),
                                last_seen: now,
                                last_seen_at: wall,
                            },
                            withdrawn: None,
                        },
                    );
                    events.push(DirectoryEvent::AgentRegistered {
                        agent_name: advert.name.clone(),
                        station_id: msg.station_id.clone(),
                    });
                }
            }
            state.departed.remove(&advert.name);
        }

        // Anything this station advertised before but not now is withdrawn.
        for (agent_name, stations) in state.agents.iter_mut() {
            if msg.agents.iter().any(|a| &a.name == agent_name) {
                continue;
            }
            if let Some(entry) = stations.get_mut(&msg.station_id) {
                if entry.withdrawn.is_none() {
                    entry.withdrawn = Some(DepartureReason::Withdrawn);
                    events.push(DirectoryEvent::AgentDeregistered {
                        agent_name: agent_name.clone(),
                        station_id: msg.station_id.clone(),
                        reason: DepartureReason::Withdrawn,
                    });
                }
            }
        }
    }

    fn apply_leaving(
        &self,
        state: &mut DirectoryState,
        msg: &PresenceMessage,
        now: Instant,
        wall: DateTime<Utc>,
        events: &mut Vec<DirectoryEvent>,
    ) {
        let already_left = state
            .stations
            .get(&msg.station_id)
            .map_or(true, |s| s.left);
        Self::upsert_station(state, msg, now, wall);

        for (agent_name, stations) in state.agents.iter_mut() {
            if let Some(entry) = stations.get_mut(&msg.station_id) {
                if entry.withdrawn.is_none() {
                    entry.withdrawn = Some(DepartureReason::StationLeft);
                    events.push(DirectoryEvent::AgentDeregistered {
                        agent_name: agent_name.clone(),
                        station_id: msg.station_id.clone(),
                        reason: DepartureReason::StationLeft,
                    });
                }
            }
        }

        if !already_left {
            info!("Station {} ({}) left the lattice", msg.station_name, msg.station_id);
            events.push(DirectoryEvent::StationLeft {
                station_id: msg.station_id.clone(),
                reason: StationLeftReason::Graceful,
            });
        }
    }

    pub fn resolve(&self, agent_name: &str) -> Result<Vec<String>> {
        self.resolve_at(agent_name, Instant::now())
    }

    /// Stations hosting `agent_name`, most recently seen first, ties broken by
    /// station id.
    ///
    /// # Errors
    ///
    /// `LatticeError::AgentNotFound` when no live station hosts the agent. The
    /// error carries the last known placement if the agent existed before.
    pub fn resolve_at(&self, agent_name: &str, now: Instant) -> Result<Vec<String>> {
        Ok(self
            .resolve_records_at(agent_name, now)?
            .into_iter()
            .map(|r| r.station_id)
            .collect())
    }

    pub fn resolve_records(&self, agent_name: &str) -> Result<Vec<AgentRecord>> {
        self.resolve_records_at(agent_name, Instant::now())
    }

    pub fn resolve_records_at(&self, agent_name: &str, now: Instant) -> Result<Vec<AgentRecord>> {
        let state = self.state.read();
        let records = self.live_records(&state, agent_name, now);
        if !records.is_empty() {
            return Ok(records);
        }
        Err(LatticeError::AgentNotFound {
            agent: agent_name.to_string(),
            last_known: self.last_known(&state, agent_name, now),
        })
    }

    fn live_records(&self, state: &DirectoryState, agent_name: &str, now: Instant) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = state
            .agents
            .get(agent_name)
            .map(|stations| {
                stations
                    .values()
                    .filter(|e| e.withdrawn.is_none() && self.is_fresh(e.record.last_seen, now))
                    .map(|e| e.record.clone())
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.station_id.cmp(&b.station_id))
        });
        records
    }

    fn last_known(&self, state: &DirectoryState, agent_name: &str, now: Instant) -> Option<LastKnown> {
        let pending = state.agents.get(agent_name).and_then(|stations| {
            stations
                .values()
                .max_by(|a, b| {
                    a.record
                        .last_seen
                        .cmp(&b.record.last_seen)
                        .then_with(|| b.record.station_id.cmp(&a.record.station_id))
                })
                .map(|e| LastKnown {
                    station_id: e.record.station_id.clone(),
                    reason: match e.withdrawn {
                        Some(reason) => reason,
                        None if !self.is_fresh(e.record.last_seen, now) => DepartureReason::Expired,
                        None => DepartureReason::Withdrawn,
                    },
                })
        });
        pending.or_else(|| state.departed.get(agent_name).map(|d| d.last_known.clone()))
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Physically remove withdrawn and expired entries. Returns the number of
    /// agent records removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut events = Vec::new();
        let mut removed = 0;

        {
            let mut state = self.state.write();
            let state = &mut *state;
            let mut departed = Vec::new();

            for (agent_name, stations) in state.agents.iter_mut() {
                stations.retain(|station_id, entry| {
                    let reason = match entry.withdrawn {
                        Some(reason) => reason,
                        None if !self.is_fresh(entry.record.last_seen, now) => {
                            events.push(DirectoryEvent::AgentDeregistered {
                                agent_name: agent_name.clone(),
                                station_id: station_id.clone(),
                                reason: DepartureReason::Expired,
                            });
                            DepartureReason::Expired
                        }
                        None => return true,
                    };
                    departed.push((
                        agent_name.clone(),
                        LastKnown {
                            station_id: station_id.clone(),
                            reason,
                        },
                        entry.record.last_seen,
                    ));
                    removed += 1;
                    false
                });
            }
            state.agents.retain(|_, stations| !stations.is_empty());

            for (agent_name, last_known, at) in departed {
                if state.agents.contains_key(&agent_name) {
                    continue;
                }
                let newer = state.departed.get(&agent_name).map_or(true, |d| at >= d.at);
                if newer {
                    state.departed.insert(agent_name, Departed { last_known, at });
                }
            }
            while state.departed.len() > MAX_DEPARTED {
                let oldest = state
                    .departed
                    .iter()
                    .min_by_key(|(_, d)| d.at)
                    .map(|(name, _)| name.clone());
                match oldest {
                    Some(name) => state.departed.remove(&name),
                    None => break,
                };
            }

            state.stations.retain(|station_id, station| {
                if self.is_fresh(station.last_seen, now) && !station.left {
                    return true;
                }
                if !station.left {
                    info!(
                        "Station {} ({}) expired from the lattice",
                        station.station_name, station_id
                    );
                    events.push(DirectoryEvent::StationLeft {
                        station_id: station_id.clone(),
                        reason: StationLeftReason::Expired,
                    });
                    return false;
                }
                // Left stations stay until their TTL passes so late, reordered
                // heartbeats cannot resurrect them.
                self.is_fresh(station.last_seen, now)
            });
        }

        if removed > 0 {
            debug!("Directory sweep removed {} agent records", removed);
        }
        for event in events {
            let _ = self.events.send(event);
        }
        removed
    }

    pub fn list_agents(&self) -> Vec<AgentListing> {
        self.list_agents_at(Instant::now())
    }

    /// Every live agent with its hosting stations, sorted by agent name.
    pub fn list_agents_at(&self, now: Instant) -> Vec<AgentListing> {
        let state = self.state.read();
        let mut names: Vec<&String> = state.agents.keys().collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|name| {
                let records = self.live_records(&state, name, now);
                let first = records.first()?;
                let mut capabilities: Vec<String> = Vec::new();
                for record in &records {
                    for cap in &record.capabilities {
                        if !capabilities.contains(cap) {
                            capabilities.push(cap.clone());
                        }
                    }
                }
                Some(AgentListing {
                    agent_name: name.clone(),
                    description: first.description.clone(),
                    capabilities,
                    stations: records
                        .iter()
                        .map(|r| AgentPlacement {
                            station_id: r.station_id.clone(),
                            station_name: r.station_name.clone(),
                            is_local: r.is_local,
                        })
                        .collect(),
                })
            })
            .collect()
    }

    /// Schema of `agent_name` as advertised by its best live station.
    ///
    /// # Errors
    ///
    /// `LatticeError::AgentNotFound` as [`Directory::resolve`].
    pub fn agent_schema(&self, agent_name: &str) -> Result<AgentSchema> {
        let records = self.resolve_records(agent_name)?;
        let record = records
            .iter()
            .find(|r| r.is_local)
            .or_else(|| records.first())
            .ok_or_else(|| LatticeError::agent_not_found(agent_name))?;
        Ok(AgentSchema {
            agent_name: record.agent_name.clone(),
            description: record.description.clone(),
            input_schema: record.input_schema.clone(),
            output_schema: record.output_schema.clone(),
            examples: record.examples.clone(),
            is_local: record.is_local,
            station_id: record.station_id.clone(),
            station_name: record.station_name.clone(),
        })
    }

    pub fn list_stations(&self) -> Vec<StationInfo> {
        self.list_stations_at(Instant::now())
    }

    /// Live stations sorted by id.
    pub fn list_stations_at(&self, now: Instant) -> Vec<StationInfo> {
        let state = self.state.read();
        let mut stations: Vec<StationInfo> = state
            .stations
            .iter()
            .filter(|(_, s)| !s.left && self.is_fresh(s.last_seen, now))
            .map(|(station_id, s)| StationInfo {
                station_id: station_id.clone(),
                station_name: s.station_name.clone(),
                role: s.role,
                agent_count: state
                    .agents
                    .values()
                    .filter_map(|stations| stations.get(station_id))
                    .filter(|e| e.withdrawn.is_none() && self.is_fresh(e.record.last_seen, now))
                    .count(),
                last_seen: s.last_seen,
                last_seen_at: s.last_seen_at,
            })
            .collect();
        stations.sort_by(|a, b| a.station_id.cmp(&b.station_id));
        stations
    }

    pub fn find_by_capability(&self, capability: &str) -> Vec<AgentRecord> {
        self.find_by_capability_at(capability, Instant::now())
    }

    /// Live records with a capability containing `capability`, ignoring case.
    pub fn find_by_capability_at(&self, capability: &str, now: Instant) -> Vec<AgentRecord> {
        let needle = capability.to_lowercase();
        let state = self.state.read();
        let mut records: Vec<AgentRecord> = state
            .agents
            .values()
            .flat_map(|stations| stations.values())
            .filter(|e| e.withdrawn.is_none() && self.is_fresh(e.record.last_seen, now))
            .filter(|e| {
                e.record
                    .capabilities
                    .iter()
                    .any(|cap| cap.to_lowercase().contains(&needle))
            })
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| {
            a.agent_name
                .cmp(&b.agent_name)
                .then_with(|| a.station_id.cmp(&b.station_id))
        });
        records
    }

    /// Feed presence from the mesh into this directory until `shutdown`.
    pub fn spawn_consumer(
        self: &Arc<Self>,
        conn: &MeshConnection,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut presence = conn.subscribe(subjects::PRESENCE)?;
        let directory = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = presence.next() => {
                        let Some(msg) = msg else { break };
                        match msg.decode::<PresenceMessage>() {
                            Ok(presence) => {
                                directory.on_presence(&presence);
                            }
                            Err(e) => debug!("Ignoring malformed presence message: {}", e),
                        }
                    }
                }
            }
        }))
    }

    /// Run the sweep every `interval` until `shutdown`.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        directory.sweep();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentAdvert;

    const TTL: Duration = Duration::from_secs(30);

    fn presence(station: &str, sequence: u64, agents: &[&str]) -> PresenceMessage {
        PresenceMessage {
            station_id: station.to_string(),
            station_name: format!("{}-name", station),
            role: StationRole::Member,
            agents: agents.iter().map(|a| AgentAdvert::new(*a)).collect(),
            sequence,
            sent_at: Utc::now(),
            leaving: false,
        }
    }

    fn leaving(station: &str, sequence: u64) -> PresenceMessage {
        PresenceMessage {
            leaving: true,
            agents: Vec::new(),
            ..presence(station, sequence, &[])
        }
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(5);

        dir.on_presence_at(&presence("alpha", 1, &["reporter"]), later);
        // A replay observed with an earlier instant must not rewind the record.
        dir.on_presence_at(&presence("alpha", 1, &["reporter"]), t0);

        let records = dir.resolve_records_at("reporter", later).unwrap();
        assert_eq!(records[0].last_seen, later);
    }

    #[test]
    fn replays_only_refresh() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        let msg = presence("alpha", 4, &["reporter"]);
        assert!(dir.on_presence_at(&msg, t0));
        assert!(dir.on_presence_at(&msg, t0 + Duration::from_secs(1)));
        assert_eq!(dir.resolve_at("reporter", t0).unwrap(), vec!["alpha"]);
        assert_eq!(dir.list_stations_at(t0).len(), 1);
    }

    #[test]
    fn entries_past_ttl_are_invisible_then_swept() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        dir.on_presence_at(&presence("alpha", 1, &["reporter"]), t0);

        let just_inside = t0 + TTL;
        assert!(dir.resolve_at("reporter", just_inside).is_ok());

        let expired = t0 + TTL + Duration::from_millis(1);
        let err = dir.resolve_at("reporter", expired).unwrap_err();
        assert!(matches!(
            err,
            LatticeError::AgentNotFound { last_known: Some(LastKnown { reason: DepartureReason::Expired, .. }), .. }
        ));

        assert_eq!(dir.sweep_at(expired), 1);
        assert!(dir.list_stations_at(expired).is_empty());
        let err = dir.resolve_at("reporter", expired).unwrap_err();
        match err {
            LatticeError::AgentNotFound { last_known, .. } => {
                let last = last_known.expect("departed agent remembered");
                assert_eq!(last.station_id, "alpha");
                assert_eq!(last.reason, DepartureReason::Expired);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn unknown_agent_has_no_last_known() {
        let dir = Directory::new(TTL);
        match dir.resolve("ghost").unwrap_err() {
            LatticeError::AgentNotFound { agent, last_known } => {
                assert_eq!(agent, "ghost");
                assert!(last_known.is_none());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn resolve_orders_by_recency_then_station_id() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        dir.on_presence_at(&presence("charlie", 1, &["reporter"]), t0);
        dir.on_presence_at(&presence("bravo", 1, &["reporter"]), t0);
        dir.on_presence_at(&presence("alpha", 1, &["reporter"]), t0 + Duration::from_secs(1));

        let order = dir.resolve_at("reporter", t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(order, vec!["alpha", "bravo", "charlie"]);

        dir.on_presence_at(&presence("charlie", 2, &["reporter"]), t0 + Duration::from_secs(3));
        let order = dir.resolve_at("reporter", t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(order[0], "charlie");
    }

    #[test]
    fn withdrawn_agents_disappear_immediately() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        dir.on_presence_at(&presence("alpha", 1, &["reporter", "planner"]), t0);
        dir.on_presence_at(&presence("alpha", 2, &["planner"]), t0 + Duration::from_secs(1));

        let err = dir.resolve_at("reporter", t0 + Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            LatticeError::AgentNotFound { last_known: Some(LastKnown { reason: DepartureReason::Withdrawn, .. }), .. }
        ));
        assert!(dir.resolve_at("planner", t0 + Duration::from_secs(1)).is_ok());
        assert_eq!(dir.sweep_at(t0 + Duration::from_secs(1)), 1);

        dir.on_presence_at(&presence("alpha", 3, &["planner", "reporter"]), t0 + Duration::from_secs(2));
        assert!(dir.resolve_at("reporter", t0 + Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn out_of_order_presence_is_ignored() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        dir.on_presence_at(&presence("alpha", 5, &["planner"]), t0);
        let stale = presence("alpha", 4, &["reporter"]);
        assert!(!dir.on_presence_at(&stale, t0 + Duration::from_secs(1)));
        assert!(dir.resolve_at("reporter", t0 + Duration::from_secs(1)).is_err());
        assert!(dir.resolve_at("planner", t0 + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn leaving_station_is_removed_and_not_resurrected() {
        let dir = Directory::new(TTL);
        let mut events = dir.events();
        let t0 = Instant::now();
        dir.on_presence_at(&presence("alpha", 1, &["reporter"]), t0);
        dir.on_presence_at(&leaving("alpha", 2), t0 + Duration::from_secs(1));

        let err = dir.resolve_at("reporter", t0 + Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            LatticeError::AgentNotFound { last_known: Some(LastKnown { reason: DepartureReason::StationLeft, .. }), .. }
        ));
        assert!(dir.list_stations_at(t0 + Duration::from_secs(1)).is_empty());

        // A heartbeat sent before the departure but delivered after it.
        assert!(!dir.on_presence_at(&presence("alpha", 1, &["reporter"]), t0 + Duration::from_secs(2)));
        assert!(dir.resolve_at("reporter", t0 + Duration::from_secs(2)).is_err());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                DirectoryEvent::StationJoined {
                    station_id: "alpha".into(),
                    station_name: "alpha-name".into()
                },
                DirectoryEvent::AgentRegistered {
                    agent_name: "reporter".into(),
                    station_id: "alpha".into()
                },
                DirectoryEvent::AgentDeregistered {
                    agent_name: "reporter".into(),
                    station_id: "alpha".into(),
                    reason: DepartureReason::StationLeft
                },
                DirectoryEvent::StationLeft {
                    station_id: "alpha".into(),
                    reason: StationLeftReason::Graceful
                },
            ]
        );
    }

    #[test]
    fn restarted_station_rejoins_after_expiry() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        dir.on_presence_at(&presence("alpha", 100, &["reporter"]), t0);
        let after = t0 + TTL + Duration::from_secs(1);
        assert!(dir.on_presence_at(&presence("alpha", 1, &["reporter"]), after));
        assert!(dir.resolve_at("reporter", after).is_ok());
    }

    #[test]
    fn capability_search_is_case_insensitive_substring() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        let mut msg = presence("alpha", 1, &[]);
        msg.agents = vec![
            AgentAdvert::new("reporter").with_capabilities(["Weekly-Reports", "summaries"]),
            AgentAdvert::new("planner").with_capabilities(["planning"]),
        ];
        dir.on_presence_at(&msg, t0);

        let found = dir.find_by_capability_at("report", t0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_name, "reporter");
        assert!(dir.find_by_capability_at("SUMMAR", t0).len() == 1);
        assert!(dir.find_by_capability_at("deploy", t0).is_empty());
    }

    #[test]
    fn list_agents_groups_by_name() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        dir.on_presence_at(&presence("alpha", 1, &["reporter"]), t0);
        dir.on_presence_at(&presence("bravo", 1, &["reporter", "planner"]), t0);

        let listing = dir.list_agents_at(t0);
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].agent_name, "planner");
        assert_eq!(listing[1].agent_name, "reporter");
        assert_eq!(listing[1].stations.len(), 2);

        let stations = dir.list_stations_at(t0);
        assert_eq!(stations[1].station_id, "bravo");
        assert_eq!(stations[1].agent_count, 2);
    }

    #[test]
    fn local_station_records_are_flagged() {
        let dir = Directory::new(TTL).with_local_station("alpha");
        let t0 = Instant::now();
        dir.on_presence_at(&presence("alpha", 1, &["reporter"]), t0);
        dir.on_presence_at(&presence("bravo", 1, &["reporter", "planner"]), t0);

        let listing = dir.list_agents_at(t0);
        assert!(!listing[0].is_local());
        assert!(listing[1].is_local());
        let local: Vec<_> = listing[1].stations.iter().filter(|p| p.is_local).collect();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].station_id, "alpha");
    }

    #[test]
    fn schema_follows_the_latest_advert() {
        let dir = Directory::new(TTL);
        let t0 = Instant::now();
        let mut msg = presence("bravo", 1, &[]);
        msg.agents = vec![AgentAdvert::new("reporter")
            .with_description("Writes reports")
            .with_input_schema(r#"{"type":"object"}"#)
            .with_examples(["weekly"])];
        dir.on_presence_at(&msg, t0);

        let schema = dir.agent_schema("reporter").unwrap();
        assert_eq!(schema.description, "Writes reports");
        assert_eq!(schema.input_schema.as_deref(), Some(r#"{"type":"object"}"#));
        assert_eq!(schema.output_schema, None);
        assert_eq!(schema.examples, vec!["weekly".to_string()]);
        assert_eq!(schema.location(), "bravo-name");

        msg.sequence = 2;
        msg.agents[0].output_schema = Some(r#"{"type":"string"}"#.into());
        dir.on_presence_at(&msg, t0);
        let schema = dir.agent_schema("reporter").unwrap();
        assert_eq!(schema.output_schema.as_deref(), Some(r#"{"type":"string"}"#));

        assert!(matches!(
            dir.agent_schema("ghost"),
            Err(LatticeError::AgentNotFound { .. })
        ));
    }
}
