//! A station: one process participating in the lattice.
//!
//! `Station` wires the components together according to the configured role:
//!
//! - **orchestrator**: starts the embedded broker and connects to it (or to
//!   `url` when one is configured)
//! - **member**: connects to the broker at `url`, retrying in the background
//!   if it is not reachable yet
//! - **standalone**: no mesh at all; only the local catalog is available

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{BrokerStats, EmbeddedBroker};
use crate::config::Config;
use crate::directory::{AgentListing, AgentRecord, AgentSchema, Directory, StationInfo};
use crate::dispatcher::{Dispatcher, ExecOptions, Invocation};
use crate::engine::{AgentCatalog, AgentExecutor};
use crate::error::{LatticeError, Result};
use crate::mesh::{ConnectOptions, ConnectionState, MeshConnection};
use crate::presence::PresencePublisher;
use crate::responder::Responder;
use crate::subjects;
use crate::types::{AgentAdvert, StationIdentity, StationRole};
use crate::util::deadline_after;

/// Addresses and counters of the embedded broker.
#[derive(Debug, Clone)]
pub struct BrokerStatus {
    pub client_addr: SocketAddr,
    pub monitor_addr: SocketAddr,
    pub stats: BrokerStats,
}

/// Snapshot returned by [`Station::status`].
#[derive(Debug, Clone)]
pub struct MeshStatus {
    pub identity: StationIdentity,
    /// `None` for standalone stations.
    pub connection: Option<ConnectionState>,
    pub broker_url: Option<String>,
    pub broker: Option<BrokerStatus>,
    pub stations: Vec<StationInfo>,
    pub local_agents: Vec<AgentAdvert>,
    /// Silence after which a peer is dropped from the directory.
    pub presence_ttl: Duration,
}

/// Background work started once a station has a mesh connection.
#[derive(Default)]
struct MeshTasks {
    tasks: Vec<JoinHandle<()>>,
    presence_task: Option<JoinHandle<()>>,
    dispatcher: Option<Dispatcher>,
}

pub struct StationBuilder {
    config: Config,
    catalog: Arc<AgentCatalog>,
    executor: Option<Arc<dyn AgentExecutor>>,
    announce: bool,
    local_station: Option<String>,
}

impl StationBuilder {
    /// Engine that runs requests for this station's agents. Without one the
    /// station only calls other stations.
    pub fn executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn agent(self, advert: AgentAdvert) -> Result<Self> {
        self.catalog.register(advert)?;
        Ok(self)
    }

    /// Join without announcing presence. Used by one-shot CLI commands that
    /// only read the directory or call agents.
    pub fn observer(mut self) -> Self {
        self.announce = false;
        self
    }

    /// Treat agents of `station_id` as local in listings and schema lookups.
    /// Defaults to this station's own id.
    pub fn local_station(mut self, station_id: impl Into<String>) -> Self {
        self.local_station = Some(station_id.into());
        self
    }

    pub async fn start(self) -> Result<Station> {
        Station::start(self).await
    }
}

pub struct Station {
    identity: StationIdentity,
    config: Config,
    catalog: Arc<AgentCatalog>,
    directory: Arc<Directory>,
    broker: Option<EmbeddedBroker>,
    conn: Option<MeshConnection>,
    dispatcher: Option<Dispatcher>,
    shutdown: CancellationToken,
    presence_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Station {
    pub fn builder(config: Config) -> StationBuilder {
        StationBuilder {
            config,
            catalog: Arc::new(AgentCatalog::new()),
            executor: None,
            announce: true,
            local_station: None,
        }
    }

    async fn start(builder: StationBuilder) -> Result<Self> {
        let StationBuilder {
            config,
            catalog,
            executor,
            announce,
            local_station,
        } = builder;
        config.validate()?;

        let identity = config.identity();
        let directory = Arc::new(
            Directory::new(config.presence.presence_ttl)
                .with_local_station(local_station.unwrap_or_else(|| identity.station_id.clone())),
        );
        let shutdown = CancellationToken::new();

        info!(
            "Starting station {} ({}) as {}",
            identity.station_name, identity.station_id, identity.role
        );

        let (broker, conn) = match identity.role {
            StationRole::Standalone => {
                info!("No lattice URL configured; mesh disabled");
                (None, None)
            }
            StationRole::Orchestrator => {
                let broker = EmbeddedBroker::new(config.broker.clone());
                let handle = broker.start().await?;
                let url = config
                    .url
                    .clone()
                    .unwrap_or_else(|| handle.client_url(config.broker.token.as_deref()));
                match MeshConnection::connect(&url, connect_options(&config)).await {
                    Ok(conn) => (Some(broker), Some(conn)),
                    Err(e) => {
                        broker.stop().await;
                        return Err(e);
                    }
                }
            }
            StationRole::Member => {
                let url = config.url.clone().unwrap_or_default();
                let conn = match MeshConnection::connect(&url, connect_options(&config)).await {
                    Ok(conn) => conn,
                    Err(e) if e.is_transient() => {
                        warn!("Lattice broker not reachable yet ({}); retrying in the background", e);
                        MeshConnection::connect_lazy(&url, connect_options(&config))?
                    }
                    Err(e) => return Err(e),
                };
                (None, Some(conn))
            }
        };

        let mut spawned = MeshTasks::default();
        if let Some(conn) = &conn {
            let started = spawn_mesh_tasks(
                &mut spawned,
                &identity,
                &config,
                &catalog,
                &directory,
                conn,
                executor,
                announce,
                &shutdown,
            );
            if let Err(e) = started {
                warn!("Station {} failed to start: {}", identity.station_id, e);
                abandon_start(&shutdown, spawned, Some(conn), broker.as_ref()).await;
                return Err(e);
            }
        }
        let MeshTasks {
            tasks,
            presence_task,
            dispatcher,
        } = spawned;

        Ok(Self {
            identity,
            config,
            catalog,
            directory,
            broker,
            conn,
            dispatcher,
            shutdown,
            presence_task: Mutex::new(presence_task),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn identity(&self) -> &StationIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<AgentCatalog> {
        &self.catalog
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn connection(&self) -> Option<&MeshConnection> {
        self.conn.as_ref()
    }

    pub fn register_agent(&self, advert: AgentAdvert) -> Result<bool> {
        self.catalog.register(advert)
    }

    pub fn unregister_agent(&self, name: &str) -> bool {
        self.catalog.unregister(name)
    }

    /// Ask every station to announce itself now.
    pub fn probe(&self) -> Result<()> {
        let conn = self.conn.as_ref().ok_or(LatticeError::NotConnected)?;
        conn.publish(subjects::PRESENCE_PROBE, &Value::Null)
    }

    pub async fn status(&self) -> MeshStatus {
        let broker = match &self.broker {
            Some(broker) => broker.handle().await.map(|handle| BrokerStatus {
                client_addr: handle.client_addr(),
                monitor_addr: handle.monitor_addr(),
                stats: handle.stats(),
            }),
            None => None,
        };
        MeshStatus {
            identity: self.identity.clone(),
            connection: self.conn.as_ref().map(MeshConnection::state),
            broker_url: self.conn.as_ref().map(|c| c.url().to_string()),
            broker,
            stations: self.directory.list_stations(),
            local_agents: self.catalog.agents(),
            presence_ttl: self.directory.ttl(),
        }
    }

    /// Schema of `agent_name`, preferring this station's own catalog over
    /// what peers advertise.
    ///
    /// # Errors
    ///
    /// `LatticeError::AgentNotFound` when neither this station nor a live
    /// peer hosts the agent.
    pub fn agent_schema(&self, agent_name: &str) -> Result<AgentSchema> {
        match self.catalog.get(agent_name) {
            Some(advert) => Ok(AgentSchema::from_advert(
                &advert,
                &self.identity.station_id,
                &self.identity.station_name,
                true,
            )),
            None => self.directory.agent_schema(agent_name),
        }
    }

    pub fn agents(&self) -> Vec<AgentListing> {
        self.directory.list_agents()
    }

    pub fn find_agents(&self, capability: &str) -> Vec<AgentRecord> {
        self.directory.find_by_capability(capability)
    }

    /// Invoke an agent anywhere on the lattice.
    ///
    /// # Errors
    ///
    /// `LatticeError::NotConnected` on a standalone station, otherwise as
    /// [`Dispatcher::exec`].
    pub fn exec(&self, agent_name: &str, payload: Value, options: ExecOptions) -> Result<Invocation> {
        let dispatcher = self.dispatcher.as_ref().ok_or(LatticeError::NotConnected)?;
        dispatcher.exec(agent_name, payload, options)
    }

    /// Wait until `agent_name` resolves or `timeout` passes.
    pub async fn wait_for_agent(&self, agent_name: &str, timeout: Duration) -> Result<Vec<String>> {
        let deadline = deadline_after(tokio::time::Instant::now(), timeout);
        let mut events = self.directory.events();
        loop {
            match self.directory.resolve(agent_name) {
                Ok(stations) => return Ok(stations),
                Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
                Err(_) => {}
            }
            let _ = tokio::time::timeout_at(deadline, events.recv()).await;
        }
    }

    /// Announce departure, stop every task, close the connection and stop the
    /// embedded broker.
    pub async fn shutdown(&self) {
        info!("Shutting down station {}", self.identity.station_id);
        self.shutdown.cancel();

        if let Some(task) = self.presence_task.lock().await.take() {
            let _ = task.await;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(conn) = &self.conn {
            conn.close().await;
        }
        if let Some(broker) = &self.broker {
            broker.stop().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_mesh_tasks(
    spawned: &mut MeshTasks,
    identity: &StationIdentity,
    config: &Config,
    catalog: &Arc<AgentCatalog>,
    directory: &Arc<Directory>,
    conn: &MeshConnection,
    executor: Option<Arc<dyn AgentExecutor>>,
    announce: bool,
    shutdown: &CancellationToken,
) -> Result<()> {
    spawned.tasks.push(directory.spawn_consumer(conn, shutdown.clone())?);
    spawned
        .tasks
        .push(directory.spawn_sweeper(config.presence.sweep_interval, shutdown.clone()));

    if let Some(executor) = executor {
        let responder = Arc::new(Responder::new(
            identity.station_id.clone(),
            conn.clone(),
            Arc::clone(catalog),
            executor,
            &config.responder,
        ));
        spawned.tasks.push(responder.spawn(shutdown.clone())?);
    }

    if announce {
        let publisher = Arc::new(PresencePublisher::new(
            identity.clone(),
            Arc::clone(catalog),
            conn.clone(),
            config.presence.heartbeat_interval,
        ));
        spawned.presence_task = Some(publisher.spawn(shutdown.clone())?);
    }

    spawned.dispatcher = Some(Dispatcher::new(
        identity.station_id.clone(),
        conn.clone(),
        Arc::clone(directory),
        config.routing.clone(),
    ));
    Ok(())
}

/// Undo a partial start: stop whatever was spawned, then release the
/// connection and the broker ports.
async fn abandon_start(
    shutdown: &CancellationToken,
    spawned: MeshTasks,
    conn: Option<&MeshConnection>,
    broker: Option<&EmbeddedBroker>,
) {
    shutdown.cancel();
    for task in spawned.presence_task.into_iter().chain(spawned.tasks) {
        let _ = task.await;
    }
    if let Some(conn) = conn {
        conn.close().await;
    }
    if let Some(broker) = broker {
        broker.stop().await;
    }
}

fn connect_options(config: &Config) -> ConnectOptions {
    ConnectOptions::new(format!(
        "{} ({})",
        config.station_name, config.station_id
    ))
    .with_backoff(config.reconnect.clone())
}
