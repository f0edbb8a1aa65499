//! Presence publisher: tells the lattice which agents this station hosts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::AgentCatalog;
use crate::error::Result;
use crate::mesh::{ConnectionState, MeshConnection};
use crate::subjects;
use crate::types::{PresenceMessage, StationIdentity};

const LEAVE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct PresencePublisher {
    identity: StationIdentity,
    catalog: Arc<AgentCatalog>,
    conn: MeshConnection,
    heartbeat: Duration,
    sequence: AtomicU64,
}

impl PresencePublisher {
    pub fn new(
        identity: StationIdentity,
        catalog: Arc<AgentCatalog>,
        conn: MeshConnection,
        heartbeat: Duration,
    ) -> Self {
        // Seeded from the clock so a restarted station outranks its previous
        // incarnation's last message.
        let seed = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        Self {
            identity,
            catalog,
            conn,
            heartbeat,
            sequence: AtomicU64::new(seed),
        }
    }

    /// Build the next presence message from the current catalog.
    pub fn snapshot(&self, leaving: bool) -> PresenceMessage {
        PresenceMessage {
            station_id: self.identity.station_id.clone(),
            station_name: self.identity.station_name.clone(),
            role: self.identity.role,
            agents: if leaving {
                Vec::new()
            } else {
                self.catalog.agents()
            },
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            sent_at: Utc::now(),
            leaving,
        }
    }

    pub fn announce(&self) -> Result<()> {
        let msg = self.snapshot(false);
        self.conn.publish(subjects::PRESENCE, &msg)?;
        debug!(
            "Announced {} agents (seq {})",
            msg.agents.len(),
            msg.sequence
        );
        Ok(())
    }

    /// Ask every station, this one included, to announce itself now.
    pub fn probe(&self) -> Result<()> {
        self.conn.publish(subjects::PRESENCE_PROBE, &Value::Null)
    }

    /// Announce a graceful departure and wait briefly for it to reach the broker.
    pub async fn announce_leaving(&self) -> Result<()> {
        self.conn
            .publish(subjects::PRESENCE, &self.snapshot(true))?;
        self.conn.flush(LEAVE_FLUSH_TIMEOUT).await
    }

    fn announce_quietly(&self) {
        if let Err(e) = self.announce() {
            debug!("Presence not published: {}", e);
        }
    }

    /// Publish on every heartbeat, on catalog changes, after reconnects and in
    /// answer to probes. On shutdown, announce the departure.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut probes = self.conn.subscribe(subjects::PRESENCE_PROBE)?;
        let mut catalog = self.catalog.watch();
        let mut state = self.conn.watch_state();

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.heartbeat);
            let mut probes_open = true;
            let mut catalog_open = true;
            let mut state_open = true;

            if self.conn.is_connected() {
                if let Err(e) = self.probe() {
                    debug!("Presence probe not published: {}", e);
                }
            }

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        if let Err(e) = self.announce_leaving().await {
                            warn!("Could not announce departure: {}", e);
                        }
                        break;
                    }
                    _ = ticker.tick() => self.announce_quietly(),
                    changed = catalog.changed(), if catalog_open => {
                        if changed.is_err() {
                            catalog_open = false;
                            continue;
                        }
                        self.announce_quietly();
                        ticker.reset();
                    }
                    changed = state.changed(), if state_open => {
                        if changed.is_err() {
                            state_open = false;
                            continue;
                        }
                        let current = *state.borrow_and_update();
                        if current == ConnectionState::Connected {
                            self.announce_quietly();
                            if let Err(e) = self.probe() {
                                debug!("Presence probe not published: {}", e);
                            }
                            ticker.reset();
                        }
                    }
                    probe = probes.next(), if probes_open => {
                        match probe {
                            Some(_) => self.announce_quietly(),
                            None => probes_open = false,
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EmbeddedBroker;
    use crate::config::BrokerConfig;
    use crate::mesh::{BackoffConfig, ConnectOptions, Subscription};
    use crate::types::{AgentAdvert, StationRole};

    fn identity() -> StationIdentity {
        StationIdentity {
            station_id: "alpha".into(),
            station_name: "Alpha".into(),
            role: StationRole::Member,
        }
    }

    async fn next_presence(sub: &mut crate::mesh::Subscription) -> PresenceMessage {
        let msg = tokio::time::timeout(Duration::from_secs(3), sub.next())
            .await
            .expect("presence within timeout")
            .expect("subscription open");
        msg.decode().unwrap()
    }

    /// Read until the subject goes quiet; returns the highest sequence seen.
    async fn drain_presence(sub: &mut Subscription) -> u64 {
        let mut highest = 0;
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(300), sub.next()).await {
            let presence: PresenceMessage = msg.decode().unwrap();
            highest = highest.max(presence.sequence);
        }
        highest
    }

    async fn ephemeral_broker(port: u16) -> (EmbeddedBroker, String) {
        let broker = EmbeddedBroker::new(BrokerConfig {
            port,
            monitor_port: 0,
            ..BrokerConfig::default()
        });
        let url = broker.start().await.unwrap().client_url(None);
        (broker, url)
    }

    fn spawn_publisher(conn: &MeshConnection, shutdown: &CancellationToken) -> JoinHandle<()> {
        let catalog = Arc::new(AgentCatalog::new());
        catalog.register(AgentAdvert::new("reporter")).unwrap();
        let publisher = Arc::new(PresencePublisher::new(
            identity(),
            catalog,
            conn.clone(),
            Duration::from_secs(60),
        ));
        publisher.spawn(shutdown.clone()).unwrap()
    }

    #[tokio::test]
    async fn publishes_on_start_change_and_shutdown() {
        let broker = EmbeddedBroker::new(BrokerConfig {
            port: 0,
            monitor_port: 0,
            ..BrokerConfig::default()
        });
        let url = broker.start().await.unwrap().client_url(None);
        let conn = MeshConnection::connect(&url, ConnectOptions::new("alpha")).await.unwrap();
        let observer = MeshConnection::connect(&url, ConnectOptions::new("observer")).await.unwrap();
        let mut sub = observer.subscribe(subjects::PRESENCE).unwrap();
        observer.flush(Duration::from_secs(2)).await.unwrap();

        let catalog = Arc::new(AgentCatalog::new());
        catalog.register(AgentAdvert::new("reporter")).unwrap();
        let publisher = Arc::new(PresencePublisher::new(
            identity(),
            Arc::clone(&catalog),
            conn.clone(),
            Duration::from_secs(60),
        ));
        let shutdown = CancellationToken::new();
        let task = Arc::clone(&publisher).spawn(shutdown.clone()).unwrap();

        let first = next_presence(&mut sub).await;
        assert_eq!(first.station_id, "alpha");
        assert_eq!(first.agents, vec![AgentAdvert::new("reporter")]);

        catalog.register(AgentAdvert::new("planner")).unwrap();
        let mut changed = next_presence(&mut sub).await;
        while changed.agents.len() < 2 {
            changed = next_presence(&mut sub).await;
        }
        assert!(changed.sequence > first.sequence);

        shutdown.cancel();
        task.await.unwrap();
        let mut last = next_presence(&mut sub).await;
        while !last.leaving {
            last = next_presence(&mut sub).await;
        }
        assert!(last.agents.is_empty());

        conn.close().await;
        observer.close().await;
        broker.stop().await;
    }

    #[tokio::test]
    async fn sequence_increases_per_message() {
        let publisher = PresencePublisher {
            identity: identity(),
            catalog: Arc::new(AgentCatalog::new()),
            conn: MeshConnection::connect_lazy("ws://127.0.0.1:9", ConnectOptions::new("x"))
                .unwrap(),
            heartbeat: Duration::from_secs(1),
            sequence: AtomicU64::new(0),
        };
        let a = publisher.snapshot(false);
        let b = publisher.snapshot(true);
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert!(b.leaving);
        publisher.conn.close().await;
    }

    #[tokio::test]
    async fn announces_when_asked() {
        let (broker, url) = ephemeral_broker(0).await;
        let conn = MeshConnection::connect(&url, ConnectOptions::new("alpha")).await.unwrap();
        let observer = MeshConnection::connect(&url, ConnectOptions::new("observer")).await.unwrap();
        let mut sub = observer.subscribe(subjects::PRESENCE).unwrap();
        observer.flush(Duration::from_secs(2)).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = spawn_publisher(&conn, &shutdown);
        conn.flush(Duration::from_secs(2)).await.unwrap();
        let settled = drain_presence(&mut sub).await;
        assert!(settled > 0);

        observer.publish(subjects::PRESENCE_PROBE, &Value::Null).unwrap();
        let answer = next_presence(&mut sub).await;
        assert!(answer.sequence > settled);
        assert!(!answer.leaving);
        assert_eq!(answer.agents, vec![AgentAdvert::new("reporter")]);

        shutdown.cancel();
        task.await.unwrap();
        conn.close().await;
        observer.close().await;
        broker.stop().await;
    }

    #[tokio::test]
    async fn reannounces_and_asks_peers_after_broker_restart() {
        let (broker, url) = ephemeral_broker(0).await;
        let port = broker.handle().await.unwrap().client_addr().port();
        let options = ConnectOptions::new("alpha").with_backoff(BackoffConfig {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            ..BackoffConfig::default()
        });
        let conn = MeshConnection::connect(&url, options).await.unwrap();
        // Subscriptions on the publisher's own connection are replayed ahead of
        // anything it publishes after reconnecting.
        let mut presences = conn.subscribe(subjects::PRESENCE).unwrap();
        let mut requests = conn.subscribe(subjects::PRESENCE_PROBE).unwrap();
        conn.flush(Duration::from_secs(2)).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = spawn_publisher(&conn, &shutdown);
        let before = drain_presence(&mut presences).await;
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(100), requests.next()).await {}

        let mut state = conn.watch_state();
        broker.stop().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow_and_update() == ConnectionState::Connected {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let (revived, _) = ephemeral_broker(port).await;

        let after = next_presence(&mut presences).await;
        assert!(after.sequence > before, "{} <= {}", after.sequence, before);
        assert!(!after.leaving);
        let request = tokio::time::timeout(Duration::from_secs(5), requests.next())
            .await
            .expect("peers asked to announce after reconnect");
        assert!(request.is_some());

        shutdown.cancel();
        task.await.unwrap();
        conn.close().await;
        revived.stop().await;
    }
}
