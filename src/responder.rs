//! Invocation responder: runs requests for locally hosted agents.
//!
//! Every request is acknowledged with `Accepted` as soon as it is received.
//! Admission is bounded: `workers` requests run at once, up to `queue_depth`
//! more wait in FIFO order, anything beyond that is rejected as overloaded.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResponderConfig;
use crate::engine::{AgentCatalog, AgentExecutor, ExecutionEvent, ExecutionRequest};
use crate::error::Result;
use crate::mesh::{MeshConnection, Message};
use crate::subjects;
use crate::types::{InvocationReply, InvocationRequest, RemoteError, RemoteErrorKind};

pub struct Responder {
    station_id: String,
    conn: MeshConnection,
    catalog: Arc<AgentCatalog>,
    executor: Arc<dyn AgentExecutor>,
    workers: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
}

/// Decrements the pending counter when a request leaves the responder.
struct PendingSlot(Arc<AtomicUsize>);

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Responder {
    pub fn new(
        station_id: impl Into<String>,
        conn: MeshConnection,
        catalog: Arc<AgentCatalog>,
        executor: Arc<dyn AgentExecutor>,
        config: &ResponderConfig,
    ) -> Self {
        let workers = config.workers.max(1);
        Self {
            station_id: station_id.into(),
            conn,
            catalog,
            executor,
            workers: Arc::new(Semaphore::new(workers)),
            pending: Arc::new(AtomicUsize::new(0)),
            capacity: workers + config.queue_depth,
        }
    }

    /// Requests currently running or queued.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn try_admit(&self) -> Option<PendingSlot> {
        let admitted = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        admitted.then(|| PendingSlot(Arc::clone(&self.pending)))
    }

    fn reply(&self, subject: &str, reply: &InvocationReply) {
        if let Err(e) = self.conn.publish(subject, reply) {
            debug!(
                "Reply for {} not delivered: {}",
                reply.correlation_id(),
                e
            );
        }
    }

    fn fail(&self, subject: &str, correlation_id: &str, kind: RemoteErrorKind, message: String) {
        self.reply(
            subject,
            &InvocationReply::Final {
                correlation_id: correlation_id.to_string(),
                station_id: self.station_id.clone(),
                output: String::new(),
                error: Some(RemoteError::new(kind, message)),
            },
        );
    }

    /// Subscribe to this station's exec subjects and serve requests until
    /// `shutdown`. Any-station subscriptions follow the catalog.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut direct = self
            .conn
            .subscribe(&subjects::exec_station_pattern(&self.station_id))?;
        let mut catalog = self.catalog.watch();
        let (any_tx, mut any_rx) = mpsc::unbounded_channel::<Message>();
        let mut any_subs: HashMap<String, CancellationToken> = HashMap::new();
        self.sync_any_subscriptions(&mut any_subs, &any_tx, &shutdown);

        Ok(tokio::spawn(async move {
            let mut direct_open = true;
            let mut catalog_open = true;

            info!(
                "Responder for station {} serving {} agents",
                self.station_id,
                self.catalog.len()
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = direct.next(), if direct_open => match msg {
                        Some(msg) => self.dispatch(msg),
                        None => direct_open = false,
                    },
                    Some(msg) = any_rx.recv() => self.dispatch(msg),
                    changed = catalog.changed(), if catalog_open => {
                        if changed.is_err() {
                            catalog_open = false;
                            continue;
                        }
                        self.sync_any_subscriptions(&mut any_subs, &any_tx, &shutdown);
                    }
                }
            }

            for (_, token) in any_subs.drain() {
                token.cancel();
            }
        }))
    }

    /// One queue-group subscription per hosted agent.
    fn sync_any_subscriptions(
        &self,
        subs: &mut HashMap<String, CancellationToken>,
        sink: &mpsc::UnboundedSender<Message>,
        shutdown: &CancellationToken,
    ) {
        let hosted: HashSet<String> = self.catalog.agents().into_iter().map(|a| a.name).collect();

        subs.retain(|name, token| {
            let keep = hosted.contains(name);
            if !keep {
                token.cancel();
            }
            keep
        });

        for name in hosted {
            if subs.contains_key(&name) {
                continue;
            }
            let mut sub = match self
                .conn
                .queue_subscribe(&subjects::exec_any(&name), &subjects::exec_any_group(&name))
            {
                Ok(sub) => sub,
                Err(e) => {
                    warn!("Could not subscribe to any-station requests for {}: {}", name, e);
                    continue;
                }
            };
            let token = shutdown.child_token();
            let stop = token.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        msg = sub.next() => match msg {
                            Some(msg) => {
                                if sink.send(msg).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
            subs.insert(name, token);
        }
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        let responder = Arc::clone(self);
        tokio::spawn(async move { responder.handle(msg).await });
    }

    /// Serve one request message.
    pub async fn handle(&self, msg: Message) {
        let request: InvocationRequest = match msg.decode() {
            Ok(request) => request,
            Err(e) => {
                let correlation_id = msg
                    .payload
                    .get("correlation_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let reply_to = msg
                    .reply
                    .clone()
                    .or_else(|| (!correlation_id.is_empty()).then(|| subjects::reply(&correlation_id)));
                match reply_to {
                    Some(subject) => self.fail(
                        &subject,
                        &correlation_id,
                        RemoteErrorKind::InvalidRequest,
                        format!("malformed request: {}", e),
                    ),
                    None => debug!("Dropping malformed request on {}: {}", msg.subject, e),
                }
                return;
            }
        };

        let reply_to = msg
            .reply
            .clone()
            .unwrap_or_else(|| subjects::reply(&request.correlation_id));
        let cid = request.correlation_id.clone();

        self.reply(
            &reply_to,
            &InvocationReply::Accepted {
                correlation_id: cid.clone(),
                station_id: self.station_id.clone(),
            },
        );

        if subjects::exec_agent(&msg.subject) != Some(request.agent_name.as_str()) {
            self.fail(
                &reply_to,
                &cid,
                RemoteErrorKind::InvalidRequest,
                format!(
                    "request for '{}' arrived on subject {}",
                    request.agent_name, msg.subject
                ),
            );
            return;
        }

        if !self.catalog.contains(&request.agent_name) {
            self.fail(
                &reply_to,
                &cid,
                RemoteErrorKind::AgentNotFound,
                format!(
                    "agent '{}' is not hosted on station {}",
                    request.agent_name, self.station_id
                ),
            );
            return;
        }

        let Some(_slot) = self.try_admit() else {
            warn!(
                "Rejecting {} for {}: {} requests pending",
                request.agent_name, request.caller_station_id, self.capacity
            );
            self.fail(
                &reply_to,
                &cid,
                RemoteErrorKind::Overloaded,
                format!("station {} is at capacity", self.station_id),
            );
            return;
        };

        let deadline = Duration::from_millis(request.timeout_ms);
        let started = tokio::time::Instant::now();

        let permit = match tokio::time::timeout(deadline, Arc::clone(&self.workers).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return,
            Err(_) => {
                debug!("Request {} expired while queued", cid);
                return;
            }
        };

        let remaining = deadline.saturating_sub(started.elapsed());
        let outcome = tokio::time::timeout(remaining, self.run(&reply_to, request, remaining)).await;
        drop(permit);

        if outcome.is_err() {
            debug!("Request {} ran past its deadline; abandoned", cid);
        }
    }

    async fn run(&self, reply_to: &str, request: InvocationRequest, deadline: Duration) {
        let cid = request.correlation_id.clone();
        let execution = ExecutionRequest {
            correlation_id: cid.clone(),
            agent_name: request.agent_name.clone(),
            caller_station_id: request.caller_station_id.clone(),
            payload: request.payload,
            deadline,
        };

        debug!(
            "Executing {} for station {} [{}]",
            execution.agent_name, execution.caller_station_id, cid
        );

        let (mut events, handle) = match self.executor.execute(execution).await {
            Ok(started) => started,
            Err(e) => {
                self.fail(reply_to, &cid, RemoteErrorKind::ExecutionFailed, e.to_string());
                return;
            }
        };

        // Abort the engine task if the deadline fires while we are streaming.
        let _abort = AbortOnDrop(handle);
        let mut seq: u64 = 0;

        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            match event {
                ExecutionEvent::Progress { content } => {
                    seq += 1;
                    self.reply(
                        reply_to,
                        &InvocationReply::Partial {
                            correlation_id: cid.clone(),
                            seq,
                            chunk: content,
                        },
                    );
                }
                ExecutionEvent::Completed { output } => {
                    self.reply(
                        reply_to,
                        &InvocationReply::Final {
                            correlation_id: cid.clone(),
                            station_id: self.station_id.clone(),
                            output,
                            error: None,
                        },
                    );
                }
                ExecutionEvent::Failed { message } => {
                    self.fail(reply_to, &cid, RemoteErrorKind::ExecutionFailed, message);
                }
            }
            if terminal {
                return;
            }
        }

        self.fail(
            reply_to,
            &cid,
            RemoteErrorKind::ExecutionFailed,
            "engine finished without a result".to_string(),
        );
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EmbeddedBroker;
    use crate::config::BrokerConfig;
    use crate::engine::mock::{BrokenExecutor, ScriptedExecutor};
    use crate::mesh::{ConnectOptions, Subscription};
    use crate::types::AgentAdvert;
    use serde_json::json;

    struct Harness {
        broker: EmbeddedBroker,
        station: MeshConnection,
        caller: MeshConnection,
        shutdown: CancellationToken,
        responder: Arc<Responder>,
    }

    async fn harness(executor: Arc<dyn AgentExecutor>, config: ResponderConfig) -> Harness {
        let broker = EmbeddedBroker::new(BrokerConfig {
            port: 0,
            monitor_port: 0,
            ..BrokerConfig::default()
        });
        let url = broker.start().await.unwrap().client_url(None);
        let station = MeshConnection::connect(&url, ConnectOptions::new("beta")).await.unwrap();
        let caller = MeshConnection::connect(&url, ConnectOptions::new("alpha")).await.unwrap();

        let catalog = Arc::new(AgentCatalog::new());
        catalog.register(AgentAdvert::new("reporter")).unwrap();
        let responder = Arc::new(Responder::new(
            "beta",
            station.clone(),
            catalog,
            executor,
            &config,
        ));
        let shutdown = CancellationToken::new();
        Arc::clone(&responder).spawn(shutdown.clone()).unwrap();
        station.flush(Duration::from_secs(2)).await.unwrap();

        Harness {
            broker,
            station,
            caller,
            shutdown,
            responder,
        }
    }

    impl Harness {
        fn send(&self, subject: &str, agent: &str, cid: &str) -> Subscription {
            let reply = subjects::reply(cid);
            let sub = self.caller.subscribe(&reply).unwrap();
            let request = InvocationRequest {
                correlation_id: cid.into(),
                agent_name: agent.into(),
                target_station_id: Some("beta".into()),
                caller_station_id: "alpha".into(),
                payload: json!({"task": "weekly"}),
                timeout_ms: 5_000,
            };
            self.caller
                .publish_with_reply(subject, Some(&reply), &request)
                .unwrap();
            sub
        }

        async fn finish(self) {
            self.shutdown.cancel();
            self.caller.close().await;
            self.station.close().await;
            self.broker.stop().await;
        }
    }

    async fn collect_until_final(sub: &mut Subscription) -> Vec<InvocationReply> {
        let mut replies = Vec::new();
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(3), sub.next())
                .await
                .expect("reply within timeout")
                .expect("subscription open");
            let reply: InvocationReply = msg.decode().unwrap();
            let done = matches!(reply, InvocationReply::Final { .. });
            replies.push(reply);
            if done {
                return replies;
            }
        }
    }

    fn final_error(reply: &InvocationReply) -> Option<RemoteErrorKind> {
        match reply {
            InvocationReply::Final { error, .. } => error.as_ref().map(|e| e.kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn acknowledges_streams_and_finishes() {
        let executor = ScriptedExecutor::completing("report ready").with_chunks(&["one ", "two "]);
        let h = harness(Arc::new(executor), ResponderConfig::default()).await;

        let mut sub = h.send(&subjects::exec("beta", "reporter"), "reporter", "c-1");
        let replies = collect_until_final(&mut sub).await;

        assert!(matches!(replies[0], InvocationReply::Accepted { .. }));
        assert!(matches!(replies[1], InvocationReply::Partial { seq: 1, .. }));
        assert!(matches!(replies[2], InvocationReply::Partial { seq: 2, .. }));
        assert!(matches!(
            &replies[3],
            InvocationReply::Final { output, error: None, .. } if output == "report ready"
        ));
        h.finish().await;
    }

    #[tokio::test]
    async fn unknown_local_agent_is_reported() {
        let h = harness(Arc::new(ScriptedExecutor::completing("x")), ResponderConfig::default()).await;
        let mut sub = h.send(&subjects::exec("beta", "planner"), "planner", "c-2");
        let replies = collect_until_final(&mut sub).await;
        assert!(matches!(replies[0], InvocationReply::Accepted { .. }));
        assert_eq!(final_error(replies.last().unwrap()), Some(RemoteErrorKind::AgentNotFound));
        h.finish().await;
    }

    #[tokio::test]
    async fn engine_failures_become_execution_failed() {
        let h = harness(Arc::new(ScriptedExecutor::failing("tool crashed")), ResponderConfig::default()).await;
        let mut sub = h.send(&subjects::exec("beta", "reporter"), "reporter", "c-3");
        let replies = collect_until_final(&mut sub).await;
        assert_eq!(final_error(replies.last().unwrap()), Some(RemoteErrorKind::ExecutionFailed));
        h.finish().await;

        let h = harness(Arc::new(BrokenExecutor), ResponderConfig::default()).await;
        let mut sub = h.send(&subjects::exec("beta", "reporter"), "reporter", "c-4");
        let replies = collect_until_final(&mut sub).await;
        assert_eq!(final_error(replies.last().unwrap()), Some(RemoteErrorKind::ExecutionFailed));
        h.finish().await;
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let h = harness(Arc::new(ScriptedExecutor::completing("x")), ResponderConfig::default()).await;
        let mut sub = h.caller.subscribe(&subjects::reply("c-5")).unwrap();
        h.caller
            .publish(
                &subjects::exec("beta", "reporter"),
                &json!({"correlation_id": "c-5", "agent_name": 42}),
            )
            .unwrap();
        let replies = collect_until_final(&mut sub).await;
        assert_eq!(final_error(&replies[0]), Some(RemoteErrorKind::InvalidRequest));
        h.finish().await;
    }

    #[tokio::test]
    async fn excess_requests_are_rejected_as_overloaded() {
        let executor = ScriptedExecutor::completing("slow").with_delay(Duration::from_millis(500));
        let config = ResponderConfig {
            workers: 1,
            queue_depth: 1,
        };
        let h = harness(Arc::new(executor), config).await;

        let mut subs: Vec<Subscription> = (0..3)
            .map(|i| h.send(&subjects::exec("beta", "reporter"), "reporter", &format!("c-{}", i)))
            .collect();

        let mut outcomes = Vec::new();
        for sub in subs.iter_mut() {
            let replies = collect_until_final(sub).await;
            outcomes.push(final_error(replies.last().unwrap()));
        }
        let overloaded = outcomes
            .iter()
            .filter(|o| **o == Some(RemoteErrorKind::Overloaded))
            .count();
        let completed = outcomes.iter().filter(|o| o.is_none()).count();
        assert_eq!(overloaded, 1, "{:?}", outcomes);
        assert_eq!(completed, 2, "{:?}", outcomes);
        assert_eq!(h.responder.pending(), 0);
        h.finish().await;
    }

    #[tokio::test]
    async fn serves_any_station_requests() {
        let h = harness(Arc::new(ScriptedExecutor::completing("any ok")), ResponderConfig::default()).await;
        let mut sub = h.send(&subjects::exec_any("reporter"), "reporter", "c-any");
        let replies = collect_until_final(&mut sub).await;
        assert!(matches!(
            replies.last().unwrap(),
            InvocationReply::Final { output, station_id, .. } if output == "any ok" && station_id == "beta"
        ));
        h.finish().await;
    }
}
