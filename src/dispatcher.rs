//! Remote invocation: send a request to the station hosting an agent and
//! stream back what it replies.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RoutingConfig;
use crate::directory::Directory;
use crate::error::{LatticeError, Result};
use crate::mesh::MeshConnection;
use crate::subjects;
use crate::types::{InvocationReply, InvocationRequest, InvocationResult, RemoteErrorKind};
use crate::util::deadline_after;

/// Per-call options for [`Dispatcher::exec`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Overall deadline. Defaults to the routing timeout.
    pub timeout: Option<Duration>,
    /// Run on this station only. It must currently host the agent.
    pub station: Option<String>,
    /// Let the broker pick any hosting station through the agent's queue
    /// group instead of addressing the best directory candidate.
    pub load_balanced: bool,
}

impl ExecOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_station(mut self, station_id: impl Into<String>) -> Self {
        self.station = Some(station_id.into());
        self
    }

    pub fn load_balanced(mut self) -> Self {
        self.load_balanced = true;
        self
    }
}

pub struct Dispatcher {
    station_id: String,
    conn: MeshConnection,
    directory: Arc<Directory>,
    routing: RoutingConfig,
}

impl Dispatcher {
    pub fn new(
        station_id: impl Into<String>,
        conn: MeshConnection,
        directory: Arc<Directory>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            station_id: station_id.into(),
            conn,
            directory,
            routing,
        }
    }

    /// Invoke `agent_name` on the best station hosting it.
    ///
    /// The reply subscription is in place before the request is published, so
    /// nothing the responder sends is missed even if the returned stream is
    /// polled late. The deadline starts now, not at first poll.
    ///
    /// # Errors
    ///
    /// `LatticeError::AgentNotFound` when no live station hosts the agent (or
    /// the pinned station does not), `LatticeError::NotConnected` when the
    /// request cannot be sent. Failures after that point arrive as the
    /// terminal element of the stream.
    pub fn exec(&self, agent_name: &str, payload: Value, options: ExecOptions) -> Result<Invocation> {
        let timeout = options.timeout.unwrap_or(self.routing.timeout);
        let records = self.directory.resolve_records(agent_name)?;

        let target = match options.station.as_deref() {
            Some(station) => records
                .into_iter()
                .find(|r| r.station_id == station)
                .ok_or_else(|| LatticeError::agent_not_found(agent_name))?,
            None => records
                .into_iter()
                .next()
                .ok_or_else(|| LatticeError::agent_not_found(agent_name))?,
        };

        let balanced = options.load_balanced && options.station.is_none();
        let (subject, station_id) = if balanced {
            (subjects::exec_any(agent_name), None)
        } else {
            (
                subjects::exec(&target.station_id, agent_name),
                Some(target.station_id.clone()),
            )
        };

        let correlation_id = Uuid::new_v4().to_string();
        let reply_subject = subjects::reply(&correlation_id);
        let replies = self.conn.subscribe(&reply_subject)?;

        let request = InvocationRequest {
            correlation_id: correlation_id.clone(),
            agent_name: agent_name.to_string(),
            target_station_id: station_id.clone(),
            caller_station_id: self.station_id.clone(),
            payload,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        self.conn
            .publish_with_reply(&subject, Some(&reply_subject), &request)?;

        match &station_id {
            Some(id) => info!(
                "Dispatched {} to station {} ({}) [{}]",
                agent_name, target.station_name, id, correlation_id
            ),
            None => info!(
                "Dispatched {} to any hosting station [{}]",
                agent_name, correlation_id
            ),
        }

        let stream = reply_stream(
            replies,
            correlation_id.clone(),
            station_id.clone().unwrap_or_else(|| subject.clone()),
            timeout,
            self.routing.liveness_window,
        );

        Ok(Invocation {
            correlation_id,
            agent_name: agent_name.to_string(),
            station_id,
            stream: Box::pin(stream),
        })
    }
}

fn reply_stream(
    mut replies: crate::mesh::Subscription,
    correlation_id: String,
    station_id: String,
    timeout: Duration,
    liveness_window: Duration,
) -> impl Stream<Item = Result<InvocationResult>> + Send {
    let started = Instant::now();
    let deadline = deadline_after(started, timeout);
    let ack_deadline = deadline_after(started, liveness_window.min(timeout));
    let liveness_applies = liveness_window < timeout;

    async_stream::stream! {
        let mut accepted = false;
        let mut seen_partials: HashSet<u64> = HashSet::new();

        loop {
            let wait_until = if accepted { deadline } else { ack_deadline };
            let next = tokio::time::timeout_at(wait_until, replies.next()).await;

            let msg = match next {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    yield Err(LatticeError::Closed);
                    break;
                }
                Err(_) if !accepted && liveness_applies => {
                    yield Err(LatticeError::StationUnreachable {
                        station_id: station_id.clone(),
                        window: liveness_window,
                    });
                    break;
                }
                Err(_) => {
                    yield Err(LatticeError::Timeout(timeout));
                    break;
                }
            };

            let reply = match msg.decode::<InvocationReply>() {
                Ok(reply) if reply.correlation_id() == correlation_id => reply,
                Ok(other) => {
                    debug!("Dropping reply for foreign correlation id {}", other.correlation_id());
                    continue;
                }
                Err(e) => {
                    debug!("Dropping malformed reply: {}", e);
                    continue;
                }
            };

            match reply {
                InvocationReply::Accepted { .. } => accepted = true,
                InvocationReply::Partial { correlation_id, seq, chunk } => {
                    accepted = true;
                    if seen_partials.insert(seq) {
                        yield Ok(InvocationResult::Partial { correlation_id, seq, chunk });
                    }
                }
                InvocationReply::Final { correlation_id, station_id, output, error } => {
                    yield Ok(InvocationResult::Final { correlation_id, station_id, output, error });
                    break;
                }
            }
        }
    }
}

/// A running remote invocation.
///
/// Yields partial results followed by exactly one terminal element: a
/// `Final` result or an error. Dropping it unsubscribes from the reply
/// subject; the remote station is not told to stop.
pub struct Invocation {
    correlation_id: String,
    agent_name: String,
    station_id: Option<String>,
    stream: Pin<Box<dyn Stream<Item = Result<InvocationResult>> + Send>>,
}

impl Invocation {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Station the request was addressed to. `None` for load-balanced calls.
    pub fn station_id(&self) -> Option<&str> {
        self.station_id.as_deref()
    }

    /// Stop listening for replies. The reply subscription is released; later
    /// replies for this correlation id are dropped by the broker.
    pub fn cancel(self) {
        debug!("Invocation {} cancelled", self.correlation_id);
    }

    /// Drain the invocation and return the final output.
    ///
    /// Remote failures map onto the error taxonomy: `overloaded` becomes
    /// `Overloaded`, `agent_not_found` becomes `AgentNotFound`, and so on.
    pub async fn wait(mut self) -> Result<String> {
        while let Some(item) = self.stream.next().await {
            match item? {
                InvocationResult::Partial { .. } => continue,
                InvocationResult::Final {
                    station_id,
                    output,
                    error,
                    ..
                } => {
                    return match error {
                        None => Ok(output),
                        Some(error) => Err(match error.kind {
                            RemoteErrorKind::Overloaded => LatticeError::Overloaded { station_id },
                            RemoteErrorKind::AgentNotFound => {
                                LatticeError::agent_not_found(self.agent_name.clone())
                            }
                            RemoteErrorKind::ExecutionFailed => LatticeError::Execution(error.message),
                            RemoteErrorKind::InvalidRequest => {
                                LatticeError::InvalidRequest(error.message)
                            }
                        }),
                    };
                }
            }
        }
        Err(LatticeError::Closed)
    }
}

impl Stream for Invocation {
    type Item = Result<InvocationResult>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}
