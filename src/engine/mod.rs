//! Seam between the lattice and the local agent execution engine.
//!
//! The engine itself (turn loop, tools, models) lives outside this crate. A
//! station only needs something that can run a named agent on a payload and
//! stream back progress, which is what [`AgentExecutor`] describes.

pub mod catalog;
pub mod echo;
pub mod events;

use std::time::Duration;

use anyhow::Error;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use events::ExecutionEvent;

pub use catalog::AgentCatalog;
pub use echo::EchoExecutor;

/// One request handed to the engine by the responder.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub correlation_id: String,
    pub agent_name: String,
    pub caller_station_id: String,
    pub payload: Value,
    /// Time the caller is willing to wait. Work past this point is wasted.
    pub deadline: Duration,
}

impl ExecutionRequest {
    /// The `task` field of the payload, or the payload itself when it is a
    /// plain string.
    pub fn task(&self) -> Option<&str> {
        match &self.payload {
            Value::String(task) => Some(task),
            other => other.get("task").and_then(Value::as_str),
        }
    }
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Start running `request`. Events arrive on the returned channel; the
    /// last one is `Completed` or `Failed`. The join handle finishes when the
    /// engine is done with the request.
    async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<(mpsc::Receiver<ExecutionEvent>, JoinHandle<()>), Error>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Error;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use super::{AgentExecutor, ExecutionEvent, ExecutionRequest};

    /// Executor with a fixed script: emit `chunks`, wait `delay`, then finish
    /// with `outcome`.
    pub struct ScriptedExecutor {
        pub chunks: Vec<String>,
        pub delay: Duration,
        pub outcome: Result<String, String>,
        pub started: Arc<AtomicUsize>,
    }

    impl ScriptedExecutor {
        pub fn completing(output: &str) -> Self {
            Self {
                chunks: Vec::new(),
                delay: Duration::ZERO,
                outcome: Ok(output.to_string()),
                started: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                outcome: Err(message.to_string()),
                ..Self::completing("")
            }
        }

        pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
            self.chunks = chunks.iter().map(|c| c.to_string()).collect();
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl AgentExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            request: ExecutionRequest,
        ) -> Result<(mpsc::Receiver<ExecutionEvent>, JoinHandle<()>), Error> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            let chunks = self.chunks.clone();
            let delay = self.delay;
            let outcome = self.outcome.clone();
            let handle = tokio::spawn(async move {
                for content in chunks {
                    let _ = tx.send(ExecutionEvent::Progress { content }).await;
                }
                tokio::time::sleep(delay).await;
                let event = match outcome {
                    Ok(output) if output.is_empty() => ExecutionEvent::Completed {
                        output: format!("{} done", request.agent_name),
                    },
                    Ok(output) => ExecutionEvent::Completed { output },
                    Err(message) => ExecutionEvent::Failed { message },
                };
                let _ = tx.send(event).await;
            });
            Ok((rx, handle))
        }
    }

    /// Executor whose `execute` call itself fails.
    pub struct BrokenExecutor;

    #[async_trait]
    impl AgentExecutor for BrokenExecutor {
        async fn execute(
            &self,
            _request: ExecutionRequest,
        ) -> Result<(mpsc::Receiver<ExecutionEvent>, JoinHandle<()>), Error> {
            Err(anyhow::anyhow!("engine unavailable"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(payload: Value) -> ExecutionRequest {
        ExecutionRequest {
            correlation_id: "c1".into(),
            agent_name: "reporter".into(),
            caller_station_id: "alpha".into(),
            payload,
            deadline: Duration::from_secs(1),
        }
    }

    #[test]
    fn task_accepts_object_or_string_payloads() {
        assert_eq!(request(json!({"task": "summarize"})).task(), Some("summarize"));
        assert_eq!(request(json!("summarize")).task(), Some("summarize"));
        assert_eq!(request(json!({"other": 1})).task(), None);
    }
}
