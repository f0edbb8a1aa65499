use anyhow::Error;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{AgentExecutor, ExecutionEvent, ExecutionRequest};

/// Executor that streams the task back word by word.
///
/// Used by `lattice-station serve --echo <agent>` to smoke-test a mesh
/// without a real engine attached.
#[derive(Debug, Default, Clone)]
pub struct EchoExecutor;

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<(mpsc::Receiver<ExecutionEvent>, JoinHandle<()>), Error> {
        let task = match request.task() {
            Some(task) => task.to_string(),
            None => request.payload.to_string(),
        };
        let (tx, rx) = mpsc::channel(32);

        let handle = tokio::spawn(async move {
            for word in task.split_whitespace() {
                let event = ExecutionEvent::Progress {
                    content: format!("{} ", word),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = tx
                .send(ExecutionEvent::Completed {
                    output: format!("{}: {}", request.agent_name, task),
                })
                .await;
        });

        Ok((rx, handle))
    }
}
