/// Engine-agnostic execution events.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Incremental output, forwarded to the caller as a partial result.
    Progress { content: String },
    /// Execution finished successfully.
    Completed { output: String },
    /// Execution failed.
    Failed { message: String },
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}
