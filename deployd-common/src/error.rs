pub const TASK_CANCELED_MESSAGE: &str = "runtime deploy task canceled";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    /// The task was superseded or canceled by its owner while being waited on.
    #[error("{}", task_canceled_message(run_id, reason))]
    TaskCanceled { run_id: String, reason: String },
    /// The lease was taken over by another reconciler before the result was stored.
    #[error("mark runtime deploy task {run_id} as {outcome}: lease lost")]
    LeaseLost {
        run_id: String,
        outcome: &'static str,
    },
    /// The surrounding run was cancelled (shutdown or lease loss).
    #[error("runtime deploy run cancelled")]
    Cancelled,
}

fn task_canceled_message(run_id: &str, reason: &str) -> String {
    let run_id = run_id.trim();
    let reason = reason.trim();
    match (run_id.is_empty(), reason.is_empty()) {
        (true, true) => TASK_CANCELED_MESSAGE.to_string(),
        (true, false) => format!("{TASK_CANCELED_MESSAGE}: {reason}"),
        (false, true) => format!("{TASK_CANCELED_MESSAGE} for run_id={run_id}"),
        (false, false) => format!("{TASK_CANCELED_MESSAGE} for run_id={run_id}: {reason}"),
    }
}

/// Whether any error in the chain is a canceled task.
pub fn is_task_canceled(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        matches!(
            e.downcast_ref::<DeployError>(),
            Some(DeployError::TaskCanceled { .. })
        )
    })
}

/// Whether any error in the chain comes from run cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<DeployError>(), Some(DeployError::Cancelled)))
}
