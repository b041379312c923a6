//! # Tasks
//!
//! Durable execution of long or fallible operations — chiefly recursive
//! record pruning. A task is registered with the task store before it
//! runs, its lease is extended while it runs, and it is deleted on
//! success. A crash leaves the task in place; [`resume`] re-dispatches
//! expired tasks at startup. Task payloads are the sole durable state, so
//! task implementations must be idempotent given identical inputs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

use crate::provider::{Provider, TaskStore};
use crate::records::Delete;
use crate::Result;

/// The lease granted to an executing task, in seconds. A task whose lease
/// lapses is considered abandoned and is re-dispatched by [`resume`].
pub const LEASE_SECS: u64 = 120;

/// The number of expired tasks grabbed per resume sweep.
const RESUME_BATCH: u64 = 100;

/// A durable, resumable task.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResumableTask {
    /// The task's unique identifier.
    pub id: String,

    /// The task payload.
    pub task: TaskType,
}

/// The operations that run as resumable tasks.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum TaskType {
    /// Delete a record, optionally pruning its descendants.
    RecordsDelete(Delete),
}

/// A task executable by the task manager. Implementations must be
/// idempotent: a resumed task re-runs from the beginning.
pub(crate) trait Task {
    /// Run the task to completion.
    fn run(&self, owner: &str, provider: &impl Provider)
    -> impl Future<Output = Result<()>> + Send;
}

/// Run an operation as a resumable task: register it, execute it with a
/// lease heartbeat, and delete it on success. On failure the task is left
/// registered for retry.
///
/// # Errors
///
/// Surfaces the task's error, leaving the task registered.
pub(crate) async fn run(owner: &str, task: TaskType, provider: &impl Provider) -> Result<()> {
    let resumable = ResumableTask {
        id: Ulid::new().to_string(),
        task,
    };
    TaskStore::register(provider, owner, &resumable, LEASE_SECS).await?;

    execute(owner, &resumable, provider).await?;

    TaskStore::delete(provider, owner, &resumable.id).await?;
    Ok(())
}

// Execute the task while periodically extending its lease so that a
// live-but-slow task is not re-grabbed by a peer.
async fn execute(owner: &str, resumable: &ResumableTask, provider: &impl Provider) -> Result<()> {
    let task_fut = match &resumable.task {
        TaskType::RecordsDelete(delete) => delete.run(owner, provider),
    };
    tokio::pin!(task_fut);

    loop {
        tokio::select! {
            result = &mut task_fut => return result,
            () = tokio::time::sleep(Duration::from_secs(LEASE_SECS / 2)) => {
                TaskStore::extend(provider, owner, &resumable.id, LEASE_SECS).await?;
            }
        }
    }
}

/// Sweep the task store for tasks whose lease has expired and re-run
/// them. Called on web node startup for each tenant.
///
/// # Errors
///
/// Surfaces task store failures. Individual task failures are logged and
/// the task is left registered for a later retry.
pub async fn resume(owner: &str, provider: &impl Provider) -> Result<()> {
    loop {
        let tasks = TaskStore::grab(provider, owner, RESUME_BATCH).await?;
        if tasks.is_empty() {
            return Ok(());
        }

        for task in tasks {
            if let Err(e) = execute(owner, &task, provider).await {
                warn!(task_id = %task.id, "resumable task failed: {e}");
                continue;
            }
            TaskStore::delete(provider, owner, &task.id).await?;
        }
    }
}
