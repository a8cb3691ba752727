//! Background task runner.
//!
//! A task is a name plus JSON arguments, submitted to a durable queue and
//! executed by workers off the request path. Delivery is at-least-once,
//! so every handler is safe to re-run: pools upsert, protocols insert-once.

pub mod handler;
pub mod queue;
pub mod scheduler;
pub mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::types::YieldError;

// ---------------------------------------------------------------------------
// Task model
// ---------------------------------------------------------------------------

/// Units of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "snake_case")]
pub enum Task {
    /// Fetch one protocol and store it if it is not known yet.
    PullProtocol { slug: String },
    /// Fetch up to `limit` pools, score them and persist the resolvable ones.
    PullPools { limit: usize },
    /// Build and store a recommendation of one pool for one user.
    BuildRecommendation { pool_id: String, user_id: String },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::PullProtocol { .. } => "pull_protocol",
            Task::PullPools { .. } => "pull_pools",
            Task::BuildRecommendation { .. } => "build_recommendation",
        }
    }

    /// Split into the `(name, args)` pair stored by the queue.
    pub fn to_parts(&self) -> Result<(String, serde_json::Value), YieldError> {
        let mut value = serde_json::to_value(self)?;
        let args = value
            .get_mut("args")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);
        Ok((self.name().to_string(), args))
    }

    /// Rebuild from a stored `(name, args)` pair.
    pub fn from_parts(name: &str, args: serde_json::Value) -> Result<Self, YieldError> {
        serde_json::from_value(serde_json::json!({ "name": name, "args": args }))
            .map_err(|e| YieldError::Storage(format!("undecodable task {name}: {e}")))
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::PullProtocol { slug } => write!(f, "pull_protocol({slug})"),
            Task::PullPools { limit } => write!(f, "pull_pools({limit})"),
            Task::BuildRecommendation { pool_id, user_id } => {
                write!(f, "build_recommendation({pool_id}, {user_id})")
            }
        }
    }
}

/// Lifecycle of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = YieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(YieldError::Storage(format!("unknown task status: {other}"))),
        }
    }
}

/// A claimed task, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
    pub id: String,
    pub task: Task,
    /// Includes the current attempt.
    pub attempts: u32,
    pub max_attempts: u32,
}

/// What happened to a failed task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailOutcome {
    /// Rescheduled after the given delay.
    Retrying { delay: Duration },
    /// Out of attempts, or not retryable.
    Dead,
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Queue trait
// ---------------------------------------------------------------------------

/// Durable task queue with at-least-once delivery.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task for immediate execution. Returns its id.
    async fn submit(&self, task: &Task) -> Result<String, YieldError>;

    /// Atomically take the oldest due pending task, if any.
    async fn claim(&self) -> Result<Option<TaskEnvelope>, YieldError>;

    async fn complete(&self, id: &str) -> Result<(), YieldError>;

    /// Record a failure; retryable failures with attempts left are rescheduled.
    async fn fail(&self, id: &str, error: &str, retryable: bool) -> Result<FailOutcome, YieldError>;

    /// Return tasks stuck in `running` for longer than `older_than` to pending.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, YieldError>;

    async fn status(&self, id: &str) -> Result<Option<TaskStatus>, YieldError>;

    async fn stats(&self) -> Result<QueueStats, YieldError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_parts() {
        let task = Task::BuildRecommendation {
            pool_id: "p-1".into(),
            user_id: "u-9".into(),
        };
        let (name, args) = task.to_parts().unwrap();
        assert_eq!(name, "build_recommendation");
        assert_eq!(args, serde_json::json!({"pool_id": "p-1", "user_id": "u-9"}));
        assert_eq!(Task::from_parts(&name, args).unwrap(), task);
    }

    #[test]
    fn test_task_names() {
        assert_eq!(Task::PullPools { limit: 10 }.name(), "pull_pools");
        assert_eq!(Task::PullProtocol { slug: "lido".into() }.name(), "pull_protocol");
        assert_eq!(Task::PullPools { limit: 3 }.to_string(), "pull_pools(3)");
    }

    #[test]
    fn test_unknown_task_rejected() {
        assert!(Task::from_parts("launch_missiles", serde_json::json!({})).is_err());
        assert!(Task::from_parts("pull_pools", serde_json::json!({"limit": "ten"})).is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for s in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Done, TaskStatus::Failed] {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
        assert!("zombie".parse::<TaskStatus>().is_err());
    }
}
