//! Storage abstractions for tasks, branches and commits.
//!
//! Implementations live in the stores crate: an in-memory store for
//! development and testing, a filesystem store (one log file per branch) and
//! a Postgres store. All three sit behind [`CommitStore`] and must be
//! interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::tools::Namespace;
use crate::types::Commit;

/// Name of the branch every task starts on.
pub const MAIN_BRANCH: &str = "main";

/// Store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Task is locked: {0}")]
    Locked(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Task life-cycle status, persisted alongside metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Task metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub goal: String,
    pub namespace: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(goal: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            goal: goal.into(),
            namespace: namespace.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Branch metadata: name, head and fork ancestry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    /// Hash of the newest commit reachable on this branch.
    pub head: String,
    pub created_at: DateTime<Utc>,
    /// Branch and commit this branch was forked from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<ForkPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkPoint {
    pub branch: String,
    pub commit_hash: String,
}

/// An acquired per-task advisory lock. Explicitly released; dropping a lease
/// without releasing leaves the lock to expire with the owning store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLease {
    pub task_id: Uuid,
    pub lease_id: Uuid,
}

/// Append-only, content-addressed storage of commits arranged as branches.
///
/// Strong consistency within a single task: `head` after a successful
/// `append` returns exactly the appended commit.
#[async_trait]
pub trait CommitStore: Send + Sync {
    // ---- tasks ----

    async fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError>;
    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StoreError>;
    async fn list_tasks(&self, limit: usize, offset: usize) -> Result<Vec<TaskRecord>, StoreError>;
    async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError>;

    // ---- branches & commits ----

    /// Newest commit on a branch, or `None` for a branch with no commits.
    async fn head(&self, task_id: Uuid, branch: &str) -> Result<Option<Commit>, StoreError>;

    /// Append a commit. The commit's `parent_hash` must equal the current
    /// head (or be `None` for the first commit on `main`).
    async fn append(&self, task_id: Uuid, commit: Commit) -> Result<(), StoreError>;

    /// Create `new_branch` whose history coincides with `from_branch` up to
    /// `at_commit`. No new commit is written: the fork's head equals
    /// `at_commit`.
    async fn fork(
        &self,
        task_id: Uuid,
        from_branch: &str,
        at_commit: &str,
        new_branch: &str,
    ) -> Result<BranchInfo, StoreError>;

    async fn list_branches(&self, task_id: Uuid) -> Result<Vec<BranchInfo>, StoreError>;
    async fn list_commits(&self, task_id: Uuid, branch: &str) -> Result<Vec<Commit>, StoreError>;
    async fn get_commit(&self, task_id: Uuid, hash: &str) -> Result<Option<Commit>, StoreError>;

    /// Delete a branch. Rejected for `main`.
    async fn delete_branch(&self, task_id: Uuid, branch: &str) -> Result<(), StoreError>;

    async fn active_branch(&self, task_id: Uuid) -> Result<String, StoreError>;
    async fn set_active_branch(&self, task_id: Uuid, branch: &str) -> Result<(), StoreError>;

    // ---- namespaces ----

    async fn save_namespace(&self, namespace: &Namespace) -> Result<(), StoreError>;
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError>;
    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError>;
    async fn delete_namespace(&self, name: &str) -> Result<bool, StoreError>;

    // ---- per-task advisory lock ----

    /// Acquire the task's lock. Fails fast with [`StoreError::Locked`] when
    /// another worker holds it.
    async fn try_lock_task(&self, task_id: Uuid) -> Result<TaskLease, StoreError>;

    /// Release a previously acquired lease. Releasing a stale lease is a
    /// no-op.
    async fn unlock_task(&self, lease: &TaskLease) -> Result<(), StoreError>;
}
