//! In-memory commit store for development and testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use planvm_core::store::{
    BranchInfo, CommitStore, ForkPoint, StoreError, TaskLease, TaskRecord, TaskStatus, MAIN_BRANCH,
};
use planvm_core::tools::Namespace;
use planvm_core::types::Commit;

#[derive(Debug, Clone)]
struct BranchState {
    info: BranchInfo,
    commits: Vec<Commit>,
}

#[derive(Debug, Clone)]
struct TaskState {
    record: TaskRecord,
    branches: BTreeMap<String, BranchState>,
    active_branch: String,
}

/// In-memory implementation. Forks copy the ancestor history; the
/// filesystem and Postgres stores share it structurally instead.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, TaskState>>,
    namespaces: RwLock<BTreeMap<String, Namespace>>,
    locks: RwLock<HashMap<Uuid, Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned(e: impl std::fmt::Display) -> StoreError {
        StoreError::Internal(e.to_string())
    }
}

fn empty_branch(name: &str, forked_from: Option<ForkPoint>) -> BranchState {
    BranchState {
        info: BranchInfo {
            name: name.to_string(),
            head: String::new(),
            created_at: Utc::now(),
            forked_from,
        },
        commits: Vec::new(),
    }
}

#[async_trait]
impl CommitStore for MemoryStore {
    async fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(Self::poisoned)?;
        if tasks.contains_key(&task.task_id) {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        let mut branches = BTreeMap::new();
        branches.insert(MAIN_BRANCH.to_string(), empty_branch(MAIN_BRANCH, None));
        tasks.insert(
            task.task_id,
            TaskState {
                record: task.clone(),
                branches,
                active_branch: MAIN_BRANCH.to_string(),
            },
        );
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let tasks = self.tasks.read().map_err(Self::poisoned)?;
        Ok(tasks.get(&task_id).map(|t| t.record.clone()))
    }

    async fn list_tasks(&self, limit: usize, offset: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.tasks.read().map_err(Self::poisoned)?;
        let mut records: Vec<TaskRecord> = tasks.values().map(|t| t.record.clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(Self::poisoned)?;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        task.record.status = status;
        Ok(())
    }

    async fn head(&self, task_id: Uuid, branch: &str) -> Result<Option<Commit>, StoreError> {
        let tasks = self.tasks.read().map_err(Self::poisoned)?;
        let task = tasks
            .get(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        let branch = task
            .branches
            .get(branch)
            .ok_or_else(|| StoreError::NotFound(format!("branch {}", branch)))?;
        Ok(branch.commits.last().cloned())
    }

    async fn append(&self, task_id: Uuid, commit: Commit) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(Self::poisoned)?;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        let branch = task
            .branches
            .get_mut(&commit.branch)
            .ok_or_else(|| StoreError::NotFound(format!("branch {}", commit.branch)))?;

        let expected_parent = branch.commits.last().map(|c| c.commit_hash.clone());
        if commit.parent_hash != expected_parent {
            return Err(StoreError::Conflict(format!(
                "commit parent {:?} does not match branch head {:?}",
                commit.parent_hash, expected_parent
            )));
        }
        branch.info.head = commit.commit_hash.clone();
        branch.commits.push(commit);
        Ok(())
    }

    async fn fork(
        &self,
        task_id: Uuid,
        from_branch: &str,
        at_commit: &str,
        new_branch: &str,
    ) -> Result<BranchInfo, StoreError> {
        let mut tasks = self.tasks.write().map_err(Self::poisoned)?;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        if task.branches.contains_key(new_branch) {
            return Err(StoreError::Conflict(format!(
                "branch {} already exists",
                new_branch
            )));
        }
        let origin = task
            .branches
            .get(from_branch)
            .ok_or_else(|| StoreError::NotFound(format!("branch {}", from_branch)))?;
        let fork_index = origin
            .commits
            .iter()
            .position(|c| c.commit_hash == at_commit)
            .ok_or_else(|| {
                StoreError::NotFound(format!("commit {} on branch {}", at_commit, from_branch))
            })?;

        let ancestry: Vec<Commit> = origin.commits[..=fork_index].to_vec();
        let info = BranchInfo {
            name: new_branch.to_string(),
            head: at_commit.to_string(),
            created_at: Utc::now(),
            forked_from: Some(ForkPoint {
                branch: from_branch.to_string(),
                commit_hash: at_commit.to_string(),
            }),
        };
        task.branches.insert(
            new_branch.to_string(),
            BranchState {
                info: info.clone(),
                commits: ancestry,
            },
        );
        Ok(info)
    }

    async fn list_branches(&self, task_id: Uuid) -> Result<Vec<BranchInfo>, StoreError> {
        let tasks = self.tasks.read().map_err(Self::poisoned)?;
        let task = tasks
            .get(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        Ok(task.branches.values().map(|b| b.info.clone()).collect())
    }

    async fn list_commits(&self, task_id: Uuid, branch: &str) -> Result<Vec<Commit>, StoreError> {
        let tasks = self.tasks.read().map_err(Self::poisoned)?;
        let task = tasks
            .get(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        let branch = task
            .branches
            .get(branch)
            .ok_or_else(|| StoreError::NotFound(format!("branch {}", branch)))?;
        Ok(branch.commits.clone())
    }

    async fn get_commit(&self, task_id: Uuid, hash: &str) -> Result<Option<Commit>, StoreError> {
        let tasks = self.tasks.read().map_err(Self::poisoned)?;
        let task = tasks
            .get(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        for branch in task.branches.values() {
            if let Some(commit) = branch.commits.iter().find(|c| c.commit_hash == hash) {
                return Ok(Some(commit.clone()));
            }
        }
        Ok(None)
    }

    async fn delete_branch(&self, task_id: Uuid, branch: &str) -> Result<(), StoreError> {
        if branch == MAIN_BRANCH {
            return Err(StoreError::Conflict(
                "the main branch cannot be deleted".to_string(),
            ));
        }
        let mut tasks = self.tasks.write().map_err(Self::poisoned)?;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        if task.branches.remove(branch).is_none() {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        }
        if task.active_branch == branch {
            task.active_branch = MAIN_BRANCH.to_string();
        }
        Ok(())
    }

    async fn active_branch(&self, task_id: Uuid) -> Result<String, StoreError> {
        let tasks = self.tasks.read().map_err(Self::poisoned)?;
        let task = tasks
            .get(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        Ok(task.active_branch.clone())
    }

    async fn set_active_branch(&self, task_id: Uuid, branch: &str) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(Self::poisoned)?;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        if !task.branches.contains_key(branch) {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        }
        task.active_branch = branch.to_string();
        Ok(())
    }

    async fn save_namespace(&self, namespace: &Namespace) -> Result<(), StoreError> {
        let mut namespaces = self.namespaces.write().map_err(Self::poisoned)?;
        namespaces.insert(namespace.name.clone(), namespace.clone());
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError> {
        let namespaces = self.namespaces.read().map_err(Self::poisoned)?;
        Ok(namespaces.get(name).cloned())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        let namespaces = self.namespaces.read().map_err(Self::poisoned)?;
        Ok(namespaces.values().cloned().collect())
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool, StoreError> {
        let mut namespaces = self.namespaces.write().map_err(Self::poisoned)?;
        Ok(namespaces.remove(name).is_some())
    }

    async fn try_lock_task(&self, task_id: Uuid) -> Result<TaskLease, StoreError> {
        let mut locks = self.locks.write().map_err(Self::poisoned)?;
        if locks.contains_key(&task_id) {
            return Err(StoreError::Locked(format!(
                "task {} is held by another worker",
                task_id
            )));
        }
        let lease_id = Uuid::new_v4();
        locks.insert(task_id, lease_id);
        Ok(TaskLease { task_id, lease_id })
    }

    async fn unlock_task(&self, lease: &TaskLease) -> Result<(), StoreError> {
        let mut locks = self.locks.write().map_err(Self::poisoned)?;
        if locks.get(&lease.task_id) == Some(&lease.lease_id) {
            locks.remove(&lease.task_id);
        }
        Ok(())
    }
}
