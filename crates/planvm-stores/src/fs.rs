//! Filesystem-backed commit store.
//!
//! Layout:
//!
//! ```text
//! <root>/namespaces.json
//! <root>/<task_id>/meta.json        task record, branch table, active branch
//! <root>/<task_id>/<branch>.log     one JSON commit per line
//! <root>/<task_id>/.lock            advisory lock holding the lease id
//! ```
//!
//! Appends are atomic: the updated log is written to a temporary file and
//! renamed into place.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use planvm_core::store::{
    BranchInfo, CommitStore, ForkPoint, StoreError, TaskLease, TaskRecord, TaskStatus, MAIN_BRANCH,
};
use planvm_core::tools::Namespace;
use planvm_core::types::Commit;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BranchMeta {
    created_at: chrono::DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    forked_from: Option<ForkPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskMeta {
    record: TaskRecord,
    active_branch: String,
    branches: BTreeMap<String, BranchMeta>,
}

/// Commit store rooted at a directory on the local filesystem.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if necessary) a store under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err)?;
        Ok(Self { root })
    }

    fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    fn meta_path(&self, task_id: Uuid) -> PathBuf {
        self.task_dir(task_id).join("meta.json")
    }

    fn log_path(&self, task_id: Uuid, branch: &str) -> Result<PathBuf, StoreError> {
        if branch.is_empty()
            || !branch
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            || branch.starts_with('.')
        {
            return Err(StoreError::Internal(format!(
                "invalid branch name '{}'",
                branch
            )));
        }
        Ok(self.task_dir(task_id).join(format!("{}.log", branch)))
    }

    fn lock_path(&self, task_id: Uuid) -> PathBuf {
        self.task_dir(task_id).join(".lock")
    }

    fn namespaces_path(&self) -> PathBuf {
        self.root.join("namespaces.json")
    }

    fn read_meta(&self, task_id: Uuid) -> Result<TaskMeta, StoreError> {
        let path = self.meta_path(task_id);
        let raw = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(format!("task {}", task_id))
            } else {
                io_err(e)
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn write_meta(&self, task_id: Uuid, meta: &TaskMeta) -> Result<(), StoreError> {
        let payload = serde_json::to_string_pretty(meta)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.meta_path(task_id), payload.as_bytes())
    }

    fn read_log(&self, task_id: Uuid, branch: &str) -> Result<Vec<Commit>, StoreError> {
        let path = self.log_path(task_id, branch)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("branch {}", branch)))
            }
            Err(e) => return Err(io_err(e)),
        };
        let mut commits = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let commit: Commit = serde_json::from_str(line)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            commits.push(commit);
        }
        Ok(commits)
    }

    fn write_log(&self, task_id: Uuid, branch: &str, commits: &[Commit]) -> Result<(), StoreError> {
        let mut payload = String::new();
        for commit in commits {
            payload.push_str(
                &serde_json::to_string(commit)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            );
            payload.push('\n');
        }
        write_atomic(&self.log_path(task_id, branch)?, payload.as_bytes())
    }

    fn read_namespaces(&self) -> Result<BTreeMap<String, Namespace>, StoreError> {
        match fs::read_to_string(self.namespaces_path()) {
            Ok(raw) => {
                serde_json::from_str(&raw).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(io_err(e)),
        }
    }

    fn write_namespaces(&self, namespaces: &BTreeMap<String, Namespace>) -> Result<(), StoreError> {
        let payload = serde_json::to_string_pretty(namespaces)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.namespaces_path(), payload.as_bytes())
    }
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

/// Write a file by staging into a sibling temp file and renaming into place.
fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Internal("path has no parent directory".to_string()))?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        Uuid::new_v4()
    ));
    {
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(payload).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)
}

#[async_trait]
impl CommitStore for FsStore {
    async fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let dir = self.task_dir(task.task_id);
        if dir.exists() {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        fs::create_dir_all(&dir).map_err(io_err)?;
        let mut branches = BTreeMap::new();
        branches.insert(
            MAIN_BRANCH.to_string(),
            BranchMeta {
                created_at: Utc::now(),
                forked_from: None,
            },
        );
        self.write_meta(
            task.task_id,
            &TaskMeta {
                record: task.clone(),
                active_branch: MAIN_BRANCH.to_string(),
                branches,
            },
        )?;
        self.write_log(task.task_id, MAIN_BRANCH, &[])
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        match self.read_meta(task_id) {
            Ok(meta) => Ok(Some(meta.record)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_tasks(&self, limit: usize, offset: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let Ok(task_id) = entry.file_name().to_string_lossy().parse::<Uuid>() else {
                continue;
            };
            if let Ok(meta) = self.read_meta(task_id) {
                records.push(meta.record);
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let mut meta = self.read_meta(task_id)?;
        meta.record.status = status;
        self.write_meta(task_id, &meta)
    }

    async fn head(&self, task_id: Uuid, branch: &str) -> Result<Option<Commit>, StoreError> {
        let meta = self.read_meta(task_id)?;
        if !meta.branches.contains_key(branch) {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        }
        Ok(self.read_log(task_id, branch)?.into_iter().last())
    }

    async fn append(&self, task_id: Uuid, commit: Commit) -> Result<(), StoreError> {
        let meta = self.read_meta(task_id)?;
        if !meta.branches.contains_key(&commit.branch) {
            return Err(StoreError::NotFound(format!("branch {}", commit.branch)));
        }
        let mut commits = self.read_log(task_id, &commit.branch)?;
        let expected_parent = commits.last().map(|c| c.commit_hash.clone());
        if commit.parent_hash != expected_parent {
            return Err(StoreError::Conflict(format!(
                "commit parent {:?} does not match branch head {:?}",
                commit.parent_hash, expected_parent
            )));
        }
        let branch = commit.branch.clone();
        commits.push(commit);
        self.write_log(task_id, &branch, &commits)
    }

    async fn fork(
        &self,
        task_id: Uuid,
        from_branch: &str,
        at_commit: &str,
        new_branch: &str,
    ) -> Result<BranchInfo, StoreError> {
        let mut meta = self.read_meta(task_id)?;
        if meta.branches.contains_key(new_branch) {
            return Err(StoreError::Conflict(format!(
                "branch {} already exists",
                new_branch
            )));
        }
        if !meta.branches.contains_key(from_branch) {
            return Err(StoreError::NotFound(format!("branch {}", from_branch)));
        }
        let origin = self.read_log(task_id, from_branch)?;
        let fork_index = origin
            .iter()
            .position(|c| c.commit_hash == at_commit)
            .ok_or_else(|| {
                StoreError::NotFound(format!("commit {} on branch {}", at_commit, from_branch))
            })?;

        self.write_log(task_id, new_branch, &origin[..=fork_index])?;
        let branch_meta = BranchMeta {
            created_at: Utc::now(),
            forked_from: Some(ForkPoint {
                branch: from_branch.to_string(),
                commit_hash: at_commit.to_string(),
            }),
        };
        meta.branches
            .insert(new_branch.to_string(), branch_meta.clone());
        self.write_meta(task_id, &meta)?;
        Ok(BranchInfo {
            name: new_branch.to_string(),
            head: at_commit.to_string(),
            created_at: branch_meta.created_at,
            forked_from: branch_meta.forked_from,
        })
    }

    async fn list_branches(&self, task_id: Uuid) -> Result<Vec<BranchInfo>, StoreError> {
        let meta = self.read_meta(task_id)?;
        let mut branches = Vec::new();
        for (name, branch_meta) in &meta.branches {
            let head = self
                .read_log(task_id, name)?
                .last()
                .map(|c| c.commit_hash.clone())
                .unwrap_or_default();
            branches.push(BranchInfo {
                name: name.clone(),
                head,
                created_at: branch_meta.created_at,
                forked_from: branch_meta.forked_from.clone(),
            });
        }
        Ok(branches)
    }

    async fn list_commits(&self, task_id: Uuid, branch: &str) -> Result<Vec<Commit>, StoreError> {
        let meta = self.read_meta(task_id)?;
        if !meta.branches.contains_key(branch) {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        }
        self.read_log(task_id, branch)
    }

    async fn get_commit(&self, task_id: Uuid, hash: &str) -> Result<Option<Commit>, StoreError> {
        let meta = self.read_meta(task_id)?;
        for name in meta.branches.keys() {
            if let Some(commit) = self
                .read_log(task_id, name)?
                .into_iter()
                .find(|c| c.commit_hash == hash)
            {
                return Ok(Some(commit));
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
        let mut meta = self.read_meta(task_id)?;
        if meta.branches.remove(branch).is_none() {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        }
        if meta.active_branch == branch {
            meta.active_branch = MAIN_BRANCH.to_string();
        }
        self.write_meta(task_id, &meta)?;
        fs::remove_file(self.log_path(task_id, branch)?).map_err(io_err)
    }

    async fn active_branch(&self, task_id: Uuid) -> Result<String, StoreError> {
        Ok(self.read_meta(task_id)?.active_branch)
    }

    async fn set_active_branch(&self, task_id: Uuid, branch: &str) -> Result<(), StoreError> {
        let mut meta = self.read_meta(task_id)?;
        if !meta.branches.contains_key(branch) {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        }
        meta.active_branch = branch.to_string();
        self.write_meta(task_id, &meta)
    }

    async fn save_namespace(&self, namespace: &Namespace) -> Result<(), StoreError> {
        let mut namespaces = self.read_namespaces()?;
        namespaces.insert(namespace.name.clone(), namespace.clone());
        self.write_namespaces(&namespaces)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError> {
        Ok(self.read_namespaces()?.get(name).cloned())
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        Ok(self.read_namespaces()?.into_values().collect())
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool, StoreError> {
        let mut namespaces = self.read_namespaces()?;
        let removed = namespaces.remove(name).is_some();
        if removed {
            self.write_namespaces(&namespaces)?;
        }
        Ok(removed)
    }

    async fn try_lock_task(&self, task_id: Uuid) -> Result<TaskLease, StoreError> {
        // Existence check doubles as the task lookup.
        self.read_meta(task_id)?;
        let lease_id = Uuid::new_v4();
        let path = self.lock_path(task_id);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                file.write_all(lease_id.to_string().as_bytes())
                    .map_err(io_err)?;
                Ok(TaskLease { task_id, lease_id })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StoreError::Locked(
                format!("task {} is held by another worker", task_id),
            )),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn unlock_task(&self, lease: &TaskLease) -> Result<(), StoreError> {
        let path = self.lock_path(lease.task_id);
        match fs::read_to_string(&path) {
            Ok(holder) if holder.trim() == lease.lease_id.to_string() => {
                fs::remove_file(&path).map_err(io_err)
            }
            // Stale lease or already released.
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{commit_on, sample_task};

    fn open_store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(dir.path()).expect("store");
        (dir, store)
    }

    #[test]
    fn test_commits_survive_reopen() {
        tokio_test::block_on(async {
            let (dir, store) = open_store();
            let task = sample_task();
            store.create_task(&task).await.unwrap();

            let first = commit_on(&task, MAIN_BRANCH, None, "initial");
            store.append(task.task_id, first.clone()).await.unwrap();

            drop(store);
            let reopened = FsStore::new(dir.path()).unwrap();
            let head = reopened
                .head(task.task_id, MAIN_BRANCH)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(head, first);
        });
    }

    #[test]
    fn test_log_is_one_json_commit_per_line() {
        tokio_test::block_on(async {
            let (dir, store) = open_store();
            let task = sample_task();
            store.create_task(&task).await.unwrap();

            let first = commit_on(&task, MAIN_BRANCH, None, "initial");
            store.append(task.task_id, first.clone()).await.unwrap();
            let second = commit_on(&task, MAIN_BRANCH, Some(first.commit_hash.clone()), "step");
            store.append(task.task_id, second).await.unwrap();

            let log = std::fs::read_to_string(
                dir.path()
                    .join(task.task_id.to_string())
                    .join("main.log"),
            )
            .unwrap();
            assert_eq!(log.lines().count(), 2);
            for line in log.lines() {
                serde_json::from_str::<Commit>(line).expect("valid commit JSON");
            }
        });
    }

    #[test]
    fn test_fork_copies_ancestry_and_diverges() {
        tokio_test::block_on(async {
            let (_dir, store) = open_store();
            let task = sample_task();
            store.create_task(&task).await.unwrap();

            let first = commit_on(&task, MAIN_BRANCH, None, "initial");
            store.append(task.task_id, first.clone()).await.unwrap();
            let second = commit_on(&task, MAIN_BRANCH, Some(first.commit_hash.clone()), "step");
            store.append(task.task_id, second.clone()).await.unwrap();

            store
                .fork(task.task_id, MAIN_BRANCH, &first.commit_hash, "recover-1")
                .await
                .unwrap();

            let diverged = commit_on(
                &task,
                "recover-1",
                Some(first.commit_hash.clone()),
                "patched",
            );
            store.append(task.task_id, diverged.clone()).await.unwrap();

            let fork_commits = store.list_commits(task.task_id, "recover-1").await.unwrap();
            assert_eq!(fork_commits.len(), 2);
            assert_eq!(fork_commits[0].commit_hash, first.commit_hash);
            assert_eq!(fork_commits[1].commit_hash, diverged.commit_hash);

            let main_commits = store.list_commits(task.task_id, MAIN_BRANCH).await.unwrap();
            assert_eq!(main_commits[1].commit_hash, second.commit_hash);
        });
    }

    #[test]
    fn test_lock_file_blocks_second_worker() {
        tokio_test::block_on(async {
            let (_dir, store) = open_store();
            let task = sample_task();
            store.create_task(&task).await.unwrap();

            let lease = store.try_lock_task(task.task_id).await.unwrap();
            assert!(matches!(
                store.try_lock_task(task.task_id).await,
                Err(StoreError::Locked(_))
            ));
            store.unlock_task(&lease).await.unwrap();
            store.try_lock_task(task.task_id).await.unwrap();
        });
    }

    #[test]
    fn test_namespaces_persist() {
        tokio_test::block_on(async {
            let (dir, store) = open_store();
            let ns = Namespace::new("research", vec!["llm_generate".to_string()]);
            store.save_namespace(&ns).await.unwrap();

            let reopened = FsStore::new(dir.path()).unwrap();
            let loaded = reopened.get_namespace("research").await.unwrap().unwrap();
            assert_eq!(loaded, ns);
            assert!(reopened.delete_namespace("research").await.unwrap());
            assert!(!reopened.delete_namespace("research").await.unwrap());
        });
    }
}
