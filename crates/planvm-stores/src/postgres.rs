//! Postgres-backed commit store.
//!
//! Commits are rows keyed by `(task_id, commit_hash)`; branches point at
//! their head, and forks share history by pointing at ancestor commits —
//! listing a branch walks the parent chain from its head. Schema setup runs
//! sequential, idempotent migration statements at connect time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use planvm_core::store::{
    BranchInfo, CommitStore, ForkPoint, StoreError, TaskLease, TaskRecord, TaskStatus, MAIN_BRANCH,
};
use planvm_core::tools::Namespace;
use planvm_core::types::Commit;

/// Sequential, idempotent migration statements. New statements are appended,
/// never edited.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        task_id UUID PRIMARY KEY,
        goal TEXT NOT NULL,
        namespace TEXT NOT NULL,
        status TEXT NOT NULL,
        active_branch TEXT NOT NULL DEFAULT 'main',
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS branches (
        task_id UUID NOT NULL REFERENCES tasks(task_id),
        name TEXT NOT NULL,
        head_hash TEXT NOT NULL DEFAULT '',
        forked_from_branch TEXT NULL,
        forked_from_commit TEXT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (task_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS commits (
        task_id UUID NOT NULL REFERENCES tasks(task_id),
        commit_hash TEXT NOT NULL,
        parent_hash TEXT NULL,
        branch TEXT NOT NULL,
        seq_no BIGINT NULL,
        time TIMESTAMPTZ NOT NULL,
        commit_type TEXT NOT NULL,
        commit_json JSONB NOT NULL,
        PRIMARY KEY (task_id, commit_hash)
    )",
    "CREATE INDEX IF NOT EXISTS commits_parent_idx ON commits (task_id, parent_hash)",
    "CREATE TABLE IF NOT EXISTS labels (
        label_id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS task_labels (
        task_id UUID NOT NULL REFERENCES tasks(task_id),
        label_id BIGINT NOT NULL REFERENCES labels(label_id),
        PRIMARY KEY (task_id, label_id)
    )",
    "CREATE TABLE IF NOT EXISTS namespaces (
        name TEXT PRIMARY KEY,
        description TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS namespace_tools (
        namespace_name TEXT NOT NULL REFERENCES namespaces(name) ON DELETE CASCADE,
        tool_name TEXT NOT NULL,
        PRIMARY KEY (namespace_name, tool_name)
    )",
    "CREATE TABLE IF NOT EXISTS task_locks (
        task_id UUID PRIMARY KEY,
        lease_id UUID NOT NULL,
        acquired_at TIMESTAMPTZ NOT NULL
    )",
];

/// Commit store backed by PostgreSQL.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run migrations.
    pub async fn connect(database_uri: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_uri)
            .await
            .map_err(conn_err)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(conn_err)?;
        }
        Ok(())
    }

    async fn branch_row(
        &self,
        task_id: Uuid,
        branch: &str,
    ) -> Result<Option<(String, BranchInfo)>, StoreError> {
        let row = sqlx::query(
            "SELECT name, head_hash, forked_from_branch, forked_from_commit, created_at
             FROM branches WHERE task_id = $1 AND name = $2",
        )
        .bind(task_id)
        .bind(branch)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn_err)?;
        Ok(row.map(|row| decode_branch_row(&row)))
    }

    async fn fetch_commit(
        &self,
        task_id: Uuid,
        hash: &str,
    ) -> Result<Option<Commit>, StoreError> {
        let row = sqlx::query("SELECT commit_json FROM commits WHERE task_id = $1 AND commit_hash = $2")
            .bind(task_id)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn_err)?;
        row.map(|row| decode_commit_row(&row)).transpose()
    }
}

fn conn_err(e: sqlx::Error) -> StoreError {
    StoreError::Connection(e.to_string())
}

fn decode_branch_row(row: &sqlx::postgres::PgRow) -> (String, BranchInfo) {
    let name: String = row.get("name");
    let head: String = row.get("head_hash");
    let forked_branch: Option<String> = row.get("forked_from_branch");
    let forked_commit: Option<String> = row.get("forked_from_commit");
    let created_at: DateTime<Utc> = row.get("created_at");
    let forked_from = match (forked_branch, forked_commit) {
        (Some(branch), Some(commit_hash)) => Some(ForkPoint {
            branch,
            commit_hash,
        }),
        _ => None,
    };
    (
        name.clone(),
        BranchInfo {
            name,
            head,
            created_at,
            forked_from,
        },
    )
}

fn decode_commit_row(row: &sqlx::postgres::PgRow) -> Result<Commit, StoreError> {
    let value: serde_json::Value = row.get("commit_json");
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn parse_status(label: &str) -> TaskStatus {
    match label {
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "cancelled" => TaskStatus::Cancelled,
        _ => TaskStatus::Pending,
    }
}

fn decode_task_row(row: &sqlx::postgres::PgRow) -> TaskRecord {
    let status: String = row.get("status");
    TaskRecord {
        task_id: row.get("task_id"),
        goal: row.get("goal"),
        namespace: row.get("namespace"),
        status: parse_status(&status),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl CommitStore for PostgresStore {
    async fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(conn_err)?;
        let inserted = sqlx::query(
            "INSERT INTO tasks (task_id, goal, namespace, status, active_branch, created_at)
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (task_id) DO NOTHING",
        )
        .bind(task.task_id)
        .bind(&task.goal)
        .bind(&task.namespace)
        .bind(status_label(task.status))
        .bind(MAIN_BRANCH)
        .bind(task.created_at)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        sqlx::query(
            "INSERT INTO branches (task_id, name, head_hash, created_at) VALUES ($1, $2, '', $3)",
        )
        .bind(task.task_id)
        .bind(MAIN_BRANCH)
        .bind(task.created_at)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?;
        tx.commit().await.map_err(conn_err)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, goal, namespace, status, created_at FROM tasks WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(conn_err)?;
        Ok(row.map(|row| decode_task_row(&row)))
    }

    async fn list_tasks(&self, limit: usize, offset: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_id, goal, namespace, status, created_at FROM tasks
             ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(conn_err)?;
        Ok(rows.iter().map(decode_task_row).collect())
    }

    async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE tasks SET status = $2 WHERE task_id = $1")
            .bind(task_id)
            .bind(status_label(status))
            .execute(&self.pool)
            .await
            .map_err(conn_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("task {}", task_id)));
        }
        Ok(())
    }

    async fn head(&self, task_id: Uuid, branch: &str) -> Result<Option<Commit>, StoreError> {
        let Some((_, info)) = self.branch_row(task_id, branch).await? else {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        };
        if info.head.is_empty() {
            return Ok(None);
        }
        self.fetch_commit(task_id, &info.head).await
    }

    async fn append(&self, task_id: Uuid, commit: Commit) -> Result<(), StoreError> {
        let Some((_, info)) = self.branch_row(task_id, &commit.branch).await? else {
            return Err(StoreError::NotFound(format!("branch {}", commit.branch)));
        };
        let expected_parent = if info.head.is_empty() {
            None
        } else {
            Some(info.head.clone())
        };
        if commit.parent_hash != expected_parent {
            return Err(StoreError::Conflict(format!(
                "commit parent {:?} does not match branch head {:?}",
                commit.parent_hash, expected_parent
            )));
        }

        let commit_json = serde_json::to_value(&commit)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut tx = self.pool.begin().await.map_err(conn_err)?;
        sqlx::query(
            "INSERT INTO commits (task_id, commit_hash, parent_hash, branch, seq_no, time, commit_type, commit_json)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (task_id, commit_hash) DO NOTHING",
        )
        .bind(task_id)
        .bind(&commit.commit_hash)
        .bind(&commit.parent_hash)
        .bind(&commit.branch)
        .bind(commit.seq_no)
        .bind(commit.time)
        .bind(format!("{:?}", commit.commit_type))
        .bind(commit_json)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?;

        // Head compare-and-swap keeps concurrent appends strongly consistent
        // within a task.
        let updated = sqlx::query(
            "UPDATE branches SET head_hash = $3 WHERE task_id = $1 AND name = $2 AND head_hash = $4",
        )
        .bind(task_id)
        .bind(&commit.branch)
        .bind(&commit.commit_hash)
        .bind(&info.head)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "branch {} advanced concurrently",
                commit.branch
            )));
        }
        tx.commit().await.map_err(conn_err)
    }

    async fn fork(
        &self,
        task_id: Uuid,
        from_branch: &str,
        at_commit: &str,
        new_branch: &str,
    ) -> Result<BranchInfo, StoreError> {
        if self.branch_row(task_id, new_branch).await?.is_some() {
            return Err(StoreError::Conflict(format!(
                "branch {} already exists",
                new_branch
            )));
        }
        if self.branch_row(task_id, from_branch).await?.is_none() {
            return Err(StoreError::NotFound(format!("branch {}", from_branch)));
        }
        if self.fetch_commit(task_id, at_commit).await?.is_none() {
            return Err(StoreError::NotFound(format!(
                "commit {} on branch {}",
                at_commit, from_branch
            )));
        }

        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO branches (task_id, name, head_hash, forked_from_branch, forked_from_commit, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(task_id)
        .bind(new_branch)
        .bind(at_commit)
        .bind(from_branch)
        .bind(at_commit)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(conn_err)?;

        Ok(BranchInfo {
            name: new_branch.to_string(),
            head: at_commit.to_string(),
            created_at,
            forked_from: Some(ForkPoint {
                branch: from_branch.to_string(),
                commit_hash: at_commit.to_string(),
            }),
        })
    }

    async fn list_branches(&self, task_id: Uuid) -> Result<Vec<BranchInfo>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, head_hash, forked_from_branch, forked_from_commit, created_at
             FROM branches WHERE task_id = $1 ORDER BY name",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(conn_err)?;
        Ok(rows.iter().map(|row| decode_branch_row(row).1).collect())
    }

    async fn list_commits(&self, task_id: Uuid, branch: &str) -> Result<Vec<Commit>, StoreError> {
        let Some((_, info)) = self.branch_row(task_id, branch).await? else {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        };
        // Forked branches share ancestry: walk the parent chain from the
        // head instead of filtering on the branch column.
        let mut commits = Vec::new();
        let mut cursor = if info.head.is_empty() {
            None
        } else {
            Some(info.head.clone())
        };
        while let Some(hash) = cursor {
            let commit = self.fetch_commit(task_id, &hash).await?.ok_or_else(|| {
                StoreError::Internal(format!("dangling parent pointer at {}", hash))
            })?;
            cursor = commit.parent_hash.clone();
            commits.push(commit);
        }
        commits.reverse();
        Ok(commits)
    }

    async fn get_commit(&self, task_id: Uuid, hash: &str) -> Result<Option<Commit>, StoreError> {
        self.fetch_commit(task_id, hash).await
    }

    async fn delete_branch(&self, task_id: Uuid, branch: &str) -> Result<(), StoreError> {
        if branch == MAIN_BRANCH {
            return Err(StoreError::Conflict(
                "the main branch cannot be deleted".to_string(),
            ));
        }
        let mut tx = self.pool.begin().await.map_err(conn_err)?;
        let deleted = sqlx::query("DELETE FROM branches WHERE task_id = $1 AND name = $2")
            .bind(task_id)
            .bind(branch)
            .execute(&mut *tx)
            .await
            .map_err(conn_err)?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        }
        sqlx::query(
            "UPDATE tasks SET active_branch = $3 WHERE task_id = $1 AND active_branch = $2",
        )
        .bind(task_id)
        .bind(branch)
        .bind(MAIN_BRANCH)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?;
        tx.commit().await.map_err(conn_err)
    }

    async fn active_branch(&self, task_id: Uuid) -> Result<String, StoreError> {
        let row = sqlx::query("SELECT active_branch FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn_err)?
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        Ok(row.get("active_branch"))
    }

    async fn set_active_branch(&self, task_id: Uuid, branch: &str) -> Result<(), StoreError> {
        if self.branch_row(task_id, branch).await?.is_none() {
            return Err(StoreError::NotFound(format!("branch {}", branch)));
        }
        sqlx::query("UPDATE tasks SET active_branch = $2 WHERE task_id = $1")
            .bind(task_id)
            .bind(branch)
            .execute(&self.pool)
            .await
            .map_err(conn_err)?;
        Ok(())
    }

    async fn save_namespace(&self, namespace: &Namespace) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(conn_err)?;
        sqlx::query(
            "INSERT INTO namespaces (name, description) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET description = EXCLUDED.description",
        )
        .bind(&namespace.name)
        .bind(&namespace.description)
        .execute(&mut *tx)
        .await
        .map_err(conn_err)?;
        sqlx::query("DELETE FROM namespace_tools WHERE namespace_name = $1")
            .bind(&namespace.name)
            .execute(&mut *tx)
            .await
            .map_err(conn_err)?;
        for tool in &namespace.allowed_tools {
            sqlx::query("INSERT INTO namespace_tools (namespace_name, tool_name) VALUES ($1, $2)")
                .bind(&namespace.name)
                .bind(tool)
                .execute(&mut *tx)
                .await
                .map_err(conn_err)?;
        }
        tx.commit().await.map_err(conn_err)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, StoreError> {
        let row = sqlx::query("SELECT name, description FROM namespaces WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(conn_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let tools = sqlx::query(
            "SELECT tool_name FROM namespace_tools WHERE namespace_name = $1 ORDER BY tool_name",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(conn_err)?;
        Ok(Some(Namespace {
            name: row.get("name"),
            description: row.get("description"),
            allowed_tools: tools.iter().map(|t| t.get("tool_name")).collect(),
        }))
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>, StoreError> {
        let rows = sqlx::query("SELECT name FROM namespaces ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(conn_err)?;
        let mut namespaces = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("name");
            if let Some(namespace) = self.get_namespace(&name).await? {
                namespaces.push(namespace);
            }
        }
        Ok(namespaces)
    }

    async fn delete_namespace(&self, name: &str) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM namespaces WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(conn_err)?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn try_lock_task(&self, task_id: Uuid) -> Result<TaskLease, StoreError> {
        let lease_id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO task_locks (task_id, lease_id, acquired_at) VALUES ($1, $2, $3)
             ON CONFLICT (task_id) DO NOTHING",
        )
        .bind(task_id)
        .bind(lease_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(conn_err)?;
        if inserted.rows_affected() == 0 {
            return Err(StoreError::Locked(format!(
                "task {} is held by another worker",
                task_id
            )));
        }
        Ok(TaskLease { task_id, lease_id })
    }

    async fn unlock_task(&self, lease: &TaskLease) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM task_locks WHERE task_id = $1 AND lease_id = $2")
            .bind(lease.task_id)
            .bind(lease.lease_id)
            .execute(&self.pool)
            .await
            .map_err(conn_err)?;
        Ok(())
    }
}
