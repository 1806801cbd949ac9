//! Shared fixtures for store tests.

use chrono::Utc;

use planvm_core::store::TaskRecord;
use planvm_core::types::{Commit, CommitDetails, CommitType, VmState};

pub fn sample_task() -> TaskRecord {
    TaskRecord::new("sample goal", "default")
}

pub fn commit_on(
    task: &TaskRecord,
    branch: &str,
    parent: Option<String>,
    message: &str,
) -> Commit {
    let commit_type = if parent.is_none() {
        CommitType::Initial
    } else {
        CommitType::StepExecution
    };
    Commit::new(
        parent,
        task.task_id,
        branch,
        None,
        Utc::now(),
        message,
        commit_type,
        message,
        CommitDetails::default(),
        VmState::new(task.goal.clone(), task.namespace.clone()),
    )
}
