//! The execution engine: drives the full task life-cycle.
//!
//! Start task → generate plan → run to completion, persisting every step as
//! a commit. Instruction failures enter recovery: the plan updater produces
//! a patch, a branch is forked at the faulty commit and execution resumes
//! there. External callers can apply suggestions (`dynamic_update`) or
//! rewrite a single step (`optimize_step`) at any commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use planvm_core::error::VmError;
use planvm_core::llm::TextGenerator;
use planvm_core::planner::{GenerateRequest, Planner, UpdateOutcome, UpdateReason};
use planvm_core::store::{CommitStore, StoreError, TaskRecord, TaskStatus, MAIN_BRANCH};
use planvm_core::tools::{Namespace, ToolRegistry, DEFAULT_NAMESPACE};
use planvm_core::types::{
    snapshot_diff, Commit, CommitDetails, CommitType, Plan, ResponseFormat, VmState,
};
use planvm_core::validate::validate_plan;
use planvm_core::vm::{DispatchContext, StepOutcome, Vm};

/// Engine-level errors. Per-instruction failures never surface here; they
/// are captured in commits and handled by recovery.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("commit {0} not found")]
    CommitNotFound(String),
}

/// Tunables; defaults match the recognized environment options.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_recovery_attempts: u32,
    pub max_validation_retries: u32,
    pub tool_call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            max_validation_retries: 2,
            tool_call_timeout: Duration::from_secs(300),
        }
    }
}

/// Delay before the single transparent retry of a transient failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Terminal result of one execution run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub branch: String,
    pub head: Option<String>,
    pub final_answer: Option<serde_json::Value>,
    pub error: Option<VmError>,
}

/// The plan execution engine.
pub struct Engine {
    store: Arc<dyn CommitStore>,
    tools: Arc<ToolRegistry>,
    planner: Arc<dyn Planner>,
    reasoner: Arc<dyn TextGenerator>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn CommitStore>,
        tools: Arc<ToolRegistry>,
        planner: Arc<dyn Planner>,
        reasoner: Arc<dyn TextGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            tools,
            planner,
            reasoner,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn CommitStore> {
        &self.store
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    async fn namespace(&self, name: &str) -> Result<Namespace, EngineError> {
        if let Some(namespace) = self.store.get_namespace(name).await? {
            return Ok(namespace);
        }
        if name == DEFAULT_NAMESPACE {
            return Ok(Namespace::default_namespace());
        }
        Err(EngineError::Store(StoreError::NotFound(format!(
            "namespace {}",
            name
        ))))
    }

    fn dispatch_ctx<'a>(&'a self, namespace: &'a Namespace) -> DispatchContext<'a> {
        DispatchContext {
            tools: self.tools.as_ref(),
            namespace,
            reasoner: self.reasoner.as_ref(),
            call_timeout: self.config.tool_call_timeout,
        }
    }

    /// Create a task with its `main` branch and an `Initial` commit holding
    /// an empty VM.
    pub async fn create_task(
        &self,
        goal: impl Into<String>,
        namespace: Option<String>,
        response_format: ResponseFormat,
    ) -> Result<TaskRecord, EngineError> {
        let namespace_name = namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let namespace = self.namespace(&namespace_name).await?;

        let task = TaskRecord::new(goal, namespace.name.clone());
        self.store.create_task(&task).await?;

        let state =
            VmState::new(task.goal.clone(), task.namespace.clone()).with_response_format(response_format);
        let initial = Commit::new(
            None,
            task.task_id,
            MAIN_BRANCH,
            None,
            Utc::now(),
            format!("Task created: {}", task.goal),
            CommitType::Initial,
            "Task created",
            CommitDetails::default(),
            state,
        );
        self.store.append(task.task_id, initial).await?;
        tracing::info!(task_id = %task.task_id, namespace = %namespace_name, "task created");
        Ok(task)
    }

    /// Generate a validated plan, retrying with the validation errors as
    /// feedback up to the configured limit.
    async fn generate_validated_plan(
        &self,
        goal: &str,
        namespace: &Namespace,
        response_format: &ResponseFormat,
    ) -> Result<Plan, VmError> {
        let catalog = self.tools.catalog_for(namespace);
        let mut request = GenerateRequest {
            goal: goal.to_string(),
            namespace: namespace.clone(),
            response_format: response_format.clone(),
            tool_catalog: catalog,
            best_practices_hint: None,
        };

        let mut last_error = None;
        for attempt in 0..=self.config.max_validation_retries {
            let plan = self.planner.generate(&request).await?;
            match validate_plan(&plan, &self.tools, namespace) {
                Ok(()) => return Ok(plan),
                Err(validation) => {
                    tracing::warn!(attempt, error = %validation, "generated plan failed validation");
                    request.best_practices_hint = Some(format!(
                        "The previous plan was rejected by static validation:\n{}\nFix every listed problem.",
                        validation.message
                    ));
                    last_error = Some(validation);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| VmError::validation("plan generation failed")))
    }

    /// Repair a plan after a failure, re-validating patches and feeding
    /// validation errors back to the updater.
    async fn repair_plan(
        &self,
        plan: &Plan,
        failing_seq_no: i64,
        error: &VmError,
        vm_state: &VmState,
        namespace: &Namespace,
    ) -> Result<UpdateOutcome, VmError> {
        let mut current_error = error.clone();
        for _ in 0..=self.config.max_validation_retries {
            let outcome = self
                .planner
                .update(
                    plan,
                    failing_seq_no,
                    UpdateReason::Failure(&current_error),
                    &vm_state.variables,
                )
                .await?;
            let patched = match outcome {
                UpdateOutcome::Abort(reason) => return Ok(UpdateOutcome::Abort(reason)),
                UpdateOutcome::Patched(patched) => patched,
            };
            match validate_plan(&patched, &self.tools, namespace) {
                Ok(()) => return Ok(UpdateOutcome::Patched(patched)),
                Err(validation) => {
                    tracing::warn!(error = %validation, "patched plan failed validation");
                    current_error = validation;
                }
            }
        }
        Ok(UpdateOutcome::Abort(
            "plan updater kept producing invalid plans".to_string(),
        ))
    }

    /// Execute a task from the head of its active branch to completion.
    ///
    /// Refuses to run a task that another worker holds; the caller may
    /// re-queue on [`StoreError::Locked`].
    pub async fn execute_task(
        &self,
        task_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let lease = self.store.try_lock_task(task_id).await?;
        let result = self.execute_locked(&task, cancel).await;
        self.store.unlock_task(&lease).await?;
        let outcome = result?;
        self.store.set_task_status(task_id, outcome.status).await?;
        Ok(outcome)
    }

    async fn execute_locked(
        &self,
        task: &TaskRecord,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let namespace = self.namespace(&task.namespace).await?;
        let branch = self.store.active_branch(task.task_id).await?;
        let head = self
            .store
            .head(task.task_id, &branch)
            .await?
            .ok_or_else(|| EngineError::Store(StoreError::NotFound(format!(
                "branch {} has no commits",
                branch
            ))))?;

        self.store
            .set_task_status(task.task_id, TaskStatus::Running)
            .await?;

        let mut vm = Vm::from_snapshot(head.vm_state_snapshot.clone());

        // A freshly created task has no plan yet.
        if vm.state().plan.is_empty() {
            match self
                .generate_validated_plan(&task.goal, &namespace, &vm.state().response_format)
                .await
            {
                Ok(plan) => {
                    vm.load(plan);
                    let commit = self
                        .commit_plan_update(task, &branch, &vm, "Initial plan generated")
                        .await?;
                    tracing::info!(task_id = %task.task_id, commit = %commit, "initial plan committed");
                }
                Err(error) => {
                    let error = error.at_seq(0);
                    self.commit_terminal_error(task, &branch, &mut vm, &error)
                        .await?;
                    return Ok(self.outcome(task, &branch, &vm, Some(error), TaskStatus::Failed).await);
                }
            }
        }

        self.run_loop(task, branch, vm, namespace, cancel).await
    }

    async fn run_loop(
        &self,
        task: &TaskRecord,
        mut branch: String,
        mut vm: Vm,
        namespace: Namespace,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let mut recovery_attempts = 0u32;
        let mut retried_seq: Option<i64> = None;

        loop {
            if cancel.is_cancelled() {
                let error = VmError::cancelled();
                self.commit_cancellation(task, &branch, &mut vm, &error).await?;
                return Ok(self
                    .outcome(task, &branch, &vm, Some(error), TaskStatus::Cancelled)
                    .await);
            }
            if vm.is_completed() {
                return Ok(self.outcome(task, &branch, &vm, None, TaskStatus::Completed).await);
            }

            let step = vm.step(&self.dispatch_ctx(&namespace)).await;
            let commit_hash = self.commit_step(task, &branch, &vm, &step).await?;

            let Some(error) = step.error else {
                if step.completed {
                    return Ok(self
                        .outcome(task, &branch, &vm, None, TaskStatus::Completed)
                        .await);
                }
                continue;
            };

            let failing_seq_for_retry = error.seq_no.unwrap_or(vm.state().program_counter);

            // Transient tool and timeout errors get one transparent retry
            // with backoff before recovery kicks in.
            if error.kind.is_retryable() && retried_seq != Some(failing_seq_for_retry) {
                retried_seq = Some(failing_seq_for_retry);
                tracing::warn!(
                    task_id = %task.task_id,
                    seq_no = failing_seq_for_retry,
                    error = %error,
                    "retrying instruction after transient failure"
                );
                tokio::time::sleep(RETRY_BACKOFF).await;
                vm.reset(failing_seq_for_retry)?;
                continue;
            }

            // Recovery: fork at the faulty commit with a patched plan.
            if error.kind.is_terminal() || recovery_attempts >= self.config.max_recovery_attempts {
                return Ok(self
                    .outcome(task, &branch, &vm, Some(error), TaskStatus::Failed)
                    .await);
            }
            recovery_attempts += 1;
            let failing_seq = error.seq_no.unwrap_or(vm.state().program_counter);
            let repair = self
                .repair_plan(&vm.state().plan, failing_seq, &error, vm.state(), &namespace)
                .await;
            let patched = match repair {
                Ok(UpdateOutcome::Patched(patched)) => patched,
                Ok(UpdateOutcome::Abort(reason)) => {
                    tracing::warn!(task_id = %task.task_id, %reason, "plan updater aborted recovery");
                    return Ok(self
                        .outcome(task, &branch, &vm, Some(error), TaskStatus::Failed)
                        .await);
                }
                Err(update_error) => {
                    tracing::error!(task_id = %task.task_id, error = %update_error, "plan update failed");
                    return Ok(self
                        .outcome(task, &branch, &vm, Some(error), TaskStatus::Failed)
                        .await);
                }
            };

            let recovery_branch = format!("recover-{}", recovery_attempts);
            self.store
                .fork(task.task_id, &branch, &commit_hash, &recovery_branch)
                .await?;
            self.store
                .set_active_branch(task.task_id, &recovery_branch)
                .await?;
            branch = recovery_branch;

            let resume_at = resume_seq(&patched, failing_seq);
            vm.load(patched);
            vm.reset(resume_at)?;
            self.commit_plan_update(
                task,
                &branch,
                &vm,
                &format!("Plan repaired after failure at seq_no {}", failing_seq),
            )
            .await?;
            tracing::info!(
                task_id = %task.task_id,
                branch = %branch,
                resume_at,
                attempt = recovery_attempts,
                "resuming after recovery"
            );
        }
    }

    /// Apply a natural-language suggestion at a commit: fork, load the
    /// updated plan, resume execution on the new branch.
    pub async fn dynamic_update(
        &self,
        task_id: Uuid,
        commit_hash: &str,
        suggestion: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        self.update_at_commit(task_id, commit_hash, suggestion, None, cancel)
            .await
    }

    /// Rewrite a single instruction at a commit and resume from it.
    pub async fn optimize_step(
        &self,
        task_id: Uuid,
        commit_hash: &str,
        seq_no: i64,
        suggestion: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        self.update_at_commit(task_id, commit_hash, suggestion, Some(seq_no), cancel)
            .await
    }

    async fn update_at_commit(
        &self,
        task_id: Uuid,
        commit_hash: &str,
        suggestion: &str,
        only_seq_no: Option<i64>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(EngineError::TaskNotFound(task_id))?;
        let lease = self.store.try_lock_task(task_id).await?;
        let result = self
            .update_at_commit_locked(&task, commit_hash, suggestion, only_seq_no, cancel)
            .await;
        self.store.unlock_task(&lease).await?;
        let outcome = result?;
        self.store.set_task_status(task_id, outcome.status).await?;
        Ok(outcome)
    }

    async fn update_at_commit_locked(
        &self,
        task: &TaskRecord,
        commit_hash: &str,
        suggestion: &str,
        only_seq_no: Option<i64>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let namespace = self.namespace(&task.namespace).await?;
        let commit = self
            .store
            .get_commit(task.task_id, commit_hash)
            .await?
            .ok_or_else(|| EngineError::CommitNotFound(commit_hash.to_string()))?;
        let state = commit.vm_state_snapshot.clone();

        let (patched, title) = match only_seq_no {
            Some(seq_no) => {
                let patched = self
                    .planner
                    .optimize_step(&state.plan, seq_no, suggestion, &state.variables)
                    .await?;
                (patched, format!("Step {} optimized", seq_no))
            }
            None => {
                let outcome = self
                    .planner
                    .update(
                        &state.plan,
                        state.program_counter,
                        UpdateReason::Suggestion(suggestion),
                        &state.variables,
                    )
                    .await?;
                match outcome {
                    UpdateOutcome::Patched(patched) => (patched, "Plan updated".to_string()),
                    UpdateOutcome::Abort(reason) => {
                        return Err(EngineError::Vm(VmError::validation(format!(
                            "plan updater declined the suggestion: {}",
                            reason
                        ))))
                    }
                }
            }
        };
        validate_plan(&patched, &self.tools, &namespace).map_err(EngineError::Vm)?;

        let branch_name = format!("update-{}", Utc::now().format("%Y%m%d%H%M%S"));
        self.store
            .fork(task.task_id, &commit.branch, commit_hash, &branch_name)
            .await?;
        self.store
            .set_active_branch(task.task_id, &branch_name)
            .await?;

        let resume_at = only_seq_no
            .map(|seq| resume_seq(&patched, seq))
            .unwrap_or_else(|| resume_seq(&patched, state.program_counter));
        let mut vm = Vm::from_snapshot(state);
        vm.load(patched);
        vm.reset(resume_at)?;
        self.commit_plan_update(task, &branch_name, &vm, &title).await?;

        self.run_loop(task, branch_name, vm, namespace, cancel).await
    }

    async fn commit_plan_update(
        &self,
        task: &TaskRecord,
        branch: &str,
        vm: &Vm,
        title: &str,
    ) -> Result<String, EngineError> {
        let parent = self.store.head(task.task_id, branch).await?;
        let details = CommitDetails {
            input_parameters: json!({
                "plan": vm.state().plan,
            }),
            output_variables: serde_json::Map::new(),
            diff: diff_against(parent.as_ref(), vm.state()),
            error: None,
        };
        let commit = Commit::new(
            parent.map(|c| c.commit_hash),
            task.task_id,
            branch,
            Some(vm.state().program_counter),
            Utc::now(),
            title,
            CommitType::PlanUpdate,
            title,
            details,
            vm.state().clone(),
        );
        let hash = commit.commit_hash.clone();
        self.store.append(task.task_id, commit).await?;
        Ok(hash)
    }

    async fn commit_step(
        &self,
        task: &TaskRecord,
        branch: &str,
        vm: &Vm,
        step: &StepOutcome,
    ) -> Result<String, EngineError> {
        let parent = self.store.head(task.task_id, branch).await?;
        let details = CommitDetails {
            input_parameters: step.input_parameters.clone(),
            output_variables: step.output_variables.clone(),
            diff: diff_against(parent.as_ref(), vm.state()),
            error: step.error.clone(),
        };
        let commit = Commit::new(
            parent.map(|c| c.commit_hash),
            task.task_id,
            branch,
            step.seq_no,
            Utc::now(),
            step.title.clone(),
            CommitType::StepExecution,
            step.title.clone(),
            details,
            vm.state().clone(),
        );
        let hash = commit.commit_hash.clone();
        self.store.append(task.task_id, commit).await?;
        Ok(hash)
    }

    async fn commit_terminal_error(
        &self,
        task: &TaskRecord,
        branch: &str,
        vm: &mut Vm,
        error: &VmError,
    ) -> Result<(), EngineError> {
        let mut state = vm.state().clone();
        state.last_error = Some(error.clone());
        *vm = Vm::from_snapshot(state);

        let parent = self.store.head(task.task_id, branch).await?;
        let details = CommitDetails {
            input_parameters: serde_json::Value::Null,
            output_variables: serde_json::Map::new(),
            diff: diff_against(parent.as_ref(), vm.state()),
            error: Some(error.clone()),
        };
        let commit = Commit::new(
            parent.map(|c| c.commit_hash),
            task.task_id,
            branch,
            error.seq_no,
            Utc::now(),
            format!("Execution failed: {}", error),
            CommitType::StepExecution,
            "Execution failed",
            details,
            vm.state().clone(),
        );
        self.store.append(task.task_id, commit).await?;
        Ok(())
    }

    async fn commit_cancellation(
        &self,
        task: &TaskRecord,
        branch: &str,
        vm: &mut Vm,
        error: &VmError,
    ) -> Result<(), EngineError> {
        let mut state = vm.state().clone();
        state.last_error = Some(error.clone());
        *vm = Vm::from_snapshot(state);

        let parent = self.store.head(task.task_id, branch).await?;
        let details = CommitDetails {
            input_parameters: serde_json::Value::Null,
            output_variables: serde_json::Map::new(),
            diff: diff_against(parent.as_ref(), vm.state()),
            error: Some(error.clone()),
        };
        let commit = Commit::new(
            parent.map(|c| c.commit_hash),
            task.task_id,
            branch,
            Some(vm.state().program_counter),
            Utc::now(),
            "Task cancelled",
            CommitType::Manual,
            "Task cancelled",
            details,
            vm.state().clone(),
        );
        self.store.append(task.task_id, commit).await?;
        tracing::info!(task_id = %task.task_id, "cancellation committed");
        Ok(())
    }

    async fn outcome(
        &self,
        task: &TaskRecord,
        branch: &str,
        vm: &Vm,
        error: Option<VmError>,
        status: TaskStatus,
    ) -> RunOutcome {
        let head = self
            .store
            .head(task.task_id, branch)
            .await
            .ok()
            .flatten()
            .map(|c| c.commit_hash);
        RunOutcome {
            task_id: task.task_id,
            status,
            branch: branch.to_string(),
            head,
            final_answer: vm.state().final_answer().cloned(),
            error,
        }
    }
}

/// Where to resume in a patched plan: the failing `seq_no` when it still
/// exists, otherwise the smallest `seq_no` at or after it.
fn resume_seq(plan: &Plan, failing_seq: i64) -> i64 {
    if plan.contains_seq(failing_seq) {
        return failing_seq;
    }
    plan.instructions
        .iter()
        .map(|i| i.seq_no)
        .filter(|&s| s > failing_seq)
        .min()
        .or_else(|| plan.instructions.iter().map(|i| i.seq_no).min())
        .unwrap_or(0)
}

fn diff_against(parent: Option<&Commit>, state: &VmState) -> String {
    let new_canonical = planvm_core::types::canonical_json(
        &serde_json::to_value(state).unwrap_or(serde_json::Value::Null),
    );
    match parent {
        Some(parent) => snapshot_diff(&parent.canonical_snapshot(), &new_canonical),
        None => String::new(),
    }
}
