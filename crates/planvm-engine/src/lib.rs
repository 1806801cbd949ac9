//! planvm-engine: task life-cycle orchestration.
//!
//! Drives plan generation, step-by-step execution with per-step commits,
//! error recovery through forked branches, dynamic plan updates and a
//! worker pool with per-task mutual exclusion.

mod engine;
mod queue;

pub use engine::{Engine, EngineConfig, EngineError, RunOutcome};
pub use queue::WorkerPool;

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use tokio_util::sync::CancellationToken;

    use planvm_core::error::{ErrorKind, VmError};
    use planvm_core::llm::TextGenerator;
    use planvm_core::planner::{GenerateRequest, Planner, UpdateOutcome, UpdateReason};
    use planvm_core::store::{CommitStore, TaskStatus, MAIN_BRANCH};
    use planvm_core::tools::{Namespace, ResultShape, Tool, ToolMeta, ToolRegistry};
    use planvm_core::types::{CommitType, Plan, ResponseFormat};
    use planvm_core::vars::VariableStore;
    use planvm_core::vm::{DispatchContext, Vm};
    use planvm_stores::MemoryStore;

    use super::*;

    /// Planner replaying scripted plans.
    struct ScriptedPlanner {
        plans: Mutex<VecDeque<Plan>>,
        updates: Mutex<VecDeque<UpdateOutcome>>,
    }

    impl ScriptedPlanner {
        fn new(plans: Vec<&str>) -> Self {
            Self {
                plans: Mutex::new(
                    plans
                        .into_iter()
                        .map(|raw| Plan::parse(raw).expect("scripted plan"))
                        .collect(),
                ),
                updates: Mutex::new(VecDeque::new()),
            }
        }

        fn with_updates(self, updates: Vec<UpdateOutcome>) -> Self {
            *self.updates.lock().unwrap() = updates.into();
            self
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn generate(&self, _request: &GenerateRequest) -> Result<Plan, VmError> {
            self.plans
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| VmError::llm_parse("no scripted plan left"))
        }

        async fn update(
            &self,
            _plan: &Plan,
            _failing_seq_no: i64,
            _reason: UpdateReason<'_>,
            _variables: &VariableStore,
        ) -> Result<UpdateOutcome, VmError> {
            self.updates
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| VmError::llm_parse("no scripted update left"))
        }

        async fn optimize_step(
            &self,
            plan: &Plan,
            seq_no: i64,
            _suggestion: &str,
            _variables: &VariableStore,
        ) -> Result<Plan, VmError> {
            // Rewrites the assign at `seq_no` to a fixed marker value.
            let mut patched = plan.clone();
            for instruction in &mut patched.instructions {
                if instruction.seq_no == seq_no {
                    let mut writes = Map::new();
                    writes.insert("final_answer".to_string(), json!("optimized"));
                    instruction.kind = planvm_core::types::InstructionKind::Assign(writes);
                }
            }
            Ok(patched)
        }
    }

    struct StaticReasoner;

    #[async_trait]
    impl TextGenerator for StaticReasoner {
        async fn generate(&self, _prompt: &str, _context: Option<&str>) -> Result<String, VmError> {
            Ok(r#"{"result": true, "explanation": "yes"}"#.to_string())
        }
    }

    /// Tool that fails a configurable number of times before succeeding.
    struct FlakyTool {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn meta(&self) -> ToolMeta {
            ToolMeta::new("flaky_lookup", "fails then succeeds").with_result(ResultShape::Single)
        }

        async fn invoke(&self, _params: Map<String, Value>) -> Result<Value, VmError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(VmError::tool_failed("upstream unavailable"));
            }
            Ok(json!("lookup result"))
        }
    }

    struct KeyedTool;

    #[async_trait]
    impl Tool for KeyedTool {
        fn meta(&self) -> ToolMeta {
            ToolMeta::new("summarize", "returns summary and insights").with_result(ResultShape::Keyed)
        }

        async fn invoke(&self, _params: Map<String, Value>) -> Result<Value, VmError> {
            Ok(json!({"summary": "s", "insights": "i"}))
        }
    }

    struct Fixture {
        engine: Arc<Engine>,
        store: Arc<MemoryStore>,
    }

    async fn fixture(planner: ScriptedPlanner, failures: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FlakyTool {
            failures_left: AtomicUsize::new(failures),
        }));
        tools.register(Arc::new(KeyedTool));

        store
            .save_namespace(&Namespace::new(
                "test",
                vec!["flaky_lookup".to_string(), "summarize".to_string()],
            ))
            .await
            .unwrap();

        let engine = Engine::new(
            store.clone(),
            Arc::new(tools),
            Arc::new(planner),
            Arc::new(StaticReasoner),
            EngineConfig::default(),
        );
        Fixture {
            engine: Arc::new(engine),
            store,
        }
    }

    const TRIVIAL_PLAN: &str =
        r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"hello"}}]"#;

    #[test]
    fn test_trivial_completion_emits_one_step_commit() {
        tokio_test::block_on(async {
            let fx = fixture(ScriptedPlanner::new(vec![TRIVIAL_PLAN]), 0).await;
            let task = fx
                .engine
                .create_task("say hello", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();

            let outcome = fx
                .engine
                .execute_task(task.task_id, CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(outcome.status, TaskStatus::Completed);
            assert_eq!(outcome.final_answer, Some(json!("hello")));

            let commits = fx
                .store
                .list_commits(task.task_id, MAIN_BRANCH)
                .await
                .unwrap();
            let kinds: Vec<CommitType> = commits.iter().map(|c| c.commit_type).collect();
            assert_eq!(
                kinds,
                vec![
                    CommitType::Initial,
                    CommitType::PlanUpdate,
                    CommitType::StepExecution
                ]
            );
            let last = commits.last().unwrap();
            assert!(last.vm_state_snapshot.goal_completed);
            assert_eq!(
                last.vm_state_snapshot.variables.get_opt("final_answer"),
                Some(&json!("hello"))
            );
        });
    }

    #[test]
    fn test_tool_call_and_bind_scenario() {
        tokio_test::block_on(async {
            let plan = r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"summarize","tool_params":{},"output_vars":["summary","insights"]}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"${summary}|${insights}"}}
            ]"#;
            let fx = fixture(ScriptedPlanner::new(vec![plan]), 0).await;
            let task = fx
                .engine
                .create_task("summarize", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();

            let outcome = fx
                .engine
                .execute_task(task.task_id, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome.status, TaskStatus::Completed);
            assert_eq!(outcome.final_answer, Some(json!("s|i")));
        });
    }

    #[test]
    fn test_recovery_forks_branch_and_completes() {
        tokio_test::block_on(async {
            let failing_plan = r#"[
                {"seq_no":0,"type":"assign","parameters":{"x":"start"}},
                {"seq_no":5,"type":"calling","parameters":{"tool_name":"flaky_lookup","tool_params":{"query":"${x}"},"output_vars":"found"}},
                {"seq_no":6,"type":"assign","parameters":{"final_answer":"${found}"}}
            ]"#;
            let patched_plan = Plan::parse(failing_plan).unwrap();
            let planner = ScriptedPlanner::new(vec![failing_plan])
                .with_updates(vec![UpdateOutcome::Patched(patched_plan)]);
            // Two failures: the first call and its transparent retry both
            // fail, so recovery forks; the call from the patched plan
            // succeeds.
            let fx = fixture(planner, 2).await;
            let task = fx
                .engine
                .create_task("look up x", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();

            let outcome = fx
                .engine
                .execute_task(task.task_id, CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(outcome.status, TaskStatus::Completed);
            assert_eq!(outcome.branch, "recover-1");
            assert_eq!(outcome.final_answer, Some(json!("lookup result")));

            // main keeps the faulty commit as its head; nothing after it.
            let main_commits = fx
                .store
                .list_commits(task.task_id, MAIN_BRANCH)
                .await
                .unwrap();
            let main_last = main_commits.last().unwrap();
            assert_eq!(main_last.commit_type, CommitType::StepExecution);
            let error = main_last.details.error.as_ref().expect("faulty commit");
            assert_eq!(error.kind, ErrorKind::ToolFailed);
            assert_eq!(error.seq_no, Some(5));

            // The recovery branch diverges from the faulty commit and ends
            // completed.
            let recovery_commits = fx
                .store
                .list_commits(task.task_id, "recover-1")
                .await
                .unwrap();
            assert_eq!(
                recovery_commits[main_commits.len() - 1].commit_hash,
                main_last.commit_hash
            );
            let recovery_last = recovery_commits.last().unwrap();
            assert!(recovery_last.vm_state_snapshot.goal_completed);
        });
    }

    #[test]
    fn test_recovery_abort_fails_task() {
        tokio_test::block_on(async {
            let failing_plan = r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"flaky_lookup","tool_params":{},"output_vars":"found"}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"${found}"}}
            ]"#;
            let planner = ScriptedPlanner::new(vec![failing_plan])
                .with_updates(vec![UpdateOutcome::Abort("no viable repair".to_string())]);
            let fx = fixture(planner, 100).await;
            let task = fx
                .engine
                .create_task("doomed", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();

            let outcome = fx
                .engine
                .execute_task(task.task_id, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome.status, TaskStatus::Failed);
            assert_eq!(outcome.error.unwrap().kind, ErrorKind::ToolFailed);
        });
    }

    #[test]
    fn test_cancellation_writes_manual_commit() {
        tokio_test::block_on(async {
            let fx = fixture(ScriptedPlanner::new(vec![TRIVIAL_PLAN]), 0).await;
            let task = fx
                .engine
                .create_task("cancelled", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();

            let cancel = CancellationToken::new();
            cancel.cancel();
            let outcome = fx.engine.execute_task(task.task_id, cancel).await.unwrap();
            assert_eq!(outcome.status, TaskStatus::Cancelled);

            let commits = fx
                .store
                .list_commits(task.task_id, MAIN_BRANCH)
                .await
                .unwrap();
            let last = commits.last().unwrap();
            assert_eq!(last.commit_type, CommitType::Manual);
            assert_eq!(
                last.vm_state_snapshot.last_error.as_ref().unwrap().kind,
                ErrorKind::Cancelled
            );
        });
    }

    #[test]
    fn test_locked_task_refuses_second_worker() {
        tokio_test::block_on(async {
            let fx = fixture(ScriptedPlanner::new(vec![TRIVIAL_PLAN]), 0).await;
            let task = fx
                .engine
                .create_task("locked", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();

            let lease = fx.store.try_lock_task(task.task_id).await.unwrap();
            let err = fx
                .engine
                .execute_task(task.task_id, CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                EngineError::Store(planvm_core::store::StoreError::Locked(_))
            ));
            fx.store.unlock_task(&lease).await.unwrap();
        });
    }

    #[test]
    fn test_optimize_step_forks_and_resumes() {
        tokio_test::block_on(async {
            let plan = r#"[
                {"seq_no":0,"type":"assign","parameters":{"x":"start"}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"${x}"}}
            ]"#;
            let fx = fixture(ScriptedPlanner::new(vec![plan]), 0).await;
            let task = fx
                .engine
                .create_task("optimize", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();

            let outcome = fx
                .engine
                .execute_task(task.task_id, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome.status, TaskStatus::Completed);

            // Rewrite instruction 1 at the commit that executed instruction 0.
            let commits = fx
                .store
                .list_commits(task.task_id, MAIN_BRANCH)
                .await
                .unwrap();
            let after_first_step = commits
                .iter()
                .find(|c| c.commit_type == CommitType::StepExecution && c.seq_no == Some(0))
                .unwrap();

            let outcome = fx
                .engine
                .optimize_step(
                    task.task_id,
                    &after_first_step.commit_hash,
                    1,
                    "bind a fixed marker",
                    CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(outcome.status, TaskStatus::Completed);
            assert_eq!(outcome.final_answer, Some(json!("optimized")));
            assert!(outcome.branch.starts_with("update-"));

            // main still ends with the original answer.
            let main_last = fx
                .store
                .list_commits(task.task_id, MAIN_BRANCH)
                .await
                .unwrap();
            assert_eq!(
                main_last
                    .last()
                    .unwrap()
                    .vm_state_snapshot
                    .variables
                    .get_opt("final_answer"),
                Some(&json!("start"))
            );
        });
    }

    #[test]
    fn test_validation_failure_retries_then_fails() {
        tokio_test::block_on(async {
            // Plan referencing an unknown tool fails validation on every
            // attempt (one initial + two retries).
            let bad_plan = r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"ghost","tool_params":{},"output_vars":"x"}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"${x}"}}
            ]"#;
            let fx = fixture(ScriptedPlanner::new(vec![bad_plan, bad_plan, bad_plan]), 0).await;
            let task = fx
                .engine
                .create_task("invalid", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();

            let outcome = fx
                .engine
                .execute_task(task.task_id, CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome.status, TaskStatus::Failed);
            assert_eq!(outcome.error.unwrap().kind, ErrorKind::Validation);

            let commits = fx
                .store
                .list_commits(task.task_id, MAIN_BRANCH)
                .await
                .unwrap();
            let last = commits.last().unwrap();
            assert!(last.details.error.is_some());
            assert!(!last.vm_state_snapshot.goal_completed);
        });
    }

    #[test]
    fn test_snapshot_replay_reproduces_next_commit() {
        tokio_test::block_on(async {
            let plan = r#"[
                {"seq_no":0,"type":"assign","parameters":{"a":3}},
                {"seq_no":1,"type":"assign","parameters":{"b":"${a} * 2 + 1"}},
                {"seq_no":2,"type":"assign","parameters":{"final_answer":"${b}"}}
            ]"#;
            let fx = fixture(ScriptedPlanner::new(vec![plan]), 0).await;
            let task = fx
                .engine
                .create_task("arithmetic", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();
            fx.engine
                .execute_task(task.task_id, CancellationToken::new())
                .await
                .unwrap();

            let commits = fx
                .store
                .list_commits(task.task_id, MAIN_BRANCH)
                .await
                .unwrap();
            let steps: Vec<_> = commits
                .iter()
                .filter(|c| c.commit_type != CommitType::Initial)
                .collect();

            // Replaying any snapshot reproduces the next commit's snapshot
            // byte-for-byte after canonical serialization.
            let tools = fx.engine.tools();
            let namespace = Namespace::new("test", vec![]);
            for window in steps.windows(2) {
                let mut vm = Vm::from_snapshot(window[0].vm_state_snapshot.clone());
                let ctx = DispatchContext {
                    tools: tools.as_ref(),
                    namespace: &namespace,
                    reasoner: &StaticReasoner,
                    call_timeout: std::time::Duration::from_secs(5),
                };
                vm.step(&ctx).await;
                let replayed = planvm_core::types::canonical_json(
                    &serde_json::to_value(vm.state()).unwrap(),
                );
                let recorded = window[1].canonical_snapshot();
                assert_eq!(replayed, recorded);
            }
        });
    }

    #[test]
    fn test_worker_pool_executes_submitted_tasks() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let fx = fixture(ScriptedPlanner::new(vec![TRIVIAL_PLAN]), 0).await;
            let task = fx
                .engine
                .create_task("pooled", Some("test".to_string()), ResponseFormat::default())
                .await
                .unwrap();

            let pool = WorkerPool::spawn(fx.engine.clone(), 2);
            pool.submit(task.task_id).unwrap();

            // Wait for the worker to finish the task.
            let mut status = TaskStatus::Pending;
            for _ in 0..100 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                status = fx.store.get_task(task.task_id).await.unwrap().unwrap().status;
                if status == TaskStatus::Completed {
                    break;
                }
            }
            assert_eq!(status, TaskStatus::Completed);
            pool.shutdown().await;
        });
    }
}
