//! The LLM-backed plan generator/updater.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use planvm_core::llm::extract_first_json_object;
use planvm_core::planner::{GenerateRequest, Planner, UpdateOutcome, UpdateReason};
use planvm_core::types::{Instruction, Plan};
use planvm_core::vars::VariableStore;
use planvm_core::VmError;

use crate::client::{LlmClient, LlmRequest};
use crate::prompts;

const MAX_PROMPT_LOG_CHARS: usize = 4_000;

/// Plan generator backed by a reasoning LLM endpoint.
pub struct LlmPlanner {
    client: Arc<dyn LlmClient>,
    temperature: f32,
}

impl LlmPlanner {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            temperature: 0.2,
        }
    }

    async fn complete(&self, prompt: String) -> Result<String, VmError> {
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                prompt = %truncate_for_log(&prompt, MAX_PROMPT_LOG_CHARS),
                "planner prompt"
            );
        }
        let reply = self
            .client
            .complete(LlmRequest {
                system: None,
                user: prompt,
                temperature: self.temperature,
            })
            .await?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                reply = %truncate_for_log(&reply, MAX_PROMPT_LOG_CHARS),
                "planner reply"
            );
        }
        Ok(reply)
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(max_chars).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", char_count));
    preview
}

/// Extract the first balanced top-level JSON array from free-form output.
pub fn extract_first_json_array(text: &str) -> Option<&str> {
    for (start, ch) in text.char_indices() {
        if ch != '[' {
            continue;
        }
        if let Some(end) = find_array_end(text, start) {
            let candidate = &text[start..=end];
            if serde_json::from_str::<serde_json::Value>(candidate)
                .map(|v| v.is_array())
                .unwrap_or(false)
            {
                return Some(candidate);
            }
        }
    }
    None
}

fn find_array_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text[start..].char_indices() {
        let abs = start + idx;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(abs);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a plan from an LLM reply that may surround the JSON array with
/// prose or code fences.
pub fn parse_plan_reply(reply: &str) -> Result<Plan, VmError> {
    let array = extract_first_json_array(reply)
        .ok_or_else(|| VmError::llm_parse(format!("no JSON array in planner reply: {}", reply)))?;
    Plan::parse(array)
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn generate(&self, request: &GenerateRequest) -> Result<Plan, VmError> {
        info!(
            goal_len = request.goal.len(),
            namespace = %request.namespace.name,
            tool_count = request.tool_catalog.len(),
            "generating plan"
        );
        let reply = self.complete(prompts::generate_prompt(request)).await?;
        let plan = parse_plan_reply(&reply)?;
        info!(instruction_count = plan.len(), "plan generated");
        Ok(plan)
    }

    async fn update(
        &self,
        plan: &Plan,
        failing_seq_no: i64,
        reason: UpdateReason<'_>,
        variables: &VariableStore,
    ) -> Result<UpdateOutcome, VmError> {
        info!(failing_seq_no, "requesting plan update");
        let reply = self
            .complete(prompts::update_prompt(
                plan,
                failing_seq_no,
                &reason,
                variables,
            ))
            .await?;

        // An abort object takes precedence over a patched plan.
        if let Some(object) = extract_first_json_object(&reply) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(object) {
                if let Some(reason) = value.get("abort").and_then(|v| v.as_str()) {
                    if extract_first_json_array(&reply).is_none() {
                        return Ok(UpdateOutcome::Abort(reason.to_string()));
                    }
                }
            }
        }

        let patched = parse_plan_reply(&reply)?;
        info!(instruction_count = patched.len(), "plan repaired");
        Ok(UpdateOutcome::Patched(patched))
    }

    async fn optimize_step(
        &self,
        plan: &Plan,
        seq_no: i64,
        suggestion: &str,
        variables: &VariableStore,
    ) -> Result<Plan, VmError> {
        if plan.get(seq_no).is_none() {
            return Err(VmError::validation(format!(
                "cannot optimize unknown seq_no {}",
                seq_no
            )));
        }
        info!(seq_no, "requesting step rewrite");
        let reply = self
            .complete(prompts::optimize_step_prompt(
                plan, seq_no, suggestion, variables,
            ))
            .await?;
        let object = extract_first_json_object(&reply).ok_or_else(|| {
            VmError::llm_parse(format!("no JSON object in step rewrite reply: {}", reply))
        })?;
        let rewritten: Instruction = serde_json::from_str(object)
            .map_err(|e| VmError::llm_parse(format!("invalid instruction JSON: {}", e)))?;
        if rewritten.seq_no != seq_no {
            return Err(VmError::llm_parse(format!(
                "step rewrite changed seq_no from {} to {}",
                seq_no, rewritten.seq_no
            )));
        }

        let mut patched = plan.clone();
        for instruction in &mut patched.instructions {
            if instruction.seq_no == seq_no {
                *instruction = rewritten.clone();
            }
        }
        Ok(patched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLlmClient;
    use planvm_core::tools::Namespace;
    use planvm_core::types::ResponseFormat;

    fn request() -> GenerateRequest {
        GenerateRequest {
            goal: "say hello".to_string(),
            namespace: Namespace::default_namespace(),
            response_format: ResponseFormat::default(),
            tool_catalog: Vec::new(),
            best_practices_hint: None,
        }
    }

    const PLAN_REPLY: &str = r#"Here is the plan:
```json
[{"seq_no":0,"type":"assign","parameters":{"final_answer":"hello"}}]
```"#;

    #[test]
    fn test_generate_parses_fenced_plan() {
        tokio_test::block_on(async {
            let planner = LlmPlanner::new(Arc::new(MockLlmClient::new(PLAN_REPLY)));
            let plan = planner.generate(&request()).await.unwrap();
            assert_eq!(plan.len(), 1);
        });
    }

    #[test]
    fn test_generate_without_array_is_a_parse_error() {
        tokio_test::block_on(async {
            let planner = LlmPlanner::new(Arc::new(MockLlmClient::new("I cannot help")));
            let err = planner.generate(&request()).await.unwrap_err();
            assert_eq!(err.kind, planvm_core::ErrorKind::LlmParse);
        });
    }

    #[test]
    fn test_update_detects_abort() {
        tokio_test::block_on(async {
            let planner = LlmPlanner::new(Arc::new(MockLlmClient::new(
                r#"{"abort": "the tool does not exist"}"#,
            )));
            let plan = Plan::default();
            let outcome = planner
                .update(
                    &plan,
                    3,
                    UpdateReason::Failure(&VmError::tool_failed("boom")),
                    &VariableStore::new(),
                )
                .await
                .unwrap();
            assert!(matches!(outcome, UpdateOutcome::Abort(reason) if reason.contains("tool")));
        });
    }

    #[test]
    fn test_update_returns_patched_plan() {
        tokio_test::block_on(async {
            let planner = LlmPlanner::new(Arc::new(MockLlmClient::new(PLAN_REPLY)));
            let plan = Plan::default();
            let outcome = planner
                .update(
                    &plan,
                    0,
                    UpdateReason::Failure(&VmError::tool_failed("boom")),
                    &VariableStore::new(),
                )
                .await
                .unwrap();
            assert!(matches!(outcome, UpdateOutcome::Patched(p) if p.len() == 1));
        });
    }

    #[test]
    fn test_optimize_step_splices_rewritten_instruction() {
        tokio_test::block_on(async {
            let plan = Plan::parse(
                r#"[
                    {"seq_no":0,"type":"assign","parameters":{"x":"1"}},
                    {"seq_no":1,"type":"assign","parameters":{"final_answer":"${x}"}}
                ]"#,
            )
            .unwrap();
            let planner = LlmPlanner::new(Arc::new(MockLlmClient::new(
                r#"{"seq_no":0,"type":"assign","parameters":{"x":"2"}}"#,
            )));
            let patched = planner
                .optimize_step(&plan, 0, "use 2 instead", &VariableStore::new())
                .await
                .unwrap();
            assert_eq!(patched.len(), 2);
            match &patched.get(0).unwrap().kind {
                planvm_core::types::InstructionKind::Assign(writes) => {
                    assert_eq!(writes.get("x").unwrap(), &serde_json::json!("2"));
                }
                other => panic!("unexpected kind: {:?}", other),
            }
        });
    }

    #[test]
    fn test_optimize_step_rejects_seq_no_change() {
        tokio_test::block_on(async {
            let plan = Plan::parse(
                r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"x"}}]"#,
            )
            .unwrap();
            let planner = LlmPlanner::new(Arc::new(MockLlmClient::new(
                r#"{"seq_no":7,"type":"assign","parameters":{"final_answer":"y"}}"#,
            )));
            let err = planner
                .optimize_step(&plan, 0, "change", &VariableStore::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind, planvm_core::ErrorKind::LlmParse);
        });
    }

    #[test]
    fn test_extract_array_skips_bracketed_prose() {
        let raw = r#"[not json either [1, 2] works"#;
        assert_eq!(extract_first_json_array(raw), Some("[1, 2]"));
    }
}
