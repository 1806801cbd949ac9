//! Static plan validation, run after every planner call.
//!
//! The checks are best-effort and path-insensitive: variable flow is
//! analyzed in sequence order, ignoring which jumps are actually taken.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::VmError;
use crate::tools::{Namespace, ToolRegistry};
use crate::types::{InstructionKind, OutputVars, Plan};
use crate::vars::{find_references, is_valid_name, FINAL_ANSWER};

/// Validate a plan against the registry and the task's namespace.
///
/// Returns every violation found, wrapped into one validation error whose
/// details carry the individual messages for re-prompting.
pub fn validate_plan(
    plan: &Plan,
    tools: &ToolRegistry,
    namespace: &Namespace,
) -> Result<(), VmError> {
    let mut problems = Vec::new();

    if plan.is_empty() {
        problems.push("plan has no instructions".to_string());
    }

    check_unique_seq_nos(plan, &mut problems);
    check_tools(plan, tools, namespace, &mut problems);
    check_jump_targets(plan, &mut problems);
    check_variable_flow(plan, &mut problems);
    check_final_answer(plan, &mut problems);

    if problems.is_empty() {
        Ok(())
    } else {
        Err(
            VmError::validation(format!("plan failed validation: {}", problems.join("; ")))
                .with_details(Value::Array(
                    problems.into_iter().map(Value::String).collect(),
                )),
        )
    }
}

fn check_unique_seq_nos(plan: &Plan, problems: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for instruction in &plan.instructions {
        if !seen.insert(instruction.seq_no) {
            problems.push(format!("duplicate seq_no {}", instruction.seq_no));
        }
    }
}

fn check_tools(
    plan: &Plan,
    tools: &ToolRegistry,
    namespace: &Namespace,
    problems: &mut Vec<String>,
) {
    for instruction in &plan.instructions {
        if let InstructionKind::Calling(params) = &instruction.kind {
            if !tools.contains(&params.tool_name) {
                problems.push(format!(
                    "seq_no {}: tool '{}' is not registered",
                    instruction.seq_no, params.tool_name
                ));
            } else if !namespace.allows(&params.tool_name) {
                problems.push(format!(
                    "seq_no {}: tool '{}' is not visible in namespace '{}'",
                    instruction.seq_no, params.tool_name, namespace.name
                ));
            }
            for name in params.output_vars.names() {
                if !is_valid_name(name) {
                    problems.push(format!(
                        "seq_no {}: invalid output variable name '{}'",
                        instruction.seq_no, name
                    ));
                }
            }
        }
    }
}

fn check_jump_targets(plan: &Plan, problems: &mut Vec<String>) {
    for instruction in &plan.instructions {
        let InstructionKind::Jmp(params) = &instruction.kind else {
            continue;
        };
        if params.is_conditional() {
            for (label, target) in [
                ("jump_if_true", params.jump_if_true),
                ("jump_if_false", params.jump_if_false),
            ] {
                match target {
                    None => problems.push(format!(
                        "seq_no {}: conditional jmp missing {}",
                        instruction.seq_no, label
                    )),
                    Some(seq) if !plan.contains_seq(seq) => problems.push(format!(
                        "seq_no {}: {} targets unknown seq_no {}",
                        instruction.seq_no, label, seq
                    )),
                    Some(_) => {}
                }
            }
        } else {
            match params.target_seq {
                None => problems.push(format!(
                    "seq_no {}: jmp has neither target_seq nor condition_prompt",
                    instruction.seq_no
                )),
                Some(seq) if !plan.contains_seq(seq) => problems.push(format!(
                    "seq_no {}: target_seq {} does not exist",
                    instruction.seq_no, seq
                )),
                Some(_) => {}
            }
        }
    }
}

fn references_in_value(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => {
            for reference in find_references(text) {
                out.insert(reference.name);
            }
        }
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(name)) = map.get("var") {
                    out.insert(name.clone());
                    return;
                }
            }
            for nested in map.values() {
                references_in_value(nested, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                references_in_value(item, out);
            }
        }
        _ => {}
    }
}

/// Path-insensitive variable-flow check: walking the plan in sequence order,
/// every referenced variable must be bound by an earlier assign or
/// `output_vars`. `reasoning` instructions are inert.
fn check_variable_flow(plan: &Plan, problems: &mut Vec<String>) {
    let mut bound: BTreeSet<String> = BTreeSet::new();
    for instruction in plan.ordered() {
        let mut referenced = BTreeSet::new();
        match &instruction.kind {
            InstructionKind::Reasoning(_) => continue,
            InstructionKind::Assign(writes) => {
                for (name, expression) in writes {
                    if !is_valid_name(name) {
                        problems.push(format!(
                            "seq_no {}: invalid variable name '{}'",
                            instruction.seq_no, name
                        ));
                    }
                    references_in_value(expression, &mut referenced);
                }
            }
            InstructionKind::Calling(params) => {
                for value in params.tool_params.values() {
                    references_in_value(value, &mut referenced);
                }
            }
            InstructionKind::Jmp(params) => {
                if let Some(prompt) = &params.condition_prompt {
                    references_in_value(&Value::String(prompt.clone()), &mut referenced);
                }
                if let Some(context) = &params.context {
                    references_in_value(&Value::String(context.clone()), &mut referenced);
                }
            }
        }
        for name in referenced {
            if !bound.contains(&name) {
                problems.push(format!(
                    "seq_no {}: variable '{}' referenced before any binding",
                    instruction.seq_no, name
                ));
            }
        }
        match &instruction.kind {
            InstructionKind::Assign(writes) => {
                bound.extend(writes.keys().cloned());
            }
            InstructionKind::Calling(params) => {
                bound.extend(params.output_vars.names().iter().map(|s| s.to_string()));
            }
            _ => {}
        }
    }
}

/// Whether an instruction binds `final_answer`.
fn binds_final_answer(kind: &InstructionKind) -> bool {
    match kind {
        InstructionKind::Assign(writes) => writes.contains_key(FINAL_ANSWER),
        InstructionKind::Calling(params) => match &params.output_vars {
            OutputVars::One(name) => name == FINAL_ANSWER,
            OutputVars::Many(names) => names.iter().any(|n| n == FINAL_ANSWER),
        },
        _ => false,
    }
}

/// Every instruction whose successor set includes the terminal sentinel must
/// bind `final_answer`.
fn check_final_answer(plan: &Plan, problems: &mut Vec<String>) {
    for instruction in &plan.instructions {
        let mut successors: Vec<Option<i64>> = Vec::new();
        match &instruction.kind {
            InstructionKind::Jmp(params) => {
                if params.is_conditional() {
                    successors.push(params.jump_if_true);
                    successors.push(params.jump_if_false);
                } else {
                    successors.push(params.target_seq);
                }
            }
            _ => successors.push(plan.seq_no_after(instruction.seq_no)),
        }
        let reaches_terminal = successors.iter().any(|s| match s {
            Some(seq) => !plan.contains_seq(*seq),
            None => true,
        });
        if reaches_terminal && !binds_final_answer(&instruction.kind) {
            problems.push(format!(
                "seq_no {}: last instruction on a forward path does not bind final_answer",
                instruction.seq_no
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ResultShape, Tool, ToolMeta};
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::Arc;

    struct NoopTool(&'static str);

    #[async_trait]
    impl Tool for NoopTool {
        fn meta(&self) -> ToolMeta {
            ToolMeta::new(self.0, "noop").with_result(ResultShape::Single)
        }

        async fn invoke(&self, _params: Map<String, Value>) -> Result<Value, VmError> {
            Ok(Value::Null)
        }
    }

    fn fixture() -> (ToolRegistry, Namespace) {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(NoopTool("llm_generate")));
        tools.register(Arc::new(NoopTool("vector_search")));
        let namespace = Namespace::new("test", vec!["llm_generate".to_string()]);
        (tools, namespace)
    }

    fn parse(raw: &str) -> Plan {
        Plan::parse(raw).expect("plan")
    }

    #[test]
    fn test_valid_plan_passes() {
        let (tools, namespace) = fixture();
        let plan = parse(
            r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"llm_generate","tool_params":{"prompt":"hi"},"output_vars":"draft"}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"${draft}"}}
            ]"#,
        );
        assert!(validate_plan(&plan, &tools, &namespace).is_ok());
    }

    #[test]
    fn test_duplicate_seq_no_rejected() {
        let (tools, namespace) = fixture();
        let plan = parse(
            r#"[
                {"seq_no":0,"type":"assign","parameters":{"final_answer":"a"}},
                {"seq_no":0,"type":"assign","parameters":{"final_answer":"b"}}
            ]"#,
        );
        let err = validate_plan(&plan, &tools, &namespace).unwrap_err();
        assert!(err.message.contains("duplicate seq_no"));
    }

    #[test]
    fn test_tool_outside_namespace_rejected() {
        let (tools, namespace) = fixture();
        let plan = parse(
            r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"vector_search","tool_params":{},"output_vars":"hits"}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"${hits}"}}
            ]"#,
        );
        let err = validate_plan(&plan, &tools, &namespace).unwrap_err();
        assert!(err.message.contains("not visible in namespace"));
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let (tools, namespace) = fixture();
        let plan = parse(
            r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"nope","tool_params":{},"output_vars":"x"}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"${x}"}}
            ]"#,
        );
        let err = validate_plan(&plan, &tools, &namespace).unwrap_err();
        assert!(err.message.contains("not registered"));
    }

    #[test]
    fn test_unbound_reference_rejected() {
        let (tools, namespace) = fixture();
        let plan = parse(
            r#"[{"seq_no":0,"type":"assign","parameters":{"final_answer":"${ghost}"}}]"#,
        );
        let err = validate_plan(&plan, &tools, &namespace).unwrap_err();
        assert!(err.message.contains("referenced before any binding"));
    }

    #[test]
    fn test_unresolved_jump_target_rejected() {
        let (tools, namespace) = fixture();
        let plan = parse(
            r#"[
                {"seq_no":0,"type":"jmp","parameters":{"target_seq":9}},
                {"seq_no":1,"type":"assign","parameters":{"final_answer":"x"}}
            ]"#,
        );
        let err = validate_plan(&plan, &tools, &namespace).unwrap_err();
        assert!(err.message.contains("target_seq 9"));
    }

    #[test]
    fn test_exit_without_final_answer_rejected() {
        let (tools, namespace) = fixture();
        let plan = parse(r#"[{"seq_no":0,"type":"assign","parameters":{"x":"1"}}]"#);
        let err = validate_plan(&plan, &tools, &namespace).unwrap_err();
        assert!(err.message.contains("final_answer"));
    }

    #[test]
    fn test_conditional_exit_paths_both_checked() {
        let (tools, namespace) = fixture();
        // The false branch jumps past the end without binding final_answer.
        let plan = parse(
            r#"[
                {"seq_no":0,"type":"assign","parameters":{"n":"4"}},
                {"seq_no":1,"type":"jmp","parameters":{"condition_prompt":"is ${n} even","jump_if_true":2,"jump_if_false":5}},
                {"seq_no":2,"type":"assign","parameters":{"final_answer":"even"}}
            ]"#,
        );
        let err = validate_plan(&plan, &tools, &namespace).unwrap_err();
        assert!(err.message.contains("jump_if_false targets unknown seq_no 5"));
    }

    #[test]
    fn test_errors_collected_into_details() {
        let (tools, namespace) = fixture();
        let plan = parse(
            r#"[
                {"seq_no":0,"type":"calling","parameters":{"tool_name":"nope","tool_params":{},"output_vars":"x"}},
                {"seq_no":0,"type":"assign","parameters":{"y":"${ghost}"}}
            ]"#,
        );
        let err = validate_plan(&plan, &tools, &namespace).unwrap_err();
        let details = err.details.as_array().expect("details array");
        assert!(details.len() >= 3);
    }
}
