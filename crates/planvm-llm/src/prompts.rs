//! Prompt assembly for plan generation, repair and step optimization.

use std::fmt::Write;

use planvm_core::planner::{GenerateRequest, UpdateReason};
use planvm_core::tools::ToolMeta;
use planvm_core::types::Plan;
use planvm_core::vars::VariableStore;

const INSTRUCTION_SET: &str = r#"The virtual machine executes a JSON array of instructions. Each instruction is
{"seq_no": <unique integer>, "type": <kind>, "parameters": {...}} with kinds:

- "reasoning": parameters carry "chain_of_thoughts" and "dependency_analysis"
  strings. No side effect.
- "assign": parameters map variable names to values. A value may be a JSON
  literal, a string with ${var} references, or an arithmetic expression over
  numbers such as "${count} * 2 + 1".
- "calling": parameters are "tool_name", "tool_params" (values may reference
  variables with ${var}) and "output_vars" (one name, or a list of names when
  the tool returns a JSON object to unpack).
- "jmp": either {"target_seq": N} for an unconditional jump, or
  {"condition_prompt": "...", "jump_if_true": N, "jump_if_false": M} for a
  branch decided by a yes/no question. Jumps address seq_no values.

Rules:
1) seq_no values must be unique integers; execution starts at the smallest.
2) Reference only variables already bound by an earlier assign or output_vars.
3) The last instruction along every path must bind the variable
   "final_answer"; binding it completes the goal.
4) Use only tools from the tool catalog.
5) Return ONLY the JSON array, no prose."#;

const PLAN_EXAMPLE: &str = r#"[
  {"seq_no":0,"type":"reasoning","parameters":{"chain_of_thoughts":"Look up X, then summarize.","dependency_analysis":"summary depends on x_info"}},
  {"seq_no":1,"type":"calling","parameters":{"tool_name":"retrieve_knowledge_graph","tool_params":{"query":"X"},"output_vars":["x_info"]}},
  {"seq_no":2,"type":"assign","parameters":{"final_answer":"Summary: ${x_info}"}}
]"#;

fn write_tool_catalog(buf: &mut String, catalog: &[ToolMeta]) {
    buf.push_str("Tool catalog:\n");
    for tool in catalog {
        let _ = writeln!(buf, "- name: {}", tool.name);
        let _ = writeln!(buf, "  description: {}", tool.description);
        if !tool.required_params.is_empty() {
            let _ = writeln!(buf, "  required_params: {}", tool.required_params.join(", "));
        }
        let _ = writeln!(buf, "  result: {:?}", tool.result);
    }
}

fn write_variables(buf: &mut String, variables: &VariableStore) {
    if variables.is_empty() {
        return;
    }
    buf.push_str("\nCurrent variables:\n");
    for (name, value) in variables.iter() {
        let preview = value.to_string();
        let preview = if preview.chars().count() > 200 {
            let truncated: String = preview.chars().take(200).collect();
            format!("{}...", truncated)
        } else {
            preview
        };
        let _ = writeln!(buf, "- {} = {}", name, preview);
    }
}

/// Prompt for initial plan generation.
pub fn generate_prompt(request: &GenerateRequest) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are the planner of a plan execution engine.\n\n");
    prompt.push_str(INSTRUCTION_SET);
    prompt.push_str("\n\nPlan example:\n");
    prompt.push_str(PLAN_EXAMPLE);
    prompt.push_str("\n\n");
    write_tool_catalog(&mut prompt, &request.tool_catalog);
    if let Some(lang) = &request.response_format.lang {
        let _ = writeln!(
            prompt,
            "\nThe final answer must be written in language '{}'.",
            lang
        );
    }
    if let Some(hint) = &request.best_practices_hint {
        let _ = writeln!(prompt, "\nGuidance:\n{}", hint);
    }
    let _ = write!(
        prompt,
        "\nGoal:\n{}\n\nReturn the plan as a JSON array.",
        request.goal
    );
    prompt
}

/// Prompt for plan repair after an instruction failure or an external
/// suggestion.
pub fn update_prompt(
    plan: &Plan,
    failing_seq_no: i64,
    reason: &UpdateReason<'_>,
    variables: &VariableStore,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are revising a plan that is partway through execution.\n\n");
    prompt.push_str(INSTRUCTION_SET);
    prompt.push_str("\n\nCurrent plan:\n");
    prompt.push_str(&serde_json::to_string_pretty(plan).unwrap_or_default());
    match reason {
        UpdateReason::Failure(error_summary) => {
            let _ = write!(
                prompt,
                "\n\nExecution failed at seq_no {} with error:\n{}\n",
                failing_seq_no, error_summary
            );
            if !error_summary.details.is_null() {
                let _ = writeln!(prompt, "Error details: {}", error_summary.details);
            }
        }
        UpdateReason::Suggestion(suggestion) => {
            let _ = write!(
                prompt,
                "\n\nExecution is paused at seq_no {}. Apply this suggestion:\n{}\n",
                failing_seq_no, suggestion
            );
        }
    }
    write_variables(&mut prompt, variables);
    let _ = write!(
        prompt,
        "\nProduce a corrected plan: keep the instructions before seq_no {} \
         unchanged and replace or append instructions from seq_no {} onward.\n\
         If the goal cannot be achieved, return {{\"abort\": \"<reason>\"}} instead.\n\
         Return ONLY the JSON array or the abort object.",
        failing_seq_no, failing_seq_no
    );
    prompt
}

/// Prompt rewriting a single instruction.
pub fn optimize_step_prompt(
    plan: &Plan,
    seq_no: i64,
    suggestion: &str,
    variables: &VariableStore,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are rewriting one instruction of a plan.\n\n");
    prompt.push_str(INSTRUCTION_SET);
    prompt.push_str("\n\nCurrent plan:\n");
    prompt.push_str(&serde_json::to_string_pretty(plan).unwrap_or_default());
    write_variables(&mut prompt, variables);
    let _ = write!(
        prompt,
        "\nRewrite ONLY the instruction with seq_no {} according to this \
         suggestion:\n{}\n\nKeep the same seq_no. Return ONLY the rewritten \
         instruction as a single JSON object.",
        seq_no, suggestion
    );
    prompt
}
