//! Instruction dispatch: executes one instruction against a VM state and
//! returns the resulting writes and the next program counter.
//!
//! All parameter values are interpolated against the pre-instruction
//! variable store before execution; writes are returned to the caller and
//! applied atomically by the VM, so partially updated state is never
//! observable.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::error::{ErrorKind, VmError};
use crate::llm::{extract_first_json_object, parse_condition_reply, TextGenerator};
use crate::tools::{Namespace, ToolRegistry};
use crate::types::{
    CallingParams, Instruction, InstructionKind, JmpParams, OutputVars, ReasoningParams, VmState,
};
use crate::vars::{eval_assign_rhs, resolve_parameter};

const CONDITION_RESPONSE_FORMAT: &str = "\nRespond with a JSON object in the following format:\n{\n  \"result\": boolean,\n  \"explanation\": string\n}";
const STRICT_RETRY_APPENDIX: &str =
    "\nReturn ONLY the JSON object. Do not add prose, markdown or code fences.";

/// External collaborators needed to dispatch instructions.
pub struct DispatchContext<'a> {
    pub tools: &'a ToolRegistry,
    pub namespace: &'a Namespace,
    pub reasoner: &'a dyn TextGenerator,
    /// Per-invocation deadline for tool and LLM calls.
    pub call_timeout: Duration,
}

/// Result of executing one instruction.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Variable writes to apply atomically.
    pub writes: BTreeMap<String, Value>,
    /// The `seq_no` to execute next; one past the maximum when terminal.
    pub next_pc: i64,
    /// Interpolated argument map for commit details.
    pub input_parameters: Value,
    /// Interpolation warnings to append to the VM state.
    pub warnings: Vec<String>,
    /// Reasoning trace recorded by `reasoning` instructions.
    pub message: Option<Value>,
}

/// Execute a single instruction. Errors never leave partial writes behind.
pub async fn dispatch(
    state: &VmState,
    instruction: &Instruction,
    ctx: &DispatchContext<'_>,
) -> Result<DispatchOutcome, VmError> {
    let seq_no = instruction.seq_no;
    match &instruction.kind {
        InstructionKind::Reasoning(params) => dispatch_reasoning(state, seq_no, params),
        InstructionKind::Assign(writes) => dispatch_assign(state, seq_no, writes),
        InstructionKind::Calling(params) => dispatch_calling(state, seq_no, params, ctx).await,
        InstructionKind::Jmp(params) => dispatch_jmp(state, seq_no, params, ctx).await,
    }
    .map_err(|e| e.at_seq(seq_no))
}

fn next_after(state: &VmState, seq_no: i64) -> i64 {
    state
        .plan
        .seq_no_after(seq_no)
        .unwrap_or_else(|| state.plan.terminal_pc())
}

fn dispatch_reasoning(
    state: &VmState,
    seq_no: i64,
    params: &ReasoningParams,
) -> Result<DispatchOutcome, VmError> {
    tracing::info!(
        seq_no,
        chain_of_thoughts = %params.chain_of_thoughts,
        "reasoning step"
    );
    Ok(DispatchOutcome {
        writes: BTreeMap::new(),
        next_pc: next_after(state, seq_no),
        input_parameters: serde_json::to_value(params).unwrap_or(Value::Null),
        warnings: Vec::new(),
        message: Some(json!({
            "chain_of_thoughts": params.chain_of_thoughts,
            "dependency_analysis": params.dependency_analysis,
        })),
    })
}

fn dispatch_assign(
    state: &VmState,
    seq_no: i64,
    params: &Map<String, Value>,
) -> Result<DispatchOutcome, VmError> {
    if params.is_empty() {
        return Err(VmError::validation("assign instruction with no writes"));
    }
    // Every right-hand side is evaluated against the pre-instruction store;
    // writes within one assign never observe each other.
    let mut writes = BTreeMap::new();
    let mut warnings = Vec::new();
    for (name, expression) in params {
        let resolved = eval_assign_rhs(expression, &state.variables)?;
        warnings.extend(resolved.warnings);
        writes.insert(name.clone(), resolved.value);
    }
    Ok(DispatchOutcome {
        writes,
        next_pc: next_after(state, seq_no),
        input_parameters: Value::Object(params.clone()),
        warnings,
        message: None,
    })
}

async fn dispatch_calling(
    state: &VmState,
    seq_no: i64,
    params: &CallingParams,
    ctx: &DispatchContext<'_>,
) -> Result<DispatchOutcome, VmError> {
    let tool = ctx.tools.resolve(&params.tool_name, ctx.namespace)?;

    let mut resolved_params = Map::new();
    let mut warnings = Vec::new();
    for (name, value) in &params.tool_params {
        let resolved = resolve_parameter(value, &state.variables)?;
        warnings.extend(resolved.warnings);
        resolved_params.insert(name.clone(), resolved.value);
    }

    // When several output variables unpack one reply, tell the tool which
    // keys the mapping must carry.
    if let OutputVars::Many(names) = &params.output_vars {
        if names.len() > 1 {
            resolved_params.insert(
                "response_format".to_string(),
                Value::String(response_format_example(names)),
            );
        }
    }

    tracing::info!(
        seq_no,
        tool = %params.tool_name,
        "calling tool"
    );
    let result = tokio::time::timeout(ctx.call_timeout, tool.invoke(resolved_params.clone()))
        .await
        .map_err(|_| {
            VmError::timeout(format!(
                "tool '{}' exceeded {}s deadline",
                params.tool_name,
                ctx.call_timeout.as_secs()
            ))
        })??;

    let writes = bind_output_vars(&params.output_vars, result)?;
    Ok(DispatchOutcome {
        writes,
        next_pc: next_after(state, seq_no),
        input_parameters: Value::Object(resolved_params),
        warnings,
        message: None,
    })
}

fn response_format_example(names: &[String]) -> String {
    let mut example = Map::new();
    for name in names {
        example.insert(name.clone(), Value::String("<to be filled>".to_string()));
    }
    format!(
        "Respond with a JSON object in the following format:\n{}",
        serde_json::to_string_pretty(&Value::Object(example)).unwrap_or_default()
    )
}

/// Bind a tool result to output variables per the calling contract: a single
/// name receives the whole value, a list of names unpacks a keyed mapping.
fn bind_output_vars(
    output_vars: &OutputVars,
    result: Value,
) -> Result<BTreeMap<String, Value>, VmError> {
    let mut writes = BTreeMap::new();
    match output_vars {
        OutputVars::One(name) => {
            writes.insert(name.clone(), result);
        }
        OutputVars::Many(names) if names.len() == 1 => {
            writes.insert(names[0].clone(), result);
        }
        OutputVars::Many(names) => {
            let mapping = coerce_mapping(result)?;
            for name in names {
                let value = mapping.get(name).cloned().ok_or_else(|| {
                    VmError::tool_failed(format!(
                        "tool result is missing output key '{}'",
                        name
                    ))
                })?;
                writes.insert(name.clone(), value);
            }
        }
    }
    Ok(writes)
}

fn coerce_mapping(result: Value) -> Result<Map<String, Value>, VmError> {
    match result {
        Value::Object(map) => Ok(map),
        Value::String(text) => {
            let object = extract_first_json_object(&text).ok_or_else(|| {
                VmError::llm_parse(format!("no JSON object in tool output: {}", text))
            })?;
            match serde_json::from_str(object) {
                Ok(Value::Object(map)) => Ok(map),
                _ => Err(VmError::llm_parse(
                    "tool output did not parse to a JSON object",
                )),
            }
        }
        other => Err(VmError::tool_failed(format!(
            "expected a keyed mapping from the tool, got: {}",
            other
        ))),
    }
}

async fn dispatch_jmp(
    state: &VmState,
    seq_no: i64,
    params: &JmpParams,
    ctx: &DispatchContext<'_>,
) -> Result<DispatchOutcome, VmError> {
    if !params.is_conditional() {
        let target = params
            .target_seq
            .ok_or_else(|| VmError::validation("jmp without target_seq or condition_prompt"))?;
        return finish_jump(state, target, json!({ "target_seq": target }));
    }

    let (jump_if_true, jump_if_false) = match (params.jump_if_true, params.jump_if_false) {
        (Some(t), Some(f)) => (t, f),
        _ => {
            return Err(VmError::validation(
                "conditional jmp requires jump_if_true and jump_if_false",
            ))
        }
    };

    let prompt_resolved = resolve_parameter(
        &Value::String(params.condition_prompt.clone().unwrap_or_default()),
        &state.variables,
    )?;
    let context_resolved = match &params.context {
        Some(context) => Some(resolve_parameter(
            &Value::String(context.clone()),
            &state.variables,
        )?),
        None => None,
    };
    let mut warnings = prompt_resolved.warnings.clone();
    if let Some(resolved) = &context_resolved {
        warnings.extend(resolved.warnings.clone());
    }

    let prompt_text = match &prompt_resolved.value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let context_text = context_resolved.as_ref().map(|r| match &r.value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    let (result, explanation) =
        evaluate_condition(&prompt_text, context_text.as_deref(), ctx).await?;
    let target = if result { jump_if_true } else { jump_if_false };
    tracing::info!(
        seq_no,
        condition_result = result,
        target_seq = target,
        explanation = %explanation,
        "conditional jump"
    );

    let mut outcome = finish_jump(
        state,
        target,
        json!({
            "condition_prompt": prompt_text,
            "condition_result": result,
            "explanation": explanation,
            "target_seq": target,
        }),
    )?;
    outcome.warnings = warnings;
    Ok(outcome)
}

/// Ask the reasoning LLM a yes/no question. A malformed reply is retried
/// once with a stricter appendix before failing with a parse error.
async fn evaluate_condition(
    prompt: &str,
    context: Option<&str>,
    ctx: &DispatchContext<'_>,
) -> Result<(bool, String), VmError> {
    let base = format!("{}{}", prompt, CONDITION_RESPONSE_FORMAT);
    let mut last_err = None;
    for attempt in 0..2 {
        let full_prompt = if attempt == 0 {
            base.clone()
        } else {
            format!("{}{}", base, STRICT_RETRY_APPENDIX)
        };
        let reply = tokio::time::timeout(
            ctx.call_timeout,
            ctx.reasoner.generate(&full_prompt, context),
        )
        .await
        .map_err(|_| {
            VmError::timeout(format!(
                "condition evaluation exceeded {}s deadline",
                ctx.call_timeout.as_secs()
            ))
        })??;
        match parse_condition_reply(&reply) {
            Ok(parsed) => return Ok(parsed),
            Err(e) if e.kind == ErrorKind::LlmParse => {
                tracing::warn!(attempt, error = %e, "condition reply parse failed");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| VmError::llm_parse("condition evaluation failed")))
}

fn finish_jump(
    state: &VmState,
    target: i64,
    input_parameters: Value,
) -> Result<DispatchOutcome, VmError> {
    if !state.plan.contains_seq(target) {
        return Err(VmError::validation(format!(
            "jump target {} does not exist in the plan",
            target
        )));
    }
    Ok(DispatchOutcome {
        writes: BTreeMap::new(),
        next_pc: target,
        input_parameters,
        warnings: Vec::new(),
        message: None,
    })
}
