//! Plan and instruction types.
//!
//! A plan is an ordered list of instructions forming a small program for the
//! VM. Instructions are addressed by `seq_no`, never by array index, so jumps
//! stay valid when a plan is patched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::VmError;

/// Reasoning metadata emitted by the planner. No side effect at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningParams {
    #[serde(default)]
    pub chain_of_thoughts: String,
    #[serde(default)]
    pub dependency_analysis: String,
}

/// Output binding of a `calling` instruction: a single variable receives the
/// whole result, or a list of variables unpacks a keyed mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputVars {
    One(String),
    Many(Vec<String>),
}

impl OutputVars {
    pub fn names(&self) -> Vec<&str> {
        match self {
            OutputVars::One(name) => vec![name.as_str()],
            OutputVars::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Parameters of a `calling` instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallingParams {
    pub tool_name: String,
    #[serde(default)]
    pub tool_params: Map<String, Value>,
    pub output_vars: OutputVars,
}

/// Parameters of a `jmp` instruction.
///
/// Either `target_seq` (unconditional) or the conditional triple
/// `condition_prompt` / `jump_if_true` / `jump_if_false` must be present;
/// validation rejects mixed shapes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JmpParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_if_true: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_if_false: Option<i64>,
}

impl JmpParams {
    pub fn is_conditional(&self) -> bool {
        self.condition_prompt.is_some()
    }
}

/// Instruction payload, tagged by the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "snake_case")]
pub enum InstructionKind {
    Reasoning(ReasoningParams),
    Assign(Map<String, Value>),
    Calling(CallingParams),
    Jmp(JmpParams),
}

impl InstructionKind {
    pub fn label(&self) -> &'static str {
        match self {
            InstructionKind::Reasoning(_) => "reasoning",
            InstructionKind::Assign(_) => "assign",
            InstructionKind::Calling(_) => "calling",
            InstructionKind::Jmp(_) => "jmp",
        }
    }
}

/// One record of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub seq_no: i64,
    #[serde(flatten)]
    pub kind: InstructionKind,
}

impl Instruction {
    pub fn reasoning(seq_no: i64, params: ReasoningParams) -> Self {
        Self {
            seq_no,
            kind: InstructionKind::Reasoning(params),
        }
    }

    pub fn assign(seq_no: i64, writes: Map<String, Value>) -> Self {
        Self {
            seq_no,
            kind: InstructionKind::Assign(writes),
        }
    }

    pub fn calling(seq_no: i64, params: CallingParams) -> Self {
        Self {
            seq_no,
            kind: InstructionKind::Calling(params),
        }
    }

    pub fn jmp(seq_no: i64, params: JmpParams) -> Self {
        Self {
            seq_no,
            kind: InstructionKind::Jmp(params),
        }
    }
}

/// An ordered sequence of instructions. Fixed once execution starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    pub instructions: Vec<Instruction>,
}

impl Plan {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    /// Parse a plan from its JSON wire form (an array of instructions).
    pub fn parse(raw: &str) -> Result<Self, VmError> {
        serde_json::from_str(raw)
            .map_err(|e| VmError::validation(format!("invalid plan JSON: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Look up an instruction by sequence number.
    pub fn get(&self, seq_no: i64) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.seq_no == seq_no)
    }

    pub fn contains_seq(&self, seq_no: i64) -> bool {
        self.get(seq_no).is_some()
    }

    pub fn max_seq(&self) -> Option<i64> {
        self.instructions.iter().map(|i| i.seq_no).max()
    }

    /// Sentinel program counter one past the highest sequence number.
    pub fn terminal_pc(&self) -> i64 {
        self.max_seq().map(|m| m + 1).unwrap_or(0)
    }

    /// Whether the given program counter is past the last instruction.
    pub fn is_terminal(&self, pc: i64) -> bool {
        !self.contains_seq(pc)
    }

    /// The smallest `seq_no` strictly greater than `current`, or `None` when
    /// `current` is the last instruction.
    pub fn seq_no_after(&self, current: i64) -> Option<i64> {
        self.instructions
            .iter()
            .map(|i| i.seq_no)
            .filter(|&s| s > current)
            .min()
    }

    /// Instructions ordered by sequence number.
    pub fn ordered(&self) -> Vec<&Instruction> {
        let mut out: Vec<&Instruction> = self.instructions.iter().collect();
        out.sort_by_key(|i| i.seq_no);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_plan_json() -> &'static str {
        r#"[
            {"seq_no":0,"type":"reasoning","parameters":{"chain_of_thoughts":"think","dependency_analysis":"none"}},
            {"seq_no":1,"type":"calling","parameters":{"tool_name":"retrieve_knowledge_graph","tool_params":{"query":"X"},"output_vars":["x_info"]}},
            {"seq_no":4,"type":"jmp","parameters":{"target_seq":6}},
            {"seq_no":6,"type":"assign","parameters":{"final_answer":"Summary: ${x_info}"}}
        ]"#
    }

    #[test]
    fn test_parse_then_serialize_round_trips() {
        let plan = Plan::parse(sample_plan_json()).expect("parse plan");
        assert_eq!(plan.len(), 4);

        let json = serde_json::to_string(&plan).expect("serialize");
        let back = Plan::parse(&json).expect("reparse");
        assert_eq!(plan, back);
    }

    #[test]
    fn test_instruction_kinds_decode() {
        let plan = Plan::parse(sample_plan_json()).unwrap();
        assert!(matches!(
            plan.get(0).unwrap().kind,
            InstructionKind::Reasoning(_)
        ));
        match &plan.get(1).unwrap().kind {
            InstructionKind::Calling(params) => {
                assert_eq!(params.tool_name, "retrieve_knowledge_graph");
                assert_eq!(params.output_vars, OutputVars::Many(vec!["x_info".into()]));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
        match &plan.get(4).unwrap().kind {
            InstructionKind::Jmp(params) => {
                assert_eq!(params.target_seq, Some(6));
                assert!(!params.is_conditional());
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_single_output_var_decodes_as_string() {
        let raw = r#"{"seq_no":0,"type":"calling","parameters":{"tool_name":"vector_search","tool_params":{"query":"q","top_k":3},"output_vars":"hits"}}"#;
        let instr: Instruction = serde_json::from_str(raw).unwrap();
        match instr.kind {
            InstructionKind::Calling(params) => {
                assert_eq!(params.output_vars, OutputVars::One("hits".into()));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_seq_no_after_skips_gaps() {
        let plan = Plan::parse(sample_plan_json()).unwrap();
        assert_eq!(plan.seq_no_after(1), Some(4));
        assert_eq!(plan.seq_no_after(4), Some(6));
        assert_eq!(plan.seq_no_after(6), None);
        assert_eq!(plan.terminal_pc(), 7);
        assert!(plan.is_terminal(7));
        assert!(!plan.is_terminal(6));
    }

    #[test]
    fn test_assign_parameters_keep_raw_values() {
        let raw = r#"[{"seq_no":0,"type":"assign","parameters":{"a":3,"b":{"nested":true}}}]"#;
        let plan = Plan::parse(raw).unwrap();
        match &plan.get(0).unwrap().kind {
            InstructionKind::Assign(writes) => {
                assert_eq!(writes.get("a"), Some(&json!(3)));
                assert_eq!(writes.get("b"), Some(&json!({"nested": true})));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
