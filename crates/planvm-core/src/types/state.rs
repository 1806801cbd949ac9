//! VM state snapshot types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::plan::Plan;
use crate::error::VmError;
use crate::vars::{VariableStore, FINAL_ANSWER};

/// Recognized response-format options for generated answers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFormat {
    /// Language code the final answer should be written in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

/// Runtime status of a VM. Not part of the persisted snapshot; snapshots are
/// reconstructed into `Idle` and transition on the first step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Idle,
    Running,
    AwaitingTool,
    AwaitingLlm,
    Errored,
    Completed,
}

/// The full serializable state of one VM.
///
/// Snapshots are content-addressed by commits, so the field set must
/// serialize deterministically (the variable store sorts its keys).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmState {
    pub goal: String,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub plan: Plan,
    /// The `seq_no` to execute next, or one greater than the plan's maximum
    /// when execution has moved past the last instruction.
    #[serde(default)]
    pub program_counter: i64,
    #[serde(default)]
    pub variables: VariableStore,
    #[serde(default)]
    pub goal_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<VmError>,
    /// Interpolation warnings accumulated across steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Reasoning traces recorded by `reasoning` instructions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Value>,
}

impl VmState {
    pub fn new(goal: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    /// Whether the program counter points past the last instruction.
    pub fn at_terminal(&self) -> bool {
        self.plan.is_terminal(self.program_counter)
    }

    pub fn final_answer(&self) -> Option<&Value> {
        self.variables.get_opt(FINAL_ANSWER)
    }
}
