//! The virtual machine: owns one VM state and drives single-stepping.
//!
//! The VM is a pure state machine: two VMs with identical state and
//! identical tool outputs produce identical next states. All
//! non-determinism lives behind the tool registry and the reasoning LLM.

mod dispatch;

pub use dispatch::{dispatch, DispatchContext, DispatchOutcome};

use serde_json::{Map, Value};

use crate::error::VmError;
use crate::types::{Instruction, InstructionKind, Plan, ResponseFormat, VmState, VmStatus};
use crate::vars::FINAL_ANSWER;

/// Commit-ready record of one executed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub seq_no: Option<i64>,
    pub title: String,
    pub input_parameters: Value,
    pub output_variables: Map<String, Value>,
    pub error: Option<VmError>,
    pub completed: bool,
}

/// A plan execution VM.
#[derive(Debug, Clone)]
pub struct Vm {
    state: VmState,
    status: VmStatus,
}

impl Vm {
    pub fn new(
        goal: impl Into<String>,
        namespace: impl Into<String>,
        response_format: ResponseFormat,
    ) -> Self {
        Self {
            state: VmState::new(goal, namespace).with_response_format(response_format),
            status: VmStatus::Idle,
        }
    }

    /// Reconstruct a VM from a commit's snapshot.
    pub fn from_snapshot(state: VmState) -> Self {
        let status = if state.goal_completed {
            VmStatus::Completed
        } else if state.last_error.is_some() {
            VmStatus::Errored
        } else {
            VmStatus::Idle
        };
        Self { state, status }
    }

    pub fn state(&self) -> &VmState {
        &self.state
    }

    pub fn into_state(self) -> VmState {
        self.state
    }

    pub fn status(&self) -> VmStatus {
        self.status
    }

    pub fn is_completed(&self) -> bool {
        self.status == VmStatus::Completed
    }

    pub fn is_errored(&self) -> bool {
        self.status == VmStatus::Errored
    }

    /// Load a plan and position the program counter on its first
    /// instruction. Clears any previous error.
    pub fn load(&mut self, plan: Plan) {
        let first = plan.instructions.iter().map(|i| i.seq_no).min().unwrap_or(0);
        self.state.plan = plan;
        self.state.program_counter = first;
        self.state.last_error = None;
        self.state.goal_completed = false;
        self.status = VmStatus::Running;
    }

    /// The instruction the program counter points at, if not terminal.
    pub fn current_instruction(&self) -> Option<&Instruction> {
        self.state.plan.get(self.state.program_counter)
    }

    /// Reposition the program counter. The target must be a valid `seq_no`
    /// or the terminal sentinel.
    pub fn reset(&mut self, pc: i64) -> Result<(), VmError> {
        if !self.state.plan.contains_seq(pc) && pc != self.state.plan.terminal_pc() {
            return Err(VmError::internal(format!(
                "cannot reset program counter to {}: not a seq_no of the plan",
                pc
            )));
        }
        self.state.program_counter = pc;
        self.state.last_error = None;
        self.status = VmStatus::Running;
        Ok(())
    }

    /// Execute the instruction under the program counter.
    ///
    /// On error the state is left untouched apart from `last_error`; on
    /// success all writes are applied atomically before the program counter
    /// advances.
    pub async fn step(&mut self, ctx: &DispatchContext<'_>) -> StepOutcome {
        if self.state.at_terminal() {
            return self.finish_terminal();
        }

        let Some(instruction) = self.current_instruction().cloned() else {
            return self.fail(
                None,
                VmError::internal(format!(
                    "program counter {} does not address an instruction",
                    self.state.program_counter
                )),
            );
        };
        let seq_no = instruction.seq_no;
        let title = step_title(&instruction);

        self.status = match instruction.kind {
            InstructionKind::Calling(_) => VmStatus::AwaitingTool,
            InstructionKind::Jmp(ref params) if params.is_conditional() => VmStatus::AwaitingLlm,
            _ => VmStatus::Running,
        };

        let outcome = match dispatch(&self.state, &instruction, ctx).await {
            Ok(outcome) => outcome,
            Err(error) => return self.fail(Some(seq_no), error),
        };
        self.status = VmStatus::Running;

        let output_variables: Map<String, Value> = outcome
            .writes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Err(error) = self.state.variables.apply(outcome.writes) {
            return self.fail(Some(seq_no), error);
        }
        self.state.warnings.extend(outcome.warnings);
        if let Some(message) = outcome.message {
            self.state.messages.push(message);
        }
        self.state.program_counter = outcome.next_pc;

        let completed =
            self.state.at_terminal() && self.state.variables.contains(FINAL_ANSWER);
        if completed {
            self.state.goal_completed = true;
            self.status = VmStatus::Completed;
            tracing::info!(seq_no, "goal completed");
        }

        StepOutcome {
            seq_no: Some(seq_no),
            title,
            input_parameters: outcome.input_parameters,
            output_variables,
            error: None,
            completed,
        }
    }

    /// The program counter moved past the last instruction without a
    /// terminating assign; close out the run.
    fn finish_terminal(&mut self) -> StepOutcome {
        if self.state.variables.contains(FINAL_ANSWER) {
            self.state.goal_completed = true;
            self.status = VmStatus::Completed;
            return StepOutcome {
                seq_no: None,
                title: "Execution completed".to_string(),
                input_parameters: Value::Null,
                output_variables: Map::new(),
                error: None,
                completed: true,
            };
        }
        self.fail(
            None,
            VmError::internal("plan ended without binding final_answer"),
        )
    }

    fn fail(&mut self, seq_no: Option<i64>, error: VmError) -> StepOutcome {
        let error = match seq_no {
            Some(seq) => error.at_seq(seq),
            None => error,
        };
        tracing::error!(seq_no = ?seq_no, error = %error, "step failed");
        self.state.last_error = Some(error.clone());
        self.status = VmStatus::Errored;
        StepOutcome {
            seq_no,
            title: match seq_no {
                Some(seq) => format!("Failed at seq_no: {}", seq),
                None => "Execution failed".to_string(),
            },
            input_parameters: Value::Null,
            output_variables: Map::new(),
            error: Some(error),
            completed: false,
        }
    }
}

fn step_title(instruction: &Instruction) -> String {
    match &instruction.kind {
        InstructionKind::Calling(params) => format!(
            "Executed seq_no: {}, step: 'calling', tool: {}",
            instruction.seq_no, params.tool_name
        ),
        kind => format!(
            "Executed seq_no: {}, step: {}",
            instruction.seq_no,
            kind.label()
        ),
    }
}
