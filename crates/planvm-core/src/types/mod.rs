//! Core type definitions: plans, VM state snapshots and commits.

mod commit;
mod plan;
mod state;

pub use commit::{canonical_json, snapshot_diff, Commit, CommitDetails, CommitType};
pub use plan::{
    CallingParams, Instruction, InstructionKind, JmpParams, OutputVars, Plan, ReasoningParams,
};
pub use state::{ResponseFormat, VmState, VmStatus};
