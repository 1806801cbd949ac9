//! Planner abstraction: produces initial plans, repair patches and
//! step-level rewrites. Implemented by the LLM adapter crate.

use async_trait::async_trait;

use crate::error::VmError;
use crate::tools::{Namespace, ToolMeta};
use crate::types::{Plan, ResponseFormat};
use crate::vars::VariableStore;

/// Inputs for initial plan generation.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub goal: String,
    pub namespace: Namespace,
    pub response_format: ResponseFormat,
    pub tool_catalog: Vec<ToolMeta>,
    pub best_practices_hint: Option<String>,
}

/// Outcome of a repair attempt: a patched plan to resume with, or an abort.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Plan with instructions replaced or appended from the failing
    /// `seq_no` onward.
    Patched(Plan),
    /// The updater declined to repair; the reason becomes part of the
    /// terminal error.
    Abort(String),
}

/// Why a plan is being updated: an execution failure to repair, or an
/// external natural-language suggestion to apply.
#[derive(Debug, Clone)]
pub enum UpdateReason<'a> {
    Failure(&'a VmError),
    Suggestion(&'a str),
}

/// The reasoning LLM behind plan generation, repair and step optimization.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<Plan, VmError>;

    async fn update(
        &self,
        plan: &Plan,
        failing_seq_no: i64,
        reason: UpdateReason<'_>,
        variables: &VariableStore,
    ) -> Result<UpdateOutcome, VmError>;

    async fn optimize_step(
        &self,
        plan: &Plan,
        seq_no: i64,
        suggestion: &str,
        variables: &VariableStore,
    ) -> Result<Plan, VmError>;
}
