//! Commits: immutable, content-addressed snapshots of VM state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::state::VmState;
use crate::error::VmError;

/// What produced a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitType {
    Initial,
    StepExecution,
    PlanUpdate,
    Fork,
    Manual,
}

/// Structured payload describing one commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitDetails {
    /// Interpolated input parameters of the executed instruction.
    #[serde(default)]
    pub input_parameters: Value,
    /// Variables written by the instruction.
    #[serde(default)]
    pub output_variables: Map<String, Value>,
    /// Line diff of the canonical snapshot against the parent commit.
    /// Advisory only; replay uses the snapshot.
    #[serde(default)]
    pub diff: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VmError>,
}

/// One immutable record on a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub commit_hash: String,
    pub parent_hash: Option<String>,
    pub task_id: Uuid,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_no: Option<i64>,
    pub time: DateTime<Utc>,
    pub message: String,
    pub commit_type: CommitType,
    pub title: String,
    #[serde(default)]
    pub details: CommitDetails,
    pub vm_state_snapshot: VmState,
}

impl Commit {
    /// Build a commit, computing its content hash over every field except
    /// the hash itself.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_hash: Option<String>,
        task_id: Uuid,
        branch: impl Into<String>,
        seq_no: Option<i64>,
        time: DateTime<Utc>,
        message: impl Into<String>,
        commit_type: CommitType,
        title: impl Into<String>,
        details: CommitDetails,
        vm_state_snapshot: VmState,
    ) -> Self {
        let mut commit = Self {
            commit_hash: String::new(),
            parent_hash,
            task_id,
            branch: branch.into(),
            seq_no,
            time,
            message: message.into(),
            commit_type,
            title: title.into(),
            details,
            vm_state_snapshot,
        };
        commit.commit_hash = commit.content_hash();
        commit
    }

    /// SHA-256 over the canonical JSON of the commit body (hash field
    /// excluded).
    pub fn content_hash(&self) -> String {
        let body = serde_json::json!({
            "parent_hash": self.parent_hash,
            "task_id": self.task_id,
            "branch": self.branch,
            "seq_no": self.seq_no,
            "time": self.time,
            "message": self.message,
            "commit_type": self.commit_type,
            "details": self.details,
            "vm_state_snapshot": self.vm_state_snapshot,
        });
        let canonical = canonical_json(&body);
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{:x}", digest)
    }

    /// Canonical serialization of the snapshot, used for diffs.
    pub fn canonical_snapshot(&self) -> String {
        let value = serde_json::to_value(&self.vm_state_snapshot).unwrap_or(Value::Null);
        canonical_json(&value)
    }
}

/// Serialize a value as canonical JSON: sorted keys, two-space indent, LF
/// line endings, stable number formatting.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, 0, &mut out);
    out
}

fn write_canonical(value: &Value, indent: usize, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            out.push_str(&value.to_string());
        }
        Value::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return;
            }
            out.push_str("[\n");
            for (idx, item) in items.iter().enumerate() {
                push_indent(indent + 1, out);
                write_canonical(item, indent + 1, out);
                if idx + 1 < items.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            push_indent(indent, out);
            out.push(']');
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return;
            }
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push_str("{\n");
            for (idx, key) in keys.iter().enumerate() {
                push_indent(indent + 1, out);
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push_str(": ");
                write_canonical(&map[key.as_str()], indent + 1, out);
                if idx + 1 < keys.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            push_indent(indent, out);
            out.push('}');
        }
    }
}

fn push_indent(indent: usize, out: &mut String) {
    for _ in 0..indent {
        out.push_str("  ");
    }
}

/// Line-based diff between two canonical snapshots, unified format with
/// three lines of context.
pub fn snapshot_diff(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = diff_ops(&old_lines, &new_lines);
    render_unified(&old_lines, &new_lines, &ops, 3)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DiffOp {
    Keep,
    Delete,
    Insert,
}

// Classic LCS table; snapshots are small enough that O(n*m) is fine.
fn diff_ops(old: &[&str], new: &[&str]) -> Vec<(DiffOp, usize, usize)> {
    let n = old.len();
    let m = new.len();
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }
    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push((DiffOp::Keep, i, j));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            ops.push((DiffOp::Delete, i, j));
            i += 1;
        } else {
            ops.push((DiffOp::Insert, i, j));
            j += 1;
        }
    }
    while i < n {
        ops.push((DiffOp::Delete, i, j));
        i += 1;
    }
    while j < m {
        ops.push((DiffOp::Insert, i, j));
        j += 1;
    }
    ops
}

fn render_unified(
    old: &[&str],
    new: &[&str],
    ops: &[(DiffOp, usize, usize)],
    context: usize,
) -> String {
    // Indexes of non-Keep ops.
    let changed: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, (op, _, _))| *op != DiffOp::Keep)
        .map(|(idx, _)| idx)
        .collect();
    if changed.is_empty() {
        return String::new();
    }

    // Group changes into hunks separated by more than 2*context keep lines.
    let mut hunks: Vec<(usize, usize)> = Vec::new();
    let mut start = changed[0];
    let mut end = changed[0];
    for &idx in &changed[1..] {
        if idx - end > context * 2 {
            hunks.push((start, end));
            start = idx;
        }
        end = idx;
    }
    hunks.push((start, end));

    let mut out = String::new();
    for (first, last) in hunks {
        let lo = first.saturating_sub(context);
        let hi = (last + context + 1).min(ops.len());
        let old_start = ops[lo].1 + 1;
        let new_start = ops[lo].2 + 1;
        let old_count = ops[lo..hi]
            .iter()
            .filter(|(op, _, _)| *op != DiffOp::Insert)
            .count();
        let new_count = ops[lo..hi]
            .iter()
            .filter(|(op, _, _)| *op != DiffOp::Delete)
            .count();
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_start, old_count, new_start, new_count
        ));
        for &(op, i, j) in &ops[lo..hi] {
            match op {
                DiffOp::Keep => {
                    out.push(' ');
                    out.push_str(old[i]);
                }
                DiffOp::Delete => {
                    out.push('-');
                    out.push_str(old[i]);
                }
                DiffOp::Insert => {
                    out.push('+');
                    out.push_str(new[j]);
                }
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_commit(message: &str) -> Commit {
        Commit::new(
            None,
            Uuid::nil(),
            "main",
            Some(0),
            DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            message,
            CommitType::Initial,
            "initial",
            CommitDetails::default(),
            VmState::new("goal", "default"),
        )
    }

    #[test]
    fn test_commit_hash_is_stable() {
        let a = sample_commit("m");
        let b = sample_commit("m");
        assert_eq!(a.commit_hash, b.commit_hash);
        assert_eq!(a.commit_hash, a.content_hash());
    }

    #[test]
    fn test_commit_hash_changes_with_content() {
        let a = sample_commit("m");
        let b = sample_commit("other");
        assert_ne!(a.commit_hash, b.commit_hash);
    }

    #[test]
    fn test_canonical_json_sorts_keys_and_indents() {
        let value = json!({"b": [1, {"z": 1, "a": 2}], "a": "x"});
        let canonical = canonical_json(&value);
        assert_eq!(
            canonical,
            "{\n  \"a\": \"x\",\n  \"b\": [\n    1,\n    {\n      \"a\": 2,\n      \"z\": 1\n    }\n  ]\n}"
        );
    }

    #[test]
    fn test_snapshot_diff_marks_changed_lines() {
        let old = "a\nb\nc\nd\ne\nf\ng\nh";
        let new = "a\nb\nc\nd2\ne\nf\ng\nh";
        let diff = snapshot_diff(old, new);
        assert!(diff.contains("-d\n"));
        assert!(diff.contains("+d2\n"));
        assert!(diff.starts_with("@@"));
        // Context trims distant unchanged lines.
        assert!(!diff.contains(" h\n"));
    }

    #[test]
    fn test_snapshot_diff_empty_for_identical_inputs() {
        assert_eq!(snapshot_diff("a\nb", "a\nb"), "");
    }
}
