//! The persisted analysis aggregate: one pipeline execution for one
//! (commit-from, commit-to) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::tool::ToolId;

/// Lifecycle status of an analysis.
///
/// Created `Pending`, finalised to exactly one terminal status and never
/// mutated thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    /// Zero issues and every step completed.
    Success,
    /// At least one issue across all tool runs.
    Failure,
    /// A step before tool execution failed (clone, diff, deps).
    Error,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown analysis status {other:?}")),
        }
    }
}

/// A single finding, anchored to an added line of the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// File path relative to the repository root.
    pub path: String,
    /// 1-based line number in the new file.
    pub line: u32,
    /// 1-based offset of that line within the file's unified-diff body;
    /// the anchor the forge expects for a review comment.
    pub hunk_pos: u32,
    /// Human-readable message, prefixed with the tool name.
    pub body: String,
}

/// Per-tool result within an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRun {
    pub tool_id: ToolId,
    pub duration_ms: u64,
    /// Issues in the order the tool produced them.
    pub issues: Vec<Issue>,
}

/// Persisted analysis aggregate.
///
/// Mutated only by the engine during its run; the terminal status and all
/// tool runs are committed to the store in a single finalising write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: Uuid,
    pub installation_id: i64,
    pub repo_id: i64,
    pub status: AnalysisStatus,
    pub created_at: DateTime<Utc>,
    pub clone_duration_ms: Option<u64>,
    pub deps_duration_ms: Option<u64>,
    pub total_duration_ms: Option<u64>,
    pub commit_from: Option<String>,
    pub commit_to: Option<String>,
    pub request_number: Option<i64>,
    /// Tool runs in configuration order.
    pub tool_runs: Vec<ToolRun>,
}

impl Analysis {
    /// A fresh pending record, as created by the dispatcher at job start.
    pub fn pending(id: Uuid, installation_id: i64, repo_id: i64) -> Self {
        Self {
            id,
            installation_id,
            repo_id,
            status: AnalysisStatus::Pending,
            created_at: Utc::now(),
            clone_duration_ms: None,
            deps_duration_ms: None,
            total_duration_ms: None,
            commit_from: None,
            commit_to: None,
            request_number: None,
            tool_runs: Vec::new(),
        }
    }

    /// Total issues across all tool runs.
    pub fn issue_count(&self) -> usize {
        self.tool_runs.iter().map(|run| run.issues.len()).sum()
    }

    /// Set the terminal status from the issue count: `Failure` iff at least
    /// one issue exists, `Success` otherwise. Only valid once every tool
    /// has run without a workspace-level error.
    pub fn conclude(&mut self) {
        self.status = if self.issue_count() > 0 {
            AnalysisStatus::Failure
        } else {
            AnalysisStatus::Success
        };
    }
}
