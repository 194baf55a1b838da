//! Queued job descriptions handed from the dispatcher to the engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An immutable description of work, created by the dispatcher and consumed
/// once by the engine.
///
/// The two event kinds need different fetch strategies, so the variant is
/// discriminated once on the worker side and the engine receives a concrete
/// shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Push {
        base_url: String,
        base_ref: String,
        head_url: String,
        head_ref: String,
        installation_id: i64,
        repo_id: i64,
    },
    PullRequest {
        base_url: String,
        base_ref: String,
        head_url: String,
        head_ref: String,
        installation_id: i64,
        repo_id: i64,
        pr_number: i64,
    },
}

impl Job {
    pub fn installation_id(&self) -> i64 {
        match self {
            Self::Push {
                installation_id, ..
            }
            | Self::PullRequest {
                installation_id, ..
            } => *installation_id,
        }
    }

    pub fn repo_id(&self) -> i64 {
        match self {
            Self::Push { repo_id, .. } | Self::PullRequest { repo_id, .. } => *repo_id,
        }
    }

    pub fn base_ref(&self) -> &str {
        match self {
            Self::Push { base_ref, .. } | Self::PullRequest { base_ref, .. } => base_ref,
        }
    }

    pub fn head_ref(&self) -> &str {
        match self {
            Self::Push { head_ref, .. } | Self::PullRequest { head_ref, .. } => head_ref,
        }
    }

    pub fn head_url(&self) -> &str {
        match self {
            Self::Push { head_url, .. } | Self::PullRequest { head_url, .. } => head_url,
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            Self::Push { base_url, .. } | Self::PullRequest { base_url, .. } => base_url,
        }
    }

    /// Forge-side pull-request number; `None` for push jobs.
    pub fn pr_number(&self) -> Option<i64> {
        match self {
            Self::Push { .. } => None,
            Self::PullRequest { pr_number, .. } => Some(*pr_number),
        }
    }
}

/// Queue envelope: the job plus the correlation data the worker needs to
/// report back (the pending analysis created at webhook time, and where on
/// the forge results land).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub analysis_id: Uuid,
    /// Repository full name (`owner/name`) for forge API calls.
    pub repo: String,
    /// Head commit the final status is posted on.
    pub head_sha: String,
    pub job: Job,
}
