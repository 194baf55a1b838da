//! Forge (code host) client abstraction.
//!
//! The pipeline only needs a narrow surface: installation credentials,
//! pull-request files and review comments, comment creation, combined
//! commit statuses and repository metadata.

pub mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use github::GitHubClient;

/// Errors emitted by forge clients.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("forge configuration error: {0}")]
    Configuration(String),

    #[error("forge authentication error: {0}")]
    Authentication(String),

    #[error("forge transport error: {0}")]
    Transport(String),

    #[error("forge API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("forge parse error: {0}")]
    Parse(String),
}

impl ForgeError {
    /// Permanent failures are not worth retrying (validation rejections
    /// such as an over-long comment body); transport hiccups are.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Api { status, .. } => (400..500).contains(status) && *status != 429,
            Self::Configuration(_) | Self::Authentication(_) => true,
            Self::Transport(_) | Self::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

/// State of a combined commit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

/// A commit status to set on the head commit.
#[derive(Debug, Clone)]
pub struct CommitStatus {
    pub state: StatusState,
    pub description: String,
    /// URL the forge links next to the status (the analysis page).
    pub target_url: String,
    pub context: String,
}

/// A review comment anchored at a diff position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub path: String,
    pub position: u32,
    pub body: String,
}

/// A file touched by a pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct PrFile {
    pub filename: String,
    pub status: String,
}

/// Repository metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub full_name: String,
    pub clone_url: String,
    #[serde(default)]
    pub private: bool,
}

/// The forge surface the pipeline consumes.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    async fn list_review_comments(
        &self,
        installation_id: i64,
        repo: &str,
        pr_number: i64,
    ) -> Result<Vec<ReviewComment>, ForgeError>;

    async fn create_review_comment(
        &self,
        installation_id: i64,
        repo: &str,
        pr_number: i64,
        commit_sha: &str,
        comment: &ReviewComment,
    ) -> Result<(), ForgeError>;

    async fn set_commit_status(
        &self,
        installation_id: i64,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), ForgeError>;

    async fn list_pr_files(
        &self,
        installation_id: i64,
        repo: &str,
        pr_number: i64,
    ) -> Result<Vec<PrFile>, ForgeError>;

    async fn repository(
        &self,
        installation_id: i64,
        repo: &str,
    ) -> Result<Repository, ForgeError>;
}

/// Retry an operation with bounded exponential backoff.
///
/// Permanent errors short-circuit; transient ones are retried up to
/// `attempts` times total.
pub async fn with_retries<T, F, Fut>(
    operation: &str,
    attempts: u32,
    mut f: F,
) -> Result<T, ForgeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ForgeError>>,
{
    let mut delay = std::time::Duration::from_millis(100);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                tracing::warn!(operation, attempt, error = %e, "forge call failed, retrying");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ForgeError::Transport("no attempts made".to_string())))
}
