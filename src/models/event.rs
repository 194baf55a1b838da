//! Webhook payload shapes for the forge events the dispatcher accepts.
//!
//! Only the fields the pipeline needs are deserialised; everything else in
//! the payload is ignored.

use serde::Deserialize;

/// Installation reference carried on every app-scoped event.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationRef {
    pub id: i64,
}

/// Repository fields shared by push and pull-request events.
#[derive(Debug, Clone, Deserialize)]
pub struct EventRepository {
    pub id: i64,
    pub full_name: String,
    pub clone_url: String,
}

/// A `push` event.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// SHA of the previous head; all zeroes for a new branch.
    pub before: String,
    /// SHA of the new head.
    pub after: String,
    pub repository: EventRepository,
    pub installation: InstallationRef,
}

/// One side of a pull request (head or base).
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestSide {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: String,
    pub repo: EventRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestDetail {
    pub head: PullRequestSide,
    pub base: PullRequestSide,
}

/// A `pull_request` event.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: i64,
    pub pull_request: PullRequestDetail,
    pub repository: EventRepository,
    pub installation: InstallationRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationAccount {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationDetail {
    pub id: i64,
    pub account: InstallationAccount,
}

/// An `installation` lifecycle event for the forge app.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationEvent {
    pub action: String,
    pub installation: InstallationDetail,
}

/// The webhook events the dispatcher understands, discriminated by the
/// forge's event header.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Push(PushEvent),
    PullRequest(PullRequestEvent),
    Installation(InstallationEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_event_deserialises() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "before": "1111111111111111111111111111111111111111",
            "after": "2222222222222222222222222222222222222222",
            "repository": {
                "id": 99,
                "full_name": "owner/demo",
                "clone_url": "https://github.com/owner/demo.git",
                "private": false
            },
            "installation": { "id": 7 },
            "pusher": { "name": "someone" }
        });
        let event: PushEvent = serde_json::from_value(body).unwrap();
        assert_eq!(event.git_ref, "refs/heads/main");
        assert_eq!(event.repository.full_name, "owner/demo");
        assert_eq!(event.installation.id, 7);
    }

    #[test]
    fn pull_request_event_deserialises() {
        let body = serde_json::json!({
            "action": "opened",
            "number": 3,
            "pull_request": {
                "head": {
                    "ref": "feature",
                    "sha": "abc123",
                    "repo": {
                        "id": 100,
                        "full_name": "fork/demo",
                        "clone_url": "https://github.com/fork/demo.git"
                    }
                },
                "base": {
                    "ref": "main",
                    "sha": "def456",
                    "repo": {
                        "id": 99,
                        "full_name": "owner/demo",
                        "clone_url": "https://github.com/owner/demo.git"
                    }
                }
            },
            "repository": {
                "id": 99,
                "full_name": "owner/demo",
                "clone_url": "https://github.com/owner/demo.git"
            },
            "installation": { "id": 7 }
        });
        let event: PullRequestEvent = serde_json::from_value(body).unwrap();
        assert_eq!(event.action, "opened");
        assert_eq!(event.pull_request.head.git_ref, "feature");
        assert_eq!(event.pull_request.base.repo.clone_url, "https://github.com/owner/demo.git");
    }

    #[test]
    fn missing_installation_is_an_error() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "before": "1",
            "after": "2",
            "repository": {
                "id": 99,
                "full_name": "owner/demo",
                "clone_url": "https://github.com/owner/demo.git"
            }
        });
        assert!(serde_json::from_value::<PushEvent>(body).is_err());
    }
}
