//! GitHub client backed by GitHub App installation tokens.
//!
//! Authentication is the app flow: a short-lived RS256-signed JWT proves
//! the app's identity and is exchanged for a per-installation token, which
//! is cached until shortly before it expires.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{
    CommitStatus, ForgeClient, ForgeError, PrFile, Repository, ReviewComment, StatusState,
};

const GITHUB_API: &str = "https://api.github.com";
const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const USER_AGENT: &str = concat!("diffci/", env!("CARGO_PKG_VERSION"));

/// Lifetime of the signed app assertion. GitHub rejects anything over ten
/// minutes; sixty seconds of backdating absorbs clock skew.
const JWT_TTL_SECS: i64 = 9 * 60;
const JWT_BACKDATE_SECS: i64 = 60;

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// GitHub implementation of [`ForgeClient`].
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    app_id: u64,
    key: EncodingKey,
    tokens: Mutex<HashMap<i64, CachedToken>>,
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("api_base", &self.api_base)
            .field("app_id", &self.app_id)
            .finish()
    }
}

impl GitHubClient {
    /// Build a client from the app's RSA private key in PEM form.
    pub fn new(app_id: u64, private_key_pem: &[u8]) -> Result<Self, ForgeError> {
        Self::with_api_base(app_id, private_key_pem, GITHUB_API)
    }

    /// Build a client reading the key from `path`.
    pub fn from_key_file(app_id: u64, path: &str) -> Result<Self, ForgeError> {
        let pem = std::fs::read(path)
            .map_err(|e| ForgeError::Configuration(format!("read private key {path}: {e}")))?;
        Self::new(app_id, &pem)
    }

    pub fn with_api_base(
        app_id: u64,
        private_key_pem: &[u8],
        api_base: impl Into<String>,
    ) -> Result<Self, ForgeError> {
        let key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| ForgeError::Configuration(format!("invalid app private key: {e}")))?;
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            app_id,
            key,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Sign a fresh app assertion.
    fn app_jwt(&self) -> Result<String, ForgeError> {
        let now = Utc::now().timestamp();
        let claims = AppClaims {
            iat: now - JWT_BACKDATE_SECS,
            exp: now + JWT_TTL_SECS,
            iss: self.app_id.to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| ForgeError::Authentication(format!("sign app assertion: {e}")))
    }

    /// Exchange the app assertion for a short-lived installation token,
    /// cached until shortly before expiry.
    async fn installation_token(&self, installation_id: i64) -> Result<String, ForgeError> {
        {
            let tokens = self.tokens.lock().await;
            if let Some(cached) = tokens.get(&installation_id) {
                if cached.expires_at - Duration::seconds(60) > Utc::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
            expires_at: DateTime<Utc>,
        }

        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.api_base
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.app_jwt()?)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ForgeError::Authentication(format!(
                "mint installation token ({status}): {message}"
            )));
        }
        let minted: TokenResponse = response.json().await?;

        let mut tokens = self.tokens.lock().await;
        tokens.insert(
            installation_id,
            CachedToken {
                token: minted.token.clone(),
                expires_at: minted.expires_at,
            },
        );
        Ok(minted.token)
    }

    async fn send(
        &self,
        installation_id: i64,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ForgeError> {
        let token = self.installation_token(installation_id).await?;
        let mut builder = self
            .http
            .request(method, format!("{}{endpoint}", self.api_base))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ForgeError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

/// Review comment as GitHub returns it; `position` is null for outdated
/// comments, which can no longer collide with new ones.
#[derive(Deserialize)]
struct RemoteComment {
    path: String,
    position: Option<u32>,
    body: String,
}

#[async_trait]
impl ForgeClient for GitHubClient {
    async fn list_review_comments(
        &self,
        installation_id: i64,
        repo: &str,
        pr_number: i64,
    ) -> Result<Vec<ReviewComment>, ForgeError> {
        let endpoint = format!("/repos/{repo}/pulls/{pr_number}/comments?per_page=100");
        let response = self
            .send(installation_id, reqwest::Method::GET, &endpoint, None)
            .await?;
        let remote: Vec<RemoteComment> = response.json().await?;
        Ok(remote
            .into_iter()
            .filter_map(|c| {
                c.position.map(|position| ReviewComment {
                    path: c.path,
                    position,
                    body: c.body,
                })
            })
            .collect())
    }

    async fn create_review_comment(
        &self,
        installation_id: i64,
        repo: &str,
        pr_number: i64,
        commit_sha: &str,
        comment: &ReviewComment,
    ) -> Result<(), ForgeError> {
        let endpoint = format!("/repos/{repo}/pulls/{pr_number}/comments");
        let body = serde_json::json!({
            "body": comment.body,
            "commit_id": commit_sha,
            "path": comment.path,
            "position": comment.position,
        });
        self.send(installation_id, reqwest::Method::POST, &endpoint, Some(body))
            .await?;
        Ok(())
    }

    async fn set_commit_status(
        &self,
        installation_id: i64,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), ForgeError> {
        let endpoint = format!("/repos/{repo}/statuses/{sha}");
        let body = serde_json::json!({
            "state": status.state.as_str(),
            "description": status.description,
            "target_url": status.target_url,
            "context": status.context,
        });
        self.send(installation_id, reqwest::Method::POST, &endpoint, Some(body))
            .await?;
        Ok(())
    }

    async fn list_pr_files(
        &self,
        installation_id: i64,
        repo: &str,
        pr_number: i64,
    ) -> Result<Vec<PrFile>, ForgeError> {
        let endpoint = format!("/repos/{repo}/pulls/{pr_number}/files?per_page=100");
        let response = self
            .send(installation_id, reqwest::Method::GET, &endpoint, None)
            .await?;
        Ok(response.json().await?)
    }

    async fn repository(
        &self,
        installation_id: i64,
        repo: &str,
    ) -> Result<Repository, ForgeError> {
        let endpoint = format!("/repos/{repo}");
        let response = self
            .send(installation_id, reqwest::Method::GET, &endpoint, None)
            .await?;
        Ok(response.json().await?)
    }
}

/// Short human description for a final commit status.
pub fn status_description(state: StatusState, issue_count: usize) -> String {
    match state {
        StatusState::Pending => "Analysis in progress".to_string(),
        StatusState::Success => "No issues found".to_string(),
        StatusState::Failure => match issue_count {
            1 => "1 issue found".to_string(),
            n => format!("{n} issues found"),
        },
        StatusState::Error => "Analysis could not be completed".to_string(),
    }
}
