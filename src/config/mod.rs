//! Application configuration loaded from environment variables.
//!
//! Every key the service cannot run without is checked here, at startup,
//! so a misconfigured deployment fails before it binds a socket.

use std::env;

/// Error raised for a missing or unusable configuration key.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which executor backing provides analysis workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Filesystem,
    Docker,
}

/// Which queue backing carries jobs from the dispatcher to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Memory,
    PubSub,
}

/// Default container image used when `EXECUTOR_DOCKER_IMAGE` is unset.
pub const DEFAULT_DOCKER_IMAGE: &str = "diffci/analysis:latest";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub github_app_id: u64,
    pub github_private_key_path: String,
    pub github_webhook_secret: String,
    /// Base URL of this deployment, used to build links the forge shows
    /// next to commit statuses (`<base_url>/analysis/<id>`).
    pub base_url: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub executor: ExecutorKind,
    pub executor_filesystem_path: Option<String>,
    pub executor_docker_image: String,
    pub queue: QueueKind,
    pub pubsub_project_id: Option<String>,
    pub pubsub_topic: Option<String>,
    pub http_addr: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let executor = match required("EXECUTOR")?.as_str() {
            "filesystem" => ExecutorKind::Filesystem,
            "docker" => ExecutorKind::Docker,
            other => {
                return Err(ConfigError::Invalid {
                    key: "EXECUTOR",
                    value: other.to_string(),
                    reason: "expected \"filesystem\" or \"docker\"".to_string(),
                })
            }
        };

        let executor_filesystem_path = env::var("EXECUTOR_FILESYSTEM_PATH").ok();
        if executor == ExecutorKind::Filesystem && executor_filesystem_path.is_none() {
            return Err(ConfigError::Missing("EXECUTOR_FILESYSTEM_PATH"));
        }

        let queue = match required("QUEUE")?.as_str() {
            "memory" => QueueKind::Memory,
            "pubsub" => QueueKind::PubSub,
            other => {
                return Err(ConfigError::Invalid {
                    key: "QUEUE",
                    value: other.to_string(),
                    reason: "expected \"memory\" or \"pubsub\"".to_string(),
                })
            }
        };

        let pubsub_project_id = env::var("PUBSUB_PROJECT_ID").ok();
        let pubsub_topic = env::var("PUBSUB_TOPIC").ok();
        if queue == QueueKind::PubSub {
            if pubsub_project_id.is_none() {
                return Err(ConfigError::Missing("PUBSUB_PROJECT_ID"));
            }
            if pubsub_topic.is_none() {
                return Err(ConfigError::Missing("PUBSUB_TOPIC"));
            }
        }

        Ok(Self {
            github_app_id: parse_required("GITHUB_APP_ID")?,
            github_private_key_path: required("GITHUB_PRIVATE_KEY_PATH")?,
            github_webhook_secret: required("GITHUB_WEBHOOK_SECRET")?,
            base_url: required("BASE_URL")?,
            database_url: required("DATABASE_URL")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            executor,
            executor_filesystem_path,
            executor_docker_image: env::var("EXECUTOR_DOCKER_IMAGE")
                .unwrap_or_else(|_| DEFAULT_DOCKER_IMAGE.to_string()),
            queue,
            pubsub_project_id,
            pubsub_topic,
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parse_required<T: std::str::FromStr>(key: &'static str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let raw = required(key)?;
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; run serially under a lock.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn set_base_env() {
        env::set_var("GITHUB_APP_ID", "1234");
        env::set_var("GITHUB_PRIVATE_KEY_PATH", "/etc/diffci/key.pem");
        env::set_var("GITHUB_WEBHOOK_SECRET", "hush");
        env::set_var("BASE_URL", "https://ci.example.com");
        env::set_var("DATABASE_URL", "postgres://diffci@localhost/diffci");
        env::set_var("EXECUTOR", "filesystem");
        env::set_var("EXECUTOR_FILESYSTEM_PATH", "/tmp/diffci");
        env::set_var("QUEUE", "memory");
        env::remove_var("PUBSUB_PROJECT_ID");
        env::remove_var("PUBSUB_TOPIC");
    }

    #[test]
    fn loads_complete_environment() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        set_base_env();
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.github_app_id, 1234);
        assert_eq!(config.executor, ExecutorKind::Filesystem);
        assert_eq!(config.queue, QueueKind::Memory);
        assert_eq!(config.http_addr, "0.0.0.0:3000");
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        set_base_env();
        env::remove_var("GITHUB_WEBHOOK_SECRET");
        let err = AppConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GITHUB_WEBHOOK_SECRET")));
    }

    #[test]
    fn unknown_executor_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        set_base_env();
        env::set_var("EXECUTOR", "chroot");
        let err = AppConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EXECUTOR", .. }));
    }

    #[test]
    fn pubsub_queue_requires_project_and_topic() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        set_base_env();
        env::set_var("QUEUE", "pubsub");
        let err = AppConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PUBSUB_PROJECT_ID")));

        env::set_var("PUBSUB_PROJECT_ID", "my-project");
        let err = AppConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PUBSUB_TOPIC")));

        env::set_var("PUBSUB_TOPIC", "diffci-jobs");
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.queue, QueueKind::PubSub);
    }
}
