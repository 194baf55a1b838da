//! Container-backed executor: one long-lived container per session, each
//! `run` exec'd inside it, torn down on `stop`.
//!
//! The container runtime is driven through the `docker` CLI; the workspace
//! is a host directory bind-mounted at a fixed path inside the container.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{run_command, sanitise_hint, ExecError, Executor, ExecutorFactory};

/// Mount point of the workspace inside the container.
const CONTAINER_WORKSPACE: &str = "/workspace";

/// Factory starting one container per session from a configured image.
pub struct DockerExecutorFactory {
    image: String,
}

impl DockerExecutorFactory {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }
}

#[async_trait]
impl ExecutorFactory for DockerExecutorFactory {
    async fn new_session(
        &self,
        cancel: CancellationToken,
        dir_hint: &str,
    ) -> Result<Box<dyn Executor>, ExecError> {
        let host_dir = std::env::temp_dir().join(format!(
            "diffci-{}-{}",
            sanitise_hint(dir_hint),
            Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&host_dir)
            .await
            .map_err(|e| ExecError::Workspace(format!("create {}: {e}", host_dir.display())))?;

        let mount = format!("{}:{CONTAINER_WORKSPACE}", host_dir.display());
        let mut cmd = tokio::process::Command::new("docker");
        cmd.args([
            "run",
            "-d",
            "-v",
            mount.as_str(),
            "-w",
            CONTAINER_WORKSPACE,
            self.image.as_str(),
            "sleep",
            "infinity",
        ]);
        let output = run_command(cmd, &cancel, "docker run").await.map_err(|e| {
            ExecError::Workspace(format!("start container from {}: {e}", self.image))
        })?;
        let container_id = String::from_utf8_lossy(&output).trim().to_string();
        if container_id.is_empty() {
            return Err(ExecError::Workspace(
                "docker run returned no container id".to_string(),
            ));
        }

        tracing::debug!(container_id = %container_id, image = %self.image, "container session started");

        Ok(Box::new(DockerExecutor {
            container_id,
            host_dir,
            cancel,
            stopped: false,
        }))
    }
}

/// One container session.
pub struct DockerExecutor {
    container_id: String,
    host_dir: PathBuf,
    cancel: CancellationToken,
    stopped: bool,
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn run(&self, argv: &[String]) -> Result<Vec<u8>, ExecError> {
        if argv.is_empty() {
            return Err(ExecError::Workspace("empty argv".to_string()));
        }
        let mut cmd = tokio::process::Command::new("docker");
        cmd.args(["exec", "-w", CONTAINER_WORKSPACE, self.container_id.as_str()]);
        cmd.args(argv);
        run_command(cmd, &self.cancel, &argv.join(" ")).await
    }

    async fn stop(&mut self) -> Result<(), ExecError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let mut cmd = tokio::process::Command::new("docker");
        cmd.args(["rm", "-f", self.container_id.as_str()]);
        // Teardown must proceed even when the shutdown token has fired.
        let remove = run_command(cmd, &CancellationToken::new(), "docker rm").await;

        let dir_result = tokio::fs::remove_dir_all(&self.host_dir).await;

        remove.map_err(|e| ExecError::Workspace(format!("remove container: {e}")))?;
        dir_result
            .map_err(|e| ExecError::Workspace(format!("remove {}: {e}", self.host_dir.display())))
    }
}
