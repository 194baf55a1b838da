//! Local-filesystem executor: a throwaway directory under a configured
//! root, argv execution with a sanitised environment.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{run_command, sanitise_hint, ExecError, Executor, ExecutorFactory};

/// PATH given to every command; nothing from the service's own environment
/// leaks into tool invocations.
const SANITISED_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Factory creating temp-directory workspaces under `root`.
pub struct FileSystemExecutorFactory {
    root: PathBuf,
    search_path: String,
}

impl FileSystemExecutorFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            search_path: SANITISED_PATH.to_string(),
        }
    }

    /// Override the PATH handed to commands, e.g. to expose an extra tool
    /// directory.
    pub fn with_search_path(mut self, search_path: impl Into<String>) -> Self {
        self.search_path = search_path.into();
        self
    }
}

#[async_trait]
impl ExecutorFactory for FileSystemExecutorFactory {
    async fn new_session(
        &self,
        cancel: CancellationToken,
        dir_hint: &str,
    ) -> Result<Box<dyn Executor>, ExecError> {
        let dir = self
            .root
            .join(format!("{}-{}", sanitise_hint(dir_hint), Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ExecError::Workspace(format!("create {}: {e}", dir.display())))?;
        Ok(Box::new(FileSystemExecutor {
            dir,
            search_path: self.search_path.clone(),
            cancel,
            stopped: false,
        }))
    }
}

/// One temp-directory session.
pub struct FileSystemExecutor {
    dir: PathBuf,
    search_path: String,
    cancel: CancellationToken,
    stopped: bool,
}

#[async_trait]
impl Executor for FileSystemExecutor {
    async fn run(&self, argv: &[String]) -> Result<Vec<u8>, ExecError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecError::Workspace("empty argv".to_string()));
        };
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&self.dir)
            .env_clear()
            .env("PATH", &self.search_path)
            .env("HOME", &self.dir);
        run_command(cmd, &self.cancel, &argv.join(" ")).await
    }

    async fn stop(&mut self) -> Result<(), ExecError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        tokio::fs::remove_dir_all(&self.dir)
            .await
            .map_err(|e| ExecError::Workspace(format!("remove {}: {e}", self.dir.display())))
    }
}
