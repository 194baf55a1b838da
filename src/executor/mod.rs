//! Disposable workspaces for running untrusted commands.
//!
//! A factory produces one-shot sessions; a session runs argv commands in
//! its workspace and captures combined output. Two backings share the
//! contract: a temp directory on the local filesystem, and a fresh
//! container per session.

pub mod docker;
pub mod filesystem;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use docker::DockerExecutorFactory;
pub use filesystem::FileSystemExecutorFactory;

/// Failures an executor distinguishes for its callers.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The command could not be started at all. Fatal to the run.
    #[error("could not start {command:?}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran and exited non-zero. Callers decide whether this is
    /// fatal; many analysis tools exit non-zero *because* they found
    /// issues, so the combined output is carried along.
    #[error("{command:?} exited with code {code}")]
    NonZero {
        command: String,
        code: i32,
        output: Vec<u8>,
    },

    /// The run's cancellation token fired. Callers must propagate.
    #[error("execution cancelled")]
    Cancelled,

    /// Session plumbing failed (temp directory, container lifecycle).
    #[error("workspace error: {0}")]
    Workspace(String),
}

impl ExecError {
    /// Exit code for `NonZero` failures.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZero { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Combined output captured before a `NonZero` exit.
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            Self::NonZero { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// A one-shot workspace session.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `argv` inside the workspace, returning the merged stdout and
    /// stderr bytes.
    async fn run(&self, argv: &[String]) -> Result<Vec<u8>, ExecError>;

    /// Release all session resources. Idempotent; must be called on every
    /// exit path.
    async fn stop(&mut self) -> Result<(), ExecError>;
}

/// Produces fresh executor sessions.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn new_session(
        &self,
        cancel: CancellationToken,
        dir_hint: &str,
    ) -> Result<Box<dyn Executor>, ExecError>;
}

/// Spawn a command, race it against cancellation, and capture combined
/// output. Shared by both backings.
pub(crate) async fn run_command(
    mut cmd: tokio::process::Command,
    cancel: &CancellationToken,
    display: &str,
) -> Result<Vec<u8>, ExecError> {
    let child = cmd
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Launch {
            command: display.to_string(),
            source,
        })?;

    let output = tokio::select! {
        // Dropping the wait future kills the child (kill_on_drop).
        _ = cancel.cancelled() => return Err(ExecError::Cancelled),
        output = child.wait_with_output() => output.map_err(|source| ExecError::Launch {
            command: display.to_string(),
            source,
        })?,
    };

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);

    if output.status.success() {
        Ok(combined)
    } else {
        Err(ExecError::NonZero {
            command: display.to_string(),
            code: output.status.code().unwrap_or(-1),
            output: combined,
        })
    }
}

/// Reduce a directory hint to something safe for a path component.
pub(crate) fn sanitise_hint(hint: &str) -> String {
    let cleaned: String = hint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "workspace".to_string()
    } else {
        cleaned
    }
}
