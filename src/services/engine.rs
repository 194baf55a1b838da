//! The analysis engine: drives one job end-to-end inside a disposable
//! workspace.
//!
//! Sequential by design: clone, diff, dependencies, then each configured
//! tool in order, so duration accounting is unambiguous and a single
//! workspace suffices. Findings outside the diff and findings on generated
//! files are discarded before they reach the record.

use std::collections::HashMap;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::executor::{ExecError, Executor, ExecutorFactory};
use crate::models::analysis::{Analysis, Issue, ToolRun};
use crate::models::job::Job;
use crate::models::tool::Tool;
use crate::parsers::tool_output;
use crate::parsers::unified_diff::DiffSet;

/// Diff base used for pull-request jobs after the base ref has been
/// fetched into the workspace.
const FETCH_HEAD: &str = "FETCH_HEAD";

/// Guarded dependency bootstrap; a repo without the script is a no-op.
const INSTALL_DEPS: &str = "if [ -f install-deps.sh ]; then sh ./install-deps.sh; fi";

/// Helper consulted per finding; exit 0 means the file is generated.
const IS_FILE_GENERATED: &str = "isFileGenerated";

/// A step of the pipeline failed before or between tool runs. Everything
/// here finalises the analysis as Error; the step name goes into the
/// status description.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workspace session could not be created: {0}")]
    Session(ExecError),

    #[error("clone failed: {0}")]
    Clone(ExecError),

    #[error("fetch failed: {0}")]
    Fetch(ExecError),

    #[error("checkout failed: {0}")]
    Checkout(ExecError),

    #[error("diff failed: {0}")]
    Diff(ExecError),

    #[error("dependency install failed: {0}")]
    Deps(ExecError),

    #[error("workspace probe failed: {0}")]
    Probe(ExecError),

    #[error("generated-file check failed: {0}")]
    GeneratedCheck(ExecError),

    #[error("analysis cancelled")]
    Cancelled,
}

impl EngineError {
    /// Short step name for status descriptions.
    pub fn step(&self) -> &'static str {
        match self {
            Self::Session(_) => "workspace",
            Self::Clone(_) => "clone",
            Self::Fetch(_) => "fetch",
            Self::Checkout(_) => "checkout",
            Self::Diff(_) => "diff",
            Self::Deps(_) => "deps",
            Self::Probe(_) => "probe",
            Self::GeneratedCheck(_) => "generated-check",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Map an executor failure onto a pipeline step, keeping cancellation
/// distinct so callers can tell shutdown from user error.
fn step_error(wrap: fn(ExecError) -> EngineError, e: ExecError) -> EngineError {
    match e {
        ExecError::Cancelled => EngineError::Cancelled,
        other => wrap(other),
    }
}

/// Run one analysis to completion, mutating `analysis` in place.
///
/// On `Ok` the record carries a terminal Success or Failure status; on
/// `Err` the caller finalises it as Error. The workspace session is
/// stopped on every exit path.
pub async fn analyse(
    cancel: &CancellationToken,
    factory: &dyn ExecutorFactory,
    tools: &[Tool],
    job: &Job,
    analysis: &mut Analysis,
) -> Result<(), EngineError> {
    let started = Instant::now();
    analysis.commit_from = Some(job.base_ref().to_string());
    analysis.commit_to = Some(job.head_ref().to_string());
    analysis.request_number = job.pr_number();

    let mut session = factory
        .new_session(cancel.clone(), &workspace_hint(job))
        .await
        .map_err(|e| step_error(EngineError::Session, e))?;

    let result = run_pipeline(session.as_ref(), tools, job, analysis).await;

    if let Err(e) = session.stop().await {
        tracing::error!(analysis_id = %analysis.id, error = %e, "workspace teardown failed");
    }
    analysis.total_duration_ms = Some(started.elapsed().as_millis() as u64);

    result?;
    analysis.conclude();
    tracing::info!(
        analysis_id = %analysis.id,
        status = analysis.status.as_str(),
        issues = analysis.issue_count(),
        "analysis finished"
    );
    Ok(())
}

async fn run_pipeline(
    exec: &dyn Executor,
    tools: &[Tool],
    job: &Job,
    analysis: &mut Analysis,
) -> Result<(), EngineError> {
    let clone_started = Instant::now();
    match job {
        Job::PullRequest {
            base_url,
            base_ref,
            head_url,
            head_ref,
            ..
        } => {
            exec.run(&argv(&[
                "git",
                "clone",
                "--depth",
                "1",
                "--branch",
                head_ref.as_str(),
                "--single-branch",
                head_url.as_str(),
                ".",
            ]))
            .await
            .map_err(|e| step_error(EngineError::Clone, e))?;
            exec.run(&argv(&[
                "git",
                "fetch",
                "-q",
                "--depth",
                "1",
                base_url.as_str(),
                base_ref.as_str(),
            ]))
            .await
            .map_err(|e| step_error(EngineError::Fetch, e))?;
        }
        Job::Push {
            head_url, head_ref, ..
        } => {
            exec.run(&argv(&["git", "clone", head_url.as_str(), "."]))
                .await
                .map_err(|e| step_error(EngineError::Clone, e))?;
            exec.run(&argv(&["git", "checkout", head_ref.as_str()]))
                .await
                .map_err(|e| step_error(EngineError::Checkout, e))?;
        }
    }
    analysis.clone_duration_ms = Some(clone_started.elapsed().as_millis() as u64);

    // For pull requests the base lives in FETCH_HEAD; pushes diff against
    // the configured base ref directly.
    let diff_base = match job {
        Job::PullRequest { .. } => FETCH_HEAD,
        Job::Push { base_ref, .. } => base_ref.as_str(),
    };

    let diff_target = format!("{diff_base}...{}", job.head_ref());
    let diff_output = match exec.run(&argv(&["git", "diff", diff_target.as_str()])).await {
        Ok(output) => output,
        Err(ExecError::Cancelled) => return Err(EngineError::Cancelled),
        Err(e @ ExecError::NonZero { .. }) => {
            // The base is gone (first commit on a branch, force push):
            // the head commit's own diff is the change set.
            tracing::warn!(
                target = %diff_target,
                code = e.exit_code().unwrap_or(-1),
                "diff target unknown, falling back to git show"
            );
            exec.run(&argv(&["git", "show", job.head_ref()]))
                .await
                .map_err(|e| step_error(EngineError::Diff, e))?
        }
        Err(e) => return Err(EngineError::Diff(e)),
    };

    let diff = DiffSet::parse(&diff_output);
    if diff.is_empty() {
        tracing::info!(analysis_id = %analysis.id, "diff contains no added lines, skipping tools");
        return Ok(());
    }

    let deps_started = Instant::now();
    exec.run(&argv(&["sh", "-c", INSTALL_DEPS]))
        .await
        .map_err(|e| step_error(EngineError::Deps, e))?;
    analysis.deps_duration_ms = Some(deps_started.elapsed().as_millis() as u64);

    // Absolute workspace path, used to relativise tool output.
    let pwd = exec
        .run(&argv(&["pwd"]))
        .await
        .map_err(|e| step_error(EngineError::Probe, e))?;
    let workspace = String::from_utf8_lossy(&pwd).trim().to_string();

    for tool in tools {
        let tool_started = Instant::now();
        let output = match exec.run(&tool.argv(diff_base)).await {
            Ok(output) => output,
            Err(ExecError::NonZero { code, output, .. }) => {
                // Tools commonly exit non-zero because they found issues.
                tracing::warn!(tool = %tool.name, code, "tool exited non-zero, parsing output");
                output
            }
            Err(ExecError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                tracing::error!(tool = %tool.name, error = %e, "tool could not be started");
                analysis.tool_runs.push(ToolRun {
                    tool_id: tool.id,
                    duration_ms: tool_started.elapsed().as_millis() as u64,
                    issues: Vec::new(),
                });
                continue;
            }
        };

        let mut generated = GeneratedCache::default();
        let mut issues = Vec::new();
        for finding in tool_output::parse(&output, &workspace) {
            let Some(hunk_pos) = diff.position_of(&finding.path, finding.line) else {
                continue;
            };
            if generated.check(exec, &workspace, &finding.path).await? {
                continue;
            }
            issues.push(Issue {
                path: finding.path,
                line: finding.line,
                hunk_pos,
                body: format!("{}: {}", tool.name, finding.message),
            });
        }

        analysis.tool_runs.push(ToolRun {
            tool_id: tool.id,
            duration_ms: tool_started.elapsed().as_millis() as u64,
            issues,
        });
    }

    Ok(())
}

/// Per-tool-run cache of generated-file verdicts.
#[derive(Default)]
struct GeneratedCache {
    verdicts: HashMap<String, bool>,
}

impl GeneratedCache {
    async fn check(
        &mut self,
        exec: &dyn Executor,
        workspace: &str,
        path: &str,
    ) -> Result<bool, EngineError> {
        if let Some(&verdict) = self.verdicts.get(path) {
            return Ok(verdict);
        }
        let generated = match exec
            .run(&argv(&[IS_FILE_GENERATED, workspace, path]))
            .await
        {
            Ok(_) => true,
            Err(ExecError::NonZero { .. }) => false,
            Err(ExecError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => return Err(EngineError::GeneratedCheck(e)),
        };
        self.verdicts.insert(path.to_string(), generated);
        Ok(generated)
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Directory hint derived from the clone URL.
fn workspace_hint(job: &Job) -> String {
    job.head_url()
        .rsplit('/')
        .next()
        .unwrap_or("workspace")
        .trim_end_matches(".git")
        .to_string()
}
