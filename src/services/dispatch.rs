//! Event dispatch: translate validated webhooks into queued jobs, and on
//! the worker side drive the engine and publish results.
//!
//! The HTTP handler returns before any analysis starts; the queue carries
//! the job to [`Dispatcher::process`], which finalises the analysis record
//! exactly once and posts review comments and the combined commit status.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::Store;
use crate::errors::AppError;
use crate::executor::ExecutorFactory;
use crate::forge::{
    github::status_description, with_retries, CommitStatus, ForgeClient, ReviewComment,
    StatusState,
};
use crate::models::analysis::{Analysis, AnalysisStatus};
use crate::models::event::{InstallationEvent, PullRequestEvent, PushEvent, WebhookEvent};
use crate::models::job::{Job, QueuedJob};
use crate::queue::{HandlerError, Queue};
use crate::services::engine;

/// Context string for the combined commit status.
const STATUS_CONTEXT: &str = "ci/diffci";

/// Attempts for forge calls that are worth retrying locally.
const FORGE_ATTEMPTS: u32 = 3;

/// Pull-request actions that trigger an analysis; everything else is
/// acknowledged and ignored.
const ANALYSED_PR_ACTIONS: [&str; 3] = ["opened", "synchronize", "reopened"];

/// SHA git uses for a nonexistent ref (branch creation/deletion).
const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// What the dispatcher did with an inbound event.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A job was enqueued under this analysis id.
    Enqueued(Uuid),
    Ignored(&'static str),
    InstallationRecorded,
    InstallationRemoved,
}

/// Translates events into jobs and processes dequeued jobs.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    forge: Arc<dyn ForgeClient>,
    factory: Arc<dyn ExecutorFactory>,
    queue: Arc<dyn Queue>,
    base_url: String,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        forge: Arc<dyn ForgeClient>,
        factory: Arc<dyn ExecutorFactory>,
        queue: Arc<dyn Queue>,
        base_url: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            forge,
            factory,
            queue,
            base_url: base_url.trim_end_matches('/').to_string(),
            cancel,
        }
    }

    fn analysis_url(&self, id: Uuid) -> String {
        format!("{}/analysis/{id}", self.base_url)
    }

    /// Handle a validated webhook event. Returns before any analysis runs.
    pub async fn dispatch(&self, event: WebhookEvent) -> Result<DispatchOutcome, AppError> {
        match event {
            WebhookEvent::Installation(event) => self.dispatch_installation(event).await,
            WebhookEvent::PullRequest(event) => self.dispatch_pull_request(event).await,
            WebhookEvent::Push(event) => self.dispatch_push(event).await,
        }
    }

    async fn dispatch_installation(
        &self,
        event: InstallationEvent,
    ) -> Result<DispatchOutcome, AppError> {
        match event.action.as_str() {
            "created" => {
                self.store
                    .record_installation(event.installation.id, &event.installation.account.login)
                    .await?;
                tracing::info!(
                    installation_id = event.installation.id,
                    account = %event.installation.account.login,
                    "installation recorded"
                );
                Ok(DispatchOutcome::InstallationRecorded)
            }
            "deleted" => {
                self.store
                    .remove_installation(event.installation.id)
                    .await?;
                tracing::info!(
                    installation_id = event.installation.id,
                    "installation removed"
                );
                Ok(DispatchOutcome::InstallationRemoved)
            }
            _ => Ok(DispatchOutcome::Ignored("installation action")),
        }
    }

    async fn dispatch_pull_request(
        &self,
        event: PullRequestEvent,
    ) -> Result<DispatchOutcome, AppError> {
        if !ANALYSED_PR_ACTIONS.contains(&event.action.as_str()) {
            return Ok(DispatchOutcome::Ignored("pull request action"));
        }
        let job = Job::PullRequest {
            base_url: event.pull_request.base.repo.clone_url.clone(),
            base_ref: event.pull_request.base.git_ref.clone(),
            head_url: event.pull_request.head.repo.clone_url.clone(),
            head_ref: event.pull_request.head.git_ref.clone(),
            installation_id: event.installation.id,
            repo_id: event.repository.id,
            pr_number: event.number,
        };
        self.enqueue_job(
            job,
            event.repository.full_name,
            event.pull_request.head.sha,
        )
        .await
    }

    async fn dispatch_push(&self, event: PushEvent) -> Result<DispatchOutcome, AppError> {
        if event.after == ZERO_SHA {
            return Ok(DispatchOutcome::Ignored("branch deletion"));
        }
        let job = Job::Push {
            base_url: event.repository.clone_url.clone(),
            base_ref: event.before.clone(),
            head_url: event.repository.clone_url.clone(),
            head_ref: event.after.clone(),
            installation_id: event.installation.id,
            repo_id: event.repository.id,
        };
        self.enqueue_job(job, event.repository.full_name, event.after)
            .await
    }

    async fn enqueue_job(
        &self,
        job: Job,
        repo: String,
        head_sha: String,
    ) -> Result<DispatchOutcome, AppError> {
        let analysis = self
            .store
            .start_analysis(job.installation_id(), job.repo_id())
            .await?;

        // The PR shows progress before a worker picks the job up. The job
        // is enqueued regardless: a missed pending status is cosmetic.
        let pending = CommitStatus {
            state: StatusState::Pending,
            description: status_description(StatusState::Pending, 0),
            target_url: self.analysis_url(analysis.id),
            context: STATUS_CONTEXT.to_string(),
        };
        if let Err(e) = with_retries("set pending status", FORGE_ATTEMPTS, || {
            self.forge
                .set_commit_status(job.installation_id(), &repo, &head_sha, &pending)
        })
        .await
        {
            tracing::warn!(analysis_id = %analysis.id, error = %e, "could not set pending status");
        }

        let queued = QueuedJob {
            analysis_id: analysis.id,
            repo,
            head_sha,
            job,
        };
        self.queue.enqueue(queued).await?;
        tracing::info!(analysis_id = %analysis.id, "job enqueued");
        Ok(DispatchOutcome::Enqueued(analysis.id))
    }

    /// Process one dequeued job: run the engine, finalise the record, post
    /// results. An `Err` asks the queue backing for redelivery.
    pub async fn process(&self, queued: QueuedJob) -> Result<(), HandlerError> {
        let started = Instant::now();
        tracing::info!(analysis_id = %queued.analysis_id, repo = %queued.repo, "processing job");

        let tools = self.store.list_tools().await?;

        let mut analysis = Analysis::pending(
            queued.analysis_id,
            queued.job.installation_id(),
            queued.job.repo_id(),
        );

        let engine_result = engine::analyse(
            &self.cancel,
            self.factory.as_ref(),
            &tools,
            &queued.job,
            &mut analysis,
        )
        .await;

        let state = match &engine_result {
            Ok(()) => match analysis.status {
                AnalysisStatus::Failure => StatusState::Failure,
                _ => StatusState::Success,
            },
            Err(e) => {
                // Attributable to the pushed code (or shutdown): finalise as
                // Error and complete the job rather than retrying it.
                tracing::error!(analysis_id = %analysis.id, error = %e, step = e.step(), "analysis failed");
                analysis.status = AnalysisStatus::Error;
                StatusState::Error
            }
        };

        self.store.finalise_analysis(&analysis).await?;

        if let Err(e) = self.publish_results(&queued, &analysis, state, &engine_result).await {
            // Transient forge trouble: redelivery is safe because the
            // finalise above is a no-op the second time and comments
            // de-duplicate.
            return Err(e.into());
        }

        tracing::info!(
            analysis_id = %analysis.id,
            status = analysis.status.as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            "job processed"
        );
        Ok(())
    }

    async fn publish_results(
        &self,
        queued: &QueuedJob,
        analysis: &Analysis,
        state: StatusState,
        engine_result: &Result<(), engine::EngineError>,
    ) -> Result<(), crate::forge::ForgeError> {
        // Review comments only exist on pull requests; pushes record
        // findings and get a status.
        if let Some(pr_number) = queued.job.pr_number() {
            if analysis.issue_count() > 0 {
                self.post_comments(queued, analysis, pr_number).await?;
            }
        }

        let description = match engine_result {
            Ok(()) => status_description(state, analysis.issue_count()),
            Err(e) => format!("Analysis failed during {}", e.step()),
        };
        let status = CommitStatus {
            state,
            description,
            target_url: self.analysis_url(analysis.id),
            context: STATUS_CONTEXT.to_string(),
        };
        with_retries("set final status", FORGE_ATTEMPTS, || {
            self.forge.set_commit_status(
                queued.job.installation_id(),
                &queued.repo,
                &queued.head_sha,
                &status,
            )
        })
        .await
    }

    /// Post one review comment per issue, skipping any comment already
    /// present at the same (path, position, body). Re-pushes to the same
    /// PR must not repost identical comments.
    async fn post_comments(
        &self,
        queued: &QueuedJob,
        analysis: &Analysis,
        pr_number: i64,
    ) -> Result<(), crate::forge::ForgeError> {
        let installation_id = queued.job.installation_id();
        let existing = with_retries("list review comments", FORGE_ATTEMPTS, || {
            self.forge
                .list_review_comments(installation_id, &queued.repo, pr_number)
        })
        .await?;

        for run in &analysis.tool_runs {
            for issue in &run.issues {
                let comment = ReviewComment {
                    path: issue.path.clone(),
                    position: issue.hunk_pos,
                    body: issue.body.clone(),
                };
                if existing.contains(&comment) {
                    tracing::debug!(path = %comment.path, position = comment.position, "comment already present, skipping");
                    continue;
                }
                let result = with_retries("create review comment", FORGE_ATTEMPTS, || {
                    self.forge.create_review_comment(
                        installation_id,
                        &queued.repo,
                        pr_number,
                        &queued.head_sha,
                        &comment,
                    )
                })
                .await;
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_permanent() => {
                        tracing::error!(path = %comment.path, error = %e, "comment rejected, skipping");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
