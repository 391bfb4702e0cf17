//! Pipeline orchestration over the stage queues.
//!
//! A run has no stored state machine. It moves git → build → deploy → notify
//! purely by hand-off: each stage handler does its work through the
//! collaborators and then enqueues the next stage under the same group id
//! (the project). A job that fails for good enqueues a failure notification
//! instead, so every run ends in exactly one notify job.
//!
//! Jobs are tagged with their run, and cancellation marks live in the job
//! store, so every engine sharing a store honours a cancel.

use async_trait::async_trait;
use serde::Serialize;
use shipyard_config::EngineConfig;
use shipyard_core::executor::{ArtifactRef, BuildExecutor, StageKind, StageRequest};
use shipyard_core::notify::{Notification, Notifier, StatusReporter, StatusUpdate};
use shipyard_core::{BuildVariant, PipelineStatus, RecipeTable, ResourceId, Stage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::context::EngineContext;
use crate::job::{Job, JobId};
use crate::payload::{
    BuildPayload, DeployPayload, GitPayload, NotifyPayload, PipelineRef, append_log,
};
use crate::shutdown::ShutdownCoordinator;
use crate::store::JobStore;
use crate::worker::{StageHandler, WorkerPool};
use crate::{QueueError, QueueResult, StageError};

/// Logged against a pipeline cancelled by request.
pub const CANCELLED_MESSAGE: &str = "Pipeline cancelled by user";

/// The external services stage handlers call.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn BuildExecutor>,
    pub notifier: Arc<dyn Notifier>,
    pub status: Arc<dyn StatusReporter>,
}

/// Request to start a pipeline run.
#[derive(Debug, Clone)]
pub struct SubmitPipeline {
    pub project_id: String,
    pub repo_url: String,
    /// Defaults to `main` when empty.
    pub branch: String,
    /// `ink-contract` or `dapp`.
    pub project_type: String,
    pub framework: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubmittedPipeline {
    pub pipeline_id: ResourceId,
    pub initial_job_id: JobId,
}

/// State shared by the stage handlers.
struct Pipelines {
    store: Arc<dyn JobStore>,
    config: Arc<EngineConfig>,
    collaborators: Collaborators,
    recipes: RecipeTable,
}

impl Pipelines {
    /// Record that a run entered `stage`. Returns `false` for a cancelled run,
    /// whose jobs are acknowledged without doing any work.
    async fn begin(&self, pipeline: &PipelineRef, stage: Stage) -> Result<bool, StageError> {
        if self.store.is_run_cancelled(pipeline.pipeline_id).await? {
            info!(pipeline_id = %pipeline.pipeline_id, %stage, "Skipping stage of cancelled pipeline");
            return Ok(false);
        }

        if let Err(e) = self
            .collaborators
            .status
            .report(StatusUpdate::running(pipeline.pipeline_id, stage))
            .await
        {
            warn!(pipeline_id = %pipeline.pipeline_id, %stage, error = %e, "Failed to report stage start");
        }
        Ok(true)
    }

    /// Enqueue the next stage of a run, unless the run was cancelled meanwhile.
    async fn hand_off<T: Serialize>(
        &self,
        pipeline: &PipelineRef,
        next: Stage,
        payload: &T,
    ) -> Result<(), StageError> {
        if self.store.is_run_cancelled(pipeline.pipeline_id).await? {
            info!(pipeline_id = %pipeline.pipeline_id, %next, "Pipeline cancelled; not enqueuing next stage");
            return Ok(());
        }

        let job_id = self
            .store
            .enqueue_for_run(
                next,
                &pipeline.project_id,
                Some(pipeline.pipeline_id),
                serde_json::to_value(payload)?,
                self.config.queue(next).max_attempts,
            )
            .await?;

        info!(
            pipeline_id = %pipeline.pipeline_id,
            group_id = %pipeline.project_id,
            %job_id,
            %next,
            "Enqueued next stage"
        );
        Ok(())
    }

    /// Route a job that failed for good to the notify stage. When the notify
    /// job cannot be enqueued the outcome is delivered directly instead.
    async fn fail_run(&self, job: &Job, reason: &str) {
        let pipeline: PipelineRef = match job.decode_payload() {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Cannot report failure of job with undecodable payload");
                return;
            }
        };
        let logs = job
            .payload
            .get("logs")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        let notify = NotifyPayload {
            pipeline,
            status: PipelineStatus::Failed,
            stage: job.queue,
            details: Some(reason.to_string()),
            deployment_url: None,
            logs,
        };
        if let Err(e) = self.hand_off(&notify.pipeline, Stage::Notify, &notify).await {
            let pipeline_id = notify.pipeline.pipeline_id;
            error!(
                %pipeline_id,
                stage = %job.queue,
                error = %e,
                "Failed to enqueue failure notification; delivering it directly"
            );
            if let Err(e) = self.deliver(notify).await {
                error!(%pipeline_id, error = %e, "Failed to deliver failure notification");
            }
        }
    }

    /// Report a run's terminal status, then send its notification.
    async fn deliver(&self, payload: NotifyPayload) -> Result<(), StageError> {
        let pipeline_id = payload.pipeline.pipeline_id;
        self.collaborators
            .status
            .report(StatusUpdate::finished(
                pipeline_id,
                payload.status,
                payload.stage,
                payload.logs,
            ))
            .await?;

        let notification = Notification {
            pipeline_id,
            project_id: payload.pipeline.project_id,
            status: payload.status,
            stage: payload.stage,
            details: payload.details,
            deployment_url: payload.deployment_url,
            timestamp: chrono::Utc::now(),
        };
        self.collaborators.notifier.notify(&notification).await?;

        info!(%pipeline_id, status = %notification.status, stage = %notification.stage, "Pipeline finished");
        Ok(())
    }

    fn request(&self, pipeline: &PipelineRef, kind: StageKind) -> StageRequest {
        StageRequest {
            pipeline_id: pipeline.pipeline_id,
            kind,
            repo_url: pipeline.repo_url.clone(),
            branch: pipeline.branch.clone(),
            extra: HashMap::from([
                ("project_id".to_string(), pipeline.project_id.clone()),
                ("variant".to_string(), pipeline.variant.to_string()),
            ]),
        }
    }

    fn deployment_url(&self, project_id: &str, artifact: &ArtifactRef) -> String {
        match &self.config.collaborators.deploy_base_url {
            Some(base) => format!("{}/{}", base.as_str().trim_end_matches('/'), project_id),
            None => artifact.location.clone(),
        }
    }
}

/// Checks the repository is reachable and has the variant's layout.
struct GitStage(Arc<Pipelines>);

#[async_trait]
impl StageHandler for GitStage {
    async fn handle(&self, job: &Job) -> Result<(), StageError> {
        let GitPayload { pipeline } = job.decode_payload()?;
        if !self.0.begin(&pipeline, Stage::Git).await? {
            return Ok(());
        }

        let recipe = self.0.recipes.get(pipeline.variant)?;
        let kind = StageKind::Validate {
            required_files: recipe
                .required_files()
                .iter()
                .map(|file| file.to_string())
                .collect(),
        };
        let output = self
            .0
            .collaborators
            .executor
            .execute(self.0.request(&pipeline, kind))
            .await?;

        let next = BuildPayload {
            logs: append_log("", Stage::Git, &output.log),
            source: output.artifact,
            pipeline,
        };
        self.0.hand_off(&next.pipeline, Stage::Build, &next).await
    }

    async fn on_failed(&self, job: &Job, reason: &str) {
        self.0.fail_run(job, reason).await;
    }
}

/// Runs the variant's build recipe.
struct BuildStage(Arc<Pipelines>);

#[async_trait]
impl StageHandler for BuildStage {
    async fn handle(&self, job: &Job) -> Result<(), StageError> {
        let payload: BuildPayload = job.decode_payload()?;
        if !self.0.begin(&payload.pipeline, Stage::Build).await? {
            return Ok(());
        }

        let plan = self.0.recipes.get(payload.pipeline.variant)?.plan();
        info!(
            pipeline_id = %payload.pipeline.pipeline_id,
            variant = %payload.pipeline.variant,
            image = %plan.image,
            "Building"
        );
        let output = self
            .0
            .collaborators
            .executor
            .execute(self.0.request(&payload.pipeline, StageKind::Build { plan }))
            .await?;

        let next = DeployPayload {
            logs: append_log(&payload.logs, Stage::Build, &output.log),
            artifact: output.artifact,
            pipeline: payload.pipeline,
        };
        self.0.hand_off(&next.pipeline, Stage::Deploy, &next).await
    }

    async fn on_failed(&self, job: &Job, reason: &str) {
        self.0.fail_run(job, reason).await;
    }
}

/// Publishes the build artifact.
struct DeployStage(Arc<Pipelines>);

#[async_trait]
impl StageHandler for DeployStage {
    async fn handle(&self, job: &Job) -> Result<(), StageError> {
        let payload: DeployPayload = job.decode_payload()?;
        if !self.0.begin(&payload.pipeline, Stage::Deploy).await? {
            return Ok(());
        }

        let kind = StageKind::Deploy {
            artifact: payload.artifact.clone(),
        };
        let output = self
            .0
            .collaborators
            .executor
            .execute(self.0.request(&payload.pipeline, kind))
            .await?;

        let deployment_url = self
            .0
            .deployment_url(&payload.pipeline.project_id, &output.artifact);
        let next = NotifyPayload {
            logs: append_log(&payload.logs, Stage::Deploy, &output.log),
            pipeline: payload.pipeline,
            status: PipelineStatus::Success,
            stage: Stage::Deploy,
            details: None,
            deployment_url: Some(deployment_url),
        };
        self.0.hand_off(&next.pipeline, Stage::Notify, &next).await
    }

    async fn on_failed(&self, job: &Job, reason: &str) {
        self.0.fail_run(job, reason).await;
    }
}

/// Reports the terminal status and delivers the notification.
struct NotifyStage(Arc<Pipelines>);

#[async_trait]
impl StageHandler for NotifyStage {
    async fn handle(&self, job: &Job) -> Result<(), StageError> {
        let payload: NotifyPayload = job.decode_payload()?;
        let pipeline_id = payload.pipeline.pipeline_id;
        if self.0.store.is_run_cancelled(pipeline_id).await? {
            info!(%pipeline_id, "Dropping notification of cancelled pipeline");
            return Ok(());
        }
        self.0.deliver(payload).await
    }

    async fn on_failed(&self, job: &Job, reason: &str) {
        // Notify is the end of the chain; nothing further is enqueued.
        error!(job_id = %job.id, reason, "Notification could not be delivered");
    }
}

/// Entry point for pipeline runs: submits and cancels them, and owns the
/// stage handlers the worker pools run.
pub struct StageOrchestrator {
    ctx: EngineContext,
    pipelines: Arc<Pipelines>,
}

impl StageOrchestrator {
    pub fn new(ctx: EngineContext, collaborators: Collaborators) -> Self {
        Self::with_recipes(ctx, collaborators, RecipeTable::standard())
    }

    pub fn with_recipes(
        ctx: EngineContext,
        collaborators: Collaborators,
        recipes: RecipeTable,
    ) -> Self {
        let pipelines = Arc::new(Pipelines {
            store: ctx.store.clone(),
            config: ctx.config.clone(),
            collaborators,
            recipes,
        });
        Self { ctx, pipelines }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Start a run: enqueue its git job, grouped by project, and report it
    /// pending.
    pub async fn submit_pipeline(&self, request: SubmitPipeline) -> QueueResult<SubmittedPipeline> {
        let submitted = enqueue_pipeline(&self.ctx, request).await?;
        if let Err(e) = self
            .pipelines
            .collaborators
            .status
            .report(StatusUpdate::pending(submitted.pipeline_id))
            .await
        {
            warn!(pipeline_id = %submitted.pipeline_id, error = %e, "Failed to report submitted pipeline");
        }
        Ok(submitted)
    }

    /// Cancel a run. It is reported failed at once; the stage in flight is
    /// left to finish but nothing further is enqueued for it, by this or any
    /// other engine sharing the store.
    pub async fn cancel(&self, pipeline_id: ResourceId) -> QueueResult<()> {
        let queues = self.ctx.store.cancel_run(pipeline_id).await?;
        let Some(stage) = queues.last().copied() else {
            return Err(QueueError::Core(shipyard_core::Error::Conflict(format!(
                "pipeline {} is not running",
                pipeline_id
            ))));
        };

        info!(%pipeline_id, %stage, "Cancelling pipeline");
        self.pipelines
            .collaborators
            .status
            .report(StatusUpdate::finished(
                pipeline_id,
                PipelineStatus::Failed,
                stage,
                CANCELLED_MESSAGE.to_string(),
            ))
            .await?;
        Ok(())
    }

    /// The latest stage holding a waiting or leased job of the run; `None`
    /// once the run has ended.
    pub async fn current_stage(&self, pipeline_id: ResourceId) -> QueueResult<Option<Stage>> {
        Ok(self.ctx.store.run_queues(pipeline_id).await?.last().copied())
    }

    pub async fn is_cancelled(&self, pipeline_id: ResourceId) -> QueueResult<bool> {
        self.ctx.store.is_run_cancelled(pipeline_id).await
    }

    pub fn handler(&self, stage: Stage) -> Arc<dyn StageHandler> {
        let pipelines = self.pipelines.clone();
        match stage {
            Stage::Git => Arc::new(GitStage(pipelines)),
            Stage::Build => Arc::new(BuildStage(pipelines)),
            Stage::Deploy => Arc::new(DeployStage(pipelines)),
            Stage::Notify => Arc::new(NotifyStage(pipelines)),
        }
    }

    /// Start a worker pool for every stage. The returned coordinator stops
    /// them.
    pub fn start(&self) -> ShutdownCoordinator {
        let pools = Stage::ALL
            .into_iter()
            .map(|stage| {
                let mut pool = WorkerPool::new(&self.ctx, stage, self.handler(stage));
                pool.start();
                pool
            })
            .collect();
        ShutdownCoordinator::new(pools, self.ctx.store.clone())
    }
}

/// Validate a pipeline request and enqueue its git job with the project as
/// group id. Needs only the store, so runs can be submitted from outside the
/// process that works them.
pub async fn enqueue_pipeline(
    ctx: &EngineContext,
    request: SubmitPipeline,
) -> QueueResult<SubmittedPipeline> {
    if request.project_id.trim().is_empty() {
        return Err(invalid("project id is required"));
    }
    if request.repo_url.trim().is_empty() {
        return Err(invalid("repository url is required"));
    }
    let variant = BuildVariant::from_project(&request.project_type, request.framework.as_deref())?;

    let branch = if request.branch.trim().is_empty() {
        "main".to_string()
    } else {
        request.branch
    };
    let pipeline = PipelineRef {
        pipeline_id: ResourceId::new(),
        project_id: request.project_id,
        repo_url: request.repo_url,
        branch,
        variant,
    };
    let pipeline_id = pipeline.pipeline_id;
    let group_id = pipeline.project_id.clone();

    let initial_job_id = ctx
        .store
        .enqueue_for_run(
            Stage::Git,
            &group_id,
            Some(pipeline_id),
            serde_json::to_value(GitPayload { pipeline })?,
            ctx.config.queue(Stage::Git).max_attempts,
        )
        .await?;

    info!(%pipeline_id, %group_id, job_id = %initial_job_id, %variant, "Submitted pipeline");
    Ok(SubmittedPipeline {
        pipeline_id,
        initial_job_id,
    })
}

fn invalid(message: &str) -> QueueError {
    QueueError::Core(shipyard_core::Error::InvalidInput(message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::store::MemoryJobStore;
    use chrono::Utc;
    use rstest::rstest;
    use shipyard_core::executor::StageOutput;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Executor whose behavior per stage kind is scripted by the test.
    #[derive(Default)]
    struct ScriptedExecutor {
        calls: Mutex<Vec<&'static str>>,
        /// Build fails with this error for every call.
        build_error: Option<fn() -> shipyard_core::Error>,
        /// Build fails transiently this many times before succeeding.
        build_flakes: AtomicUsize,
        /// Build never returns.
        build_hangs: bool,
        /// When set, git waits for a permit before returning.
        git_gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl BuildExecutor for ScriptedExecutor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn execute(&self, request: StageRequest) -> shipyard_core::Result<StageOutput> {
            self.calls.lock().unwrap().push(request.kind.name());
            match &request.kind {
                StageKind::Validate { .. } => {
                    if let Some(gate) = &self.git_gate {
                        let _permit = gate.acquire().await.unwrap();
                    }
                }
                StageKind::Build { .. } => {
                    if self.build_hangs {
                        futures::future::pending::<()>().await;
                    }
                    if let Some(error) = self.build_error {
                        return Err(error());
                    }
                    let flakes = self.build_flakes.load(Ordering::SeqCst);
                    if flakes > 0 {
                        self.build_flakes.store(flakes - 1, Ordering::SeqCst);
                        return Err(shipyard_core::Error::ExecutionFailed(
                            "registry timeout".to_string(),
                        ));
                    }
                }
                StageKind::Deploy { .. } => {}
            }

            Ok(StageOutput {
                artifact: ArtifactRef {
                    name: request.kind.name().to_string(),
                    location: format!(
                        "s3://artifacts/{}/{}",
                        request.pipeline_id,
                        request.kind.name()
                    ),
                    size: None,
                    created_at: Utc::now(),
                },
                log: format!("{} ok", request.kind.name()),
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> shipyard_core::Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        updates: Mutex<Vec<StatusUpdate>>,
    }

    #[async_trait]
    impl StatusReporter for RecordingReporter {
        async fn report(&self, update: StatusUpdate) -> shipyard_core::Result<()> {
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
    }

    struct Harness {
        orchestrator: StageOrchestrator,
        executor: Arc<ScriptedExecutor>,
        notifier: Arc<RecordingNotifier>,
        reporter: Arc<RecordingReporter>,
    }

    fn harness(executor: ScriptedExecutor, tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
        harness_on(Arc::new(MemoryJobStore::new()), executor, tweak)
    }

    /// An engine over `store`, which other engines may share.
    fn harness_on(
        store: Arc<dyn JobStore>,
        executor: ScriptedExecutor,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Harness {
        let mut config = EngineConfig::default();
        for stage in Stage::ALL {
            let settings = config.queue_mut(stage);
            settings.poll_interval = Duration::from_millis(20);
            settings.reap_interval = Duration::from_millis(20);
            settings.shutdown_grace = Duration::from_millis(200);
        }
        tweak(&mut config);

        let executor = Arc::new(executor);
        let notifier = Arc::new(RecordingNotifier::default());
        let reporter = Arc::new(RecordingReporter::default());
        let ctx = EngineContext::new(config, store);
        let orchestrator = StageOrchestrator::new(
            ctx,
            Collaborators {
                executor: executor.clone(),
                notifier: notifier.clone(),
                status: reporter.clone(),
            },
        );
        Harness {
            orchestrator,
            executor,
            notifier,
            reporter,
        }
    }

    fn submit(project_id: &str) -> SubmitPipeline {
        SubmitPipeline {
            project_id: project_id.to_string(),
            repo_url: "https://example/repo".to_string(),
            branch: "main".to_string(),
            project_type: "dapp".to_string(),
            framework: Some("vite".to_string()),
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn list_jobs(harness: &Harness, stage: Stage) -> Vec<Job> {
        harness
            .orchestrator
            .context()
            .store
            .list(stage, None, 100)
            .await
            .unwrap()
    }

    /// Wait for every queue to go idle, snapshot all jobs, then shut down.
    async fn finish(
        harness: &Harness,
        coordinator: ShutdownCoordinator,
    ) -> HashMap<Stage, Vec<Job>> {
        let store = harness.orchestrator.context().store.clone();
        for _ in 0..300 {
            let mut busy = 0;
            for stage in Stage::ALL {
                let counts = store.counts(stage).await.unwrap();
                busy += counts.waiting + counts.leased;
            }
            if busy == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut snapshot = HashMap::new();
        for stage in Stage::ALL {
            snapshot.insert(stage, list_jobs(harness, stage).await);
        }
        coordinator.shutdown().await;
        snapshot
    }

    #[tokio::test]
    async fn test_successful_run_chains_all_stages() {
        let h = harness(ScriptedExecutor::default(), |config| {
            config.collaborators.deploy_base_url =
                Some("https://apps.example/".parse().unwrap());
        });
        let coordinator = h.orchestrator.start();
        let submitted = h.orchestrator.submit_pipeline(submit("proj-1")).await.unwrap();

        wait_until(|| h.notifier.sent.lock().unwrap().len() == 1).await;
        let jobs = finish(&h, coordinator).await;

        let notify_jobs = &jobs[&Stage::Notify];
        assert_eq!(notify_jobs.len(), 1);
        let payload = &notify_jobs[0].payload;
        assert_eq!(payload["status"], "success");
        assert_eq!(payload["project_id"], "proj-1");
        assert_eq!(payload["repo_url"], "https://example/repo");
        assert_eq!(payload["branch"], "main");
        assert_eq!(notify_jobs[0].group_id, "proj-1");
        assert_eq!(notify_jobs[0].state, JobState::Completed);

        let sent = h.notifier.sent.lock().unwrap();
        assert_eq!(sent[0].pipeline_id, submitted.pipeline_id);
        assert_eq!(sent[0].status, PipelineStatus::Success);
        assert_eq!(
            sent[0].deployment_url.as_deref(),
            Some("https://apps.example/proj-1")
        );

        assert_eq!(
            *h.executor.calls.lock().unwrap(),
            vec!["validate", "build", "deploy"]
        );

        let updates = h.reporter.updates.lock().unwrap();
        let running: Vec<Stage> = updates
            .iter()
            .filter(|u| u.status == PipelineStatus::Running)
            .map(|u| u.stage)
            .collect();
        assert_eq!(running, vec![Stage::Git, Stage::Build, Stage::Deploy]);
        assert_eq!(updates[0].status, PipelineStatus::Pending);
        let last = updates.last().unwrap();
        assert_eq!(last.status, PipelineStatus::Success);
        assert_eq!(
            last.logs.as_deref(),
            Some("[git]\nvalidate ok\n[build]\nbuild ok\n[deploy]\ndeploy ok")
        );
        assert!(last.completed_at.is_some());
        assert!(jobs.values().flatten().all(|job| job.state.is_terminal()));
    }

    #[rstest]
    #[case::missing_files(|| shipyard_core::Error::InvalidInput("package.json not found".to_string()))]
    #[case::unknown_repo(|| shipyard_core::Error::NotFound("repository".to_string()))]
    #[tokio::test]
    async fn test_permanent_build_failure_short_circuits(
        #[case] error: fn() -> shipyard_core::Error,
    ) {
        let h = harness(
            ScriptedExecutor {
                build_error: Some(error),
                ..Default::default()
            },
            |_| {},
        );
        let coordinator = h.orchestrator.start();
        h.orchestrator.submit_pipeline(submit("proj-1")).await.unwrap();

        wait_until(|| h.notifier.sent.lock().unwrap().len() == 1).await;
        let jobs = finish(&h, coordinator).await;

        assert!(jobs[&Stage::Deploy].is_empty());
        let notify_jobs = &jobs[&Stage::Notify];
        assert_eq!(notify_jobs.len(), 1);
        assert_eq!(notify_jobs[0].payload["status"], "failed");
        assert_eq!(notify_jobs[0].payload["stage"], "build");

        let builds = &jobs[&Stage::Build];
        assert_eq!(builds[0].attempts, 1);
        assert_eq!(builds[0].state, JobState::Failed);

        let sent = h.notifier.sent.lock().unwrap();
        assert_eq!(sent[0].status, PipelineStatus::Failed);
        assert_eq!(sent[0].stage, Stage::Build);
        assert_eq!(sent[0].deployment_url, None);
    }

    #[tokio::test]
    async fn test_retried_build_leaves_no_stray_failure_notification() {
        let h = harness(
            ScriptedExecutor {
                build_flakes: AtomicUsize::new(2),
                ..Default::default()
            },
            |_| {},
        );
        let coordinator = h.orchestrator.start();
        h.orchestrator.submit_pipeline(submit("proj-1")).await.unwrap();

        wait_until(|| h.notifier.sent.lock().unwrap().len() == 1).await;
        let jobs = finish(&h, coordinator).await;

        let notify_jobs = &jobs[&Stage::Notify];
        assert_eq!(notify_jobs.len(), 1);
        assert_eq!(notify_jobs[0].payload["status"], "success");
        assert_eq!(jobs[&Stage::Build][0].attempts, 3);
        assert!(
            h.reporter
                .updates
                .lock()
                .unwrap()
                .iter()
                .all(|u| u.status != PipelineStatus::Failed)
        );
    }

    #[tokio::test]
    async fn test_exhausted_timeouts_notify_failure_once() {
        let h = harness(
            ScriptedExecutor {
                build_hangs: true,
                ..Default::default()
            },
            |config| {
                let build = config.queue_mut(Stage::Build);
                build.job_timeout = Duration::from_millis(30);
                build.max_attempts = 2;
                build.reap_interval = Duration::from_secs(60);
            },
        );
        let coordinator = h.orchestrator.start();
        h.orchestrator.submit_pipeline(submit("proj-1")).await.unwrap();

        wait_until(|| h.notifier.sent.lock().unwrap().len() == 1).await;
        finish(&h, coordinator).await;

        let sent = h.notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].status, PipelineStatus::Failed);
        assert_eq!(sent[0].stage, Stage::Build);
        assert!(sent[0].details.as_deref().unwrap().contains("exceeded"));
        assert_eq!(
            h.executor
                .calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| **c == "build")
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_cancel_suppresses_downstream_stages() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(
            ScriptedExecutor {
                git_gate: Some(gate.clone()),
                ..Default::default()
            },
            |_| {},
        );
        let coordinator = h.orchestrator.start();
        let submitted = h.orchestrator.submit_pipeline(submit("proj-1")).await.unwrap();

        wait_until(|| !h.executor.calls.lock().unwrap().is_empty()).await;
        h.orchestrator.cancel(submitted.pipeline_id).await.unwrap();
        assert!(
            h.orchestrator
                .is_cancelled(submitted.pipeline_id)
                .await
                .unwrap()
        );
        gate.add_permits(1);

        let store = h.orchestrator.context().store.clone();
        for _ in 0..300 {
            if store.counts(Stage::Git).await.unwrap().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The run has ended: a second cancel finds nothing to stop.
        let again = h.orchestrator.cancel(submitted.pipeline_id).await;
        assert!(matches!(
            again,
            Err(QueueError::Core(shipyard_core::Error::Conflict(_)))
        ));
        let jobs = finish(&h, coordinator).await;

        assert!(jobs[&Stage::Build].is_empty());
        assert!(jobs[&Stage::Notify].is_empty());
        assert!(h.notifier.sent.lock().unwrap().is_empty());

        let last = h.reporter.updates.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.status, PipelineStatus::Failed);
        assert_eq!(last.stage, Stage::Git);
        assert_eq!(last.logs.as_deref(), Some(CANCELLED_MESSAGE));
    }

    #[tokio::test]
    async fn test_runs_of_one_project_stay_in_order() {
        let h = harness(ScriptedExecutor::default(), |_| {});
        let first = h.orchestrator.submit_pipeline(submit("proj-1")).await.unwrap();
        let second = h.orchestrator.submit_pipeline(submit("proj-1")).await.unwrap();
        let coordinator = h.orchestrator.start();

        wait_until(|| h.notifier.sent.lock().unwrap().len() == 2).await;
        finish(&h, coordinator).await;

        let order: Vec<ResourceId> = h
            .notifier
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.pipeline_id)
            .collect();
        assert_eq!(order, vec![first.pipeline_id, second.pipeline_id]);
    }

    #[rstest]
    #[case::no_project("", "https://example/repo", "dapp", Some("vite"))]
    #[case::no_repo("proj-1", "", "dapp", Some("vite"))]
    #[case::unknown_type("proj-1", "https://example/repo", "wasm-module", None)]
    #[case::unknown_framework("proj-1", "https://example/repo", "dapp", Some("angular"))]
    #[tokio::test]
    async fn test_submit_rejects_invalid_requests(
        #[case] project_id: &str,
        #[case] repo_url: &str,
        #[case] project_type: &str,
        #[case] framework: Option<&str>,
    ) {
        let h = harness(ScriptedExecutor::default(), |_| {});
        let result = h
            .orchestrator
            .submit_pipeline(SubmitPipeline {
                project_id: project_id.to_string(),
                repo_url: repo_url.to_string(),
                branch: String::new(),
                project_type: project_type.to_string(),
                framework: framework.map(str::to_string),
            })
            .await;

        assert!(matches!(
            result,
            Err(QueueError::Core(shipyard_core::Error::InvalidInput(_)))
        ));
        assert!(list_jobs(&h, Stage::Git).await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_defaults_branch_and_groups_by_project() {
        let h = harness(ScriptedExecutor::default(), |_| {});
        let mut request = submit("proj-9");
        request.branch = String::new();
        request.project_type = "ink-contract".to_string();
        request.framework = None;

        let submitted = h.orchestrator.submit_pipeline(request).await.unwrap();
        let job = h
            .orchestrator
            .context()
            .store
            .get(submitted.initial_job_id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.queue, Stage::Git);
        assert_eq!(job.group_id, "proj-9");
        assert_eq!(job.payload["branch"], "main");
        assert_eq!(job.payload["variant"], "contract");
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.run_id, Some(submitted.pipeline_id));
        assert_eq!(
            h.orchestrator
                .current_stage(submitted.pipeline_id)
                .await
                .unwrap(),
            Some(Stage::Git)
        );
    }

    #[tokio::test]
    async fn test_cancel_is_honoured_by_every_engine_on_the_store() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let submitter = harness_on(store.clone(), ScriptedExecutor::default(), |_| {});
        let worker = harness_on(store.clone(), ScriptedExecutor::default(), |_| {});

        // Submitted the way the CLI does, without any engine seeing it.
        let submitted = enqueue_pipeline(submitter.orchestrator.context(), submit("proj-1"))
            .await
            .unwrap();
        submitter
            .orchestrator
            .cancel(submitted.pipeline_id)
            .await
            .unwrap();
        assert!(
            worker
                .orchestrator
                .is_cancelled(submitted.pipeline_id)
                .await
                .unwrap()
        );

        let coordinator = worker.orchestrator.start();
        for _ in 0..300 {
            if store.counts(Stage::Git).await.unwrap().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let jobs = finish(&worker, coordinator).await;

        assert_eq!(jobs[&Stage::Git][0].state, JobState::Completed);
        assert!(jobs[&Stage::Build].is_empty());
        assert!(jobs[&Stage::Notify].is_empty());
        assert!(worker.executor.calls.lock().unwrap().is_empty());
        assert!(worker.notifier.sent.lock().unwrap().is_empty());
        assert!(worker.reporter.updates.lock().unwrap().is_empty());

        let updates = submitter.reporter.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, PipelineStatus::Failed);
        assert_eq!(updates[0].stage, Stage::Git);
    }

    #[tokio::test]
    async fn test_lease_expiry_exhaustion_notifies_failure_once() {
        let h = harness(ScriptedExecutor::default(), |config| {
            config.queue_mut(Stage::Git).max_attempts = 1;
        });
        let submitted = h.orchestrator.submit_pipeline(submit("proj-1")).await.unwrap();
        // A worker elsewhere leases the git job and dies holding it.
        let store = h.orchestrator.context().store.clone();
        store
            .claim(Stage::Git, "crashed-worker", Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();

        let coordinator = h.orchestrator.start();
        wait_until(|| h.notifier.sent.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let jobs = finish(&h, coordinator).await;

        let sent = h.notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].pipeline_id, submitted.pipeline_id);
        assert_eq!(sent[0].status, PipelineStatus::Failed);
        assert_eq!(sent[0].stage, Stage::Git);
        assert_eq!(sent[0].details.as_deref(), Some(crate::lease::LEASE_EXPIRED));
        assert!(h.executor.calls.lock().unwrap().is_empty());
        assert_eq!(jobs[&Stage::Git][0].state, JobState::Failed);
        assert_eq!(jobs[&Stage::Notify].len(), 1);
    }

    /// Memory store that refuses every enqueue onto the notify queue.
    struct NotifyQueueDown(MemoryJobStore);

    #[async_trait]
    impl JobStore for NotifyQueueDown {
        fn name(&self) -> &'static str {
            "notify-queue-down"
        }

        async fn enqueue_for_run(
            &self,
            queue: Stage,
            group_id: &str,
            run_id: Option<ResourceId>,
            payload: serde_json::Value,
            max_attempts: u32,
        ) -> QueueResult<JobId> {
            if queue == Stage::Notify {
                return Err(QueueError::StoreUnavailable("connection reset".to_string()));
            }
            self.0
                .enqueue_for_run(queue, group_id, run_id, payload, max_attempts)
                .await
        }

        async fn claim(
            &self,
            queue: Stage,
            worker_id: &str,
            lease_timeout: Duration,
        ) -> QueueResult<Option<Job>> {
            self.0.claim(queue, worker_id, lease_timeout).await
        }

        async fn ack(&self, lease: &crate::job::Lease) -> QueueResult<bool> {
            self.0.ack(lease).await
        }

        async fn fail(
            &self,
            lease: &crate::job::Lease,
            permanent: bool,
            reason: &str,
        ) -> QueueResult<Option<JobState>> {
            self.0.fail(lease, permanent, reason).await
        }

        async fn reclaim_expired(&self, queue: Stage) -> QueueResult<Vec<Job>> {
            self.0.reclaim_expired(queue).await
        }

        async fn retention(
            &self,
            queue: Stage,
            keep_completed: usize,
            keep_failed: usize,
        ) -> QueueResult<crate::job::RetentionStats> {
            self.0.retention(queue, keep_completed, keep_failed).await
        }

        async fn release_leases(&self, queue: Stage, worker_ids: &[String]) -> QueueResult<u64> {
            self.0.release_leases(queue, worker_ids).await
        }

        async fn run_queues(&self, run_id: ResourceId) -> QueueResult<Vec<Stage>> {
            self.0.run_queues(run_id).await
        }

        async fn cancel_run(&self, run_id: ResourceId) -> QueueResult<Vec<Stage>> {
            self.0.cancel_run(run_id).await
        }

        async fn is_run_cancelled(&self, run_id: ResourceId) -> QueueResult<bool> {
            self.0.is_run_cancelled(run_id).await
        }

        async fn prune_cancelled_runs(&self) -> QueueResult<u64> {
            self.0.prune_cancelled_runs().await
        }

        async fn get(&self, job_id: JobId) -> QueueResult<Option<Job>> {
            self.0.get(job_id).await
        }

        async fn list(
            &self,
            queue: Stage,
            state: Option<JobState>,
            limit: usize,
        ) -> QueueResult<Vec<Job>> {
            self.0.list(queue, state, limit).await
        }

        async fn counts(&self, queue: Stage) -> QueueResult<crate::job::QueueCounts> {
            self.0.counts(queue).await
        }

        async fn wait_for_work(&self, queue: Stage, timeout: Duration) {
            self.0.wait_for_work(queue, timeout).await
        }

        async fn close(&self) {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_failure_reported_directly_when_notify_queue_unavailable() {
        let h = harness_on(
            Arc::new(NotifyQueueDown(MemoryJobStore::new())),
            ScriptedExecutor {
                build_error: Some(|| {
                    shipyard_core::Error::InvalidInput("package.json not found".to_string())
                }),
                ..Default::default()
            },
            |_| {},
        );
        let coordinator = h.orchestrator.start();
        let submitted = h.orchestrator.submit_pipeline(submit("proj-1")).await.unwrap();

        wait_until(|| h.notifier.sent.lock().unwrap().len() == 1).await;
        let jobs = finish(&h, coordinator).await;

        assert!(jobs[&Stage::Notify].is_empty());
        assert_eq!(jobs[&Stage::Build][0].state, JobState::Failed);

        let sent = h.notifier.sent.lock().unwrap();
        assert_eq!(sent[0].pipeline_id, submitted.pipeline_id);
        assert_eq!(sent[0].status, PipelineStatus::Failed);
        assert_eq!(sent[0].stage, Stage::Build);

        let last = h.reporter.updates.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.status, PipelineStatus::Failed);
        assert_eq!(last.stage, Stage::Build);
        assert!(last.completed_at.is_some());
    }
}
