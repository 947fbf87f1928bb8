//! Build orchestrator - drives jobs from admission to merge and release.
//!
//! Reacts to three inputs: change events from review adapters
//! (`on_update`, `on_push`, `on_delete`), ledger transitions, and executor
//! outcomes. Every call may be re-entered while an earlier one is still
//! awaiting the store or a collaborator; correctness rests on the ledger's
//! transition table, so each step re-checks state instead of assuming it.

use keel_config::{RepositoryPolicy, SystemConfig};
use keel_core::artifact::ArtifactPublisher;
use keel_core::build_log::{BuildLog, LogLevel};
use keel_core::dependency::DependencyGraphService;
use keel_core::executor::{JobExecutor, JobOutcome};
use keel_core::repository::{GitRef, RebaseOutcome, RepositoryAccess, Update, VersionModel};
use keel_core::version::is_release_tag;
use keel_core::{BumpType, CommitId, JobKey, JobRef, QueueState, Source, Version};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::SchedulerResult;
use crate::ledger::{StatusLedger, Transition};
use crate::serializer::KeyedSerializer;

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn JobExecutor>,
    pub repositories: Arc<dyn RepositoryAccess>,
    pub versions: Arc<dyn VersionModel>,
    pub dependencies: Arc<dyn DependencyGraphService>,
    pub publisher: Arc<dyn ArtifactPublisher>,
    pub build_log: Arc<dyn BuildLog>,
}

pub struct Orchestrator {
    ledger: Arc<StatusLedger>,
    collab: Collaborators,
    config: Arc<SystemConfig>,
    /// Serializes Git access and version-model reads per repository.
    serializer: KeyedSerializer,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<StatusLedger>,
        collab: Collaborators,
        config: Arc<SystemConfig>,
    ) -> Self {
        Self {
            ledger,
            collab,
            config,
            serializer: KeyedSerializer::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<StatusLedger> {
        &self.ledger
    }

    /// Current ledger state of a job.
    pub async fn status(&self, key: &JobKey) -> SchedulerResult<Option<QueueState>> {
        self.ledger.status(key).await
    }

    fn active_policy(&self, source: &Source) -> Option<&RepositoryPolicy> {
        self.config.repository(source).filter(|p| p.active)
    }

    async fn log(&self, key: &JobKey, level: LogLevel, message: &str) {
        self.collab
            .build_log
            .add(message, level, &key.source, &key.canonical_id())
            .await;
    }

    async fn has_build_definition(&self, source: &Source, commit: &CommitId) -> bool {
        let lookup = self
            .serializer
            .run(&model_key(source), self.collab.versions.has_build_definition(source, commit))
            .await;
        match lookup {
            Ok(found) => found,
            Err(e) => {
                warn!(%source, %commit, error = %e, "Could not read build definition");
                false
            }
        }
    }

    // ---- Ingress from review adapters ----

    /// A code-review change was created or updated.
    pub async fn on_update(
        &self,
        update: Update,
        message: &str,
        error: Option<&str>,
    ) -> SchedulerResult<()> {
        if self.active_policy(&update.source).is_none() {
            debug!(source = %update.source, "Ignoring update for inactive repository");
            return Ok(());
        }

        let key = JobKey::new(
            update.source.clone(),
            JobRef::update(&update.update_id, &update.target_branch),
            update.commit.clone(),
        );

        if let Some(error) = error {
            self.log(&key, LogLevel::Error, &format!("{message} {error}")).await;
            return Ok(());
        }

        if !self.has_build_definition(&update.source, &update.commit).await {
            debug!(%key, "Commit has no build definition");
            return Ok(());
        }

        let outcome = self.ledger.push(&key).await?;
        if outcome.duplicate {
            return Ok(());
        }

        info!(
            %key,
            queue_size = outcome.size,
            superseded = outcome.cancelled.is_some() || outcome.aborted.is_some(),
            "Queued update"
        );
        self.log(
            &key,
            LogLevel::Info,
            &format!(
                "{message} Queued `{}` for `{}`.",
                update.commit.short(),
                update.target_branch
            ),
        )
        .await;
        Ok(())
    }

    /// A reference was created or moved.
    pub async fn on_push(
        &self,
        source: &Source,
        git_ref: &GitRef,
        new_commit: &CommitId,
    ) -> SchedulerResult<()> {
        self.invalidate(source).await;

        match git_ref {
            GitRef::Tag(tag) if is_release_tag(tag) => {
                info!(%source, %tag, "Release tag pushed; rescanning dependents");
                let dependencies = self.collab.dependencies.clone();
                let source = source.clone();
                let tag = tag.clone();
                tokio::spawn(async move {
                    if let Err(e) = dependencies.rescan_dependents(&source, &tag).await {
                        warn!(%source, %tag, error = %e, "Dependent rescan failed");
                    }
                });
            }
            GitRef::Tag(_) => {}
            GitRef::Branch(branch) => {
                let builds = self
                    .active_policy(source)
                    .is_some_and(|p| p.builds_branch(branch));
                if builds && self.has_build_definition(source, new_commit).await {
                    let key =
                        JobKey::new(source.clone(), JobRef::branch(branch), new_commit.clone());
                    let outcome = self.ledger.push(&key).await?;
                    if !outcome.duplicate {
                        info!(%key, "Queued branch push");
                        self.log(
                            &key,
                            LogLevel::Info,
                            &format!("Queued `{}` pushed to `{branch}`.", new_commit.short()),
                        )
                        .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// A reference was deleted.
    pub async fn on_delete(&self, source: &Source, git_ref: &GitRef) -> SchedulerResult<()> {
        debug!(%source, %git_ref, "Reference deleted");
        self.invalidate(source).await;
        Ok(())
    }

    async fn invalidate(&self, source: &Source) {
        self.serializer
            .run(&git_key(source), self.collab.repositories.invalidate(source))
            .await;
        self.serializer
            .run(&model_key(source), self.collab.versions.invalidate(source))
            .await;
    }

    // ---- Ledger transitions ----

    pub async fn on_queue_transition(&self, transition: Transition) {
        let Transition {
            key,
            state,
            previous,
            superseded,
        } = transition;
        debug!(%key, %state, previous = ?previous, superseded, "Queue transition");

        match state {
            QueueState::Starting => self.prepare(&key).await,
            QueueState::Queued => self.drain().await,
            QueueState::Started => {}
            _ => {
                // An abort the executor reported itself needs no echo.
                if state == QueueState::Aborted && superseded {
                    if let Err(e) = self.collab.executor.abort_job(&key).await {
                        warn!(%key, error = %e, "Executor abort failed");
                    }
                }
                self.drain().await;
            }
        }
    }

    /// Admit as many ready jobs as capacity allows.
    async fn drain(&self) {
        match self.ledger.start(self.config.coordinator.concurrency).await {
            Ok(admitted) if !admitted.is_empty() => {
                debug!(count = admitted.len(), "Drained ready pool");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to admit jobs"),
        }
    }

    /// Record a transition, tolerating one a concurrent event already made moot.
    async fn record(&self, key: &JobKey, state: QueueState) -> bool {
        match self.ledger.add_state(key, state).await {
            Ok(_) => true,
            Err(e) => {
                warn!(%key, %state, error = %e, "Transition rejected");
                false
            }
        }
    }

    /// Rebase, check dependencies, then hand the job to the executor.
    async fn prepare(&self, key: &JobKey) {
        if let JobRef::Update {
            update_id,
            target_branch,
        } = &key.job_ref
        {
            let rebase = self
                .serializer
                .run(
                    &git_key(&key.source),
                    self.collab.repositories.rebase(&key.source, update_id),
                )
                .await;

            match rebase {
                Ok(RebaseOutcome::UpToDate) => {}
                Ok(RebaseOutcome::Rebased(commit)) => {
                    self.log(
                        key,
                        LogLevel::Info,
                        &format!(
                            "Rebased onto `{target_branch}`; the build continues with `{}`.",
                            commit.short()
                        ),
                    )
                    .await;
                    self.record(key, QueueState::Rebased).await;
                    return;
                }
                Ok(RebaseOutcome::Conflict) => {
                    self.log(
                        key,
                        LogLevel::Warning,
                        &format!("Cannot rebase onto `{target_branch}`: the change conflicts."),
                    )
                    .await;
                    self.record(key, QueueState::Conflict).await;
                    return;
                }
                Err(e) => {
                    error!(%key, error = %e, "Rebase failed");
                    self.log(
                        key,
                        LogLevel::Error,
                        &format!("Rebase onto `{target_branch}` failed: {e}"),
                    )
                    .await;
                    self.record(key, QueueState::Error).await;
                    return;
                }
            }
        }

        let graph = match self
            .collab
            .dependencies
            .dependency_graph(&key.source, &key.commit)
            .await
        {
            Ok(graph) => graph,
            Err(e) => {
                error!(%key, error = %e, "Dependency check failed");
                self.log(key, LogLevel::Error, &format!("Dependency check failed: {e}"))
                    .await;
                self.record(key, QueueState::Error).await;
                return;
            }
        };

        if !graph.problems().is_empty() {
            for problem in graph.problems() {
                self.log(key, LogLevel::Warning, &problem.to_string()).await;
            }
            self.record(key, QueueState::Dependency).await;
            return;
        }

        let mut checked = 0usize;
        graph.traverse(|_| checked += 1);
        debug!(%key, dependencies = checked, "Dependencies consistent");

        // A newer push may have superseded the job while we were rebasing.
        match self.ledger.status(key).await {
            Ok(Some(QueueState::Starting)) => {}
            Ok(state) => {
                info!(%key, state = ?state, "Job superseded before hand-off");
                return;
            }
            Err(e) => {
                error!(%key, error = %e, "Could not re-read job state");
                return;
            }
        }

        match self.collab.executor.start_job(key).await {
            Ok(()) => {
                info!(%key, executor = self.collab.executor.name(), "Handed job to executor");
            }
            Err(e) => {
                error!(%key, error = %e, "Executor refused job");
                self.log(key, LogLevel::Error, &format!("Could not start the build: {e}"))
                    .await;
                self.record(key, QueueState::Error).await;
            }
        }
    }

    // ---- Executor outcomes ----

    pub async fn on_job_outcome(&self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Started(key) => self.on_job_started(&key).await,
            JobOutcome::Failure(key) => self.on_job_failure(&key).await,
            JobOutcome::Success(key) => self.on_job_success(&key).await,
            JobOutcome::Aborted(key) => self.on_job_aborted(&key).await,
            JobOutcome::Error(key) => self.on_job_error(&key).await,
        }
    }

    pub async fn on_job_started(&self, key: &JobKey) {
        if self.record(key, QueueState::Started).await {
            self.log(key, LogLevel::Info, "Build started.").await;
        }
    }

    pub async fn on_job_failure(&self, key: &JobKey) {
        if self.record(key, QueueState::Failure).await {
            self.log(key, LogLevel::Warning, "Build failed.").await;
        }
    }

    pub async fn on_job_error(&self, key: &JobKey) {
        if self.record(key, QueueState::Error).await {
            self.log(key, LogLevel::Error, "Build errored.").await;
        }
    }

    pub async fn on_job_aborted(&self, key: &JobKey) {
        match self.ledger.status(key).await {
            Ok(Some(QueueState::Aborted)) => {
                debug!(%key, "Abort already recorded");
            }
            _ => {
                if self.record(key, QueueState::Aborted).await {
                    self.log(key, LogLevel::Info, "Build aborted.").await;
                }
            }
        }
    }

    /// Reported by an external watchdog.
    pub async fn on_job_timeout(&self, key: &JobKey) {
        if self.record(key, QueueState::Timeout).await {
            self.log(key, LogLevel::Warning, "Build timed out.").await;
        }
    }

    pub async fn on_job_success(&self, key: &JobKey) {
        // A late abort may have already retired this job.
        match self.ledger.status(key).await {
            Ok(Some(QueueState::Started)) => {}
            Ok(state) => {
                info!(%key, state = ?state, "Ignoring success of a job that is no longer current");
                return;
            }
            Err(e) => {
                error!(%key, error = %e, "Could not read job state");
                return;
            }
        }

        if !self.record(key, QueueState::Success).await {
            return;
        }
        self.log(key, LogLevel::Info, "Build succeeded.").await;

        match self.collab.publisher.publish(key).await {
            Ok(artifacts) if artifacts.is_empty() => {}
            Ok(artifacts) => {
                let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
                self.log(
                    key,
                    LogLevel::Info,
                    &format!("Published {}.", names.join(", ")),
                )
                .await;
            }
            Err(e) => {
                error!(%key, error = %e, "Publishing failed");
                self.log(key, LogLevel::Error, &format!("Publishing failed: {e}"))
                    .await;
                return;
            }
        }

        let log_url = self
            .collab
            .build_log
            .log_url(&key.source, &key.canonical_id());
        if let Err(e) = self
            .collab
            .repositories
            .set_valid_build(&key.source, &key.commit, &log_url)
            .await
        {
            error!(%key, error = %e, "Could not mark commit verified");
            self.log(
                key,
                LogLevel::Error,
                &format!("Could not mark the commit as verified: {e}"),
            )
            .await;
            return;
        }

        let Some(policy) = self.config.repository(&key.source) else {
            return;
        };

        let landed = match &key.job_ref {
            JobRef::Update {
                update_id,
                target_branch,
            } if policy.merge => {
                let merged = self
                    .serializer
                    .run(
                        &git_key(&key.source),
                        self.collab.repositories.merge(&key.source, update_id),
                    )
                    .await;
                match merged {
                    Ok(branch) => {
                        info!(%key, %branch, "Merged update");
                        self.log(
                            key,
                            LogLevel::Info,
                            &format!("Merged to target branch `{branch}`."),
                        )
                        .await;
                        Some(branch)
                    }
                    Err(e) => {
                        error!(%key, error = %e, "Merge failed");
                        self.log(
                            key,
                            LogLevel::Error,
                            &format!("Merge to `{target_branch}` failed: {e}"),
                        )
                        .await;
                        None
                    }
                }
            }
            JobRef::Update { .. } => None,
            JobRef::Branch { branch } => Some(branch.clone()),
        };

        let Some(branch) = landed else {
            return;
        };
        if let Some(bump) = policy.release_for(&branch) {
            if let Err(e) = self
                .release_as(&key.source, &branch, bump, &key.canonical_id())
                .await
            {
                error!(%key, %branch, error = %e, "Release failed");
                self.log(
                    key,
                    LogLevel::Error,
                    &format!("Release from `{branch}` failed: {e}"),
                )
                .await;
            }
        }
    }

    // ---- Releases ----

    /// Cut a release from the tip of `branch`.
    pub async fn release(
        &self,
        source: &Source,
        branch: &str,
        bump: BumpType,
    ) -> SchedulerResult<Version> {
        self.release_as(source, branch, bump, &format!("release/{branch}"))
            .await
    }

    async fn release_as(
        &self,
        source: &Source,
        branch: &str,
        bump: BumpType,
        canonical_id: &str,
    ) -> SchedulerResult<Version> {
        let versions = &self.collab.versions;
        let repositories = &self.collab.repositories;

        let version = self
            .serializer
            .run(&model_key(source), versions.next_version(source, branch, bump))
            .await?;

        let git = git_key(source);
        let head = self
            .serializer
            .run(&git, repositories.branch_head(source, branch))
            .await?;
        self.serializer
            .run(&git, repositories.create_tag(source, &head, &version.tag()))
            .await?;

        let maintenance = self
            .config
            .repository(source)
            .is_some_and(|p| p.maintenance_branches);
        if maintenance && bump != BumpType::Patch {
            let maintenance_branch = version.maintenance_branch();
            self.serializer
                .run(&git, repositories.create_branch(source, &head, &maintenance_branch))
                .await?;
            info!(%source, branch = %maintenance_branch, "Created maintenance branch");
        }

        info!(%source, branch, %version, "Released");
        self.collab
            .build_log
            .add(
                &format!("Released version `{version}` from `{branch}`."),
                LogLevel::Info,
                source,
                canonical_id,
            )
            .await;
        Ok(version)
    }
}

fn git_key(source: &Source) -> String {
    format!("git:{source}")
}

fn model_key(source: &Source) -> String {
    format!("model:{source}")
}
