//! Recording collaborators and a wired-up harness for scheduler tests.

use async_trait::async_trait;
use keel_config::{BranchPattern, RepositoryPolicy, SystemConfig};
use keel_core::artifact::{ArtifactPublisher, PublishedArtifact};
use keel_core::build_log::{BuildLog, LogLevel};
use keel_core::dependency::{
    DependencyGraph, DependencyGraphService, DependencyNode, DependencyProblem,
};
use keel_core::executor::{JobExecutor, OutcomeSender, outcome_channel};
use keel_core::repository::{RebaseOutcome, RepositoryAccess, Update, VersionModel};
use keel_core::{BumpType, CommitId, Error, JobKey, JobRef, Result, Source, Version};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::SchedulerResult;
use crate::keys::{KeyLayout, PoolKeys};
use crate::ledger::StatusLedger;
use crate::memory::MemoryStore;
use crate::orchestrator::{Collaborators, Orchestrator};
use crate::store::{Pool, PoolEntry, PushReply, QueueStore, StartReply, StatusSwap, SwapReply};
use crate::worker::Worker;

pub fn commit(n: u32) -> CommitId {
    format!("{:040x}", n).parse().unwrap()
}

pub fn widgets() -> Source {
    Source::new("github", "acme/widgets")
}

pub fn update(source: &Source, update_id: &str, target: &str, n: u32) -> Update {
    Update {
        source: source.clone(),
        update_id: update_id.to_string(),
        target_branch: target.to_string(),
        commit: commit(n),
    }
}

pub fn update_key(update: &Update) -> JobKey {
    JobKey::new(
        update.source.clone(),
        JobRef::update(&update.update_id, &update.target_branch),
        update.commit.clone(),
    )
}

pub fn policy(source: &Source) -> RepositoryPolicy {
    let mut policy = RepositoryPolicy::new(source);
    policy.merge = true;
    policy
}

pub fn config(concurrency: usize, repositories: Vec<RepositoryPolicy>) -> SystemConfig {
    let mut config = SystemConfig {
        repositories,
        ..Default::default()
    };
    config.coordinator.concurrency = concurrency;
    config
}

pub fn pattern(p: &str) -> BranchPattern {
    BranchPattern::new(p).unwrap()
}

#[derive(Default)]
pub struct MockExecutor {
    pub started: Mutex<Vec<JobKey>>,
    pub aborted: Mutex<Vec<JobKey>>,
    pub refuse: Mutex<bool>,
}

#[async_trait]
impl JobExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start_job(&self, key: &JobKey) -> Result<()> {
        if *self.refuse.lock().unwrap() {
            return Err(Error::ExecutionFailed("no capacity".to_string()));
        }
        self.started.lock().unwrap().push(key.clone());
        Ok(())
    }

    async fn abort_job(&self, key: &JobKey) -> Result<()> {
        self.aborted.lock().unwrap().push(key.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockRepositories {
    /// Scripted rebase results per update id; `UpToDate` once exhausted.
    pub rebases: Mutex<HashMap<String, VecDeque<Result<RebaseOutcome>>>>,
    pub merge_fails: Mutex<bool>,
    pub merges: Mutex<Vec<String>>,
    pub valid_builds: Mutex<Vec<CommitId>>,
    pub tags: Mutex<Vec<(CommitId, String)>>,
    pub branches: Mutex<Vec<(CommitId, String)>>,
    pub invalidations: Mutex<Vec<Source>>,
}

impl MockRepositories {
    pub fn script_rebase(&self, update_id: &str, outcome: Result<RebaseOutcome>) {
        self.rebases
            .lock()
            .unwrap()
            .entry(update_id.to_string())
            .or_default()
            .push_back(outcome);
    }
}

#[async_trait]
impl RepositoryAccess for MockRepositories {
    async fn rebase(&self, _source: &Source, update_id: &str) -> Result<RebaseOutcome> {
        self.rebases
            .lock()
            .unwrap()
            .get_mut(update_id)
            .and_then(|q| q.pop_front())
            .unwrap_or(Ok(RebaseOutcome::UpToDate))
    }

    async fn merge(&self, _source: &Source, update_id: &str) -> Result<String> {
        if *self.merge_fails.lock().unwrap() {
            return Err(Error::Repository("merge rejected".to_string()));
        }
        self.merges.lock().unwrap().push(update_id.to_string());
        Ok("main".to_string())
    }

    async fn set_valid_build(
        &self,
        _source: &Source,
        commit: &CommitId,
        _log_url: &str,
    ) -> Result<()> {
        self.valid_builds.lock().unwrap().push(commit.clone());
        Ok(())
    }

    async fn branch_head(&self, _source: &Source, _branch: &str) -> Result<CommitId> {
        Ok(commit(0xbeef))
    }

    async fn create_tag(&self, _source: &Source, commit: &CommitId, tag: &str) -> Result<()> {
        self.tags
            .lock()
            .unwrap()
            .push((commit.clone(), tag.to_string()));
        Ok(())
    }

    async fn create_branch(&self, _source: &Source, commit: &CommitId, branch: &str) -> Result<()> {
        self.branches
            .lock()
            .unwrap()
            .push((commit.clone(), branch.to_string()));
        Ok(())
    }

    async fn invalidate(&self, source: &Source) {
        self.invalidations.lock().unwrap().push(source.clone());
    }
}

pub struct MockVersions {
    pub current: Version,
    pub without_definition: Mutex<HashSet<CommitId>>,
    pub invalidations: Mutex<usize>,
}

impl Default for MockVersions {
    fn default() -> Self {
        Self {
            current: Version::new(1, 3, 2),
            without_definition: Mutex::new(HashSet::new()),
            invalidations: Mutex::new(0),
        }
    }
}

#[async_trait]
impl VersionModel for MockVersions {
    async fn next_version(
        &self,
        _source: &Source,
        _branch: &str,
        bump: BumpType,
    ) -> Result<Version> {
        Ok(self.current.bump(bump))
    }

    async fn has_build_definition(&self, _source: &Source, commit: &CommitId) -> Result<bool> {
        Ok(!self.without_definition.lock().unwrap().contains(commit))
    }

    async fn invalidate(&self, _source: &Source) {
        *self.invalidations.lock().unwrap() += 1;
    }
}

#[derive(Default)]
pub struct MockDependencies {
    pub problems: Mutex<Vec<DependencyProblem>>,
    pub rescans: Mutex<Vec<(Source, String)>>,
}

#[async_trait]
impl DependencyGraphService for MockDependencies {
    async fn dependency_graph(
        &self,
        source: &Source,
        _commit: &CommitId,
    ) -> Result<DependencyGraph> {
        Ok(DependencyGraph {
            nodes: vec![DependencyNode {
                reference: source.path.clone(),
                version: "HEAD".to_string(),
                dependencies: vec![],
            }],
            problems: self.problems.lock().unwrap().clone(),
        })
    }

    async fn rescan_dependents(&self, source: &Source, tag: &str) -> Result<()> {
        self.rescans
            .lock()
            .unwrap()
            .push((source.clone(), tag.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPublisher {
    pub published: Mutex<Vec<JobKey>>,
}

#[async_trait]
impl ArtifactPublisher for MockPublisher {
    async fn publish(&self, key: &JobKey) -> Result<Vec<PublishedArtifact>> {
        self.published.lock().unwrap().push(key.clone());
        Ok(vec![PublishedArtifact {
            name: format!("{}:{}", key.source.path, key.commit.short()),
            location: "registry.example.com".to_string(),
        }])
    }
}

#[derive(Default)]
pub struct RecordingBuildLog {
    pub entries: Mutex<Vec<(LogLevel, String, String)>>,
}

impl RecordingBuildLog {
    pub fn contains(&self, level: LogLevel, message: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m, _)| *l == level && m == message)
    }

    pub fn at_level(&self, level: LogLevel) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _, _)| *l == level)
            .map(|(_, m, _)| m.clone())
            .collect()
    }
}

#[async_trait]
impl BuildLog for RecordingBuildLog {
    async fn add(&self, message: &str, level: LogLevel, _source: &Source, canonical_id: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_string(), canonical_id.to_string()));
    }

    fn log_url(&self, source: &Source, canonical_id: &str) -> String {
        format!("https://ci.example.com/{}/{canonical_id}", source.path)
    }
}

/// Memory store whose replies arrive late, widening the windows in which
/// concurrent callers interleave.
pub struct SlowStore {
    pub inner: Arc<MemoryStore>,
    /// Delay between a push taking effect and its reply reaching the caller.
    pub push_reply: Duration,
    /// Delay between a status read and its reply reaching the caller.
    pub status_read: Duration,
}

impl SlowStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            push_reply: Duration::ZERO,
            status_read: Duration::ZERO,
        }
    }
}

#[async_trait]
impl QueueStore for SlowStore {
    async fn push(
        &self,
        local: &str,
        pools: &PoolKeys,
        job: &str,
        label: &str,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<PushReply> {
        let reply = self.inner.push(local, pools, job, label, ttl, now).await?;
        tokio::time::sleep(self.push_reply).await;
        Ok(reply)
    }

    async fn start(
        &self,
        pools: &PoolKeys,
        max_count: usize,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<StartReply> {
        self.inner.start(pools, max_count, ttl, now).await
    }

    async fn complete(
        &self,
        local: &str,
        pools: &PoolKeys,
        job: &str,
        now: i64,
    ) -> SchedulerResult<bool> {
        self.inner.complete(local, pools, job, now).await
    }

    async fn swap_status(
        &self,
        pools: &PoolKeys,
        swap: StatusSwap<'_>,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<SwapReply> {
        self.inner.swap_status(pools, swap, ttl, now).await
    }

    async fn get_status(&self, key: &str) -> SchedulerResult<Option<String>> {
        let status = self.inner.get_status(key).await?;
        tokio::time::sleep(self.status_read).await;
        Ok(status)
    }

    async fn pool(&self, pools: &PoolKeys, which: Pool) -> SchedulerResult<Vec<PoolEntry>> {
        self.inner.pool(pools, which).await
    }
}

/// Orchestrator wired to recording collaborators and an in-memory store.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub worker: Worker,
    pub outcomes: OutcomeSender,
    pub store: Arc<MemoryStore>,
    pub executor: Arc<MockExecutor>,
    pub repositories: Arc<MockRepositories>,
    pub versions: Arc<MockVersions>,
    pub dependencies: Arc<MockDependencies>,
    pub publisher: Arc<MockPublisher>,
    pub build_log: Arc<RecordingBuildLog>,
}

impl Harness {
    pub fn new(config: SystemConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::build(config, store.clone(), store)
    }

    /// Harness whose status reads each take `status_read`.
    pub fn with_slow_reads(config: SystemConfig, status_read: Duration) -> Self {
        let memory = Arc::new(MemoryStore::new());
        let slow = SlowStore {
            status_read,
            ..SlowStore::new(memory.clone())
        };
        Self::build(config, memory, Arc::new(slow))
    }

    fn build(config: SystemConfig, memory: Arc<MemoryStore>, store: Arc<dyn QueueStore>) -> Self {
        let (ledger, transitions) = StatusLedger::new(
            store,
            KeyLayout::new(config.coordinator.key_prefix.clone()),
            Duration::from_secs(3600),
        );
        let (outcomes, outcome_rx) = outcome_channel();

        let executor = Arc::new(MockExecutor::default());
        let repositories = Arc::new(MockRepositories::default());
        let versions = Arc::new(MockVersions::default());
        let dependencies = Arc::new(MockDependencies::default());
        let publisher = Arc::new(MockPublisher::default());
        let build_log = Arc::new(RecordingBuildLog::default());

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(ledger),
            Collaborators {
                executor: executor.clone(),
                repositories: repositories.clone(),
                versions: versions.clone(),
                dependencies: dependencies.clone(),
                publisher: publisher.clone(),
                build_log: build_log.clone(),
            },
            Arc::new(config),
        ));
        let worker = Worker::new(orchestrator.clone(), transitions, outcome_rx);

        Self {
            orchestrator,
            worker,
            outcomes,
            store: memory,
            executor,
            repositories,
            versions,
            dependencies,
            publisher,
            build_log,
        }
    }

    /// One repository with merging enabled, concurrency 4.
    pub fn single() -> Self {
        Self::new(config(4, vec![policy(&widgets())]))
    }

    pub async fn settle(&mut self) -> usize {
        self.worker.run_until_idle().await
    }

    pub fn started(&self) -> Vec<JobKey> {
        self.executor.started.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<JobKey> {
        self.executor.aborted.lock().unwrap().clone()
    }
}
