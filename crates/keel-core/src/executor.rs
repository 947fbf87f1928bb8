//! Job executor boundary.
//!
//! Executors run admitted builds somewhere else (a build farm, a container
//! scheduler) and report back asynchronously. Outcomes are delivered through
//! an [`OutcomeSender`] handed to the executor when it is constructed; the
//! scheduler owns the matching receiver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::{JobKey, Result};

/// Asynchronous report from an executor about one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "key", rename_all = "snake_case")]
pub enum JobOutcome {
    Started(JobKey),
    Failure(JobKey),
    Success(JobKey),
    Aborted(JobKey),
    Error(JobKey),
}

impl JobOutcome {
    pub fn key(&self) -> &JobKey {
        match self {
            JobOutcome::Started(key)
            | JobOutcome::Failure(key)
            | JobOutcome::Success(key)
            | JobOutcome::Aborted(key)
            | JobOutcome::Error(key) => key,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobOutcome::Started(_) => "started",
            JobOutcome::Failure(_) => "failure",
            JobOutcome::Success(_) => "success",
            JobOutcome::Aborted(_) => "aborted",
            JobOutcome::Error(_) => "error",
        };
        write!(f, "{label} {}", self.key())
    }
}

/// Handle an executor uses to report outcomes.
#[derive(Debug, Clone)]
pub struct OutcomeSender {
    tx: mpsc::UnboundedSender<JobOutcome>,
}

pub type OutcomeReceiver = mpsc::UnboundedReceiver<JobOutcome>;

/// Create a connected outcome sender/receiver pair.
pub fn outcome_channel() -> (OutcomeSender, OutcomeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutcomeSender { tx }, rx)
}

impl OutcomeSender {
    fn send(&self, outcome: JobOutcome) {
        // The receiver is gone only during shutdown; nothing is left to notify.
        let _ = self.tx.send(outcome);
    }

    pub fn job_started(&self, key: JobKey) {
        self.send(JobOutcome::Started(key));
    }

    pub fn job_failure(&self, key: JobKey) {
        self.send(JobOutcome::Failure(key));
    }

    pub fn job_success(&self, key: JobKey) {
        self.send(JobOutcome::Success(key));
    }

    pub fn job_aborted(&self, key: JobKey) {
        self.send(JobOutcome::Aborted(key));
    }

    pub fn job_error(&self, key: JobKey) {
        self.send(JobOutcome::Error(key));
    }
}

/// Trait for job executors.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Start building an admitted job.
    async fn start_job(&self, key: &JobKey) -> Result<()>;

    /// Abort a job that was superseded. Must tolerate jobs that already finished.
    async fn abort_job(&self, key: &JobKey) -> Result<()>;
}
