//! Status ledger.
//!
//! Wraps the atomic queue operations with a per-job status and the
//! transition table. Every accepted transition is posted to a channel rather
//! than handed to a listener inline, so a push that cancels a job cannot
//! recurse into another push before it returns.

use chrono::Utc;
use keel_core::{JobKey, QueueState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::keys::KeyLayout;
use crate::store::{Pool, PoolEntry, QueueStore, StatusSwap, SwapReply};
use crate::{SchedulerError, SchedulerResult};

/// A state change accepted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub key: JobKey,
    pub state: QueueState,
    pub previous: Option<QueueState>,
    /// Made by the ledger because a newer push replaced the job.
    pub superseded: bool,
}

pub type TransitionReceiver = mpsc::UnboundedReceiver<Transition>;

/// What a push did to the job's local queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// Local queue length after the push.
    pub size: usize,
    pub cancelled: Option<JobKey>,
    pub aborted: Option<JobKey>,
    /// The job was already queued; its status was left alone.
    pub duplicate: bool,
}

pub struct StatusLedger {
    store: Arc<dyn QueueStore>,
    layout: KeyLayout,
    status_ttl: Duration,
    transitions: mpsc::UnboundedSender<Transition>,
}

impl StatusLedger {
    pub fn new(
        store: Arc<dyn QueueStore>,
        layout: KeyLayout,
        status_ttl: Duration,
    ) -> (Self, TransitionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ledger = Self {
            store,
            layout,
            status_ttl,
            transitions: tx,
        };
        (ledger, rx)
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Current state of a job, `None` once it expired or was never pushed.
    pub async fn status(&self, key: &JobKey) -> SchedulerResult<Option<QueueState>> {
        let raw = self.store.get_status(&self.layout.status(key)).await?;
        parse_state(raw)
    }

    /// Move a job to `state`, rejecting moves the transition table forbids.
    ///
    /// The status is swapped only if nobody changed it since it was read, and
    /// a terminal state frees the job's queue slot in the same store step.
    pub async fn add_state(&self, key: &JobKey, state: QueueState) -> SchedulerResult<Transition> {
        self.apply(key, state, false).await
    }

    /// Queue a job, superseding whatever occupied its local queue.
    pub async fn push(&self, key: &JobKey) -> SchedulerResult<PushOutcome> {
        let reply = self
            .store
            .push(
                &self.layout.local(key),
                self.layout.pools(),
                &key.serialize(),
                &key.canonical_id(),
                self.status_ttl,
                now(),
            )
            .await?;

        if reply.duplicate {
            debug!(%key, "Job already queued");
            return Ok(PushOutcome {
                size: reply.size,
                cancelled: None,
                aborted: None,
                duplicate: true,
            });
        }

        let previous = match parse_state(reply.previous) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(%key, error = %e, "Replaced an unreadable status");
                None
            }
        };
        self.notify(key, QueueState::Queued, previous, false);

        let cancelled = reply.cancelled.as_deref().map(JobKey::deserialize).transpose()?;
        let aborted = reply.aborted.as_deref().map(JobKey::deserialize).transpose()?;

        if let Some(old) = &cancelled {
            self.supersede(old, QueueState::Cancelled).await;
        }
        if let Some(old) = &aborted {
            self.supersede(old, QueueState::Aborted).await;
        }

        Ok(PushOutcome {
            size: reply.size,
            cancelled,
            aborted,
            duplicate: false,
        })
    }

    /// Admit ready jobs until `max_count` are active and mark them STARTING.
    pub async fn start(&self, max_count: usize) -> SchedulerResult<Vec<JobKey>> {
        let reply = self
            .store
            .start(self.layout.pools(), max_count, self.status_ttl, now())
            .await?;

        for job in &reply.stale {
            warn!(%job, "Dropped ready job whose status expired");
        }

        let mut started = Vec::with_capacity(reply.admitted.len());
        for raw in reply.admitted {
            match JobKey::deserialize(&raw) {
                Ok(key) => {
                    self.notify(&key, QueueState::Starting, Some(QueueState::Queued), false);
                    started.push(key);
                }
                Err(e) => warn!(job = %raw, error = %e, "Admitted an unparseable job key"),
            }
        }

        if !started.is_empty() {
            info!(count = started.len(), "Admitted jobs");
        }
        Ok(started)
    }

    pub async fn pool(&self, which: Pool) -> SchedulerResult<Vec<PoolEntry>> {
        self.store.pool(self.layout.pools(), which).await
    }

    async fn supersede(&self, key: &JobKey, state: QueueState) {
        match self.apply(key, state, true).await {
            Ok(_) => info!(%key, %state, "Superseded job"),
            Err(e) => warn!(%key, %state, error = %e, "Could not supersede job"),
        }
    }

    async fn apply(
        &self,
        key: &JobKey,
        state: QueueState,
        superseded: bool,
    ) -> SchedulerResult<Transition> {
        let illegal = |from| SchedulerError::IllegalTransition {
            key: key.serialize(),
            from,
            to: state,
        };

        let from = match self.status(key).await? {
            Some(from) if from.can_transition_to(state) => from,
            other => return Err(illegal(other)),
        };

        let job = key.serialize();
        let local = self.layout.local(key);
        let swap = StatusSwap {
            job: &job,
            local: &local,
            from: from.as_str(),
            to: state.as_str(),
            retire: state.is_terminal(),
        };
        let reply = self
            .store
            .swap_status(self.layout.pools(), swap, self.status_ttl, now())
            .await?;

        match reply {
            SwapReply::Rejected { current } => Err(illegal(parse_state(current)?)),
            SwapReply::Applied { was_active } => {
                if state.is_terminal() && !was_active {
                    debug!(%key, %state, "Completed job was not active; already superseded");
                }
                Ok(self.notify(key, state, Some(from), superseded))
            }
        }
    }

    fn notify(
        &self,
        key: &JobKey,
        state: QueueState,
        previous: Option<QueueState>,
        superseded: bool,
    ) -> Transition {
        let transition = Transition {
            key: key.clone(),
            state,
            previous,
            superseded,
        };
        if self.transitions.send(transition.clone()).is_err() {
            debug!(%key, %state, "No transition listener");
        }
        transition
    }
}

fn parse_state(raw: Option<String>) -> SchedulerResult<Option<QueueState>> {
    match raw {
        Some(raw) => Ok(Some(raw.parse()?)),
        None => Ok(None),
    }
}

fn now() -> i64 {
    Utc::now().timestamp_millis()
}
