//! Coordination store abstraction.
//!
//! Every operation here must execute atomically on the store: concurrent
//! callers (other processes included) never observe a half-applied push,
//! start, complete or status swap. Job statuses are written by the same
//! atomic step that moves the job between queues.

use async_trait::async_trait;
use std::time::Duration;

use crate::SchedulerResult;
use crate::keys::PoolKeys;

/// Raw result of an atomic push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReply {
    /// Length of the local queue after the push.
    pub size: usize,
    /// Pending entry evicted by this push.
    pub cancelled: Option<String>,
    /// Active entry superseded by this push; it stays active until completed.
    pub aborted: Option<String>,
    /// The job was already in its local queue; nothing changed.
    pub duplicate: bool,
    /// Status the job had before the push set it to QUEUED.
    pub previous: Option<String>,
}

/// Raw result of an atomic start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReply {
    /// Jobs moved to active and marked STARTING, oldest first.
    pub admitted: Vec<String>,
    /// Ready jobs whose status was no longer QUEUED; they were retired.
    pub stale: Vec<String>,
}

/// A compare-and-set of one job's status.
#[derive(Debug, Clone, Copy)]
pub struct StatusSwap<'a> {
    pub job: &'a str,
    /// Local queue the job belongs to.
    pub local: &'a str,
    pub from: &'a str,
    pub to: &'a str,
    /// Retire the job from its queues once the status is swapped.
    pub retire: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapReply {
    /// `was_active` reports whether a retired job still held an active slot.
    Applied { was_active: bool },
    /// The stored status was not the expected one; nothing changed.
    Rejected { current: Option<String> },
}

/// An entry of the ready or active pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolEntry {
    pub job: String,
    pub label: Option<String>,
    /// Milliseconds since the epoch when the entry joined the pool.
    pub since: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Ready,
    Active,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append `job` to its local queue and mark it QUEUED, evicting a
    /// pending occupant and reporting an active one.
    async fn push(
        &self,
        local: &str,
        pools: &PoolKeys,
        job: &str,
        label: &str,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<PushReply>;

    /// Promote QUEUED ready entries, oldest first, until `max_count` jobs are
    /// active, marking each STARTING. Never admits two entries of one local
    /// queue.
    async fn start(
        &self,
        pools: &PoolKeys,
        max_count: usize,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<StartReply>;

    /// Retire `job` and promote the next entry of its local queue. Returns
    /// whether the job was active.
    async fn complete(
        &self,
        local: &str,
        pools: &PoolKeys,
        job: &str,
        now: i64,
    ) -> SchedulerResult<bool>;

    /// Replace a job's status only if it still holds `swap.from`.
    async fn swap_status(
        &self,
        pools: &PoolKeys,
        swap: StatusSwap<'_>,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<SwapReply>;

    async fn get_status(&self, key: &str) -> SchedulerResult<Option<String>>;

    /// Snapshot of one global pool, oldest first.
    async fn pool(&self, pools: &PoolKeys, which: Pool) -> SchedulerResult<Vec<PoolEntry>>;
}
