//! In-process coordination store.
//!
//! Mirrors the Redis scripts operation for operation. Every call takes the
//! store lock once, which gives the same atomicity a script has on Redis.
//! Suitable for tests and single-process deployments.

use async_trait::async_trait;
use keel_core::QueueState;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::SchedulerResult;
use crate::keys::PoolKeys;
use crate::store::{Pool, PoolEntry, PushReply, QueueStore, StartReply, StatusSwap, SwapReply};

#[derive(Debug, Default)]
struct State {
    locals: HashMap<String, VecDeque<String>>,
    /// Sorted sets, keyed by pool key then member.
    pools: HashMap<String, HashMap<String, i64>>,
    /// Hashes, keyed by hash key then field.
    hashes: HashMap<String, HashMap<String, String>>,
    statuses: HashMap<String, (String, Instant)>,
}

impl State {
    fn zset(&mut self, key: &str) -> &mut HashMap<String, i64> {
        self.pools.entry(key.to_string()).or_default()
    }

    fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        self.pools.get(key).and_then(|set| set.get(member)).copied()
    }

    /// Members ordered by score, then by member like Redis ZRANGE.
    fn zrange(&self, key: &str) -> Vec<(String, i64)> {
        let mut members: Vec<(String, i64)> = self
            .pools
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn hget(&self, key: &str, field: &str) -> Option<&String> {
        self.hashes.get(key).and_then(|h| h.get(field))
    }

    fn hdel(&mut self, key: &str, field: &str) {
        if let Some(h) = self.hashes.get_mut(key) {
            h.remove(field);
        }
    }

    /// Live status value; an expired one is dropped like a Redis TTL.
    fn status(&mut self, key: &str) -> Option<String> {
        let expired = matches!(
            self.statuses.get(key),
            Some((_, expires)) if *expires <= Instant::now()
        );
        if expired {
            self.statuses.remove(key);
            return None;
        }
        self.statuses.get(key).map(|(value, _)| value.clone())
    }

    fn set_status(&mut self, key: &str, value: &str, ttl: Duration) {
        self.statuses
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    /// Drop `job` from every queue structure and promote the head of its
    /// local queue. Returns whether the job was active.
    fn retire(&mut self, local: &str, pools: &PoolKeys, job: &str, now: i64) -> bool {
        let found = self.zset(&pools.active).remove(job).is_some();
        self.zset(&pools.ready).remove(job);
        self.hdel(&pools.owners, job);
        self.hdel(&pools.labels, job);

        let head = self.locals.get_mut(local).and_then(|queue| {
            queue.retain(|e| e != job);
            queue.front().cloned()
        });
        if let Some(head) = head {
            let idle = self.zscore(&pools.active, &head).is_none()
                && self.zscore(&pools.ready, &head).is_none();
            if idle {
                self.zset(&pools.ready).insert(head, now);
            }
        }
        found
    }
}

/// Queue store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries of one local queue, head first.
    pub async fn local_queue(&self, local: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .locals
            .get(local)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push(
        &self,
        local: &str,
        pools: &PoolKeys,
        job: &str,
        label: &str,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<PushReply> {
        let mut state = self.state.lock().await;
        let entries: Vec<String> = state
            .locals
            .get(local)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();

        if entries.iter().any(|e| e == job) {
            return Ok(PushReply {
                size: entries.len(),
                duplicate: true,
                ..Default::default()
            });
        }

        let mut reply = PushReply::default();
        for entry in entries {
            if state.zscore(&pools.active, &entry).is_some() {
                reply.aborted = Some(entry);
            } else {
                if let Some(queue) = state.locals.get_mut(local) {
                    queue.retain(|e| *e != entry);
                }
                state.zset(&pools.ready).remove(&entry);
                state.hdel(&pools.owners, &entry);
                state.hdel(&pools.labels, &entry);
                reply.cancelled = Some(entry);
            }
        }

        let queue = state.locals.entry(local.to_string()).or_default();
        queue.push_back(job.to_string());
        reply.size = queue.len();

        state.hset(&pools.owners, job, local);
        state.hset(&pools.labels, job, label);
        if reply.aborted.is_none() {
            state.zset(&pools.ready).insert(job.to_string(), now);
        }

        let status = pools.status(job);
        reply.previous = state.status(&status);
        state.set_status(&status, QueueState::Queued.as_str(), ttl);

        Ok(reply)
    }

    async fn start(
        &self,
        pools: &PoolKeys,
        max_count: usize,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<StartReply> {
        let mut state = self.state.lock().await;
        let active = state.zrange(&pools.active);
        let capacity = max_count.saturating_sub(active.len());
        let mut reply = StartReply::default();
        if capacity == 0 {
            return Ok(reply);
        }

        let mut busy: HashSet<String> = active
            .iter()
            .filter_map(|(job, _)| state.hget(&pools.owners, job).cloned())
            .collect();

        for (job, _) in state.zrange(&pools.ready) {
            if reply.admitted.len() >= capacity {
                break;
            }
            let owner = state.hget(&pools.owners, &job).cloned();
            let status = pools.status(&job);

            if state.status(&status).as_deref() != Some(QueueState::Queued.as_str()) {
                match &owner {
                    Some(owner) => {
                        state.retire(owner, pools, &job, now);
                    }
                    None => {
                        state.zset(&pools.ready).remove(&job);
                    }
                }
                reply.stale.push(job);
                continue;
            }

            if busy.insert(owner.unwrap_or_else(|| job.clone())) {
                state.zset(&pools.ready).remove(&job);
                state.zset(&pools.active).insert(job.clone(), now);
                state.set_status(&status, QueueState::Starting.as_str(), ttl);
                reply.admitted.push(job);
            }
        }

        Ok(reply)
    }

    async fn complete(
        &self,
        local: &str,
        pools: &PoolKeys,
        job: &str,
        now: i64,
    ) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state.retire(local, pools, job, now))
    }

    async fn swap_status(
        &self,
        pools: &PoolKeys,
        swap: StatusSwap<'_>,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<SwapReply> {
        let mut state = self.state.lock().await;
        let status = pools.status(swap.job);
        let current = state.status(&status);
        if current.as_deref() != Some(swap.from) {
            return Ok(SwapReply::Rejected { current });
        }

        state.set_status(&status, swap.to, ttl);
        let was_active = swap.retire && state.retire(swap.local, pools, swap.job, now);
        Ok(SwapReply::Applied { was_active })
    }

    async fn get_status(&self, key: &str) -> SchedulerResult<Option<String>> {
        let mut state = self.state.lock().await;
        Ok(state.status(key))
    }

    async fn pool(&self, pools: &PoolKeys, which: Pool) -> SchedulerResult<Vec<PoolEntry>> {
        let state = self.state.lock().await;
        let key = match which {
            Pool::Ready => &pools.ready,
            Pool::Active => &pools.active,
        };
        Ok(state
            .zrange(key)
            .into_iter()
            .map(|(job, since)| PoolEntry {
                label: state.hget(&pools.labels, &job).cloned(),
                job,
                since,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyLayout;

    const TTL: Duration = Duration::from_secs(3600);

    fn pools() -> PoolKeys {
        KeyLayout::default().pools().clone()
    }

    async fn push(store: &MemoryStore, local: &str, job: &str, now: i64) -> PushReply {
        store.push(local, &pools(), job, "l", TTL, now).await.unwrap()
    }

    async fn start(store: &MemoryStore, max_count: usize, now: i64) -> Vec<String> {
        store.start(&pools(), max_count, TTL, now).await.unwrap().admitted
    }

    async fn status(store: &MemoryStore, job: &str) -> Option<String> {
        store.get_status(&pools().status(job)).await.unwrap()
    }

    fn swap<'a>(job: &'a str, from: &'a str, to: &'a str, retire: bool) -> StatusSwap<'a> {
        StatusSwap {
            job,
            local: "q:a",
            from,
            to,
            retire,
        }
    }

    #[tokio::test]
    async fn test_push_to_empty_queue_is_ready() {
        let store = MemoryStore::new();
        let reply = store
            .push("q:a", &pools(), "j1", "l1", TTL, 1)
            .await
            .unwrap();
        assert_eq!(reply.size, 1);
        assert_eq!(reply.cancelled, None);
        assert_eq!(reply.aborted, None);
        assert_eq!(reply.previous, None);
        assert_eq!(status(&store, "j1").await.as_deref(), Some("QUEUED"));

        let ready = store.pool(&pools(), Pool::Ready).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].job, "j1");
        assert_eq!(ready[0].label.as_deref(), Some("l1"));
    }

    #[tokio::test]
    async fn test_push_evicts_pending_entry() {
        let store = MemoryStore::new();
        push(&store, "q:a", "j1", 1).await;
        let reply = push(&store, "q:a", "j2", 2).await;

        assert_eq!(reply.size, 1);
        assert_eq!(reply.cancelled.as_deref(), Some("j1"));
        assert_eq!(reply.aborted, None);
        assert_eq!(store.local_queue("q:a").await, vec!["j2"]);

        let ready: Vec<_> = store
            .pool(&pools(), Pool::Ready)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.job)
            .collect();
        assert_eq!(ready, vec!["j2"]);
    }

    #[tokio::test]
    async fn test_push_reports_active_entry_and_waits() {
        let store = MemoryStore::new();
        push(&store, "q:a", "j1", 1).await;
        assert_eq!(start(&store, 4, 2).await, vec!["j1"]);
        assert_eq!(status(&store, "j1").await.as_deref(), Some("STARTING"));

        let reply = push(&store, "q:a", "j2", 3).await;
        assert_eq!(reply.size, 2);
        assert_eq!(reply.aborted.as_deref(), Some("j1"));
        assert_eq!(reply.cancelled, None);

        // Not admissible while j1 holds the slot.
        assert!(store.pool(&pools(), Pool::Ready).await.unwrap().is_empty());
        assert!(start(&store, 4, 4).await.is_empty());

        assert!(store.complete("q:a", &pools(), "j1", 5).await.unwrap());
        assert_eq!(store.local_queue("q:a").await, vec!["j2"]);
        assert_eq!(start(&store, 4, 6).await, vec!["j2"]);
    }

    #[tokio::test]
    async fn test_duplicate_push_is_noop() {
        let store = MemoryStore::new();
        push(&store, "q:a", "j1", 1).await;
        start(&store, 4, 2).await;

        let reply = push(&store, "q:a", "j1", 3).await;
        assert!(reply.duplicate);
        assert_eq!(reply.cancelled, None);
        assert_eq!(store.local_queue("q:a").await, vec!["j1"]);
        assert_eq!(status(&store, "j1").await.as_deref(), Some("STARTING"));
    }

    #[tokio::test]
    async fn test_repush_reports_previous_status() {
        let store = MemoryStore::new();
        push(&store, "q:a", "j1", 1).await;
        store
            .swap_status(&pools(), swap("j1", "QUEUED", "CANCELLED", true), TTL, 2)
            .await
            .unwrap();

        let reply = push(&store, "q:a", "j1", 3).await;
        assert!(!reply.duplicate);
        assert_eq!(reply.previous.as_deref(), Some("CANCELLED"));
        assert_eq!(status(&store, "j1").await.as_deref(), Some("QUEUED"));
    }

    #[tokio::test]
    async fn test_start_respects_capacity_and_age() {
        let store = MemoryStore::new();
        push(&store, "q:c", "c", 30).await;
        push(&store, "q:a", "a", 10).await;
        push(&store, "q:b", "b", 20).await;

        assert_eq!(start(&store, 2, 40).await, vec!["a", "b"]);
        // Already at the bound.
        assert!(start(&store, 2, 41).await.is_empty());

        assert!(store.complete("q:a", &pools(), "a", 42).await.unwrap());
        assert_eq!(start(&store, 2, 43).await, vec!["c"]);
    }

    #[tokio::test]
    async fn test_complete_of_unknown_job_reports_not_found() {
        let store = MemoryStore::new();
        assert!(!store.complete("q:a", &pools(), "ghost", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_swap_rejects_unexpected_status() {
        let store = MemoryStore::new();
        push(&store, "q:a", "j1", 1).await;
        start(&store, 4, 2).await;

        let reply = store
            .swap_status(&pools(), swap("j1", "STARTED", "SUCCESS", true), TTL, 3)
            .await
            .unwrap();
        assert_eq!(
            reply,
            SwapReply::Rejected {
                current: Some("STARTING".to_string())
            }
        );
        assert_eq!(status(&store, "j1").await.as_deref(), Some("STARTING"));
        assert_eq!(store.pool(&pools(), Pool::Active).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_swap_frees_slot_and_promotes_next() {
        let store = MemoryStore::new();
        push(&store, "q:a", "j1", 1).await;
        start(&store, 4, 2).await;
        push(&store, "q:a", "j2", 3).await;

        let reply = store
            .swap_status(&pools(), swap("j1", "STARTING", "ABORTED", true), TTL, 4)
            .await
            .unwrap();
        assert_eq!(reply, SwapReply::Applied { was_active: true });
        assert_eq!(status(&store, "j1").await.as_deref(), Some("ABORTED"));
        assert_eq!(store.local_queue("q:a").await, vec!["j2"]);
        assert_eq!(start(&store, 4, 5).await, vec!["j2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_expires() {
        let store = MemoryStore::new();
        store
            .push("q:a", &pools(), "j1", "l", Duration::from_secs(10), 1)
            .await
            .unwrap();
        assert_eq!(status(&store, "j1").await.as_deref(), Some("QUEUED"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(status(&store, "j1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_retires_ready_job_with_expired_status() {
        let store = MemoryStore::new();
        store
            .push("q:a", &pools(), "j1", "l", Duration::from_secs(10), 1)
            .await
            .unwrap();
        push(&store, "q:b", "j2", 2).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let reply = store.start(&pools(), 1, TTL, 3).await.unwrap();
        assert_eq!(reply.stale, vec!["j1"]);
        // The expired entry does not use up capacity.
        assert_eq!(reply.admitted, vec!["j2"]);
        assert!(store.local_queue("q:a").await.is_empty());
        assert!(store.pool(&pools(), Pool::Ready).await.unwrap().is_empty());
    }
}
