//! Redis-backed coordination store.
//!
//! Each queue operation is a single Lua script, so Redis executes it
//! atomically with respect to every other client. The start script reads
//! and writes status keys it derives from `PoolKeys::status_prefix`, so all
//! keys of one layout must live on the same node.

use async_trait::async_trait;
use keel_core::QueueState;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::keys::PoolKeys;
use crate::store::{Pool, PoolEntry, PushReply, QueueStore, StartReply, StatusSwap, SwapReply};
use crate::{SchedulerError, SchedulerResult};

/// Redis scripts for the atomic queue operations
mod scripts {
    use redis::Script;

    /// Drop a job from every queue structure and promote the head of its
    /// local queue. Returns 1 if the job was active.
    const RETIRE: &str = r#"
        local function retire(localq, ready, active, owners, labels, job, now)
            local found = redis.call('ZREM', active, job)
            redis.call('ZREM', ready, job)
            redis.call('LREM', localq, 0, job)
            redis.call('HDEL', owners, job)
            redis.call('HDEL', labels, job)

            local head = redis.call('LINDEX', localq, 0)
            if head and not redis.call('ZSCORE', active, head) and not redis.call('ZSCORE', ready, head) then
                redis.call('ZADD', ready, now, head)
            end
            return found
        end
    "#;

    fn with_retire(body: &str) -> Script {
        Script::new(&format!("{RETIRE}{body}"))
    }

    /// KEYS: local, ready, active, owners, labels, status
    /// ARGV: job, label, now, ttl, queued
    /// Returns {size, cancelled or "", aborted or "", duplicate "1"/"0", previous or ""}
    pub fn push() -> Script {
        Script::new(
            r#"
            local localq, ready, active, owners, labels, status = KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], KEYS[6]
            local job, label, now, ttl, queued = ARGV[1], ARGV[2], tonumber(ARGV[3]), tonumber(ARGV[4]), ARGV[5]

            local entries = redis.call('LRANGE', localq, 0, -1)
            for _, entry in ipairs(entries) do
                if entry == job then
                    return {tostring(#entries), '', '', '1', ''}
                end
            end

            local cancelled, aborted = '', ''
            for _, entry in ipairs(entries) do
                if redis.call('ZSCORE', active, entry) then
                    -- Stays until its completion is recorded
                    aborted = entry
                else
                    cancelled = entry
                    redis.call('LREM', localq, 0, entry)
                    redis.call('ZREM', ready, entry)
                    redis.call('HDEL', owners, entry)
                    redis.call('HDEL', labels, entry)
                end
            end

            redis.call('RPUSH', localq, job)
            redis.call('HSET', owners, job, localq)
            redis.call('HSET', labels, job, label)
            if aborted == '' then
                redis.call('ZADD', ready, now, job)
            end

            local previous = redis.call('GET', status) or ''
            redis.call('SET', status, queued, 'EX', ttl)

            return {tostring(redis.call('LLEN', localq)), cancelled, aborted, '0', previous}
            "#,
        )
    }

    /// KEYS: ready, active, owners, labels
    /// ARGV: max_count, now, ttl, status prefix, queued, starting
    /// Returns {admitted, stale}, oldest first
    pub fn start() -> Script {
        with_retire(
            r#"
            local ready, active, owners, labels = KEYS[1], KEYS[2], KEYS[3], KEYS[4]
            local max_count, now, ttl = tonumber(ARGV[1]), tonumber(ARGV[2]), tonumber(ARGV[3])
            local status_prefix, queued, starting = ARGV[4], ARGV[5], ARGV[6]

            local admitted, stale = {}, {}
            local capacity = max_count - redis.call('ZCARD', active)
            if capacity <= 0 then
                return {admitted, stale}
            end

            local busy = {}
            for _, job in ipairs(redis.call('ZRANGE', active, 0, -1)) do
                local owner = redis.call('HGET', owners, job)
                if owner then
                    busy[owner] = true
                end
            end

            for _, job in ipairs(redis.call('ZRANGE', ready, 0, -1)) do
                if #admitted >= capacity then
                    break
                end
                local owner = redis.call('HGET', owners, job)
                local status = status_prefix .. job
                if redis.call('GET', status) ~= queued then
                    if owner then
                        retire(owner, ready, active, owners, labels, job, now)
                    else
                        redis.call('ZREM', ready, job)
                    end
                    table.insert(stale, job)
                elseif not busy[owner or job] then
                    busy[owner or job] = true
                    redis.call('ZREM', ready, job)
                    redis.call('ZADD', active, now, job)
                    redis.call('SET', status, starting, 'EX', ttl)
                    table.insert(admitted, job)
                end
            end

            return {admitted, stale}
            "#,
        )
    }

    /// KEYS: local, ready, active, owners, labels
    /// ARGV: job, now
    /// Returns 1 if the job was active, 0 otherwise
    pub fn complete() -> Script {
        with_retire(
            r#"
            return retire(KEYS[1], KEYS[2], KEYS[3], KEYS[4], KEYS[5], ARGV[1], tonumber(ARGV[2]))
            "#,
        )
    }

    /// KEYS: status, local, ready, active, owners, labels
    /// ARGV: job, from, to, ttl, retire "1"/"0", now
    /// Returns {"1", was active "1"/"0"} or {"0", current or ""}
    pub fn swap_status() -> Script {
        with_retire(
            r#"
            local status = KEYS[1]
            local job, from, to, ttl = ARGV[1], ARGV[2], ARGV[3], tonumber(ARGV[4])

            local current = redis.call('GET', status)
            if current ~= from then
                return {'0', current or ''}
            end

            redis.call('SET', status, to, 'EX', ttl)
            local found = 0
            if ARGV[5] == '1' then
                found = retire(KEYS[2], KEYS[3], KEYS[4], KEYS[5], KEYS[6], job, tonumber(ARGV[6]))
            end
            return {'1', tostring(found)}
            "#,
        )
    }
}

struct Scripts {
    push: redis::Script,
    start: redis::Script,
    complete: redis::Script,
    swap_status: redis::Script,
}

/// Queue store backed by a shared Redis instance.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> SchedulerResult<Self> {
        info!("Connecting to coordination store at {}", redis_url);

        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Connected to coordination store");

        Ok(Self {
            conn,
            scripts: Arc::new(Scripts {
                push: scripts::push(),
                start: scripts::start(),
                complete: scripts::complete(),
                swap_status: scripts::swap_status(),
            }),
        })
    }
}

/// Redis rejects `SET ... EX 0`.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push(
        &self,
        local: &str,
        pools: &PoolKeys,
        job: &str,
        label: &str,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<PushReply> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .scripts
            .push
            .key(local)
            .key(&pools.ready)
            .key(&pools.active)
            .key(&pools.owners)
            .key(&pools.labels)
            .key(pools.status(job))
            .arg(job)
            .arg(label)
            .arg(now)
            .arg(ttl_secs(ttl))
            .arg(QueueState::Queued.as_str())
            .invoke_async(&mut conn)
            .await?;

        let [size, cancelled, aborted, duplicate, previous] = reply.as_slice() else {
            return Err(SchedulerError::MalformedReply(format!(
                "push returned {} fields",
                reply.len()
            )));
        };
        let size: usize = size
            .parse()
            .map_err(|_| SchedulerError::MalformedReply(format!("push size {size:?}")))?;

        debug!(job, local, size, "Pushed job");

        Ok(PushReply {
            size,
            cancelled: non_empty(cancelled),
            aborted: non_empty(aborted),
            duplicate: duplicate == "1",
            previous: non_empty(previous),
        })
    }

    async fn start(
        &self,
        pools: &PoolKeys,
        max_count: usize,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<StartReply> {
        let mut conn = self.conn.clone();
        let (admitted, stale): (Vec<String>, Vec<String>) = self
            .scripts
            .start
            .key(&pools.ready)
            .key(&pools.active)
            .key(&pools.owners)
            .key(&pools.labels)
            .arg(max_count)
            .arg(now)
            .arg(ttl_secs(ttl))
            .arg(&pools.status_prefix)
            .arg(QueueState::Queued.as_str())
            .arg(QueueState::Starting.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(StartReply { admitted, stale })
    }

    async fn complete(
        &self,
        local: &str,
        pools: &PoolKeys,
        job: &str,
        now: i64,
    ) -> SchedulerResult<bool> {
        let mut conn = self.conn.clone();
        let found: i64 = self
            .scripts
            .complete
            .key(local)
            .key(&pools.ready)
            .key(&pools.active)
            .key(&pools.owners)
            .key(&pools.labels)
            .arg(job)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(found == 1)
    }

    async fn swap_status(
        &self,
        pools: &PoolKeys,
        swap: StatusSwap<'_>,
        ttl: Duration,
        now: i64,
    ) -> SchedulerResult<SwapReply> {
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .scripts
            .swap_status
            .key(pools.status(swap.job))
            .key(swap.local)
            .key(&pools.ready)
            .key(&pools.active)
            .key(&pools.owners)
            .key(&pools.labels)
            .arg(swap.job)
            .arg(swap.from)
            .arg(swap.to)
            .arg(ttl_secs(ttl))
            .arg(if swap.retire { "1" } else { "0" })
            .arg(now)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [applied, found] if applied == "1" => Ok(SwapReply::Applied {
                was_active: found == "1",
            }),
            [_, current] => Ok(SwapReply::Rejected {
                current: non_empty(current),
            }),
            _ => Err(SchedulerError::MalformedReply(format!(
                "swap returned {} fields",
                reply.len()
            ))),
        }
    }

    async fn get_status(&self, key: &str) -> SchedulerResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn pool(&self, pools: &PoolKeys, which: Pool) -> SchedulerResult<Vec<PoolEntry>> {
        let mut conn = self.conn.clone();
        let key = match which {
            Pool::Ready => &pools.ready,
            Pool::Active => &pools.active,
        };

        let members: Vec<(String, f64)> = conn.zrange_withscores(key, 0, -1).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let jobs: Vec<&str> = members.iter().map(|(job, _)| job.as_str()).collect();
        let labels: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&pools.labels)
            .arg(&jobs)
            .query_async(&mut conn)
            .await?;

        Ok(members
            .into_iter()
            .zip(labels)
            .map(|((job, score), label)| PoolEntry {
                job,
                label,
                since: score as i64,
            })
            .collect())
    }
}
