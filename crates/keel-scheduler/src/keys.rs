//! Coordination-store key layout.
//!
//! ```text
//! <prefix>:status:<job>                               ledger state, TTL'd
//! <prefix>:<source id>:<source path>:local:<queue id> ordered local queue
//! <prefix>:ready, <prefix>:active                     global admission pools (sorted by time)
//! <prefix>:owners                                     job -> local queue key
//! <prefix>:labels                                     job -> canonical id
//! ```

use keel_core::JobKey;

/// Keys shared by every local queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolKeys {
    pub ready: String,
    pub active: String,
    pub owners: String,
    pub labels: String,
    /// Prepended to a serialized job to form its status key.
    pub status_prefix: String,
}

impl PoolKeys {
    pub fn status(&self, job: &str) -> String {
        format!("{}{job}", self.status_prefix)
    }
}

#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
    pools: PoolKeys,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let pools = PoolKeys {
            ready: format!("{prefix}:ready"),
            active: format!("{prefix}:active"),
            owners: format!("{prefix}:owners"),
            labels: format!("{prefix}:labels"),
            status_prefix: format!("{prefix}:status:"),
        };
        Self { prefix, pools }
    }

    pub fn status(&self, key: &JobKey) -> String {
        self.pools.status(&key.serialize())
    }

    /// Local queue shared by every job of one repository with the same queue id.
    pub fn local(&self, key: &JobKey) -> String {
        format!(
            "{}:{}:{}:local:{}",
            self.prefix,
            urlencoding::encode(&key.source.id),
            urlencoding::encode(&key.source.path),
            key.queue_id()
        )
    }

    pub fn pools(&self) -> &PoolKeys {
        &self.pools
    }
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(keel_config::system::DEFAULT_KEY_PREFIX)
    }
}
