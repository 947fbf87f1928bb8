//! Per-key serialization of async work.
//!
//! Calls sharing a key run strictly one after another, in arrival order;
//! calls with different keys run concurrently. Nothing blocks a runtime
//! thread while waiting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Clone, Default)]
pub struct KeyedSerializer {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl KeyedSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` after every earlier call for `key` has finished.
    pub async fn run<F, T>(&self, key: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let claim = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Claim {
                slots: &self.slots,
                key,
                slot: slots.entry(key.to_string()).or_default().clone(),
            }
        };

        let _turn = claim.slot.lock().await;
        work.await
    }

    /// Number of keys with work in flight or waiting.
    pub fn pending_keys(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One caller's hold on a key's slot. Dropping the last one removes the
/// key, whether the caller finished or was cancelled while waiting.
struct Claim<'a> {
    slots: &'a Mutex<HashMap<String, Slot>>,
    key: &'a str,
    slot: Slot,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let last = Arc::strong_count(&self.slot) == 2
            && slots
                .get(self.key)
                .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot));
        if last {
            slots.remove(self.key);
        }
    }
}
