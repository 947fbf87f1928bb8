//! Job scheduling for keel.
//!
//! Admits build jobs through an atomic two-level queue (a local queue per
//! competing target plus global ready/active pools), tracks each job in a
//! TTL'd status ledger, and drives the build lifecycle from those
//! transitions. Cross-process coordination lives entirely in the store's
//! atomic operations; see [`store::QueueStore`].

pub mod error;
pub mod keys;
pub mod ledger;
pub mod memory;
pub mod orchestrator;
pub mod redis_store;
pub mod serializer;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{SchedulerError, SchedulerResult};
pub use keys::KeyLayout;
pub use ledger::{PushOutcome, StatusLedger, Transition, TransitionReceiver};
pub use memory::MemoryStore;
pub use orchestrator::{Collaborators, Orchestrator};
pub use redis_store::RedisStore;
pub use serializer::KeyedSerializer;
pub use store::QueueStore;
pub use worker::Worker;
