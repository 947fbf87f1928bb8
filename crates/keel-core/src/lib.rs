//! Core domain types and traits for the keel build orchestrator.
//!
//! This crate contains:
//! - Job identity (`JobKey`, `JobRef`) and its store serialization
//! - Queue states and the transition table
//! - Release versions
//! - Collaborator traits: job executor, repository access, version model,
//!   dependency graph, build log, artifact publisher

pub mod artifact;
pub mod build_log;
pub mod dependency;
pub mod error;
pub mod executor;
pub mod id;
pub mod repository;
pub mod state;
pub mod version;

pub use error::{Error, Result};
pub use id::{CommitId, JobKey, JobRef, Source};
pub use state::QueueState;
pub use version::{BumpType, Version};
