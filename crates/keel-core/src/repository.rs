//! Repository access and version model boundaries.
//!
//! These are implemented by the code-review adapters and the Git layer; the
//! scheduler only consumes them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{BumpType, CommitId, Result, Source, Version};

/// A Git reference named by a push or delete event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum GitRef {
    Branch(String),
    Tag(String),
}

impl GitRef {
    /// Parse a fully qualified ref (`refs/heads/...`, `refs/tags/...`).
    pub fn from_full_ref(full: &str) -> Option<Self> {
        if let Some(branch) = full.strip_prefix("refs/heads/") {
            Some(GitRef::Branch(branch.to_string()))
        } else {
            full.strip_prefix("refs/tags/")
                .map(|tag| GitRef::Tag(tag.to_string()))
        }
    }

    pub fn name(&self) -> &str {
        match self {
            GitRef::Branch(name) | GitRef::Tag(name) => name,
        }
    }
}

impl fmt::Display for GitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitRef::Branch(name) => write!(f, "refs/heads/{name}"),
            GitRef::Tag(name) => write!(f, "refs/tags/{name}"),
        }
    }
}

/// A code-review change as delivered by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub source: Source,
    pub update_id: String,
    pub target_branch: String,
    pub commit: CommitId,
}

/// Result of rebasing an update onto its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseOutcome {
    /// A new commit was pushed; it will arrive as a fresh update.
    Rebased(CommitId),
    /// Already based on the target's tip.
    UpToDate,
    /// The change does not apply cleanly.
    Conflict,
}

/// Git and review-system operations on one repository.
#[async_trait]
pub trait RepositoryAccess: Send + Sync {
    /// Rebase an update onto the current tip of its target branch.
    async fn rebase(&self, source: &Source, update_id: &str) -> Result<RebaseOutcome>;

    /// Merge an update, returning the branch it landed on.
    async fn merge(&self, source: &Source, update_id: &str) -> Result<String>;

    /// Mark a commit as verified by a successful build.
    async fn set_valid_build(&self, source: &Source, commit: &CommitId, log_url: &str)
    -> Result<()>;

    /// Current tip of a branch.
    async fn branch_head(&self, source: &Source, branch: &str) -> Result<CommitId>;

    async fn create_tag(&self, source: &Source, commit: &CommitId, tag: &str) -> Result<()>;

    async fn create_branch(&self, source: &Source, commit: &CommitId, branch: &str)
    -> Result<()>;

    /// Drop any cached Git state for a repository.
    async fn invalidate(&self, source: &Source);
}

/// Read access to the repository version tree.
#[async_trait]
pub trait VersionModel: Send + Sync {
    /// Version the next release from `branch` would carry.
    async fn next_version(&self, source: &Source, branch: &str, bump: BumpType)
    -> Result<Version>;

    /// Whether the commit carries a build definition at all.
    async fn has_build_definition(&self, source: &Source, commit: &CommitId) -> Result<bool>;

    async fn invalidate(&self, source: &Source);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_ref_parsing() {
        assert_eq!(
            GitRef::from_full_ref("refs/heads/feature/x"),
            Some(GitRef::Branch("feature/x".to_string()))
        );
        assert_eq!(
            GitRef::from_full_ref("refs/tags/v1.0.0"),
            Some(GitRef::Tag("v1.0.0".to_string()))
        );
        assert_eq!(GitRef::from_full_ref("refs/notes/commits"), None);
        assert_eq!(GitRef::Tag("v2.0.0".into()).to_string(), "refs/tags/v2.0.0");
    }
}
