//! Artifact publishing abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{JobKey, Result};

/// Reference to a published artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedArtifact {
    /// Artifact name (image, package, archive).
    pub name: String,
    /// Where it was published.
    pub location: String,
}

/// Publishes the artifacts of a successful build.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, key: &JobKey) -> Result<Vec<PublishedArtifact>>;
}
