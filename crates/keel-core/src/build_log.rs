//! User-facing build log.
//!
//! Entries are correlated by source and canonical job id so a review system
//! can show everything that happened to one change.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[async_trait]
pub trait BuildLog: Send + Sync {
    async fn add(&self, message: &str, level: LogLevel, source: &Source, canonical_id: &str);

    /// Link to the log of one job, attached to verified commits.
    fn log_url(&self, source: &Source, canonical_id: &str) -> String;
}

/// Build log that only forwards entries to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingBuildLog {
    base_url: Option<String>,
}

impl TracingBuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
        }
    }
}

#[async_trait]
impl BuildLog for TracingBuildLog {
    async fn add(&self, message: &str, level: LogLevel, source: &Source, canonical_id: &str) {
        match level {
            LogLevel::Info => tracing::info!(%source, canonical_id, "{message}"),
            LogLevel::Warning => tracing::warn!(%source, canonical_id, "{message}"),
            LogLevel::Error => tracing::error!(%source, canonical_id, "{message}"),
        }
    }

    fn log_url(&self, source: &Source, canonical_id: &str) -> String {
        let base = self.base_url.as_deref().unwrap_or("");
        format!(
            "{base}/log/{}/{}/{}",
            urlencoding::encode(&source.id),
            urlencoding::encode(&source.path),
            urlencoding::encode(canonical_id)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_url_encodes_components() {
        let log = TracingBuildLog::with_base_url("https://ci.example.com");
        let url = log.log_url(&Source::new("github", "acme/widgets"), "update/12");
        assert_eq!(
            url,
            "https://ci.example.com/log/github/acme%2Fwidgets/update%2F12"
        );
    }
}
