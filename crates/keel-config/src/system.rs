//! System configuration parsing.
//!
//! ```kdl
//! coordinator {
//!     redis-url "redis://127.0.0.1:6379/"
//!     concurrency 4
//! }
//!
//! repository "github" "acme/widgets" {
//!     merge #true
//!     release "minor"
//!     release-branch "main"
//!     build-branch "main"
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use keel_core::{BumpType, Source};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_KEY_PREFIX: &str = "queue";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_STATUS_TTL_HOURS: u64 = 48;

/// System-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub coordinator: CoordinatorConfig,
    pub repositories: Vec<RepositoryPolicy>,
}

impl SystemConfig {
    /// Policy for a source, if it is configured in this deployment.
    pub fn repository(&self, source: &Source) -> Option<&RepositoryPolicy> {
        self.repositories
            .iter()
            .find(|r| r.source_id == source.id && r.path == source.path)
    }
}

/// Coordination store and admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub redis_url: Option<String>,
    /// Prefix of every coordination-store key.
    pub key_prefix: String,
    /// Maximum number of concurrently admitted jobs across all repositories.
    pub concurrency: usize,
    pub status_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            status_ttl: Duration::from_secs(DEFAULT_STATUS_TTL_HOURS * 3600),
        }
    }
}

/// Per-repository behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryPolicy {
    pub source_id: String,
    pub path: String,
    /// Inactive repositories are known but ignored.
    pub active: bool,
    /// Merge successful updates into their target branch.
    pub merge: bool,
    /// Bump applied when a successful build lands on a release branch.
    pub release: Option<BumpType>,
    pub release_branches: Vec<BranchPattern>,
    /// Branches whose direct pushes are built.
    pub build_branches: Vec<BranchPattern>,
    /// Cut `release/<major>.<minor>` on major and minor releases.
    pub maintenance_branches: bool,
}

impl RepositoryPolicy {
    pub fn new(source: &Source) -> Self {
        Self {
            source_id: source.id.clone(),
            path: source.path.clone(),
            active: true,
            merge: false,
            release: None,
            release_branches: Vec::new(),
            build_branches: Vec::new(),
            maintenance_branches: false,
        }
    }

    pub fn source(&self) -> Source {
        Source::new(&self.source_id, &self.path)
    }

    /// Release bump for a branch, if releases are cut from it.
    pub fn release_for(&self, branch: &str) -> Option<BumpType> {
        let bump = self.release?;
        self.release_branches
            .iter()
            .any(|p| p.matches(branch))
            .then_some(bump)
    }

    pub fn builds_branch(&self, branch: &str) -> bool {
        self.build_branches.iter().any(|p| p.matches(branch))
    }
}

/// A branch name pattern, matched against the whole branch name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchPattern {
    source: String,
    regex: Regex,
}

impl BranchPattern {
    pub fn new(pattern: &str) -> ConfigResult<Self> {
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            ConfigError::InvalidValue {
                field: "branch pattern".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, branch: &str) -> bool {
        self.regex.is_match(branch)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl TryFrom<String> for BranchPattern {
    type Error = ConfigError;

    fn try_from(s: String) -> ConfigResult<Self> {
        Self::new(&s)
    }
}

impl From<BranchPattern> for String {
    fn from(p: BranchPattern) -> Self {
        p.source
    }
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = SystemConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "coordinator" => {
                config.coordinator = parse_coordinator(node)?;
            }
            "repository" => {
                let policy = parse_repository(node)?;
                if !seen.insert((policy.source_id.clone(), policy.path.clone())) {
                    return Err(ConfigError::DuplicateRepository(format!(
                        "{}/{}",
                        policy.source_id, policy.path
                    )));
                }
                config.repositories.push(policy);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_system_config(&text)
}

fn parse_coordinator(node: &KdlNode) -> ConfigResult<CoordinatorConfig> {
    let mut coordinator = CoordinatorConfig::default();

    let Some(children) = node.children() else {
        return Ok(coordinator);
    };

    for child in children.nodes() {
        match child.name().value() {
            "redis-url" => {
                coordinator.redis_url = get_first_string_arg(child);
            }
            "key-prefix" => {
                let prefix = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("key-prefix value".to_string()))?;
                if prefix.is_empty() || prefix.contains(':') {
                    return Err(ConfigError::InvalidValue {
                        field: "key-prefix".to_string(),
                        message: "must be non-empty and must not contain ':'".to_string(),
                    });
                }
                coordinator.key_prefix = prefix;
            }
            "concurrency" => {
                let n = get_positive_int_arg(child, "concurrency")?;
                coordinator.concurrency = n as usize;
            }
            "status-ttl-hours" => {
                let hours = get_positive_int_arg(child, "status-ttl-hours")?;
                coordinator.status_ttl = Duration::from_secs(hours * 3600);
            }
            _ => {}
        }
    }

    Ok(coordinator)
}

fn parse_repository(node: &KdlNode) -> ConfigResult<RepositoryPolicy> {
    let args = get_all_string_args(node);
    let [source_id, path] = args.as_slice() else {
        return Err(ConfigError::MissingField(
            "repository source id and path".to_string(),
        ));
    };

    let mut policy = RepositoryPolicy::new(&Source::new(source_id, path));

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "active" => {
                    policy.active = get_bool_arg(child, "active")?;
                }
                "merge" => {
                    policy.merge = get_bool_arg(child, "merge")?;
                }
                "maintenance-branches" => {
                    policy.maintenance_branches = get_bool_arg(child, "maintenance-branches")?;
                }
                "release" => {
                    let bump = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("release bump".to_string()))?;
                    policy.release =
                        Some(bump.parse().map_err(|_| ConfigError::InvalidValue {
                            field: "release".to_string(),
                            message: format!("unknown bump type: {}", bump),
                        })?);
                }
                "release-branch" => {
                    for pattern in get_all_string_args(child) {
                        policy.release_branches.push(BranchPattern::new(&pattern)?);
                    }
                }
                "build-branch" => {
                    for pattern in get_all_string_args(child) {
                        policy.build_branches.push(BranchPattern::new(&pattern)?);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(policy)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected #true or #false".to_string(),
        })
}

fn get_positive_int_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected an integer".to_string(),
        })?;

    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("must be at least 1, got {}", value),
        })
}
