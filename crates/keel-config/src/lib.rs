//! KDL configuration parsing for keel.
//!
//! This crate handles parsing of:
//! - Coordinator settings (store location, admission bound, status TTL)
//! - Per-repository merge, release and build policy

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    BranchPattern, CoordinatorConfig, RepositoryPolicy, SystemConfig, load_system_config,
    parse_system_config,
};
