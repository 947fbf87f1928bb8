//! CLI command implementations.

pub mod queue;

use anyhow::Result;
use keel_config::load_system_config;

pub fn validate(path: &str) -> Result<()> {
    match load_system_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!(
                "  coordinator: prefix `{}`, concurrency {}, status ttl {}h",
                config.coordinator.key_prefix,
                config.coordinator.concurrency,
                config.coordinator.status_ttl.as_secs() / 3600
            );
            for repo in &config.repositories {
                let state = if repo.active { "active" } else { "inactive" };
                println!("  repository {}/{} ({state})", repo.source_id, repo.path);
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
