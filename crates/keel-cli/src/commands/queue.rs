//! Read-only queue inspection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keel_core::JobKey;
use keel_scheduler::StatusLedger;
use keel_scheduler::store::{Pool, PoolEntry};
use serde_json::json;

pub async fn status(ledger: &StatusLedger, key: &str) -> Result<()> {
    let key: JobKey = key.parse().context("Invalid job key")?;
    match ledger.status(&key).await? {
        Some(state) => println!("{} {}", key.canonical_id(), state),
        None => println!("{} unknown (never queued or expired)", key.canonical_id()),
    }
    Ok(())
}

pub async fn pools(ledger: &StatusLedger, as_json: bool) -> Result<()> {
    let ready = ledger.pool(Pool::Ready).await?;
    let active = ledger.pool(Pool::Active).await?;

    if as_json {
        let doc = json!({
            "ready": ready.iter().map(entry_json).collect::<Vec<_>>(),
            "active": active.iter().map(entry_json).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    for (name, entries) in [("active", &active), ("ready", &ready)] {
        println!("{name} ({})", entries.len());
        for entry in entries.iter() {
            println!("  {}", render_entry(entry));
        }
    }
    Ok(())
}

fn entry_json(entry: &PoolEntry) -> serde_json::Value {
    json!({
        "job": entry.job,
        "label": entry.label,
        "since": since(entry.since),
    })
}

fn render_entry(entry: &PoolEntry) -> String {
    let label = entry.label.as_deref().unwrap_or(&entry.job);
    format!("{:<40} since {}", label, since(entry.since))
}

fn since(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}
