//! Operator commands against the server database.
//!
//! `harvest paths add|list`, `harvest files` and `harvest reimport` open the
//! database directly and print their results as plain tables.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use cycler_harvest_core::handler;
use cycler_harvest_core::models::NewMonitoredPath;
use cycler_harvest_core::store::{count_states, Store};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

async fn open_store(config: &Config) -> Result<SqliteStore> {
    let pool = db::connect(config).await?;
    Ok(SqliteStore::new(pool))
}

/// Add a monitored path for a registered harvester.
pub async fn add_path(
    config: &Config,
    harvester_id: i64,
    path: &str,
    pattern: &str,
    stable_time: Option<u64>,
) -> Result<()> {
    let store = open_store(config).await?;
    if store.get_harvester(harvester_id).await?.is_none() {
        bail!("Harvester {} is not registered", harvester_id);
    }
    let added = store
        .add_monitored_path(&NewMonitoredPath {
            harvester_id,
            path: path.trim_end_matches('/').to_string(),
            pattern: pattern.to_string(),
            stable_time: stable_time.unwrap_or(config.server.default_stable_time),
        })
        .await?;
    println!(
        "Added monitored path {} for harvester {}: {} ({}; stable after {}s)",
        added.id, added.harvester_id, added.path, added.pattern, added.stable_time
    );
    store.pool().close().await;
    Ok(())
}

pub async fn list_paths(config: &Config, harvester_id: Option<i64>) -> Result<()> {
    let store = open_store(config).await?;
    let paths = store.list_monitored_paths(harvester_id).await?;
    if paths.is_empty() {
        println!("No monitored paths.");
    } else {
        println!(
            "  {:>4} {:>9} {:<40} {:<12} {:>7} {}",
            "ID", "HARVESTER", "PATH", "PATTERN", "STABLE", "ACTIVE"
        );
        println!("  {}", "-".repeat(84));
        for p in &paths {
            println!(
                "  {:>4} {:>9} {:<40} {:<12} {:>6}s {}",
                p.id,
                p.harvester_id,
                p.path,
                p.pattern,
                p.stable_time,
                if p.active { "yes" } else { "no" }
            );
        }
    }
    store.pool().close().await;
    Ok(())
}

/// List observed files with their state and last error, then per-state counts.
pub async fn list_files(config: &Config, harvester_id: Option<i64>) -> Result<()> {
    let store = open_store(config).await?;
    let files = store.list_files(harvester_id).await?;

    println!("Observed files");
    println!("==============");
    println!();
    if files.is_empty() {
        println!("  No files observed yet.");
    } else {
        println!(
            "  {:>5} {:<14} {:>10} {:<14} {}",
            "ID", "STATE", "SIZE", "SEEN", "PATH"
        );
        println!("  {}", "-".repeat(84));
        for file in &files {
            println!(
                "  {:>5} {:<14} {:>10} {:<14} {}",
                file.id,
                file.state.as_str(),
                format_bytes(file.last_observed_size),
                format_ts_relative(file.last_observed_time),
                file.path
            );
            if let Some(error) = store.latest_error(file.id).await? {
                println!("  {:>5} last error: {}", "", error.error);
            }
        }
    }

    println!();
    println!("  By state:");
    for (state, count) in count_states(&files) {
        if count > 0 {
            println!("    {:<14} {}", state.as_str(), count);
        }
    }
    println!();

    store.pool().close().await;
    Ok(())
}

/// Drop a file's data and queue it for import again.
pub async fn reimport(config: &Config, file_id: i64) -> Result<()> {
    let store = open_store(config).await?;
    let file = handler::reimport(&store, file_id).await?;
    println!("File {} ({}) is now {}", file.id, file.path, file.state);
    store.pool().close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: DateTime<Utc>) -> String {
    let diff = (Utc::now() - ts).num_seconds();
    if diff < 60 {
        "just now".to_string()
    } else if diff < 3600 {
        format!("{}m ago", diff / 60)
    } else if diff < 86400 {
        format!("{}h ago", diff / 3600)
    } else {
        format!("{}d ago", diff / 86400)
    }
}
