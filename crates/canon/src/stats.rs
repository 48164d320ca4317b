//! Database statistics and health overview.
//!
//! A quick summary of deduplication state: how many chunks are live, how many
//! canonical records and variants they fold into, what waits for review, and
//! how contradictions and reconciliation jobs stand. Used by `canon stats`.

use std::collections::BTreeMap;

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use canon_core::store::{ContradictionStats, ContradictionStore};

use crate::config::Config;
use crate::db;
use crate::progress::format_number;
use crate::sqlite_store::SqliteStore;

async fn count(pool: &SqlitePool, sql: &str) -> Result<u64> {
    let n: i64 = sqlx::query_scalar(sql).fetch_one(pool).await?;
    Ok(n as u64)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let live_chunks = count(&pool, "SELECT COUNT(*) FROM chunks WHERE archived = 0").await?;
    let archived_chunks = count(&pool, "SELECT COUNT(*) FROM chunks WHERE archived = 1").await?;
    let live_records = count(
        &pool,
        "SELECT COUNT(*) FROM canonical_records WHERE retired_at IS NULL",
    )
    .await?;
    let retired_records = count(
        &pool,
        "SELECT COUNT(*) FROM canonical_records WHERE retired_at IS NOT NULL",
    )
    .await?;
    let variants = count(&pool, "SELECT COUNT(*) FROM chunk_variants").await?;
    let links = count(&pool, "SELECT COUNT(*) FROM chunk_links").await?;
    let reviews = count(&pool, "SELECT COUNT(*) FROM pending_reviews").await?;
    let last_activity: Option<i64> =
        sqlx::query_scalar("SELECT MAX(updated_at) FROM canonical_records")
            .fetch_one(&pool)
            .await?;

    let job_rows = sqlx::query("SELECT state, COUNT(*) AS n FROM batch_jobs GROUP BY state")
        .fetch_all(&pool)
        .await?;
    let jobs: BTreeMap<String, u64> = job_rows
        .iter()
        .map(|row| (row.get("state"), row.get::<i64, _>("n") as u64))
        .collect();

    let store = SqliteStore::new(pool.clone());
    let contradictions = store.contradiction_stats(None).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Canon Database Stats");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!(
        "  Chunks:      {} live, {} archived",
        format_number(live_chunks),
        format_number(archived_chunks)
    );
    println!(
        "  Canonicals:  {} live, {} retired",
        format_number(live_records),
        format_number(retired_records)
    );
    println!("  Variants:    {}", format_number(variants));
    println!(
        "  Dedup ratio: {}",
        dedup_ratio(live_records, variants)
    );
    println!("  Links:       {}", format_number(links));
    println!("  Reviews:     {} pending", format_number(reviews));
    println!(
        "  Last change: {}",
        last_activity
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    print_contradictions(&contradictions);

    if !jobs.is_empty() {
        println!();
        println!("  Reconciliation jobs:");
        for (state, n) in &jobs {
            println!("    {:<12} {}", state, format_number(*n));
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn print_contradictions(stats: &ContradictionStats) {
    println!();
    println!("  Contradictions: {}", format_number(stats.total));
    if stats.total == 0 {
        return;
    }
    for (label, breakdown) in [
        ("status", &stats.by_status),
        ("severity", &stats.by_severity),
        ("resolution", &stats.by_action),
    ] {
        if breakdown.is_empty() {
            continue;
        }
        let parts: Vec<String> = breakdown
            .iter()
            .map(|(k, v)| format!("{} {}", k, format_number(*v)))
            .collect();
        println!("    by {:<11} {}", label, parts.join(", "));
    }
}

/// Average number of chunks folded into each live canonical record.
fn dedup_ratio(records: u64, variants: u64) -> String {
    if records == 0 {
        return "-".to_string();
    }
    format!("{:.2} chunks per canonical", (records + variants) as f64 / records as f64)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_timestamps() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert_eq!(format_ts_relative(now - 86400 * 3), "3 days ago");
    }

    #[test]
    fn dedup_ratio_handles_empty_store() {
        assert_eq!(dedup_ratio(0, 0), "-");
        assert_eq!(dedup_ratio(4, 2), "1.50 chunks per canonical");
    }
}
