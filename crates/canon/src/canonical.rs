//! `canon canonical show|promote|detach|provenance`.

use anyhow::{bail, Result};

use canon_core::models::CanonicalRecord;

use crate::app;
use crate::config::Config;
use crate::stats::format_ts_relative;

const NOT_APPLIED: &str = "Not applied: the configured actor is not entitled to deduplicate.";

/// Show a record, looked up by record id or, with `by_chunk`, by member chunk.
pub async fn run_show(config: &Config, id: &str, by_chunk: bool) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);

    let record = if by_chunk {
        service.get_canonical_for_chunk(&caller, id).await?
    } else {
        service.get_canonical(&caller, id).await?
    };
    let Some(record) = record else {
        bail!("Canonical record not found: {}", id);
    };

    print_record(&record);
    if let Some(chunk) = service.get_chunk(&caller, &record.canonical_chunk_id).await? {
        println!("  Content:     {}", chunk.preview().replace('\n', " "));
    }

    let variants = service.get_variants(&caller, &record.id).await?;
    println!();
    if variants.is_empty() {
        println!("  No variants.");
    } else {
        println!(
            "  {:<38} {:<12} {:>10}   {}",
            "VARIANT", "RELATION", "SIMILARITY", "MERGED"
        );
        for v in &variants {
            println!(
                "  {:<38} {:<12} {:>10.3}   {}",
                v.variant_chunk_id,
                v.relationship.as_str(),
                v.similarity_score,
                format_ts_relative(v.merged_at)
            );
        }
    }

    let links = service.get_links(&caller, &record.canonical_chunk_id).await?;
    if !links.is_empty() {
        println!();
        println!("  Links:");
        for link in &links {
            let other = if link.source_chunk_id == record.canonical_chunk_id {
                &link.target_chunk_id
            } else {
                &link.source_chunk_id
            };
            println!(
                "    {} ({}, {:.3})",
                other,
                link.relationship.as_str(),
                link.similarity_score
            );
        }
    }

    app::close(service).await;
    Ok(())
}

pub async fn run_promote(
    config: &Config,
    canonical_id: &str,
    chunk_id: &str,
    reason: &str,
) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    match service
        .promote_variant(&caller, canonical_id, chunk_id, reason)
        .await?
    {
        Some(record) => {
            println!("Promoted {} in {}.", chunk_id, record.id);
            print_record(&record);
        }
        None => println!("{}", NOT_APPLIED),
    }
    app::close(service).await;
    Ok(())
}

pub async fn run_detach(config: &Config, chunk_id: &str) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    match service.detach_variant(&caller, chunk_id).await? {
        Some(record) => {
            println!("Detached {} from {}.", chunk_id, record.id);
            println!("  Merge count: {}", record.merge_count);
        }
        None => println!("{}", NOT_APPLIED),
    }
    app::close(service).await;
    Ok(())
}

pub async fn run_provenance(config: &Config, canonical_id: &str) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let provenance = service.get_provenance(&caller, canonical_id).await?;

    if provenance.is_empty() {
        println!("No provenance recorded.");
    } else {
        println!(
            "  {:<38} {:<30} {:<14} {}",
            "CHUNK", "DOCUMENT", "LOCATION", "INGESTED"
        );
        for p in &provenance {
            println!(
                "  {:<38} {:<30} {:<14} {}",
                p.chunk_id,
                p.source_document_id.as_deref().unwrap_or("-"),
                p.source_location.as_deref().unwrap_or("-"),
                format_ts_relative(p.ingested_at)
            );
        }
    }

    app::close(service).await;
    Ok(())
}

fn print_record(record: &CanonicalRecord) {
    println!("Canonical record {}", record.id);
    println!("  Chunk:       {}", record.canonical_chunk_id);
    println!(
        "  Project:     {}",
        record.project.as_deref().unwrap_or("(none)")
    );
    println!("  Merge count: {}", record.merge_count);
    println!("  Updated:     {}", format_ts_relative(record.updated_at));
    if let Some(retired) = record.retired_at {
        println!("  Retired:     {}", format_ts_relative(retired));
    }
}
