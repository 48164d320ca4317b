//! `canon contradictions list|show|review|resolve`.

use anyhow::{bail, Result};

use canon_core::models::{Contradiction, ContradictionStatus, ResolutionAction};

use crate::app;
use crate::config::Config;
use crate::stats::format_ts_relative;

pub async fn run_list(config: &Config, status: Option<&str>, project: Option<&str>) -> Result<()> {
    let status: Option<ContradictionStatus> = status.map(str::parse).transpose()?;
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let contradictions = service
        .list_contradictions(&caller, status, project)
        .await?;

    if contradictions.is_empty() {
        println!("No contradictions.");
    } else {
        println!(
            "  {:<38} {:<9} {:<10} {:<14}   {}",
            "ID", "SEVERITY", "STATUS", "DETECTED", "DESCRIPTION"
        );
        for c in &contradictions {
            println!(
                "  {:<38} {:<9} {:<10} {:<14}   {}",
                c.id,
                c.severity.as_str(),
                c.status.as_str(),
                format_ts_relative(c.detected_at),
                c.description
            );
        }
    }

    app::close(service).await;
    Ok(())
}

pub async fn run_show(config: &Config, id: &str) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let Some(c) = service.get_contradiction(&caller, id).await? else {
        bail!("Contradiction not found: {}", id);
    };

    print_contradiction(&c);
    for (label, chunk_id) in [("A", &c.chunk_a_id), ("B", &c.chunk_b_id)] {
        if let Some(chunk) = service.get_chunk(&caller, chunk_id).await? {
            let archived = if chunk.archived { " (archived)" } else { "" };
            println!();
            println!("  Chunk {} {}{}", label, chunk.id, archived);
            println!("    {}", chunk.preview().replace('\n', " "));
        }
    }

    app::close(service).await;
    Ok(())
}

pub async fn run_mark_in_review(config: &Config, id: &str) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    match service.mark_in_review(&caller, id).await? {
        Some(c) => println!("Contradiction {} is {}.", c.id, c.status),
        None => println!("Not applied: the configured actor is not entitled to deduplicate."),
    }
    app::close(service).await;
    Ok(())
}

pub async fn run_resolve(
    config: &Config,
    id: &str,
    action: &str,
    preferred: Option<String>,
    notes: Option<String>,
) -> Result<()> {
    let action: ResolutionAction = action.parse()?;
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    match service
        .resolve_contradiction(&caller, id, action, preferred, notes)
        .await?
    {
        Some(c) => {
            println!("Resolved contradiction {}.", c.id);
            print_contradiction(&c);
        }
        None => println!("Not applied: the configured actor is not entitled to deduplicate."),
    }
    app::close(service).await;
    Ok(())
}

fn print_contradiction(c: &Contradiction) {
    println!("Contradiction {}", c.id);
    println!("  Chunks:      {} / {}", c.chunk_a_id, c.chunk_b_id);
    println!("  Severity:    {}", c.severity);
    println!("  Status:      {}", c.status);
    println!("  Description: {}", c.description);
    println!("  Detected:    {}", format_ts_relative(c.detected_at));
    if let Some(action) = c.resolution_action {
        println!("  Resolution:  {}", action);
    }
    if let Some(preferred) = &c.preferred_chunk_id {
        println!("  Preferred:   {}", preferred);
    }
    if let Some(by) = &c.resolved_by {
        println!("  Resolved by: {}", by);
    }
    if let Some(notes) = &c.resolution_notes {
        println!("  Notes:       {}", notes);
    }
}
