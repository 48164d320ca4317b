//! `canon reviews list|decide`.

use anyhow::{anyhow, bail, Result};

use canon_core::models::Severity;
use canon_core::orchestrator::ReviewDecision;

use crate::app;
use crate::config::Config;
use crate::stats::format_ts_relative;

pub async fn run_list(config: &Config, project: Option<&str>) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let reviews = service.get_pending_reviews(&caller, project).await?;

    if reviews.is_empty() {
        println!("Review queue is empty.");
    }
    for review in &reviews {
        println!(
            "Review {}  chunk {}  queued {}",
            review.id,
            review.chunk_id,
            format_ts_relative(review.queued_at)
        );
        println!("  Reason: {}", review.reason);
        for c in &review.candidates {
            println!(
                "    {} [{:.3}] {} ({:.2})",
                c.chunk_id,
                c.similarity,
                c.relationship.as_str(),
                c.confidence
            );
        }
    }

    app::close(service).await;
    Ok(())
}

/// Turn CLI flags into a decision.
pub fn build_decision(
    decision: &str,
    target: Option<String>,
    description: Option<String>,
    severity: Option<&str>,
) -> Result<ReviewDecision> {
    let need_target = |target: Option<String>| {
        target.ok_or_else(|| anyhow!("--target is required for the '{}' decision", decision))
    };
    Ok(match decision {
        "merge" => ReviewDecision::Merge {
            target_chunk_id: need_target(target)?,
        },
        "keep_separate" | "keep-separate" => ReviewDecision::KeepSeparate,
        "link" => ReviewDecision::Link {
            target_chunk_id: need_target(target)?,
        },
        "flag_contradiction" | "flag-contradiction" | "flag" => {
            ReviewDecision::FlagContradiction {
                target_chunk_id: need_target(target)?,
                description: description
                    .unwrap_or_else(|| "flagged during manual review".to_string()),
                severity: severity
                    .map(str::parse::<Severity>)
                    .transpose()?
                    .unwrap_or(Severity::Medium),
            }
        }
        "delete" => ReviewDecision::Delete,
        other => bail!(
            "Unknown decision: {} (expected merge, keep_separate, link, flag_contradiction or delete)",
            other
        ),
    })
}

pub async fn run_decide(config: &Config, review_id: &str, decision: &ReviewDecision) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    match service.decide_review(&caller, review_id, decision).await? {
        Some(outcome) => {
            println!(
                "Applied '{}' to review {} (chunk {}).",
                outcome.decision, outcome.review_id, outcome.chunk_id
            );
            if let Some(canonical_id) = &outcome.canonical_id {
                println!("  Canonical:     {}", canonical_id);
            }
            if let Some(contradiction_id) = &outcome.contradiction_id {
                println!("  Contradiction: {}", contradiction_id);
            }
            if outcome.archived {
                println!("  Chunk archived.");
            }
        }
        None => println!("Not applied: the configured actor is not entitled to deduplicate."),
    }
    app::close(service).await;
    Ok(())
}
