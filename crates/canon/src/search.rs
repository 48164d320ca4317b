//! `canon similar` and `canon duplicates`.

use anyhow::{bail, Result};

use canon_core::retrieval::SearchResult;

use crate::app;
use crate::config::Config;

pub async fn run_similar(
    config: &Config,
    chunk_id: &str,
    raw: bool,
    limit: Option<usize>,
    include_archived: bool,
) -> Result<()> {
    let service = app::open_service(config).await?;
    let caller = app::caller(config);

    let Some(chunk) = service.get_chunk(&caller, chunk_id).await? else {
        bail!("Chunk not found: {}", chunk_id);
    };

    let mut options = config.retrieval.options();
    options.respect_canonicals = !raw;
    options.include_archived = include_archived;
    let limit = limit.unwrap_or(config.retrieval.final_limit);
    if limit == 0 {
        bail!("--limit must be at least 1");
    }
    // One extra slot: the query chunk matches itself.
    options.limit = limit + 1;
    options.scope = service.options().scope_for(&chunk);

    let results: Vec<SearchResult> = service
        .search_similar(&caller, &chunk.embedding, &options)
        .await?
        .into_iter()
        .filter(|r| r.chunk_id != chunk.id)
        .take(limit)
        .collect();

    if results.is_empty() {
        println!("No similar chunks.");
    } else {
        for (i, r) in results.iter().enumerate() {
            let mut tags = Vec::new();
            if r.is_canonical {
                tags.push("canonical".to_string());
            }
            if let Some(n) = r.variant_count {
                if n > 0 {
                    tags.push(format!("{} variants", n));
                }
            }
            if r.has_unresolved_contradiction == Some(true) {
                tags.push("contradiction".to_string());
            }
            let tags = if tags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", tags.join(", "))
            };
            println!("{}. [{:.3}] {}{}", i + 1, r.score, r.chunk_id, tags);
            println!("    {}", r.preview.replace('\n', " "));
        }
    }

    app::close(service).await;
    Ok(())
}

pub async fn run_duplicates(config: &Config, chunk_id: &str, threshold: Option<f64>) -> Result<()> {
    let threshold = threshold.unwrap_or(config.dedup.similarity_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        bail!("--threshold must be within [0, 1]");
    }

    let service = app::open_service(config).await?;
    let caller = app::caller(config);
    let candidates = service
        .find_duplicates(&caller, chunk_id, threshold)
        .await?;

    if candidates.is_empty() {
        println!("No duplicate candidates at threshold {:.2}.", threshold);
    } else {
        println!(
            "  {:<38} {:>10} {:<14} {:>10}  {}",
            "CHUNK", "SIMILARITY", "RELATIONSHIP", "CONFIDENCE", "METHOD"
        );
        for c in &candidates {
            println!(
                "  {:<38} {:>10.3} {:<14} {:>10.2}  {}",
                c.chunk_id,
                c.similarity,
                c.classification.relationship.as_str(),
                c.classification.confidence,
                serde_json::to_value(c.classification.method)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            );
        }
    }

    app::close(service).await;
    Ok(())
}
