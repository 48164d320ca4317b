//! `canon ingest`: load chunks from a JSONL file and deduplicate each one.
//!
//! Each line is a JSON object:
//!
//! ```json
//! {"id": "c-1", "content": "...", "embedding": [0.1, 0.2], "project": "docs",
//!  "source_document_id": "handbook.md", "source_location": "L10-L24",
//!  "metadata": {}, "created_at": 1700000000}
//! ```
//!
//! Only `content` and `embedding` are required; `id` defaults to a fresh
//! UUID and `created_at` to now. Malformed lines are reported and skipped.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use canon_core::models::Chunk;

use crate::app;
use crate::config::Config;
use crate::progress::format_number;

#[derive(Debug, Deserialize)]
struct ChunkRecord {
    #[serde(default)]
    id: Option<String>,
    content: String,
    embedding: Vec<f32>,
    #[serde(default)]
    source_document_id: Option<String>,
    #[serde(default)]
    source_location: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    created_at: Option<i64>,
}

impl ChunkRecord {
    fn into_chunk(self) -> Chunk {
        let mut chunk = Chunk::new(self.content, self.embedding);
        if let Some(id) = self.id {
            chunk.id = id;
        }
        if let Some(ts) = self.created_at {
            chunk.created_at = ts;
        }
        if let Some(metadata) = self.metadata {
            chunk.metadata = metadata;
        }
        chunk.source_document_id = self.source_document_id;
        chunk.source_location = self.source_location;
        chunk.project = self.project;
        chunk
    }
}

/// Parse a JSONL body into chunks, collecting per-line errors.
fn parse_lines(body: &str) -> (Vec<Chunk>, Vec<String>) {
    let mut chunks = Vec::new();
    let mut errors = Vec::new();
    for (idx, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ChunkRecord>(line) {
            Ok(record) if record.embedding.is_empty() => {
                errors.push(format!("line {}: empty embedding", idx + 1));
            }
            Ok(record) => chunks.push(record.into_chunk()),
            Err(e) => errors.push(format!("line {}: {}", idx + 1, e)),
        }
    }
    (chunks, errors)
}

pub async fn run_ingest(config: &Config, path: &Path, concurrency: usize) -> Result<()> {
    if concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let (chunks, parse_errors) = parse_lines(&body);
    for err in &parse_errors {
        eprintln!("skipped {}", err);
    }

    let service = Arc::new(app::open_service(config).await?);
    let caller = Arc::new(app::caller(config));
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    for chunk in chunks {
        let service = service.clone();
        let caller = caller.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let outcome = service.ingest(&caller, &chunk).await;
            (chunk.id, outcome)
        });
    }

    let mut by_action: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut failed = 0u64;
    while let Some(joined) = tasks.join_next().await {
        let (chunk_id, outcome) = joined.context("ingest task panicked")?;
        match outcome {
            Ok(outcome) => *by_action.entry(outcome.action.as_str()).or_default() += 1,
            Err(err) => {
                warn!(chunk_id = %chunk_id, error = %err, "ingest failed");
                eprintln!("failed {}: {}", chunk_id, err);
                failed += 1;
            }
        }
    }

    let ingested: u64 = by_action.values().sum();
    println!("Ingested {} chunks.", format_number(ingested));
    for (action, count) in &by_action {
        println!("  {:<26} {}", action, format_number(*count));
    }
    if failed > 0 || !parse_errors.is_empty() {
        println!(
            "  {:<26} {}",
            "failed",
            format_number(failed + parse_errors.len() as u64)
        );
    }

    if let Ok(service) = Arc::try_unwrap(service) {
        app::close(service).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_and_full_records() {
        let body = r#"
{"content": "alpha", "embedding": [1.0, 0.0]}
{"id": "c-2", "content": "beta", "embedding": [0.0, 1.0], "project": "docs", "created_at": 42, "metadata": {"lang": "en"}}
"#;
        let (chunks, errors) = parse_lines(body);
        assert!(errors.is_empty());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "alpha");
        assert!(!chunks[0].id.is_empty());
        assert_eq!(chunks[1].id, "c-2");
        assert_eq!(chunks[1].project.as_deref(), Some("docs"));
        assert_eq!(chunks[1].created_at, 42);
        assert_eq!(chunks[1].metadata["lang"], "en");
    }

    #[test]
    fn reports_bad_lines_with_numbers() {
        let body = "{\"content\": \"ok\", \"embedding\": [1.0]}\nnot json\n{\"content\": \"x\", \"embedding\": []}\n";
        let (chunks, errors) = parse_lines(body);
        assert_eq!(chunks.len(), 1);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("line 2:"));
        assert_eq!(errors[1], "line 3: empty embedding");
    }
}
