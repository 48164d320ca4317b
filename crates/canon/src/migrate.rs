use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    // Chunks with their embeddings (little-endian f32 BLOB)
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL,
        embedding BLOB NOT NULL,
        source_document_id TEXT,
        source_location TEXT,
        project TEXT,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        archived INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_chunks_live ON chunks(archived, id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_project ON chunks(project, archived)",
    r#"
    CREATE TABLE IF NOT EXISTS canonical_records (
        id TEXT PRIMARY KEY,
        canonical_chunk_id TEXT NOT NULL,
        project TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        merge_count INTEGER NOT NULL DEFAULT 1,
        retired_at INTEGER,
        FOREIGN KEY (canonical_chunk_id) REFERENCES chunks(id)
    )
    "#,
    // A chunk anchors at most one live record
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_canonical_live_chunk
        ON canonical_records(canonical_chunk_id) WHERE retired_at IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunk_variants (
        id TEXT PRIMARY KEY,
        canonical_record_id TEXT NOT NULL,
        variant_chunk_id TEXT NOT NULL UNIQUE,
        relationship TEXT NOT NULL,
        similarity_score REAL NOT NULL,
        merged_at INTEGER NOT NULL,
        FOREIGN KEY (canonical_record_id) REFERENCES canonical_records(id),
        FOREIGN KEY (variant_chunk_id) REFERENCES chunks(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_variants_record ON chunk_variants(canonical_record_id)",
    r#"
    CREATE TABLE IF NOT EXISTS chunk_links (
        id TEXT PRIMARY KEY,
        source_chunk_id TEXT NOT NULL,
        target_chunk_id TEXT NOT NULL,
        pair_key TEXT NOT NULL UNIQUE,
        relationship_type TEXT NOT NULL,
        similarity_score REAL NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_links_source ON chunk_links(source_chunk_id)",
    "CREATE INDEX IF NOT EXISTS idx_links_target ON chunk_links(target_chunk_id)",
    r#"
    CREATE TABLE IF NOT EXISTS chunk_provenance (
        id TEXT PRIMARY KEY,
        chunk_id TEXT NOT NULL,
        source_document_id TEXT,
        source_location TEXT,
        ingested_at INTEGER NOT NULL,
        verified_at INTEGER,
        verified_by TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_provenance_chunk ON chunk_provenance(chunk_id)",
    r#"
    CREATE TABLE IF NOT EXISTS contradictions (
        id TEXT PRIMARY KEY,
        chunk_a_id TEXT NOT NULL,
        chunk_b_id TEXT NOT NULL,
        pair_key TEXT NOT NULL,
        description TEXT NOT NULL,
        severity TEXT NOT NULL,
        status TEXT NOT NULL,
        resolution_action TEXT,
        resolution_notes TEXT,
        resolved_by TEXT,
        preferred_chunk_id TEXT,
        detected_at INTEGER NOT NULL,
        resolved_at INTEGER
    )
    "#,
    // At most one open contradiction per unordered pair
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_contradictions_open_pair
        ON contradictions(pair_key) WHERE status IN ('pending', 'in_review')
    "#,
    "CREATE INDEX IF NOT EXISTS idx_contradictions_a ON contradictions(chunk_a_id)",
    "CREATE INDEX IF NOT EXISTS idx_contradictions_b ON contradictions(chunk_b_id)",
    r#"
    CREATE TABLE IF NOT EXISTS pending_reviews (
        id TEXT PRIMARY KEY,
        chunk_id TEXT NOT NULL UNIQUE,
        project TEXT,
        candidates_json TEXT NOT NULL,
        reason TEXT NOT NULL,
        queued_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batch_jobs (
        id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        options_json TEXT NOT NULL,
        processed INTEGER NOT NULL DEFAULT 0,
        total INTEGER NOT NULL DEFAULT 0,
        checkpoint TEXT,
        stats_json TEXT NOT NULL,
        error TEXT,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        updated_at INTEGER NOT NULL,
        finished_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_batch_jobs_created ON batch_jobs(created_at DESC)",
];

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}
