//! SQLite-backed implementation of every `canon_core` storage trait.
//!
//! Each multi-row mutation runs in one transaction. The first statement of
//! every transaction is a write (usually to the canonical record row), so
//! concurrent writers queue on SQLite's busy handler instead of failing a
//! read-to-write lock upgrade. Merge counts only ever change relatively
//! (`merge_count = merge_count + 1`).
//!
//! Vector search loads embeddings and scores them in Rust, like the
//! brute-force path of the in-memory store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use canon_core::error::{DedupError, Result};
use canon_core::job::{BatchJob, JobFilter, JobState};
use canon_core::models::{
    pair_key, preview, CanonicalRecord, Chunk, ChunkLink, ChunkProvenance, ChunkVariant,
    Contradiction, ContradictionStatus, Membership, MembershipRole, PendingReview, Resolution,
    ResolutionAction, SimilarityMatch, VariantRelation,
};
use canon_core::store::{
    Absorption, CanonicalStore, ChunkStore, ContradictionStats, ContradictionStore, JobStore, ReviewStore,
    VectorFilter,
};
use canon_core::vector::{decode_vector, encode_vector, similarity_score};

/// Upper bound on ids bound into one `IN (...)` list.
const IN_LIST_LIMIT: usize = 500;

const CHUNK_COLUMNS: &str = "id, content, embedding, source_document_id, source_location, \
    project, metadata_json, created_at, archived";

const RECORD_COLUMNS: &str =
    "r.id, r.canonical_chunk_id, r.project, r.created_at, r.updated_at, r.merge_count, r.retired_at";

const CONTRADICTION_COLUMNS: &str = "c.id, c.chunk_a_id, c.chunk_b_id, c.description, \
    c.severity, c.status, c.resolution_action, c.resolution_notes, c.resolved_by, \
    c.preferred_chunk_id, c.detected_at, c.resolved_at";

const JOB_COLUMNS: &str = "id, state, options_json, processed, total, checkpoint, stats_json, \
    error, created_at, started_at, updated_at, finished_at";

const OPEN_STATUSES: &str = "('pending', 'in_review')";

/// SQLite implementation of the storage traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn db_err(err: sqlx::Error) -> DedupError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return DedupError::conflict(db.message().to_string());
        }
    }
    DedupError::Persistence(err.to_string())
}

/// Like [`db_err`], with a readable message for unique violations.
fn unique_as(message: String) -> impl FnOnce(sqlx::Error) -> DedupError {
    move |err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DedupError::conflict(message),
        _ => db_err(err),
    }
}

fn json_err(err: serde_json::Error) -> DedupError {
    DedupError::Persistence(format!("corrupt json column: {}", err))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let embedding: Vec<u8> = row.get("embedding");
    let metadata_json: String = row.get("metadata_json");
    Chunk {
        id: row.get("id"),
        content: row.get("content"),
        embedding: decode_vector(&embedding),
        source_document_id: row.get("source_document_id"),
        source_location: row.get("source_location"),
        project: row.get("project"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
        created_at: row.get("created_at"),
        archived: row.get("archived"),
    }
}

fn record_from_row(row: &SqliteRow) -> CanonicalRecord {
    CanonicalRecord {
        id: row.get("id"),
        canonical_chunk_id: row.get("canonical_chunk_id"),
        project: row.get("project"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        merge_count: row.get("merge_count"),
        retired_at: row.get("retired_at"),
    }
}

fn variant_from_row(row: &SqliteRow) -> Result<ChunkVariant> {
    let relationship: String = row.get("relationship");
    Ok(ChunkVariant {
        id: row.get("id"),
        canonical_record_id: row.get("canonical_record_id"),
        variant_chunk_id: row.get("variant_chunk_id"),
        relationship: relationship.parse()?,
        similarity_score: row.get("similarity_score"),
        merged_at: row.get("merged_at"),
    })
}

fn link_from_row(row: &SqliteRow) -> Result<ChunkLink> {
    let relationship: String = row.get("relationship_type");
    Ok(ChunkLink {
        id: row.get("id"),
        source_chunk_id: row.get("source_chunk_id"),
        target_chunk_id: row.get("target_chunk_id"),
        relationship: relationship.parse()?,
        similarity_score: row.get("similarity_score"),
        created_at: row.get("created_at"),
    })
}

fn provenance_from_row(row: &SqliteRow) -> ChunkProvenance {
    ChunkProvenance {
        id: row.get("id"),
        chunk_id: row.get("chunk_id"),
        source_document_id: row.get("source_document_id"),
        source_location: row.get("source_location"),
        ingested_at: row.get("ingested_at"),
        verified_at: row.get("verified_at"),
        verified_by: row.get("verified_by"),
    }
}

fn contradiction_from_row(row: &SqliteRow) -> Result<Contradiction> {
    let severity: String = row.get("severity");
    let status: String = row.get("status");
    let action: Option<String> = row.get("resolution_action");
    Ok(Contradiction {
        id: row.get("id"),
        chunk_a_id: row.get("chunk_a_id"),
        chunk_b_id: row.get("chunk_b_id"),
        description: row.get("description"),
        severity: severity.parse()?,
        status: status.parse()?,
        resolution_action: action.map(|a| a.parse()).transpose()?,
        resolution_notes: row.get("resolution_notes"),
        resolved_by: row.get("resolved_by"),
        preferred_chunk_id: row.get("preferred_chunk_id"),
        detected_at: row.get("detected_at"),
        resolved_at: row.get("resolved_at"),
    })
}

fn review_from_row(row: &SqliteRow) -> Result<PendingReview> {
    let candidates_json: String = row.get("candidates_json");
    Ok(PendingReview {
        id: row.get("id"),
        chunk_id: row.get("chunk_id"),
        project: row.get("project"),
        candidates: serde_json::from_str(&candidates_json).map_err(json_err)?,
        reason: row.get("reason"),
        queued_at: row.get("queued_at"),
    })
}

fn job_from_row(row: &SqliteRow) -> Result<BatchJob> {
    let state: String = row.get("state");
    let options_json: String = row.get("options_json");
    let stats_json: String = row.get("stats_json");
    Ok(BatchJob {
        id: row.get("id"),
        state: state.parse()?,
        options: serde_json::from_str(&options_json).map_err(json_err)?,
        processed: row.get::<i64, _>("processed") as u64,
        total: row.get::<i64, _>("total") as u64,
        checkpoint: row.get("checkpoint"),
        stats: serde_json::from_str(&stats_json).map_err(json_err)?,
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        updated_at: row.get("updated_at"),
        finished_at: row.get("finished_at"),
    })
}

// ============ Unit-of-work helpers ============

async fn fetch_record(conn: &mut SqliteConnection, id: &str) -> Result<CanonicalRecord> {
    let sql = format!("SELECT {} FROM canonical_records r WHERE r.id = ?", RECORD_COLUMNS);
    sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(|row| record_from_row(&row))
        .ok_or_else(|| DedupError::not_found("canonical record", id))
}

async fn membership(conn: &mut SqliteConnection, chunk_id: &str) -> Result<Option<Membership>> {
    let sql = format!(
        r#"
        SELECT {cols}, 'canonical' AS role FROM canonical_records r
        WHERE r.canonical_chunk_id = ? AND r.retired_at IS NULL
        UNION ALL
        SELECT {cols}, 'variant' AS role FROM chunk_variants v
        JOIN canonical_records r ON r.id = v.canonical_record_id
        WHERE v.variant_chunk_id = ?
        LIMIT 1
        "#,
        cols = RECORD_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(chunk_id)
        .bind(chunk_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(row.map(|row| {
        let role: String = row.get("role");
        Membership {
            record: record_from_row(&row),
            role: if role == "canonical" {
                MembershipRole::Canonical
            } else {
                MembershipRole::Variant
            },
        }
    }))
}

/// NotFound if the chunk is missing, Validation if it is archived.
async fn require_live_chunk(conn: &mut SqliteConnection, id: &str) -> Result<Chunk> {
    let sql = format!("SELECT {} FROM chunks WHERE id = ?", CHUNK_COLUMNS);
    let chunk = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .map(|row| chunk_from_row(&row))
        .ok_or_else(|| DedupError::not_found("chunk", id))?;
    if chunk.archived {
        return Err(DedupError::validation(format!("chunk {} is archived", id)));
    }
    Ok(chunk)
}

async fn ensure_standalone(conn: &mut SqliteConnection, chunk_id: &str) -> Result<()> {
    match membership(conn, chunk_id).await? {
        Some(m) => Err(DedupError::conflict(format!(
            "chunk {} already belongs to canonical record {}",
            chunk_id, m.record.id
        ))),
        None => Ok(()),
    }
}

async fn insert_record(conn: &mut SqliteConnection, chunk: &Chunk, ts: i64) -> Result<CanonicalRecord> {
    let record = CanonicalRecord {
        id: uuid::Uuid::new_v4().to_string(),
        canonical_chunk_id: chunk.id.clone(),
        project: chunk.project.clone(),
        created_at: ts,
        updated_at: ts,
        merge_count: 1,
        retired_at: None,
    };
    sqlx::query(
        r#"
        INSERT INTO canonical_records (id, canonical_chunk_id, project, created_at, updated_at, merge_count)
        VALUES (?, ?, ?, ?, ?, 1)
        "#,
    )
    .bind(&record.id)
    .bind(&record.canonical_chunk_id)
    .bind(&record.project)
    .bind(ts)
    .bind(ts)
    .execute(&mut *conn)
    .await
    .map_err(unique_as(format!("chunk {} is already canonical", chunk.id)))?;
    Ok(record)
}

async fn insert_variant(
    conn: &mut SqliteConnection,
    record_id: &str,
    chunk_id: &str,
    relation: VariantRelation,
    similarity: f64,
    ts: i64,
) -> Result<ChunkVariant> {
    let variant = ChunkVariant {
        id: uuid::Uuid::new_v4().to_string(),
        canonical_record_id: record_id.to_string(),
        variant_chunk_id: chunk_id.to_string(),
        relationship: relation,
        similarity_score: similarity,
        merged_at: ts,
    };
    sqlx::query(
        r#"
        INSERT INTO chunk_variants (id, canonical_record_id, variant_chunk_id, relationship,
                                    similarity_score, merged_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&variant.id)
    .bind(record_id)
    .bind(chunk_id)
    .bind(relation.as_str())
    .bind(similarity)
    .bind(ts)
    .execute(&mut *conn)
    .await
    .map_err(unique_as(format!("chunk {} is already a variant", chunk_id)))?;
    Ok(variant)
}

/// Remove the chunk from its record: variants are dropped, a canonical
/// chunk hands over to its best variant or retires the record.
async fn drop_membership(conn: &mut SqliteConnection, chunk_id: &str, ts: i64) -> Result<()> {
    let variant_of: Option<String> = sqlx::query_scalar(
        "SELECT canonical_record_id FROM chunk_variants WHERE variant_chunk_id = ?",
    )
    .bind(chunk_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    if let Some(record_id) = variant_of {
        sqlx::query("DELETE FROM chunk_variants WHERE variant_chunk_id = ?")
            .bind(chunk_id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "UPDATE canonical_records SET merge_count = merge_count - 1, updated_at = ? WHERE id = ?",
        )
        .bind(ts)
        .bind(&record_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        return Ok(());
    }

    let canonical_of: Option<String> = sqlx::query_scalar(
        "SELECT id FROM canonical_records WHERE canonical_chunk_id = ? AND retired_at IS NULL",
    )
    .bind(chunk_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    let Some(record_id) = canonical_of else {
        return Ok(());
    };

    let heir: Option<String> = sqlx::query_scalar(
        r#"
        SELECT variant_chunk_id FROM chunk_variants
        WHERE canonical_record_id = ?
        ORDER BY similarity_score DESC, merged_at ASC, variant_chunk_id ASC
        LIMIT 1
        "#,
    )
    .bind(&record_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    match heir {
        Some(heir_id) => {
            sqlx::query("DELETE FROM chunk_variants WHERE variant_chunk_id = ?")
                .bind(&heir_id)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;
            sqlx::query(
                r#"
                UPDATE canonical_records
                SET canonical_chunk_id = ?, merge_count = merge_count - 1, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&heir_id)
            .bind(ts)
            .bind(&record_id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }
        None => {
            sqlx::query("UPDATE canonical_records SET retired_at = ?, updated_at = ? WHERE id = ?")
                .bind(ts)
                .bind(ts)
                .bind(&record_id)
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;
        }
    }
    Ok(())
}

/// Membership, links, and queued review of a chunk that is being archived.
async fn detach_archived(conn: &mut SqliteConnection, chunk_id: &str, ts: i64) -> Result<()> {
    drop_membership(conn, chunk_id, ts).await?;
    sqlx::query("DELETE FROM chunk_links WHERE source_chunk_id = ? OR target_chunk_id = ?")
        .bind(chunk_id)
        .bind(chunk_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    sqlx::query("DELETE FROM pending_reviews WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn archive(conn: &mut SqliteConnection, chunk_id: &str, ts: i64) -> Result<()> {
    sqlx::query("UPDATE chunks SET archived = 1 WHERE id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    detach_archived(conn, chunk_id, ts).await
}

async fn set_metadata_key(
    conn: &mut SqliteConnection,
    chunk_id: &str,
    key: &str,
    value: &serde_json::Value,
) -> Result<u64> {
    let value_json = serde_json::to_string(value).map_err(json_err)?;
    let result = sqlx::query(
        r#"
        UPDATE chunks
        SET metadata_json = json_set(
            CASE WHEN json_valid(metadata_json) THEN metadata_json ELSE '{}' END,
            '$."' || ? || '"',
            json(?)
        )
        WHERE id = ?
        "#,
    )
    .bind(key)
    .bind(value_json)
    .bind(chunk_id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected())
}

/// Why an update touching a chunk row matched nothing.
async fn explain_missing_chunk(conn: &mut SqliteConnection, id: &str) -> DedupError {
    let exists: std::result::Result<Option<bool>, sqlx::Error> =
        sqlx::query_scalar("SELECT archived FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await;
    match exists {
        Ok(Some(true)) => DedupError::validation(format!("chunk {} is archived", id)),
        Ok(_) => DedupError::not_found("chunk", id),
        Err(err) => db_err(err),
    }
}

async fn explain_closed_contradiction(conn: &mut SqliteConnection, id: &str) -> DedupError {
    let status: std::result::Result<Option<String>, sqlx::Error> =
        sqlx::query_scalar("SELECT status FROM contradictions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await;
    match status {
        Ok(Some(status)) => {
            DedupError::conflict(format!("contradiction {} is already {}", id, status))
        }
        Ok(None) => DedupError::not_found("contradiction", id),
        Err(err) => db_err(err),
    }
}

fn rank(matches: &mut Vec<(String, f64)>, limit: usize) {
    matches.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    matches.truncate(limit);
}

impl SqliteStore {
    async fn candidate_rows(&self, filter: &VectorFilter) -> Result<Vec<(String, Vec<f32>)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, embedding FROM chunks
            WHERE (? OR archived = 0) AND (? IS NULL OR project = ?)
            "#,
        )
        .bind(filter.include_archived)
        .bind(&filter.scope)
        .bind(&filter.scope)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (row.get("id"), decode_vector(&blob))
            })
            .collect())
    }

    async fn previews(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        Ok(self
            .get_chunks(ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), preview(&c.content)))
            .collect())
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        let metadata_json = serde_json::to_string(&chunk.metadata).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO chunks (id, content, embedding, source_document_id, source_location,
                                project, metadata_json, created_at, archived)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.content)
        .bind(encode_vector(&chunk.embedding))
        .bind(&chunk.source_document_id)
        .bind(&chunk.source_location)
        .bind(&chunk.project)
        .bind(metadata_json)
        .bind(chunk.created_at)
        .bind(chunk.archived)
        .execute(&self.pool)
        .await
        .map_err(unique_as(format!("chunk {} already exists", chunk.id)))?;
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let sql = format!("SELECT {} FROM chunks WHERE id = ?", CHUNK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|row| chunk_from_row(&row)))
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let mut found: HashMap<String, Chunk> = HashMap::new();
        for group in ids.chunks(IN_LIST_LIMIT) {
            let sql = format!(
                "SELECT {} FROM chunks WHERE id IN ({})",
                CHUNK_COLUMNS,
                placeholders(group.len())
            );
            let mut query = sqlx::query(&sql);
            for id in group {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await.map_err(db_err)? {
                let chunk = chunk_from_row(&row);
                found.insert(chunk.id.clone(), chunk);
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn archive_chunk(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let updated = sqlx::query("UPDATE chunks SET archived = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(DedupError::not_found("chunk", id));
        }
        detach_archived(&mut tx, id, now()).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn annotate_chunk(&self, id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        if set_metadata_key(&mut conn, id, key, &value).await? == 0 {
            return Err(DedupError::not_found("chunk", id));
        }
        Ok(())
    }

    async fn list_chunks_after(
        &self,
        cursor: Option<&str>,
        limit: usize,
        scope: Option<&str>,
    ) -> Result<Vec<Chunk>> {
        let sql = format!(
            r#"
            SELECT {} FROM chunks
            WHERE archived = 0 AND (? IS NULL OR id > ?) AND (? IS NULL OR project = ?)
            ORDER BY id ASC
            LIMIT ?
            "#,
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cursor)
            .bind(cursor)
            .bind(scope)
            .bind(scope)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn count_chunks(&self, scope: Option<&str>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE archived = 0 AND (? IS NULL OR project = ?)",
        )
        .bind(scope)
        .bind(scope)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        filter: &VectorFilter,
    ) -> Result<Vec<SimilarityMatch>> {
        let mut results = self
            .vector_search_batch(&[embedding.to_vec()], filter)
            .await?;
        Ok(results.pop().unwrap_or_default())
    }

    async fn vector_search_batch(
        &self,
        embeddings: &[Vec<f32>],
        filter: &VectorFilter,
    ) -> Result<Vec<Vec<SimilarityMatch>>> {
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.candidate_rows(filter).await?;

        let mut ranked: Vec<Vec<(String, f64)>> = vec![Vec::new(); embeddings.len()];
        for (id, vector) in &rows {
            for (i, query) in embeddings.iter().enumerate() {
                let score = similarity_score(query, vector);
                if score >= filter.threshold {
                    ranked[i].push((id.clone(), score));
                }
            }
        }
        for matches in ranked.iter_mut() {
            rank(matches, filter.limit);
        }

        let wanted: Vec<String> = ranked
            .iter()
            .flatten()
            .map(|(id, _)| id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let previews = self.previews(&wanted).await?;

        Ok(ranked
            .into_iter()
            .map(|matches| {
                matches
                    .into_iter()
                    .map(|(id, score)| SimilarityMatch {
                        preview: previews.get(&id).cloned().unwrap_or_default(),
                        chunk_id: id,
                        score,
                    })
                    .collect()
            })
            .collect())
    }
}

#[async_trait]
impl CanonicalStore for SqliteStore {
    async fn create_canonical(&self, chunk_id: &str) -> Result<CanonicalRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ts = now();
        let record_id = uuid::Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            r#"
            INSERT INTO canonical_records (id, canonical_chunk_id, project, created_at, updated_at, merge_count)
            SELECT ?, id, project, ?, ?, 1 FROM chunks WHERE id = ? AND archived = 0
            "#,
        )
        .bind(&record_id)
        .bind(ts)
        .bind(ts)
        .bind(chunk_id)
        .execute(&mut *tx)
        .await
        .map_err(unique_as(format!("chunk {} is already canonical", chunk_id)))?;
        if inserted.rows_affected() == 0 {
            return Err(explain_missing_chunk(&mut tx, chunk_id).await);
        }

        let variant_of: Option<String> = sqlx::query_scalar(
            "SELECT canonical_record_id FROM chunk_variants WHERE variant_chunk_id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if let Some(existing) = variant_of {
            return Err(DedupError::conflict(format!(
                "chunk {} already belongs to canonical record {}",
                chunk_id, existing
            )));
        }

        let record = fetch_record(&mut tx, &record_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn get_canonical(&self, id: &str) -> Result<Option<CanonicalRecord>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        match fetch_record(&mut conn, id).await {
            Ok(record) => Ok(Some(record)),
            Err(DedupError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn merge_variant(
        &self,
        canonical_id: &str,
        variant_chunk_id: &str,
        relation: VariantRelation,
        similarity: f64,
    ) -> Result<ChunkVariant> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ts = now();
        let bumped = sqlx::query(
            r#"
            UPDATE canonical_records SET merge_count = merge_count + 1, updated_at = ?
            WHERE id = ? AND retired_at IS NULL
            "#,
        )
        .bind(ts)
        .bind(canonical_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if bumped.rows_affected() == 0 {
            return Err(DedupError::not_found("canonical record", canonical_id));
        }
        require_live_chunk(&mut tx, variant_chunk_id).await?;
        ensure_standalone(&mut tx, variant_chunk_id).await?;
        let variant =
            insert_variant(&mut tx, canonical_id, variant_chunk_id, relation, similarity, ts)
                .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(variant)
    }

    async fn get_membership(&self, chunk_id: &str) -> Result<Option<Membership>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        membership(&mut conn, chunk_id).await
    }

    async fn get_memberships(&self, chunk_ids: &[String]) -> Result<HashMap<String, Membership>> {
        let mut out = HashMap::new();
        for group in chunk_ids.chunks(IN_LIST_LIMIT) {
            let marks = placeholders(group.len());
            let sql = format!(
                r#"
                SELECT {cols}, r.canonical_chunk_id AS member_id, 'canonical' AS role
                FROM canonical_records r
                WHERE r.retired_at IS NULL AND r.canonical_chunk_id IN ({marks})
                UNION ALL
                SELECT {cols}, v.variant_chunk_id AS member_id, 'variant' AS role
                FROM chunk_variants v JOIN canonical_records r ON r.id = v.canonical_record_id
                WHERE v.variant_chunk_id IN ({marks})
                "#,
                cols = RECORD_COLUMNS,
                marks = marks
            );
            let mut query = sqlx::query(&sql);
            for id in group.iter().chain(group.iter()) {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await.map_err(db_err)? {
                let role: String = row.get("role");
                let member_id: String = row.get("member_id");
                out.insert(
                    member_id,
                    Membership {
                        record: record_from_row(&row),
                        role: if role == "canonical" {
                            MembershipRole::Canonical
                        } else {
                            MembershipRole::Variant
                        },
                    },
                );
            }
        }
        Ok(out)
    }

    async fn get_variants(&self, canonical_id: &str) -> Result<Vec<ChunkVariant>> {
        let rows = sqlx::query(
            r#"
            SELECT id, canonical_record_id, variant_chunk_id, relationship, similarity_score, merged_at
            FROM chunk_variants WHERE canonical_record_id = ?
            ORDER BY merged_at ASC, variant_chunk_id ASC
            "#,
        )
        .bind(canonical_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(variant_from_row).collect()
    }

    async fn promote_variant(
        &self,
        canonical_id: &str,
        new_canonical_chunk_id: &str,
    ) -> Result<CanonicalRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ts = now();
        let touched = sqlx::query(
            "UPDATE canonical_records SET updated_at = ? WHERE id = ? AND retired_at IS NULL",
        )
        .bind(ts)
        .bind(canonical_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if touched.rows_affected() == 0 {
            return Err(DedupError::not_found("canonical record", canonical_id));
        }
        let old_canonical = fetch_record(&mut tx, canonical_id).await?.canonical_chunk_id;

        let similarity: Option<f64> = sqlx::query_scalar(
            "SELECT similarity_score FROM chunk_variants WHERE variant_chunk_id = ? AND canonical_record_id = ?",
        )
        .bind(new_canonical_chunk_id)
        .bind(canonical_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(similarity) = similarity else {
            return Err(DedupError::validation(format!(
                "chunk {} is not a variant of canonical record {}",
                new_canonical_chunk_id, canonical_id
            )));
        };

        sqlx::query("DELETE FROM chunk_variants WHERE variant_chunk_id = ?")
            .bind(new_canonical_chunk_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE canonical_records SET canonical_chunk_id = ? WHERE id = ?")
            .bind(new_canonical_chunk_id)
            .bind(canonical_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        insert_variant(
            &mut tx,
            canonical_id,
            &old_canonical,
            VariantRelation::Demoted,
            similarity,
            ts,
        )
        .await?;

        let record = fetch_record(&mut tx, canonical_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn absorb_subset(
        &self,
        subset_chunk_id: &str,
        superset_chunk_id: &str,
        similarity: f64,
    ) -> Result<Absorption> {
        if subset_chunk_id == superset_chunk_id {
            return Err(DedupError::validation("a chunk cannot absorb itself"));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ts = now();
        // Bumps the subset's record when it has one; matches nothing otherwise.
        sqlx::query(
            r#"
            UPDATE canonical_records SET merge_count = merge_count + 1, updated_at = ?
            WHERE retired_at IS NULL AND id IN (
                SELECT canonical_record_id FROM chunk_variants WHERE variant_chunk_id = ?
                UNION ALL
                SELECT id FROM canonical_records WHERE canonical_chunk_id = ?
            )
            "#,
        )
        .bind(ts)
        .bind(subset_chunk_id)
        .bind(subset_chunk_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        require_live_chunk(&mut tx, subset_chunk_id).await?;
        let superset = require_live_chunk(&mut tx, superset_chunk_id).await?;
        ensure_standalone(&mut tx, superset_chunk_id).await?;

        let absorption = match membership(&mut tx, subset_chunk_id).await? {
            None => {
                let record = insert_record(&mut tx, &superset, ts).await?;
                sqlx::query("UPDATE canonical_records SET merge_count = merge_count + 1 WHERE id = ?")
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                insert_variant(
                    &mut tx,
                    &record.id,
                    subset_chunk_id,
                    VariantRelation::Subset,
                    similarity,
                    ts,
                )
                .await?;
                Absorption {
                    record,
                    variant_chunk_id: subset_chunk_id.to_string(),
                    created: true,
                    demoted: false,
                }
            }
            Some(Membership {
                record,
                role: MembershipRole::Canonical,
            }) => {
                sqlx::query("UPDATE canonical_records SET canonical_chunk_id = ? WHERE id = ?")
                    .bind(superset_chunk_id)
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                insert_variant(
                    &mut tx,
                    &record.id,
                    subset_chunk_id,
                    VariantRelation::Demoted,
                    similarity,
                    ts,
                )
                .await?;
                Absorption {
                    record,
                    variant_chunk_id: subset_chunk_id.to_string(),
                    created: false,
                    demoted: true,
                }
            }
            Some(Membership {
                record,
                role: MembershipRole::Variant,
            }) => {
                insert_variant(
                    &mut tx,
                    &record.id,
                    superset_chunk_id,
                    VariantRelation::Subset,
                    similarity,
                    ts,
                )
                .await?;
                Absorption {
                    record,
                    variant_chunk_id: superset_chunk_id.to_string(),
                    created: false,
                    demoted: false,
                }
            }
        };
        let record = fetch_record(&mut tx, &absorption.record.id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(Absorption {
            record,
            ..absorption
        })
    }

    async fn detach_variant(&self, variant_chunk_id: &str) -> Result<CanonicalRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ts = now();
        let updated = sqlx::query(
            r#"
            UPDATE canonical_records SET merge_count = merge_count - 1, updated_at = ?
            WHERE id = (SELECT canonical_record_id FROM chunk_variants WHERE variant_chunk_id = ?)
            "#,
        )
        .bind(ts)
        .bind(variant_chunk_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(DedupError::not_found("variant", variant_chunk_id));
        }
        let record_id: String = sqlx::query_scalar(
            "SELECT canonical_record_id FROM chunk_variants WHERE variant_chunk_id = ?",
        )
        .bind(variant_chunk_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("DELETE FROM chunk_variants WHERE variant_chunk_id = ?")
            .bind(variant_chunk_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let record = fetch_record(&mut tx, &record_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn supersede(
        &self,
        outdated_chunk_id: &str,
        replacement_chunk_id: &str,
    ) -> Result<CanonicalRecord> {
        if outdated_chunk_id == replacement_chunk_id {
            return Err(DedupError::validation("a chunk cannot supersede itself"));
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ts = now();
        let archived = sqlx::query("UPDATE chunks SET archived = 1 WHERE id = ? AND archived = 0")
            .bind(outdated_chunk_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if archived.rows_affected() == 0 {
            return Err(explain_missing_chunk(&mut tx, outdated_chunk_id).await);
        }
        let replacement = require_live_chunk(&mut tx, replacement_chunk_id).await?;
        let outdated = membership(&mut tx, outdated_chunk_id).await?;

        let record_id = if let Some(member) = membership(&mut tx, replacement_chunk_id).await? {
            if let Some(old) = &outdated {
                if old.record.id == member.record.id && old.role == MembershipRole::Canonical {
                    // Hand the record to the replacement before archiving.
                    sqlx::query("DELETE FROM chunk_variants WHERE variant_chunk_id = ?")
                        .bind(replacement_chunk_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                    sqlx::query(
                        r#"
                        UPDATE canonical_records
                        SET canonical_chunk_id = ?, merge_count = merge_count - 1, updated_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(replacement_chunk_id)
                    .bind(ts)
                    .bind(&member.record.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                }
            }
            member.record.id
        } else {
            match outdated {
                Some(Membership {
                    record,
                    role: MembershipRole::Canonical,
                }) => {
                    sqlx::query(
                        "UPDATE canonical_records SET canonical_chunk_id = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(replacement_chunk_id)
                    .bind(ts)
                    .bind(&record.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    record.id
                }
                Some(Membership {
                    record,
                    role: MembershipRole::Variant,
                }) => {
                    let similarity: Option<f64> = sqlx::query_scalar(
                        "SELECT similarity_score FROM chunk_variants WHERE variant_chunk_id = ?",
                    )
                    .bind(outdated_chunk_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    sqlx::query("DELETE FROM chunk_variants WHERE variant_chunk_id = ?")
                        .bind(outdated_chunk_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                    insert_variant(
                        &mut tx,
                        &record.id,
                        replacement_chunk_id,
                        VariantRelation::Superseding,
                        similarity.unwrap_or(1.0),
                        ts,
                    )
                    .await?;
                    sqlx::query("UPDATE canonical_records SET updated_at = ? WHERE id = ?")
                        .bind(ts)
                        .bind(&record.id)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?;
                    record.id
                }
                None => insert_record(&mut tx, &replacement, ts).await?.id,
            }
        };

        detach_archived(&mut tx, outdated_chunk_id, ts).await?;
        let record = fetch_record(&mut tx, &record_id).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn create_link(&self, link: &ChunkLink) -> Result<ChunkLink> {
        let key = pair_key(&link.source_chunk_id, &link.target_chunk_id);
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO chunk_links (id, source_chunk_id, target_chunk_id, pair_key,
                                     relationship_type, similarity_score, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pair_key) DO NOTHING
            "#,
        )
        .bind(&link.id)
        .bind(&link.source_chunk_id)
        .bind(&link.target_chunk_id)
        .bind(&key)
        .bind(link.relationship.as_str())
        .bind(link.similarity_score)
        .bind(link.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        require_live_chunk(&mut tx, &link.source_chunk_id).await?;
        require_live_chunk(&mut tx, &link.target_chunk_id).await?;

        let row = sqlx::query(
            r#"
            SELECT id, source_chunk_id, target_chunk_id, relationship_type, similarity_score, created_at
            FROM chunk_links WHERE pair_key = ?
            "#,
        )
        .bind(&key)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let stored = link_from_row(&row)?;
        tx.commit().await.map_err(db_err)?;
        Ok(stored)
    }

    async fn get_links(&self, chunk_id: &str) -> Result<Vec<ChunkLink>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_chunk_id, target_chunk_id, relationship_type, similarity_score, created_at
            FROM chunk_links WHERE source_chunk_id = ? OR target_chunk_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(chunk_id)
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(link_from_row).collect()
    }

    async fn record_provenance(&self, provenance: &ChunkProvenance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_provenance (id, chunk_id, source_document_id, source_location,
                                          ingested_at, verified_at, verified_by)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&provenance.id)
        .bind(&provenance.chunk_id)
        .bind(&provenance.source_document_id)
        .bind(&provenance.source_location)
        .bind(provenance.ingested_at)
        .bind(provenance.verified_at)
        .bind(&provenance.verified_by)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_provenance(&self, canonical_id: &str) -> Result<Vec<ChunkProvenance>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        fetch_record(&mut conn, canonical_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT id, chunk_id, source_document_id, source_location, ingested_at, verified_at, verified_by
            FROM chunk_provenance
            WHERE chunk_id IN (
                SELECT canonical_chunk_id FROM canonical_records WHERE id = ?
                UNION
                SELECT variant_chunk_id FROM chunk_variants WHERE canonical_record_id = ?
            )
            ORDER BY ingested_at ASC, id ASC
            "#,
        )
        .bind(canonical_id)
        .bind(canonical_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(provenance_from_row).collect())
    }
}

impl SqliteStore {
    async fn open_contradiction_for_pair(&self, key: &str) -> Result<Option<Contradiction>> {
        let sql = format!(
            "SELECT {} FROM contradictions c WHERE c.pair_key = ? AND c.status IN {}",
            CONTRADICTION_COLUMNS, OPEN_STATUSES
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(contradiction_from_row).transpose()
    }
}

#[async_trait]
impl ContradictionStore for SqliteStore {
    async fn flag_contradiction(
        &self,
        contradiction: &Contradiction,
    ) -> Result<(Contradiction, bool)> {
        let key = pair_key(&contradiction.chunk_a_id, &contradiction.chunk_b_id);
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO contradictions (id, chunk_a_id, chunk_b_id, pair_key, description, severity,
                                        status, resolution_action, resolution_notes, resolved_by,
                                        preferred_chunk_id, detected_at, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, ?, NULL)
            "#,
        )
        .bind(&contradiction.id)
        .bind(&contradiction.chunk_a_id)
        .bind(&contradiction.chunk_b_id)
        .bind(&key)
        .bind(&contradiction.description)
        .bind(contradiction.severity.as_str())
        .bind(ContradictionStatus::Pending.as_str())
        .bind(contradiction.detected_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                drop(tx);
                return match self.open_contradiction_for_pair(&key).await? {
                    Some(existing) => Ok((existing, false)),
                    None => Err(DedupError::conflict(format!(
                        "contradiction {} already exists",
                        contradiction.id
                    ))),
                };
            }
            Err(err) => return Err(db_err(err)),
        }

        require_live_chunk(&mut tx, &contradiction.chunk_a_id).await?;
        require_live_chunk(&mut tx, &contradiction.chunk_b_id).await?;
        tx.commit().await.map_err(db_err)?;

        let mut stored = contradiction.clone();
        stored.status = ContradictionStatus::Pending;
        Ok((stored, true))
    }

    async fn get_contradiction(&self, id: &str) -> Result<Option<Contradiction>> {
        let sql = format!(
            "SELECT {} FROM contradictions c WHERE c.id = ?",
            CONTRADICTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(contradiction_from_row).transpose()
    }

    async fn list_contradictions(
        &self,
        status: Option<ContradictionStatus>,
        scope: Option<&str>,
    ) -> Result<Vec<Contradiction>> {
        let sql = format!(
            r#"
            SELECT {} FROM contradictions c
            LEFT JOIN chunks a ON a.id = c.chunk_a_id
            WHERE (? IS NULL OR c.status = ?) AND (? IS NULL OR a.project = ?)
            ORDER BY c.detected_at ASC, c.id ASC
            "#,
            CONTRADICTION_COLUMNS
        );
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(&sql)
            .bind(status)
            .bind(status)
            .bind(scope)
            .bind(scope)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(contradiction_from_row).collect()
    }

    async fn contradictions_for_chunk(&self, chunk_id: &str) -> Result<Vec<Contradiction>> {
        let sql = format!(
            r#"
            SELECT {} FROM contradictions c
            WHERE c.chunk_a_id = ? OR c.chunk_b_id = ?
            ORDER BY c.detected_at ASC, c.id ASC
            "#,
            CONTRADICTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(chunk_id)
            .bind(chunk_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(contradiction_from_row).collect()
    }

    async fn chunks_with_open_contradictions(
        &self,
        chunk_ids: &[String],
    ) -> Result<HashSet<String>> {
        let mut flagged = HashSet::new();
        for group in chunk_ids.chunks(IN_LIST_LIMIT) {
            let marks = placeholders(group.len());
            let sql = format!(
                r#"
                SELECT chunk_a_id AS chunk_id FROM contradictions
                WHERE status IN {open} AND chunk_a_id IN ({marks})
                UNION
                SELECT chunk_b_id FROM contradictions
                WHERE status IN {open} AND chunk_b_id IN ({marks})
                "#,
                open = OPEN_STATUSES,
                marks = marks
            );
            let mut query = sqlx::query_scalar::<_, String>(&sql);
            for id in group.iter().chain(group.iter()) {
                query = query.bind(id);
            }
            flagged.extend(query.fetch_all(&self.pool).await.map_err(db_err)?);
        }
        Ok(flagged)
    }

    async fn mark_in_review(&self, id: &str) -> Result<Contradiction> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let sql = format!(
            "UPDATE contradictions SET status = 'in_review' WHERE id = ? AND status IN {}",
            OPEN_STATUSES
        );
        let updated = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(explain_closed_contradiction(&mut conn, id).await);
        }
        drop(conn);
        self.get_contradiction(id)
            .await?
            .ok_or_else(|| DedupError::not_found("contradiction", id))
    }

    async fn resolve_contradiction(
        &self,
        id: &str,
        resolution: &Resolution,
    ) -> Result<Contradiction> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let ts = now();
        let status = if resolution.action == ResolutionAction::Dismiss {
            ContradictionStatus::Dismissed
        } else {
            ContradictionStatus::Resolved
        };
        let sql = format!(
            r#"
            UPDATE contradictions
            SET status = ?, resolution_action = ?, resolution_notes = ?, resolved_by = ?,
                preferred_chunk_id = ?, resolved_at = ?
            WHERE id = ? AND status IN {}
            "#,
            OPEN_STATUSES
        );
        let updated = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(resolution.action.as_str())
            .bind(&resolution.notes)
            .bind(&resolution.resolved_by)
            .bind(&resolution.preferred_id)
            .bind(ts)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(explain_closed_contradiction(&mut tx, id).await);
        }

        let (chunk_a, chunk_b): (String, String) =
            sqlx::query_as("SELECT chunk_a_id, chunk_b_id FROM contradictions WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
        for chunk_id in [&chunk_a, &chunk_b] {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM chunks WHERE id = ?")
                .bind(chunk_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            if exists.is_none() {
                return Err(DedupError::not_found("chunk", chunk_id.as_str()));
            }
        }

        match resolution.action {
            ResolutionAction::KeepA => archive(&mut tx, &chunk_b, ts).await?,
            ResolutionAction::KeepB => archive(&mut tx, &chunk_a, ts).await?,
            ResolutionAction::ArchiveBoth => {
                archive(&mut tx, &chunk_a, ts).await?;
                archive(&mut tx, &chunk_b, ts).await?;
            }
            ResolutionAction::KeepBoth => {
                let note = serde_json::json!({
                    "contradiction_id": id,
                    "notes": resolution.notes,
                    "resolved_by": resolution.resolved_by,
                });
                for chunk_id in [&chunk_a, &chunk_b] {
                    set_metadata_key(&mut tx, chunk_id, "disambiguation", &note).await?;
                }
            }
            ResolutionAction::Merge | ResolutionAction::Dismiss => {}
        }

        tx.commit().await.map_err(db_err)?;
        self.get_contradiction(id)
            .await?
            .ok_or_else(|| DedupError::not_found("contradiction", id))
    }

    async fn contradiction_stats(&self, scope: Option<&str>) -> Result<ContradictionStats> {
        let rows = sqlx::query(
            r#"
            SELECT c.status, c.severity, c.resolution_action, COUNT(*) AS n
            FROM contradictions c
            LEFT JOIN chunks a ON a.id = c.chunk_a_id
            WHERE (? IS NULL OR a.project = ?)
            GROUP BY c.status, c.severity, c.resolution_action
            "#,
        )
        .bind(scope)
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stats = ContradictionStats::default();
        for row in &rows {
            let n = row.get::<i64, _>("n") as u64;
            let status: String = row.get("status");
            let severity: String = row.get("severity");
            let action: Option<String> = row.get("resolution_action");
            stats.total += n;
            *stats.by_status.entry(status).or_default() += n;
            *stats.by_severity.entry(severity).or_default() += n;
            if let Some(action) = action {
                *stats.by_action.entry(action).or_default() += n;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl ReviewStore for SqliteStore {
    async fn enqueue_review(&self, review: &PendingReview) -> Result<()> {
        let candidates_json = serde_json::to_string(&review.candidates).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO pending_reviews (id, chunk_id, project, candidates_json, reason, queued_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&review.id)
        .bind(&review.chunk_id)
        .bind(&review.project)
        .bind(candidates_json)
        .bind(&review.reason)
        .bind(review.queued_at)
        .execute(&self.pool)
        .await
        .map_err(unique_as(format!(
            "chunk {} is already queued for review",
            review.chunk_id
        )))?;
        Ok(())
    }

    async fn get_review(&self, id: &str) -> Result<Option<PendingReview>> {
        let row = sqlx::query(
            "SELECT id, chunk_id, project, candidates_json, reason, queued_at FROM pending_reviews WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(review_from_row).transpose()
    }

    async fn review_for_chunk(&self, chunk_id: &str) -> Result<Option<PendingReview>> {
        let row = sqlx::query(
            "SELECT id, chunk_id, project, candidates_json, reason, queued_at FROM pending_reviews WHERE chunk_id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(review_from_row).transpose()
    }

    async fn list_reviews(&self, scope: Option<&str>) -> Result<Vec<PendingReview>> {
        let rows = sqlx::query(
            r#"
            SELECT id, chunk_id, project, candidates_json, reason, queued_at FROM pending_reviews
            WHERE (? IS NULL OR project = ?)
            ORDER BY queued_at ASC, id ASC
            "#,
        )
        .bind(scope)
        .bind(scope)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(review_from_row).collect()
    }

    async fn take_review(&self, id: &str) -> Result<Option<PendingReview>> {
        let row = sqlx::query(
            r#"
            DELETE FROM pending_reviews WHERE id = ?
            RETURNING id, chunk_id, project, candidates_json, reason, queued_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(review_from_row).transpose()
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: &BatchJob) -> Result<()> {
        let options_json = serde_json::to_string(&job.options).map_err(json_err)?;
        let stats_json = serde_json::to_string(&job.stats).map_err(json_err)?;
        sqlx::query(
            r#"
            INSERT INTO batch_jobs (id, state, options_json, processed, total, checkpoint, stats_json,
                                    error, created_at, started_at, updated_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.state.as_str())
        .bind(options_json)
        .bind(job.processed as i64)
        .bind(job.total as i64)
        .bind(&job.checkpoint)
        .bind(stats_json)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(unique_as(format!("job {} already exists", job.id)))?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<BatchJob>> {
        let sql = format!("SELECT {} FROM batch_jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<BatchJob>> {
        let sql = format!(
            r#"
            SELECT {} FROM batch_jobs
            WHERE (? IS NULL OR state = ?)
            ORDER BY created_at DESC, id ASC
            LIMIT ?
            "#,
            JOB_COLUMNS
        );
        let state = filter.state.map(|s| s.as_str());
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = sqlx::query(&sql)
            .bind(state)
            .bind(state)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn save_job(&self, job: &BatchJob, expected: JobState) -> Result<bool> {
        let options_json = serde_json::to_string(&job.options).map_err(json_err)?;
        let stats_json = serde_json::to_string(&job.stats).map_err(json_err)?;
        let updated = sqlx::query(
            r#"
            UPDATE batch_jobs
            SET state = ?, options_json = ?, processed = ?, total = ?, checkpoint = ?,
                stats_json = ?, error = ?, started_at = ?, updated_at = ?, finished_at = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(job.state.as_str())
        .bind(options_json)
        .bind(job.processed as i64)
        .bind(job.total as i64)
        .bind(&job.checkpoint)
        .bind(stats_json)
        .bind(&job.error)
        .bind(job.started_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .bind(&job.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_job(&job.id).await? {
            Some(_) => Ok(false),
            None => Err(DedupError::not_found("job", &job.id)),
        }
    }
}
