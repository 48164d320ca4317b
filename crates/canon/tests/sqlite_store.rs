//! Contract tests for `SqliteStore`, mirroring the in-memory backend.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

use canon::sqlite_store::SqliteStore;
use canon_core::job::{BatchJob, JobFilter, JobState};
use canon_core::models::{
    Chunk, ChunkLink, Contradiction, ContradictionStatus, MembershipRole, PendingReview,
    RelationshipType, Resolution, ResolutionAction, ReviewCandidate, Severity, VariantRelation,
};
use canon_core::store::{
    CanonicalStore, ChunkStore, ContradictionStore, JobStore, ReviewStore, VectorFilter,
};
use canon_core::DedupError;

async fn open_store() -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("canon.sqlite");
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .unwrap();
    canon::migrate::apply(&pool).await.unwrap();
    (tmp, SqliteStore::new(pool))
}

fn chunk(id: &str, embedding: Vec<f32>) -> Chunk {
    let mut c = Chunk::new(format!("content of {}", id), embedding);
    c.id = id.to_string();
    c
}

async fn seeded(ids: &[&str]) -> (TempDir, SqliteStore) {
    let (tmp, store) = open_store().await;
    for (i, id) in ids.iter().enumerate() {
        store
            .insert_chunk(&chunk(id, vec![1.0, i as f32 * 0.01]))
            .await
            .unwrap();
    }
    (tmp, store)
}

fn filter(threshold: f64) -> VectorFilter {
    VectorFilter {
        threshold,
        limit: 10,
        scope: None,
        include_archived: false,
    }
}

fn contradiction(id: &str, a: &str, b: &str) -> Contradiction {
    Contradiction {
        id: id.to_string(),
        chunk_a_id: a.to_string(),
        chunk_b_id: b.to_string(),
        description: "disagree on the default port".to_string(),
        severity: Severity::High,
        status: ContradictionStatus::Pending,
        resolution_action: None,
        resolution_notes: None,
        resolved_by: None,
        preferred_chunk_id: None,
        detected_at: 1_700_000_000,
        resolved_at: None,
    }
}

#[tokio::test]
async fn chunk_round_trip_keeps_embedding_and_metadata() {
    let (_tmp, store) = open_store().await;
    let mut c = chunk("a", vec![0.25, -0.5, 1.0]);
    c.project = Some("docs".into());
    c.source_document_id = Some("handbook.md".into());
    c.metadata = serde_json::json!({"lang": "en"});
    store.insert_chunk(&c).await.unwrap();

    let loaded = store.get_chunk("a").await.unwrap().unwrap();
    assert_eq!(loaded, c);

    let err = store.insert_chunk(&c).await.unwrap_err();
    assert!(matches!(err, DedupError::Conflict(_)));
    assert!(store.get_chunk("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn annotate_sets_one_metadata_key() {
    let (_tmp, store) = seeded(&["a"]).await;
    store
        .annotate_chunk("a", "reviewed", serde_json::json!(true))
        .await
        .unwrap();
    store
        .annotate_chunk("a", "owner", serde_json::json!("ops"))
        .await
        .unwrap();
    let loaded = store.get_chunk("a").await.unwrap().unwrap();
    assert_eq!(loaded.metadata["reviewed"], true);
    assert_eq!(loaded.metadata["owner"], "ops");
}

#[tokio::test]
async fn merge_then_lookup_variant() {
    let (_tmp, store) = seeded(&["a", "b"]).await;
    let record = store.create_canonical("a").await.unwrap();
    assert_eq!(record.merge_count, 1);
    assert!(matches!(
        store.create_canonical("a").await.unwrap_err(),
        DedupError::Conflict(_)
    ));

    store
        .merge_variant(&record.id, "b", VariantRelation::Equivalent, 0.97)
        .await
        .unwrap();
    let membership = store.get_membership("b").await.unwrap().unwrap();
    assert_eq!(membership.role, MembershipRole::Variant);
    assert_eq!(membership.record.id, record.id);
    assert_eq!(membership.record.merge_count, 2);

    let memberships = store
        .get_memberships(&["a".to_string(), "b".to_string(), "zzz".to_string()])
        .await
        .unwrap();
    assert_eq!(memberships.len(), 2);
    assert_eq!(memberships["a"].role, MembershipRole::Canonical);
}

#[tokio::test]
async fn canonical_chunk_cannot_become_variant_elsewhere() {
    let (_tmp, store) = seeded(&["a", "b"]).await;
    let ra = store.create_canonical("a").await.unwrap();
    store.create_canonical("b").await.unwrap();
    let err = store
        .merge_variant(&ra.id, "b", VariantRelation::Equivalent, 0.99)
        .await
        .unwrap_err();
    assert!(matches!(err, DedupError::Conflict(_)));
    assert_eq!(
        store.get_canonical(&ra.id).await.unwrap().unwrap().merge_count,
        1
    );
}

#[tokio::test]
async fn promote_swaps_roles_and_keeps_count() {
    let (_tmp, store) = seeded(&["a", "b", "c"]).await;
    let record = store.create_canonical("a").await.unwrap();
    store
        .merge_variant(&record.id, "b", VariantRelation::Equivalent, 0.96)
        .await
        .unwrap();
    store
        .merge_variant(&record.id, "c", VariantRelation::Equivalent, 0.95)
        .await
        .unwrap();

    let promoted = store.promote_variant(&record.id, "b").await.unwrap();
    assert_eq!(promoted.canonical_chunk_id, "b");
    assert_eq!(promoted.merge_count, 3);

    let variants = store.get_variants(&record.id).await.unwrap();
    let demoted = variants.iter().find(|v| v.variant_chunk_id == "a").unwrap();
    assert_eq!(demoted.relationship, VariantRelation::Demoted);
    assert!(variants.iter().all(|v| v.variant_chunk_id != "b"));
}

#[tokio::test]
async fn detach_restores_standalone() {
    let (_tmp, store) = seeded(&["a", "b"]).await;
    let record = store.create_canonical("a").await.unwrap();
    store
        .merge_variant(&record.id, "b", VariantRelation::Subset, 0.9)
        .await
        .unwrap();
    let record = store.detach_variant("b").await.unwrap();
    assert_eq!(record.merge_count, 1);
    assert!(store.get_membership("b").await.unwrap().is_none());
    assert!(matches!(
        store.detach_variant("b").await.unwrap_err(),
        DedupError::NotFound { .. }
    ));
}

#[tokio::test]
async fn archiving_canonical_hands_record_to_best_variant() {
    let (_tmp, store) = seeded(&["a", "b", "c"]).await;
    let record = store.create_canonical("a").await.unwrap();
    store
        .merge_variant(&record.id, "b", VariantRelation::Equivalent, 0.91)
        .await
        .unwrap();
    store
        .merge_variant(&record.id, "c", VariantRelation::Equivalent, 0.99)
        .await
        .unwrap();

    store.archive_chunk("a").await.unwrap();
    store.archive_chunk("a").await.unwrap();

    let record = store.get_canonical(&record.id).await.unwrap().unwrap();
    assert_eq!(record.canonical_chunk_id, "c");
    assert_eq!(record.merge_count, 2);
    assert!(store.get_membership("a").await.unwrap().is_none());
    assert!(store.get_chunk("a").await.unwrap().unwrap().archived);
}

#[tokio::test]
async fn archiving_lone_canonical_retires_record() {
    let (_tmp, store) = seeded(&["a"]).await;
    let record = store.create_canonical("a").await.unwrap();
    store.archive_chunk("a").await.unwrap();
    let record = store.get_canonical(&record.id).await.unwrap().unwrap();
    assert!(record.retired_at.is_some());
    assert!(store.get_membership("a").await.unwrap().is_none());
    let hits = store.vector_search(&[1.0, 0.0], &filter(0.0)).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn supersede_canonical_keeps_variants() {
    let (_tmp, store) = seeded(&["old", "dup", "new"]).await;
    let record = store.create_canonical("old").await.unwrap();
    store
        .merge_variant(&record.id, "dup", VariantRelation::Equivalent, 0.99)
        .await
        .unwrap();
    let updated = store.supersede("old", "new").await.unwrap();
    assert_eq!(updated.id, record.id);
    assert_eq!(updated.canonical_chunk_id, "new");
    assert_eq!(updated.merge_count, 2);
    assert!(store.get_chunk("old").await.unwrap().unwrap().archived);
}

#[tokio::test]
async fn supersede_standalone_creates_record_for_replacement() {
    let (_tmp, store) = seeded(&["old", "new"]).await;
    let record = store.supersede("old", "new").await.unwrap();
    assert_eq!(record.canonical_chunk_id, "new");
    assert_eq!(record.merge_count, 1);
    assert!(store.get_chunk("old").await.unwrap().unwrap().archived);
}

#[tokio::test]
async fn links_are_unique_per_unordered_pair() {
    let (_tmp, store) = seeded(&["a", "b"]).await;
    let first = ChunkLink {
        id: "l-1".into(),
        source_chunk_id: "a".into(),
        target_chunk_id: "b".into(),
        relationship: RelationshipType::Complementary,
        similarity_score: 0.88,
        created_at: 1_700_000_000,
    };
    let stored = store.create_link(&first).await.unwrap();
    assert_eq!(stored.id, "l-1");

    let reversed = ChunkLink {
        id: "l-2".into(),
        source_chunk_id: "b".into(),
        target_chunk_id: "a".into(),
        ..first.clone()
    };
    let again = store.create_link(&reversed).await.unwrap();
    assert_eq!(again.id, "l-1");
    assert_eq!(store.get_links("b").await.unwrap().len(), 1);
}

#[tokio::test]
async fn open_contradiction_is_deduplicated_per_pair() {
    let (_tmp, store) = seeded(&["a", "b"]).await;
    let (first, created) = store
        .flag_contradiction(&contradiction("k-1", "a", "b"))
        .await
        .unwrap();
    assert!(created);
    let (second, created) = store
        .flag_contradiction(&contradiction("k-2", "b", "a"))
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(second.id, first.id);

    let open = store
        .chunks_with_open_contradictions(&["a".to_string(), "c".to_string()])
        .await
        .unwrap();
    assert!(open.contains("a"));
    assert!(!open.contains("c"));

    let in_review = store.mark_in_review("k-1").await.unwrap();
    assert_eq!(in_review.status, ContradictionStatus::InReview);
    let listed = store
        .list_contradictions(Some(ContradictionStatus::InReview), None)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn resolve_keep_a_archives_b_once() {
    let (_tmp, store) = seeded(&["a", "b"]).await;
    store
        .flag_contradiction(&contradiction("k-1", "a", "b"))
        .await
        .unwrap();
    let resolution = Resolution {
        action: ResolutionAction::KeepA,
        preferred_id: None,
        notes: Some("a is current".into()),
        resolved_by: "ops".into(),
    };
    let resolved = store.resolve_contradiction("k-1", &resolution).await.unwrap();
    assert_eq!(resolved.status, ContradictionStatus::Resolved);
    assert_eq!(resolved.resolution_action, Some(ResolutionAction::KeepA));
    assert_eq!(resolved.resolved_by.as_deref(), Some("ops"));
    assert!(resolved.resolved_at.is_some());
    assert!(store.get_chunk("b").await.unwrap().unwrap().archived);
    assert!(!store.get_chunk("a").await.unwrap().unwrap().archived);

    let err = store
        .resolve_contradiction("k-1", &resolution)
        .await
        .unwrap_err();
    assert!(matches!(err, DedupError::Conflict(_)));

    let stats = store.contradiction_stats(None).await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_status.get("resolved"), Some(&1));
    assert_eq!(stats.by_action.get("keep_a"), Some(&1));

    // Resolved pairs may be flagged again.
    let (_, created) = store
        .flag_contradiction(&contradiction("k-2", "a", "b"))
        .await
        .unwrap();
    assert!(created);
}

#[tokio::test]
async fn review_queue_round_trip() {
    let (_tmp, store) = seeded(&["a", "b"]).await;
    let review = PendingReview {
        id: "r-1".into(),
        chunk_id: "b".into(),
        project: None,
        candidates: vec![ReviewCandidate {
            chunk_id: "a".into(),
            similarity: 0.9,
            relationship: RelationshipType::Unknown,
            confidence: 0.3,
            explanation: "no rule matched".into(),
        }],
        reason: "low confidence".into(),
        queued_at: 1_700_000_000,
    };
    store.enqueue_review(&review).await.unwrap();

    assert_eq!(store.get_review("r-1").await.unwrap().unwrap(), review);
    assert_eq!(
        store.review_for_chunk("b").await.unwrap().map(|r| r.id),
        Some("r-1".to_string())
    );
    assert_eq!(store.list_reviews(None).await.unwrap().len(), 1);
    assert_eq!(store.take_review("r-1").await.unwrap(), Some(review));
    assert!(store.take_review("r-1").await.unwrap().is_none());
    assert!(store.list_reviews(None).await.unwrap().is_empty());
}

fn review(id: &str, chunk_id: &str) -> PendingReview {
    PendingReview {
        id: id.to_string(),
        chunk_id: chunk_id.to_string(),
        project: None,
        candidates: Vec::new(),
        reason: "low confidence".into(),
        queued_at: 1_700_000_000,
    }
}

#[tokio::test]
async fn archiving_drops_queued_review() {
    let (_tmp, store) = seeded(&["a", "b", "c"]).await;
    store.enqueue_review(&review("r-a", "a")).await.unwrap();
    store.enqueue_review(&review("r-b", "b")).await.unwrap();
    store.enqueue_review(&review("r-c", "c")).await.unwrap();

    store.archive_chunk("a").await.unwrap();
    assert!(store.review_for_chunk("a").await.unwrap().is_none());

    store.supersede("b", "c").await.unwrap();
    assert!(store.get_review("r-b").await.unwrap().is_none());
    let left: Vec<String> = store
        .list_reviews(None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(left, vec!["r-c".to_string()]);
}

#[tokio::test]
async fn absorb_canonical_subset_hands_over_the_slot() {
    let (_tmp, store) = seeded(&["small", "twin", "big"]).await;
    let record = store.create_canonical("small").await.unwrap();
    store
        .merge_variant(&record.id, "twin", VariantRelation::Equivalent, 0.99)
        .await
        .unwrap();

    let absorbed = store.absorb_subset("small", "big", 0.9).await.unwrap();
    assert!(absorbed.demoted);
    assert_eq!(absorbed.variant_chunk_id, "small");
    assert_eq!(absorbed.record.canonical_chunk_id, "big");
    assert_eq!(absorbed.record.merge_count, 3);
    let small = store.get_membership("small").await.unwrap().unwrap();
    assert_eq!(small.role, MembershipRole::Variant);
    let variants = store.get_variants(&record.id).await.unwrap();
    assert!(variants
        .iter()
        .any(|v| v.variant_chunk_id == "small" && v.relationship == VariantRelation::Demoted));
}

#[tokio::test]
async fn absorb_standalone_and_variant_subsets() {
    let (_tmp, store) = seeded(&["s1", "b1", "root", "s2", "b2"]).await;
    let absorbed = store.absorb_subset("s1", "b1", 0.9).await.unwrap();
    assert!(absorbed.created);
    assert_eq!(absorbed.record.canonical_chunk_id, "b1");
    assert_eq!(absorbed.record.merge_count, 2);

    let record = store.create_canonical("root").await.unwrap();
    store
        .merge_variant(&record.id, "s2", VariantRelation::Equivalent, 0.99)
        .await
        .unwrap();
    let absorbed = store.absorb_subset("s2", "b2", 0.9).await.unwrap();
    assert_eq!(absorbed.variant_chunk_id, "b2");
    assert_eq!(absorbed.record.id, record.id);
    assert_eq!(absorbed.record.merge_count, 3);
}

#[tokio::test]
async fn failed_absorb_rolls_back() {
    let (_tmp, store) = seeded(&["small", "big", "other"]).await;
    let record = store.create_canonical("small").await.unwrap();
    store.create_canonical("big").await.unwrap();

    let err = store.absorb_subset("small", "big", 0.9).await.unwrap_err();
    assert!(matches!(err, DedupError::Conflict(_)));
    let record = store.get_canonical(&record.id).await.unwrap().unwrap();
    assert_eq!(record.canonical_chunk_id, "small");
    assert_eq!(record.merge_count, 1);

    store.archive_chunk("other").await.unwrap();
    let err = store.absorb_subset("other", "big", 0.9).await.unwrap_err();
    assert!(matches!(err, DedupError::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_merges_never_lose_updates() {
    let ids: Vec<String> = (0..16).map(|i| format!("v{:02}", i)).collect();
    let mut all: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
    all.push("root");
    let (_tmp, store) = seeded(&all).await;
    let store = Arc::new(store);
    let record = store.create_canonical("root").await.unwrap();

    let mut handles = Vec::new();
    for id in ids.clone() {
        let store = store.clone();
        let record_id = record.id.clone();
        handles.push(tokio::spawn(async move {
            store
                .merge_variant(&record_id, &id, VariantRelation::Equivalent, 0.99)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let record = store.get_canonical(&record.id).await.unwrap().unwrap();
    assert_eq!(record.merge_count, ids.len() as i64 + 1);
    assert_eq!(store.get_variants(&record.id).await.unwrap().len(), ids.len());
}

#[tokio::test]
async fn vector_search_respects_threshold_scope_and_order() {
    let (_tmp, store) = open_store().await;
    let mut a = chunk("a", vec![1.0, 0.0]);
    a.project = Some("p1".into());
    let mut b = chunk("b", vec![0.9, 0.1]);
    b.project = Some("p1".into());
    let mut c = chunk("c", vec![0.0, 1.0]);
    c.project = Some("p2".into());
    for ch in [&a, &b, &c] {
        store.insert_chunk(ch).await.unwrap();
    }

    let hits = store.vector_search(&[1.0, 0.0], &filter(0.5)).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|m| m.chunk_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(hits[0].score >= hits[1].score);
    assert!(hits[0].preview.starts_with("content of a"));

    let scoped = VectorFilter {
        scope: Some("p2".into()),
        ..filter(0.0)
    };
    let hits = store.vector_search(&[1.0, 0.0], &scoped).await.unwrap();
    assert!(hits.iter().all(|m| m.chunk_id == "c"));

    let batch = store
        .vector_search_batch(&[vec![1.0, 0.0], vec![0.0, 1.0]], &filter(0.9))
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[1][0].chunk_id, "c");
}

#[tokio::test]
async fn list_chunks_after_pages_in_id_order() {
    let (_tmp, store) = seeded(&["c", "a", "d", "b"]).await;
    store.archive_chunk("c").await.unwrap();
    let page = store.list_chunks_after(None, 2, None).await.unwrap();
    let ids: Vec<&str> = page.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    let page = store.list_chunks_after(Some("b"), 10, None).await.unwrap();
    let ids: Vec<&str> = page.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["d"]);
    assert_eq!(store.count_chunks(None).await.unwrap(), 3);
}

#[tokio::test]
async fn save_job_is_conditional_on_state() {
    let (_tmp, store) = open_store().await;
    let mut job = BatchJob::new(Default::default());
    store.create_job(&job).await.unwrap();

    job.transition(JobState::Running).unwrap();
    assert!(store.save_job(&job, JobState::Pending).await.unwrap());
    job.processed = 5;
    assert!(!store.save_job(&job, JobState::Pending).await.unwrap());
    assert_eq!(store.get_job(&job.id).await.unwrap().unwrap().processed, 0);

    let running = store
        .list_jobs(&JobFilter {
            state: Some(JobState::Running),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);

    let mut missing = BatchJob::new(Default::default());
    missing.transition(JobState::Running).unwrap();
    assert!(matches!(
        store.save_job(&missing, JobState::Pending).await.unwrap_err(),
        DedupError::NotFound { .. }
    ));
}
