//! Canonical-aware retrieval.
//!
//! Search over-fetches raw matches, resolves each match's canonical
//! membership in one store call, and keeps a single representative per
//! canonical record: the canonical chunk, scored with the best score of any
//! member that matched. Variants never appear on their own.
//!
//! Enrichment (variant count, provenance, open-contradiction flag) is best
//! effort. A failed lookup leaves that field as `None` on the affected
//! results instead of failing the query.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::error::{DedupError, Result};
use crate::models::{preview, ChunkProvenance, MembershipRole, SimilarityMatch};
use crate::similarity::{SimilarityIndex, SimilarityQuery};
use crate::store::DedupStore;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub min_score: f64,
    /// Raw matches fetched per requested result before grouping.
    pub fetch_multiplier: usize,
    pub respect_canonicals: bool,
    pub include_archived: bool,
    pub include_variant_count: bool,
    pub include_provenance: bool,
    pub include_contradiction_flag: bool,
    pub scope: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0.5,
            fetch_multiplier: 3,
            respect_canonicals: true,
            include_archived: false,
            include_variant_count: true,
            include_provenance: false,
            include_contradiction_flag: true,
            scope: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub score: f64,
    pub preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_record_id: Option<String>,
    pub is_canonical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Vec<ChunkProvenance>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_unresolved_contradiction: Option<bool>,
}

impl SearchResult {
    fn raw(m: SimilarityMatch) -> Self {
        Self {
            chunk_id: m.chunk_id,
            score: m.score,
            preview: m.preview,
            canonical_record_id: None,
            is_canonical: false,
            variant_count: None,
            provenance: None,
            has_unresolved_contradiction: None,
        }
    }
}

pub struct RetrievalFilter<S> {
    store: Arc<S>,
    index: SimilarityIndex<S>,
}

impl<S: DedupStore> RetrievalFilter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            index: SimilarityIndex::new(store.clone()),
            store,
        }
    }

    pub async fn search_similar(
        &self,
        embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if options.limit == 0 {
            return Err(DedupError::validation("limit must be > 0"));
        }
        let fetch = if options.respect_canonicals {
            options.limit.saturating_mul(options.fetch_multiplier.max(1))
        } else {
            options.limit
        };
        let mut query = SimilarityQuery::new(options.min_score, fetch as i64)
            .scoped(options.scope.clone());
        query.include_archived = options.include_archived;
        let matches = self.index.find_similar(embedding, &query).await?;

        if !options.respect_canonicals {
            return Ok(matches.into_iter().map(SearchResult::raw).collect());
        }

        let mut results = self.collapse(matches).await?;
        results.truncate(options.limit);
        self.enrich(&mut results, options).await;
        Ok(results)
    }

    /// One result per canonical record (or per standalone chunk).
    async fn collapse(&self, matches: Vec<SimilarityMatch>) -> Result<Vec<SearchResult>> {
        let ids: Vec<String> = matches.iter().map(|m| m.chunk_id.clone()).collect();
        let memberships = self.store.get_memberships(&ids).await?;

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, SearchResult> = HashMap::new();
        let mut missing_canonicals: Vec<String> = Vec::new();

        for m in matches {
            let (group_key, result) = match memberships.get(&m.chunk_id) {
                None => (m.chunk_id.clone(), SearchResult::raw(m)),
                Some(membership) => {
                    let record = &membership.record;
                    let is_canonical = membership.role == MembershipRole::Canonical;
                    let mut result = SearchResult::raw(m);
                    result.canonical_record_id = Some(record.id.clone());
                    result.is_canonical = is_canonical;
                    result.variant_count = Some(record.merge_count - 1);
                    if !is_canonical {
                        result.chunk_id = record.canonical_chunk_id.clone();
                        result.preview = String::new();
                    }
                    (record.id.clone(), result)
                }
            };

            match groups.get_mut(&group_key) {
                Some(existing) => {
                    if result.score > existing.score {
                        existing.score = result.score;
                    }
                    if result.is_canonical && !existing.is_canonical {
                        existing.preview = result.preview;
                        existing.is_canonical = true;
                    }
                }
                None => {
                    order.push(group_key.clone());
                    groups.insert(group_key, result);
                }
            }
        }

        // Groups reached only through a variant still need the canonical's preview.
        for key in &order {
            if let Some(result) = groups.get(key) {
                if result.canonical_record_id.is_some() && !result.is_canonical {
                    missing_canonicals.push(result.chunk_id.clone());
                }
            }
        }
        if !missing_canonicals.is_empty() {
            let canonicals: HashMap<String, String> = self
                .store
                .get_chunks(&missing_canonicals)
                .await?
                .into_iter()
                .map(|c| (c.id.clone(), preview(&c.content)))
                .collect();
            for result in groups.values_mut() {
                if result.canonical_record_id.is_some() && !result.is_canonical {
                    if let Some(text) = canonicals.get(&result.chunk_id) {
                        result.preview = text.clone();
                    }
                    result.is_canonical = true;
                }
            }
        }

        let mut results: Vec<SearchResult> = order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(results)
    }

    async fn enrich(&self, results: &mut [SearchResult], options: &SearchOptions) {
        if !options.include_variant_count {
            for r in results.iter_mut() {
                r.variant_count = None;
            }
        } else {
            for r in results.iter_mut().filter(|r| r.canonical_record_id.is_none()) {
                r.variant_count = Some(0);
            }
        }

        if options.include_provenance {
            for r in results.iter_mut() {
                let Some(record_id) = r.canonical_record_id.clone() else {
                    continue;
                };
                match self.store.get_provenance(&record_id).await {
                    Ok(trail) => r.provenance = Some(trail),
                    Err(err) => warn!(chunk_id = %r.chunk_id, error = %err, "provenance lookup failed"),
                }
            }
        }

        if options.include_contradiction_flag {
            let ids: Vec<String> = results.iter().map(|r| r.chunk_id.clone()).collect();
            match self.store.chunks_with_open_contradictions(&ids).await {
                Ok(flagged) => {
                    let flagged: HashSet<String> = flagged;
                    for r in results.iter_mut() {
                        r.has_unresolved_contradiction = Some(flagged.contains(&r.chunk_id));
                    }
                }
                Err(err) => warn!(error = %err, "contradiction lookup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkProvenance, VariantRelation};
    use crate::store::memory::InMemoryStore;
    use crate::store::{CanonicalStore, ChunkStore, ContradictionStore};

    async fn insert(store: &InMemoryStore, id: &str, embedding: Vec<f32>) {
        let mut c = Chunk::new(format!("content {}", id), embedding);
        c.id = id.to_string();
        store.insert_chunk(&c).await.unwrap();
        store
            .record_provenance(&ChunkProvenance::for_chunk(&c))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn variants_collapse_into_one_result() {
        let store = Arc::new(InMemoryStore::new());
        insert(&store, "canon", vec![1.0, 0.0]).await;
        let record = store.create_canonical("canon").await.unwrap();
        for i in 0..4 {
            let id = format!("var{}", i);
            insert(&store, &id, vec![1.0, 0.01 * (i + 1) as f32]).await;
            store
                .merge_variant(&record.id, &id, VariantRelation::Equivalent, 0.99)
                .await
                .unwrap();
        }
        let filter = RetrievalFilter::new(store.clone());

        let results = filter
            .search_similar(&[1.0, 0.0], &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "canon");
        assert!(results[0].is_canonical);
        assert_eq!(results[0].variant_count, Some(4));
        assert_eq!(results[0].has_unresolved_contradiction, Some(false));

        let raw = filter
            .search_similar(
                &[1.0, 0.0],
                &SearchOptions {
                    respect_canonicals: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(raw.len(), 5);
    }

    #[tokio::test]
    async fn group_reached_through_variant_shows_canonical() {
        let store = Arc::new(InMemoryStore::new());
        insert(&store, "canon", vec![0.0, 1.0]).await;
        insert(&store, "var", vec![1.0, 0.0]).await;
        let record = store.create_canonical("canon").await.unwrap();
        store
            .merge_variant(&record.id, "var", VariantRelation::Equivalent, 0.9)
            .await
            .unwrap();

        let results = RetrievalFilter::new(store)
            .search_similar(
                &[1.0, 0.0],
                &SearchOptions {
                    min_score: 0.9,
                    include_provenance: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "canon");
        assert_eq!(results[0].preview, "content canon");
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert_eq!(results[0].provenance.as_ref().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn standalone_chunks_and_contradiction_flag() {
        let store = Arc::new(InMemoryStore::new());
        insert(&store, "a", vec![1.0, 0.0]).await;
        insert(&store, "b", vec![0.95, 0.3]).await;
        let contradiction = crate::models::Contradiction {
            id: "c1".into(),
            chunk_a_id: "a".into(),
            chunk_b_id: "b".into(),
            description: "x".into(),
            severity: crate::models::Severity::Low,
            status: crate::models::ContradictionStatus::Pending,
            resolution_action: None,
            resolution_notes: None,
            resolved_by: None,
            preferred_chunk_id: None,
            detected_at: 0,
            resolved_at: None,
        };
        store.flag_contradiction(&contradiction).await.unwrap();

        let results = RetrievalFilter::new(store)
            .search_similar(&[1.0, 0.0], &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.variant_count == Some(0)));
        assert!(results.iter().all(|r| r.has_unresolved_contradiction == Some(true)));
    }

    #[tokio::test]
    async fn zero_limit_is_invalid() {
        let store = Arc::new(InMemoryStore::new());
        let err = RetrievalFilter::new(store)
            .search_similar(
                &[1.0],
                &SearchOptions {
                    limit: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::Validation(_)));
    }
}
