//! In-memory store implementing every storage trait, for tests and embedding.
//!
//! All state lives in one `State` behind a `std::sync::RwLock`. A mutating
//! call takes the write guard once, validates everything it needs, and only
//! then mutates, so a failed call leaves no partial effects. Holding a single
//! guard also serializes concurrent merges against the same record.
//! Vector search is brute-force cosine similarity over all chunks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{DedupError, Result};
use crate::job::{BatchJob, JobFilter, JobState};
use crate::models::{
    pair_key, preview, CanonicalRecord, Chunk, ChunkLink, ChunkProvenance, ChunkVariant,
    Contradiction, ContradictionStatus, Membership, MembershipRole, PendingReview, Resolution,
    ResolutionAction, SimilarityMatch, VariantRelation,
};
use crate::vector::similarity_score;

use super::{
    Absorption, CanonicalStore, ChunkStore, ContradictionStats, ContradictionStore, JobStore, ReviewStore,
    VectorFilter,
};

#[derive(Default)]
struct State {
    chunks: BTreeMap<String, Chunk>,
    records: HashMap<String, CanonicalRecord>,
    /// Canonical chunk id -> live record id.
    canonical_index: HashMap<String, String>,
    /// Variant chunk id -> variant row.
    variants: HashMap<String, ChunkVariant>,
    links: Vec<ChunkLink>,
    provenance: Vec<ChunkProvenance>,
    contradictions: HashMap<String, Contradiction>,
    reviews: HashMap<String, PendingReview>,
    jobs: HashMap<String, BatchJob>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl State {
    fn membership(&self, chunk_id: &str) -> Option<Membership> {
        if let Some(record_id) = self.canonical_index.get(chunk_id) {
            return self.records.get(record_id).map(|record| Membership {
                record: record.clone(),
                role: MembershipRole::Canonical,
            });
        }
        self.variants
            .get(chunk_id)
            .and_then(|v| self.records.get(&v.canonical_record_id))
            .map(|record| Membership {
                record: record.clone(),
                role: MembershipRole::Variant,
            })
    }

    fn live_chunk(&self, id: &str) -> Result<&Chunk> {
        let chunk = self
            .chunks
            .get(id)
            .ok_or_else(|| DedupError::not_found("chunk", id))?;
        if chunk.archived {
            return Err(DedupError::validation(format!("chunk {} is archived", id)));
        }
        Ok(chunk)
    }

    fn live_record(&self, id: &str) -> Result<&CanonicalRecord> {
        match self.records.get(id) {
            Some(record) if record.retired_at.is_none() => Ok(record),
            _ => Err(DedupError::not_found("canonical record", id)),
        }
    }

    fn ensure_standalone(&self, chunk_id: &str) -> Result<()> {
        match self.membership(chunk_id) {
            Some(m) => Err(DedupError::conflict(format!(
                "chunk {} already belongs to canonical record {}",
                chunk_id, m.record.id
            ))),
            None => Ok(()),
        }
    }

    fn insert_record(&mut self, chunk: &Chunk, ts: i64) -> CanonicalRecord {
        let record = CanonicalRecord {
            id: uuid::Uuid::new_v4().to_string(),
            canonical_chunk_id: chunk.id.clone(),
            project: chunk.project.clone(),
            created_at: ts,
            updated_at: ts,
            merge_count: 1,
            retired_at: None,
        };
        self.canonical_index
            .insert(chunk.id.clone(), record.id.clone());
        self.records.insert(record.id.clone(), record.clone());
        record
    }

    /// Highest-similarity variant of a record, earliest merge on ties.
    fn heir_of(&self, record_id: &str) -> Option<String> {
        self.variants
            .values()
            .filter(|v| v.canonical_record_id == record_id)
            .max_by(|a, b| {
                a.similarity_score
                    .partial_cmp(&b.similarity_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b.merged_at.cmp(&a.merged_at))
                    .then(b.variant_chunk_id.cmp(&a.variant_chunk_id))
            })
            .map(|v| v.variant_chunk_id.clone())
    }

    /// Insert a variant row and bump the record's merge count.
    fn attach_variant(
        &mut self,
        record_id: &str,
        chunk_id: &str,
        relation: VariantRelation,
        similarity: f64,
        ts: i64,
    ) -> ChunkVariant {
        let variant = ChunkVariant {
            id: uuid::Uuid::new_v4().to_string(),
            canonical_record_id: record_id.to_string(),
            variant_chunk_id: chunk_id.to_string(),
            relationship: relation,
            similarity_score: similarity,
            merged_at: ts,
        };
        self.variants.insert(chunk_id.to_string(), variant.clone());
        if let Some(record) = self.records.get_mut(record_id) {
            record.merge_count += 1;
            record.updated_at = ts;
        }
        variant
    }

    fn drop_membership(&mut self, chunk_id: &str, ts: i64) {
        if let Some(variant) = self.variants.remove(chunk_id) {
            if let Some(record) = self.records.get_mut(&variant.canonical_record_id) {
                record.merge_count -= 1;
                record.updated_at = ts;
            }
            return;
        }

        let Some(record_id) = self.canonical_index.remove(chunk_id) else {
            return;
        };
        let heir = self.heir_of(&record_id);
        if let Some(heir_id) = &heir {
            self.variants.remove(heir_id);
            self.canonical_index
                .insert(heir_id.clone(), record_id.clone());
        }
        if let Some(record) = self.records.get_mut(&record_id) {
            match heir {
                Some(heir_id) => {
                    record.canonical_chunk_id = heir_id;
                    record.merge_count -= 1;
                }
                None => record.retired_at = Some(ts),
            }
            record.updated_at = ts;
        }
    }

    fn archive(&mut self, chunk_id: &str, ts: i64) {
        self.drop_membership(chunk_id, ts);
        self.links
            .retain(|l| l.source_chunk_id != chunk_id && l.target_chunk_id != chunk_id);
        self.reviews.retain(|_, r| r.chunk_id != chunk_id);
        if let Some(chunk) = self.chunks.get_mut(chunk_id) {
            chunk.archived = true;
        }
    }

    fn in_scope(&self, chunk_id: &str, scope: Option<&str>) -> bool {
        match scope {
            None => true,
            Some(project) => self
                .chunks
                .get(chunk_id)
                .map(|c| c.project.as_deref() == Some(project))
                .unwrap_or(false),
        }
    }

    fn search(&self, embedding: &[f32], filter: &VectorFilter) -> Vec<SimilarityMatch> {
        let mut matches: Vec<SimilarityMatch> = self
            .chunks
            .values()
            .filter(|c| filter.include_archived || !c.archived)
            .filter(|c| match &filter.scope {
                Some(project) => c.project.as_deref() == Some(project.as_str()),
                None => true,
            })
            .filter_map(|c| {
                let score = similarity_score(embedding, &c.embedding);
                (score >= filter.threshold).then(|| SimilarityMatch {
                    chunk_id: c.id.clone(),
                    score,
                    preview: preview(&c.content),
                })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        matches.truncate(filter.limit);
        matches
    }
}

/// In-memory store for tests and single-process embedding.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().expect("in-memory store lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().expect("in-memory store lock poisoned")
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        let mut state = self.write();
        if state.chunks.contains_key(&chunk.id) {
            return Err(DedupError::conflict(format!(
                "chunk {} already exists",
                chunk.id
            )));
        }
        state.chunks.insert(chunk.id.clone(), chunk.clone());
        Ok(())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self.read().chunks.get(id).cloned())
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let state = self.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.chunks.get(id).cloned())
            .collect())
    }

    async fn archive_chunk(&self, id: &str) -> Result<()> {
        let mut state = self.write();
        if !state.chunks.contains_key(id) {
            return Err(DedupError::not_found("chunk", id));
        }
        state.archive(id, now());
        Ok(())
    }

    async fn annotate_chunk(&self, id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut state = self.write();
        let chunk = state
            .chunks
            .get_mut(id)
            .ok_or_else(|| DedupError::not_found("chunk", id))?;
        if !chunk.metadata.is_object() {
            chunk.metadata = serde_json::json!({});
        }
        chunk.metadata[key] = value;
        Ok(())
    }

    async fn list_chunks_after(
        &self,
        cursor: Option<&str>,
        limit: usize,
        scope: Option<&str>,
    ) -> Result<Vec<Chunk>> {
        let state = self.read();
        let lower = match cursor {
            Some(c) => std::ops::Bound::Excluded(c.to_string()),
            None => std::ops::Bound::Unbounded,
        };
        Ok(state
            .chunks
            .range((lower, std::ops::Bound::Unbounded))
            .map(|(_, c)| c)
            .filter(|c| !c.archived)
            .filter(|c| scope.is_none() || c.project.as_deref() == scope)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_chunks(&self, scope: Option<&str>) -> Result<u64> {
        let state = self.read();
        Ok(state
            .chunks
            .values()
            .filter(|c| !c.archived)
            .filter(|c| scope.is_none() || c.project.as_deref() == scope)
            .count() as u64)
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        filter: &VectorFilter,
    ) -> Result<Vec<SimilarityMatch>> {
        Ok(self.read().search(embedding, filter))
    }

    async fn vector_search_batch(
        &self,
        embeddings: &[Vec<f32>],
        filter: &VectorFilter,
    ) -> Result<Vec<Vec<SimilarityMatch>>> {
        let state = self.read();
        Ok(embeddings.iter().map(|e| state.search(e, filter)).collect())
    }
}

#[async_trait]
impl CanonicalStore for InMemoryStore {
    async fn create_canonical(&self, chunk_id: &str) -> Result<CanonicalRecord> {
        let mut state = self.write();
        let chunk = state.live_chunk(chunk_id)?.clone();
        state.ensure_standalone(chunk_id)?;
        Ok(state.insert_record(&chunk, now()))
    }

    async fn get_canonical(&self, id: &str) -> Result<Option<CanonicalRecord>> {
        Ok(self.read().records.get(id).cloned())
    }

    async fn merge_variant(
        &self,
        canonical_id: &str,
        variant_chunk_id: &str,
        relation: VariantRelation,
        similarity: f64,
    ) -> Result<ChunkVariant> {
        let mut state = self.write();
        state.live_record(canonical_id)?;
        state.live_chunk(variant_chunk_id)?;
        state.ensure_standalone(variant_chunk_id)?;
        Ok(state.attach_variant(canonical_id, variant_chunk_id, relation, similarity, now()))
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
        let mut state = self.write();
        state.live_chunk(subset_chunk_id)?;
        let superset = state.live_chunk(superset_chunk_id)?.clone();
        state.ensure_standalone(superset_chunk_id)?;
        let ts = now();

        let member = state.membership(subset_chunk_id);
        let (record_id, variant_chunk_id, created, demoted) = match member {
            None => {
                let record = state.insert_record(&superset, ts);
                state.attach_variant(
                    &record.id,
                    subset_chunk_id,
                    VariantRelation::Subset,
                    similarity,
                    ts,
                );
                (record.id, subset_chunk_id, true, false)
            }
            Some(Membership {
                record,
                role: MembershipRole::Canonical,
            }) => {
                state.canonical_index.remove(subset_chunk_id);
                state
                    .canonical_index
                    .insert(superset_chunk_id.to_string(), record.id.clone());
                if let Some(stored) = state.records.get_mut(&record.id) {
                    stored.canonical_chunk_id = superset_chunk_id.to_string();
                }
                state.attach_variant(
                    &record.id,
                    subset_chunk_id,
                    VariantRelation::Demoted,
                    similarity,
                    ts,
                );
                (record.id, subset_chunk_id, false, true)
            }
            Some(Membership {
                record,
                role: MembershipRole::Variant,
            }) => {
                state.attach_variant(
                    &record.id,
                    superset_chunk_id,
                    VariantRelation::Subset,
                    similarity,
                    ts,
                );
                (record.id, superset_chunk_id, false, false)
            }
        };
        let record = state.live_record(&record_id)?.clone();
        Ok(Absorption {
            record,
            variant_chunk_id: variant_chunk_id.to_string(),
            created,
            demoted,
        })
    }

    async fn get_membership(&self, chunk_id: &str) -> Result<Option<Membership>> {
        Ok(self.read().membership(chunk_id))
    }

    async fn get_memberships(&self, chunk_ids: &[String]) -> Result<HashMap<String, Membership>> {
        let state = self.read();
        Ok(chunk_ids
            .iter()
            .filter_map(|id| state.membership(id).map(|m| (id.clone(), m)))
            .collect())
    }

    async fn get_variants(&self, canonical_id: &str) -> Result<Vec<ChunkVariant>> {
        let state = self.read();
        let mut variants: Vec<ChunkVariant> = state
            .variants
            .values()
            .filter(|v| v.canonical_record_id == canonical_id)
            .cloned()
            .collect();
        variants.sort_by(|a, b| {
            a.merged_at
                .cmp(&b.merged_at)
                .then(a.variant_chunk_id.cmp(&b.variant_chunk_id))
        });
        Ok(variants)
    }

    async fn promote_variant(
        &self,
        canonical_id: &str,
        new_canonical_chunk_id: &str,
    ) -> Result<CanonicalRecord> {
        let mut state = self.write();
        let old_canonical = state.live_record(canonical_id)?.canonical_chunk_id.clone();
        let similarity = match state.variants.get(new_canonical_chunk_id) {
            Some(v) if v.canonical_record_id == canonical_id => v.similarity_score,
            _ => {
                return Err(DedupError::validation(format!(
                    "chunk {} is not a variant of canonical record {}",
                    new_canonical_chunk_id, canonical_id
                )))
            }
        };

        let ts = now();
        state.variants.remove(new_canonical_chunk_id);
        state.canonical_index.remove(&old_canonical);
        state
            .canonical_index
            .insert(new_canonical_chunk_id.to_string(), canonical_id.to_string());
        state.variants.insert(
            old_canonical.clone(),
            ChunkVariant {
                id: uuid::Uuid::new_v4().to_string(),
                canonical_record_id: canonical_id.to_string(),
                variant_chunk_id: old_canonical,
                relationship: VariantRelation::Demoted,
                similarity_score: similarity,
                merged_at: ts,
            },
        );
        let record = state
            .records
            .get_mut(canonical_id)
            .ok_or_else(|| DedupError::not_found("canonical record", canonical_id))?;
        record.canonical_chunk_id = new_canonical_chunk_id.to_string();
        record.updated_at = ts;
        Ok(record.clone())
    }

    async fn detach_variant(&self, variant_chunk_id: &str) -> Result<CanonicalRecord> {
        let mut state = self.write();
        let record_id = state
            .variants
            .get(variant_chunk_id)
            .map(|v| v.canonical_record_id.clone())
            .ok_or_else(|| DedupError::not_found("variant", variant_chunk_id))?;
        state.drop_membership(variant_chunk_id, now());
        state
            .records
            .get(&record_id)
            .cloned()
            .ok_or_else(|| DedupError::not_found("canonical record", record_id))
    }

    async fn supersede(
        &self,
        outdated_chunk_id: &str,
        replacement_chunk_id: &str,
    ) -> Result<CanonicalRecord> {
        if outdated_chunk_id == replacement_chunk_id {
            return Err(DedupError::validation("a chunk cannot supersede itself"));
        }
        let mut state = self.write();
        state.live_chunk(outdated_chunk_id)?;
        let replacement = state.live_chunk(replacement_chunk_id)?.clone();
        let ts = now();

        if let Some(member) = state.membership(replacement_chunk_id) {
            let outdated = state.membership(outdated_chunk_id);
            if let Some(old) = outdated {
                if old.record.id == member.record.id && old.role == MembershipRole::Canonical {
                    // Hand the record to the replacement before archiving.
                    state.canonical_index.remove(outdated_chunk_id);
                    state.variants.remove(replacement_chunk_id);
                    state
                        .canonical_index
                        .insert(replacement_chunk_id.to_string(), member.record.id.clone());
                    if let Some(record) = state.records.get_mut(&member.record.id) {
                        record.canonical_chunk_id = replacement_chunk_id.to_string();
                        record.merge_count -= 1;
                        record.updated_at = ts;
                    }
                }
            }
            state.archive(outdated_chunk_id, ts);
            return state
                .membership(replacement_chunk_id)
                .map(|m| m.record)
                .ok_or_else(|| DedupError::not_found("canonical record", replacement_chunk_id));
        }

        let record = match state.membership(outdated_chunk_id) {
            Some(Membership {
                record,
                role: MembershipRole::Canonical,
            }) => {
                state.canonical_index.remove(outdated_chunk_id);
                state
                    .canonical_index
                    .insert(replacement_chunk_id.to_string(), record.id.clone());
                let stored = state
                    .records
                    .get_mut(&record.id)
                    .ok_or_else(|| DedupError::not_found("canonical record", &record.id))?;
                stored.canonical_chunk_id = replacement_chunk_id.to_string();
                stored.updated_at = ts;
                stored.clone()
            }
            Some(Membership {
                record,
                role: MembershipRole::Variant,
            }) => {
                let similarity = state
                    .variants
                    .remove(outdated_chunk_id)
                    .map(|v| v.similarity_score)
                    .unwrap_or(1.0);
                state.variants.insert(
                    replacement_chunk_id.to_string(),
                    ChunkVariant {
                        id: uuid::Uuid::new_v4().to_string(),
                        canonical_record_id: record.id.clone(),
                        variant_chunk_id: replacement_chunk_id.to_string(),
                        relationship: VariantRelation::Superseding,
                        similarity_score: similarity,
                        merged_at: ts,
                    },
                );
                let stored = state
                    .records
                    .get_mut(&record.id)
                    .ok_or_else(|| DedupError::not_found("canonical record", &record.id))?;
                stored.updated_at = ts;
                stored.clone()
            }
            None => state.insert_record(&replacement, ts),
        };
        state.archive(outdated_chunk_id, ts);
        Ok(record)
    }

    async fn create_link(&self, link: &ChunkLink) -> Result<ChunkLink> {
        let mut state = self.write();
        state.live_chunk(&link.source_chunk_id)?;
        state.live_chunk(&link.target_chunk_id)?;
        let key = pair_key(&link.source_chunk_id, &link.target_chunk_id);
        if let Some(existing) = state
            .links
            .iter()
            .find(|l| pair_key(&l.source_chunk_id, &l.target_chunk_id) == key)
        {
            return Ok(existing.clone());
        }
        state.links.push(link.clone());
        Ok(link.clone())
    }

    async fn get_links(&self, chunk_id: &str) -> Result<Vec<ChunkLink>> {
        Ok(self
            .read()
            .links
            .iter()
            .filter(|l| l.source_chunk_id == chunk_id || l.target_chunk_id == chunk_id)
            .cloned()
            .collect())
    }

    async fn record_provenance(&self, provenance: &ChunkProvenance) -> Result<()> {
        self.write().provenance.push(provenance.clone());
        Ok(())
    }

    async fn get_provenance(&self, canonical_id: &str) -> Result<Vec<ChunkProvenance>> {
        let state = self.read();
        let record = state
            .records
            .get(canonical_id)
            .ok_or_else(|| DedupError::not_found("canonical record", canonical_id))?;
        let mut members: HashSet<&str> = state
            .variants
            .values()
            .filter(|v| v.canonical_record_id == canonical_id)
            .map(|v| v.variant_chunk_id.as_str())
            .collect();
        members.insert(record.canonical_chunk_id.as_str());
        let mut trail: Vec<ChunkProvenance> = state
            .provenance
            .iter()
            .filter(|p| members.contains(p.chunk_id.as_str()))
            .cloned()
            .collect();
        trail.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at).then(a.id.cmp(&b.id)));
        Ok(trail)
    }
}

#[async_trait]
impl ContradictionStore for InMemoryStore {
    async fn flag_contradiction(
        &self,
        contradiction: &Contradiction,
    ) -> Result<(Contradiction, bool)> {
        let mut state = self.write();
        state.live_chunk(&contradiction.chunk_a_id)?;
        state.live_chunk(&contradiction.chunk_b_id)?;
        let key = pair_key(&contradiction.chunk_a_id, &contradiction.chunk_b_id);
        if let Some(existing) = state
            .contradictions
            .values()
            .find(|c| c.status.is_open() && pair_key(&c.chunk_a_id, &c.chunk_b_id) == key)
        {
            return Ok((existing.clone(), false));
        }
        state
            .contradictions
            .insert(contradiction.id.clone(), contradiction.clone());
        Ok((contradiction.clone(), true))
    }

    async fn get_contradiction(&self, id: &str) -> Result<Option<Contradiction>> {
        Ok(self.read().contradictions.get(id).cloned())
    }

    async fn list_contradictions(
        &self,
        status: Option<ContradictionStatus>,
        scope: Option<&str>,
    ) -> Result<Vec<Contradiction>> {
        let state = self.read();
        let mut list: Vec<Contradiction> = state
            .contradictions
            .values()
            .filter(|c| status.map(|s| c.status == s).unwrap_or(true))
            .filter(|c| state.in_scope(&c.chunk_a_id, scope))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn contradictions_for_chunk(&self, chunk_id: &str) -> Result<Vec<Contradiction>> {
        let state = self.read();
        let mut list: Vec<Contradiction> = state
            .contradictions
            .values()
            .filter(|c| c.involves(chunk_id))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn chunks_with_open_contradictions(
        &self,
        chunk_ids: &[String],
    ) -> Result<HashSet<String>> {
        let state = self.read();
        Ok(chunk_ids
            .iter()
            .filter(|id| {
                state
                    .contradictions
                    .values()
                    .any(|c| c.status.is_open() && c.involves(id))
            })
            .cloned()
            .collect())
    }

    async fn mark_in_review(&self, id: &str) -> Result<Contradiction> {
        let mut state = self.write();
        let contradiction = state
            .contradictions
            .get_mut(id)
            .ok_or_else(|| DedupError::not_found("contradiction", id))?;
        if !contradiction.status.is_open() {
            return Err(DedupError::conflict(format!(
                "contradiction {} is already {}",
                id, contradiction.status
            )));
        }
        contradiction.status = ContradictionStatus::InReview;
        Ok(contradiction.clone())
    }

    async fn resolve_contradiction(
        &self,
        id: &str,
        resolution: &Resolution,
    ) -> Result<Contradiction> {
        let mut state = self.write();
        let current = state
            .contradictions
            .get(id)
            .cloned()
            .ok_or_else(|| DedupError::not_found("contradiction", id))?;
        if !current.status.is_open() {
            return Err(DedupError::conflict(format!(
                "contradiction {} is already {}",
                id, current.status
            )));
        }
        for chunk_id in [&current.chunk_a_id, &current.chunk_b_id] {
            if !state.chunks.contains_key(chunk_id.as_str()) {
                return Err(DedupError::not_found("chunk", chunk_id.as_str()));
            }
        }

        let ts = now();
        match resolution.action {
            ResolutionAction::KeepA => state.archive(&current.chunk_b_id, ts),
            ResolutionAction::KeepB => state.archive(&current.chunk_a_id, ts),
            ResolutionAction::ArchiveBoth => {
                state.archive(&current.chunk_a_id, ts);
                state.archive(&current.chunk_b_id, ts);
            }
            ResolutionAction::KeepBoth => {
                let note = serde_json::json!({
                    "contradiction_id": id,
                    "notes": resolution.notes,
                    "resolved_by": resolution.resolved_by,
                });
                for chunk_id in [&current.chunk_a_id, &current.chunk_b_id] {
                    if let Some(chunk) = state.chunks.get_mut(chunk_id.as_str()) {
                        if !chunk.metadata.is_object() {
                            chunk.metadata = serde_json::json!({});
                        }
                        chunk.metadata["disambiguation"] = note.clone();
                    }
                }
            }
            ResolutionAction::Merge | ResolutionAction::Dismiss => {}
        }

        let contradiction = state
            .contradictions
            .get_mut(id)
            .ok_or_else(|| DedupError::not_found("contradiction", id))?;
        contradiction.status = if resolution.action == ResolutionAction::Dismiss {
            ContradictionStatus::Dismissed
        } else {
            ContradictionStatus::Resolved
        };
        contradiction.resolution_action = Some(resolution.action);
        contradiction.resolution_notes = resolution.notes.clone();
        contradiction.resolved_by = Some(resolution.resolved_by.clone());
        contradiction.preferred_chunk_id = resolution.preferred_id.clone();
        contradiction.resolved_at = Some(ts);
        Ok(contradiction.clone())
    }

    async fn contradiction_stats(&self, scope: Option<&str>) -> Result<ContradictionStats> {
        let state = self.read();
        let mut stats = ContradictionStats::default();
        for c in state
            .contradictions
            .values()
            .filter(|c| state.in_scope(&c.chunk_a_id, scope))
        {
            stats.total += 1;
            *stats.by_status.entry(c.status.to_string()).or_default() += 1;
            *stats.by_severity.entry(c.severity.to_string()).or_default() += 1;
            if let Some(action) = c.resolution_action {
                *stats.by_action.entry(action.to_string()).or_default() += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl ReviewStore for InMemoryStore {
    async fn enqueue_review(&self, review: &PendingReview) -> Result<()> {
        self.write()
            .reviews
            .insert(review.id.clone(), review.clone());
        Ok(())
    }

    async fn get_review(&self, id: &str) -> Result<Option<PendingReview>> {
        Ok(self.read().reviews.get(id).cloned())
    }

    async fn review_for_chunk(&self, chunk_id: &str) -> Result<Option<PendingReview>> {
        Ok(self
            .read()
            .reviews
            .values()
            .find(|r| r.chunk_id == chunk_id)
            .cloned())
    }

    async fn list_reviews(&self, scope: Option<&str>) -> Result<Vec<PendingReview>> {
        let state = self.read();
        let mut reviews: Vec<PendingReview> = state
            .reviews
            .values()
            .filter(|r| scope.is_none() || r.project.as_deref() == scope)
            .cloned()
            .collect();
        reviews.sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then(a.id.cmp(&b.id)));
        Ok(reviews)
    }

    async fn take_review(&self, id: &str) -> Result<Option<PendingReview>> {
        Ok(self.write().reviews.remove(id))
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, job: &BatchJob) -> Result<()> {
        let mut state = self.write();
        if state.jobs.contains_key(&job.id) {
            return Err(DedupError::conflict(format!("job {} already exists", job.id)));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<BatchJob>> {
        Ok(self.read().jobs.get(id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<BatchJob>> {
        let state = self.read();
        let mut jobs: Vec<BatchJob> = state
            .jobs
            .values()
            .filter(|j| filter.state.map(|s| j.state == s).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn save_job(&self, job: &BatchJob, expected: JobState) -> Result<bool> {
        let mut state = self.write();
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| DedupError::not_found("job", &job.id))?;
        if stored.state != expected {
            return Ok(false);
        }
        *stored = job.clone();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk(id: &str, embedding: Vec<f32>) -> Chunk {
        let mut c = Chunk::new(format!("content of {}", id), embedding);
        c.id = id.to_string();
        c
    }

    async fn seeded(ids: &[&str]) -> InMemoryStore {
        let store = InMemoryStore::new();
        for (i, id) in ids.iter().enumerate() {
            store
                .insert_chunk(&chunk(id, vec![1.0, i as f32 * 0.01]))
                .await
                .unwrap();
        }
        store
    }

    fn filter(threshold: f64) -> VectorFilter {
        VectorFilter {
            threshold,
            limit: 10,
            scope: None,
            include_archived: false,
        }
    }

    #[tokio::test]
    async fn create_canonical_twice_conflicts() {
        let store = seeded(&["a"]).await;
        let record = store.create_canonical("a").await.unwrap();
        assert_eq!(record.merge_count, 1);
        let err = store.create_canonical("a").await.unwrap_err();
        assert!(matches!(err, DedupError::Conflict(_)));
    }

    #[tokio::test]
    async fn merge_then_lookup_variant() {
        let store = seeded(&["a", "b"]).await;
        let record = store.create_canonical("a").await.unwrap();
        let variant = store
            .merge_variant(&record.id, "b", VariantRelation::Equivalent, 0.97)
            .await
            .unwrap();
        assert_eq!(variant.variant_chunk_id, "b");

        let membership = store.get_membership("b").await.unwrap().unwrap();
        assert_eq!(membership.role, MembershipRole::Variant);
        assert_eq!(membership.record.id, record.id);
        assert_eq!(membership.record.merge_count, 2);

        let err = store.create_canonical("b").await.unwrap_err();
        assert!(matches!(err, DedupError::Conflict(_)));
    }

    #[tokio::test]
    async fn canonical_chunk_cannot_become_variant_elsewhere() {
        let store = seeded(&["a", "b"]).await;
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
    async fn concurrent_merges_never_lose_updates() {
        let ids: Vec<String> = (0..32).map(|i| format!("v{:02}", i)).collect();
        let mut all: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
        all.push("root");
        let store = Arc::new(seeded(&all).await);
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
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let record = store.get_canonical(&record.id).await.unwrap().unwrap();
        assert_eq!(record.merge_count, 33);
        assert_eq!(store.get_variants(&record.id).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn promote_swaps_roles_and_keeps_count() {
        let store = seeded(&["a", "b", "c"]).await;
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
    async fn promote_rejects_non_variant() {
        let store = seeded(&["a", "b"]).await;
        let record = store.create_canonical("a").await.unwrap();
        let err = store.promote_variant(&record.id, "b").await.unwrap_err();
        assert!(matches!(err, DedupError::Validation(_)));
    }

    #[tokio::test]
    async fn detach_restores_standalone() {
        let store = seeded(&["a", "b"]).await;
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
        let store = seeded(&["a", "b", "c"]).await;
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
        let record = store.get_canonical(&record.id).await.unwrap().unwrap();
        assert_eq!(record.canonical_chunk_id, "c");
        assert_eq!(record.merge_count, 2);
        assert!(store.get_membership("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn archiving_lone_canonical_retires_record() {
        let store = seeded(&["a"]).await;
        let record = store.create_canonical("a").await.unwrap();
        store.archive_chunk("a").await.unwrap();
        let record = store.get_canonical(&record.id).await.unwrap().unwrap();
        assert!(record.retired_at.is_some());
        assert!(store.get_membership("a").await.unwrap().is_none());
        let hits = store.vector_search(&[1.0, 0.0], &filter(0.0)).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn supersede_standalone_creates_record_for_replacement() {
        let store = seeded(&["old", "new"]).await;
        let record = store.supersede("old", "new").await.unwrap();
        assert_eq!(record.canonical_chunk_id, "new");
        assert!(store.get_chunk("old").await.unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn supersede_canonical_keeps_variants() {
        let store = seeded(&["old", "dup", "new"]).await;
        let record = store.create_canonical("old").await.unwrap();
        store
            .merge_variant(&record.id, "dup", VariantRelation::Equivalent, 0.99)
            .await
            .unwrap();
        let updated = store.supersede("old", "new").await.unwrap();
        assert_eq!(updated.id, record.id);
        assert_eq!(updated.canonical_chunk_id, "new");
        assert_eq!(updated.merge_count, 2);
    }

    #[tokio::test]
    async fn vector_search_respects_threshold_scope_and_order() {
        let store = InMemoryStore::new();
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
        let store = seeded(&["c", "a", "d", "b"]).await;
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
        let store = InMemoryStore::new();
        let mut job = BatchJob::new(Default::default());
        store.create_job(&job).await.unwrap();
        job.transition(JobState::Running).unwrap();
        assert!(store.save_job(&job, JobState::Pending).await.unwrap());
        job.processed = 5;
        assert!(!store.save_job(&job, JobState::Pending).await.unwrap());
        assert_eq!(store.get_job(&job.id).await.unwrap().unwrap().processed, 0);
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
        let store = seeded(&["a", "b"]).await;
        store.enqueue_review(&review("r-a", "a")).await.unwrap();
        store.enqueue_review(&review("r-b", "b")).await.unwrap();

        store.archive_chunk("a").await.unwrap();
        assert!(store.review_for_chunk("a").await.unwrap().is_none());
        assert!(store.get_review("r-b").await.unwrap().is_some());

        store.insert_chunk(&chunk("c", vec![1.0, 0.0])).await.unwrap();
        store.supersede("b", "c").await.unwrap();
        assert!(store.get_review("r-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn take_review_hands_it_out_once() {
        let store = seeded(&["a"]).await;
        store.enqueue_review(&review("r-1", "a")).await.unwrap();
        assert_eq!(store.take_review("r-1").await.unwrap().unwrap().chunk_id, "a");
        assert!(store.take_review("r-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn absorb_standalone_subset_creates_record_for_superset() {
        let store = seeded(&["small", "big"]).await;
        let absorbed = store.absorb_subset("small", "big", 0.9).await.unwrap();
        assert!(absorbed.created);
        assert!(!absorbed.demoted);
        assert_eq!(absorbed.record.canonical_chunk_id, "big");
        assert_eq!(absorbed.record.merge_count, 2);
        let variants = store.get_variants(&absorbed.record.id).await.unwrap();
        assert_eq!(variants[0].variant_chunk_id, "small");
        assert_eq!(variants[0].relationship, VariantRelation::Subset);
    }

    #[tokio::test]
    async fn absorb_canonical_subset_hands_over_the_slot() {
        let store = seeded(&["small", "twin", "big"]).await;
        let record = store.create_canonical("small").await.unwrap();
        store
            .merge_variant(&record.id, "twin", VariantRelation::Equivalent, 0.99)
            .await
            .unwrap();

        let absorbed = store.absorb_subset("small", "big", 0.9).await.unwrap();
        assert!(absorbed.demoted);
        assert_eq!(absorbed.record.id, record.id);
        assert_eq!(absorbed.record.canonical_chunk_id, "big");
        assert_eq!(absorbed.record.merge_count, 3);
        let small = store.get_membership("small").await.unwrap().unwrap();
        assert_eq!(small.role, MembershipRole::Variant);
    }

    #[tokio::test]
    async fn absorb_into_variant_joins_its_record() {
        let store = seeded(&["root", "small", "big"]).await;
        let record = store.create_canonical("root").await.unwrap();
        store
            .merge_variant(&record.id, "small", VariantRelation::Equivalent, 0.99)
            .await
            .unwrap();

        let absorbed = store.absorb_subset("small", "big", 0.9).await.unwrap();
        assert_eq!(absorbed.variant_chunk_id, "big");
        assert_eq!(absorbed.record.canonical_chunk_id, "root");
        assert_eq!(absorbed.record.merge_count, 3);
    }

    #[tokio::test]
    async fn failed_absorb_leaves_superset_standalone() {
        let store = seeded(&["small", "big"]).await;
        store.archive_chunk("small").await.unwrap();
        let err = store.absorb_subset("small", "big", 0.9).await.unwrap_err();
        assert!(matches!(err, DedupError::Validation(_)));
        assert!(store.get_membership("big").await.unwrap().is_none());
        assert!(store.read().records.is_empty());
    }
}
