//! Storage abstraction for Canon.
//!
//! The persistent store is the single source of truth. Each trait method
//! that mutates more than one row is a unit of work: it either commits all
//! of its effects or none of them, so the invariants below hold after every
//! completed call.
//!
//! - A chunk is at most one of standalone, canonical chunk, or variant chunk.
//! - `merge_count == 1 + variants` for every live canonical record.
//! - At most one open contradiction exists per unordered chunk pair.
//! - Archived chunks are never canonical, never variants, and never returned
//!   by vector search unless explicitly requested.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::Result;
use crate::job::{BatchJob, JobFilter, JobState};
use crate::models::{
    CanonicalRecord, Chunk, ChunkLink, ChunkProvenance, ChunkVariant, Contradiction,
    ContradictionStatus, Membership, PendingReview, Resolution, SimilarityMatch, VariantRelation,
};

/// Parameters of a vector query.
#[derive(Debug, Clone)]
pub struct VectorFilter {
    /// Minimum similarity score, inclusive.
    pub threshold: f64,
    pub limit: usize,
    /// Only chunks of this project.
    pub scope: Option<String>,
    pub include_archived: bool,
}

/// Contradiction counts grouped by status, severity, and resolution action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContradictionStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub by_action: BTreeMap<String, u64>,
}

/// What [`CanonicalStore::absorb_subset`] changed.
#[derive(Debug, Clone, PartialEq)]
pub struct Absorption {
    pub record: CanonicalRecord,
    /// The chunk that ended up as a variant.
    pub variant_chunk_id: String,
    /// A new record was created for the superset.
    pub created: bool,
    /// The subset was canonical and now is a `Demoted` variant.
    pub demoted: bool,
}

/// Chunk persistence plus the vector queries the similarity index runs.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert a new chunk. Fails with `Conflict` if the id exists.
    async fn insert_chunk(&self, chunk: &Chunk) -> Result<()>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>>;

    /// Fetch several chunks; missing ids are omitted.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>>;

    /// Soft-delete a chunk and drop its canonical membership and queued
    /// review in one unit of work.
    ///
    /// A variant row is removed (merge count decremented). A canonical chunk
    /// with variants hands its record to the highest-similarity variant; one
    /// without variants retires the record. Archiving twice is a no-op.
    async fn archive_chunk(&self, id: &str) -> Result<()>;

    /// Set `metadata[key] = value` on a chunk.
    async fn annotate_chunk(&self, id: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// Unarchived chunks with id greater than `cursor`, ordered by id.
    async fn list_chunks_after(
        &self,
        cursor: Option<&str>,
        limit: usize,
        scope: Option<&str>,
    ) -> Result<Vec<Chunk>>;

    /// Number of unarchived chunks in scope.
    async fn count_chunks(&self, scope: Option<&str>) -> Result<u64>;

    /// Nearest neighbours of `embedding`, descending by score.
    async fn vector_search(
        &self,
        embedding: &[f32],
        filter: &VectorFilter,
    ) -> Result<Vec<SimilarityMatch>>;

    /// Nearest neighbours for several embeddings in a single pass over the index.
    ///
    /// The result has one entry per input embedding, in input order.
    async fn vector_search_batch(
        &self,
        embeddings: &[Vec<f32>],
        filter: &VectorFilter,
    ) -> Result<Vec<Vec<SimilarityMatch>>>;
}

/// Canonical records, variants, links, and provenance.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Create a record with `merge_count = 1`.
    ///
    /// `Conflict` if the chunk is already canonical or a variant.
    async fn create_canonical(&self, chunk_id: &str) -> Result<CanonicalRecord>;

    async fn get_canonical(&self, id: &str) -> Result<Option<CanonicalRecord>>;

    /// Insert the variant row and increment `merge_count` together.
    async fn merge_variant(
        &self,
        canonical_id: &str,
        variant_chunk_id: &str,
        relation: VariantRelation,
        similarity: f64,
    ) -> Result<ChunkVariant>;

    /// Whether the chunk is canonical or a variant of a live record.
    async fn get_membership(&self, chunk_id: &str) -> Result<Option<Membership>>;

    /// Memberships for several chunks; standalone chunks are absent from the map.
    async fn get_memberships(&self, chunk_ids: &[String]) -> Result<HashMap<String, Membership>>;

    async fn get_variants(&self, canonical_id: &str) -> Result<Vec<ChunkVariant>>;

    /// Swap roles: the variant becomes canonical, the old canonical chunk a
    /// `Demoted` variant. `merge_count` is unchanged.
    async fn promote_variant(
        &self,
        canonical_id: &str,
        new_canonical_chunk_id: &str,
    ) -> Result<CanonicalRecord>;

    /// Fold a standalone superset chunk together with `subset_chunk_id`, in
    /// one unit of work.
    ///
    /// - subset standalone: a new record with the superset canonical and the
    ///   subset as a `Subset` variant.
    /// - subset canonical: the superset takes the canonical slot and the
    ///   subset becomes a `Demoted` variant.
    /// - subset a variant: the superset joins the same record as a `Subset`
    ///   variant.
    ///
    /// `merge_count` grows by one in every case.
    async fn absorb_subset(
        &self,
        subset_chunk_id: &str,
        superset_chunk_id: &str,
        similarity: f64,
    ) -> Result<Absorption>;

    /// Remove the variant row and decrement `merge_count`.
    async fn detach_variant(&self, variant_chunk_id: &str) -> Result<CanonicalRecord>;

    /// The replacement takes the outdated chunk's place and the outdated
    /// chunk is archived, in one unit of work.
    async fn supersede(
        &self,
        outdated_chunk_id: &str,
        replacement_chunk_id: &str,
    ) -> Result<CanonicalRecord>;

    /// Create a link; returns the existing link for the same unordered pair.
    async fn create_link(&self, link: &ChunkLink) -> Result<ChunkLink>;

    async fn get_links(&self, chunk_id: &str) -> Result<Vec<ChunkLink>>;

    async fn record_provenance(&self, provenance: &ChunkProvenance) -> Result<()>;

    /// Provenance of the canonical chunk and all current variants.
    async fn get_provenance(&self, canonical_id: &str) -> Result<Vec<ChunkProvenance>>;
}

/// Contradiction persistence and audited resolution.
#[async_trait]
pub trait ContradictionStore: Send + Sync {
    /// Insert `contradiction` unless an open one exists for the same pair.
    ///
    /// Returns the stored record and whether it was newly created.
    async fn flag_contradiction(&self, contradiction: &Contradiction)
        -> Result<(Contradiction, bool)>;

    async fn get_contradiction(&self, id: &str) -> Result<Option<Contradiction>>;

    /// Contradictions filtered by status and by the project of chunk A.
    async fn list_contradictions(
        &self,
        status: Option<ContradictionStatus>,
        scope: Option<&str>,
    ) -> Result<Vec<Contradiction>>;

    async fn contradictions_for_chunk(&self, chunk_id: &str) -> Result<Vec<Contradiction>>;

    /// Subset of `chunk_ids` involved in at least one open contradiction.
    async fn chunks_with_open_contradictions(&self, chunk_ids: &[String])
        -> Result<HashSet<String>>;

    /// `Pending -> InReview`.
    async fn mark_in_review(&self, id: &str) -> Result<Contradiction>;

    /// Apply the resolution's side effects and status change in one unit of work.
    ///
    /// `Conflict` if the contradiction is already resolved or dismissed.
    async fn resolve_contradiction(&self, id: &str, resolution: &Resolution)
        -> Result<Contradiction>;

    async fn contradiction_stats(&self, scope: Option<&str>) -> Result<ContradictionStats>;
}

/// Queue of ambiguous items awaiting a human decision.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn enqueue_review(&self, review: &PendingReview) -> Result<()>;

    async fn get_review(&self, id: &str) -> Result<Option<PendingReview>>;

    /// The queued review for a chunk, if any.
    async fn review_for_chunk(&self, chunk_id: &str) -> Result<Option<PendingReview>>;

    /// Reviews ordered by queue time.
    async fn list_reviews(&self, scope: Option<&str>) -> Result<Vec<PendingReview>>;

    /// Delete a review and return it. Of several concurrent callers only one
    /// gets `Some`.
    async fn take_review(&self, id: &str) -> Result<Option<PendingReview>>;
}

/// Batch job persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &BatchJob) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<BatchJob>>;

    /// Jobs newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<BatchJob>>;

    /// Write state, counters, checkpoint, and stats together, but only if
    /// the persisted state still equals `expected`. Returns whether it applied.
    async fn save_job(&self, job: &BatchJob, expected: JobState) -> Result<bool>;
}

/// Everything the deduplication pipeline needs from one backend.
pub trait DedupStore: ChunkStore + CanonicalStore + ContradictionStore + ReviewStore + JobStore {}

impl<T> DedupStore for T where
    T: ChunkStore + CanonicalStore + ContradictionStore + ReviewStore + JobStore
{
}
