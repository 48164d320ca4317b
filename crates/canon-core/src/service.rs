//! The public API boundary.
//!
//! [`DedupService`] checks the [`EntitlementGate`] once per call. Unentitled
//! callers get neutral results instead of errors: ingestion stores the chunk
//! without deduplicating it, reads come back empty, and decisions are not
//! applied (`None`). Batch reconciliation is the exception and refuses with
//! [`DedupError::Authorization`].

use std::sync::Arc;

use tracing::debug;

use crate::access::{authorize, Caller, EntitlementGate, Grant};
use crate::batch::{BatchReconciliationJob, BatchResult, ProgressObserver};
use crate::classifier::RelationshipClassifier;
use crate::error::{DedupError, Result};
use crate::events::EventSink;
use crate::job::{BatchJob, BatchOptions, JobFilter};
use crate::models::{
    CanonicalRecord, Chunk, ChunkLink, ChunkProvenance, ChunkVariant, Contradiction,
    ContradictionStatus, DeduplicationAction, PendingReview, Resolution, ResolutionAction,
};
use crate::orchestrator::{
    DedupOptions, DeduplicationOrchestrator, ManualOutcome, ProcessOutcome, RankedCandidate,
    ReviewDecision,
};
use crate::retrieval::{RetrievalFilter, SearchOptions, SearchResult};
use crate::store::{ContradictionStats, DedupStore};

pub struct DedupService<S> {
    store: Arc<S>,
    gate: Arc<dyn EntitlementGate>,
    orchestrator: Arc<DeduplicationOrchestrator<S>>,
    retrieval: RetrievalFilter<S>,
    batch: Arc<BatchReconciliationJob<S>>,
    options: DedupOptions,
}

impl<S: DedupStore> DedupService<S> {
    pub fn new(
        store: Arc<S>,
        classifier: Arc<RelationshipClassifier>,
        gate: Arc<dyn EntitlementGate>,
        events: Arc<dyn EventSink>,
        options: DedupOptions,
    ) -> Result<Self> {
        options.validate()?;
        let orchestrator = Arc::new(DeduplicationOrchestrator::new(
            store.clone(),
            classifier,
            events.clone(),
        ));
        let batch = Arc::new(BatchReconciliationJob::new(
            store.clone(),
            orchestrator.clone(),
            options.clone(),
            events,
        ));
        Ok(Self {
            retrieval: RetrievalFilter::new(store.clone()),
            store,
            gate,
            orchestrator,
            batch,
            options,
        })
    }

    pub fn options(&self) -> &DedupOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The batch runner, for in-process stop requests.
    pub fn batch(&self) -> &Arc<BatchReconciliationJob<S>> {
        &self.batch
    }

    fn grant(&self, caller: &Caller) -> Option<Grant> {
        match authorize(self.gate.as_ref(), caller) {
            Ok(grant) => Some(grant),
            Err(err) => {
                debug!(caller = %caller.id, error = %err, "neutral result for unentitled caller");
                None
            }
        }
    }

    fn require(&self, caller: &Caller) -> Result<Grant> {
        authorize(self.gate.as_ref(), caller)
    }

    /// Store a new chunk with its provenance, then deduplicate it.
    pub async fn ingest(&self, caller: &Caller, chunk: &Chunk) -> Result<ProcessOutcome> {
        self.store.insert_chunk(chunk).await?;
        self.store
            .record_provenance(&ChunkProvenance::for_chunk(chunk))
            .await?;
        self.process_item(caller, chunk).await
    }

    pub async fn process_item(&self, caller: &Caller, chunk: &Chunk) -> Result<ProcessOutcome> {
        if self.grant(caller).is_none() {
            return Ok(ProcessOutcome {
                chunk_id: chunk.id.clone(),
                canonical_id: None,
                action: DeduplicationAction::StoredAsNew,
                merged_from_id: None,
                linked_ids: Vec::new(),
                contradiction_id: None,
                review_id: None,
                duration_ms: 0,
            });
        }
        self.orchestrator.process_item(chunk, &self.options).await
    }

    pub async fn search_similar(
        &self,
        caller: &Caller,
        embedding: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if self.grant(caller).is_none() {
            return Ok(Vec::new());
        }
        self.retrieval.search_similar(embedding, options).await
    }

    pub async fn find_duplicates(
        &self,
        caller: &Caller,
        chunk_id: &str,
        threshold: f64,
    ) -> Result<Vec<RankedCandidate>> {
        if self.grant(caller).is_none() {
            return Ok(Vec::new());
        }
        let chunk = self.chunk(chunk_id).await?;
        self.orchestrator
            .find_duplicates(&chunk, threshold, &self.options)
            .await
    }

    pub async fn get_chunk(&self, caller: &Caller, chunk_id: &str) -> Result<Option<Chunk>> {
        if self.grant(caller).is_none() {
            return Ok(None);
        }
        self.store.get_chunk(chunk_id).await
    }

    pub async fn get_canonical(&self, caller: &Caller, id: &str) -> Result<Option<CanonicalRecord>> {
        if self.grant(caller).is_none() {
            return Ok(None);
        }
        self.store.get_canonical(id).await
    }

    pub async fn get_canonical_for_chunk(
        &self,
        caller: &Caller,
        chunk_id: &str,
    ) -> Result<Option<CanonicalRecord>> {
        if self.grant(caller).is_none() {
            return Ok(None);
        }
        self.orchestrator
            .canonical()
            .get_canonical_for_chunk(chunk_id)
            .await
    }

    pub async fn get_variants(&self, caller: &Caller, canonical_id: &str) -> Result<Vec<ChunkVariant>> {
        if self.grant(caller).is_none() {
            return Ok(Vec::new());
        }
        self.orchestrator.canonical().get_variants(canonical_id).await
    }

    pub async fn get_links(&self, caller: &Caller, chunk_id: &str) -> Result<Vec<ChunkLink>> {
        if self.grant(caller).is_none() {
            return Ok(Vec::new());
        }
        self.orchestrator.canonical().get_links(chunk_id).await
    }

    pub async fn get_provenance(
        &self,
        caller: &Caller,
        canonical_id: &str,
    ) -> Result<Vec<ChunkProvenance>> {
        if self.grant(caller).is_none() {
            return Ok(Vec::new());
        }
        self.orchestrator.canonical().get_provenance(canonical_id).await
    }

    pub async fn promote_variant(
        &self,
        caller: &Caller,
        canonical_id: &str,
        chunk_id: &str,
        reason: &str,
    ) -> Result<Option<CanonicalRecord>> {
        let Some(grant) = self.grant(caller) else {
            return Ok(None);
        };
        let reason = format!("{} (by {})", reason, grant.caller().id);
        self.orchestrator
            .canonical()
            .promote_variant(canonical_id, chunk_id, &reason)
            .await
            .map(Some)
    }

    pub async fn detach_variant(
        &self,
        caller: &Caller,
        chunk_id: &str,
    ) -> Result<Option<CanonicalRecord>> {
        if self.grant(caller).is_none() {
            return Ok(None);
        }
        self.orchestrator
            .canonical()
            .detach_variant(chunk_id)
            .await
            .map(Some)
    }

    pub async fn list_contradictions(
        &self,
        caller: &Caller,
        status: Option<ContradictionStatus>,
        scope: Option<&str>,
    ) -> Result<Vec<Contradiction>> {
        if self.grant(caller).is_none() {
            return Ok(Vec::new());
        }
        let registry = self.orchestrator.contradictions();
        match status {
            Some(ContradictionStatus::Pending) => registry.get_pending(scope).await,
            other => registry.list(other, scope).await,
        }
    }

    pub async fn get_contradiction(&self, caller: &Caller, id: &str) -> Result<Option<Contradiction>> {
        if self.grant(caller).is_none() {
            return Ok(None);
        }
        self.orchestrator.contradictions().get_by_id(id).await.map(Some)
    }

    pub async fn contradictions_for_chunk(
        &self,
        caller: &Caller,
        chunk_id: &str,
    ) -> Result<Vec<Contradiction>> {
        if self.grant(caller).is_none() {
            return Ok(Vec::new());
        }
        self.orchestrator.contradictions().get_for_chunk(chunk_id).await
    }

    pub async fn mark_in_review(&self, caller: &Caller, id: &str) -> Result<Option<Contradiction>> {
        if self.grant(caller).is_none() {
            return Ok(None);
        }
        self.orchestrator.contradictions().mark_in_review(id).await.map(Some)
    }

    /// Resolve a contradiction; the caller is recorded as the resolver.
    pub async fn resolve_contradiction(
        &self,
        caller: &Caller,
        id: &str,
        action: ResolutionAction,
        preferred_id: Option<String>,
        notes: Option<String>,
    ) -> Result<Option<Contradiction>> {
        let Some(grant) = self.grant(caller) else {
            return Ok(None);
        };
        let resolution = Resolution {
            action,
            preferred_id,
            notes,
            resolved_by: grant.caller().id.clone(),
        };
        self.orchestrator
            .contradictions()
            .resolve(id, &resolution)
            .await
            .map(Some)
    }

    pub async fn contradiction_stats(
        &self,
        caller: &Caller,
        scope: Option<&str>,
    ) -> Result<ContradictionStats> {
        if self.grant(caller).is_none() {
            return Ok(ContradictionStats::default());
        }
        self.orchestrator.contradictions().stats(scope).await
    }

    pub async fn get_pending_reviews(
        &self,
        caller: &Caller,
        scope: Option<&str>,
    ) -> Result<Vec<PendingReview>> {
        if self.grant(caller).is_none() {
            return Ok(Vec::new());
        }
        self.orchestrator.get_pending_reviews(scope).await
    }

    pub async fn decide_review(
        &self,
        caller: &Caller,
        review_id: &str,
        decision: &ReviewDecision,
    ) -> Result<Option<ManualOutcome>> {
        let Some(grant) = self.grant(caller) else {
            return Ok(None);
        };
        self.orchestrator
            .process_manual_decision(review_id, decision, &grant.caller().id)
            .await
            .map(Some)
    }

    pub async fn start_batch(&self, caller: &Caller, options: BatchOptions) -> Result<BatchJob> {
        self.require(caller)?;
        self.batch.start(options).await
    }

    pub async fn run_batch(
        &self,
        caller: &Caller,
        job_id: &str,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<BatchResult> {
        self.require(caller)?;
        self.batch.run(job_id, observer).await
    }

    pub async fn execute_batch(
        &self,
        caller: &Caller,
        options: BatchOptions,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<BatchResult> {
        self.require(caller)?;
        self.batch.execute(options, observer).await
    }

    pub async fn resume_batch(
        &self,
        caller: &Caller,
        job_id: &str,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<BatchResult> {
        self.require(caller)?;
        self.batch.resume(job_id, observer).await
    }

    pub async fn batch_status(&self, caller: &Caller, job_id: &str) -> Result<BatchJob> {
        self.require(caller)?;
        self.batch.get_status(job_id).await
    }

    pub async fn list_batches(&self, caller: &Caller, filter: &JobFilter) -> Result<Vec<BatchJob>> {
        self.require(caller)?;
        self.batch.list_jobs(filter).await
    }

    pub async fn cancel_batch(&self, caller: &Caller, job_id: &str) -> Result<BatchJob> {
        self.require(caller)?;
        self.batch.cancel(job_id).await
    }

    pub async fn pause_batch(&self, caller: &Caller, job_id: &str) -> Result<BatchJob> {
        self.require(caller)?;
        self.batch.pause(job_id).await
    }

    async fn chunk(&self, chunk_id: &str) -> Result<Chunk> {
        self.store
            .get_chunk(chunk_id)
            .await?
            .ok_or_else(|| DedupError::not_found("chunk", chunk_id))
    }
}
