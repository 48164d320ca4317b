//! Per-item deduplication.
//!
//! [`DeduplicationOrchestrator::process_item`] runs in two phases:
//!
//! 1. [`decide`](DeduplicationOrchestrator::decide) finds candidates,
//!    classifies them, ranks by (confidence desc, similarity desc), picks the
//!    first definitive candidate, and turns it into a [`Plan`]. Nothing is
//!    written, which is what dry runs and previews rely on.
//! 2. [`execute`](DeduplicationOrchestrator::execute) applies the plan
//!    through the canonical service, contradiction registry, and review queue.
//!
//! Candidate lookup and classification failures degrade the item to
//! `StoredAsNew` so ingestion is never blocked. Store failures while
//! applying the chosen action propagate for that item only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::canonical::CanonicalService;
use crate::classifier::{ChunkPair, RelationshipClassifier};
use crate::contradiction::ContradictionRegistry;
use crate::error::{DedupError, Result};
use crate::events::{DomainEvent, EventSink};
use crate::models::{
    Chunk, DeduplicationAction, PendingReview, RelationshipClassification,
    RelationshipType, ReviewCandidate, Severity, VariantRelation,
};
use crate::similarity::{SimilarityIndex, SimilarityQuery};
use crate::store::DedupStore;
use crate::vector::similarity_score;

/// Whether duplicates are searched within the chunk's project or globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    #[default]
    Project,
    Global,
}

#[derive(Debug, Clone)]
pub struct DedupOptions {
    pub similarity_threshold: f64,
    pub auto_merge_threshold: f64,
    /// Minimum classification confidence for an automatic merge.
    pub merge_confidence_threshold: f64,
    /// Unknown/Distinct results below this confidence go to review.
    pub review_confidence_threshold: f64,
    pub max_candidates: usize,
    pub require_confirmation: bool,
    pub enable_contradiction_detection: bool,
    pub enable_review_queue: bool,
    pub scope: DedupScope,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            auto_merge_threshold: 0.95,
            merge_confidence_threshold: 0.90,
            review_confidence_threshold: 0.70,
            max_candidates: 10,
            require_confirmation: false,
            enable_contradiction_detection: true,
            enable_review_queue: true,
            scope: DedupScope::Project,
        }
    }
}

impl DedupOptions {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("similarity_threshold", self.similarity_threshold),
            ("auto_merge_threshold", self.auto_merge_threshold),
            ("merge_confidence_threshold", self.merge_confidence_threshold),
            ("review_confidence_threshold", self.review_confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DedupError::validation(format!(
                    "{} must be in [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.auto_merge_threshold < self.similarity_threshold {
            return Err(DedupError::validation(
                "auto_merge_threshold must be >= similarity_threshold",
            ));
        }
        if self.max_candidates == 0 {
            return Err(DedupError::validation("max_candidates must be > 0"));
        }
        Ok(())
    }

    /// Project filter applied to candidate searches for `chunk`.
    pub fn scope_for(&self, chunk: &Chunk) -> Option<String> {
        match self.scope {
            DedupScope::Project => chunk.project.clone(),
            DedupScope::Global => None,
        }
    }
}

/// A classified candidate, in ranking order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedCandidate {
    pub chunk_id: String,
    pub similarity: f64,
    pub classification: RelationshipClassification,
}

/// What processing a chunk would do.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// The chunk is already canonical or a variant.
    AlreadyReconciled { canonical_id: String },
    /// The chunk already waits in the review queue.
    AlreadyQueued { review_id: String },
    StoreAsNew { reason: String },
    /// The new chunk becomes a variant of the target's record.
    Merge {
        target_chunk_id: String,
        similarity: f64,
        relation: VariantRelation,
    },
    /// The new chunk is a superset of the candidate and takes its place.
    AbsorbSubset {
        candidate_chunk_id: String,
        similarity: f64,
    },
    Link { targets: Vec<(String, f64)> },
    Flag {
        other_chunk_id: String,
        description: String,
        severity: Severity,
    },
    Supersede {
        outdated_chunk_id: String,
        replacement_chunk_id: String,
    },
    Queue {
        reason: String,
        candidates: Vec<ReviewCandidate>,
    },
}

impl Plan {
    pub fn action(&self) -> DeduplicationAction {
        match self {
            Self::AlreadyReconciled { .. } | Self::StoreAsNew { .. } => {
                DeduplicationAction::StoredAsNew
            }
            Self::Merge { .. } | Self::AbsorbSubset { .. } => {
                DeduplicationAction::MergedIntoExisting
            }
            Self::Link { .. } => DeduplicationAction::LinkedToExisting,
            Self::Flag { .. } => DeduplicationAction::FlaggedAsContradiction,
            Self::Supersede { .. } => DeduplicationAction::SupersededExisting,
            Self::AlreadyQueued { .. } | Self::Queue { .. } => DeduplicationAction::QueuedForReview,
        }
    }

    /// Chunks, other than the item itself, that the plan folds into a record.
    pub fn claimed_chunks(&self) -> Vec<&str> {
        match self {
            Self::Merge {
                target_chunk_id, ..
            } => vec![target_chunk_id.as_str()],
            Self::AbsorbSubset {
                candidate_chunk_id, ..
            } => vec![candidate_chunk_id.as_str()],
            Self::Supersede {
                outdated_chunk_id,
                replacement_chunk_id,
            } => vec![outdated_chunk_id.as_str(), replacement_chunk_id.as_str()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub plan: Plan,
    pub candidates: Vec<RankedCandidate>,
}

/// Result of processing one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    pub chunk_id: String,
    pub canonical_id: Option<String>,
    pub action: DeduplicationAction,
    /// The chunk that became a variant, when the action merged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_from_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub linked_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contradiction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_id: Option<String>,
    pub duration_ms: u64,
}

impl ProcessOutcome {
    fn new(chunk_id: &str, action: DeduplicationAction, canonical_id: Option<String>) -> Self {
        Self {
            chunk_id: chunk_id.to_string(),
            canonical_id,
            action,
            merged_from_id: None,
            linked_ids: Vec::new(),
            contradiction_id: None,
            review_id: None,
            duration_ms: 0,
        }
    }
}

/// A human decision on a queued review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Merge {
        target_chunk_id: String,
    },
    KeepSeparate,
    Link {
        target_chunk_id: String,
    },
    FlagContradiction {
        target_chunk_id: String,
        description: String,
        severity: Severity,
    },
    /// Archive the queued chunk.
    Delete,
}

impl ReviewDecision {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Merge { .. } => "merge",
            Self::KeepSeparate => "keep_separate",
            Self::Link { .. } => "link",
            Self::FlagContradiction { .. } => "flag_contradiction",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualOutcome {
    pub review_id: String,
    pub chunk_id: String,
    pub decision: &'static str,
    pub decided_by: String,
    pub canonical_id: Option<String>,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contradiction_id: Option<String>,
}

pub struct DeduplicationOrchestrator<S> {
    store: Arc<S>,
    index: SimilarityIndex<S>,
    classifier: Arc<RelationshipClassifier>,
    canonical: CanonicalService<S>,
    contradictions: ContradictionRegistry<S>,
    events: Arc<dyn EventSink>,
}

impl<S: DedupStore> DeduplicationOrchestrator<S> {
    pub fn new(
        store: Arc<S>,
        classifier: Arc<RelationshipClassifier>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            index: SimilarityIndex::new(store.clone()),
            canonical: CanonicalService::new(store.clone(), events.clone()),
            contradictions: ContradictionRegistry::new(store.clone(), events.clone()),
            store,
            classifier,
            events,
        }
    }

    pub fn canonical(&self) -> &CanonicalService<S> {
        &self.canonical
    }

    pub fn contradictions(&self) -> &ContradictionRegistry<S> {
        &self.contradictions
    }

    pub fn index(&self) -> &SimilarityIndex<S> {
        &self.index
    }

    /// Deduplicate a chunk that is already in the store.
    pub async fn process_item(&self, chunk: &Chunk, options: &DedupOptions) -> Result<ProcessOutcome> {
        let started = Instant::now();
        let decision = self.decide(chunk, options).await?;
        let mut outcome = self.execute(chunk, &decision).await?;
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            chunk_id = %chunk.id,
            action = %outcome.action,
            candidates = decision.candidates.len(),
            duration_ms = outcome.duration_ms,
            "item processed"
        );
        self.events.publish(DomainEvent::ItemProcessed {
            chunk_id: chunk.id.clone(),
            action: outcome.action,
        });
        Ok(outcome)
    }

    /// Plan the outcome for `chunk` without writing anything.
    pub async fn decide(&self, chunk: &Chunk, options: &DedupOptions) -> Result<Decision> {
        options.validate()?;

        if let Some(membership) = self.store.get_membership(&chunk.id).await? {
            return Ok(Decision {
                plan: Plan::AlreadyReconciled {
                    canonical_id: membership.record.id,
                },
                candidates: Vec::new(),
            });
        }
        if let Some(review) = self.store.review_for_chunk(&chunk.id).await? {
            return Ok(Decision {
                plan: Plan::AlreadyQueued {
                    review_id: review.id,
                },
                candidates: Vec::new(),
            });
        }

        let (candidates, chunks) = match self
            .classified_candidates(chunk, options.similarity_threshold, options)
            .await
        {
            Ok(found) => found,
            Err(err) => {
                warn!(chunk_id = %chunk.id, error = %err, "candidate lookup failed, storing as new");
                return Ok(Decision {
                    plan: Plan::StoreAsNew {
                        reason: format!("candidate lookup failed: {}", err),
                    },
                    candidates: Vec::new(),
                });
            }
        };

        if candidates.is_empty() {
            return Ok(Decision {
                plan: Plan::StoreAsNew {
                    reason: "no similar content".into(),
                },
                candidates,
            });
        }
        let best = candidates
            .iter()
            .find(|c| c.classification.relationship.is_definitive())
            .unwrap_or(&candidates[0]);

        let plan = match chunks.get(&best.chunk_id) {
            Some(other) => self.plan_for(chunk, other, best, &candidates, options).await,
            None => Plan::StoreAsNew {
                reason: format!("candidate {} disappeared", best.chunk_id),
            },
        };
        Ok(Decision { plan, candidates })
    }

    /// Apply a plan produced by [`decide`](Self::decide) for the same chunk.
    pub async fn execute(&self, chunk: &Chunk, decision: &Decision) -> Result<ProcessOutcome> {
        let action = decision.plan.action();
        match &decision.plan {
            Plan::AlreadyReconciled { canonical_id } => Ok(ProcessOutcome::new(
                &chunk.id,
                action,
                Some(canonical_id.clone()),
            )),
            Plan::AlreadyQueued { review_id } => {
                let mut outcome = ProcessOutcome::new(&chunk.id, action, None);
                outcome.review_id = Some(review_id.clone());
                Ok(outcome)
            }
            Plan::StoreAsNew { .. } => {
                let record = self.canonical.create_canonical(&chunk.id).await?;
                Ok(ProcessOutcome::new(&chunk.id, action, Some(record.id)))
            }
            Plan::Merge {
                target_chunk_id,
                similarity,
                relation,
            } => {
                let record = self
                    .canonical
                    .merge_into_chunk(target_chunk_id, &chunk.id, *relation, *similarity)
                    .await?;
                let mut outcome = ProcessOutcome::new(&chunk.id, action, Some(record.id));
                outcome.merged_from_id = Some(chunk.id.clone());
                Ok(outcome)
            }
            Plan::AbsorbSubset {
                candidate_chunk_id,
                similarity,
            } => self.absorb_subset(chunk, candidate_chunk_id, *similarity).await,
            Plan::Link { targets } => {
                let record = self.canonical.create_canonical(&chunk.id).await?;
                let mut outcome = ProcessOutcome::new(&chunk.id, action, Some(record.id));
                for (target, similarity) in targets {
                    self.canonical
                        .link(&chunk.id, target, RelationshipType::Complementary, *similarity)
                        .await?;
                    outcome.linked_ids.push(target.clone());
                }
                Ok(outcome)
            }
            Plan::Flag {
                other_chunk_id,
                description,
                severity,
            } => {
                let record = self.canonical.create_canonical(&chunk.id).await?;
                let contradiction = self
                    .contradictions
                    .flag(&chunk.id, other_chunk_id, description, *severity)
                    .await?;
                let mut outcome = ProcessOutcome::new(&chunk.id, action, Some(record.id));
                outcome.contradiction_id = Some(contradiction.id);
                Ok(outcome)
            }
            Plan::Supersede {
                outdated_chunk_id,
                replacement_chunk_id,
            } => {
                let record = self
                    .canonical
                    .supersede(outdated_chunk_id, replacement_chunk_id)
                    .await?;
                Ok(ProcessOutcome::new(&chunk.id, action, Some(record.id)))
            }
            Plan::Queue { reason, candidates } => {
                let review = PendingReview {
                    id: uuid::Uuid::new_v4().to_string(),
                    chunk_id: chunk.id.clone(),
                    project: chunk.project.clone(),
                    candidates: candidates.clone(),
                    reason: reason.clone(),
                    queued_at: chrono::Utc::now().timestamp(),
                };
                self.store.enqueue_review(&review).await?;
                self.events.publish(DomainEvent::ReviewQueued {
                    review_id: review.id.clone(),
                    chunk_id: chunk.id.clone(),
                });
                let mut outcome = ProcessOutcome::new(&chunk.id, action, None);
                outcome.review_id = Some(review.id);
                Ok(outcome)
            }
        }
    }

    /// Read-only preview of classified candidates above `threshold`.
    pub async fn find_duplicates(
        &self,
        chunk: &Chunk,
        threshold: f64,
        options: &DedupOptions,
    ) -> Result<Vec<RankedCandidate>> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DedupError::validation(format!(
                "threshold must be in [0, 1], got {}",
                threshold
            )));
        }
        let (candidates, _) = self.classified_candidates(chunk, threshold, options).await?;
        Ok(candidates)
    }

    pub async fn get_pending_reviews(&self, scope: Option<&str>) -> Result<Vec<PendingReview>> {
        self.store.list_reviews(scope).await
    }

    /// Carry out a reviewer's decision on a queued review.
    ///
    /// The review is taken off the queue before anything is applied, so
    /// concurrent decisions on the same review apply at most one of them;
    /// the others get `NotFound`. If applying fails the review is queued
    /// again.
    pub async fn process_manual_decision(
        &self,
        review_id: &str,
        decision: &ReviewDecision,
        decided_by: &str,
    ) -> Result<ManualOutcome> {
        let review = self
            .store
            .take_review(review_id)
            .await?
            .ok_or_else(|| DedupError::not_found("review", review_id))?;
        let chunk = self
            .store
            .get_chunk(&review.chunk_id)
            .await?
            .ok_or_else(|| DedupError::not_found("chunk", &review.chunk_id))?;

        match self.apply_decision(&chunk, &review, decision, decided_by).await {
            Ok(outcome) => {
                debug!(review_id, decision = decision.name(), decided_by, "review decided");
                Ok(outcome)
            }
            Err(err) => {
                if let Err(requeue) = self.store.enqueue_review(&review).await {
                    warn!(review_id, error = %requeue, "failed to requeue review");
                }
                Err(err)
            }
        }
    }

    async fn apply_decision(
        &self,
        chunk: &Chunk,
        review: &PendingReview,
        decision: &ReviewDecision,
        decided_by: &str,
    ) -> Result<ManualOutcome> {
        let mut outcome = ManualOutcome {
            review_id: review.id.clone(),
            chunk_id: chunk.id.clone(),
            decision: decision.name(),
            decided_by: decided_by.to_string(),
            canonical_id: None,
            archived: false,
            contradiction_id: None,
        };

        match decision {
            ReviewDecision::Merge { target_chunk_id } => {
                let similarity = self.similarity_to(chunk, review, target_chunk_id).await?;
                let record = self
                    .canonical
                    .merge_into_chunk(target_chunk_id, &chunk.id, VariantRelation::Manual, similarity)
                    .await?;
                outcome.canonical_id = Some(record.id);
            }
            ReviewDecision::KeepSeparate => {
                outcome.canonical_id = Some(self.ensure_canonical(&chunk.id).await?);
            }
            ReviewDecision::Link { target_chunk_id } => {
                let similarity = self.similarity_to(chunk, review, target_chunk_id).await?;
                outcome.canonical_id = Some(self.ensure_canonical(&chunk.id).await?);
                self.canonical
                    .link(&chunk.id, target_chunk_id, RelationshipType::Complementary, similarity)
                    .await?;
            }
            ReviewDecision::FlagContradiction {
                target_chunk_id,
                description,
                severity,
            } => {
                outcome.canonical_id = Some(self.ensure_canonical(&chunk.id).await?);
                let contradiction = self
                    .contradictions
                    .flag(&chunk.id, target_chunk_id, description, *severity)
                    .await?;
                outcome.contradiction_id = Some(contradiction.id);
            }
            ReviewDecision::Delete => {
                self.store.archive_chunk(&chunk.id).await?;
                outcome.archived = true;
            }
        }
        Ok(outcome)
    }

    async fn classified_candidates(
        &self,
        chunk: &Chunk,
        threshold: f64,
        options: &DedupOptions,
    ) -> Result<(Vec<RankedCandidate>, HashMap<String, Chunk>)> {
        let query = SimilarityQuery::new(threshold, options.max_candidates as i64 + 1)
            .scoped(options.scope_for(chunk));
        let mut matches = self.index.find_similar(&chunk.embedding, &query).await?;
        matches.retain(|m| m.chunk_id != chunk.id);
        matches.truncate(options.max_candidates);
        if matches.is_empty() {
            return Ok((Vec::new(), HashMap::new()));
        }

        let ids: Vec<String> = matches.iter().map(|m| m.chunk_id.clone()).collect();
        let chunks: HashMap<String, Chunk> = self
            .store
            .get_chunks(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let present: Vec<_> = matches
            .iter()
            .filter_map(|m| chunks.get(&m.chunk_id).map(|c| (m, c)))
            .collect();
        let pairs: Vec<ChunkPair<'_>> = present
            .iter()
            .map(|(m, c)| ChunkPair {
                a: chunk,
                b: c,
                similarity: m.score,
            })
            .collect();
        let classifications = self.classifier.classify_batch(&pairs).await;

        let mut ranked: Vec<RankedCandidate> = present
            .iter()
            .zip(classifications)
            .map(|((m, _), mut classification)| {
                if classification.relationship == RelationshipType::Contradictory
                    && !options.enable_contradiction_detection
                {
                    classification.relationship = RelationshipType::Unknown;
                }
                RankedCandidate {
                    chunk_id: m.chunk_id.clone(),
                    similarity: m.score,
                    classification,
                }
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.classification
                .confidence
                .partial_cmp(&a.classification.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        Ok((ranked, chunks))
    }

    async fn plan_for(
        &self,
        chunk: &Chunk,
        other: &Chunk,
        best: &RankedCandidate,
        candidates: &[RankedCandidate],
        options: &DedupOptions,
    ) -> Plan {
        let classification = &best.classification;
        match classification.relationship {
            RelationshipType::Equivalent => {
                let mut auto = best.similarity >= options.auto_merge_threshold
                    && classification.confidence >= options.merge_confidence_threshold;
                if auto && options.require_confirmation {
                    let second = self.classifier.confirm(chunk, other, best.similarity).await;
                    auto = second.relationship == RelationshipType::Equivalent;
                }
                if auto {
                    Plan::Merge {
                        target_chunk_id: best.chunk_id.clone(),
                        similarity: best.similarity,
                        relation: VariantRelation::Equivalent,
                    }
                } else if options.enable_review_queue {
                    queue("equivalent below auto-merge bar", candidates)
                } else {
                    Plan::StoreAsNew {
                        reason: "equivalent below auto-merge bar, review queue disabled".into(),
                    }
                }
            }
            RelationshipType::Complementary => Plan::Link {
                targets: candidates
                    .iter()
                    .filter(|c| c.classification.relationship == RelationshipType::Complementary)
                    .map(|c| (c.chunk_id.clone(), c.similarity))
                    .collect(),
            },
            RelationshipType::Contradictory => Plan::Flag {
                other_chunk_id: best.chunk_id.clone(),
                description: classification.explanation.clone(),
                severity: Severity::from_confidence(classification.confidence),
            },
            RelationshipType::Superseding => {
                if chunk.created_at >= other.created_at {
                    Plan::Supersede {
                        outdated_chunk_id: other.id.clone(),
                        replacement_chunk_id: chunk.id.clone(),
                    }
                } else {
                    Plan::Supersede {
                        outdated_chunk_id: chunk.id.clone(),
                        replacement_chunk_id: other.id.clone(),
                    }
                }
            }
            RelationshipType::Subset => {
                if chunk.content.chars().count() <= other.content.chars().count() {
                    Plan::Merge {
                        target_chunk_id: other.id.clone(),
                        similarity: best.similarity,
                        relation: VariantRelation::Subset,
                    }
                } else {
                    Plan::AbsorbSubset {
                        candidate_chunk_id: other.id.clone(),
                        similarity: best.similarity,
                    }
                }
            }
            RelationshipType::Distinct | RelationshipType::Unknown => {
                if classification.confidence < options.review_confidence_threshold
                    && options.enable_review_queue
                {
                    queue("ambiguous relationship", candidates)
                } else {
                    Plan::StoreAsNew {
                        reason: format!("{} from closest candidate", classification.relationship),
                    }
                }
            }
        }
    }

    /// The new chunk is the superset: it ends up canonical over the candidate.
    async fn absorb_subset(
        &self,
        chunk: &Chunk,
        candidate_chunk_id: &str,
        similarity: f64,
    ) -> Result<ProcessOutcome> {
        let absorbed = self
            .canonical
            .absorb_subset(candidate_chunk_id, &chunk.id, similarity)
            .await?;
        let mut outcome = ProcessOutcome::new(
            &chunk.id,
            DeduplicationAction::MergedIntoExisting,
            Some(absorbed.record.id),
        );
        outcome.merged_from_id = Some(absorbed.variant_chunk_id);
        Ok(outcome)
    }

    async fn ensure_canonical(&self, chunk_id: &str) -> Result<String> {
        match self.canonical.get_canonical_for_chunk(chunk_id).await? {
            Some(record) => Ok(record.id),
            None => Ok(self.canonical.create_canonical(chunk_id).await?.id),
        }
    }

    async fn similarity_to(
        &self,
        chunk: &Chunk,
        review: &PendingReview,
        target_chunk_id: &str,
    ) -> Result<f64> {
        if target_chunk_id == chunk.id {
            return Err(DedupError::validation("target must differ from the queued chunk"));
        }
        if let Some(candidate) = review.candidates.iter().find(|c| c.chunk_id == target_chunk_id) {
            return Ok(candidate.similarity);
        }
        let target = self
            .store
            .get_chunk(target_chunk_id)
            .await?
            .ok_or_else(|| DedupError::not_found("chunk", target_chunk_id))?;
        Ok(similarity_score(&chunk.embedding, &target.embedding))
    }
}

fn queue(reason: &str, candidates: &[RankedCandidate]) -> Plan {
    Plan::Queue {
        reason: reason.to_string(),
        candidates: candidates
            .iter()
            .map(|c| ReviewCandidate {
                chunk_id: c.chunk_id.clone(),
                similarity: c.similarity,
                relationship: c.classification.relationship,
                confidence: c.classification.confidence,
                explanation: c.classification.explanation.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ClassificationCache;
    use crate::classifier::tests::FakeClassifier;
    use crate::classifier::ClassifierOptions;
    use crate::events::NoopEventSink;
    use crate::models::{ContradictionStatus, MembershipRole};
    use crate::store::memory::InMemoryStore;
    use crate::store::{CanonicalStore, ChunkStore, ReviewStore};
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryStore>,
        orchestrator: DeduplicationOrchestrator<InMemoryStore>,
    }

    fn harness(fake: Option<FakeClassifier>) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(ClassificationCache::new(Duration::from_secs(60), 100));
        let mut classifier = RelationshipClassifier::new(ClassifierOptions::default(), cache);
        if let Some(fake) = fake {
            classifier = classifier.with_text_classifier(Arc::new(fake));
        }
        let orchestrator = DeduplicationOrchestrator::new(
            store.clone(),
            Arc::new(classifier),
            Arc::new(NoopEventSink),
        );
        Harness { store, orchestrator }
    }

    /// Unit vector in 2D at cosine `similarity` from `[1, 0]`.
    fn at(similarity: f32) -> Vec<f32> {
        vec![similarity, (1.0 - similarity * similarity).sqrt()]
    }

    async fn add(h: &Harness, id: &str, content: &str, embedding: Vec<f32>) -> Chunk {
        let mut c = Chunk::new(content, embedding);
        c.id = id.to_string();
        h.store.insert_chunk(&c).await.unwrap();
        c
    }

    #[tokio::test]
    async fn no_candidates_stores_as_new() {
        let h = harness(None);
        let c = add(&h, "c1", "unique fact", vec![1.0, 0.0]).await;
        let outcome = h.orchestrator.process_item(&c, &DedupOptions::default()).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::StoredAsNew);
        let record = h
            .store
            .get_canonical(outcome.canonical_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.merge_count, 1);
        assert_eq!(record.canonical_chunk_id, "c1");
    }

    #[tokio::test]
    async fn equivalent_pair_is_auto_merged() {
        let h = harness(Some(FakeClassifier::answering(RelationshipType::Equivalent, 0.92)));
        let opts = DedupOptions::default();
        let first = add(&h, "rest-1", "The API uses REST endpoints.", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&first, &opts).await.unwrap();
        let second = add(&h, "rest-2", "REST endpoints are used by the API.", at(0.97)).await;

        let outcome = h.orchestrator.process_item(&second, &opts).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::MergedIntoExisting);
        assert_eq!(outcome.merged_from_id.as_deref(), Some("rest-2"));
        let record = h
            .store
            .get_canonical(outcome.canonical_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.canonical_chunk_id, "rest-1");
        assert_eq!(record.merge_count, 2);
    }

    #[tokio::test]
    async fn conflicting_values_are_flagged() {
        let h = harness(Some(FakeClassifier::answering(RelationshipType::Contradictory, 0.85)));
        let opts = DedupOptions::default();
        let a = add(&h, "t30", "timeout is 30 seconds", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        let b = add(&h, "t60", "timeout is 60 seconds", at(0.92)).await;

        let outcome = h.orchestrator.process_item(&b, &opts).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::FlaggedAsContradiction);
        let contradiction = h
            .orchestrator
            .contradictions()
            .get_by_id(outcome.contradiction_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(contradiction.status, ContradictionStatus::Pending);
        assert_eq!(contradiction.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn disabled_detection_treats_contradiction_as_unknown() {
        let h = harness(Some(FakeClassifier::answering(RelationshipType::Contradictory, 0.85)));
        let opts = DedupOptions {
            enable_contradiction_detection: false,
            ..Default::default()
        };
        let a = add(&h, "a", "timeout is 30 seconds", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        let b = add(&h, "b", "timeout is 60 seconds", at(0.92)).await;
        let outcome = h.orchestrator.process_item(&b, &opts).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::StoredAsNew);
    }

    #[tokio::test]
    async fn equivalent_below_auto_merge_is_queued() {
        let h = harness(Some(FakeClassifier::answering(RelationshipType::Equivalent, 0.95)));
        let opts = DedupOptions::default();
        let a = add(&h, "a", "Retries use exponential backoff.", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        let b = add(&h, "b", "Backoff between retries grows exponentially.", at(0.90)).await;

        let outcome = h.orchestrator.process_item(&b, &opts).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::QueuedForReview);
        assert!(outcome.canonical_id.is_none());
        let reviews = h.orchestrator.get_pending_reviews(None).await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].candidates[0].chunk_id, "a");

        let again = h.orchestrator.process_item(&b, &opts).await.unwrap();
        assert_eq!(again.review_id, outcome.review_id);
        assert_eq!(h.orchestrator.get_pending_reviews(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn confirmation_disagreement_blocks_merge() {
        let h = harness(Some(FakeClassifier::answering(RelationshipType::Distinct, 0.9)));
        let opts = DedupOptions {
            require_confirmation: true,
            ..Default::default()
        };
        let a = add(&h, "a", "alpha", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        // 0.99 fires the equivalence rule; the external confirmation disagrees.
        let b = add(&h, "b", "beta", at(0.99)).await;
        let outcome = h.orchestrator.process_item(&b, &opts).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::QueuedForReview);
    }

    #[tokio::test]
    async fn unknown_without_classifier_goes_to_review_or_new() {
        let h = harness(None);
        let a = add(&h, "a", "cats sleep a lot", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&a, &DedupOptions::default()).await.unwrap();
        let b = add(&h, "b", "dogs bark loudly", at(0.9)).await;

        let plan = h.orchestrator.decide(&b, &DedupOptions::default()).await.unwrap().plan;
        assert_eq!(plan.action(), DeduplicationAction::QueuedForReview);

        let no_queue = DedupOptions {
            enable_review_queue: false,
            ..Default::default()
        };
        let outcome = h.orchestrator.process_item(&b, &no_queue).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::StoredAsNew);
    }

    #[tokio::test]
    async fn superset_takes_over_canonical_slot() {
        let h = harness(None);
        let opts = DedupOptions::default();
        let small = add(&h, "small", "Tokens expire after one hour.", vec![1.0, 0.0]).await;
        let first = h.orchestrator.process_item(&small, &opts).await.unwrap();
        let big = add(
            &h,
            "big",
            "Auth notes. Tokens expire after one hour. Refresh them early.",
            at(0.9),
        )
        .await;

        let outcome = h.orchestrator.process_item(&big, &opts).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::MergedIntoExisting);
        assert_eq!(outcome.canonical_id, first.canonical_id);
        let membership = h.store.get_membership("big").await.unwrap().unwrap();
        assert_eq!(membership.role, MembershipRole::Canonical);
        let variants = h.store.get_variants(&membership.record.id).await.unwrap();
        assert_eq!(variants[0].variant_chunk_id, "small");
        assert_eq!(variants[0].relationship, VariantRelation::Demoted);
    }

    #[tokio::test]
    async fn newer_chunk_supersedes_older() {
        let h = harness(None);
        let opts = DedupOptions::default();
        let mut old = Chunk::new("Deploy with make release v1", vec![1.0, 0.0]);
        old.id = "old".into();
        old.created_at -= 30 * 24 * 60 * 60;
        h.store.insert_chunk(&old).await.unwrap();
        h.orchestrator.process_item(&old, &opts).await.unwrap();
        let new = add(&h, "new", "Deploy with make release v2", at(0.96)).await;

        let outcome = h.orchestrator.process_item(&new, &opts).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::SupersededExisting);
        assert!(h.store.get_chunk("old").await.unwrap().unwrap().archived);
        let record = h.store.get_membership("new").await.unwrap().unwrap().record;
        assert_eq!(record.canonical_chunk_id, "new");
    }

    #[tokio::test]
    async fn complementary_candidates_are_linked() {
        let h = harness(None);
        let opts = DedupOptions::default();
        let mut a = Chunk::new("Install the CLI with cargo.", vec![1.0, 0.0]);
        a.id = "a".into();
        a.source_document_id = Some("guide".into());
        h.store.insert_chunk(&a).await.unwrap();
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        let mut b = Chunk::new("Configure the CLI with a TOML file.", at(0.9));
        b.id = "b".into();
        b.source_document_id = Some("guide".into());
        h.store.insert_chunk(&b).await.unwrap();

        let outcome = h.orchestrator.process_item(&b, &opts).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::LinkedToExisting);
        assert_eq!(outcome.linked_ids, vec!["a".to_string()]);
        let record = h.store.get_membership("a").await.unwrap().unwrap().record;
        assert_eq!(record.merge_count, 1);
    }

    #[tokio::test]
    async fn member_chunk_is_not_touched_again() {
        let h = harness(None);
        let c = add(&h, "c", "fact", vec![1.0, 0.0]).await;
        let first = h.orchestrator.process_item(&c, &DedupOptions::default()).await.unwrap();
        let second = h.orchestrator.process_item(&c, &DedupOptions::default()).await.unwrap();
        assert_eq!(second.action, DeduplicationAction::StoredAsNew);
        assert_eq!(second.canonical_id, first.canonical_id);
    }

    #[tokio::test]
    async fn find_duplicates_does_not_mutate() {
        let h = harness(None);
        let a = add(&h, "a", "same", vec![1.0, 0.0]).await;
        add(&h, "b", "same", vec![1.0, 0.0]).await;
        let found = h
            .orchestrator
            .find_duplicates(&a, 0.9, &DedupOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].classification.relationship, RelationshipType::Equivalent);
        assert!(h.store.get_membership("a").await.unwrap().is_none());
        assert!(h.store.get_membership("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn manual_merge_removes_review() {
        let h = harness(None);
        let opts = DedupOptions::default();
        let a = add(&h, "a", "cats sleep a lot", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        let b = add(&h, "b", "felines nap often", at(0.9)).await;
        let queued = h.orchestrator.process_item(&b, &opts).await.unwrap();
        let review_id = queued.review_id.unwrap();

        let decision = ReviewDecision::Merge {
            target_chunk_id: "a".into(),
        };
        let outcome = h
            .orchestrator
            .process_manual_decision(&review_id, &decision, "alice")
            .await
            .unwrap();
        assert_eq!(outcome.decision, "merge");
        assert!(h.store.get_review(&review_id).await.unwrap().is_none());
        let variants = h
            .store
            .get_variants(outcome.canonical_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(variants[0].relationship, VariantRelation::Manual);
        assert!((variants[0].similarity_score - 0.9).abs() < 1e-3);
    }

    #[tokio::test]
    async fn manual_delete_archives_chunk() {
        let h = harness(None);
        let opts = DedupOptions::default();
        let a = add(&h, "a", "cats sleep a lot", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        let b = add(&h, "b", "felines nap often", at(0.9)).await;
        let review_id = h.orchestrator.process_item(&b, &opts).await.unwrap().review_id.unwrap();

        let outcome = h
            .orchestrator
            .process_manual_decision(&review_id, &ReviewDecision::Delete, "alice")
            .await
            .unwrap();
        assert!(outcome.archived);
        assert!(h.store.get_chunk("b").await.unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn older_arrival_is_the_one_superseded() {
        let h = harness(None);
        let opts = DedupOptions::default();
        let new = add(&h, "new", "Deploy with make release v2", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&new, &opts).await.unwrap();
        let mut old = Chunk::new("Deploy with make release v1", at(0.96));
        old.id = "old".into();
        old.created_at -= 30 * 24 * 60 * 60;
        h.store.insert_chunk(&old).await.unwrap();

        let plan = h.orchestrator.decide(&old, &opts).await.unwrap().plan;
        assert_eq!(
            plan,
            Plan::Supersede {
                outdated_chunk_id: "old".into(),
                replacement_chunk_id: "new".into(),
            }
        );
        h.orchestrator.process_item(&old, &opts).await.unwrap();
        assert!(h.store.get_chunk("old").await.unwrap().unwrap().archived);
        assert!(!h.store.get_chunk("new").await.unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn failed_absorb_leaves_no_partial_record() {
        let h = harness(None);
        let opts = DedupOptions::default();
        add(&h, "small", "Tokens expire after one hour.", vec![1.0, 0.0]).await;
        let big = add(
            &h,
            "big",
            "Auth notes. Tokens expire after one hour. Refresh them early.",
            at(0.9),
        )
        .await;
        let decision = h.orchestrator.decide(&big, &opts).await.unwrap();
        assert!(matches!(decision.plan, Plan::AbsorbSubset { .. }));

        // The candidate goes away between planning and applying.
        h.store.archive_chunk("small").await.unwrap();
        assert!(h.orchestrator.execute(&big, &decision).await.is_err());
        assert!(h.store.get_membership("big").await.unwrap().is_none());

        let retry = h.orchestrator.process_item(&big, &opts).await.unwrap();
        assert_eq!(retry.action, DeduplicationAction::StoredAsNew);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_decisions_on_one_review_apply_once() {
        let h = harness(None);
        let opts = DedupOptions::default();
        let a = add(&h, "a", "cats sleep a lot", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        let b = add(&h, "b", "felines nap often", at(0.9)).await;
        let review_id = h.orchestrator.process_item(&b, &opts).await.unwrap().review_id.unwrap();

        let h = Arc::new(h);
        let mut handles = Vec::new();
        for i in 0..8 {
            let h = h.clone();
            let review_id = review_id.clone();
            handles.push(tokio::spawn(async move {
                let decision = if i % 2 == 0 {
                    ReviewDecision::Merge {
                        target_chunk_id: "a".into(),
                    }
                } else {
                    ReviewDecision::KeepSeparate
                };
                h.orchestrator
                    .process_manual_decision(&review_id, &decision, "alice")
                    .await
            }));
        }
        let mut applied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => applied += 1,
                Err(err) => assert!(matches!(err, DedupError::NotFound { .. }), "{:?}", err),
            }
        }
        assert_eq!(applied, 1);
        assert!(h.store.get_review(&review_id).await.unwrap().is_none());
        let record = h.store.get_membership("a").await.unwrap().unwrap().record;
        let b_member = h.store.get_membership("b").await.unwrap().unwrap();
        if b_member.record.id == record.id {
            assert_eq!(record.merge_count, 2);
        } else {
            assert_eq!(record.merge_count, 1);
            assert_eq!(b_member.record.merge_count, 1);
        }
    }

    #[tokio::test]
    async fn failed_decision_leaves_review_queued() {
        let h = harness(None);
        let opts = DedupOptions::default();
        let a = add(&h, "a", "cats sleep a lot", vec![1.0, 0.0]).await;
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        let b = add(&h, "b", "felines nap often", at(0.9)).await;
        let review_id = h.orchestrator.process_item(&b, &opts).await.unwrap().review_id.unwrap();

        let decision = ReviewDecision::Merge {
            target_chunk_id: "missing".into(),
        };
        let err = h
            .orchestrator
            .process_manual_decision(&review_id, &decision, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::NotFound { .. }));
        assert!(h.store.get_review(&review_id).await.unwrap().is_some());
        assert!(h.store.get_membership("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn project_scope_limits_candidates() {
        let h = harness(None);
        let opts = DedupOptions::default();
        let mut a = Chunk::new("same text", vec![1.0, 0.0]);
        a.id = "a".into();
        a.project = Some("alpha".into());
        h.store.insert_chunk(&a).await.unwrap();
        h.orchestrator.process_item(&a, &opts).await.unwrap();
        let mut b = Chunk::new("same text", vec![1.0, 0.0]);
        b.id = "b".into();
        b.project = Some("beta".into());
        h.store.insert_chunk(&b).await.unwrap();

        let outcome = h.orchestrator.process_item(&b, &opts).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::StoredAsNew);

        let global = DedupOptions {
            scope: DedupScope::Global,
            ..Default::default()
        };
        let mut c = Chunk::new("same text", vec![1.0, 0.0]);
        c.id = "c".into();
        c.project = Some("gamma".into());
        h.store.insert_chunk(&c).await.unwrap();
        let outcome = h.orchestrator.process_item(&c, &global).await.unwrap();
        assert_eq!(outcome.action, DeduplicationAction::MergedIntoExisting);
    }

    #[test]
    fn invalid_options_are_rejected() {
        let opts = DedupOptions {
            auto_merge_threshold: 0.5,
            similarity_threshold: 0.9,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(DedupError::Validation(_))));
    }
}
