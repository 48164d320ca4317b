//! Canonical record management.
//!
//! [`CanonicalService`] validates arguments, delegates each operation to one
//! atomic [`CanonicalStore`] call, and publishes the matching
//! [`DomainEvent`] after the store commits.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{DedupError, Result};
use crate::events::{DomainEvent, EventSink};
use crate::models::{
    CanonicalRecord, ChunkLink, ChunkProvenance, ChunkVariant, Membership, MembershipRole,
    RelationshipType, VariantRelation,
};
use crate::store::{Absorption, CanonicalStore, ChunkStore};

pub struct CanonicalService<S> {
    store: Arc<S>,
    events: Arc<dyn EventSink>,
}

impl<S> Clone for CanonicalService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: CanonicalStore + ChunkStore> CanonicalService<S> {
    pub fn new(store: Arc<S>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    pub async fn create_canonical(&self, chunk_id: &str) -> Result<CanonicalRecord> {
        let record = self.store.create_canonical(chunk_id).await?;
        debug!(canonical_id = %record.id, chunk_id, "canonical created");
        self.events.publish(DomainEvent::CanonicalCreated {
            canonical_id: record.id.clone(),
            chunk_id: chunk_id.to_string(),
        });
        Ok(record)
    }

    pub async fn merge_variant(
        &self,
        canonical_id: &str,
        variant_chunk_id: &str,
        relation: VariantRelation,
        similarity: f64,
    ) -> Result<ChunkVariant> {
        if !(0.0..=1.0).contains(&similarity) {
            return Err(DedupError::validation(format!(
                "similarity must be in [0, 1], got {}",
                similarity
            )));
        }
        if relation == VariantRelation::Demoted {
            return Err(DedupError::validation(
                "demoted variants are only created by promotion",
            ));
        }
        let variant = self
            .store
            .merge_variant(canonical_id, variant_chunk_id, relation, similarity)
            .await?;
        debug!(canonical_id, variant_chunk_id, similarity, "variant merged");
        self.events.publish(DomainEvent::VariantMerged {
            canonical_id: canonical_id.to_string(),
            variant_chunk_id: variant_chunk_id.to_string(),
            similarity,
        });
        Ok(variant)
    }

    /// Merge into the chunk's record, creating one for it first if it has none.
    pub async fn merge_into_chunk(
        &self,
        target_chunk_id: &str,
        variant_chunk_id: &str,
        relation: VariantRelation,
        similarity: f64,
    ) -> Result<CanonicalRecord> {
        let record = match self.store.get_membership(target_chunk_id).await? {
            Some(m) => m.record,
            None => self.create_canonical(target_chunk_id).await?,
        };
        self.merge_variant(&record.id, variant_chunk_id, relation, similarity)
            .await?;
        self.get_canonical(&record.id).await
    }

    pub async fn get_canonical(&self, id: &str) -> Result<CanonicalRecord> {
        self.store
            .get_canonical(id)
            .await?
            .ok_or_else(|| DedupError::not_found("canonical record", id))
    }

    /// The record the chunk is canonical for, or a variant of.
    pub async fn get_canonical_for_chunk(&self, chunk_id: &str) -> Result<Option<CanonicalRecord>> {
        Ok(self.store.get_membership(chunk_id).await?.map(|m| m.record))
    }

    pub async fn get_membership(&self, chunk_id: &str) -> Result<Option<Membership>> {
        self.store.get_membership(chunk_id).await
    }

    pub async fn get_variants(&self, canonical_id: &str) -> Result<Vec<ChunkVariant>> {
        self.get_canonical(canonical_id).await?;
        self.store.get_variants(canonical_id).await
    }

    pub async fn promote_variant(
        &self,
        canonical_id: &str,
        new_canonical_chunk_id: &str,
        reason: &str,
    ) -> Result<CanonicalRecord> {
        let before = self.get_canonical(canonical_id).await?;
        let record = self
            .store
            .promote_variant(canonical_id, new_canonical_chunk_id)
            .await?;
        info!(
            canonical_id,
            new_canonical_chunk_id,
            demoted = %before.canonical_chunk_id,
            reason,
            "variant promoted"
        );
        self.events.publish(DomainEvent::VariantPromoted {
            canonical_id: canonical_id.to_string(),
            new_canonical_chunk_id: new_canonical_chunk_id.to_string(),
            demoted_chunk_id: before.canonical_chunk_id,
            reason: reason.to_string(),
        });
        Ok(record)
    }

    /// `superset_chunk_id` contains the subset's content and becomes its
    /// canonical, or joins its record when the subset is only a variant.
    pub async fn absorb_subset(
        &self,
        subset_chunk_id: &str,
        superset_chunk_id: &str,
        similarity: f64,
    ) -> Result<Absorption> {
        if !(0.0..=1.0).contains(&similarity) {
            return Err(DedupError::validation(format!(
                "similarity must be in [0, 1], got {}",
                similarity
            )));
        }
        let absorbed = self
            .store
            .absorb_subset(subset_chunk_id, superset_chunk_id, similarity)
            .await?;
        let canonical_id = absorbed.record.id.clone();
        debug!(
            canonical_id = %canonical_id,
            subset_chunk_id,
            superset_chunk_id,
            demoted = absorbed.demoted,
            "subset absorbed"
        );
        if absorbed.created {
            self.events.publish(DomainEvent::CanonicalCreated {
                canonical_id: canonical_id.clone(),
                chunk_id: superset_chunk_id.to_string(),
            });
        }
        self.events.publish(DomainEvent::VariantMerged {
            canonical_id: canonical_id.clone(),
            variant_chunk_id: absorbed.variant_chunk_id.clone(),
            similarity,
        });
        if absorbed.demoted {
            self.events.publish(DomainEvent::VariantPromoted {
                canonical_id,
                new_canonical_chunk_id: superset_chunk_id.to_string(),
                demoted_chunk_id: subset_chunk_id.to_string(),
                reason: "superset of the canonical chunk".to_string(),
            });
        }
        Ok(absorbed)
    }

    pub async fn detach_variant(&self, variant_chunk_id: &str) -> Result<CanonicalRecord> {
        let record = self.store.detach_variant(variant_chunk_id).await?;
        debug!(canonical_id = %record.id, variant_chunk_id, "variant detached");
        self.events.publish(DomainEvent::VariantDetached {
            canonical_id: record.id.clone(),
            chunk_id: variant_chunk_id.to_string(),
        });
        Ok(record)
    }

    /// Archive `outdated` and let `replacement` take its place.
    pub async fn supersede(
        &self,
        outdated_chunk_id: &str,
        replacement_chunk_id: &str,
    ) -> Result<CanonicalRecord> {
        let record = self
            .store
            .supersede(outdated_chunk_id, replacement_chunk_id)
            .await?;
        info!(
            canonical_id = %record.id,
            outdated_chunk_id,
            replacement_chunk_id,
            "chunk superseded"
        );
        self.events.publish(DomainEvent::ChunkSuperseded {
            canonical_id: record.id.clone(),
            outdated_chunk_id: outdated_chunk_id.to_string(),
            replacement_chunk_id: replacement_chunk_id.to_string(),
        });
        Ok(record)
    }

    pub async fn link(
        &self,
        source_chunk_id: &str,
        target_chunk_id: &str,
        relationship: RelationshipType,
        similarity: f64,
    ) -> Result<ChunkLink> {
        if source_chunk_id == target_chunk_id {
            return Err(DedupError::validation("a chunk cannot link to itself"));
        }
        let link = ChunkLink {
            id: uuid::Uuid::new_v4().to_string(),
            source_chunk_id: source_chunk_id.to_string(),
            target_chunk_id: target_chunk_id.to_string(),
            relationship,
            similarity_score: similarity.clamp(0.0, 1.0),
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.create_link(&link).await
    }

    pub async fn get_links(&self, chunk_id: &str) -> Result<Vec<ChunkLink>> {
        self.store.get_links(chunk_id).await
    }

    pub async fn record_provenance(&self, provenance: &ChunkProvenance) -> Result<()> {
        self.store.record_provenance(provenance).await
    }

    pub async fn get_provenance(&self, canonical_id: &str) -> Result<Vec<ChunkProvenance>> {
        self.store.get_provenance(canonical_id).await
    }

    /// Whether `chunk_id` currently holds the canonical slot of its record.
    pub async fn is_canonical(&self, chunk_id: &str) -> Result<bool> {
        Ok(matches!(
            self.store.get_membership(chunk_id).await?,
            Some(Membership {
                role: MembershipRole::Canonical,
                ..
            })
        ))
    }
}
