//! Contradiction registry.
//!
//! Lifecycle: `Pending -> (InReview) -> Resolved | Dismissed`. Flagging is
//! idempotent per unordered chunk pair while a contradiction is open.
//! Resolution side effects (archiving, disambiguation metadata) commit in
//! the same store call as the status change.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{DedupError, Result};
use crate::events::{DomainEvent, EventSink};
use crate::models::{Contradiction, ContradictionStatus, Resolution, ResolutionAction, Severity};
use crate::store::{ContradictionStats, ContradictionStore};

pub struct ContradictionRegistry<S> {
    store: Arc<S>,
    events: Arc<dyn EventSink>,
}

impl<S> Clone for ContradictionRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            events: self.events.clone(),
        }
    }
}

impl<S: ContradictionStore> ContradictionRegistry<S> {
    pub fn new(store: Arc<S>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    /// Flag a conflict, or return the open one already recorded for the pair.
    pub async fn flag(
        &self,
        chunk_a_id: &str,
        chunk_b_id: &str,
        description: &str,
        severity: Severity,
    ) -> Result<Contradiction> {
        if chunk_a_id == chunk_b_id {
            return Err(DedupError::validation(
                "a chunk cannot contradict itself",
            ));
        }
        let candidate = Contradiction {
            id: uuid::Uuid::new_v4().to_string(),
            chunk_a_id: chunk_a_id.to_string(),
            chunk_b_id: chunk_b_id.to_string(),
            description: description.to_string(),
            severity,
            status: ContradictionStatus::Pending,
            resolution_action: None,
            resolution_notes: None,
            resolved_by: None,
            preferred_chunk_id: None,
            detected_at: chrono::Utc::now().timestamp(),
            resolved_at: None,
        };
        let (stored, created) = self.store.flag_contradiction(&candidate).await?;
        if created {
            warn!(
                contradiction_id = %stored.id,
                chunk_a_id,
                chunk_b_id,
                severity = %severity,
                "contradiction detected"
            );
            self.events.publish(DomainEvent::ContradictionDetected {
                contradiction_id: stored.id.clone(),
                chunk_a_id: stored.chunk_a_id.clone(),
                chunk_b_id: stored.chunk_b_id.clone(),
                severity: stored.severity,
            });
        }
        Ok(stored)
    }

    /// Open contradictions (pending or in review) in scope, oldest first.
    pub async fn get_pending(&self, scope: Option<&str>) -> Result<Vec<Contradiction>> {
        let mut open = self
            .store
            .list_contradictions(Some(ContradictionStatus::Pending), scope)
            .await?;
        open.extend(
            self.store
                .list_contradictions(Some(ContradictionStatus::InReview), scope)
                .await?,
        );
        open.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        Ok(open)
    }

    pub async fn list(
        &self,
        status: Option<ContradictionStatus>,
        scope: Option<&str>,
    ) -> Result<Vec<Contradiction>> {
        self.store.list_contradictions(status, scope).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Contradiction> {
        self.store
            .get_contradiction(id)
            .await?
            .ok_or_else(|| DedupError::not_found("contradiction", id))
    }

    pub async fn get_for_chunk(&self, chunk_id: &str) -> Result<Vec<Contradiction>> {
        self.store.contradictions_for_chunk(chunk_id).await
    }

    pub async fn mark_in_review(&self, id: &str) -> Result<Contradiction> {
        self.store.mark_in_review(id).await
    }

    pub async fn resolve(&self, id: &str, resolution: &Resolution) -> Result<Contradiction> {
        if resolution.resolved_by.trim().is_empty() {
            return Err(DedupError::validation("resolved_by is required"));
        }
        let current = self.get_by_id(id).await?;
        if !current.status.is_open() {
            return Err(DedupError::conflict(format!(
                "contradiction {} is already {}",
                id, current.status
            )));
        }
        if resolution.action == ResolutionAction::Merge {
            match resolution.preferred_id.as_deref() {
                Some(preferred) if current.involves(preferred) => {}
                Some(other) => {
                    return Err(DedupError::validation(format!(
                        "preferred chunk {} is not part of contradiction {}",
                        other, id
                    )))
                }
                None => {
                    return Err(DedupError::validation(
                        "merge resolution requires a preferred chunk id",
                    ))
                }
            }
        }

        let resolved = self.store.resolve_contradiction(id, resolution).await?;
        info!(
            contradiction_id = id,
            action = %resolution.action,
            resolved_by = %resolution.resolved_by,
            "contradiction resolved"
        );
        self.events.publish(DomainEvent::ContradictionResolved {
            contradiction_id: id.to_string(),
            action: resolution.action,
            resolved_by: resolution.resolved_by.clone(),
        });
        Ok(resolved)
    }

    pub async fn stats(&self, scope: Option<&str>) -> Result<ContradictionStats> {
        self.store.contradiction_stats(scope).await
    }
}
