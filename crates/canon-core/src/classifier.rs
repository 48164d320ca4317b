//! Hybrid relationship classifier.
//!
//! Classification runs a cheap deterministic rule pass first. Only when no
//! rule reaches the escalation confidence, and a [`TextClassifier`] is
//! configured, is the pair sent to the external service. That call carries a
//! timeout; any failure falls back to the rule result, or to `Unknown` at low
//! confidence, and is never propagated to the caller.
//!
//! # Rules, in order
//!
//! 1. similarity `>= 0.98`, or identical normalized text: `Equivalent` (0.95).
//! 2. creation times more than seven days apart and similarity `>= 0.95`:
//!    `Superseding` (0.85). The result is symmetric; the orchestrator
//!    archives whichever chunk was created first.
//! 3. one normalized text contains the other: `Subset` (0.90).
//! 4. same source document and similarity `>= rule_threshold`:
//!    `Complementary` (0.60).
//!
//! Only external results are cached; rules are cheaper than a cache lookup
//! and always report [`ClassificationMethod::RuleBased`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::ClassificationCache;
use crate::error::{DedupError, Result};
use crate::models::{Chunk, ClassificationMethod, RelationshipClassification, RelationshipType};

pub const EQUIVALENT_SIMILARITY: f64 = 0.98;
pub const SUPERSEDE_SIMILARITY: f64 = 0.95;
pub const SUPERSEDE_AGE_SECS: i64 = 7 * 24 * 60 * 60;
/// Confidence reported when nothing could classify the pair.
pub const FALLBACK_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct ClassifierOptions {
    /// Minimum similarity for the same-document `Complementary` rule.
    pub rule_threshold: f64,
    /// Rule results below this confidence are escalated when possible.
    pub escalation_confidence: f64,
    /// Deadline for one external call (or one external batch).
    pub timeout: Duration,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            rule_threshold: 0.85,
            escalation_confidence: 0.80,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Input sent to an external text classifier.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub content_a: String,
    pub content_b: String,
    pub similarity: f64,
}

/// Answer from an external text classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierVerdict {
    pub relationship: RelationshipType,
    pub confidence: f64,
    pub explanation: String,
}

/// The slow-path collaborator: an AI or other text-comparison service.
#[async_trait]
pub trait TextClassifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, request: &ClassificationRequest) -> Result<ClassifierVerdict>;

    /// Classify several pairs; the result must match the input order.
    ///
    /// The default sends one request at a time.
    async fn classify_batch(
        &self,
        requests: &[ClassificationRequest],
    ) -> Result<Vec<ClassifierVerdict>> {
        let mut verdicts = Vec::with_capacity(requests.len());
        for request in requests {
            verdicts.push(self.classify(request).await?);
        }
        Ok(verdicts)
    }
}

/// One pair to classify.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPair<'a> {
    pub a: &'a Chunk,
    pub b: &'a Chunk,
    pub similarity: f64,
}

pub struct RelationshipClassifier {
    options: ClassifierOptions,
    cache: Arc<ClassificationCache>,
    text: Option<Arc<dyn TextClassifier>>,
}

impl RelationshipClassifier {
    pub fn new(options: ClassifierOptions, cache: Arc<ClassificationCache>) -> Self {
        Self {
            options,
            cache,
            text: None,
        }
    }

    pub fn with_text_classifier(mut self, text: Arc<dyn TextClassifier>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn options(&self) -> &ClassifierOptions {
        &self.options
    }

    pub fn ai_enabled(&self) -> bool {
        self.text.is_some()
    }

    pub async fn classify(&self, a: &Chunk, b: &Chunk, similarity: f64) -> RelationshipClassification {
        let similarity = similarity.clamp(0.0, 1.0);
        let rule = apply_rules(a, b, similarity, &self.options);
        let rule_confidence = rule.as_ref().map(|r| r.confidence).unwrap_or(0.0);

        let Some(text) = &self.text else {
            return rule.unwrap_or_else(unresolved);
        };
        if !needs_escalation(similarity, rule_confidence, &self.options) {
            return rule.unwrap_or_else(unresolved);
        }

        if let Some(hit) = self.cache.get(&a.id, &b.id) {
            return hit;
        }

        debug!(
            chunk_a = %a.id,
            chunk_b = %b.id,
            similarity,
            classifier = text.name(),
            "escalating to text classifier"
        );
        let request = request_for(a, b, similarity);
        let outcome = tokio::time::timeout(self.options.timeout, text.classify(&request)).await;
        match flatten(outcome, self.options.timeout) {
            Ok(verdict) => {
                let result = from_verdict(verdict);
                self.cache.insert(&a.id, &b.id, result.clone());
                result
            }
            Err(err) => {
                warn!(chunk_a = %a.id, chunk_b = %b.id, error = %err, "text classifier failed, using rules");
                rule.unwrap_or_else(unresolved)
            }
        }
    }

    /// Classify many pairs, sending all escalations in one external batch.
    pub async fn classify_batch(&self, pairs: &[ChunkPair<'_>]) -> Vec<RelationshipClassification> {
        let mut results: Vec<Option<RelationshipClassification>> = Vec::with_capacity(pairs.len());
        let mut fallbacks: Vec<RelationshipClassification> = Vec::with_capacity(pairs.len());
        let mut pending: Vec<usize> = Vec::new();

        for (i, pair) in pairs.iter().enumerate() {
            let similarity = pair.similarity.clamp(0.0, 1.0);
            let rule = apply_rules(pair.a, pair.b, similarity, &self.options);
            let rule_confidence = rule.as_ref().map(|r| r.confidence).unwrap_or(0.0);
            let fallback = rule.unwrap_or_else(unresolved);

            let escalate = self.text.is_some() && needs_escalation(similarity, rule_confidence, &self.options);
            if !escalate {
                results.push(Some(fallback.clone()));
            } else if let Some(hit) = self.cache.get(&pair.a.id, &pair.b.id) {
                results.push(Some(hit));
            } else {
                results.push(None);
                pending.push(i);
            }
            fallbacks.push(fallback);
        }

        if let (Some(text), false) = (&self.text, pending.is_empty()) {
            let requests: Vec<ClassificationRequest> = pending
                .iter()
                .map(|&i| request_for(pairs[i].a, pairs[i].b, pairs[i].similarity.clamp(0.0, 1.0)))
                .collect();
            let outcome =
                tokio::time::timeout(self.options.timeout, text.classify_batch(&requests)).await;
            match flatten(outcome, self.options.timeout) {
                Ok(verdicts) if verdicts.len() == pending.len() => {
                    for (&i, verdict) in pending.iter().zip(verdicts) {
                        let result = from_verdict(verdict);
                        self.cache.insert(&pairs[i].a.id, &pairs[i].b.id, result.clone());
                        results[i] = Some(result);
                    }
                }
                Ok(verdicts) => warn!(
                    expected = pending.len(),
                    got = verdicts.len(),
                    "text classifier returned a short batch, using rules"
                ),
                Err(err) => warn!(pairs = pending.len(), error = %err, "text classifier batch failed, using rules"),
            }
        }

        results
            .into_iter()
            .zip(fallbacks)
            .map(|(result, fallback)| result.unwrap_or(fallback))
            .collect()
    }

    /// Independent second opinion, bypassing the cache.
    ///
    /// Used when merges require confirmation. Without a text classifier the
    /// rules are re-evaluated.
    pub async fn confirm(&self, a: &Chunk, b: &Chunk, similarity: f64) -> RelationshipClassification {
        let similarity = similarity.clamp(0.0, 1.0);
        let rule = apply_rules(a, b, similarity, &self.options);
        let Some(text) = &self.text else {
            return rule.unwrap_or_else(unresolved);
        };
        let request = request_for(a, b, similarity);
        let outcome = tokio::time::timeout(self.options.timeout, text.classify(&request)).await;
        match flatten(outcome, self.options.timeout) {
            Ok(verdict) => from_verdict(verdict),
            Err(err) => {
                warn!(chunk_a = %a.id, chunk_b = %b.id, error = %err, "confirmation failed, using rules");
                rule.unwrap_or_else(unresolved)
            }
        }
    }
}

/// Whether a pair should go to the external classifier.
///
/// Near-identical pairs never escalate; otherwise escalate when the best
/// rule confidence is below the configured bar.
pub fn needs_escalation(similarity: f64, rule_confidence: f64, options: &ClassifierOptions) -> bool {
    similarity < EQUIVALENT_SIMILARITY && rule_confidence < options.escalation_confidence
}

/// Deterministic fast path. `None` when no rule fires.
pub fn apply_rules(
    a: &Chunk,
    b: &Chunk,
    similarity: f64,
    options: &ClassifierOptions,
) -> Option<RelationshipClassification> {
    let text_a = normalize(&a.content);
    let text_b = normalize(&b.content);

    if similarity >= EQUIVALENT_SIMILARITY || (!text_a.is_empty() && text_a == text_b) {
        return Some(RelationshipClassification::rule(
            RelationshipType::Equivalent,
            0.95,
            "near-identical content",
        ));
    }

    // Symmetric: which side is outdated is decided when the plan is built.
    if (a.created_at - b.created_at).abs() > SUPERSEDE_AGE_SECS && similarity >= SUPERSEDE_SIMILARITY {
        return Some(RelationshipClassification::rule(
            RelationshipType::Superseding,
            0.85,
            "same content recorded more than a week apart",
        ));
    }

    if !text_a.is_empty() && !text_b.is_empty() && (text_a.contains(&text_b) || text_b.contains(&text_a)) {
        return Some(RelationshipClassification::rule(
            RelationshipType::Subset,
            0.90,
            "one chunk's content is contained in the other",
        ));
    }

    let same_document = matches!(
        (&a.source_document_id, &b.source_document_id),
        (Some(x), Some(y)) if x == y
    );
    if same_document && similarity >= options.rule_threshold {
        return Some(RelationshipClassification::rule(
            RelationshipType::Complementary,
            0.60,
            "related sections of the same source document",
        ));
    }

    None
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn unresolved() -> RelationshipClassification {
    RelationshipClassification::rule(
        RelationshipType::Unknown,
        FALLBACK_CONFIDENCE,
        "no rule matched and no external classification available",
    )
}

fn request_for(a: &Chunk, b: &Chunk, similarity: f64) -> ClassificationRequest {
    ClassificationRequest {
        content_a: a.content.clone(),
        content_b: b.content.clone(),
        similarity,
    }
}

fn from_verdict(verdict: ClassifierVerdict) -> RelationshipClassification {
    RelationshipClassification {
        relationship: verdict.relationship,
        confidence: verdict.confidence.clamp(0.0, 1.0),
        explanation: verdict.explanation,
        method: ClassificationMethod::Ai,
    }
}

fn flatten<T>(
    outcome: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<T> {
    match outcome {
        Ok(inner) => inner,
        Err(_) => Err(DedupError::external(
            "text classifier",
            format!("timed out after {:?}", timeout),
        )),
    }
}
