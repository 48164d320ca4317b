//! Core data models used throughout Canon.
//!
//! These types represent the chunks, canonical records, variants, links,
//! provenance, contradictions, and review items that flow through the
//! deduplication pipeline. Timestamps are Unix seconds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DedupError;

/// Maximum characters kept in a [`SimilarityMatch::preview`].
pub const PREVIEW_CHARS: usize = 240;

/// A unit of ingested content with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub source_document_id: Option<String>,
    #[serde(default)]
    pub source_location: Option<String>,
    /// Project scope, used when dedup runs per project.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
    pub created_at: i64,
    #[serde(default)]
    pub archived: bool,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::json!({})
}

impl Chunk {
    /// Build an unarchived chunk with a fresh UUID and the current timestamp.
    pub fn new(content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            embedding,
            source_document_id: None,
            source_location: None,
            project: None,
            metadata: empty_metadata(),
            created_at: chrono::Utc::now().timestamp(),
            archived: false,
        }
    }

    pub fn preview(&self) -> String {
        preview(&self.content)
    }
}

/// First [`PREVIEW_CHARS`] characters of `text`.
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// A candidate found by the similarity index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityMatch {
    pub chunk_id: String,
    /// Cosine similarity clamped to `[0, 1]`.
    pub score: f64,
    pub preview: String,
}

/// Semantic relationship between two chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Equivalent,
    Complementary,
    Contradictory,
    Superseding,
    Subset,
    Distinct,
    Unknown,
}

/// The structural action a relationship implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpliedAction {
    Merge,
    Link,
    Flag,
    Replace,
    KeepSuperset,
    None,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equivalent => "equivalent",
            Self::Complementary => "complementary",
            Self::Contradictory => "contradictory",
            Self::Superseding => "superseding",
            Self::Subset => "subset",
            Self::Distinct => "distinct",
            Self::Unknown => "unknown",
        }
    }

    pub fn implied_action(&self) -> ImpliedAction {
        match self {
            Self::Equivalent => ImpliedAction::Merge,
            Self::Complementary => ImpliedAction::Link,
            Self::Contradictory => ImpliedAction::Flag,
            Self::Superseding => ImpliedAction::Replace,
            Self::Subset => ImpliedAction::KeepSuperset,
            Self::Distinct | Self::Unknown => ImpliedAction::None,
        }
    }

    /// `Distinct` and `Unknown` carry no structural decision.
    pub fn is_definitive(&self) -> bool {
        !matches!(self, Self::Distinct | Self::Unknown)
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipType {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equivalent" => Ok(Self::Equivalent),
            "complementary" => Ok(Self::Complementary),
            "contradictory" => Ok(Self::Contradictory),
            "superseding" => Ok(Self::Superseding),
            "subset" => Ok(Self::Subset),
            "distinct" => Ok(Self::Distinct),
            "unknown" => Ok(Self::Unknown),
            other => Err(DedupError::validation(format!(
                "unknown relationship type: '{}'",
                other
            ))),
        }
    }
}

/// How a classification was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    RuleBased,
    Ai,
    Cached,
}

/// Output of comparing two chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipClassification {
    pub relationship: RelationshipType,
    pub confidence: f64,
    pub explanation: String,
    pub method: ClassificationMethod,
}

impl RelationshipClassification {
    pub fn rule(relationship: RelationshipType, confidence: f64, explanation: &str) -> Self {
        Self {
            relationship,
            confidence,
            explanation: explanation.to_string(),
            method: ClassificationMethod::RuleBased,
        }
    }
}

/// The authoritative representative of one unique fact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub canonical_chunk_id: String,
    pub project: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    /// Always `1 + number of variants`.
    pub merge_count: i64,
    /// Set when the last live chunk of the record was archived.
    pub retired_at: Option<i64>,
}

/// Why a chunk sits under a canonical record as a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantRelation {
    Equivalent,
    Subset,
    Superseding,
    /// Former canonical chunk displaced by a promotion.
    Demoted,
    /// Merged by a human review decision.
    Manual,
}

impl VariantRelation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equivalent => "equivalent",
            Self::Subset => "subset",
            Self::Superseding => "superseding",
            Self::Demoted => "demoted",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for VariantRelation {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equivalent" => Ok(Self::Equivalent),
            "subset" => Ok(Self::Subset),
            "superseding" => Ok(Self::Superseding),
            "demoted" => Ok(Self::Demoted),
            "manual" => Ok(Self::Manual),
            other => Err(DedupError::validation(format!(
                "unknown variant relation: '{}'",
                other
            ))),
        }
    }
}

/// A chunk merged into a canonical record as a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkVariant {
    pub id: String,
    pub canonical_record_id: String,
    pub variant_chunk_id: String,
    pub relationship: VariantRelation,
    pub similarity_score: f64,
    pub merged_at: i64,
}

/// Role a chunk plays inside a canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipRole {
    Canonical,
    Variant,
}

/// Resolved canonical membership of one chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Membership {
    pub record: CanonicalRecord,
    pub role: MembershipRole,
}

/// A non-authoritative relation between two chunks (complementary content).
///
/// Links never affect a record's merge count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkLink {
    pub id: String,
    pub source_chunk_id: String,
    pub target_chunk_id: String,
    pub relationship: RelationshipType,
    pub similarity_score: f64,
    pub created_at: i64,
}

/// Origin metadata for a chunk. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkProvenance {
    pub id: String,
    pub chunk_id: String,
    pub source_document_id: Option<String>,
    pub source_location: Option<String>,
    pub ingested_at: i64,
    pub verified_at: Option<i64>,
    pub verified_by: Option<String>,
}

impl ChunkProvenance {
    /// Provenance entry describing where `chunk` came from, timestamped now.
    pub fn for_chunk(chunk: &Chunk) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chunk_id: chunk.id.clone(),
            source_document_id: chunk.source_document_id.clone(),
            source_location: chunk.source_location.clone(),
            ingested_at: chrono::Utc::now().timestamp(),
            verified_at: None,
            verified_by: None,
        }
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DedupError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DedupError::validation(format!(
                        "unknown {}: '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Lifecycle state of a contradiction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContradictionStatus {
    Pending,
    InReview,
    Resolved,
    Dismissed,
}

string_enum!(ContradictionStatus {
    Pending => "pending",
    InReview => "in_review",
    Resolved => "resolved",
    Dismissed => "dismissed",
});

impl ContradictionStatus {
    /// Open contradictions still await a decision.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InReview)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

string_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl Severity {
    /// Severity for an automatically detected contradiction.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.9 {
            Self::High
        } else if confidence >= 0.7 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    KeepA,
    KeepB,
    KeepBoth,
    ArchiveBoth,
    Merge,
    Dismiss,
}

string_enum!(ResolutionAction {
    KeepA => "keep_a",
    KeepB => "keep_b",
    KeepBoth => "keep_both",
    ArchiveBoth => "archive_both",
    Merge => "merge",
    Dismiss => "dismiss",
});

/// A flagged conflict between two chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contradiction {
    pub id: String,
    pub chunk_a_id: String,
    pub chunk_b_id: String,
    pub description: String,
    pub severity: Severity,
    pub status: ContradictionStatus,
    pub resolution_action: Option<ResolutionAction>,
    pub resolution_notes: Option<String>,
    pub resolved_by: Option<String>,
    pub preferred_chunk_id: Option<String>,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
}

impl Contradiction {
    pub fn involves(&self, chunk_id: &str) -> bool {
        self.chunk_a_id == chunk_id || self.chunk_b_id == chunk_id
    }
}

/// Order-independent key of a chunk pair, used for pending-uniqueness.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}|{}", a, b)
    } else {
        format!("{}|{}", b, a)
    }
}

/// A resolution request for a contradiction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub action: ResolutionAction,
    #[serde(default)]
    pub preferred_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub resolved_by: String,
}

/// One candidate considered for a queued review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCandidate {
    pub chunk_id: String,
    pub similarity: f64,
    pub relationship: RelationshipType,
    pub confidence: f64,
    pub explanation: String,
}

/// An ambiguous item awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingReview {
    pub id: String,
    pub chunk_id: String,
    pub project: Option<String>,
    pub candidates: Vec<ReviewCandidate>,
    pub reason: String,
    pub queued_at: i64,
}

/// Outcome recorded by the orchestrator for one processed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeduplicationAction {
    StoredAsNew,
    MergedIntoExisting,
    LinkedToExisting,
    FlaggedAsContradiction,
    SupersededExisting,
    QueuedForReview,
}

impl DeduplicationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoredAsNew => "stored_as_new",
            Self::MergedIntoExisting => "merged_into_existing",
            Self::LinkedToExisting => "linked_to_existing",
            Self::FlaggedAsContradiction => "flagged_as_contradiction",
            Self::SupersededExisting => "superseded_existing",
            Self::QueuedForReview => "queued_for_review",
        }
    }
}

impl fmt::Display for DeduplicationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
