//! Batch reconciliation job records.
//!
//! A [`BatchJob`] is the persisted state of one reconciliation run: its
//! options, lifecycle state, progress counters, checkpoint cursor, and
//! outcome tallies. The runner lives in [`crate::batch`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DedupError, Result};
use crate::models::DeduplicationAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Returns true when this state can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Cancelled)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Paused)
                | (Self::Paused, Self::Running)
                | (Self::Paused, Self::Cancelled)
                | (Self::Cancelled, Self::Running)
                | (Self::Failed, Self::Running)
        )
    }

    /// States from which `resume` may continue the run.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Paused | Self::Cancelled | Self::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DedupError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(DedupError::validation(format!(
                "unknown job state: '{}'",
                other
            ))),
        }
    }
}

/// Options fixed at job creation and persisted with the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    pub batch_size: usize,
    /// Pause between batches, for throttling against live ingestion.
    pub delay_ms: u64,
    pub dry_run: bool,
    /// Restrict the run to one project.
    #[serde(default)]
    pub scope: Option<String>,
    /// Consecutive per-item failures treated as an infrastructure outage.
    pub max_consecutive_errors: u32,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delay_ms: 100,
            dry_run: false,
            scope: None,
            max_consecutive_errors: 25,
        }
    }
}

impl BatchOptions {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DedupError::validation("batch_size must be > 0"));
        }
        if self.max_consecutive_errors == 0 {
            return Err(DedupError::validation("max_consecutive_errors must be > 0"));
        }
        Ok(())
    }
}

/// Outcome tallies for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Chunks already canonical or variant, or claimed earlier in a dry run.
    pub skipped: u64,
    pub stored_as_new: u64,
    pub merged: u64,
    pub linked: u64,
    pub flagged: u64,
    pub superseded: u64,
    pub queued: u64,
    pub errors: u64,
    /// Items that had at least one candidate above the threshold.
    pub duplicates_found: u64,
    pub would_merge: u64,
    pub would_link: u64,
    pub would_flag: u64,
    pub would_supersede: u64,
    pub would_queue: u64,
}

impl BatchStats {
    /// Count an executed outcome.
    pub fn record(&mut self, action: DeduplicationAction) {
        match action {
            DeduplicationAction::StoredAsNew => self.stored_as_new += 1,
            DeduplicationAction::MergedIntoExisting => self.merged += 1,
            DeduplicationAction::LinkedToExisting => self.linked += 1,
            DeduplicationAction::FlaggedAsContradiction => self.flagged += 1,
            DeduplicationAction::SupersededExisting => self.superseded += 1,
            DeduplicationAction::QueuedForReview => self.queued += 1,
        }
    }

    /// Count a planned-but-not-executed outcome (dry run).
    pub fn record_planned(&mut self, action: DeduplicationAction) {
        match action {
            DeduplicationAction::StoredAsNew => self.stored_as_new += 1,
            DeduplicationAction::MergedIntoExisting => self.would_merge += 1,
            DeduplicationAction::LinkedToExisting => self.would_link += 1,
            DeduplicationAction::FlaggedAsContradiction => self.would_flag += 1,
            DeduplicationAction::SupersededExisting => self.would_supersede += 1,
            DeduplicationAction::QueuedForReview => self.would_queue += 1,
        }
    }
}

/// Persisted state of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchJob {
    pub id: String,
    pub state: JobState,
    pub options: BatchOptions,
    pub processed: u64,
    pub total: u64,
    /// Id of the last chunk fully handled; iteration resumes after it.
    pub checkpoint: Option<String>,
    pub stats: BatchStats,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
}

impl BatchJob {
    pub fn new(options: BatchOptions) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: JobState::Pending,
            options,
            processed: 0,
            total: 0,
            checkpoint: None,
            stats: BatchStats::default(),
            error: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `next`, stamping timestamps; rejects illegal transitions.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DedupError::conflict(format!(
                "job {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        let now = chrono::Utc::now().timestamp();
        if next == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        } else {
            self.finished_at = None;
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub limit: Option<usize>,
}
