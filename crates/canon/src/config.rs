//! Configuration parsing and validation.
//!
//! Canon is configured via a TOML file (default `config/canon.toml`). Only
//! `[db]` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/canon.sqlite"
//!
//! [dedup]
//! similarity_threshold = 0.85
//! auto_merge_threshold = 0.95
//! scope = "project"
//!
//! [classifier]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canon_core::classifier::ClassifierOptions;
use canon_core::job::BatchOptions;
use canon_core::orchestrator::{DedupOptions, DedupScope};
use canon_core::retrieval::SearchOptions;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_auto_merge_threshold")]
    pub auto_merge_threshold: f64,
    #[serde(default = "default_merge_confidence")]
    pub merge_confidence_threshold: f64,
    #[serde(default = "default_review_confidence")]
    pub review_confidence_threshold: f64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default)]
    pub require_confirmation: bool,
    #[serde(default = "default_true")]
    pub enable_contradiction_detection: bool,
    #[serde(default = "default_true")]
    pub enable_review_queue: bool,
    #[serde(default)]
    pub scope: DedupScope,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            auto_merge_threshold: default_auto_merge_threshold(),
            merge_confidence_threshold: default_merge_confidence(),
            review_confidence_threshold: default_review_confidence(),
            max_candidates: default_max_candidates(),
            require_confirmation: false,
            enable_contradiction_detection: true,
            enable_review_queue: true,
            scope: DedupScope::Project,
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.85
}
fn default_auto_merge_threshold() -> f64 {
    0.95
}
fn default_merge_confidence() -> f64 {
    0.90
}
fn default_review_confidence() -> f64 {
    0.70
}
fn default_max_candidates() -> usize {
    10
}
fn default_true() -> bool {
    true
}

impl DedupConfig {
    pub fn options(&self) -> DedupOptions {
        DedupOptions {
            similarity_threshold: self.similarity_threshold,
            auto_merge_threshold: self.auto_merge_threshold,
            merge_confidence_threshold: self.merge_confidence_threshold,
            review_confidence_threshold: self.review_confidence_threshold,
            max_candidates: self.max_candidates,
            require_confirmation: self.require_confirmation,
            enable_contradiction_detection: self.enable_contradiction_detection,
            enable_review_queue: self.enable_review_queue,
            scope: self.scope,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_classifier_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_rule_threshold")]
    pub rule_threshold: f64,
    #[serde(default = "default_escalation_confidence")]
    pub escalation_confidence: f64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            endpoint: default_endpoint(),
            timeout_secs: default_classifier_timeout(),
            max_retries: default_max_retries(),
            rule_threshold: default_rule_threshold(),
            escalation_confidence: default_escalation_confidence(),
            cache_ttl_secs: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_classifier_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    2
}
fn default_rule_threshold() -> f64 {
    0.85
}
fn default_escalation_confidence() -> f64 {
    0.80
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_cache_capacity() -> usize {
    10_000
}

impl ClassifierConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn options(&self) -> ClassifierOptions {
        ClassifierOptions {
            rule_threshold: self.rule_threshold,
            escalation_confidence: self.escalation_confidence,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_fetch_multiplier")]
    pub fetch_multiplier: usize,
    #[serde(default = "default_true")]
    pub respect_canonicals: bool,
    #[serde(default = "default_true")]
    pub include_variant_count: bool,
    #[serde(default)]
    pub include_provenance: bool,
    #[serde(default = "default_true")]
    pub include_contradiction_flag: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
            min_score: default_min_score(),
            fetch_multiplier: default_fetch_multiplier(),
            respect_canonicals: true,
            include_variant_count: true,
            include_provenance: false,
            include_contradiction_flag: true,
        }
    }
}

fn default_final_limit() -> usize {
    10
}
fn default_min_score() -> f64 {
    0.5
}
fn default_fetch_multiplier() -> usize {
    3
}

impl RetrievalConfig {
    pub fn options(&self) -> SearchOptions {
        SearchOptions {
            limit: self.final_limit,
            min_score: self.min_score,
            fetch_multiplier: self.fetch_multiplier,
            respect_canonicals: self.respect_canonicals,
            include_archived: false,
            include_variant_count: self.include_variant_count,
            include_provenance: self.include_provenance,
            include_contradiction_flag: self.include_contradiction_flag,
            scope: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            delay_ms: default_delay_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_delay_ms() -> u64 {
    100
}
fn default_max_consecutive_errors() -> u32 {
    25
}

impl BatchConfig {
    pub fn options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size,
            delay_ms: self.delay_ms,
            dry_run: false,
            scope: None,
            max_consecutive_errors: self.max_consecutive_errors,
        }
    }
}

/// Static entitlement for the deduplication features.
#[derive(Debug, Deserialize, Clone)]
pub struct AccessConfig {
    #[serde(default = "default_true")]
    pub entitled: bool,
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            entitled: true,
            actor: default_actor(),
        }
    }
}

fn default_actor() -> String {
    std::env::var("USER").unwrap_or_else(|_| "cli".to_string())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate dedup thresholds
    config
        .dedup
        .options()
        .validate()
        .map_err(|e| anyhow::anyhow!("dedup: {}", e))?;

    // Validate classifier
    for (name, value) in [
        ("classifier.rule_threshold", config.classifier.rule_threshold),
        (
            "classifier.escalation_confidence",
            config.classifier.escalation_confidence,
        ),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }
    if config.classifier.timeout_secs == 0 {
        anyhow::bail!("classifier.timeout_secs must be > 0");
    }
    match config.classifier.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.classifier.model.is_none() {
                anyhow::bail!("classifier.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown classifier provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Validate retrieval
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [0.0, 1.0]");
    }

    // Validate batch
    config
        .batch
        .options()
        .validate()
        .map_err(|e| anyhow::anyhow!("batch: {}", e))?;

    Ok(config)
}
