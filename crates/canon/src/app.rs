//! Wires configuration into a ready-to-use [`DedupService`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use canon_core::access::{Caller, StaticGate};
use canon_core::cache::ClassificationCache;
use canon_core::classifier::RelationshipClassifier;
use canon_core::events::TracingEventSink;
use canon_core::service::DedupService;

use crate::classifier::OpenAiClassifier;
use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

pub type Service = DedupService<SqliteStore>;

/// Connect to the database and assemble the service.
///
/// The text classifier is only attached when `classifier.provider` is not
/// `disabled`; otherwise classification is rule-based.
pub async fn open_service(config: &Config) -> Result<Service> {
    let pool = db::connect(config).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let cache = Arc::new(ClassificationCache::new(
        Duration::from_secs(config.classifier.cache_ttl_secs),
        config.classifier.cache_capacity,
    ));
    let mut classifier = RelationshipClassifier::new(config.classifier.options(), cache);
    if config.classifier.is_enabled() {
        let text = OpenAiClassifier::new(&config.classifier)
            .context("failed to configure text classifier")?;
        debug!(model = ?config.classifier.model, "text classifier enabled");
        classifier = classifier.with_text_classifier(Arc::new(text));
    }

    let service = DedupService::new(
        store,
        Arc::new(classifier),
        Arc::new(StaticGate::new(config.access.entitled)),
        Arc::new(TracingEventSink),
        config.dedup.options(),
    )?;
    Ok(service)
}

/// The identity CLI actions are attributed to.
pub fn caller(config: &Config) -> Caller {
    Caller::new(config.access.actor.clone())
}

pub async fn close(service: Service) {
    service.store().pool().close().await;
}
