//! Threshold-bounded nearest-neighbour lookup over chunk embeddings.
//!
//! [`SimilarityIndex`] is a thin validating layer over
//! [`ChunkStore::vector_search`]: it rejects bad limits, clamps the
//! threshold into `[0, 1]`, and reports store failures as retryable
//! [`DedupError::ExternalDependency`] errors so callers can decide whether to
//! degrade. An empty result is never an error.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{DedupError, Result};
use crate::models::SimilarityMatch;
use crate::store::{ChunkStore, VectorFilter};

/// Parameters of one similarity query.
#[derive(Debug, Clone)]
pub struct SimilarityQuery {
    pub threshold: f64,
    pub max_results: i64,
    pub scope: Option<String>,
    pub include_archived: bool,
}

impl SimilarityQuery {
    pub fn new(threshold: f64, max_results: i64) -> Self {
        Self {
            threshold,
            max_results,
            scope: None,
            include_archived: false,
        }
    }

    pub fn scoped(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    fn to_filter(&self) -> Result<VectorFilter> {
        if self.max_results <= 0 {
            return Err(DedupError::validation(format!(
                "max_results must be > 0, got {}",
                self.max_results
            )));
        }
        if self.threshold.is_nan() {
            return Err(DedupError::validation("threshold must be a number"));
        }
        Ok(VectorFilter {
            threshold: self.threshold.clamp(0.0, 1.0),
            limit: self.max_results as usize,
            scope: self.scope.clone(),
            include_archived: self.include_archived,
        })
    }
}

pub struct SimilarityIndex<S> {
    store: Arc<S>,
}

impl<S> Clone for SimilarityIndex<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: ChunkStore> SimilarityIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Matches with score `>= threshold`, descending by score.
    pub async fn find_similar(
        &self,
        embedding: &[f32],
        query: &SimilarityQuery,
    ) -> Result<Vec<SimilarityMatch>> {
        let filter = query.to_filter()?;
        if embedding.is_empty() {
            return Err(DedupError::validation("embedding must not be empty"));
        }
        self.store
            .vector_search(embedding, &filter)
            .await
            .map_err(as_lookup_error)
    }

    /// One store round trip for all embeddings; keys are input indices.
    pub async fn find_similar_batch(
        &self,
        embeddings: &[Vec<f32>],
        query: &SimilarityQuery,
    ) -> Result<HashMap<usize, Vec<SimilarityMatch>>> {
        let filter = query.to_filter()?;
        if embeddings.is_empty() {
            return Ok(HashMap::new());
        }
        let results = self
            .store
            .vector_search_batch(embeddings, &filter)
            .await
            .map_err(as_lookup_error)?;
        Ok(results.into_iter().enumerate().collect())
    }
}

fn as_lookup_error(err: DedupError) -> DedupError {
    match err {
        DedupError::Persistence(message) => DedupError::external("vector store", message),
        other => other,
    }
}
