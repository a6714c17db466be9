//! Vector store: embedding index keyed by message id.
//!
//! The relational store stays authoritative; this index is a cache. It
//! answers one question: given a query embedding and an optional
//! backend-native filter, which message ids are most similar?

pub mod embedding;
pub mod lance;

pub use embedding::EmbeddingModel;
pub use lance::LanceIndex;

use crate::error::Result;

/// The metadata subset indexed alongside each embedding for native
/// filtering: equality, range and in-list over these fields run inside
/// the vector store.
#[derive(Debug, Clone)]
pub struct IndexedFields {
    pub channel_id: String,
    pub sender: String,
    /// Unix seconds, UTC.
    pub timestamp: f64,
    pub confidence: Option<f64>,
}

/// Approximate-nearest-neighbor index contract.
///
/// Absence of an implementation is not an error; the hybrid store
/// degrades to text-only retrieval.
#[async_trait::async_trait]
pub trait VectorIndex: Send + Sync {
    /// Compute the embedding for a piece of text. The vector length is
    /// an implementation detail; callers never depend on it.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Upsert the embedding and indexed fields for a message id.
    /// Idempotent by id, so cross-store retries are safe.
    async fn index(&self, id: i64, text: &str, fields: &IndexedFields) -> Result<()>;

    /// Up to `limit` (id, similarity) pairs, similarity in [0, 1],
    /// optionally pre-filtered by a native filter expression.
    async fn search(
        &self,
        embedding: &[f32],
        native_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(i64, f32)>>;

    /// Remove a message id from the index.
    async fn delete(&self, id: i64) -> Result<()>;

    /// The subset of `ids` present in the index. Feeds the background
    /// reconciler that re-embeds missing messages.
    async fn known_ids(&self, ids: &[i64]) -> Result<Vec<i64>>;
}
