//! Embedding generation via fastembed.

use crate::error::{Error, Result};
use std::sync::Arc;

/// Embedding model wrapper around the default all-MiniLM-L6-v2.
pub struct EmbeddingModel {
    model: fastembed::TextEmbedding,
    dimension: usize,
}

impl EmbeddingModel {
    /// Load the model and probe its output dimension.
    pub fn new() -> Result<Self> {
        let model = fastembed::TextEmbedding::try_new(Default::default())
            .map_err(|e| Error::Unavailable(format!("embedding model failed to load: {e}")))?;

        let probe = model
            .embed(vec!["dimension probe".to_string()], None)
            .map_err(|e| Error::Unavailable(format!("embedding probe failed: {e}")))?;
        let dimension = probe.first().map(Vec::len).unwrap_or(0);
        if dimension == 0 {
            return Err(Error::Unavailable(
                "embedding model produced an empty vector".to_string(),
            ));
        }

        Ok(Self { model, dimension })
    }

    /// Fixed output dimension of this model.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Generate embeddings for multiple texts.
    pub fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.model
            .embed(texts, None)
            .map_err(|e| Error::Unavailable(format!("embedding generation failed: {e}")))
    }

    /// Generate an embedding for a single text.
    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed(vec![text.to_string()])?;
        embeddings
            .pop()
            .ok_or_else(|| Error::Unavailable("embedding model returned no vector".to_string()))
    }
}

/// Embed a single text off the async runtime; fastembed is synchronous.
pub async fn embed_text(model: &Arc<EmbeddingModel>, text: &str) -> Result<Vec<f32>> {
    let model = Arc::clone(model);
    let text = text.to_string();
    tokio::task::spawn_blocking(move || model.embed_one(&text))
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("embedding task failed: {e}")))?
}
