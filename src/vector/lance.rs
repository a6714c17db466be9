//! LanceDB-backed vector index.

use super::embedding::{self, EmbeddingModel};
use super::{IndexedFields, VectorIndex};
use crate::error::{Error, Result};
use arrow_array::builder::{FixedSizeListBuilder, Float32Builder};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float32Type, Int64Type};
use arrow_array::{Float32Array, Float64Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt as _;
use lancedb::index::Index;
use lancedb::index::scalar::BTreeIndexBuilder;
use lancedb::query::{ExecutableQuery as _, QueryBase as _};
use lancedb::{Connection, DistanceType, Table};
use std::sync::Arc;

const TABLE_NAME: &str = "message_embeddings";

/// Vector index persisting message embeddings in a LanceDB table.
pub struct LanceIndex {
    table: Table,
    model: Arc<EmbeddingModel>,
    schema: Arc<Schema>,
}

impl LanceIndex {
    /// Connect to a LanceDB directory or remote URL, creating the table
    /// and its scalar indexes on first use. The timestamp and confidence
    /// indexes exist before any row is written; confidence is indexed
    /// with float semantics.
    pub async fn connect(uri: &str) -> Result<Self> {
        let model = Arc::new(
            tokio::task::spawn_blocking(EmbeddingModel::new)
                .await
                .map_err(|e| Error::Other(anyhow::anyhow!("embedding load task failed: {e}")))??,
        );
        Self::connect_with_model(uri, model).await
    }

    /// Connect with an already-loaded embedding model.
    pub async fn connect_with_model(uri: &str, model: Arc<EmbeddingModel>) -> Result<Self> {
        let connection: Connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(unavailable)?;

        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("channel_id", DataType::Utf8, false),
            Field::new("sender", DataType::Utf8, false),
            Field::new("timestamp", DataType::Float64, false),
            Field::new("confidence", DataType::Float32, true),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    model.dimension() as i32,
                ),
                false,
            ),
        ]));

        let table = match connection.open_table(TABLE_NAME).execute().await {
            Ok(table) => table,
            Err(lancedb::Error::TableNotFound { .. }) => {
                let table = connection
                    .create_empty_table(TABLE_NAME, schema.clone())
                    .execute()
                    .await
                    .map_err(unavailable)?;
                // Numeric scalar indexes must exist before the first
                // write to these fields.
                for column in ["timestamp", "confidence"] {
                    table
                        .create_index(&[column], Index::BTree(BTreeIndexBuilder::default()))
                        .execute()
                        .await
                        .map_err(unavailable)?;
                }
                table
            }
            Err(error) => return Err(unavailable(error)),
        };

        Ok(Self {
            table,
            model,
            schema,
        })
    }

    fn batch_for(
        &self,
        id: i64,
        fields: &IndexedFields,
        vector: &[f32],
    ) -> Result<RecordBatch> {
        let mut embedding = FixedSizeListBuilder::new(
            Float32Builder::new(),
            self.model.dimension() as i32,
        );
        embedding.values().append_slice(vector);
        embedding.append(true);

        RecordBatch::try_new(
            self.schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![id])),
                Arc::new(StringArray::from(vec![fields.channel_id.clone()])),
                Arc::new(StringArray::from(vec![fields.sender.clone()])),
                Arc::new(Float64Array::from(vec![fields.timestamp])),
                Arc::new(Float32Array::from(vec![
                    fields.confidence.map(|value| value as f32),
                ])),
                Arc::new(embedding.finish()),
            ],
        )
        .map_err(|e| Error::Other(anyhow::anyhow!("failed to build embedding batch: {e}")))
    }
}

#[async_trait::async_trait]
impl VectorIndex for LanceIndex {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        embedding::embed_text(&self.model, text).await
    }

    async fn index(&self, id: i64, text: &str, fields: &IndexedFields) -> Result<()> {
        let vector = self.embed(text).await?;
        let batch = self.batch_for(id, fields, &vector)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], self.schema.clone());

        // Upsert by id so duplicate indexing calls stay idempotent.
        let mut merge = self.table.merge_insert(&["id"]);
        merge.when_matched_update_all(None).when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        native_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(i64, f32)>> {
        let mut query = self
            .table
            .query()
            .nearest_to(embedding)
            .map_err(unavailable)?
            .distance_type(DistanceType::Cosine)
            .limit(limit);
        if let Some(filter) = native_filter {
            query = query.only_if(filter.to_string());
        }

        let mut stream = query.execute().await.map_err(unavailable)?;
        let mut hits = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(unavailable)? {
            let ids = batch
                .column_by_name("id")
                .ok_or_else(|| Error::Unavailable("vector result missing id column".into()))?
                .as_primitive::<Int64Type>();
            let distances = batch
                .column_by_name("_distance")
                .ok_or_else(|| Error::Unavailable("vector result missing _distance".into()))?
                .as_primitive::<Float32Type>();

            for row in 0..batch.num_rows() {
                let similarity = (1.0 - distances.value(row)).clamp(0.0, 1.0);
                hits.push((ids.value(row), similarity));
            }
        }
        Ok(hits)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.table
            .delete(&format!("id = {id}"))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn known_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        let mut stream = self
            .table
            .query()
            .only_if(format!("id IN ({list})"))
            .select(lancedb::query::Select::columns(&["id"]))
            .execute()
            .await
            .map_err(unavailable)?;

        let mut known = Vec::new();
        while let Some(batch) = stream.try_next().await.map_err(unavailable)? {
            let ids = batch
                .column_by_name("id")
                .ok_or_else(|| Error::Unavailable("vector result missing id column".into()))?
                .as_primitive::<Int64Type>();
            for row in 0..batch.num_rows() {
                known.push(ids.value(row));
            }
        }
        Ok(known)
    }
}

fn unavailable(error: lancedb::Error) -> Error {
    Error::Unavailable(format!("vector store: {error}"))
}
