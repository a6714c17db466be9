//! Hybrid message store: relational writes, semantic + text reads,
//! profile-weighted ranking.

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::ids::AgentKey;
use crate::store::{MessageRecord, NewMessage, RegisterAgent, Store, now_ts};
use crate::vector::{IndexedFields, VectorIndex};
use std::sync::Arc;
use std::time::Instant;

/// Results below this similarity are discarded on the semantic path.
const MIN_SIMILARITY: f64 = 0.3;

/// How many vector candidates to pull per requested result before the
/// relational fetch applies residual predicates.
const CANDIDATE_FACTOR: usize = 4;

/// A caller-supplied instant in any accepted shape; everything is
/// normalized to Unix seconds before store calls.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeInput {
    Unix(f64),
    Iso(String),
    DateTime(chrono::DateTime<chrono::Utc>),
}

impl TimeInput {
    /// Normalize to Unix seconds (UTC).
    pub fn to_unix(&self) -> Result<f64> {
        match self {
            TimeInput::Unix(seconds) => Ok(*seconds),
            TimeInput::DateTime(instant) => {
                Ok(instant.timestamp() as f64
                    + f64::from(instant.timestamp_subsec_millis()) / 1000.0)
            }
            TimeInput::Iso(text) => parse_iso(text),
        }
    }
}

impl From<f64> for TimeInput {
    fn from(seconds: f64) -> Self {
        TimeInput::Unix(seconds)
    }
}

impl From<&str> for TimeInput {
    fn from(text: &str) -> Self {
        TimeInput::Iso(text.to_string())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for TimeInput {
    fn from(instant: chrono::DateTime<chrono::Utc>) -> Self {
        TimeInput::DateTime(instant)
    }
}

fn parse_iso(text: &str) -> Result<f64> {
    if let Ok(instant) = chrono::DateTime::parse_from_rfc3339(text) {
        return Ok(instant.timestamp() as f64
            + f64::from(instant.timestamp_subsec_millis()) / 1000.0);
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc().timestamp() as f64);
        }
        if format == "%Y-%m-%d"
            && let Ok(date) = chrono::NaiveDate::parse_from_str(text, format)
        {
            return Ok(date.and_hms_opt(0, 0, 0).expect("midnight").and_utc().timestamp() as f64);
        }
    }
    Err(Error::bad_request(format!(
        "timestamp '{text}' is not an ISO-8601 instant"
    )))
}

/// Named ranking profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingProfile {
    Recent,
    Quality,
    #[default]
    Balanced,
    Similarity,
}

/// Score weights plus decay half-life for one profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingWeights {
    pub similarity: f64,
    pub confidence: f64,
    pub recency: f64,
    pub half_life_hours: f64,
}

impl RankingProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            RankingProfile::Recent => "recent",
            RankingProfile::Quality => "quality",
            RankingProfile::Balanced => "balanced",
            RankingProfile::Similarity => "similarity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recent" => Some(RankingProfile::Recent),
            "quality" => Some(RankingProfile::Quality),
            "balanced" => Some(RankingProfile::Balanced),
            "similarity" => Some(RankingProfile::Similarity),
            _ => None,
        }
    }

    pub fn weights(self) -> RankingWeights {
        match self {
            RankingProfile::Recent => RankingWeights {
                similarity: 0.30,
                confidence: 0.10,
                recency: 0.60,
                half_life_hours: 24.0,
            },
            RankingProfile::Quality => RankingWeights {
                similarity: 0.40,
                confidence: 0.50,
                recency: 0.10,
                half_life_hours: 720.0,
            },
            RankingProfile::Balanced => RankingWeights {
                similarity: 0.34,
                confidence: 0.33,
                recency: 0.33,
                half_life_hours: 168.0,
            },
            RankingProfile::Similarity => RankingWeights {
                similarity: 1.00,
                confidence: 0.00,
                recency: 0.00,
                half_life_hours: 8760.0,
            },
        }
    }
}

/// The ranking formula: `w_sim·sim + w_conf·conf + w_rec·decay` with
/// exponential half-life decay and confidence defaulting to 0.5.
pub fn score(
    profile: RankingProfile,
    similarity: f64,
    confidence: Option<f64>,
    timestamp: f64,
    now: f64,
) -> f64 {
    let weights = profile.weights();
    let age_hours = ((now - timestamp) / 3600.0).max(0.0);
    let decay = (-std::f64::consts::LN_2 * age_hours / weights.half_life_hours).exp();
    weights.similarity * similarity
        + weights.confidence * confidence.unwrap_or(0.5)
        + weights.recency * decay
}

/// A search request. `channel_ids` is the access-filtered candidate set
/// supplied by the facade; this layer never widens it.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub filter: Option<Filter>,
    pub channel_ids: Vec<String>,
    pub since: Option<TimeInput>,
    pub until: Option<TimeInput>,
    pub profile: RankingProfile,
    pub limit: usize,
    /// Callers may opt out of the semantic path even when a vector
    /// index is configured.
    pub semantic: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: None,
            filter: None,
            channel_ids: Vec::new(),
            since: None,
            until: None,
            profile: RankingProfile::default(),
            limit: 20,
            semantic: true,
        }
    }
}

/// One ranked search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub message: MessageRecord,
    pub similarity: f64,
    pub score: f64,
}

/// Coordinates the relational store and the optional vector index into
/// one write + query surface.
pub struct HybridStore {
    store: Arc<Store>,
    index: Option<Arc<dyn VectorIndex>>,
    auto_register_senders: bool,
    profiling: bool,
}

impl HybridStore {
    pub fn new(
        store: Arc<Store>,
        index: Option<Arc<dyn VectorIndex>>,
        auto_register_senders: bool,
        profiling: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            index,
            auto_register_senders,
            profiling,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Write path: relational insert first (authoritative id), then
    /// best-effort vector indexing. Index failures are logged, never
    /// fatal.
    pub async fn insert(
        &self,
        channel_id: &str,
        sender: &AgentKey,
        message: NewMessage,
    ) -> Result<MessageRecord> {
        if self.store.agent(sender).await?.is_none() {
            if self.auto_register_senders {
                self.store
                    .register_agent(RegisterAgent::new(sender.clone()))
                    .await?;
            } else {
                return Err(Error::not_found(format!("principal '{sender}'")));
            }
        }

        let record = self.store.insert_message(channel_id, sender, message).await?;
        self.index_record(&record).await;
        Ok(record)
    }

    /// Index one record into the vector store, swallowing failures.
    async fn index_record(&self, record: &MessageRecord) {
        let Some(index) = &self.index else {
            return;
        };
        let fields = IndexedFields {
            channel_id: record.channel_id.clone(),
            sender: record.sender.name.clone(),
            timestamp: record.timestamp,
            confidence: record.confidence,
        };
        if let Err(error) = index.index(record.id, &record.content, &fields).await {
            tracing::warn!(message_id = record.id, %error, "vector indexing failed");
        }
    }

    /// Read path per the search contract: semantic candidates when
    /// possible, relational text search otherwise, ranked by the
    /// requested profile.
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<SearchHit>> {
        if request.channel_ids.is_empty() {
            return Ok(Vec::new());
        }
        let since = request.since.as_ref().map(TimeInput::to_unix).transpose()?;
        let until = request.until.as_ref().map(TimeInput::to_unix).transpose()?;
        let predicate = request.filter.as_ref().map(Filter::to_sql);
        let limit = request.limit.max(1);
        let now = now_ts();

        let mut scored: Vec<SearchHit> = Vec::new();
        let mut used_semantic = false;

        if let (Some(query), Some(index), true) =
            (&request.query, &self.index, request.semantic)
        {
            match self
                .semantic_candidates(query, index, &request, since, until, limit)
                .await
            {
                Ok(hits) => {
                    scored = hits;
                    used_semantic = true;
                }
                Err(error) => {
                    tracing::warn!(%error, "vector search unavailable, falling back to text search");
                }
            }
        }

        if !used_semantic {
            let started = Instant::now();
            match &request.query {
                Some(query) => {
                    let matches = self
                        .store
                        .text_search(
                            query,
                            &request.channel_ids,
                            predicate.as_ref(),
                            since,
                            until,
                            (limit * CANDIDATE_FACTOR) as i64,
                        )
                        .await?;
                    scored = matches
                        .into_iter()
                        .map(|(message, similarity)| SearchHit {
                            similarity,
                            score: 0.0,
                            message,
                        })
                        .collect();
                }
                None => {
                    let records = self
                        .store
                        .filtered_messages(
                            &request.channel_ids,
                            predicate.as_ref(),
                            since,
                            until,
                            (limit * CANDIDATE_FACTOR) as i64,
                        )
                        .await?;
                    scored = records
                        .into_iter()
                        .map(|message| SearchHit {
                            similarity: 0.0,
                            score: 0.0,
                            message,
                        })
                        .collect();
                }
            }
            if self.profiling {
                tracing::debug!(
                    layer = "text_search",
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    candidates = scored.len(),
                    "search layer latency"
                );
            }
        }

        for hit in &mut scored {
            hit.score = score(
                request.profile,
                hit.similarity,
                hit.message.confidence,
                hit.message.timestamp,
                now,
            );
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.message.id.cmp(&a.message.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn semantic_candidates(
        &self,
        query: &str,
        index: &Arc<dyn VectorIndex>,
        request: &SearchRequest,
        since: Option<f64>,
        until: Option<f64>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let embed_started = Instant::now();
        let embedding = index.embed(query).await?;

        let native = native_filter(request);
        let vector_started = Instant::now();
        let candidates = index
            .search(&embedding, native.as_deref(), limit * CANDIDATE_FACTOR)
            .await?;

        let kept: Vec<(i64, f32)> = candidates
            .into_iter()
            .filter(|(_, similarity)| f64::from(*similarity) >= MIN_SIMILARITY)
            .collect();
        let ids: Vec<i64> = kept.iter().map(|(id, _)| *id).collect();

        // Canonical fetch from the relational store; the full compiled
        // predicate runs here, which covers every clause the native
        // filter could not express.
        let fetch_started = Instant::now();
        let predicate = request.filter.as_ref().map(Filter::to_sql);
        let records = self
            .store
            .messages_by_ids(&ids, &request.channel_ids, predicate.as_ref(), since, until)
            .await?;

        if self.profiling {
            tracing::debug!(
                layer = "semantic",
                embed_ms = vector_started.duration_since(embed_started).as_millis() as u64,
                vector_ms = fetch_started.duration_since(vector_started).as_millis() as u64,
                fetch_ms = fetch_started.elapsed().as_millis() as u64,
                candidates = kept.len(),
                fetched = records.len(),
                "search layer latency"
            );
        }

        let mut hits = Vec::with_capacity(records.len());
        for record in records {
            let similarity = kept
                .iter()
                .find(|(id, _)| *id == record.id)
                .map(|(_, similarity)| f64::from(*similarity))
                .unwrap_or(0.0);
            hits.push(SearchHit {
                similarity,
                score: 0.0,
                message: record,
            });
        }
        Ok(hits)
    }

    /// Delete a message everywhere: relational row first, then the
    /// weakly-referencing embedding.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let deleted = self.store.delete_message(id).await?;
        if deleted
            && let Some(index) = &self.index
            && let Err(error) = index.delete(id).await
        {
            tracing::warn!(message_id = id, %error, "vector delete failed");
        }
        Ok(deleted)
    }

    /// Cold-start reconciler: re-embed recent messages missing from the
    /// vector index. Returns how many were re-indexed.
    pub async fn reindex_missing(&self, scan_limit: i64) -> Result<usize> {
        let Some(index) = &self.index else {
            return Ok(0);
        };

        let recent = self.store.recent_message_ids(scan_limit).await?;
        let known: std::collections::HashSet<i64> =
            index.known_ids(&recent).await?.into_iter().collect();

        let mut reindexed = 0;
        for id in recent {
            if known.contains(&id) {
                continue;
            }
            if let Some(record) = self.store.message(id).await? {
                self.index_record(&record).await;
                reindexed += 1;
            }
        }
        Ok(reindexed)
    }
}

/// Combine the filter's natively-expressible conjuncts with the channel
/// restriction into one vector-store filter expression.
fn native_filter(request: &SearchRequest) -> Option<String> {
    let mut parts = Vec::new();
    if !request.channel_ids.is_empty() {
        let list = request
            .channel_ids
            .iter()
            .map(|id| format!("'{}'", id.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("channel_id IN ({list})"));
    }
    if let Some(filter) = &request.filter
        && let Some(expr) = filter.to_native().expr
    {
        parts.push(expr);
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" AND "))
    }
}
