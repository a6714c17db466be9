//! Message persistence, ordering and full-text search.

use super::schema::TS_READ;
use super::types::{MessageRecord, NewMessage};
use super::{Store, now_ts};
use crate::error::{Error, Result};
use crate::filter::SqlPredicate;
use crate::ids::AgentKey;
use anyhow::Context as _;
use serde_json::Value;
use sqlx::Row as _;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};

const MESSAGE_COLUMNS: &str = "m.id, m.channel_id, m.sender_name, m.sender_project_id, \
     m.content, m.confidence, m.metadata, m.tags, m.session_context, m.thread_id";

impl Store {
    /// Insert a message. Fails with NotAuthorized unless the sender is a
    /// current member with can_send (opted-out rows behave as nonmember).
    pub async fn insert_message(
        &self,
        channel_id: &str,
        sender: &AgentKey,
        message: NewMessage,
    ) -> Result<MessageRecord> {
        let channel = self.require_channel(channel_id).await?;
        let agent = self.require_agent(sender).await?;

        let membership = self.membership(&channel.id, agent.id).await?;
        let authorized = membership
            .as_ref()
            .map(|m| m.caps.can_send && !m.opted_out)
            .unwrap_or(false);
        if !authorized {
            return Err(Error::not_authorized(format!(
                "principal '{sender}' is not a member of channel '{channel_id}'"
            )));
        }

        if let Some(confidence) = message.confidence
            && !(0.0..=1.0).contains(&confidence)
        {
            return Err(Error::bad_request(format!(
                "confidence {confidence} is outside [0, 1]"
            )));
        }

        let metadata = message
            .metadata
            .as_ref()
            .map(|value| value.to_string());
        let tags = if message.tags.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.tags).context("failed to serialize tags")?)
        };

        let timestamp = message.timestamp.unwrap_or_else(now_ts);
        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (channel_id, sender_name, sender_project_id, content, timestamp,
                 confidence, metadata, tags, session_context, thread_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(channel_id)
        .bind(&sender.name)
        .bind(&sender.project_id)
        .bind(&message.content)
        .bind(timestamp)
        .bind(message.confidence)
        .bind(&metadata)
        .bind(&tags)
        .bind(&message.session_context)
        .bind(&message.thread_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to insert message into '{channel_id}'"))?;

        let id = result.last_insert_rowid();
        self.message(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("message #{id} after insert")))
    }

    /// Fetch one message by id.
    pub async fn message(&self, id: i64) -> Result<Option<MessageRecord>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}, {TS_READ} AS ts_norm FROM messages m WHERE m.id = ?"
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(self.pool()).await?;
        row.map(|row| message_from_row(&row)).transpose()
    }

    /// List a channel's messages ordered by (timestamp, id); id is the
    /// authoritative tie-breaker.
    pub async fn channel_messages(
        &self,
        channel_id: &str,
        since: Option<f64>,
        until: Option<f64>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}, {TS_READ} AS ts_norm FROM messages m WHERE m.channel_id = ?"
        );
        if since.is_some() {
            sql.push_str(&format!(" AND {TS_READ} >= ?"));
        }
        if until.is_some() {
            sql.push_str(&format!(" AND {TS_READ} <= ?"));
        }
        sql.push_str(" ORDER BY ts_norm ASC, m.id ASC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(channel_id);
        if let Some(since) = since {
            query = query.bind(since);
        }
        if let Some(until) = until {
            query = query.bind(until);
        }
        let rows = query
            .bind(limit.clamp(1, 10_000))
            .fetch_all(self.pool())
            .await
            .with_context(|| format!("failed to list messages in '{channel_id}'"))?;

        rows.iter().map(message_from_row).collect()
    }

    /// Fetch messages by id, restricted to the given channels and an
    /// optional compiled metadata predicate.
    pub async fn messages_by_ids(
        &self,
        ids: &[i64],
        channel_ids: &[String],
        predicate: Option<&SqlPredicate>,
        since: Option<f64>,
        until: Option<f64>,
    ) -> Result<Vec<MessageRecord>> {
        if ids.is_empty() || channel_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}, {TS_READ} AS ts_norm FROM messages m WHERE m.id IN ({})",
            placeholders(ids.len())
        );
        sql.push_str(&format!(
            " AND m.channel_id IN ({})",
            placeholders(channel_ids.len())
        ));
        if let Some(predicate) = predicate {
            sql.push_str(" AND (");
            sql.push_str(&predicate.sql);
            sql.push(')');
        }
        if since.is_some() {
            sql.push_str(&format!(" AND {TS_READ} >= ?"));
        }
        if until.is_some() {
            sql.push_str(&format!(" AND {TS_READ} <= ?"));
        }

        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        for channel_id in channel_ids {
            query = query.bind(channel_id);
        }
        if let Some(predicate) = predicate {
            for value in &predicate.binds {
                query = bind_json(query, value);
            }
        }
        if let Some(since) = since {
            query = query.bind(since);
        }
        if let Some(until) = until {
            query = query.bind(until);
        }

        let rows = query
            .fetch_all(self.pool())
            .await
            .context("failed to fetch messages by id")?;
        rows.iter().map(message_from_row).collect()
    }

    /// Query-less listing across channels with an optional compiled
    /// predicate, newest first. Backs filter-only searches.
    pub async fn filtered_messages(
        &self,
        channel_ids: &[String],
        predicate: Option<&SqlPredicate>,
        since: Option<f64>,
        until: Option<f64>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        if channel_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}, {TS_READ} AS ts_norm FROM messages m \
             WHERE m.channel_id IN ({})",
            placeholders(channel_ids.len())
        );
        if let Some(predicate) = predicate {
            sql.push_str(" AND (");
            sql.push_str(&predicate.sql);
            sql.push(')');
        }
        if since.is_some() {
            sql.push_str(&format!(" AND {TS_READ} >= ?"));
        }
        if until.is_some() {
            sql.push_str(&format!(" AND {TS_READ} <= ?"));
        }
        sql.push_str(" ORDER BY ts_norm DESC, m.id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        for channel_id in channel_ids {
            query = query.bind(channel_id);
        }
        if let Some(predicate) = predicate {
            for value in &predicate.binds {
                query = bind_json(query, value);
            }
        }
        if let Some(since) = since {
            query = query.bind(since);
        }
        if let Some(until) = until {
            query = query.bind(until);
        }

        let rows = query
            .bind(limit.clamp(1, 10_000))
            .fetch_all(self.pool())
            .await
            .context("failed to list filtered messages")?;
        rows.iter().map(message_from_row).collect()
    }

    /// Full-text search over message content with a rank-derived
    /// similarity proxy in [0, 1). Restricted to the given channels.
    pub async fn text_search(
        &self,
        text: &str,
        channel_ids: &[String],
        predicate: Option<&SqlPredicate>,
        since: Option<f64>,
        until: Option<f64>,
        limit: i64,
    ) -> Result<Vec<(MessageRecord, f64)>> {
        if channel_ids.is_empty() {
            return Ok(Vec::new());
        }
        let Some(match_query) = fts_match_query(text) else {
            return Ok(Vec::new());
        };

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS}, {TS_READ} AS ts_norm, bm25(messages_fts) AS rank \
             FROM messages_fts \
             JOIN messages m ON m.id = messages_fts.rowid \
             WHERE messages_fts MATCH ? AND m.channel_id IN ({})",
            placeholders(channel_ids.len())
        );
        if let Some(predicate) = predicate {
            sql.push_str(" AND (");
            sql.push_str(&predicate.sql);
            sql.push(')');
        }
        if since.is_some() {
            sql.push_str(&format!(" AND {TS_READ} >= ?"));
        }
        if until.is_some() {
            sql.push_str(&format!(" AND {TS_READ} <= ?"));
        }
        sql.push_str(" ORDER BY rank ASC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(&match_query);
        for channel_id in channel_ids {
            query = query.bind(channel_id);
        }
        if let Some(predicate) = predicate {
            for value in &predicate.binds {
                query = bind_json(query, value);
            }
        }
        if let Some(since) = since {
            query = query.bind(since);
        }
        if let Some(until) = until {
            query = query.bind(until);
        }

        let rows = query
            .bind(limit.clamp(1, 1_000))
            .fetch_all(self.pool())
            .await
            .with_context(|| format!("failed to run text search for '{text}'"))?;

        rows.iter()
            .map(|row| {
                let record = message_from_row(row)?;
                let rank: f64 = row.try_get("rank").unwrap_or(0.0);
                // FTS5 bm25 is <= 0 with better matches more negative;
                // map to [0, 1) monotonically.
                let strength = (-rank).max(0.0);
                Ok((record, strength / (1.0 + strength)))
            })
            .collect()
    }

    /// Rewrite a message's tags. Content is immutable; this exists for
    /// notes tagging only. The timestamp is rewritten in normalized form
    /// as part of the update.
    pub async fn update_tags(&self, id: i64, tags: &[String]) -> Result<MessageRecord> {
        let record = self
            .message(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("message #{id}")))?;

        let encoded = serde_json::to_string(tags).context("failed to serialize tags")?;
        sqlx::query("UPDATE messages SET tags = ?, timestamp = ? WHERE id = ?")
            .bind(&encoded)
            .bind(record.timestamp)
            .bind(id)
            .execute(self.pool())
            .await
            .with_context(|| format!("failed to update tags on message #{id}"))?;

        self.message(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("message #{id} after tag update")))
    }

    /// Delete a message row. The caller removes the vector-store entry.
    pub async fn delete_message(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .with_context(|| format!("failed to delete message #{id}"))?;
        Ok(result.rows_affected() > 0)
    }

    /// The most recent message ids, newest first. Feeds the vector-store
    /// reconciler.
    pub async fn recent_message_ids(&self, limit: i64) -> Result<Vec<i64>> {
        let rows: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM messages ORDER BY id DESC LIMIT ?")
                .bind(limit.clamp(1, 100_000))
                .fetch_all(self.pool())
                .await?;
        Ok(rows)
    }
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for index in 0..count {
        if index > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

/// Bind a JSON value produced by the filter compiler.
pub(crate) fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(flag) => query.bind(i64::from(*flag)),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                query.bind(int)
            } else {
                query.bind(number.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(text) => query.bind(text.as_str()),
        // Arrays and objects are compared through their JSON encoding.
        other => query.bind(other.to_string()),
    }
}

/// Build an FTS5 MATCH query from free text: each token quoted so user
/// input cannot inject FTS syntax.
fn fts_match_query(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    let metadata: Option<String> = row.try_get("metadata")?;
    let tags: Option<String> = row.try_get("tags")?;

    Ok(MessageRecord {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        sender: AgentKey {
            name: row.try_get("sender_name")?,
            project_id: row.try_get("sender_project_id")?,
        },
        content: row.try_get("content")?,
        timestamp: row.try_get("ts_norm")?,
        confidence: row.try_get("confidence")?,
        metadata: metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("invalid metadata JSON in database")?,
        tags: tags
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("invalid tags JSON in database")?
            .unwrap_or_default(),
        session_context: row.try_get("session_context")?,
        thread_id: row.try_get("thread_id")?,
    })
}
