//! Channel creation, lookup and archival.

use super::types::{
    AccessPolicy, Capabilities, Channel, ChannelKind, ChannelScope, MemberSource,
};
use super::{Store, now_ts};
use crate::error::{Error, Result};
use crate::ids;
use anyhow::Context as _;
use sqlx::Row as _;

/// Arguments for creating a regular channel.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub id: String,
    pub scope: ChannelScope,
    pub access: AccessPolicy,
    pub project_id: Option<String>,
    pub name: String,
    pub description: String,
    pub is_default: bool,
    pub owner_agent_id: Option<i64>,
}

impl Store {
    /// Create a regular channel. Fails with Conflict when the id exists.
    pub async fn create_channel(&self, input: NewChannel) -> Result<Channel> {
        ids::validate_name(&input.name, "channel")?;
        if input.scope == ChannelScope::Direct {
            return Err(Error::invariant(format!(
                "channel '{}' cannot be created with direct scope; use create_direct_channel",
                input.id
            )));
        }
        if input.scope == ChannelScope::Project {
            let project_id = input.project_id.as_deref().ok_or_else(|| {
                Error::bad_request(format!("project channel '{}' is missing a project id", input.id))
            })?;
            if self.project(project_id).await?.is_none() {
                return Err(Error::not_found(format!("project '{project_id}'")));
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO channels
                (id, scope, kind, access, project_id, name, description,
                 is_default, archived, owner_agent_id, created_at)
            VALUES (?, ?, 'regular', ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&input.id)
        .bind(input.scope.as_str())
        .bind(input.access.as_str())
        .bind(&input.project_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.is_default)
        .bind(input.owner_agent_id)
        .bind(now_ts())
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => self.require_channel(&input.id).await,
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => Err(
                Error::conflict(format!("channel '{}' already exists", input.id)),
            ),
            Err(error) => Err(error.into()),
        }
    }

    /// Create a direct channel plus its two fixed membership rows in one
    /// transaction. Callers have already passed the symmetric DM check.
    pub async fn create_direct_channel(
        &self,
        channel_id: &str,
        agent_a: i64,
        agent_b: i64,
    ) -> Result<Channel> {
        if agent_a == agent_b {
            return Err(Error::invariant(
                "a direct channel requires two distinct principals".to_string(),
            ));
        }

        let mut tx = self
            .pool()
            .begin()
            .await
            .context("failed to open direct channel transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO channels
                (id, scope, kind, access, project_id, name, description,
                 is_default, archived, owner_agent_id, created_at)
            VALUES (?, 'direct', 'direct', 'private', NULL, ?, '', 0, 0, NULL, ?)
            "#,
        )
        .bind(channel_id)
        .bind(channel_id)
        .bind(now_ts())
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_error)) = &inserted
            && db_error.is_unique_violation()
        {
            return Err(Error::conflict(format!(
                "direct channel '{channel_id}' already exists"
            )));
        }
        inserted.context("failed to insert direct channel")?;

        for agent_id in [agent_a, agent_b] {
            sqlx::query(
                r#"
                INSERT INTO channel_members
                    (channel_id, agent_id, can_send, can_invite, can_leave, can_manage,
                     source, invited_by, from_default, opted_out, joined_at)
                VALUES (?, ?, 1, 0, 0, 0, ?, 'system', 0, 0, ?)
                "#,
            )
            .bind(channel_id)
            .bind(agent_id)
            .bind(MemberSource::System.as_str())
            .bind(now_ts())
            .execute(&mut *tx)
            .await
            .context("failed to insert direct channel member")?;
        }

        tx.commit()
            .await
            .context("failed to commit direct channel transaction")?;

        self.require_channel(channel_id).await
    }

    /// Create a notes channel owned by a single principal, with its one
    /// fixed membership row.
    pub async fn create_notes_channel(
        &self,
        channel_id: &str,
        scope: ChannelScope,
        project_id: Option<&str>,
        owner_agent_id: i64,
        owner_name: &str,
    ) -> Result<Channel> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .context("failed to open notes channel transaction")?;

        let caps = Capabilities::notes_owner();
        let inserted = sqlx::query(
            r#"
            INSERT INTO channels
                (id, scope, kind, access, project_id, name, description,
                 is_default, archived, owner_agent_id, created_at)
            VALUES (?, ?, 'regular', 'private', ?, ?, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(channel_id)
        .bind(scope.as_str())
        .bind(project_id)
        .bind(format!("{}-notes", owner_name))
        .bind(format!("Durable notes for {owner_name}"))
        .bind(owner_agent_id)
        .bind(now_ts())
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_error)) = &inserted
            && db_error.is_unique_violation()
        {
            return Err(Error::conflict(format!(
                "notes channel '{channel_id}' already exists"
            )));
        }
        inserted.context("failed to insert notes channel")?;

        sqlx::query(
            r#"
            INSERT INTO channel_members
                (channel_id, agent_id, can_send, can_invite, can_leave, can_manage,
                 source, invited_by, from_default, opted_out, joined_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'system', 0, 0, ?)
            "#,
        )
        .bind(channel_id)
        .bind(owner_agent_id)
        .bind(caps.can_send)
        .bind(caps.can_invite)
        .bind(caps.can_leave)
        .bind(caps.can_manage)
        .bind(MemberSource::System.as_str())
        .bind(now_ts())
        .execute(&mut *tx)
        .await
        .context("failed to insert notes channel owner membership")?;

        tx.commit()
            .await
            .context("failed to commit notes channel transaction")?;

        self.require_channel(channel_id).await
    }

    /// Look up a channel by id.
    pub async fn channel(&self, id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query(
            "SELECT id, scope, kind, access, project_id, name, description, \
             is_default, archived, owner_agent_id, created_at FROM channels WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| channel_from_row(&row)).transpose()
    }

    /// Look up a channel, failing with NotFound when absent.
    pub async fn require_channel(&self, id: &str) -> Result<Channel> {
        self.channel(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("channel '{id}'")))
    }

    /// Soft-archive a channel.
    pub async fn archive_channel(&self, id: &str) -> Result<Channel> {
        let channel = self.require_channel(id).await?;
        sqlx::query("UPDATE channels SET archived = 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .with_context(|| format!("failed to archive channel '{id}'"))?;
        Ok(Channel {
            archived: true,
            ..channel
        })
    }

    /// Update a channel's display name and/or description.
    pub async fn update_channel(
        &self,
        id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Channel> {
        let channel = self.require_channel(id).await?;
        if let Some(name) = name {
            ids::validate_name(name, "channel")?;
        }

        sqlx::query(
            "UPDATE channels SET name = COALESCE(?, name), \
             description = COALESCE(?, description) WHERE id = ?",
        )
        .bind(name)
        .bind(description)
        .bind(id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to update channel '{id}'"))?;

        Ok(Channel {
            name: name.map(str::to_string).unwrap_or(channel.name),
            description: description.map(str::to_string).unwrap_or(channel.description),
            ..channel
        })
    }

    /// Default channels within a scope, used by default provisioning.
    pub async fn default_channels(&self, project_id: Option<&str>) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT id, scope, kind, access, project_id, name, description, \
             is_default, archived, owner_agent_id, created_at \
             FROM channels \
             WHERE is_default = 1 AND archived = 0 \
               AND COALESCE(project_id, '') = COALESCE(?, '') \
             ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(channel_from_row).collect()
    }

    /// All channels, ordered by id. Callers apply access filtering.
    pub async fn all_channels(&self) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT id, scope, kind, access, project_id, name, description, \
             is_default, archived, owner_agent_id, created_at FROM channels ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(channel_from_row).collect()
    }
}

pub(crate) fn channel_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Channel> {
    let scope_value: String = row.try_get("scope")?;
    let kind_value: String = row.try_get("kind")?;
    let access_value: String = row.try_get("access")?;

    Ok(Channel {
        id: row.try_get("id")?,
        scope: ChannelScope::parse(&scope_value).ok_or_else(|| {
            Error::Other(anyhow::anyhow!("invalid channel scope '{scope_value}' in database"))
        })?,
        kind: ChannelKind::parse(&kind_value).ok_or_else(|| {
            Error::Other(anyhow::anyhow!("invalid channel kind '{kind_value}' in database"))
        })?,
        access: AccessPolicy::parse(&access_value).ok_or_else(|| {
            Error::Other(anyhow::anyhow!("invalid channel access '{access_value}' in database"))
        })?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
        archived: row.try_get::<i64, _>("archived")? != 0,
        owner_agent_id: row.try_get("owner_agent_id")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentKey;
    use crate::store::types::RegisterAgent;

    #[tokio::test]
    async fn duplicate_channel_ids_conflict() {
        let store = Store::open_in_memory().await.expect("store should open");
        let input = NewChannel {
            id: "global:dev".into(),
            scope: ChannelScope::Global,
            access: AccessPolicy::Open,
            project_id: None,
            name: "dev".into(),
            description: String::new(),
            is_default: false,
            owner_agent_id: None,
        };

        store
            .create_channel(input.clone())
            .await
            .expect("first create should succeed");
        let error = store
            .create_channel(input)
            .await
            .expect_err("second create must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn direct_channels_have_exactly_two_fixed_members() {
        let store = Store::open_in_memory().await.expect("store should open");
        let a = store
            .register_agent(RegisterAgent::new(AgentKey::global("a")))
            .await
            .unwrap();
        let b = store
            .register_agent(RegisterAgent::new(AgentKey::global("b")))
            .await
            .unwrap();

        let channel = store
            .create_direct_channel("dm:a:b", a.id, b.id)
            .await
            .expect("direct channel should be created");
        assert_eq!(channel.kind, ChannelKind::Direct);
        assert_eq!(channel.access, AccessPolicy::Private);

        let members = store.members_of(&channel.id).await.expect("members listed");
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| !m.caps.can_leave && m.caps.can_send));
    }

    #[tokio::test]
    async fn archive_is_soft() {
        let store = Store::open_in_memory().await.expect("store should open");
        store
            .create_channel(NewChannel {
                id: "global:dev".into(),
                scope: ChannelScope::Global,
                access: AccessPolicy::Open,
                project_id: None,
                name: "dev".into(),
                description: String::new(),
                is_default: false,
                owner_agent_id: None,
            })
            .await
            .unwrap();

        let archived = store.archive_channel("global:dev").await.unwrap();
        assert!(archived.archived);
        assert!(store.channel("global:dev").await.unwrap().is_some());
    }
}
