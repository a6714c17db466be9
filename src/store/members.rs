//! Membership rows: the only structure conferring channel access.

use super::types::{Capabilities, ChannelKind, MemberSource, Membership};
use super::{Store, now_ts};
use crate::error::{Error, Result};
use anyhow::Context as _;
use sqlx::Row as _;

impl Store {
    /// Add a membership row. Fails with Invariant when the channel has
    /// fixed membership (direct channels, notes channels) and with
    /// Conflict when the row already exists.
    pub async fn add_member(
        &self,
        channel_id: &str,
        agent_id: i64,
        caps: Capabilities,
        source: MemberSource,
        invited_by: &str,
        from_default: bool,
    ) -> Result<Membership> {
        let channel = self.require_channel(channel_id).await?;
        if channel.kind == ChannelKind::Direct {
            return Err(Error::invariant(format!(
                "direct channel '{channel_id}' has exactly two fixed members"
            )));
        }
        if channel.owner_agent_id.is_some() || crate::ids::is_notes_channel_id(&channel.id) {
            return Err(Error::invariant(format!(
                "notes channel '{channel_id}' admits only its owner"
            )));
        }
        if self.agent_by_id(agent_id).await?.is_none() {
            return Err(Error::not_found(format!("principal #{agent_id}")));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO channel_members
                (channel_id, agent_id, can_send, can_invite, can_leave, can_manage,
                 source, invited_by, from_default, opted_out, joined_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(channel_id)
        .bind(agent_id)
        .bind(caps.can_send)
        .bind(caps.can_invite)
        .bind(caps.can_leave)
        .bind(caps.can_manage)
        .bind(source.as_str())
        .bind(invited_by)
        .bind(from_default)
        .bind(now_ts())
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => self
                .membership(channel_id, agent_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("membership in '{channel_id}' after insert"))),
            Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                Err(Error::conflict(format!(
                    "principal #{agent_id} is already a member of channel '{channel_id}'"
                )))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Remove a membership row. Direct and notes channels deny removal.
    pub async fn remove_member(&self, channel_id: &str, agent_id: i64) -> Result<()> {
        let channel = self.require_channel(channel_id).await?;
        if channel.kind == ChannelKind::Direct {
            return Err(Error::invariant(format!(
                "direct channel '{channel_id}' has exactly two fixed members"
            )));
        }
        if channel.owner_agent_id.is_some() || crate::ids::is_notes_channel_id(&channel.id) {
            return Err(Error::invariant(format!(
                "notes channel '{channel_id}' keeps its owner membership"
            )));
        }

        let result = sqlx::query(
            "DELETE FROM channel_members WHERE channel_id = ? AND agent_id = ?",
        )
        .bind(channel_id)
        .bind(agent_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to remove member from '{channel_id}'"))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "principal #{agent_id} is not a member of channel '{channel_id}'"
            )));
        }
        Ok(())
    }

    /// Soft-leave for default-provisioned memberships: the row stays as
    /// a tombstone preventing re-provisioning.
    pub async fn set_opted_out(
        &self,
        channel_id: &str,
        agent_id: i64,
        opted_out: bool,
    ) -> Result<Membership> {
        let result = sqlx::query(
            "UPDATE channel_members SET opted_out = ? WHERE channel_id = ? AND agent_id = ?",
        )
        .bind(opted_out)
        .bind(channel_id)
        .bind(agent_id)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to update opt-out for '{channel_id}'"))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "principal #{agent_id} is not a member of channel '{channel_id}'"
            )));
        }
        self.membership(channel_id, agent_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("membership in '{channel_id}' after update")))
    }

    /// Fetch the membership row for (channel, principal), if any.
    pub async fn membership(
        &self,
        channel_id: &str,
        agent_id: i64,
    ) -> Result<Option<Membership>> {
        let row = sqlx::query(
            "SELECT channel_id, agent_id, can_send, can_invite, can_leave, can_manage, \
             source, invited_by, from_default, opted_out, joined_at \
             FROM channel_members WHERE channel_id = ? AND agent_id = ?",
        )
        .bind(channel_id)
        .bind(agent_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| membership_from_row(&row)).transpose()
    }

    /// All membership rows of a channel.
    pub async fn members_of(&self, channel_id: &str) -> Result<Vec<Membership>> {
        let rows = sqlx::query(
            "SELECT channel_id, agent_id, can_send, can_invite, can_leave, can_manage, \
             source, invited_by, from_default, opted_out, joined_at \
             FROM channel_members WHERE channel_id = ? ORDER BY agent_id",
        )
        .bind(channel_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(membership_from_row).collect()
    }

    /// All membership rows of a principal.
    pub async fn memberships_of(&self, agent_id: i64) -> Result<Vec<Membership>> {
        let rows = sqlx::query(
            "SELECT channel_id, agent_id, can_send, can_invite, can_leave, can_manage, \
             source, invited_by, from_default, opted_out, joined_at \
             FROM channel_members WHERE agent_id = ? ORDER BY channel_id",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(membership_from_row).collect()
    }

    /// Whether two principals share membership in any non-direct channel.
    /// Feeds the restricted DM policy.
    pub async fn share_regular_channel(&self, agent_a: i64, agent_b: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM channel_members ma
            JOIN channel_members mb
              ON ma.channel_id = mb.channel_id
            JOIN channels c ON c.id = ma.channel_id
            WHERE ma.agent_id = ? AND mb.agent_id = ?
              AND ma.opted_out = 0 AND mb.opted_out = 0
              AND c.kind != 'direct'
            "#,
        )
        .bind(agent_a)
        .bind(agent_b)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }
}

fn membership_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Membership> {
    let source_value: String = row.try_get("source")?;
    Ok(Membership {
        channel_id: row.try_get("channel_id")?,
        agent_id: row.try_get("agent_id")?,
        caps: Capabilities {
            can_send: row.try_get::<i64, _>("can_send")? != 0,
            can_invite: row.try_get::<i64, _>("can_invite")? != 0,
            can_leave: row.try_get::<i64, _>("can_leave")? != 0,
            can_manage: row.try_get::<i64, _>("can_manage")? != 0,
        },
        source: MemberSource::parse(&source_value).ok_or_else(|| {
            Error::Other(anyhow::anyhow!("invalid member source '{source_value}' in database"))
        })?,
        invited_by: row.try_get("invited_by")?,
        from_default: row.try_get::<i64, _>("from_default")? != 0,
        opted_out: row.try_get::<i64, _>("opted_out")? != 0,
        joined_at: row.try_get("joined_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentKey;
    use crate::store::channels::NewChannel;
    use crate::store::types::{AccessPolicy, ChannelScope, RegisterAgent};

    async fn setup() -> (std::sync::Arc<Store>, i64, i64) {
        let store = Store::open_in_memory().await.expect("store should open");
        let a = store
            .register_agent(RegisterAgent::new(AgentKey::global("a")))
            .await
            .unwrap();
        let b = store
            .register_agent(RegisterAgent::new(AgentKey::global("b")))
            .await
            .unwrap();
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
        (store, a.id, b.id)
    }

    #[tokio::test]
    async fn at_most_one_membership_row_per_pair() {
        let (store, a, _) = setup().await;
        store
            .add_member("global:dev", a, Capabilities::joiner(), MemberSource::SelfJoin, "self", false)
            .await
            .expect("join should succeed");
        let error = store
            .add_member("global:dev", a, Capabilities::joiner(), MemberSource::SelfJoin, "self", false)
            .await
            .expect_err("second join must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn direct_channels_reject_membership_changes() {
        let (store, a, b) = setup().await;
        store
            .create_direct_channel("dm:a:b", a, b)
            .await
            .expect("direct channel should be created");

        let c = store
            .register_agent(RegisterAgent::new(AgentKey::global("c")))
            .await
            .unwrap();
        let add = store
            .add_member("dm:a:b", c.id, Capabilities::joiner(), MemberSource::Manual, "self", false)
            .await
            .expect_err("third member must be rejected");
        assert_eq!(add.kind(), crate::error::ErrorKind::Invariant);

        let remove = store
            .remove_member("dm:a:b", a)
            .await
            .expect_err("removal must be rejected");
        assert_eq!(remove.kind(), crate::error::ErrorKind::Invariant);
    }

    #[tokio::test]
    async fn opted_out_rows_survive_as_tombstones() {
        let (store, a, _) = setup().await;
        store
            .add_member("global:dev", a, Capabilities::joiner(), MemberSource::Default, "system", true)
            .await
            .unwrap();

        let row = store.set_opted_out("global:dev", a, true).await.unwrap();
        assert!(row.opted_out);
        assert!(row.from_default);

        // The tombstone still counts as the single row for the pair.
        let error = store
            .add_member("global:dev", a, Capabilities::joiner(), MemberSource::Default, "system", true)
            .await
            .expect_err("tombstone must block re-add");
        assert_eq!(error.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn shared_channel_detection_ignores_direct_channels() {
        let (store, a, b) = setup().await;
        store.create_direct_channel("dm:a:b", a, b).await.unwrap();
        assert!(!store.share_regular_channel(a, b).await.unwrap());

        for agent in [a, b] {
            store
                .add_member("global:dev", agent, Capabilities::joiner(), MemberSource::SelfJoin, "self", false)
                .await
                .unwrap();
        }
        assert!(store.share_regular_channel(a, b).await.unwrap());
    }
}
