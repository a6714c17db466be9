//! Principal registration and lookup.

use super::types::{Agent, Discoverability, DmPolicy, RegisterAgent};
use super::{Store, now_ts};
use crate::error::{Error, Result};
use crate::ids::{self, AgentKey};
use anyhow::Context as _;
use sqlx::Row as _;

impl Store {
    /// Upsert a principal. Principals are never auto-created on first
    /// message send unless the hybrid store is configured to do so.
    pub async fn register_agent(&self, input: RegisterAgent) -> Result<Agent> {
        ids::validate_name(&input.key.name, "principal")?;
        if let Some(project_id) = &input.key.project_id
            && self.project(project_id).await?.is_none()
        {
            return Err(Error::not_found(format!("project '{project_id}'")));
        }

        let dm_allow = serde_json::to_string(&input.dm_allow)
            .context("failed to serialize dm allow list")?;
        let dm_block = serde_json::to_string(&input.dm_block)
            .context("failed to serialize dm block list")?;

        sqlx::query(
            r#"
            INSERT INTO agents
                (name, project_id, description, discoverability, dm_policy,
                 dm_allow, dm_block, never_default, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name, COALESCE(project_id, '')) DO UPDATE SET
                description = excluded.description,
                discoverability = excluded.discoverability,
                dm_policy = excluded.dm_policy,
                dm_allow = excluded.dm_allow,
                dm_block = excluded.dm_block,
                never_default = excluded.never_default
            "#,
        )
        .bind(&input.key.name)
        .bind(&input.key.project_id)
        .bind(&input.description)
        .bind(input.discoverability.as_str())
        .bind(input.dm_policy.as_str())
        .bind(&dm_allow)
        .bind(&dm_block)
        .bind(input.never_default)
        .bind(now_ts())
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to register principal '{}'", input.key))?;

        self.agent(&input.key)
            .await?
            .ok_or_else(|| Error::not_found(format!("principal '{}' after registration", input.key)))
    }

    /// Look up a principal by (name, project-or-null) key.
    pub async fn agent(&self, key: &AgentKey) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, name, project_id, description, discoverability, dm_policy, \
             dm_allow, dm_block, never_default, created_at \
             FROM agents WHERE name = ? AND COALESCE(project_id, '') = COALESCE(?, '')",
        )
        .bind(&key.name)
        .bind(&key.project_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| agent_from_row(&row)).transpose()
    }

    /// Look up a principal by surrogate id.
    pub async fn agent_by_id(&self, id: i64) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT id, name, project_id, description, discoverability, dm_policy, \
             dm_allow, dm_block, never_default, created_at FROM agents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| agent_from_row(&row)).transpose()
    }

    /// Look up a principal, failing with NotFound when absent.
    pub async fn require_agent(&self, key: &AgentKey) -> Result<Agent> {
        self.agent(key)
            .await?
            .ok_or_else(|| Error::not_found(format!("principal '{key}'")))
    }

    /// Delete a principal. Membership rows cascade; messages keep their
    /// composite sender reference.
    pub async fn delete_agent(&self, key: &AgentKey) -> Result<Agent> {
        let agent = self.require_agent(key).await?;
        sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(agent.id)
            .execute(self.pool())
            .await
            .with_context(|| format!("failed to delete principal '{key}'"))?;
        Ok(agent)
    }

    /// List principals ordered by (project-id nulls first, name).
    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT id, name, project_id, description, discoverability, dm_policy, \
             dm_allow, dm_block, never_default, created_at \
             FROM agents ORDER BY project_id IS NOT NULL, project_id, name",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(agent_from_row).collect()
    }
}

fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Agent> {
    let discoverability_value: String = row.try_get("discoverability")?;
    let dm_policy_value: String = row.try_get("dm_policy")?;
    let dm_allow_value: String = row.try_get("dm_allow")?;
    let dm_block_value: String = row.try_get("dm_block")?;

    Ok(Agent {
        id: row.try_get("id")?,
        key: AgentKey {
            name: row.try_get("name")?,
            project_id: row.try_get("project_id")?,
        },
        description: row.try_get("description")?,
        discoverability: Discoverability::parse(&discoverability_value).ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "invalid discoverability '{discoverability_value}' in database"
            ))
        })?,
        dm_policy: DmPolicy::parse(&dm_policy_value).ok_or_else(|| {
            Error::Other(anyhow::anyhow!("invalid dm policy '{dm_policy_value}' in database"))
        })?,
        dm_allow: serde_json::from_str(&dm_allow_value).unwrap_or_default(),
        dm_block: serde_json::from_str(&dm_block_value).unwrap_or_default(),
        never_default: row.try_get::<i64, _>("never_default")? != 0,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_preserves_identity() {
        let store = Store::open_in_memory().await.expect("store should open");
        let key = AgentKey::global("alice");

        let first = store
            .register_agent(RegisterAgent::new(key.clone()))
            .await
            .expect("registration should succeed");
        let second = store
            .register_agent(RegisterAgent {
                description: "orchestrator".into(),
                ..RegisterAgent::new(key.clone())
            })
            .await
            .expect("re-registration should succeed");

        assert_eq!(first.id, second.id);
        assert_eq!(second.description, "orchestrator");
    }

    #[tokio::test]
    async fn global_and_scoped_principals_share_names() {
        let store = Store::open_in_memory().await.expect("store should open");
        let project = store.register_project("/work/alpha", "Alpha").await.unwrap();

        let global = store
            .register_agent(RegisterAgent::new(AgentKey::global("sam")))
            .await
            .expect("global sam should register");
        let scoped = store
            .register_agent(RegisterAgent::new(AgentKey::scoped("sam", project.id.clone())))
            .await
            .expect("scoped sam should register");

        assert_ne!(global.id, scoped.id);

        // Global principals sort before project-scoped ones.
        let listed = store.list_agents().await.expect("listing should succeed");
        assert_eq!(listed[0].key, AgentKey::global("sam"));
    }

    #[tokio::test]
    async fn scoped_registration_requires_the_project() {
        let store = Store::open_in_memory().await.expect("store should open");
        let error = store
            .register_agent(RegisterAgent::new(AgentKey::scoped("sam", "deadbeef")))
            .await
            .expect_err("unknown project must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::NotFound);
    }
}
