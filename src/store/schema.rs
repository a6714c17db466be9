//! Schema setup and legacy migrations.

use super::Store;
use crate::error::Result;
use anyhow::Context as _;
use sqlx::Row as _;

/// SQL fragment normalizing a possibly-legacy (ISO text) timestamp to
/// Unix seconds. Legacy layouts stored `messages.timestamp` as ISO-8601
/// text; those rows are converted on read and rewritten on the next
/// update that touches them.
pub(crate) const TS_READ: &str =
    "CASE WHEN typeof(m.timestamp) = 'text' \
     THEN CAST(strftime('%s', m.timestamp) AS REAL) ELSE m.timestamp END";

impl Store {
    /// Create tables, indices and full-text triggers, then migrate any
    /// legacy layout remnants.
    pub(crate) async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                created_at REAL NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await
        .with_context(|| "failed to create projects table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                project_id TEXT REFERENCES projects(id),
                description TEXT NOT NULL DEFAULT '',
                discoverability TEXT NOT NULL DEFAULT 'public',
                dm_policy TEXT NOT NULL DEFAULT 'open',
                dm_allow TEXT NOT NULL DEFAULT '[]',
                dm_block TEXT NOT NULL DEFAULT '[]',
                never_default INTEGER NOT NULL DEFAULT 0,
                created_at REAL NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await
        .with_context(|| "failed to create agents table")?;

        // Global and project-scoped principals share names; identity is
        // (name, project-or-null).
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_identity \
             ON agents(name, COALESCE(project_id, ''))",
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'regular',
                access TEXT NOT NULL,
                project_id TEXT REFERENCES projects(id),
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                is_default INTEGER NOT NULL DEFAULT 0,
                archived INTEGER NOT NULL DEFAULT 0,
                owner_agent_id INTEGER REFERENCES agents(id) ON DELETE SET NULL,
                created_at REAL NOT NULL
            )
            "#,
        )
        .execute(self.pool())
        .await
        .with_context(|| "failed to create channels table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_channels_project ON channels(project_id, is_default)",
        )
        .execute(self.pool())
        .await?;

        // Memberships carry the capability bits. This is the only table
        // conferring channel access; absence is denial.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_members (
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                can_send INTEGER NOT NULL DEFAULT 1,
                can_invite INTEGER NOT NULL DEFAULT 0,
                can_leave INTEGER NOT NULL DEFAULT 1,
                can_manage INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT 'manual',
                invited_by TEXT NOT NULL DEFAULT 'self',
                from_default INTEGER NOT NULL DEFAULT 0,
                opted_out INTEGER NOT NULL DEFAULT 0,
                joined_at REAL NOT NULL,
                PRIMARY KEY (channel_id, agent_id)
            )
            "#,
        )
        .execute(self.pool())
        .await
        .with_context(|| "failed to create channel_members table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_members_agent ON channel_members(agent_id)",
        )
        .execute(self.pool())
        .await?;

        // Messages carry the composite sender reference (name + optional
        // project) so rows outlive principal deletion.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                sender_name TEXT NOT NULL,
                sender_project_id TEXT,
                content TEXT NOT NULL,
                timestamp REAL NOT NULL,
                confidence REAL,
                metadata TEXT,
                tags TEXT,
                session_context TEXT,
                thread_id TEXT
            )
            "#,
        )
        .execute(self.pool())
        .await
        .with_context(|| "failed to create messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_channel_ts \
             ON messages(channel_id, timestamp, id)",
        )
        .execute(self.pool())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id)")
            .execute(self.pool())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_links (
                project_a TEXT NOT NULL REFERENCES projects(id),
                project_b TEXT NOT NULL REFERENCES projects(id),
                link_type TEXT NOT NULL DEFAULT 'bidirectional',
                enabled INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (project_a, project_b)
            )
            "#,
        )
        .execute(self.pool())
        .await
        .with_context(|| "failed to create project_links table")?;

        self.create_fts().await?;
        self.migrate_legacy_subscriptions().await?;

        Ok(())
    }

    /// Full-text index over message content, kept in sync by triggers.
    async fn create_fts(&self) -> Result<()> {
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts \
             USING fts5(content, content='messages', content_rowid='id')",
        )
        .execute(self.pool())
        .await
        .with_context(|| "failed to create messages_fts table")?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS messages_fts_ai AFTER INSERT ON messages BEGIN
                INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
            END
            "#,
        )
        .execute(self.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS messages_fts_ad AFTER DELETE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, content)
                VALUES ('delete', old.id, old.content);
            END
            "#,
        )
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Migrate a legacy `subscriptions` table if one exists: insert
    /// equivalent membership rows with `source='self'`, then drop it.
    async fn migrate_legacy_subscriptions(&self) -> Result<()> {
        let exists: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'subscriptions'",
        )
        .fetch_optional(self.pool())
        .await?;

        if exists.is_none() {
            return Ok(());
        }

        let columns = sqlx::query("PRAGMA table_info(subscriptions)")
            .fetch_all(self.pool())
            .await?;
        let has = |name: &str| {
            columns.iter().any(|row| {
                row.try_get::<String, _>("name")
                    .map(|column| column == name)
                    .unwrap_or(false)
            })
        };

        if has("channel_id") && has("agent_id") {
            let migrated = sqlx::query(
                r#"
                INSERT OR IGNORE INTO channel_members
                    (channel_id, agent_id, can_send, can_invite, can_leave, can_manage,
                     source, invited_by, from_default, opted_out, joined_at)
                SELECT channel_id, agent_id, 1, 0, 1, 0, 'self', 'self', 0, 0, ?
                FROM subscriptions
                "#,
            )
            .bind(super::now_ts())
            .execute(self.pool())
            .await
            .with_context(|| "failed to migrate legacy subscriptions")?;

            tracing::info!(
                rows = migrated.rows_affected(),
                "migrated legacy subscriptions into channel_members"
            );
        } else {
            tracing::warn!("legacy subscriptions table has an unknown shape, dropping as-is");
        }

        sqlx::query("DROP TABLE subscriptions")
            .execute(self.pool())
            .await
            .with_context(|| "failed to drop legacy subscriptions table")?;

        Ok(())
    }
}
