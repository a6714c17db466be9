//! Relational store (SQLite): durable source of truth for projects,
//! principals, channels, memberships, messages and project links, plus
//! the precomputed access views.

pub mod access;
pub mod agents;
pub mod channels;
pub mod members;
pub mod messages;
pub mod projects;
pub mod schema;
pub mod types;

pub use access::{AccessDecision, DmDecision};
pub use channels::NewChannel;
pub use types::{
    AccessPolicy, Agent, Capabilities, Channel, ChannelKind, ChannelScope, Discoverability,
    DmPolicy, LinkType, MemberSource, Membership, MessageRecord, NewMessage, Project,
    ProjectLink, RegisterAgent,
};

use crate::error::Result;
use anyhow::Context as _;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;

/// Relational store over a SQLite pool.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file and run schema setup.
    pub async fn open(path: &Path) -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(Arc::new(store))
    }

    /// Open an in-memory database. Used by tests and throwaway setups.
    pub async fn open_in_memory() -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("in-memory sqlite should connect")?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .context("failed to enable foreign keys")?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(Arc::new(store))
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) use crate::now_ts;

#[cfg(test)]
mod tests {
    use super::Store;

    #[tokio::test]
    async fn open_creates_the_database_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("substrate.db");

        let store = Store::open(&path).await.expect("store should open");
        assert!(path.exists());

        // Re-opening an existing file runs the idempotent schema setup.
        drop(store);
        Store::open(&path).await.expect("store should reopen");
    }
}
