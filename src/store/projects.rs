//! Project registration and project links.

use super::types::{LinkType, Project, ProjectLink};
use super::{Store, now_ts};
use crate::error::{Error, Result};
use crate::ids;
use anyhow::Context as _;
use sqlx::Row as _;

impl Store {
    /// Register a project by absolute path. Idempotent: re-registering
    /// the same path returns the existing project, updating its display
    /// name when one is supplied.
    pub async fn register_project(&self, path: &str, name: &str) -> Result<Project> {
        let id = ids::project_id_from_path(path);

        sqlx::query(
            r#"
            INSERT INTO projects (id, path, name, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            "#,
        )
        .bind(&id)
        .bind(path)
        .bind(name)
        .bind(now_ts())
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to register project at {path}"))?;

        self.project(&id)
            .await?
            .ok_or_else(|| Error::not_found(format!("project '{id}' after registration")))
    }

    /// Look up a project by full id.
    pub async fn project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, path, name, created_at FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.map(|row| project_from_row(&row)).transpose()
    }

    /// Resolve an 8-char project id prefix (as it appears in serialized
    /// identifiers) to the full project id.
    pub async fn resolve_project_prefix(&self, prefix: &str) -> Result<Option<Project>> {
        let pattern = format!("{prefix}%");
        let rows = sqlx::query("SELECT id, path, name, created_at FROM projects WHERE id LIKE ?")
            .bind(&pattern)
            .fetch_all(self.pool())
            .await?;

        match rows.len() {
            0 => Ok(None),
            1 => project_from_row(&rows[0]).map(Some),
            _ => Err(Error::conflict(format!(
                "project id prefix '{prefix}' is ambiguous"
            ))),
        }
    }

    /// Create or update a link between two projects.
    pub async fn link_projects(&self, a: &str, b: &str, link_type: LinkType) -> Result<()> {
        if a == b {
            return Err(Error::bad_request(format!(
                "cannot link project '{a}' to itself"
            )));
        }
        for id in [a, b] {
            if self.project(id).await?.is_none() {
                return Err(Error::not_found(format!("project '{id}'")));
            }
        }

        let (first, second, stored_type) = normalize_link(a, b, link_type);
        sqlx::query(
            r#"
            INSERT INTO project_links (project_a, project_b, link_type, enabled)
            VALUES (?, ?, ?, 1)
            ON CONFLICT(project_a, project_b)
            DO UPDATE SET link_type = excluded.link_type, enabled = 1
            "#,
        )
        .bind(first)
        .bind(second)
        .bind(stored_type.as_str())
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to link projects {a} and {b}"))?;

        Ok(())
    }

    /// Disable the link between two projects.
    pub async fn unlink_projects(&self, a: &str, b: &str) -> Result<()> {
        let (first, second, _) = normalize_link(a, b, LinkType::Bidirectional);
        sqlx::query(
            "UPDATE project_links SET enabled = 0 WHERE project_a = ? AND project_b = ?",
        )
        .bind(first)
        .bind(second)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to unlink projects {a} and {b}"))?;
        Ok(())
    }

    /// Whether discovery is permitted from `from` into `to`.
    pub async fn projects_linked(&self, from: &str, to: &str) -> Result<bool> {
        if from == to {
            return Ok(true);
        }
        let (first, second, _) = normalize_link(from, to, LinkType::Bidirectional);
        let row = sqlx::query(
            "SELECT link_type, enabled FROM project_links WHERE project_a = ? AND project_b = ?",
        )
        .bind(first)
        .bind(second)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };
        if row.try_get::<i64, _>("enabled")? == 0 {
            return Ok(false);
        }

        let stored: String = row.try_get("link_type")?;
        let link_type = LinkType::parse(&stored)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("invalid link type '{stored}'")))?;

        // Stored direction is relative to the normalized (first, second)
        // ordering; `from == first` means the stored a→b arrow points the
        // way we are asking about.
        Ok(match link_type {
            LinkType::Bidirectional => true,
            LinkType::AToB => from == first,
            LinkType::BToA => from == second,
        })
    }

    /// All links touching a project, enabled or not.
    pub async fn project_links(&self, project_id: &str) -> Result<Vec<ProjectLink>> {
        let rows = sqlx::query(
            "SELECT project_a, project_b, link_type, enabled FROM project_links \
             WHERE project_a = ? OR project_b = ?",
        )
        .bind(project_id)
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let stored: String = row.try_get("link_type")?;
                Ok(ProjectLink {
                    project_a: row.try_get("project_a")?,
                    project_b: row.try_get("project_b")?,
                    link_type: LinkType::parse(&stored).ok_or_else(|| {
                        Error::Other(anyhow::anyhow!("invalid link type '{stored}'"))
                    })?,
                    enabled: row.try_get::<i64, _>("enabled")? != 0,
                })
            })
            .collect()
    }
}

/// Normalize a link to the stored (project_a < project_b) ordering,
/// flipping the direction when the pair is swapped.
fn normalize_link<'a>(a: &'a str, b: &'a str, link_type: LinkType) -> (&'a str, &'a str, LinkType) {
    if a <= b {
        (a, b, link_type)
    } else {
        let flipped = match link_type {
            LinkType::Bidirectional => LinkType::Bidirectional,
            LinkType::AToB => LinkType::BToA,
            LinkType::BToA => LinkType::AToB,
        };
        (b, a, flipped)
    }
}

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registration_is_idempotent() {
        let store = Store::open_in_memory().await.expect("store should open");
        let first = store
            .register_project("/work/alpha", "Alpha")
            .await
            .expect("registration should succeed");
        let second = store
            .register_project("/work/alpha", "Alpha Renamed")
            .await
            .expect("re-registration should succeed");

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Alpha Renamed");
    }

    #[tokio::test]
    async fn directed_links_permit_one_way_discovery() {
        let store = Store::open_in_memory().await.expect("store should open");
        let alpha = store.register_project("/work/alpha", "Alpha").await.unwrap();
        let beta = store.register_project("/work/beta", "Beta").await.unwrap();

        store
            .link_projects(&alpha.id, &beta.id, LinkType::AToB)
            .await
            .expect("link should succeed");

        assert!(store.projects_linked(&alpha.id, &beta.id).await.unwrap());
        assert!(!store.projects_linked(&beta.id, &alpha.id).await.unwrap());

        store
            .unlink_projects(&alpha.id, &beta.id)
            .await
            .expect("unlink should succeed");
        assert!(!store.projects_linked(&alpha.id, &beta.id).await.unwrap());
    }

    #[tokio::test]
    async fn self_links_are_rejected() {
        let store = Store::open_in_memory().await.expect("store should open");
        let alpha = store.register_project("/work/alpha", "Alpha").await.unwrap();
        let error = store
            .link_projects(&alpha.id, &alpha.id, LinkType::Bidirectional)
            .await
            .expect_err("self link must fail");
        assert_eq!(error.kind(), crate::error::ErrorKind::BadRequest);
    }
}
