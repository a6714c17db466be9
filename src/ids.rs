//! Identifier grammar: project ids, principal keys, channel ids.
//!
//! The canonical forms are bit-exact:
//! - global regular channel: `global:<name>`
//! - project regular channel: `proj_<id8>:<name>`
//! - direct channel: `dm:<a-name>[:<a-proj8>]:<b-name>[:<b-proj8>]`
//! - notes channel: `global:agent-notes:<owner>` or `proj_<id8>:agent-notes:<owner>`
//! - principal: `name` (global) or `name@proj_<id8>`

use crate::error::{Error, Result};
use sha2::{Digest as _, Sha256};

/// Marker segment identifying a notes channel id.
pub const NOTES_MARKER: &str = "agent-notes";

/// Number of hex chars of the project id used in serialized identifiers.
pub const PROJECT_ID_PREFIX: usize = 8;

/// Derive a stable project id from an absolute filesystem path.
///
/// First 32 hex chars of SHA-256 over the path bytes. The path is not
/// canonicalized here; callers pass an absolute path.
pub fn project_id_from_path(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// The 8-char prefix of a project id used in channel and principal ids.
pub fn short_project_id(project_id: &str) -> &str {
    &project_id[..PROJECT_ID_PREFIX.min(project_id.len())]
}

/// A principal key: name plus owning project (absent means global scope).
///
/// Holds the full project id; serialized forms truncate to the 8-char
/// prefix per the identifier grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct AgentKey {
    pub name: String,
    pub project_id: Option<String>,
}

impl AgentKey {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project_id: None,
        }
    }

    pub fn scoped(name: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project_id: Some(project_id.into()),
        }
    }

    pub fn is_global(&self) -> bool {
        self.project_id.is_none()
    }

    /// Sort key for direct channel ids: by name, then absent project
    /// before present, then project id.
    fn dm_sort_key(&self) -> (&str, bool, &str) {
        (
            &self.name,
            self.project_id.is_some(),
            self.project_id.as_deref().unwrap_or(""),
        )
    }
}

impl std::fmt::Display for AgentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.project_id {
            Some(project_id) => write!(f, "{}@proj_{}", self.name, short_project_id(project_id)),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Parse a serialized principal reference into `(name, project_id_prefix)`.
///
/// The prefix is the 8-char form; callers resolve it to a full project id
/// against the registered projects.
pub fn parse_agent_ref(value: &str) -> Result<(String, Option<String>)> {
    match value.split_once('@') {
        None => {
            validate_name(value, "principal")?;
            Ok((value.to_string(), None))
        }
        Some((name, scope)) => {
            validate_name(name, "principal")?;
            let prefix = scope.strip_prefix("proj_").ok_or_else(|| {
                Error::bad_request(format!("principal '{value}' has a malformed project scope"))
            })?;
            if prefix.len() != PROJECT_ID_PREFIX || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::bad_request(format!(
                    "principal '{value}' has a malformed project id prefix '{prefix}'"
                )));
            }
            Ok((name.to_string(), Some(prefix.to_string())))
        }
    }
}

/// Validate a channel or principal name segment.
///
/// Names participate in colon-delimited ids, so ':' and '@' are reserved.
pub fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::bad_request(format!("{what} name is empty")));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::bad_request(format!(
            "{what} name '{name}' contains characters outside [a-zA-Z0-9._-]"
        )));
    }
    Ok(())
}

/// Canonical id for a global regular channel.
pub fn global_channel_id(name: &str) -> String {
    format!("global:{name}")
}

/// Canonical id for a project-scoped regular channel.
pub fn project_channel_id(project_id: &str, name: &str) -> String {
    format!("proj_{}:{name}", short_project_id(project_id))
}

/// Canonical id for a direct channel between two principals.
///
/// The two (name, project) pairs are sorted by name, then by project id
/// with absent ordering before present.
pub fn direct_channel_id(a: &AgentKey, b: &AgentKey) -> String {
    let (first, second) = if a.dm_sort_key() <= b.dm_sort_key() {
        (a, b)
    } else {
        (b, a)
    };

    let mut id = String::from("dm");
    for key in [first, second] {
        id.push(':');
        id.push_str(&key.name);
        if let Some(project_id) = &key.project_id {
            id.push(':');
            id.push_str(short_project_id(project_id));
        }
    }
    id
}

/// Canonical id for a principal's notes channel within a scope.
pub fn notes_channel_id(scope_project_id: Option<&str>, owner_name: &str) -> String {
    match scope_project_id {
        Some(project_id) => format!(
            "proj_{}:{NOTES_MARKER}:{owner_name}",
            short_project_id(project_id)
        ),
        None => format!("global:{NOTES_MARKER}:{owner_name}"),
    }
}

/// Whether a channel id carries the notes marker.
pub fn is_notes_channel_id(channel_id: &str) -> bool {
    let mut segments = channel_id.split(':');
    let _scope = segments.next();
    segments.next() == Some(NOTES_MARKER)
}

/// Whether a channel id is a direct channel id (canonical or legacy).
///
/// Legacy direct ids omit the project suffixes (`dm:alice:bob`); both
/// forms are accepted on read.
pub fn is_direct_channel_id(channel_id: &str) -> bool {
    channel_id.starts_with("dm:")
}
