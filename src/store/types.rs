//! Row types and value enums for the relational store.

use crate::ids::AgentKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel tenancy scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelScope {
    Global,
    Project,
    Direct,
}

impl ChannelScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelScope::Global => "global",
            ChannelScope::Project => "project",
            ChannelScope::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(ChannelScope::Global),
            "project" => Some(ChannelScope::Project),
            "direct" => Some(ChannelScope::Direct),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Channel conversation kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Regular,
    Direct,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Regular => "regular",
            ChannelKind::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "regular" => Some(ChannelKind::Regular),
            "direct" => Some(ChannelKind::Direct),
            _ => None,
        }
    }
}

/// Channel access policy: who may see and join.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessPolicy {
    /// Visible and self-joinable within the scope rules.
    Open,
    /// Visible to members; joining requires an invitation.
    Members,
    /// Invisible to non-members; never self-joinable.
    Private,
}

impl AccessPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessPolicy::Open => "open",
            AccessPolicy::Members => "members",
            AccessPolicy::Private => "private",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(AccessPolicy::Open),
            "members" => Some(AccessPolicy::Members),
            "private" => Some(AccessPolicy::Private),
            _ => None,
        }
    }
}

/// Principal discoverability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Discoverability {
    Public,
    Project,
    Private,
}

impl Discoverability {
    pub fn as_str(self) -> &'static str {
        match self {
            Discoverability::Public => "public",
            Discoverability::Project => "project",
            Discoverability::Private => "private",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Discoverability::Public),
            "project" => Some(Discoverability::Project),
            "private" => Some(Discoverability::Private),
            _ => None,
        }
    }
}

/// Principal direct-message policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DmPolicy {
    Open,
    Restricted,
    Closed,
}

impl DmPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DmPolicy::Open => "open",
            DmPolicy::Restricted => "restricted",
            DmPolicy::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(DmPolicy::Open),
            "restricted" => Some(DmPolicy::Restricted),
            "closed" => Some(DmPolicy::Closed),
            _ => None,
        }
    }
}

/// How a membership row came to exist.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberSource {
    Manual,
    Frontmatter,
    Default,
    System,
    Invitation,
    /// Self-service join, also used for rows migrated from a legacy
    /// subscriptions table.
    SelfJoin,
}

impl MemberSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberSource::Manual => "manual",
            MemberSource::Frontmatter => "frontmatter",
            MemberSource::Default => "default",
            MemberSource::System => "system",
            MemberSource::Invitation => "invitation",
            MemberSource::SelfJoin => "self",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(MemberSource::Manual),
            "frontmatter" => Some(MemberSource::Frontmatter),
            "default" => Some(MemberSource::Default),
            "system" => Some(MemberSource::System),
            "invitation" => Some(MemberSource::Invitation),
            "self" => Some(MemberSource::SelfJoin),
            _ => None,
        }
    }
}

/// Project link direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Bidirectional,
    AToB,
    BToA,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkType::Bidirectional => "bidirectional",
            LinkType::AToB => "a_to_b",
            LinkType::BToA => "b_to_a",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bidirectional" => Some(LinkType::Bidirectional),
            "a_to_b" => Some(LinkType::AToB),
            "b_to_a" => Some(LinkType::BToA),
            _ => None,
        }
    }
}

/// Flat membership capability bits. Never a role hierarchy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub can_send: bool,
    pub can_invite: bool,
    pub can_leave: bool,
    pub can_manage: bool,
}

impl Capabilities {
    /// Caps granted on a self-service join of an open channel.
    pub const fn joiner() -> Self {
        Self {
            can_send: true,
            can_invite: false,
            can_leave: true,
            can_manage: false,
        }
    }

    /// Caps granted to both members of a direct channel.
    pub const fn direct_member() -> Self {
        Self {
            can_send: true,
            can_invite: false,
            can_leave: false,
            can_manage: false,
        }
    }

    /// Caps granted to the owner of a notes channel.
    pub const fn notes_owner() -> Self {
        Self {
            can_send: true,
            can_invite: false,
            can_leave: false,
            can_manage: false,
        }
    }

    /// Caps granted to the creator of a regular channel.
    pub const fn creator() -> Self {
        Self {
            can_send: true,
            can_invite: true,
            can_leave: true,
            can_manage: true,
        }
    }

    /// No capabilities at all.
    pub const fn none() -> Self {
        Self {
            can_send: false,
            can_invite: false,
            can_leave: false,
            can_manage: false,
        }
    }
}

/// A registered project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub path: String,
    pub name: String,
    pub created_at: f64,
}

/// A registered principal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    /// Surrogate id; the identity key is (name, project_id-or-null).
    pub id: i64,
    pub key: AgentKey,
    pub description: String,
    pub discoverability: Discoverability,
    pub dm_policy: DmPolicy,
    /// Serialized principal refs allowed to DM under a restricted policy.
    pub dm_allow: Vec<String>,
    /// Serialized principal refs always denied.
    pub dm_block: Vec<String>,
    /// When set, default provisioning never touches this principal.
    pub never_default: bool,
    pub created_at: f64,
}

/// A conversation container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: String,
    pub scope: ChannelScope,
    pub kind: ChannelKind,
    pub access: AccessPolicy,
    pub project_id: Option<String>,
    pub name: String,
    pub description: String,
    pub is_default: bool,
    pub archived: bool,
    /// Present only for notes channels.
    pub owner_agent_id: Option<i64>,
    pub created_at: f64,
}

/// A membership row: the only structure conferring channel access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Membership {
    pub channel_id: String,
    pub agent_id: i64,
    pub caps: Capabilities,
    pub source: MemberSource,
    /// Inviter attribution: "self", "system", or a serialized principal ref.
    pub invited_by: String,
    pub from_default: bool,
    pub opted_out: bool,
    pub joined_at: f64,
}

/// A project link row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectLink {
    pub project_a: String,
    pub project_b: String,
    pub link_type: LinkType,
    pub enabled: bool,
}

/// An immutable message row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub channel_id: String,
    pub sender: AgentKey,
    pub content: String,
    /// Unix seconds, UTC.
    pub timestamp: f64,
    pub confidence: Option<f64>,
    pub metadata: Option<Value>,
    pub tags: Vec<String>,
    pub session_context: Option<String>,
    pub thread_id: Option<String>,
}

/// Arguments for inserting a message.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub content: String,
    pub timestamp: Option<f64>,
    pub confidence: Option<f64>,
    pub metadata: Option<Value>,
    pub tags: Vec<String>,
    pub session_context: Option<String>,
    pub thread_id: Option<String>,
}

/// Arguments for registering a principal.
#[derive(Debug, Clone)]
pub struct RegisterAgent {
    pub key: AgentKey,
    pub description: String,
    pub discoverability: Discoverability,
    pub dm_policy: DmPolicy,
    pub dm_allow: Vec<String>,
    pub dm_block: Vec<String>,
    pub never_default: bool,
}

impl RegisterAgent {
    pub fn new(key: AgentKey) -> Self {
        Self {
            key,
            description: String::new(),
            discoverability: Discoverability::Public,
            dm_policy: DmPolicy::Open,
            dm_allow: Vec::new(),
            dm_block: Vec::new(),
            never_default: false,
        }
    }
}
