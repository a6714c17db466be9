//! API facade: the single entry point wiring the store, access core,
//! hybrid retrieval and event bus together.
//!
//! The facade does no business logic of its own beyond argument
//! normalization, permission checks through the access core, and event
//! emission after successful mutations. Emission goes through one
//! chokepoint (`emit`) so no mutating path can forget it. Every public
//! operation runs under the configured deadline and fails with
//! Cancelled when it elapses.

use crate::access::AccessCore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, StreamFrame, Topic, subtype};
use crate::filter::Filter;
use crate::hybrid::{HybridStore, RankingProfile, SearchHit, SearchRequest, TimeInput};
use crate::ids::{self, AgentKey};
use crate::store::{
    AccessPolicy, Agent, Capabilities, Channel, ChannelScope, LinkType, MemberSource,
    MessageRecord, Membership, NewChannel, NewMessage, Project, RegisterAgent, Store,
};
use crate::vector::{LanceIndex, VectorIndex};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;

/// Arguments for creating a regular channel through the facade.
#[derive(Debug, Clone)]
pub struct CreateChannel {
    pub project_id: Option<String>,
    pub name: String,
    pub access: AccessPolicy,
    pub description: String,
    pub is_default: bool,
    /// When present, the creator joins immediately with full caps.
    pub created_by: Option<AgentKey>,
}

/// Arguments for sending a message through the facade.
#[derive(Debug, Clone, Default)]
pub struct SendMessage {
    pub content: String,
    pub timestamp: Option<TimeInput>,
    pub confidence: Option<f64>,
    pub metadata: Option<Value>,
    pub tags: Vec<String>,
    pub session_context: Option<String>,
    pub thread_id: Option<String>,
}

/// A search request against the caller's accessible channels. The
/// filter is a raw operator tree, validated before any store runs.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: Option<String>,
    pub filter: Option<Value>,
    /// Optional narrowing; always intersected with accessible channels.
    pub channels: Vec<String>,
    pub since: Option<TimeInput>,
    pub until: Option<TimeInput>,
    pub profile: RankingProfile,
    pub limit: usize,
    pub semantic: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query: None,
            filter: None,
            channels: Vec::new(),
            since: None,
            until: None,
            profile: RankingProfile::default(),
            limit: 20,
            semantic: true,
        }
    }
}

/// The facade.
pub struct Api {
    store: Arc<Store>,
    hybrid: Arc<HybridStore>,
    access: Arc<AccessCore>,
    bus: Arc<EventBus>,
    auto_register_senders: bool,
    op_timeout: Option<Duration>,
}

impl Api {
    /// Open the substrate from configuration: relational store, optional
    /// vector index (an unreachable vector store degrades to text-only
    /// retrieval with a warning), event bus.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = Store::open(&config.db_path).await?;

        let index: Option<Arc<dyn VectorIndex>> = match &config.vector {
            Some(vector) => match LanceIndex::connect(&vector.uri).await {
                Ok(index) => Some(Arc::new(index)),
                Err(error) => {
                    tracing::warn!(
                        %error,
                        uri = %vector.uri,
                        "vector store unavailable, degrading to text search"
                    );
                    None
                }
            },
            None => None,
        };

        Ok(Self::assemble(store, index, config))
    }

    /// Wire the facade from pre-built components. Tests and embedders
    /// use this with an in-memory store or a custom index.
    pub fn assemble(
        store: Arc<Store>,
        index: Option<Arc<dyn VectorIndex>>,
        config: &Config,
    ) -> Self {
        let hybrid = HybridStore::new(
            store.clone(),
            index,
            config.auto_register_senders,
            config.profiling,
        );
        Self {
            access: AccessCore::new(store.clone()),
            bus: EventBus::new(config.events),
            auto_register_senders: config.auto_register_senders,
            op_timeout: config.op_timeout,
            store,
            hybrid,
        }
    }

    /// The underlying store, for read-only integrations.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The access core, for callers that only need decisions.
    pub fn access(&self) -> &Arc<AccessCore> {
        &self.access
    }

    /// Replace the per-operation deadline for subsequent calls.
    pub fn set_deadline(&mut self, deadline: Option<Duration>) {
        self.op_timeout = deadline;
    }

    /// The single emission chokepoint: every successful mutation
    /// publishes through here, after the relational commit.
    fn emit(&self, topic: Topic, kind: &str, payload: Value) {
        self.bus.publish(topic, kind, payload);
    }

    /// Run an operation under the configured deadline.
    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                Error::Cancelled(format!("operation '{op}' exceeded {}ms", limit.as_millis()))
            })?,
            None => fut.await,
        }
    }

    // ── Projects ─────────────────────────────────────────────────────

    /// Register a project by absolute path. Idempotent.
    /// Emits `system.project.registered` on first registration.
    pub async fn register_project(&self, path: &str, name: &str) -> Result<Project> {
        self.bounded("register_project", async {
            let id = ids::project_id_from_path(path);
            let existing = self.store.project(&id).await?.is_some();
            let project = self.store.register_project(path, name).await?;
            if !existing {
                self.emit(
                    Topic::System,
                    subtype::PROJECT_REGISTERED,
                    json!({ "project": project.id, "path": project.path, "name": project.name }),
                );
            }
            Ok(project)
        })
        .await
    }

    /// Authorize cross-project discovery between two projects.
    /// Emits `system.project.linked`.
    pub async fn link_projects(&self, a: &str, b: &str, link_type: LinkType) -> Result<()> {
        self.bounded("link_projects", async {
            self.store.link_projects(a, b, link_type).await?;
            self.emit(
                Topic::System,
                subtype::PROJECT_LINKED,
                json!({ "project_a": a, "project_b": b, "link_type": link_type.as_str() }),
            );
            Ok(())
        })
        .await
    }

    /// Disable a project link. Emits `system.project.unlinked`.
    pub async fn unlink_projects(&self, a: &str, b: &str) -> Result<()> {
        self.bounded("unlink_projects", async {
            self.store.unlink_projects(a, b).await?;
            self.emit(
                Topic::System,
                subtype::PROJECT_UNLINKED,
                json!({ "project_a": a, "project_b": b }),
            );
            Ok(())
        })
        .await
    }

    // ── Principals ───────────────────────────────────────────────────

    /// Register or update a principal, then provision its default
    /// channels (honoring the frontmatter exclude set) and its notes
    /// channel.
    /// Emits `agents.registered` or `agents.updated`, `members.joined`
    /// per provisioned default, and `channels.created` for a new notes
    /// channel.
    pub async fn register_agent(
        &self,
        input: RegisterAgent,
        exclude: &HashSet<String>,
    ) -> Result<Agent> {
        self.bounded("register_agent", async {
            let existing = self.store.agent(&input.key).await?.is_some();
            let agent = self.store.register_agent(input).await?;

            self.emit(
                Topic::Agents,
                if existing {
                    subtype::AGENTS_UPDATED
                } else {
                    subtype::AGENTS_REGISTERED
                },
                json!({ "principal": agent.key.to_string() }),
            );

            for membership in self.access.default_provisioning(&agent, exclude).await? {
                self.emit_member_joined(&agent.key, &membership);
            }

            let notes_id =
                ids::notes_channel_id(agent.key.project_id.as_deref(), &agent.key.name);
            let notes_existed = self.store.channel(&notes_id).await?.is_some();
            let notes = self.access.provision_notes_channel(&agent).await?;
            if !notes_existed {
                self.emit(
                    Topic::Channels,
                    subtype::CHANNELS_CREATED,
                    json!({
                        "channel": notes.id,
                        "kind": "notes",
                        "owner": agent.key.to_string(),
                    }),
                );
            }

            Ok(agent)
        })
        .await
    }

    /// Delete a principal; memberships cascade, messages keep their
    /// composite sender reference. Emits `agents.deleted`.
    pub async fn unregister_agent(&self, key: &AgentKey) -> Result<()> {
        self.bounded("unregister_agent", async {
            let agent = self.store.delete_agent(key).await?;
            self.emit(
                Topic::Agents,
                subtype::AGENTS_DELETED,
                json!({ "principal": agent.key.to_string() }),
            );
            Ok(())
        })
        .await
    }

    /// Resolve a serialized principal reference (`name` or
    /// `name@proj_<id8>`) to a typed key.
    pub async fn resolve_principal(&self, reference: &str) -> Result<AgentKey> {
        let (name, prefix) = ids::parse_agent_ref(reference)?;
        match prefix {
            None => Ok(AgentKey::global(name)),
            Some(prefix) => {
                let project = self
                    .store
                    .resolve_project_prefix(&prefix)
                    .await?
                    .ok_or_else(|| {
                        Error::not_found(format!("project with prefix 'proj_{prefix}'"))
                    })?;
                Ok(AgentKey::scoped(name, project.id))
            }
        }
    }

    /// Principals discoverable by the caller, ordered by (project-id
    /// nulls first, name).
    pub async fn list_agents(&self, viewer: &AgentKey) -> Result<Vec<Agent>> {
        self.bounded("list_agents", async {
            let viewer = self.store.require_agent(viewer).await?;
            let mut visible = Vec::new();
            for agent in self.store.list_agents().await? {
                if agent.id == viewer.id || self.store.discoverable_by(&viewer, &agent).await? {
                    visible.push(agent);
                }
            }
            Ok(visible)
        })
        .await
    }

    // ── Channels ─────────────────────────────────────────────────────

    /// Create a regular channel; the id follows the canonical grammar.
    /// Emits `channels.created`, plus `members.joined` when a creator is
    /// named.
    pub async fn create_channel(&self, input: CreateChannel) -> Result<Channel> {
        self.bounded("create_channel", async {
            let (id, scope) = match &input.project_id {
                Some(project_id) => (
                    ids::project_channel_id(project_id, &input.name),
                    ChannelScope::Project,
                ),
                None => (ids::global_channel_id(&input.name), ChannelScope::Global),
            };

            let channel = self
                .store
                .create_channel(NewChannel {
                    id,
                    scope,
                    access: input.access,
                    project_id: input.project_id.clone(),
                    name: input.name.clone(),
                    description: input.description.clone(),
                    is_default: input.is_default,
                    owner_agent_id: None,
                })
                .await?;

            self.emit(
                Topic::Channels,
                subtype::CHANNELS_CREATED,
                json!({
                    "channel": channel.id,
                    "scope": channel.scope.as_str(),
                    "access": channel.access.as_str(),
                    "is_default": channel.is_default,
                }),
            );

            if let Some(creator) = &input.created_by {
                let agent = self.store.require_agent(creator).await?;
                let membership = self
                    .store
                    .add_member(
                        &channel.id,
                        agent.id,
                        Capabilities::creator(),
                        MemberSource::System,
                        "system",
                        false,
                    )
                    .await?;
                self.emit_member_joined(creator, &membership);
            }

            Ok(channel)
        })
        .await
    }

    /// Update a channel's display name or description.
    /// Emits `channels.updated`.
    pub async fn update_channel(
        &self,
        channel_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Channel> {
        self.bounded("update_channel", async {
            let channel = self
                .store
                .update_channel(channel_id, name, description)
                .await?;
            self.emit(
                Topic::Channels,
                subtype::CHANNELS_UPDATED,
                json!({ "channel": channel.id }),
            );
            Ok(channel)
        })
        .await
    }

    /// Soft-archive a channel. Emits `channels.archived`.
    pub async fn archive_channel(&self, channel_id: &str) -> Result<Channel> {
        self.bounded("archive_channel", async {
            let channel = self.store.archive_channel(channel_id).await?;
            self.emit(
                Topic::Channels,
                subtype::CHANNELS_ARCHIVED,
                json!({ "channel": channel.id }),
            );
            Ok(channel)
        })
        .await
    }

    /// Channels the caller sees in listings (visible-in-list from the
    /// access view).
    pub async fn list_channels(&self, viewer: &AgentKey) -> Result<Vec<Channel>> {
        self.bounded("list_channels", async {
            let agent = self.store.require_agent(viewer).await?;
            let mut visible = Vec::new();
            for channel in self.store.all_channels().await? {
                let decision = self.store.channel_access(&agent, &channel).await?;
                if decision.visible_in_list {
                    visible.push(channel);
                }
            }
            Ok(visible)
        })
        .await
    }

    // ── Membership ───────────────────────────────────────────────────

    /// Self-join an open channel. Opted-out default members rejoin by
    /// clearing their tombstone. Emits `members.joined`.
    pub async fn join_channel(&self, key: &AgentKey, channel_id: &str) -> Result<Membership> {
        self.bounded("join_channel", async {
            let agent = self.store.require_agent(key).await?;
            if let Some(existing) = self.store.membership(channel_id, agent.id).await? {
                if !existing.opted_out {
                    return Err(Error::conflict(format!(
                        "principal '{key}' is already a member of channel '{channel_id}'"
                    )));
                }
                let channel = self.store.require_channel(channel_id).await?;
                if channel.access != AccessPolicy::Open {
                    return Err(Error::not_authorized(format!(
                        "principal '{key}' may not rejoin channel '{channel_id}'"
                    )));
                }
                let membership = self.store.set_opted_out(channel_id, agent.id, false).await?;
                self.emit_member_joined(key, &membership);
                return Ok(membership);
            }

            if !self.access.may_join(key, channel_id).await? {
                return Err(Error::not_authorized(format!(
                    "principal '{key}' may not join channel '{channel_id}'"
                )));
            }

            let membership = self
                .store
                .add_member(
                    channel_id,
                    agent.id,
                    Capabilities::joiner(),
                    MemberSource::SelfJoin,
                    "self",
                    false,
                )
                .await?;
            self.emit_member_joined(key, &membership);
            Ok(membership)
        })
        .await
    }

    /// Invite another principal, possibly cross-project.
    /// Emits `members.joined`.
    pub async fn invite(
        &self,
        inviter: &AgentKey,
        channel_id: &str,
        invitee: &AgentKey,
    ) -> Result<Membership> {
        self.bounded("invite", async {
            if !self.access.may_invite(inviter, channel_id, invitee).await? {
                return Err(Error::not_authorized(format!(
                    "principal '{inviter}' may not invite into channel '{channel_id}'"
                )));
            }
            let invitee_agent = self.store.require_agent(invitee).await?;
            let membership = self
                .store
                .add_member(
                    channel_id,
                    invitee_agent.id,
                    Capabilities::joiner(),
                    MemberSource::Invitation,
                    &inviter.to_string(),
                    false,
                )
                .await?;
            self.emit_member_joined(invitee, &membership);
            Ok(membership)
        })
        .await
    }

    /// Leave a channel. Direct and notes channels always deny; other
    /// denials discriminate between not-a-member and no-leave-cap.
    /// Emits `members.left`.
    pub async fn leave_channel(&self, key: &AgentKey, channel_id: &str) -> Result<()> {
        self.bounded("leave_channel", async {
            let agent = self.store.require_agent(key).await?;
            let membership = self
                .store
                .membership(channel_id, agent.id)
                .await?
                .ok_or_else(|| {
                    Error::not_authorized(format!(
                        "principal '{key}' is not a member of channel '{channel_id}'"
                    ))
                })?;
            if !membership.caps.can_leave {
                return Err(Error::invariant(format!(
                    "membership of '{key}' in channel '{channel_id}' cannot be left"
                )));
            }

            self.store.remove_member(channel_id, agent.id).await?;
            self.emit(
                Topic::Members,
                subtype::MEMBERS_LEFT,
                json!({ "channel": channel_id, "principal": key.to_string() }),
            );
            Ok(())
        })
        .await
    }

    /// Soft-leave a default-provisioned channel, keeping the tombstone.
    /// Emits `members.updated`.
    pub async fn opt_out(&self, key: &AgentKey, channel_id: &str) -> Result<Membership> {
        self.bounded("opt_out", async {
            let membership = self.access.opt_out(key, channel_id).await?;
            self.emit(
                Topic::Members,
                subtype::MEMBERS_UPDATED,
                json!({
                    "channel": channel_id,
                    "principal": key.to_string(),
                    "opted_out": true,
                }),
            );
            Ok(membership)
        })
        .await
    }

    // ── Direct channels ──────────────────────────────────────────────

    /// Create the direct channel between two principals after the
    /// symmetric DM check. Emits `channels.created` and two
    /// `members.joined`.
    pub async fn create_direct_channel(&self, a: &AgentKey, b: &AgentKey) -> Result<Channel> {
        self.bounded("create_direct_channel", async {
            self.access.check_dm(a, b).await?;
            let agent_a = self.store.require_agent(a).await?;
            let agent_b = self.store.require_agent(b).await?;

            let channel_id = ids::direct_channel_id(a, b);
            let channel = self
                .store
                .create_direct_channel(&channel_id, agent_a.id, agent_b.id)
                .await?;

            self.emit(
                Topic::Channels,
                subtype::CHANNELS_CREATED,
                json!({ "channel": channel.id, "kind": "direct" }),
            );
            for membership in self.store.members_of(&channel.id).await? {
                let key = if membership.agent_id == agent_a.id { a } else { b };
                self.emit_member_joined(key, &membership);
            }
            Ok(channel)
        })
        .await
    }

    // ── Messages ─────────────────────────────────────────────────────

    /// Send a message. The sender must hold can_send through the access
    /// view; unknown senders are auto-registered only when configured.
    /// Emits `messages.created`, plus `notes.created` (and
    /// `notes.tagged` when tagged) into notes channels.
    pub async fn send_message(
        &self,
        sender: &AgentKey,
        channel_id: &str,
        message: SendMessage,
    ) -> Result<MessageRecord> {
        self.bounded("send_message", async {
            if self.store.agent(sender).await?.is_none() && self.auto_register_senders {
                let agent = self
                    .store
                    .register_agent(RegisterAgent::new(sender.clone()))
                    .await?;
                self.emit(
                    Topic::Agents,
                    subtype::AGENTS_REGISTERED,
                    json!({ "principal": agent.key.to_string() }),
                );
            }

            if !self.access.may_send(sender, channel_id).await? {
                return Err(Error::not_authorized(format!(
                    "principal '{sender}' is not a member of channel '{channel_id}'"
                )));
            }

            let timestamp = message
                .timestamp
                .as_ref()
                .map(TimeInput::to_unix)
                .transpose()?;
            let record = self
                .hybrid
                .insert(
                    channel_id,
                    sender,
                    NewMessage {
                        content: message.content,
                        timestamp,
                        confidence: message.confidence,
                        metadata: message.metadata,
                        tags: message.tags,
                        session_context: message.session_context,
                        thread_id: message.thread_id,
                    },
                )
                .await?;

            self.emit(
                Topic::Messages,
                subtype::MESSAGES_CREATED,
                json!({
                    "channel": record.channel_id,
                    "id": record.id,
                    "sender": record.sender.to_string(),
                    "content": record.content,
                }),
            );
            if ids::is_notes_channel_id(&record.channel_id) {
                self.emit(
                    Topic::Notes,
                    subtype::NOTES_CREATED,
                    json!({ "id": record.id, "owner": record.sender.to_string() }),
                );
                if !record.tags.is_empty() {
                    self.emit(
                        Topic::Notes,
                        subtype::NOTES_TAGGED,
                        json!({ "id": record.id, "tags": record.tags }),
                    );
                }
            }
            Ok(record)
        })
        .await
    }

    /// Append to the caller's durable notes channel, provisioning it if
    /// missing. Emits the `send_message` events.
    pub async fn write_note(
        &self,
        author: &AgentKey,
        content: &str,
        tags: Vec<String>,
        metadata: Option<Value>,
    ) -> Result<MessageRecord> {
        let agent = self.store.require_agent(author).await?;
        let notes = self.access.provision_notes_channel(&agent).await?;
        self.send_message(
            author,
            &notes.id,
            SendMessage {
                content: content.to_string(),
                tags,
                metadata,
                ..Default::default()
            },
        )
        .await
    }

    /// Rewrite the tags on one of the caller's notes. Content stays
    /// immutable. Emits `notes.updated` and `notes.tagged`.
    pub async fn tag_note(
        &self,
        author: &AgentKey,
        note_id: i64,
        tags: Vec<String>,
    ) -> Result<MessageRecord> {
        self.bounded("tag_note", async {
            let agent = self.store.require_agent(author).await?;
            let record = self
                .store
                .message(note_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("note #{note_id}")))?;
            let channel = self.store.require_channel(&record.channel_id).await?;
            if channel.owner_agent_id != Some(agent.id) {
                return Err(Error::not_authorized(format!(
                    "message #{note_id} is not a note owned by '{author}'"
                )));
            }

            let updated = self.store.update_tags(note_id, &tags).await?;
            self.emit(
                Topic::Notes,
                subtype::NOTES_UPDATED,
                json!({ "id": updated.id, "owner": author.to_string() }),
            );
            self.emit(
                Topic::Notes,
                subtype::NOTES_TAGGED,
                json!({ "id": updated.id, "tags": updated.tags }),
            );
            Ok(updated)
        })
        .await
    }

    /// A channel's messages in (timestamp, id) order. The access view
    /// gates the read.
    pub async fn get_messages(
        &self,
        viewer: &AgentKey,
        channel_id: &str,
        since: Option<TimeInput>,
        until: Option<TimeInput>,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        self.bounded("get_messages", async {
            let decision = self.store.channel_access_by_key(viewer, channel_id).await?;
            if !decision.has_access {
                return Err(Error::not_authorized(format!(
                    "principal '{viewer}' has no access to channel '{channel_id}'"
                )));
            }
            let since = since.as_ref().map(TimeInput::to_unix).transpose()?;
            let until = until.as_ref().map(TimeInput::to_unix).transpose()?;
            self.store
                .channel_messages(channel_id, since, until, limit)
                .await
        })
        .await
    }

    /// Ranked search over every channel the caller can access. The
    /// access view is an implicit filter: callers never see channels
    /// they cannot access.
    pub async fn search_messages(
        &self,
        viewer: &AgentKey,
        query: SearchQuery,
    ) -> Result<Vec<SearchHit>> {
        self.bounded("search_messages", async {
            let accessible = self.accessible_channels(viewer).await?;
            let channel_ids: Vec<String> = if query.channels.is_empty() {
                accessible
            } else {
                let allowed: HashSet<&String> = accessible.iter().collect();
                query
                    .channels
                    .iter()
                    .filter(|channel| allowed.contains(channel))
                    .cloned()
                    .collect()
            };

            let filter = query.filter.as_ref().map(Filter::parse).transpose()?;
            self.hybrid
                .search(SearchRequest {
                    query: query.query,
                    filter,
                    channel_ids,
                    since: query.since,
                    until: query.until,
                    profile: query.profile,
                    limit: query.limit,
                    semantic: query.semantic,
                })
                .await
        })
        .await
    }

    /// Ranked search restricted to the caller's own notes channel.
    pub async fn search_notes(
        &self,
        author: &AgentKey,
        query: SearchQuery,
    ) -> Result<Vec<SearchHit>> {
        self.bounded("search_notes", async {
            let agent = self.store.require_agent(author).await?;
            let notes_id =
                ids::notes_channel_id(agent.key.project_id.as_deref(), &agent.key.name);
            if self.store.channel(&notes_id).await?.is_none() {
                return Ok(Vec::new());
            }

            let filter = query.filter.as_ref().map(Filter::parse).transpose()?;
            self.hybrid
                .search(SearchRequest {
                    query: query.query,
                    filter,
                    channel_ids: vec![notes_id],
                    since: query.since,
                    until: query.until,
                    profile: query.profile,
                    limit: query.limit,
                    semantic: query.semantic,
                })
                .await
        })
        .await
    }

    /// Re-embed recent messages missing from the vector index.
    pub async fn reconcile_vector_index(&self, scan_limit: i64) -> Result<usize> {
        self.hybrid.reindex_missing(scan_limit).await
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Attach an event subscriber; see [`EventBus::subscribe`].
    pub fn subscribe(
        &self,
        client_id: &str,
        last_seen: u64,
        topics: Option<Vec<Topic>>,
    ) -> impl Stream<Item = StreamFrame> + Send + use<> {
        self.bus.subscribe(client_id, last_seen, topics)
    }

    /// Record an externally-observed system happening (session starts,
    /// tool calls) on the bus. Emits `system.<kind>`.
    pub fn publish_system_event(&self, kind: &str, payload: Value) -> u64 {
        self.bus.publish(Topic::System, kind, payload).id
    }

    /// Id of the most recent event, for subscriber bootstrapping.
    pub fn event_tail(&self) -> u64 {
        self.bus.tail()
    }

    fn emit_member_joined(&self, key: &AgentKey, membership: &Membership) {
        self.emit(
            Topic::Members,
            subtype::MEMBERS_JOINED,
            json!({
                "channel": membership.channel_id,
                "principal": key.to_string(),
                "source": membership.source.as_str(),
                "invited_by": membership.invited_by,
            }),
        );
    }

    /// Every channel the access view grants the caller access to.
    async fn accessible_channels(&self, viewer: &AgentKey) -> Result<Vec<String>> {
        let agent = self.store.require_agent(viewer).await?;
        let mut accessible = Vec::new();
        for channel in self.store.all_channels().await? {
            let decision = self.store.channel_access(&agent, &channel).await?;
            if decision.has_access {
                accessible.push(channel.id);
            }
        }
        Ok(accessible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::DmPolicy;
    use futures::StreamExt as _;
    use serde_json::json;

    async fn harness() -> Api {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let store = Store::open_in_memory().await.expect("store should open");
        Api::assemble(store, None, &Config::default())
    }

    async fn register(api: &Api, key: AgentKey) -> Agent {
        api.register_agent(RegisterAgent::new(key), &HashSet::new())
            .await
            .expect("registration should succeed")
    }

    /// Open channel join and send: joiner caps, nonmember denial, and
    /// the members.joined / messages.created event order.
    #[tokio::test]
    async fn open_channel_join_and_send() {
        let api = harness().await;
        let p1 = api.register_project("/work/p1", "P1").await.unwrap();
        let alice = AgentKey::scoped("alice", p1.id.clone());
        let bob = AgentKey::scoped("bob", p1.id.clone());
        register(&api, alice.clone()).await;
        register(&api, bob.clone()).await;

        let channel = api
            .create_channel(CreateChannel {
                project_id: Some(p1.id.clone()),
                name: "dev".into(),
                access: AccessPolicy::Open,
                description: String::new(),
                is_default: false,
                created_by: None,
            })
            .await
            .unwrap();
        assert!(channel.id.starts_with("proj_"));
        assert!(channel.id.ends_with(":dev"));

        assert!(api.access().may_join(&alice, &channel.id).await.unwrap());
        let tail_before = api.event_tail();

        let membership = api.join_channel(&alice, &channel.id).await.unwrap();
        assert!(membership.caps.can_send);
        assert!(membership.caps.can_leave);
        assert!(!membership.caps.can_invite);
        assert!(!membership.caps.can_manage);

        api.send_message(
            &alice,
            &channel.id,
            SendMessage {
                content: "hello".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let error = api
            .send_message(
                &bob,
                &channel.id,
                SendMessage {
                    content: "hi".into(),
                    ..Default::default()
                },
            )
            .await
            .expect_err("nonmember send must fail");
        assert_eq!(error.kind(), ErrorKind::NotAuthorized);

        // Replay from before the join: members.joined precedes
        // messages.created.
        let mut stream = Box::pin(api.subscribe("s1", tail_before, None));
        let first = stream.next().await.expect("joined event");
        let second = stream.next().await.expect("created event");
        match (first, second) {
            (StreamFrame::Event(joined), StreamFrame::Event(created)) => {
                assert_eq!(joined.kind, subtype::MEMBERS_JOINED);
                assert!(joined.payload["principal"].as_str().unwrap().contains("alice"));
                assert_eq!(created.kind, subtype::MESSAGES_CREATED);
                assert_eq!(created.payload["content"], "hello");
                assert!(joined.id < created.id);
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    /// Direct message denial by policy: closed denies both directions.
    #[tokio::test]
    async fn dm_denied_by_closed_policy() {
        let api = harness().await;
        let a = AgentKey::global("a");
        let b = AgentKey::global("b");
        api.register_agent(
            RegisterAgent {
                dm_policy: DmPolicy::Closed,
                ..RegisterAgent::new(a.clone())
            },
            &HashSet::new(),
        )
        .await
        .unwrap();
        register(&api, b.clone()).await;

        assert!(!api.access().may_dm(&b, &a).await.unwrap());
        assert!(!api.access().may_dm(&a, &b).await.unwrap());

        let error = api
            .create_direct_channel(&a, &b)
            .await
            .expect_err("dm creation must fail");
        assert_eq!(error.kind(), ErrorKind::NotAuthorized);
    }

    /// Direct channels: canonical id, two fixed members, working sends.
    #[tokio::test]
    async fn direct_channel_round_trip() {
        let api = harness().await;
        let a = AgentKey::global("a");
        let b = AgentKey::global("b");
        register(&api, a.clone()).await;
        register(&api, b.clone()).await;

        let channel = api.create_direct_channel(&a, &b).await.unwrap();
        assert_eq!(channel.id, "dm:a:b");

        api.send_message(
            &a,
            &channel.id,
            SendMessage {
                content: "psst".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let seen_by_b = api
            .get_messages(&b, &channel.id, None, None, 10)
            .await
            .unwrap();
        assert_eq!(seen_by_b.len(), 1);

        let error = api
            .leave_channel(&a, &channel.id)
            .await
            .expect_err("direct channels deny leaving");
        assert_eq!(error.kind(), ErrorKind::Invariant);

        // A third principal cannot even see the channel.
        let c = AgentKey::global("c");
        register(&api, c.clone()).await;
        let error = api
            .get_messages(&c, &channel.id, None, None, 10)
            .await
            .expect_err("direct channels deny nonmembers");
        assert_eq!(error.kind(), ErrorKind::NotAuthorized);
    }

    /// Default provisioning with frontmatter opt-out, then soft-leave.
    #[tokio::test]
    async fn default_provisioning_with_opt_out() {
        let api = harness().await;
        for name in ["general", "random"] {
            api.create_channel(CreateChannel {
                project_id: None,
                name: name.into(),
                access: AccessPolicy::Open,
                description: String::new(),
                is_default: true,
                created_by: None,
            })
            .await
            .unwrap();
        }

        let alice = AgentKey::global("alice");
        let exclude: HashSet<String> = ["random".to_string()].into();
        api.register_agent(RegisterAgent::new(alice.clone()), &exclude)
            .await
            .unwrap();

        let agent = api.store().require_agent(&alice).await.unwrap();
        let memberships: Vec<Membership> = api
            .store()
            .memberships_of(agent.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.from_default)
            .collect();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships[0].channel_id, "global:general");
        assert_eq!(memberships[0].source, MemberSource::Default);

        api.opt_out(&alice, "global:general").await.unwrap();
        assert!(!api.access().may_send(&alice, "global:general").await.unwrap());

        // Re-registration must not re-add the opted-out default.
        api.register_agent(RegisterAgent::new(alice.clone()), &HashSet::new())
            .await
            .unwrap();
        let membership = api
            .store()
            .membership("global:general", agent.id)
            .await
            .unwrap()
            .expect("tombstone row survives");
        assert!(membership.opted_out);
    }

    /// Cross-project invitation with unlinked projects.
    #[tokio::test]
    async fn cross_project_invitation() {
        let api = harness().await;
        let p1 = api.register_project("/work/p1", "P1").await.unwrap();
        let p2 = api.register_project("/work/p2", "P2").await.unwrap();
        let alice = AgentKey::scoped("alice", p1.id.clone());
        let bob = AgentKey::scoped("bob", p2.id.clone());
        register(&api, alice.clone()).await;
        register(&api, bob.clone()).await;

        let channel = api
            .create_channel(CreateChannel {
                project_id: Some(p1.id.clone()),
                name: "design".into(),
                access: AccessPolicy::Members,
                description: String::new(),
                is_default: false,
                created_by: Some(alice.clone()),
            })
            .await
            .unwrap();

        api.invite(&alice, &channel.id, &bob).await.unwrap();
        assert!(api.access().may_send(&bob, &channel.id).await.unwrap());

        // Without can_invite, bob cannot invite further principals.
        let carol = AgentKey::global("carol");
        register(&api, carol.clone()).await;
        let error = api
            .invite(&bob, &channel.id, &carol)
            .await
            .expect_err("invitee lacks can_invite");
        assert_eq!(error.kind(), ErrorKind::NotAuthorized);
    }

    /// Search respects the access view: private channels never leak.
    #[tokio::test]
    async fn search_is_access_filtered() {
        let api = harness().await;
        let alice = AgentKey::global("alice");
        let bob = AgentKey::global("bob");
        register(&api, alice.clone()).await;
        register(&api, bob.clone()).await;

        api.write_note(&alice, "private jwt rollout plan", vec![], None)
            .await
            .unwrap();

        let channel = api
            .create_channel(CreateChannel {
                project_id: None,
                name: "dev".into(),
                access: AccessPolicy::Open,
                description: String::new(),
                is_default: false,
                created_by: Some(alice.clone()),
            })
            .await
            .unwrap();
        api.send_message(
            &alice,
            &channel.id,
            SendMessage {
                content: "public jwt discussion".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let hits = api
            .search_messages(
                &bob,
                SearchQuery {
                    query: Some("jwt".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message.channel_id, channel.id);

        let own = api
            .search_notes(
                &alice,
                SearchQuery {
                    query: Some("jwt".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(own.len(), 1);
        assert!(own[0].message.channel_id.contains("agent-notes"));
    }

    /// Malformed filters are rejected before any store runs.
    #[tokio::test]
    async fn search_validates_filters_pre_flight() {
        let api = harness().await;
        let alice = AgentKey::global("alice");
        register(&api, alice.clone()).await;

        let error = api
            .search_messages(
                &alice,
                SearchQuery {
                    filter: Some(json!({"x": {"$frobnicate": 1}})),
                    ..Default::default()
                },
            )
            .await
            .expect_err("unknown operator must fail");
        assert_eq!(error.kind(), ErrorKind::BadRequest);
    }

    /// Notes tagging: ownership enforced, content immutable.
    #[tokio::test]
    async fn note_tagging_is_owner_only() {
        let api = harness().await;
        let alice = AgentKey::global("alice");
        let bob = AgentKey::global("bob");
        register(&api, alice.clone()).await;
        register(&api, bob.clone()).await;

        let note = api
            .write_note(&alice, "decision: ship it", vec!["decision".into()], None)
            .await
            .unwrap();

        let error = api
            .tag_note(&bob, note.id, vec!["stolen".into()])
            .await
            .expect_err("only the owner tags a note");
        assert_eq!(error.kind(), ErrorKind::NotAuthorized);

        let updated = api
            .tag_note(&alice, note.id, vec!["decision".into(), "shipped".into()])
            .await
            .unwrap();
        assert_eq!(updated.tags, vec!["decision", "shipped"]);
        assert_eq!(updated.content, note.content);
    }

    /// A deadline of zero cancels store-touching operations.
    #[tokio::test]
    async fn deadlines_cancel_operations() {
        let mut api = harness().await;
        let alice = AgentKey::global("alice");
        register(&api, alice.clone()).await;

        api.set_deadline(Some(Duration::ZERO));
        let error = api
            .list_channels(&alice)
            .await
            .expect_err("zero deadline must cancel");
        assert_eq!(error.kind(), ErrorKind::Cancelled);
    }

    /// Writers observe their own writes within a session.
    #[tokio::test]
    async fn read_your_own_writes() {
        let api = harness().await;
        let alice = AgentKey::global("alice");
        register(&api, alice.clone()).await;
        let channel = api
            .create_channel(CreateChannel {
                project_id: None,
                name: "dev".into(),
                access: AccessPolicy::Open,
                description: String::new(),
                is_default: false,
                created_by: Some(alice.clone()),
            })
            .await
            .unwrap();

        let sent = api
            .send_message(
                &alice,
                &channel.id,
                SendMessage {
                    content: "now".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let read = api
            .get_messages(&alice, &channel.id, None, None, 10)
            .await
            .unwrap();
        assert_eq!(read.last().map(|record| record.id), Some(sent.id));
    }

    /// Timestamps in any accepted shape land as the same instant.
    #[tokio::test]
    async fn send_accepts_every_time_shape() {
        let api = harness().await;
        let alice = AgentKey::global("alice");
        register(&api, alice.clone()).await;
        let channel = api
            .create_channel(CreateChannel {
                project_id: None,
                name: "dev".into(),
                access: AccessPolicy::Open,
                description: String::new(),
                is_default: false,
                created_by: Some(alice.clone()),
            })
            .await
            .unwrap();

        let instant = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        for timestamp in [
            TimeInput::Unix(1_700_000_000.0),
            TimeInput::Iso(instant.to_rfc3339()),
            TimeInput::DateTime(instant),
        ] {
            let record = api
                .send_message(
                    &alice,
                    &channel.id,
                    SendMessage {
                        content: "same instant".into(),
                        timestamp: Some(timestamp),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(record.timestamp, 1_700_000_000.0);
        }
    }
}
