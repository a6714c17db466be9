//! Membership & access core: decision procedures over the store's two
//! access views, plus default and notes-channel provisioning.
//!
//! This layer owns no storage. Call sites never reimplement the checks;
//! they ask here and act on the answer.

use crate::error::{Error, Result};
use crate::ids::{self, AgentKey};
use crate::store::{
    AccessPolicy, Agent, Capabilities, Channel, ChannelScope, MemberSource, Membership, Store,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Decision procedures for the unified membership model.
pub struct AccessCore {
    store: Arc<Store>,
}

impl AccessCore {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// True iff the channel is open, visible to the principal, and the
    /// principal is not already a member. Members channels require
    /// invitation; private channels are never self-joinable.
    pub async fn may_join(&self, key: &AgentKey, channel_id: &str) -> Result<bool> {
        let agent = self.store.require_agent(key).await?;
        let channel = self.store.require_channel(channel_id).await?;
        if channel.access != AccessPolicy::Open {
            return Ok(false);
        }
        let decision = self.store.channel_access(&agent, &channel).await?;
        Ok(decision.has_access && decision.visible_in_list && !decision.is_member)
    }

    /// True iff the inviter is a current member with can_invite. The
    /// invitee may belong to any project: isolated by default, explicit
    /// sharing allowed.
    pub async fn may_invite(
        &self,
        inviter: &AgentKey,
        channel_id: &str,
        invitee: &AgentKey,
    ) -> Result<bool> {
        self.store.require_agent(invitee).await?;
        let decision = self.store.channel_access_by_key(inviter, channel_id).await?;
        Ok(decision.is_member && decision.can_invite)
    }

    /// True iff the membership row allows leaving. Direct and notes
    /// channels always deny.
    pub async fn may_leave(&self, key: &AgentKey, channel_id: &str) -> Result<bool> {
        let agent = self.store.require_agent(key).await?;
        self.store.require_channel(channel_id).await?;
        Ok(self
            .store
            .membership(channel_id, agent.id)
            .await?
            .map(|membership| membership.caps.can_leave)
            .unwrap_or(false))
    }

    /// True iff an active membership row grants can_send.
    pub async fn may_send(&self, key: &AgentKey, channel_id: &str) -> Result<bool> {
        let decision = self.store.channel_access_by_key(key, channel_id).await?;
        Ok(decision.is_member && decision.can_send)
    }

    /// Symmetric DM check: both directions of the DM-access view must
    /// allow before a direct channel may exist.
    pub async fn may_dm(&self, a: &AgentKey, b: &AgentKey) -> Result<bool> {
        let agent_a = self.store.require_agent(a).await?;
        let agent_b = self.store.require_agent(b).await?;
        let forward = self.store.dm_access(&agent_a, &agent_b).await?;
        let backward = self.store.dm_access(&agent_b, &agent_a).await?;
        Ok(forward.allowed && backward.allowed)
    }

    /// Like [`may_dm`], but surfaces the denial reason for error
    /// messages.
    pub async fn check_dm(&self, a: &AgentKey, b: &AgentKey) -> Result<()> {
        let agent_a = self.store.require_agent(a).await?;
        let agent_b = self.store.require_agent(b).await?;
        for (from, to) in [(&agent_a, &agent_b), (&agent_b, &agent_a)] {
            let decision = self.store.dm_access(from, to).await?;
            if !decision.allowed {
                return Err(Error::not_authorized(decision.reason.unwrap_or_else(|| {
                    format!("direct messages between '{a}' and '{b}' are not permitted")
                })));
            }
        }
        Ok(())
    }

    /// On registration, add the principal to every default channel in
    /// its scope except those excluded by frontmatter, unless the
    /// principal opted never to be defaulted. Existing rows, including
    /// opted-out tombstones, are left untouched.
    pub async fn default_provisioning(
        &self,
        agent: &Agent,
        exclude: &HashSet<String>,
    ) -> Result<Vec<Membership>> {
        if agent.never_default {
            return Ok(Vec::new());
        }

        let defaults = self
            .store
            .default_channels(agent.key.project_id.as_deref())
            .await?;

        let mut provisioned = Vec::new();
        for channel in defaults {
            if exclude.contains(&channel.name) || exclude.contains(&channel.id) {
                continue;
            }
            if self.store.membership(&channel.id, agent.id).await?.is_some() {
                continue;
            }
            let membership = self
                .store
                .add_member(
                    &channel.id,
                    agent.id,
                    Capabilities::joiner(),
                    MemberSource::Default,
                    "system",
                    true,
                )
                .await?;
            provisioned.push(membership);
        }
        Ok(provisioned)
    }

    /// Create the principal's private notes channel if it does not
    /// exist. The sole member is the owner, who can never leave.
    pub async fn provision_notes_channel(&self, agent: &Agent) -> Result<Channel> {
        let channel_id =
            ids::notes_channel_id(agent.key.project_id.as_deref(), &agent.key.name);
        if let Some(existing) = self.store.channel(&channel_id).await? {
            return Ok(existing);
        }

        let scope = if agent.key.project_id.is_some() {
            ChannelScope::Project
        } else {
            ChannelScope::Global
        };
        self.store
            .create_notes_channel(
                &channel_id,
                scope,
                agent.key.project_id.as_deref(),
                agent.id,
                &agent.key.name,
            )
            .await
    }

    /// Soft-leave a default-provisioned channel: the membership row
    /// stays as a tombstone so re-registration does not re-provision.
    pub async fn opt_out(&self, key: &AgentKey, channel_id: &str) -> Result<Membership> {
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
        if !membership.from_default {
            return Err(Error::bad_request(format!(
                "membership of '{key}' in '{channel_id}' was not default-provisioned; leave instead"
            )));
        }
        self.store.set_opted_out(channel_id, agent.id, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{DmPolicy, RegisterAgent};
    use crate::store::NewChannel;

    async fn harness() -> (Arc<Store>, Arc<AccessCore>) {
        let store = Store::open_in_memory().await.expect("store should open");
        let access = AccessCore::new(store.clone());
        (store, access)
    }

    async fn register(store: &Store, name: &str) -> Agent {
        store
            .register_agent(RegisterAgent::new(AgentKey::global(name)))
            .await
            .expect("registration should succeed")
    }

    async fn open_channel(store: &Store, id: &str, is_default: bool) -> Channel {
        store
            .create_channel(NewChannel {
                id: id.into(),
                scope: ChannelScope::Global,
                access: AccessPolicy::Open,
                project_id: None,
                name: id.strip_prefix("global:").unwrap_or(id).into(),
                description: String::new(),
                is_default,
                owner_agent_id: None,
            })
            .await
            .expect("channel should be created")
    }

    #[tokio::test]
    async fn members_channels_require_invitation() {
        let (store, access) = harness().await;
        let alice = register(&store, "alice").await;
        store
            .create_channel(NewChannel {
                id: "global:staff".into(),
                scope: ChannelScope::Global,
                access: AccessPolicy::Members,
                project_id: None,
                name: "staff".into(),
                description: String::new(),
                is_default: false,
                owner_agent_id: None,
            })
            .await
            .unwrap();

        assert!(!access.may_join(&alice.key, "global:staff").await.unwrap());
    }

    #[tokio::test]
    async fn default_provisioning_honors_exclusions_and_tombstones() {
        let (store, access) = harness().await;
        open_channel(&store, "global:general", true).await;
        open_channel(&store, "global:random", true).await;

        let alice = register(&store, "alice").await;
        let exclude: HashSet<String> = ["random".to_string()].into();
        let provisioned = access.default_provisioning(&alice, &exclude).await.unwrap();

        assert_eq!(provisioned.len(), 1);
        assert_eq!(provisioned[0].channel_id, "global:general");
        assert_eq!(provisioned[0].source, MemberSource::Default);
        assert!(provisioned[0].from_default);

        // Opt out, then re-provision: the tombstone blocks re-adding.
        access.opt_out(&alice.key, "global:general").await.unwrap();
        assert!(!access.may_send(&alice.key, "global:general").await.unwrap());

        let again = access
            .default_provisioning(&alice, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(
            again.iter().map(|m| m.channel_id.as_str()).collect::<Vec<_>>(),
            vec!["global:random"],
            "only the never-provisioned channel is added"
        );
    }

    #[tokio::test]
    async fn never_default_skips_provisioning() {
        let (store, access) = harness().await;
        open_channel(&store, "global:general", true).await;
        let bot = store
            .register_agent(RegisterAgent {
                never_default: true,
                ..RegisterAgent::new(AgentKey::global("bot"))
            })
            .await
            .unwrap();

        let provisioned = access
            .default_provisioning(&bot, &HashSet::new())
            .await
            .unwrap();
        assert!(provisioned.is_empty());
    }

    #[tokio::test]
    async fn notes_channels_are_single_member_and_sticky() {
        let (store, access) = harness().await;
        let alice = register(&store, "alice").await;

        let channel = access.provision_notes_channel(&alice).await.unwrap();
        assert_eq!(channel.id, "global:agent-notes:alice");
        assert_eq!(channel.access, AccessPolicy::Private);
        assert_eq!(channel.owner_agent_id, Some(alice.id));

        let members = store.members_of(&channel.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert!(members[0].caps.can_send);
        assert!(!members[0].caps.can_leave);
        assert!(!members[0].caps.can_invite);

        // Idempotent on re-registration.
        let again = access.provision_notes_channel(&alice).await.unwrap();
        assert_eq!(again.id, channel.id);
        assert!(!access.may_leave(&alice.key, &channel.id).await.unwrap());
    }

    #[tokio::test]
    async fn dm_requires_both_directions() {
        let (store, access) = harness().await;
        let a = store
            .register_agent(RegisterAgent {
                dm_policy: DmPolicy::Closed,
                ..RegisterAgent::new(AgentKey::global("a"))
            })
            .await
            .unwrap();
        let b = register(&store, "b").await;

        assert!(!access.may_dm(&b.key, &a.key).await.unwrap());
        assert!(!access.may_dm(&a.key, &b.key).await.unwrap());

        let error = access.check_dm(&a.key, &b.key).await.expect_err("denied");
        assert_eq!(error.kind(), crate::error::ErrorKind::NotAuthorized);
    }

    #[tokio::test]
    async fn cross_project_invitation_is_permitted() {
        let (store, access) = harness().await;
        let p1 = store.register_project("/work/p1", "P1").await.unwrap();
        let p2 = store.register_project("/work/p2", "P2").await.unwrap();

        let alice = store
            .register_agent(RegisterAgent::new(AgentKey::scoped("alice", p1.id.clone())))
            .await
            .unwrap();
        let bob = store
            .register_agent(RegisterAgent::new(AgentKey::scoped("bob", p2.id.clone())))
            .await
            .unwrap();

        let channel_id = crate::ids::project_channel_id(&p1.id, "design");
        store
            .create_channel(NewChannel {
                id: channel_id.clone(),
                scope: ChannelScope::Project,
                access: AccessPolicy::Members,
                project_id: Some(p1.id.clone()),
                name: "design".into(),
                description: String::new(),
                is_default: false,
                owner_agent_id: None,
            })
            .await
            .unwrap();
        store
            .add_member(&channel_id, alice.id, Capabilities::creator(), MemberSource::System, "system", false)
            .await
            .unwrap();

        // P1 and P2 are unlinked; the invitation is still permitted.
        assert!(access
            .may_invite(&alice.key, &channel_id, &bob.key)
            .await
            .unwrap());
    }
}
