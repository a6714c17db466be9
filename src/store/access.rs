//! The two access views: channel access and DM access.
//!
//! All permission checks in the crate go through these; call sites never
//! reproduce the decision logic.

use super::types::{AccessPolicy, Agent, Capabilities, Channel, ChannelKind, Discoverability, DmPolicy};
use super::Store;
use crate::error::Result;
use crate::ids::AgentKey;

/// Access-view result for a (principal, channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AccessDecision {
    pub has_access: bool,
    /// True only when an active (not opted-out) membership row exists.
    pub is_member: bool,
    pub can_send: bool,
    pub can_invite: bool,
    pub can_manage: bool,
    pub visible_in_list: bool,
}

impl AccessDecision {
    fn denied() -> Self {
        Self {
            has_access: false,
            is_member: false,
            can_send: false,
            can_invite: false,
            can_manage: false,
            visible_in_list: false,
        }
    }

    fn joinable(archived: bool) -> Self {
        Self {
            has_access: true,
            is_member: false,
            can_send: false,
            can_invite: false,
            can_manage: false,
            visible_in_list: !archived,
        }
    }

    fn member(caps: Capabilities, archived: bool) -> Self {
        Self {
            has_access: true,
            is_member: true,
            can_send: caps.can_send,
            can_invite: caps.can_invite,
            can_manage: caps.can_manage,
            visible_in_list: !archived,
        }
    }
}

/// DM-access result for an ordered (initiator, target) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmDecision {
    pub allowed: bool,
    /// Denial reason naming the offending policy, for error messages.
    pub reason: Option<String>,
}

impl DmDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

impl Store {
    /// Compute the access view for (principal, channel).
    ///
    /// Rules, in order: active membership row; direct channels deny
    /// nonmembers; open global channels are joinable; open project
    /// channels are joinable for global principals, same-project
    /// principals and principals of a linked project; everything else is
    /// denied and invisible.
    pub async fn channel_access(&self, agent: &Agent, channel: &Channel) -> Result<AccessDecision> {
        let membership = self.membership(&channel.id, agent.id).await?;

        if let Some(membership) = &membership
            && !membership.opted_out
        {
            return Ok(AccessDecision::member(membership.caps, channel.archived));
        }

        if channel.kind == ChannelKind::Direct {
            return Ok(AccessDecision::denied());
        }

        if channel.access == AccessPolicy::Open {
            match &channel.project_id {
                None => return Ok(AccessDecision::joinable(channel.archived)),
                Some(channel_project) => {
                    let reachable = match &agent.key.project_id {
                        None => true,
                        Some(agent_project) => {
                            agent_project == channel_project
                                || self.projects_linked(agent_project, channel_project).await?
                        }
                    };
                    if reachable {
                        return Ok(AccessDecision::joinable(channel.archived));
                    }
                }
            }
        }

        Ok(AccessDecision::denied())
    }

    /// Access view keyed by identifiers rather than loaded rows.
    pub async fn channel_access_by_key(
        &self,
        key: &AgentKey,
        channel_id: &str,
    ) -> Result<AccessDecision> {
        let agent = self.require_agent(key).await?;
        let channel = self.require_channel(channel_id).await?;
        self.channel_access(&agent, &channel).await
    }

    /// One direction of the DM-access view: may `initiator` DM `target`?
    ///
    /// The symmetric composition (both directions) lives in the access
    /// core's `may_dm`.
    pub async fn dm_access(&self, initiator: &Agent, target: &Agent) -> Result<DmDecision> {
        let initiator_ref = initiator.key.to_string();
        let target_ref = target.key.to_string();

        if target.dm_block.iter().any(|blocked| blocked == &initiator_ref) {
            return Ok(DmDecision::deny(format!(
                "principal '{target_ref}' blocks '{initiator_ref}'"
            )));
        }
        if initiator.dm_block.iter().any(|blocked| blocked == &target_ref) {
            return Ok(DmDecision::deny(format!(
                "principal '{initiator_ref}' blocks '{target_ref}'"
            )));
        }

        match target.dm_policy {
            DmPolicy::Closed => Ok(DmDecision::deny(format!(
                "principal '{target_ref}' does not accept direct messages"
            ))),
            DmPolicy::Open => {
                if self.discoverable_by(initiator, target).await? {
                    Ok(DmDecision::allow())
                } else {
                    Ok(DmDecision::deny(format!(
                        "principal '{target_ref}' is not discoverable by '{initiator_ref}'"
                    )))
                }
            }
            DmPolicy::Restricted => {
                if target.dm_allow.iter().any(|allowed| allowed == &initiator_ref)
                    || self.share_regular_channel(initiator.id, target.id).await?
                {
                    Ok(DmDecision::allow())
                } else {
                    Ok(DmDecision::deny(format!(
                        "principal '{target_ref}' restricts direct messages to listed or co-member principals"
                    )))
                }
            }
        }
    }

    /// Whether `target` is discoverable by `viewer` under its
    /// discoverability setting.
    pub async fn discoverable_by(&self, viewer: &Agent, target: &Agent) -> Result<bool> {
        match target.discoverability {
            Discoverability::Public => Ok(true),
            Discoverability::Private => Ok(false),
            Discoverability::Project => match (&viewer.key.project_id, &target.key.project_id) {
                // A global target with project discoverability has no
                // narrower scope to hide in.
                (_, None) => Ok(true),
                // Global principals see project-discoverable principals.
                (None, Some(_)) => Ok(true),
                (Some(viewer_project), Some(target_project)) => {
                    if viewer_project == target_project {
                        Ok(true)
                    } else {
                        self.projects_linked(viewer_project, target_project).await
                    }
                }
            },
        }
    }
}
