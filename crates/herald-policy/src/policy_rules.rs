use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub const POLICY_REASON_ALLOW_USER_GRANT: &str = "allow_user_grant";
pub const POLICY_REASON_ALLOW_GROUP_GRANT: &str = "allow_group_grant";
pub const POLICY_REASON_ALLOW_DEFAULT_EVERYONE: &str = "allow_default_everyone";
pub const POLICY_REASON_DENY_NOT_GRANTED: &str = "deny_not_granted";
pub const POLICY_REASON_DENY_NO_RULE_SET: &str = "deny_no_rule_set";
pub const POLICY_REASON_DENY_POLICY_NOT_LOADED: &str = "deny_policy_not_loaded";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Explicit allow-list for one tenant+command: granted users and groups.
pub struct CommandRuleSet {
    #[serde(default)]
    pub users: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl CommandRuleSet {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }

    pub fn grants(&self, actor: &CommandActor) -> Option<&'static str> {
        if self.users.contains(actor.user_id.as_str()) {
            return Some(POLICY_REASON_ALLOW_USER_GRANT);
        }
        if actor
            .group_ids
            .iter()
            .any(|group| self.groups.contains(group.as_str()))
        {
            return Some(POLICY_REASON_ALLOW_GROUP_GRANT);
        }
        None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// One side of a policy mutation: user ids and group ids to add or remove.
pub struct RuleSetDelta {
    #[serde(default)]
    pub users: BTreeSet<String>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl RuleSetDelta {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Atomic add/remove mutation against one tenant+command rule set.
pub struct PolicyChange {
    #[serde(default)]
    pub add: RuleSetDelta,
    #[serde(default)]
    pub remove: RuleSetDelta,
}

impl PolicyChange {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The user attempting a command, with its group memberships.
pub struct CommandActor {
    pub user_id: String,
    pub group_ids: BTreeSet<String>,
}

impl CommandActor {
    /// Builds an actor whose memberships include the tenant-wide group, which
    /// is how seeded "everyone in this tenant" grants match.
    pub fn for_tenant(user_id: &str, tenant_id: &str, roles: &[String]) -> Self {
        let mut group_ids: BTreeSet<String> = roles.iter().cloned().collect();
        group_ids.insert(tenant_id.to_string());
        Self {
            user_id: user_id.to_string(),
            group_ids,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Default policy for a command with no explicit rule set.
pub enum DefaultAccess {
    Everyone,
    Nobody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `PolicyDecision` values.
pub enum PolicyDecision {
    Allow { reason_code: String },
    Deny { reason_code: String },
}

impl PolicyDecision {
    pub fn allow(reason_code: &str) -> Self {
        Self::Allow {
            reason_code: reason_code.to_string(),
        }
    }

    pub fn deny(reason_code: &str) -> Self {
        Self::Deny {
            reason_code: reason_code.to_string(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    pub fn reason_code(&self) -> &str {
        match self {
            Self::Allow { reason_code } | Self::Deny { reason_code } => reason_code,
        }
    }
}

/// Applies additions then removals; an id named on both sides ends up
/// removed, so "reset to empty" stays expressible in one call.
pub fn apply_policy_change(current: &CommandRuleSet, change: &PolicyChange) -> CommandRuleSet {
    let mut updated = current.clone();
    for user in &change.add.users {
        updated.users.insert(user.clone());
    }
    for group in &change.add.groups {
        updated.groups.insert(group.clone());
    }
    for user in &change.remove.users {
        updated.users.remove(user);
    }
    for group in &change.remove.groups {
        updated.groups.remove(group);
    }
    updated
}
