use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;

use crate::policy_rules::{
    apply_policy_change, CommandActor, CommandRuleSet, DefaultAccess, PolicyChange,
    PolicyDecision, POLICY_REASON_ALLOW_DEFAULT_EVERYONE, POLICY_REASON_DENY_NOT_GRANTED,
    POLICY_REASON_DENY_NO_RULE_SET, POLICY_REASON_DENY_POLICY_NOT_LOADED,
};
use crate::policy_store::PolicyStore;

type PolicyIndex = BTreeMap<String, BTreeMap<String, CommandRuleSet>>;

/// Authorization engine: fail-closed until `load_permissions` succeeds,
/// write-through on every mutation, per-key mutation serialization.
pub struct ExecutionPolicy {
    store: Arc<dyn PolicyStore>,
    index: RwLock<Option<PolicyIndex>>,
    key_locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl ExecutionPolicy {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            index: RwLock::new(None),
            key_locks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bulk-loads every persisted rule set. Until this succeeds, all
    /// `evaluate` calls deny; callers must treat a load failure as fatal.
    pub fn load_permissions(&self) -> Result<usize> {
        let loaded = self
            .store
            .load_all()
            .context("failed to load policy store")?;
        let tenant_count = loaded.len();
        let mut index = self
            .index
            .write()
            .map_err(|_| anyhow::anyhow!("policy index lock poisoned"))?;
        *index = Some(loaded);
        tracing::info!(tenant_count, "policy store loaded");
        Ok(tenant_count)
    }

    pub fn is_loaded(&self) -> bool {
        self.index
            .read()
            .map(|index| index.is_some())
            .unwrap_or(false)
    }

    pub fn evaluate(
        &self,
        tenant_id: &str,
        command_name: &str,
        actor: &CommandActor,
        default_access: DefaultAccess,
    ) -> PolicyDecision {
        let index = match self.index.read() {
            Ok(index) => index,
            Err(_) => return PolicyDecision::deny(POLICY_REASON_DENY_POLICY_NOT_LOADED),
        };
        let Some(index) = index.as_ref() else {
            return PolicyDecision::deny(POLICY_REASON_DENY_POLICY_NOT_LOADED);
        };

        match index.get(tenant_id).and_then(|rules| rules.get(command_name)) {
            Some(rule_set) => match rule_set.grants(actor) {
                Some(reason_code) => PolicyDecision::allow(reason_code),
                None => PolicyDecision::deny(POLICY_REASON_DENY_NOT_GRANTED),
            },
            None => match default_access {
                DefaultAccess::Everyone => {
                    PolicyDecision::allow(POLICY_REASON_ALLOW_DEFAULT_EVERYONE)
                }
                DefaultAccess::Nobody => PolicyDecision::deny(POLICY_REASON_DENY_NO_RULE_SET),
            },
        }
    }

    pub fn check(
        &self,
        tenant_id: &str,
        command_name: &str,
        actor: &CommandActor,
        default_access: DefaultAccess,
    ) -> bool {
        self.evaluate(tenant_id, command_name, actor, default_access)
            .is_allowed()
    }

    /// Returns the explicit rule set for one tenant+command, if any.
    pub fn rule_set_snapshot(&self, tenant_id: &str, command_name: &str) -> Option<CommandRuleSet> {
        self.index
            .read()
            .ok()?
            .as_ref()?
            .get(tenant_id)?
            .get(command_name)
            .cloned()
    }

    pub fn has_rule_set(&self, tenant_id: &str, command_name: &str) -> bool {
        self.rule_set_snapshot(tenant_id, command_name).is_some()
    }

    /// Applies one add/remove mutation to a tenant+command rule set,
    /// persisting before the in-memory index is touched. Mutations on the
    /// same key are serialized; distinct keys proceed independently.
    pub async fn change(
        &self,
        tenant_id: &str,
        command_name: &str,
        change: &PolicyChange,
    ) -> Result<CommandRuleSet> {
        if tenant_id.trim().is_empty() {
            bail!("policy change requires a tenant id");
        }
        if command_name.trim().is_empty() {
            bail!("policy change requires a command name");
        }

        let key_lock = self.key_lock(tenant_id, command_name).await;
        let _guard = key_lock.lock().await;

        let existing = {
            let index = self
                .index
                .read()
                .map_err(|_| anyhow::anyhow!("policy index lock poisoned"))?;
            let Some(index) = index.as_ref() else {
                bail!("policy store is not loaded; refusing to mutate rule sets");
            };
            index
                .get(tenant_id)
                .and_then(|rules| rules.get(command_name))
                .cloned()
        };

        let current = existing.clone().unwrap_or_default();
        let updated = apply_policy_change(&current, change);
        if existing.is_some() && updated == current {
            return Ok(updated);
        }
        if existing.is_none() && updated.is_empty() {
            // Removal-only change against an absent rule set: nothing to
            // create, nothing to persist.
            return Ok(updated);
        }

        self.store
            .save_rule_set(tenant_id, command_name, &updated)
            .with_context(|| {
                format!("failed to persist rule set for tenant '{tenant_id}' command '{command_name}'")
            })?;

        let mut index = self
            .index
            .write()
            .map_err(|_| anyhow::anyhow!("policy index lock poisoned"))?;
        if let Some(index) = index.as_mut() {
            index
                .entry(tenant_id.to_string())
                .or_default()
                .insert(command_name.to_string(), updated.clone());
        }
        tracing::debug!(tenant_id, command_name, "policy rule set updated");
        Ok(updated)
    }

    /// Seeds rule sets for a newly joined tenant: each listed command with no
    /// existing rule set is granted to the tenant-wide group. Existing rule
    /// sets are never clobbered.
    pub async fn seed_tenant(&self, tenant_id: &str, command_names: &[String]) -> Result<usize> {
        if tenant_id.trim().is_empty() {
            bail!("tenant seeding requires a tenant id");
        }
        let mut seeded = 0_usize;
        for command_name in command_names {
            if self.has_rule_set(tenant_id, command_name) {
                continue;
            }
            let change = PolicyChange {
                add: crate::policy_rules::RuleSetDelta {
                    users: Default::default(),
                    groups: [tenant_id.to_string()].into_iter().collect(),
                },
                remove: Default::default(),
            };
            self.change(tenant_id, command_name, &change).await?;
            seeded = seeded.saturating_add(1);
        }
        tracing::debug!(tenant_id, seeded, "tenant rule sets seeded");
        Ok(seeded)
    }

    /// Purges every rule set for a tenant, durable store first. The caller
    /// must await completion before treating the tenant as gone.
    pub async fn remove_tenant(&self, tenant_id: &str) -> Result<()> {
        if tenant_id.trim().is_empty() {
            bail!("tenant removal requires a tenant id");
        }
        // Block new key locks for the duration of the purge so a concurrent
        // mutation cannot resurrect a partially deleted tenant.
        let mut key_locks = self.key_locks.lock().await;
        self.store
            .delete_tenant(tenant_id)
            .with_context(|| format!("failed to delete policies for tenant '{tenant_id}'"))?;
        let mut index = self
            .index
            .write()
            .map_err(|_| anyhow::anyhow!("policy index lock poisoned"))?;
        if let Some(index) = index.as_mut() {
            index.remove(tenant_id);
        }
        let prefix = format!("{tenant_id}\u{1f}");
        key_locks.retain(|key, _| !key.starts_with(&prefix));
        tracing::debug!(tenant_id, "tenant policies purged");
        Ok(())
    }

    async fn key_lock(&self, tenant_id: &str, command_name: &str) -> Arc<Mutex<()>> {
        let key = format!("{tenant_id}\u{1f}{command_name}");
        let mut key_locks = self.key_locks.lock().await;
        key_locks.entry(key).or_default().clone()
    }
}
