use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};

use crate::command_parser::is_valid_command_name;
use crate::custom_command_store::{CustomCommandDefinition, CustomCommandStore};
use herald_policy::DefaultAccess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Enumerates supported `BuiltinCommandKind` values.
pub enum BuiltinCommandKind {
    Help,
    Ping,
    EmojiUsage,
    Run,
    Command,
    Allow,
    Deny,
    AdminReset,
}

impl BuiltinCommandKind {
    pub const ALL: [Self; 8] = [
        Self::Help,
        Self::Ping,
        Self::EmojiUsage,
        Self::Run,
        Self::Command,
        Self::Allow,
        Self::Deny,
        Self::AdminReset,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Ping => "ping",
            Self::EmojiUsage => "emoji-usage",
            Self::Run => "run",
            Self::Command => "command",
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::AdminReset => "admin-reset",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Default policy when no explicit rule set exists for a tenant.
    pub fn default_access(&self) -> DefaultAccess {
        match self {
            Self::Help | Self::Ping | Self::EmojiUsage => DefaultAccess::Everyone,
            Self::Run | Self::Command | Self::Allow | Self::Deny | Self::AdminReset => {
                DefaultAccess::Nobody
            }
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Self::Help => "list available commands",
            Self::Ping => "liveness check",
            Self::EmojiUsage => "show this tenant's emoji usage",
            Self::Run => "run script source in the sandbox",
            Self::Command => "manage custom commands (add/add-script/remove/list)",
            Self::Allow => "grant users or groups access to a command",
            Self::Deny => "revoke users or groups from a command",
            Self::AdminReset => "reset this tenant's usage counters",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A resolved, executable command: a built-in handler or a tenant-defined
/// definition. Resolution is side-effect-free; work happens at execute time.
pub enum ResolvedCommand {
    Builtin(BuiltinCommandKind),
    Custom(CustomCommandDefinition),
}

impl ResolvedCommand {
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(kind) => kind.name(),
            Self::Custom(definition) => definition.name.as_str(),
        }
    }

    /// Custom commands are tenant-wide unless an explicit rule set says
    /// otherwise; built-ins carry their own defaults.
    pub fn default_access(&self) -> DefaultAccess {
        match self {
            Self::Builtin(kind) => kind.default_access(),
            Self::Custom(_) => DefaultAccess::Everyone,
        }
    }
}

/// Holds built-in command metadata plus the in-memory per-tenant custom
/// command mapping, loaded from the store at startup and mutated
/// write-through (store first, then memory).
pub struct CommandRegistry {
    store: Arc<dyn CustomCommandStore>,
    custom: RwLock<BTreeMap<String, BTreeMap<String, CustomCommandDefinition>>>,
    allow_builtin_shadowing: bool,
}

impl CommandRegistry {
    pub fn new(store: Arc<dyn CustomCommandStore>, allow_builtin_shadowing: bool) -> Self {
        Self {
            store,
            custom: RwLock::new(BTreeMap::new()),
            allow_builtin_shadowing,
        }
    }

    pub fn builtin_names() -> Vec<&'static str> {
        let mut names: Vec<&'static str> = BuiltinCommandKind::ALL
            .into_iter()
            .map(|kind| kind.name())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn is_builtin(name: &str) -> bool {
        BuiltinCommandKind::from_name(name).is_some()
    }

    /// Bulk-loads every tenant's custom commands into memory. Must succeed
    /// before the gateway starts serving.
    pub fn load_custom_commands(&self) -> Result<usize> {
        let definitions = self
            .store
            .load_all()
            .context("failed to load custom-command store")?;
        let count = definitions.len();
        let mut index: BTreeMap<String, BTreeMap<String, CustomCommandDefinition>> =
            BTreeMap::new();
        for definition in definitions {
            index
                .entry(definition.tenant_id.clone())
                .or_default()
                .insert(definition.name.clone(), definition);
        }
        let mut custom = self
            .custom
            .write()
            .map_err(|_| anyhow::anyhow!("custom command index lock poisoned"))?;
        *custom = index;
        tracing::info!(count, "custom commands loaded");
        Ok(count)
    }

    pub fn has_custom_command(&self, tenant_id: &str, name: &str) -> bool {
        self.custom
            .read()
            .map(|custom| {
                custom
                    .get(tenant_id)
                    .is_some_and(|commands| commands.contains_key(name))
            })
            .unwrap_or(false)
    }

    pub fn custom_command_names(&self, tenant_id: &str) -> Vec<String> {
        self.custom
            .read()
            .map(|custom| {
                custom
                    .get(tenant_id)
                    .map(|commands| commands.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Resolves an invocation name: tenant custom command first, then
    /// built-in, else `None` (the caller treats that as "do nothing").
    pub fn resolve(&self, tenant_id: &str, name: &str) -> Option<ResolvedCommand> {
        if let Ok(custom) = self.custom.read() {
            if let Some(definition) = custom.get(tenant_id).and_then(|commands| commands.get(name))
            {
                return Some(ResolvedCommand::Custom(definition.clone()));
            }
        }
        BuiltinCommandKind::from_name(name).map(ResolvedCommand::Builtin)
    }

    /// Creates or updates a custom command, persisting before the in-memory
    /// mapping is touched.
    pub fn define_custom_command(&self, definition: CustomCommandDefinition) -> Result<()> {
        if !is_valid_command_name(&definition.name) {
            bail!(
                "invalid command name '{}' (lowercase letters, digits, '-' and '_' only)",
                definition.name
            );
        }
        if !self.allow_builtin_shadowing && Self::is_builtin(&definition.name) {
            bail!(
                "'{}' is a built-in command and cannot be shadowed",
                definition.name
            );
        }
        self.store
            .upsert(&definition)
            .with_context(|| format!("failed to persist custom command '{}'", definition.name))?;
        let mut custom = self
            .custom
            .write()
            .map_err(|_| anyhow::anyhow!("custom command index lock poisoned"))?;
        custom
            .entry(definition.tenant_id.clone())
            .or_default()
            .insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Deletes a custom command, store first. Returns whether it existed.
    pub fn remove_custom_command(&self, tenant_id: &str, name: &str) -> Result<bool> {
        if !self.has_custom_command(tenant_id, name) {
            return Ok(false);
        }
        self.store
            .delete(tenant_id, name)
            .with_context(|| format!("failed to delete custom command '{name}'"))?;
        let mut custom = self
            .custom
            .write()
            .map_err(|_| anyhow::anyhow!("custom command index lock poisoned"))?;
        if let Some(commands) = custom.get_mut(tenant_id) {
            commands.remove(name);
            if commands.is_empty() {
                custom.remove(tenant_id);
            }
        }
        Ok(true)
    }

    /// Drops every custom command owned by a departing tenant.
    pub fn remove_tenant(&self, tenant_id: &str) -> Result<()> {
        self.store
            .delete_tenant(tenant_id)
            .with_context(|| format!("failed to delete custom commands for tenant '{tenant_id}'"))?;
        let mut custom = self
            .custom
            .write()
            .map_err(|_| anyhow::anyhow!("custom command index lock poisoned"))?;
        custom.remove(tenant_id);
        Ok(())
    }
}
