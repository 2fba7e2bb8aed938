use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use herald_core::write_json_atomic;

pub const CUSTOM_COMMAND_STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
/// Enumerates supported `CommandBody` values: literal reply text or script
/// source executed in the sandbox.
pub enum CommandBody {
    Reply(String),
    Script(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One tenant-defined command as persisted and held in memory.
pub struct CustomCommandDefinition {
    pub tenant_id: String,
    pub name: String,
    pub body: CommandBody,
}

/// Trait contract for `CustomCommandStore` behavior: durable custom-command
/// definitions keyed by tenant and name.
pub trait CustomCommandStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<CustomCommandDefinition>>;
    fn upsert(&self, definition: &CustomCommandDefinition) -> Result<()>;
    fn delete(&self, tenant_id: &str, name: &str) -> Result<()>;
    fn delete_tenant(&self, tenant_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TenantCommandFile {
    schema_version: u32,
    tenant_id: String,
    #[serde(default)]
    commands: BTreeMap<String, CommandBody>,
}

#[derive(Debug, Clone)]
/// JSON-file custom-command store: one schema-versioned document per tenant
/// under `<root>/commands/`.
pub struct JsonCustomCommandStore {
    commands_dir: PathBuf,
}

impl JsonCustomCommandStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            commands_dir: state_dir.join("commands"),
        }
    }

    fn tenant_path(&self, tenant_id: &str) -> PathBuf {
        self.commands_dir
            .join(format!("{}.json", sanitize_path_component(tenant_id)))
    }

    fn load_tenant_file(&self, path: &Path) -> Result<TenantCommandFile> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read command document {}", path.display()))?;
        let parsed = serde_json::from_str::<TenantCommandFile>(&raw)
            .with_context(|| format!("failed to parse command document {}", path.display()))?;
        if parsed.schema_version != CUSTOM_COMMAND_STORE_SCHEMA_VERSION {
            bail!(
                "unsupported custom-command schema_version {} in {} (expected {})",
                parsed.schema_version,
                path.display(),
                CUSTOM_COMMAND_STORE_SCHEMA_VERSION
            );
        }
        if parsed.tenant_id.trim().is_empty() {
            bail!("command document {} has empty tenant_id", path.display());
        }
        Ok(parsed)
    }

    fn save_tenant_file(&self, document: &TenantCommandFile) -> Result<()> {
        let path = self.tenant_path(&document.tenant_id);
        if document.commands.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path).with_context(|| {
                    format!("failed to delete empty command document {}", path.display())
                })?;
            }
            return Ok(());
        }
        write_json_atomic(&path, document)
            .with_context(|| format!("failed to write command document {}", path.display()))
    }
}

impl CustomCommandStore for JsonCustomCommandStore {
    fn load_all(&self) -> Result<Vec<CustomCommandDefinition>> {
        let mut definitions = Vec::new();
        if !self.commands_dir.exists() {
            return Ok(definitions);
        }
        if !self.commands_dir.is_dir() {
            bail!(
                "custom-command store path {} exists but is not a directory",
                self.commands_dir.display()
            );
        }
        let entries = std::fs::read_dir(&self.commands_dir)
            .with_context(|| format!("failed to list {}", self.commands_dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read entry in {}", self.commands_dir.display())
            })?;
            let path = entry.path();
            if path.extension().and_then(|value| value.to_str()) != Some("json") {
                continue;
            }
            let document = self.load_tenant_file(&path)?;
            for (name, body) in document.commands {
                definitions.push(CustomCommandDefinition {
                    tenant_id: document.tenant_id.clone(),
                    name,
                    body,
                });
            }
        }
        Ok(definitions)
    }

    fn upsert(&self, definition: &CustomCommandDefinition) -> Result<()> {
        if definition.tenant_id.trim().is_empty() {
            bail!("cannot persist custom command with empty tenant id");
        }
        if definition.name.trim().is_empty() {
            bail!("cannot persist custom command with empty name");
        }
        let path = self.tenant_path(&definition.tenant_id);
        let mut document = if path.exists() {
            self.load_tenant_file(&path)?
        } else {
            TenantCommandFile {
                schema_version: CUSTOM_COMMAND_STORE_SCHEMA_VERSION,
                tenant_id: definition.tenant_id.clone(),
                commands: BTreeMap::new(),
            }
        };
        document
            .commands
            .insert(definition.name.clone(), definition.body.clone());
        self.save_tenant_file(&document)
    }

    fn delete(&self, tenant_id: &str, name: &str) -> Result<()> {
        let path = self.tenant_path(tenant_id);
        if !path.exists() {
            return Ok(());
        }
        let mut document = self.load_tenant_file(&path)?;
        if document.commands.remove(name).is_none() {
            return Ok(());
        }
        self.save_tenant_file(&document)
    }

    fn delete_tenant(&self, tenant_id: &str) -> Result<()> {
        let path = self.tenant_path(tenant_id);
        if !path.exists() {
            return Ok(());
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to delete command document {}", path.display()))
    }
}

fn sanitize_path_component(raw: &str) -> String {
    let mut sanitized: String = raw
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '_' | '-') {
                character
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        sanitized.push('_');
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::{
        CommandBody, CustomCommandDefinition, CustomCommandStore, JsonCustomCommandStore,
    };
    use tempfile::tempdir;

    fn definition(tenant: &str, name: &str, body: CommandBody) -> CustomCommandDefinition {
        CustomCommandDefinition {
            tenant_id: tenant.to_string(),
            name: name.to_string(),
            body,
        }
    }

    #[test]
    fn functional_upsert_and_load_round_trips_definitions() {
        let temp = tempdir().expect("tempdir");
        let store = JsonCustomCommandStore::new(temp.path());

        store
            .upsert(&definition(
                "tenant-1",
                "greet",
                CommandBody::Reply("hello!".to_string()),
            ))
            .expect("upsert reply");
        store
            .upsert(&definition(
                "tenant-1",
                "roll",
                CommandBody::Script("return math.random(6)".to_string()),
            ))
            .expect("upsert script");

        let mut loaded = store.load_all().expect("load all");
        loaded.sort_by(|left, right| left.name.cmp(&right.name));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "greet");
        assert_eq!(loaded[0].body, CommandBody::Reply("hello!".to_string()));
        assert_eq!(loaded[1].name, "roll");
    }

    #[test]
    fn functional_upsert_replaces_existing_body() {
        let temp = tempdir().expect("tempdir");
        let store = JsonCustomCommandStore::new(temp.path());
        store
            .upsert(&definition("tenant-1", "greet", CommandBody::Reply("v1".to_string())))
            .expect("first upsert");
        store
            .upsert(&definition("tenant-1", "greet", CommandBody::Reply("v2".to_string())))
            .expect("second upsert");

        let loaded = store.load_all().expect("load all");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].body, CommandBody::Reply("v2".to_string()));
    }

    #[test]
    fn functional_delete_removes_single_command_and_tolerates_absent() {
        let temp = tempdir().expect("tempdir");
        let store = JsonCustomCommandStore::new(temp.path());
        store
            .upsert(&definition("tenant-1", "greet", CommandBody::Reply("hi".to_string())))
            .expect("upsert");

        store.delete("tenant-1", "greet").expect("delete");
        store.delete("tenant-1", "greet").expect("repeat delete is a no-op");
        store.delete("tenant-2", "greet").expect("absent tenant is a no-op");
        assert!(store.load_all().expect("load").is_empty());
    }

    #[test]
    fn functional_delete_tenant_drops_every_definition() {
        let temp = tempdir().expect("tempdir");
        let store = JsonCustomCommandStore::new(temp.path());
        store
            .upsert(&definition("tenant-1", "a", CommandBody::Reply("1".to_string())))
            .expect("upsert a");
        store
            .upsert(&definition("tenant-1", "b", CommandBody::Reply("2".to_string())))
            .expect("upsert b");
        store
            .upsert(&definition("tenant-2", "c", CommandBody::Reply("3".to_string())))
            .expect("upsert c");

        store.delete_tenant("tenant-1").expect("delete tenant");
        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].tenant_id, "tenant-2");
    }

    #[test]
    fn regression_body_serialization_distinguishes_reply_and_script() {
        let reply = serde_json::to_value(CommandBody::Reply("hi".to_string())).expect("encode");
        assert_eq!(reply["kind"], "reply");
        let script =
            serde_json::to_value(CommandBody::Script("return 1".to_string())).expect("encode");
        assert_eq!(script["kind"], "script");
    }
}
