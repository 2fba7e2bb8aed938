use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::policy_rules::CommandRuleSet;
use herald_core::write_json_atomic;

pub const POLICY_STORE_SCHEMA_VERSION: u32 = 1;

/// Trait contract for `PolicyStore` behavior: durable rule-set persistence
/// keyed by tenant and command.
pub trait PolicyStore: Send + Sync {
    fn load_all(&self) -> Result<BTreeMap<String, BTreeMap<String, CommandRuleSet>>>;
    fn save_rule_set(
        &self,
        tenant_id: &str,
        command_name: &str,
        rule_set: &CommandRuleSet,
    ) -> Result<()>;
    fn delete_tenant(&self, tenant_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TenantPolicyFile {
    schema_version: u32,
    tenant_id: String,
    #[serde(default)]
    rule_sets: BTreeMap<String, CommandRuleSet>,
}

#[derive(Debug, Clone)]
/// JSON-file policy store: one schema-versioned document per tenant under
/// `<root>/policy/`.
pub struct JsonPolicyStore {
    policy_dir: PathBuf,
}

impl JsonPolicyStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            policy_dir: state_dir.join("policy"),
        }
    }

    fn tenant_path(&self, tenant_id: &str) -> PathBuf {
        self.policy_dir
            .join(format!("{}.json", sanitize_path_component(tenant_id)))
    }

    fn load_tenant_file(&self, path: &Path) -> Result<TenantPolicyFile> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy document {}", path.display()))?;
        let parsed = serde_json::from_str::<TenantPolicyFile>(&raw)
            .with_context(|| format!("failed to parse policy document {}", path.display()))?;
        if parsed.schema_version != POLICY_STORE_SCHEMA_VERSION {
            bail!(
                "unsupported policy schema_version {} in {} (expected {})",
                parsed.schema_version,
                path.display(),
                POLICY_STORE_SCHEMA_VERSION
            );
        }
        if parsed.tenant_id.trim().is_empty() {
            bail!("policy document {} has empty tenant_id", path.display());
        }
        Ok(parsed)
    }

    fn save_tenant_file(&self, document: &TenantPolicyFile) -> Result<()> {
        let path = self.tenant_path(&document.tenant_id);
        write_json_atomic(&path, document)
            .with_context(|| format!("failed to write policy document {}", path.display()))
    }
}

impl PolicyStore for JsonPolicyStore {
    fn load_all(&self) -> Result<BTreeMap<String, BTreeMap<String, CommandRuleSet>>> {
        let mut loaded = BTreeMap::new();
        if !self.policy_dir.exists() {
            return Ok(loaded);
        }
        if !self.policy_dir.is_dir() {
            bail!(
                "policy store path {} exists but is not a directory",
                self.policy_dir.display()
            );
        }
        let entries = std::fs::read_dir(&self.policy_dir)
            .with_context(|| format!("failed to list {}", self.policy_dir.display()))?;
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read entry in {}", self.policy_dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|value| value.to_str()) != Some("json") {
                continue;
            }
            let document = self.load_tenant_file(&path)?;
            loaded.insert(document.tenant_id, document.rule_sets);
        }
        Ok(loaded)
    }

    fn save_rule_set(
        &self,
        tenant_id: &str,
        command_name: &str,
        rule_set: &CommandRuleSet,
    ) -> Result<()> {
        if tenant_id.trim().is_empty() {
            bail!("cannot save rule set for empty tenant id");
        }
        if command_name.trim().is_empty() {
            bail!("cannot save rule set for empty command name");
        }
        let path = self.tenant_path(tenant_id);
        let mut document = if path.exists() {
            self.load_tenant_file(&path)?
        } else {
            TenantPolicyFile {
                schema_version: POLICY_STORE_SCHEMA_VERSION,
                tenant_id: tenant_id.to_string(),
                rule_sets: BTreeMap::new(),
            }
        };
        document
            .rule_sets
            .insert(command_name.to_string(), rule_set.clone());
        self.save_tenant_file(&document)
    }

    fn delete_tenant(&self, tenant_id: &str) -> Result<()> {
        let path = self.tenant_path(tenant_id);
        if !path.exists() {
            return Ok(());
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to delete policy document {}", path.display()))
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
