use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use herald_core::{current_unix_timestamp_ms, write_json_atomic};

pub const USAGE_STORE_SCHEMA_VERSION: u32 = 1;

pub type UsageSnapshot = BTreeMap<String, BTreeMap<String, u64>>;

/// Trait contract for `UsageStore` behavior: durable emoji-usage snapshots.
pub trait UsageStore: Send + Sync {
    fn load(&self) -> Result<UsageSnapshot>;
    fn save(&self, snapshot: &UsageSnapshot) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct UsageSnapshotFile {
    schema_version: u32,
    #[serde(default)]
    updated_unix_ms: u64,
    #[serde(default)]
    tenants: UsageSnapshot,
}

#[derive(Debug, Clone)]
/// Single-file JSON usage store under `<root>/telemetry/`.
pub struct JsonUsageStore {
    snapshot_path: PathBuf,
}

impl JsonUsageStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            snapshot_path: state_dir.join("telemetry").join("emoji-usage.json"),
        }
    }
}

impl UsageStore for JsonUsageStore {
    fn load(&self) -> Result<UsageSnapshot> {
        if !self.snapshot_path.exists() {
            return Ok(UsageSnapshot::new());
        }
        let raw = std::fs::read_to_string(&self.snapshot_path).with_context(|| {
            format!("failed to read usage snapshot {}", self.snapshot_path.display())
        })?;
        let parsed = serde_json::from_str::<UsageSnapshotFile>(&raw).with_context(|| {
            format!("failed to parse usage snapshot {}", self.snapshot_path.display())
        })?;
        if parsed.schema_version != USAGE_STORE_SCHEMA_VERSION {
            bail!(
                "unsupported usage snapshot schema_version {} in {} (expected {})",
                parsed.schema_version,
                self.snapshot_path.display(),
                USAGE_STORE_SCHEMA_VERSION
            );
        }
        Ok(parsed.tenants)
    }

    fn save(&self, snapshot: &UsageSnapshot) -> Result<()> {
        let document = UsageSnapshotFile {
            schema_version: USAGE_STORE_SCHEMA_VERSION,
            updated_unix_ms: current_unix_timestamp_ms(),
            tenants: snapshot.clone(),
        };
        write_json_atomic(&self.snapshot_path, &document).with_context(|| {
            format!("failed to write usage snapshot {}", self.snapshot_path.display())
        })
    }
}
