use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use herald_runtime::GatewayRuntimeConfig;
use herald_sandbox::{SandboxLimits, SandboxManagerConfig};

fn default_command_prefix() -> String {
    "!".to_string()
}

fn default_seeded_commands() -> Vec<String> {
    vec![
        "help".to_string(),
        "ping".to_string(),
        "emoji-usage".to_string(),
    ]
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".herald")
}

fn default_autosave_interval_seconds() -> u64 {
    60
}

fn default_max_concurrent_events() -> usize {
    32
}

fn default_sandbox_timeout_ms() -> u64 {
    SandboxLimits::default().timeout_ms
}

fn default_sandbox_memory_limit_bytes() -> usize {
    SandboxLimits::default().memory_limit_bytes
}

fn default_sandbox_max_output_bytes() -> usize {
    SandboxLimits::default().max_output_bytes
}

fn default_sandbox_max_concurrent() -> usize {
    SandboxManagerConfig::default().max_concurrent_executions
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Sandbox section of the herald TOML configuration.
pub struct SandboxConfigSection {
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sandbox_memory_limit_bytes")]
    pub memory_limit_bytes: usize,
    #[serde(default = "default_sandbox_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_sandbox_max_concurrent")]
    pub max_concurrent_executions: usize,
}

impl Default for SandboxConfigSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout_ms(),
            memory_limit_bytes: default_sandbox_memory_limit_bytes(),
            max_output_bytes: default_sandbox_max_output_bytes(),
            max_concurrent_executions: default_sandbox_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Herald TOML configuration; every field has a serde default so a missing
/// file behaves like an empty one.
pub struct HeraldConfig {
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_seeded_commands")]
    pub seeded_commands: Vec<String>,
    #[serde(default)]
    pub allow_builtin_shadowing: bool,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub sandbox: SandboxConfigSection,
    #[serde(default = "default_autosave_interval_seconds")]
    pub autosave_interval_seconds: u64,
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: usize,
}

impl Default for HeraldConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_command_prefix(),
            seeded_commands: default_seeded_commands(),
            allow_builtin_shadowing: false,
            state_dir: default_state_dir(),
            sandbox: SandboxConfigSection::default(),
            autosave_interval_seconds: default_autosave_interval_seconds(),
            max_concurrent_events: default_max_concurrent_events(),
        }
    }
}

impl HeraldConfig {
    pub fn to_runtime_config(&self) -> GatewayRuntimeConfig {
        GatewayRuntimeConfig {
            command_prefix: self.command_prefix.clone(),
            seeded_commands: self.seeded_commands.clone(),
            allow_builtin_shadowing: self.allow_builtin_shadowing,
            state_dir: self.state_dir.clone(),
            sandbox: SandboxManagerConfig {
                limits: SandboxLimits {
                    timeout_ms: self.sandbox.timeout_ms,
                    memory_limit_bytes: self.sandbox.memory_limit_bytes,
                    max_output_bytes: self.sandbox.max_output_bytes,
                    ..SandboxLimits::default()
                },
                max_concurrent_executions: self.sandbox.max_concurrent_executions,
            },
            autosave_interval: Duration::from_secs(self.autosave_interval_seconds),
            max_concurrent_events: self.max_concurrent_events,
        }
    }
}

/// Loads the TOML configuration; `None` yields defaults, a named path must
/// exist and parse.
pub fn load_herald_config(path: Option<&Path>) -> Result<HeraldConfig> {
    let Some(path) = path else {
        return Ok(HeraldConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str::<HeraldConfig>(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}
