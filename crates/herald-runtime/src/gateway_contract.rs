use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use herald_commands::CommandRegistry;
use herald_sandbox::SandboxManagerConfig;

pub const GATEWAY_COMMAND_PREFIX_DEFAULT: &str = "!";
pub const GATEWAY_MAX_CONCURRENT_EVENTS_DEFAULT: usize = 32;
pub const GATEWAY_AUTOSAVE_INTERVAL_SECONDS_DEFAULT: u64 = 60;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `InboundEventKind` values.
pub enum InboundEventKind {
    #[default]
    Message,
    TenantJoined,
    TenantRemoved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One inbound event from the chat transport collaborator.
pub struct InboundChatEvent {
    #[serde(default)]
    pub kind: InboundEventKind,
    #[serde(default)]
    pub author_id: String,
    #[serde(default)]
    pub author_is_bot: bool,
    #[serde(default)]
    pub author_roles: Vec<String>,
    pub tenant_id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default = "default_true")]
    pub can_send_in_channel: bool,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One outbound reply handed back to the transport collaborator.
pub struct OutboundChatReply {
    pub channel_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Gateway configuration assembled by the binary from file and flags.
pub struct GatewayRuntimeConfig {
    pub command_prefix: String,
    pub seeded_commands: Vec<String>,
    pub allow_builtin_shadowing: bool,
    pub state_dir: PathBuf,
    pub sandbox: SandboxManagerConfig,
    pub autosave_interval: Duration,
    pub max_concurrent_events: usize,
}

impl Default for GatewayRuntimeConfig {
    fn default() -> Self {
        Self {
            command_prefix: GATEWAY_COMMAND_PREFIX_DEFAULT.to_string(),
            seeded_commands: vec![
                "help".to_string(),
                "ping".to_string(),
                "emoji-usage".to_string(),
            ],
            allow_builtin_shadowing: false,
            state_dir: PathBuf::from(".herald"),
            sandbox: SandboxManagerConfig::default(),
            autosave_interval: Duration::from_secs(GATEWAY_AUTOSAVE_INTERVAL_SECONDS_DEFAULT),
            max_concurrent_events: GATEWAY_MAX_CONCURRENT_EVENTS_DEFAULT,
        }
    }
}

/// Startup validation; any failure here must abort the process before it
/// serves a single event.
pub fn validate_gateway_config(config: &GatewayRuntimeConfig) -> Result<()> {
    if config.command_prefix.is_empty() {
        bail!("command prefix cannot be empty");
    }
    if config.command_prefix.chars().any(char::is_whitespace) {
        bail!("command prefix cannot contain whitespace");
    }
    for name in &config.seeded_commands {
        if !CommandRegistry::is_builtin(name) {
            bail!(
                "seeded command '{}' is not a built-in command (known: {})",
                name,
                CommandRegistry::builtin_names().join(", ")
            );
        }
    }
    if config.max_concurrent_events == 0 {
        bail!("max concurrent events must be greater than zero");
    }
    if config.autosave_interval.is_zero() {
        bail!("autosave interval must be greater than zero");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_gateway_config, GatewayRuntimeConfig, InboundChatEvent, InboundEventKind};

    #[test]
    fn unit_default_config_validates() {
        validate_gateway_config(&GatewayRuntimeConfig::default()).expect("default config is valid");
    }

    #[test]
    fn regression_seeded_command_outside_builtins_is_a_fatal_config_error() {
        let config = GatewayRuntimeConfig {
            seeded_commands: vec!["help".to_string(), "no-such-builtin".to_string()],
            ..GatewayRuntimeConfig::default()
        };
        let error = validate_gateway_config(&config).expect_err("unknown seed must fail");
        assert!(error.to_string().contains("no-such-builtin"));
    }

    #[test]
    fn regression_whitespace_prefix_is_rejected() {
        let config = GatewayRuntimeConfig {
            command_prefix: "! ".to_string(),
            ..GatewayRuntimeConfig::default()
        };
        assert!(validate_gateway_config(&config).is_err());
    }

    #[test]
    fn unit_inbound_event_defaults_to_message_kind() {
        let event: InboundChatEvent = serde_json::from_str(
            r#"{"author_id":"u1","tenant_id":"t1","channel_id":"c1","text":"hi"}"#,
        )
        .expect("parse");
        assert_eq!(event.kind, InboundEventKind::Message);
        assert!(event.can_send_in_channel);
        assert!(!event.author_is_bot);
    }

    #[test]
    fn unit_tenant_lifecycle_events_parse_without_author_fields() {
        let event: InboundChatEvent =
            serde_json::from_str(r#"{"kind":"tenant_joined","tenant_id":"t1"}"#).expect("parse");
        assert_eq!(event.kind, InboundEventKind::TenantJoined);
        assert!(event.author_id.is_empty());
    }
}
