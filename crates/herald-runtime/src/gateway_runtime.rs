use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::gateway_contract::{
    validate_gateway_config, GatewayRuntimeConfig, InboundChatEvent, InboundEventKind,
    OutboundChatReply,
};
use herald_commands::{
    execute_command, parse_command_invocation, CommandContext, CommandRegistry,
    CustomCommandStore, JsonCustomCommandStore,
};
use herald_policy::{CommandActor, ExecutionPolicy, JsonPolicyStore, PolicyStore};
use herald_sandbox::SandboxManager;
use herald_telemetry::{
    start_usage_autosave, EmojiUsageCollector, JsonUsageStore, UsageAutosaveHandle, UsageStore,
};

const GATE_REASON_BOT_AUTHOR: &str = "gate_bot_author";
const GATE_REASON_CHANNEL_NOT_SENDABLE: &str = "gate_channel_not_sendable";
const GATE_REASON_MISSING_IDENTITY: &str = "gate_missing_identity";
const GATE_REASON_NOT_A_COMMAND: &str = "gate_not_a_command";
const GATE_REASON_UNKNOWN_COMMAND: &str = "gate_unknown_command";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Counters for one ndjson event-stream session.
pub struct EventStreamSummary {
    pub received: usize,
    pub malformed: usize,
    pub replied: usize,
}

/// The composed gateway. Owns exactly one of each collaborator; components
/// are reached only through constructor-injected handles, never ambient
/// lookups.
pub struct ChatGatewayRuntime {
    config: GatewayRuntimeConfig,
    policy: ExecutionPolicy,
    registry: CommandRegistry,
    sandbox: SandboxManager,
    telemetry: Arc<EmojiUsageCollector>,
    autosave: Mutex<Option<UsageAutosaveHandle>>,
}

impl ChatGatewayRuntime {
    /// Composes the gateway over JSON-file stores rooted at the configured
    /// state directory and brings every component up, fail-fast.
    pub async fn start(config: GatewayRuntimeConfig) -> Result<Arc<Self>> {
        let policy_store = Arc::new(JsonPolicyStore::new(&config.state_dir));
        let command_store = Arc::new(JsonCustomCommandStore::new(&config.state_dir));
        let usage_store = Arc::new(JsonUsageStore::new(&config.state_dir));
        Self::start_with_stores(config, policy_store, command_store, usage_store).await
    }

    /// Startup order: config invariants, then every durable load, then
    /// sandbox provisioning, then the autosave task. Any failure aborts
    /// before a single event can be served (fail-closed, never fail-open).
    pub async fn start_with_stores(
        config: GatewayRuntimeConfig,
        policy_store: Arc<dyn PolicyStore>,
        command_store: Arc<dyn CustomCommandStore>,
        usage_store: Arc<dyn UsageStore>,
    ) -> Result<Arc<Self>> {
        validate_gateway_config(&config).context("gateway configuration rejected")?;

        let policy = ExecutionPolicy::new(policy_store);
        policy
            .load_permissions()
            .context("policy store must load before serving authorization decisions")?;

        let registry = CommandRegistry::new(command_store, config.allow_builtin_shadowing);
        registry
            .load_custom_commands()
            .context("custom-command store must load before serving")?;

        let telemetry = Arc::new(EmojiUsageCollector::new(usage_store));
        telemetry
            .load_snapshot()
            .context("usage snapshot must load before serving")?;

        let sandbox = SandboxManager::new(config.sandbox.clone());
        sandbox
            .start()
            .map_err(|error| anyhow::anyhow!("sandbox provisioning failed: {error}"))?;

        let autosave = start_usage_autosave(Arc::clone(&telemetry), config.autosave_interval)
            .context("usage autosave task failed to start")?;

        tracing::info!(
            prefix = %config.command_prefix,
            state_dir = %config.state_dir.display(),
            "gateway runtime started"
        );
        Ok(Arc::new(Self {
            config,
            policy,
            registry,
            sandbox,
            telemetry,
            autosave: Mutex::new(Some(autosave)),
        }))
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn sandbox(&self) -> &SandboxManager {
        &self.sandbox
    }

    pub fn telemetry(&self) -> &EmojiUsageCollector {
        &self.telemetry
    }

    /// Stops the background work: final usage flush, then sandbox teardown.
    pub async fn shutdown(&self) {
        if let Some(mut autosave) = self.autosave.lock().await.take() {
            autosave.shutdown().await;
        }
        if let Err(error) = self.telemetry.flush() {
            tracing::warn!(%error, "final usage flush failed during shutdown");
        }
        self.sandbox.stop().await;
        tracing::info!("gateway runtime stopped");
    }

    /// Processes one inbound event and returns the optional reply text. The
    /// gateway never sends anything itself.
    pub async fn handle_event(&self, event: &InboundChatEvent) -> Result<Option<String>> {
        match event.kind {
            InboundEventKind::TenantJoined => {
                self.handle_tenant_joined(&event.tenant_id).await?;
                Ok(None)
            }
            InboundEventKind::TenantRemoved => {
                self.handle_tenant_removed(&event.tenant_id).await?;
                Ok(None)
            }
            InboundEventKind::Message => self.handle_message_event(event).await,
        }
    }

    /// Seeds the configured command grants for a tenant joining the
    /// platform, so persisted state always reflects effective policy.
    pub async fn handle_tenant_joined(&self, tenant_id: &str) -> Result<usize> {
        let seeded = self
            .policy
            .seed_tenant(tenant_id, &self.config.seeded_commands)
            .await?;
        tracing::info!(tenant_id, seeded, "tenant joined");
        Ok(seeded)
    }

    /// Purges a departing tenant: policy first, then custom commands, then
    /// usage counters. Completion of this call is the "tenant is gone"
    /// precondition.
    pub async fn handle_tenant_removed(&self, tenant_id: &str) -> Result<()> {
        self.policy.remove_tenant(tenant_id).await?;
        self.registry.remove_tenant(tenant_id)?;
        self.telemetry.remove_tenant(tenant_id)?;
        tracing::info!(tenant_id, "tenant removed");
        Ok(())
    }

    async fn handle_message_event(&self, event: &InboundChatEvent) -> Result<Option<String>> {
        if event.author_is_bot {
            tracing::trace!(reason = GATE_REASON_BOT_AUTHOR, "event ignored");
            return Ok(None);
        }
        if !event.can_send_in_channel {
            tracing::trace!(reason = GATE_REASON_CHANNEL_NOT_SENDABLE, "event ignored");
            return Ok(None);
        }
        if event.tenant_id.trim().is_empty() || event.author_id.trim().is_empty() {
            tracing::trace!(reason = GATE_REASON_MISSING_IDENTITY, "event ignored");
            return Ok(None);
        }

        self.telemetry.record_message(&event.tenant_id, &event.text);

        let Some(invocation) =
            parse_command_invocation(&event.text, &self.config.command_prefix)
        else {
            tracing::trace!(reason = GATE_REASON_NOT_A_COMMAND, "event ignored");
            return Ok(None);
        };
        let Some(resolved) = self.registry.resolve(&event.tenant_id, &invocation.name) else {
            tracing::debug!(
                reason = GATE_REASON_UNKNOWN_COMMAND,
                command = %invocation.name,
                "event ignored"
            );
            return Ok(None);
        };

        let actor =
            CommandActor::for_tenant(&event.author_id, &event.tenant_id, &event.author_roles);
        let decision = self.policy.evaluate(
            &event.tenant_id,
            resolved.name(),
            &actor,
            resolved.default_access(),
        );
        if !decision.is_allowed() {
            // Silence is deliberate: unauthorized actors learn nothing about
            // which commands exist.
            tracing::debug!(
                reason = decision.reason_code(),
                command = %invocation.name,
                tenant = %event.tenant_id,
                "command denied"
            );
            return Ok(None);
        }

        let context = CommandContext {
            tenant_id: &event.tenant_id,
            channel_id: &event.channel_id,
            actor: &actor,
            raw_args: &invocation.raw_args,
            policy: &self.policy,
            registry: &self.registry,
            sandbox: &self.sandbox,
            telemetry: &self.telemetry,
        };
        match execute_command(&resolved, &context).await {
            Ok(reply) => Ok(reply),
            Err(error) => {
                // Execution failed after authorization passed: the payload is
                // the reply, so operators see something actionable.
                tracing::debug!(
                    command = %invocation.name,
                    tenant = %event.tenant_id,
                    error = %error,
                    "command execution failed"
                );
                Ok(Some(format!("{error:#}")))
            }
        }
    }

    /// Drives a whole ndjson session: one task per event under a bounded
    /// permit pool, replies written back as JSON lines. This is the narrow
    /// seam a real chat transport sits behind.
    pub async fn run_event_stream<R, W>(
        self: Arc<Self>,
        reader: R,
        mut writer: W,
    ) -> Result<EventStreamSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_events));
        let mut tasks: JoinSet<Option<OutboundChatReply>> = JoinSet::new();
        let mut summary = EventStreamSummary::default();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("failed to read inbound event stream")? else {
                        break;
                    };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    summary.received = summary.received.saturating_add(1);
                    let event = match serde_json::from_str::<InboundChatEvent>(trimmed) {
                        Ok(event) => event,
                        Err(error) => {
                            summary.malformed = summary.malformed.saturating_add(1);
                            tracing::warn!(%error, "malformed inbound event line");
                            continue;
                        }
                    };
                    let permit = Arc::clone(&permits)
                        .acquire_owned()
                        .await
                        .context("event permit pool closed")?;
                    let runtime = Arc::clone(&self);
                    tasks.spawn(async move {
                        let _permit = permit;
                        let channel_id = event.channel_id.clone();
                        match runtime.handle_event(&event).await {
                            Ok(Some(text)) => Some(OutboundChatReply { channel_id, text }),
                            Ok(None) => None,
                            Err(error) => {
                                tracing::error!(%error, "event handling failed");
                                None
                            }
                        }
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Some(reply) = flatten_joined_reply(joined) {
                        write_reply(&mut writer, &reply).await?;
                        summary.replied = summary.replied.saturating_add(1);
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Some(reply) = flatten_joined_reply(joined) {
                write_reply(&mut writer, &reply).await?;
                summary.replied = summary.replied.saturating_add(1);
            }
        }
        writer
            .flush()
            .await
            .context("failed to flush outbound reply stream")?;
        Ok(summary)
    }
}

fn flatten_joined_reply(
    joined: Result<Option<OutboundChatReply>, tokio::task::JoinError>,
) -> Option<OutboundChatReply> {
    match joined {
        Ok(reply) => reply,
        Err(error) => {
            tracing::error!(%error, "event task panicked");
            None
        }
    }
}

async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: &OutboundChatReply,
) -> Result<()> {
    let mut line = serde_json::to_string(reply).context("failed to encode outbound reply")?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .context("failed to write outbound reply")
}

#[cfg(test)]
mod tests {
    use super::{ChatGatewayRuntime, EventStreamSummary};
    use crate::gateway_contract::{
        GatewayRuntimeConfig, InboundChatEvent, InboundEventKind, OutboundChatReply,
    };
    use herald_commands::{CommandBody, CustomCommandDefinition};
    use herald_policy::{PolicyChange, RuleSetDelta};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn config_for(state_dir: &Path) -> GatewayRuntimeConfig {
        GatewayRuntimeConfig {
            state_dir: state_dir.to_path_buf(),
            ..GatewayRuntimeConfig::default()
        }
    }

    fn message(tenant: &str, author: &str, text: &str) -> InboundChatEvent {
        InboundChatEvent {
            kind: InboundEventKind::Message,
            author_id: author.to_string(),
            author_is_bot: false,
            author_roles: Vec::new(),
            tenant_id: tenant.to_string(),
            channel_id: "channel-1".to_string(),
            can_send_in_channel: true,
            text: text.to_string(),
        }
    }

    fn grant_users(users: &[&str]) -> PolicyChange {
        PolicyChange {
            add: RuleSetDelta {
                users: users.iter().map(|value| value.to_string()).collect(),
                groups: Default::default(),
            },
            remove: RuleSetDelta::default(),
        }
    }

    async fn started_runtime(state_dir: &Path) -> Arc<ChatGatewayRuntime> {
        let runtime = ChatGatewayRuntime::start(config_for(state_dir))
            .await
            .expect("runtime starts");
        runtime
            .handle_tenant_joined("tenant-1")
            .await
            .expect("tenant joins");
        runtime
    }

    #[tokio::test]
    async fn integration_seeded_command_replies_for_any_tenant_member() {
        let temp = tempdir().expect("tempdir");
        let runtime = started_runtime(temp.path()).await;

        let reply = runtime
            .handle_event(&message("tenant-1", "user-1", "!ping"))
            .await
            .expect("handle");
        assert_eq!(reply.as_deref(), Some("pong"));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn integration_ungranted_admin_command_is_silently_denied() {
        let temp = tempdir().expect("tempdir");
        let runtime = started_runtime(temp.path()).await;

        let denied = runtime
            .handle_event(&message("tenant-1", "user-1", "!admin-reset"))
            .await
            .expect("handle");
        assert_eq!(denied, None, "denial must be silent");

        runtime
            .policy()
            .change("tenant-1", "admin-reset", &grant_users(&["user-1"]))
            .await
            .expect("grant");
        let granted = runtime
            .handle_event(&message("tenant-1", "user-1", "!admin-reset"))
            .await
            .expect("handle");
        let text = granted.expect("granted actor gets a reply");
        assert!(!text.is_empty());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn integration_bot_and_non_sendable_events_are_ignored() {
        let temp = tempdir().expect("tempdir");
        let runtime = started_runtime(temp.path()).await;

        let mut bot_event = message("tenant-1", "bot-1", "!ping");
        bot_event.author_is_bot = true;
        assert_eq!(runtime.handle_event(&bot_event).await.expect("handle"), None);

        let mut muted_event = message("tenant-1", "user-1", "!ping");
        muted_event.can_send_in_channel = false;
        assert_eq!(
            runtime.handle_event(&muted_event).await.expect("handle"),
            None
        );
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn integration_plain_text_counts_emoji_and_stays_silent() {
        let temp = tempdir().expect("tempdir");
        let runtime = started_runtime(temp.path()).await;

        let reply = runtime
            .handle_event(&message("tenant-1", "user-1", "nice one :tada:"))
            .await
            .expect("handle");
        assert_eq!(reply, None);
        assert_eq!(
            runtime.telemetry().usage_snapshot("tenant-1").get("tada"),
            Some(&1)
        );

        let unknown = runtime
            .handle_event(&message("tenant-1", "user-1", "!definitely-not-a-command"))
            .await
            .expect("handle");
        assert_eq!(unknown, None, "unknown commands stay silent");
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn integration_custom_script_error_text_is_the_reply() {
        let temp = tempdir().expect("tempdir");
        let runtime = started_runtime(temp.path()).await;
        runtime
            .registry()
            .define_custom_command(CustomCommandDefinition {
                tenant_id: "tenant-1".to_string(),
                name: "fail".to_string(),
                body: CommandBody::Script("error(\"bad dice expression\")".to_string()),
            })
            .expect("define");

        let reply = runtime
            .handle_event(&message("tenant-1", "user-1", "!fail"))
            .await
            .expect("handle")
            .expect("error text surfaces");
        assert!(reply.contains("bad dice expression"), "{reply}");
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn integration_tenant_removal_purges_policy_commands_and_counters() {
        let temp = tempdir().expect("tempdir");
        let runtime = started_runtime(temp.path()).await;
        runtime
            .registry()
            .define_custom_command(CustomCommandDefinition {
                tenant_id: "tenant-1".to_string(),
                name: "greet".to_string(),
                body: CommandBody::Reply("hi".to_string()),
            })
            .expect("define");
        runtime
            .policy()
            .change("tenant-1", "admin-reset", &grant_users(&["user-1"]))
            .await
            .expect("grant admin-reset");
        runtime
            .handle_event(&message("tenant-1", "user-1", "hello :wave:"))
            .await
            .expect("count emoji");

        runtime
            .handle_event(&InboundChatEvent {
                kind: InboundEventKind::TenantRemoved,
                tenant_id: "tenant-1".to_string(),
                ..message("tenant-1", "", "")
            })
            .await
            .expect("remove tenant");

        assert!(!runtime.registry().has_custom_command("tenant-1", "greet"));
        assert!(runtime.telemetry().usage_snapshot("tenant-1").is_empty());
        let revoked = runtime
            .handle_event(&message("tenant-1", "user-1", "!admin-reset"))
            .await
            .expect("handle");
        assert_eq!(revoked, None, "explicit grants never survive the purge");
        let reply = runtime
            .handle_event(&message("tenant-1", "user-1", "!ping"))
            .await
            .expect("handle");
        assert_eq!(
            reply.as_deref(),
            Some("pong"),
            "defaults behave as if the tenant were newly joined"
        );
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn regression_corrupted_policy_store_aborts_startup() {
        let temp = tempdir().expect("tempdir");
        let policy_dir = temp.path().join("policy");
        std::fs::create_dir_all(&policy_dir).expect("mkdir");
        std::fs::write(policy_dir.join("tenant-1.json"), "{not json").expect("write");

        let error = ChatGatewayRuntime::start(config_for(temp.path()))
            .await
            .expect_err("corrupted store must abort startup");
        assert!(
            format!("{error:#}").contains("policy store"),
            "unexpected error: {error:#}"
        );
    }

    #[tokio::test]
    async fn regression_invalid_seed_list_aborts_startup() {
        let temp = tempdir().expect("tempdir");
        let config = GatewayRuntimeConfig {
            seeded_commands: vec!["not-a-builtin".to_string()],
            ..config_for(temp.path())
        };
        let error = ChatGatewayRuntime::start(config)
            .await
            .expect_err("invalid seed list must abort startup");
        assert!(format!("{error:#}").contains("not-a-builtin"));
    }

    #[tokio::test]
    async fn integration_event_stream_round_trips_ndjson() {
        let temp = tempdir().expect("tempdir");
        let runtime = started_runtime(temp.path()).await;

        let input = [
            r#"{"kind":"tenant_joined","tenant_id":"tenant-2"}"#,
            r#"{"author_id":"user-1","tenant_id":"tenant-2","channel_id":"chan-9","text":"!ping"}"#,
            "not json at all",
            r#"{"author_id":"user-1","tenant_id":"tenant-2","channel_id":"chan-9","text":"just chatting"}"#,
        ]
        .join("\n");
        let mut output: Vec<u8> = Vec::new();

        let summary: EventStreamSummary = Arc::clone(&runtime)
            .run_event_stream(tokio::io::BufReader::new(input.as_bytes()), &mut output)
            .await
            .expect("stream session");
        assert_eq!(summary.received, 4);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.replied, 1);

        let rendered = String::from_utf8(output).expect("utf8");
        let reply: OutboundChatReply =
            serde_json::from_str(rendered.trim()).expect("reply line parses");
        assert_eq!(reply.channel_id, "chan-9");
        assert_eq!(reply.text, "pong");
        runtime.shutdown().await;
    }
}
