use std::path::Path;
use std::sync::Arc;

use herald_policy::{PolicyChange, RuleSetDelta};
use herald_runtime::{
    ChatGatewayRuntime, GatewayRuntimeConfig, InboundChatEvent, InboundEventKind,
    OutboundChatReply,
};
use herald_sandbox::{SandboxLimits, SandboxManagerConfig};
use tempfile::tempdir;

const TENANT: &str = "guild-main";
const OPERATOR: &str = "operator-1";
const MEMBER: &str = "member-7";

fn config_for(state_dir: &Path) -> GatewayRuntimeConfig {
    GatewayRuntimeConfig {
        state_dir: state_dir.to_path_buf(),
        ..GatewayRuntimeConfig::default()
    }
}

fn message(author: &str, text: &str) -> InboundChatEvent {
    InboundChatEvent {
        kind: InboundEventKind::Message,
        author_id: author.to_string(),
        author_is_bot: false,
        author_roles: Vec::new(),
        tenant_id: TENANT.to_string(),
        channel_id: "general".to_string(),
        can_send_in_channel: true,
        text: text.to_string(),
    }
}

fn grant_user(user: &str) -> PolicyChange {
    PolicyChange {
        add: RuleSetDelta {
            users: [user.to_string()].into_iter().collect(),
            groups: Default::default(),
        },
        remove: RuleSetDelta::default(),
    }
}

/// Brings up a gateway on `state_dir`, joins the tenant, and bootstraps one
/// operator with the admin built-ins. Everything after this bootstrap is
/// driven through chat messages alone.
async fn started_gateway(state_dir: &Path) -> Arc<ChatGatewayRuntime> {
    let runtime = ChatGatewayRuntime::start(config_for(state_dir))
        .await
        .expect("gateway starts");
    runtime
        .handle_tenant_joined(TENANT)
        .await
        .expect("tenant joins");
    for command in ["allow", "deny", "command", "run", "admin-reset"] {
        runtime
            .policy()
            .change(TENANT, command, &grant_user(OPERATOR))
            .await
            .expect("bootstrap operator grant");
    }
    runtime
}

async fn reply_for(runtime: &ChatGatewayRuntime, author: &str, text: &str) -> Option<String> {
    runtime
        .handle_event(&message(author, text))
        .await
        .expect("event handled")
}

#[tokio::test]
async fn integration_policy_grant_flow_round_trips_through_messages() {
    let temp = tempdir().expect("tempdir");
    let runtime = started_gateway(temp.path()).await;

    // Ungranted member: silence, not an error reply.
    assert_eq!(reply_for(&runtime, MEMBER, "!run return 6 * 7").await, None);

    let granted = reply_for(&runtime, OPERATOR, &format!("!allow run user:{MEMBER}"))
        .await
        .expect("allow replies");
    assert!(granted.contains(MEMBER), "{granted}");

    assert_eq!(
        reply_for(&runtime, MEMBER, "!run return 6 * 7").await.as_deref(),
        Some("42")
    );

    reply_for(&runtime, OPERATOR, &format!("!deny run user:{MEMBER}"))
        .await
        .expect("deny replies");
    assert_eq!(
        reply_for(&runtime, MEMBER, "!run return 6 * 7").await,
        None,
        "revoked member is silently denied again"
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn integration_custom_command_lifecycle_is_driven_by_messages() {
    let temp = tempdir().expect("tempdir");
    let runtime = started_gateway(temp.path()).await;

    reply_for(&runtime, OPERATOR, "!command add welcome be kind, read the pins")
        .await
        .expect("define reply command");
    reply_for(
        &runtime,
        OPERATOR,
        "!command add-script whoami return \"you are \" .. actor_id",
    )
    .await
    .expect("define script command");

    // Custom commands are tenant-wide: any member can use them right away.
    assert_eq!(
        reply_for(&runtime, MEMBER, "!welcome").await.as_deref(),
        Some("be kind, read the pins")
    );
    assert_eq!(
        reply_for(&runtime, MEMBER, "!whoami").await.as_deref(),
        Some("you are member-7")
    );

    let listing = reply_for(&runtime, OPERATOR, "!command list")
        .await
        .expect("list replies");
    assert!(listing.contains("welcome") && listing.contains("whoami"), "{listing}");

    reply_for(&runtime, OPERATOR, "!command remove welcome")
        .await
        .expect("remove replies");
    assert_eq!(
        reply_for(&runtime, MEMBER, "!welcome").await,
        None,
        "removed command behaves like no command at all"
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn integration_script_timeout_reply_leaves_gateway_serving() {
    let temp = tempdir().expect("tempdir");
    let mut config = config_for(temp.path());
    config.sandbox = SandboxManagerConfig {
        limits: SandboxLimits {
            timeout_ms: 250,
            ..SandboxLimits::default()
        },
        ..SandboxManagerConfig::default()
    };
    let runtime = ChatGatewayRuntime::start(config).await.expect("gateway starts");
    runtime.handle_tenant_joined(TENANT).await.expect("tenant joins");
    runtime
        .policy()
        .change(TENANT, "run", &grant_user(OPERATOR))
        .await
        .expect("grant run");

    let reply = reply_for(&runtime, OPERATOR, "!run while true do end")
        .await
        .expect("timeout text is the reply");
    assert!(reply.contains("script_timeout"), "{reply}");

    // The sandbox keeps serving after the timeout.
    assert_eq!(
        reply_for(&runtime, OPERATOR, "!run return \"alive\"").await.as_deref(),
        Some("alive")
    );
    assert_eq!(reply_for(&runtime, MEMBER, "!ping").await.as_deref(), Some("pong"));
    runtime.shutdown().await;
}

#[tokio::test]
async fn integration_state_survives_gateway_restart() {
    let temp = tempdir().expect("tempdir");
    {
        let runtime = started_gateway(temp.path()).await;
        reply_for(&runtime, OPERATOR, "!command add motd ship it")
            .await
            .expect("define command");
        reply_for(&runtime, OPERATOR, &format!("!allow run user:{MEMBER}"))
            .await
            .expect("grant run");
        runtime.shutdown().await;
    }

    // A fresh process over the same state directory serves the same policy
    // and commands without any re-seeding.
    let restarted = ChatGatewayRuntime::start(config_for(temp.path()))
        .await
        .expect("gateway restarts");
    assert_eq!(
        reply_for(&restarted, MEMBER, "!motd").await.as_deref(),
        Some("ship it")
    );
    assert_eq!(
        reply_for(&restarted, MEMBER, "!run return 2 + 2").await.as_deref(),
        Some("4")
    );
    assert_eq!(reply_for(&restarted, MEMBER, "!ping").await.as_deref(), Some("pong"));
    restarted.shutdown().await;
}

#[tokio::test]
async fn integration_ndjson_session_replies_only_to_authorized_commands() {
    let temp = tempdir().expect("tempdir");
    let runtime = started_gateway(temp.path()).await;

    let input = [
        r#"{"author_id":"member-7","tenant_id":"guild-main","channel_id":"general","text":"!ping"}"#,
        r#"{"author_id":"member-7","tenant_id":"guild-main","channel_id":"general","text":"!admin-reset"}"#,
        r#"{"author_id":"member-7","tenant_id":"guild-main","channel_id":"general","text":"gg :tada:"}"#,
    ]
    .join("\n");
    let mut output: Vec<u8> = Vec::new();

    let summary = Arc::clone(&runtime)
        .run_event_stream(tokio::io::BufReader::new(input.as_bytes()), &mut output)
        .await
        .expect("stream session");
    assert_eq!(summary.received, 3);
    assert_eq!(summary.malformed, 0);
    assert_eq!(summary.replied, 1, "only the authorized command replies");

    let rendered = String::from_utf8(output).expect("utf8");
    let reply: OutboundChatReply =
        serde_json::from_str(rendered.trim()).expect("reply line parses");
    assert_eq!(reply.channel_id, "general");
    assert_eq!(reply.text, "pong");

    // The plain-text line still fed the usage counters.
    assert_eq!(
        runtime.telemetry().usage_snapshot(TENANT).get("tada"),
        Some(&1)
    );
    runtime.shutdown().await;
}
