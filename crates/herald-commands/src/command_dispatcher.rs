use anyhow::{anyhow, bail, Result};
use serde_json::json;

use crate::command_parser::is_valid_command_name;
use crate::command_registry::{BuiltinCommandKind, CommandRegistry, ResolvedCommand};
use crate::custom_command_store::{CommandBody, CustomCommandDefinition};
use herald_policy::{CommandActor, CommandRuleSet, ExecutionPolicy, PolicyChange, RuleSetDelta};
use herald_sandbox::{SandboxManager, ScriptBindings};
use herald_telemetry::EmojiUsageCollector;

/// Everything a command execution may touch, wired by the composition root.
/// Resolution never consults this; only `execute_command` does work.
pub struct CommandContext<'a> {
    pub tenant_id: &'a str,
    pub channel_id: &'a str,
    pub actor: &'a CommandActor,
    pub raw_args: &'a str,
    pub policy: &'a ExecutionPolicy,
    pub registry: &'a CommandRegistry,
    pub sandbox: &'a SandboxManager,
    pub telemetry: &'a EmojiUsageCollector,
}

/// Executes a resolved command. `Ok(None)` means "no reply"; an `Err` carries
/// the payload the message boundary surfaces to the user verbatim.
pub async fn execute_command(
    command: &ResolvedCommand,
    context: &CommandContext<'_>,
) -> Result<Option<String>> {
    match command {
        ResolvedCommand::Custom(definition) => execute_custom_command(definition, context).await,
        ResolvedCommand::Builtin(kind) => execute_builtin_command(*kind, context).await,
    }
}

async fn execute_custom_command(
    definition: &CustomCommandDefinition,
    context: &CommandContext<'_>,
) -> Result<Option<String>> {
    match &definition.body {
        CommandBody::Reply(text) => Ok(Some(text.clone())),
        CommandBody::Script(source) => run_sandbox_script(context, source).await,
    }
}

async fn execute_builtin_command(
    kind: BuiltinCommandKind,
    context: &CommandContext<'_>,
) -> Result<Option<String>> {
    match kind {
        BuiltinCommandKind::Help => Ok(Some(render_help(context))),
        BuiltinCommandKind::Ping => Ok(Some("pong".to_string())),
        BuiltinCommandKind::EmojiUsage => Ok(Some(
            context.telemetry.render_report(context.tenant_id, 10),
        )),
        BuiltinCommandKind::Run => {
            if context.raw_args.is_empty() {
                bail!("usage: run <script source>");
            }
            run_sandbox_script(context, context.raw_args).await
        }
        BuiltinCommandKind::Command => execute_command_management(context).await,
        BuiltinCommandKind::Allow => execute_policy_mutation(context, true).await,
        BuiltinCommandKind::Deny => execute_policy_mutation(context, false).await,
        BuiltinCommandKind::AdminReset => {
            let cleared = context.telemetry.reset_tenant(context.tenant_id)?;
            Ok(Some(format!(
                "tenant usage counters reset ({cleared} emoji references cleared)"
            )))
        }
    }
}

async fn run_sandbox_script(
    context: &CommandContext<'_>,
    source: &str,
) -> Result<Option<String>> {
    let bindings = ScriptBindings::default()
        .with("tenant_id", json!(context.tenant_id))
        .with("channel_id", json!(context.channel_id))
        .with("actor_id", json!(context.actor.user_id))
        .with("args", json!(context.raw_args));
    match context
        .sandbox
        .run_script(context.tenant_id, source, bindings)
        .await
    {
        Ok(report) => Ok(report.output),
        Err(error) if error.is_silent_sentinel() => Ok(None),
        Err(error) => Err(anyhow!(error.to_string())),
    }
}

fn render_help(context: &CommandContext<'_>) -> String {
    let mut lines = vec!["built-in commands:".to_string()];
    let mut kinds = BuiltinCommandKind::ALL;
    kinds.sort_by_key(|kind| kind.name());
    for kind in kinds {
        lines.push(format!("  {} - {}", kind.name(), kind.summary()));
    }
    let custom = context.registry.custom_command_names(context.tenant_id);
    if custom.is_empty() {
        lines.push("custom commands: none".to_string());
    } else {
        lines.push(format!("custom commands: {}", custom.join(", ")));
    }
    lines.join("\n")
}

async fn execute_command_management(context: &CommandContext<'_>) -> Result<Option<String>> {
    const USAGE: &str = "usage: command <add|add-script|remove|list> ...";
    let (subcommand, rest) = split_leading_token(context.raw_args);
    match subcommand {
        "add" | "add-script" => {
            let (name, body_text) = split_leading_token(rest);
            if name.is_empty() || body_text.is_empty() {
                bail!("usage: command {subcommand} <name> <body>");
            }
            let body = if subcommand == "add" {
                CommandBody::Reply(body_text.to_string())
            } else {
                CommandBody::Script(body_text.to_string())
            };
            context.registry.define_custom_command(CustomCommandDefinition {
                tenant_id: context.tenant_id.to_string(),
                name: name.to_string(),
                body,
            })?;
            Ok(Some(format!("custom command '{name}' saved")))
        }
        "remove" => {
            let (name, trailing) = split_leading_token(rest);
            if name.is_empty() || !trailing.is_empty() {
                bail!("usage: command remove <name>");
            }
            if !context.registry.remove_custom_command(context.tenant_id, name)? {
                bail!("custom command '{name}' does not exist");
            }
            Ok(Some(format!("custom command '{name}' removed")))
        }
        "list" => {
            let names = context.registry.custom_command_names(context.tenant_id);
            if names.is_empty() {
                Ok(Some("custom commands: none".to_string()))
            } else {
                Ok(Some(format!("custom commands: {}", names.join(", "))))
            }
        }
        "" => bail!("{USAGE}"),
        other => bail!("unknown command subcommand '{other}'; {USAGE}"),
    }
}

async fn execute_policy_mutation(
    context: &CommandContext<'_>,
    grant: bool,
) -> Result<Option<String>> {
    let verb = if grant { "allow" } else { "deny" };
    let (command_name, delta) = parse_policy_targets(context.raw_args, verb)?;
    if grant && context.registry.resolve(context.tenant_id, &command_name).is_none() {
        bail!("unknown command '{command_name}'");
    }

    let change = if grant {
        PolicyChange {
            add: delta,
            remove: RuleSetDelta::default(),
        }
    } else {
        PolicyChange {
            add: RuleSetDelta::default(),
            remove: delta,
        }
    };
    let updated = context
        .policy
        .change(context.tenant_id, &command_name, &change)
        .await?;
    Ok(Some(format!(
        "{verb} {command_name}: {}",
        format_rule_set(&updated)
    )))
}

fn parse_policy_targets(raw_args: &str, verb: &str) -> Result<(String, RuleSetDelta)> {
    let usage = format!("usage: {verb} <command> [user:<id>|group:<id>]...");
    let mut tokens = raw_args.split_whitespace();
    let Some(command_name) = tokens.next() else {
        bail!("{usage}");
    };
    if !is_valid_command_name(command_name) {
        bail!("invalid command name '{command_name}'");
    }
    let mut delta = RuleSetDelta::default();
    for token in tokens {
        if let Some(user) = token.strip_prefix("user:") {
            if user.is_empty() {
                bail!("empty user id in '{token}'");
            }
            delta.users.insert(user.to_string());
        } else if let Some(group) = token.strip_prefix("group:") {
            if group.is_empty() {
                bail!("empty group id in '{token}'");
            }
            delta.groups.insert(group.to_string());
        } else {
            bail!("unknown target '{token}'; {usage}");
        }
    }
    if delta.is_empty() {
        bail!("{usage}");
    }
    Ok((command_name.to_string(), delta))
}

fn format_rule_set(rule_set: &CommandRuleSet) -> String {
    let users: Vec<&str> = rule_set.users.iter().map(String::as_str).collect();
    let groups: Vec<&str> = rule_set.groups.iter().map(String::as_str).collect();
    format!("users=[{}] groups=[{}]", users.join(", "), groups.join(", "))
}

/// Splits the first whitespace-delimited token from `text`, returning the
/// token and the remainder with its own leading whitespace removed.
fn split_leading_token(text: &str) -> (&str, &str) {
    let trimmed = text.trim_start();
    match trimmed.find(char::is_whitespace) {
        Some(end) => (&trimmed[..end], trimmed[end..].trim_start()),
        None => (trimmed, ""),
    }
}
