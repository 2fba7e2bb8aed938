//! Command surface of the Herald gateway: lexical message parsing, the
//! built-in/custom command registry, durable custom-command storage, and the
//! dispatcher that executes resolved commands.

pub mod command_dispatcher;
pub mod command_parser;
pub mod command_registry;
pub mod custom_command_store;

pub use command_dispatcher::{execute_command, CommandContext};
pub use command_parser::{is_valid_command_name, parse_command_invocation, CommandInvocation};
pub use command_registry::{BuiltinCommandKind, CommandRegistry, ResolvedCommand};
pub use custom_command_store::{
    CommandBody, CustomCommandDefinition, CustomCommandStore, JsonCustomCommandStore,
};
