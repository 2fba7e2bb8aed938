//! Gateway runtime: wires the policy engine, command registry, sandbox
//! manager, and usage telemetry behind a single per-event pipeline with
//! fail-fast startup and explicit tenant lifecycle handling.

pub mod gateway_contract;
pub mod gateway_runtime;

pub use gateway_contract::{
    validate_gateway_config, GatewayRuntimeConfig, InboundChatEvent, InboundEventKind,
    OutboundChatReply,
};
pub use gateway_runtime::{ChatGatewayRuntime, EventStreamSummary};
