//! Per-tenant command authorization for the Herald gateway.
//!
//! Holds the in-memory allow-list index, applies incremental rule-set
//! mutations write-through against the durable policy store, and answers
//! fail-closed authorization checks.

pub mod policy_engine;
pub mod policy_rules;
pub mod policy_store;

pub use policy_engine::ExecutionPolicy;
pub use policy_rules::{
    apply_policy_change, CommandActor, CommandRuleSet, DefaultAccess, PolicyChange,
    PolicyDecision, RuleSetDelta,
};
pub use policy_store::{JsonPolicyStore, PolicyStore};
