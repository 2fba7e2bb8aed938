//! Lua-backed sandbox for tenant-supplied script execution.
//!
//! Provides a deny-by-default global scope with memory/deadline/output
//! enforcement and structured reason-code diagnostics. Scripts see only the
//! bindings they are handed plus a restricted standard library; filesystem,
//! network, and process access are unreachable from the evaluation scope.

pub mod sandbox_contract;
pub mod sandbox_manager;
pub mod script_executor;

pub use sandbox_contract::{
    SandboxLimits, SandboxScriptError, ScriptBindings, ScriptExecutionReport,
    ScriptExecutionRequest, SANDBOX_REASON_SCRIPT_COMPILE_ERROR,
    SANDBOX_REASON_SCRIPT_RESOURCE_EXCEEDED, SANDBOX_REASON_SCRIPT_RUNTIME_ERROR,
    SANDBOX_REASON_SCRIPT_TIMEOUT, SANDBOX_REASON_UNAVAILABLE,
};
pub use sandbox_manager::{SandboxManager, SandboxManagerConfig, SandboxState};
pub use script_executor::execute_script_sync;
