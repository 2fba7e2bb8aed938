use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default wall-clock budget for one script execution.
pub const SANDBOX_TIMEOUT_MS_DEFAULT: u64 = 3_000;
/// Default memory ceiling for one script execution.
pub const SANDBOX_MEMORY_LIMIT_BYTES_DEFAULT: usize = 16 * 1024 * 1024;
/// Default captured-output ceiling for one script execution.
pub const SANDBOX_MAX_OUTPUT_BYTES_DEFAULT: usize = 16_000;
/// Default instruction count between deadline checks inside the VM.
pub const SANDBOX_INSTRUCTION_CHECK_INTERVAL_DEFAULT: u32 = 2_000;

pub const SANDBOX_REASON_SCRIPT_TIMEOUT: &str = "script_timeout";
pub const SANDBOX_REASON_SCRIPT_RESOURCE_EXCEEDED: &str = "script_resource_exceeded";
pub const SANDBOX_REASON_SCRIPT_RUNTIME_ERROR: &str = "script_runtime_error";
pub const SANDBOX_REASON_SCRIPT_COMPILE_ERROR: &str = "script_compile_error";
pub const SANDBOX_REASON_UNAVAILABLE: &str = "sandbox_unavailable";
pub const SANDBOX_REASON_LIMIT_INVALID: &str = "sandbox_limit_invalid";
pub const SANDBOX_REASON_BINDING_INVALID: &str = "sandbox_binding_invalid";
pub const SANDBOX_REASON_WORKER_FAILED: &str = "sandbox_worker_failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Runtime limits applied to one sandboxed script execution.
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub memory_limit_bytes: usize,
    pub max_output_bytes: usize,
    pub instruction_check_interval: u32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: SANDBOX_TIMEOUT_MS_DEFAULT,
            memory_limit_bytes: SANDBOX_MEMORY_LIMIT_BYTES_DEFAULT,
            max_output_bytes: SANDBOX_MAX_OUTPUT_BYTES_DEFAULT,
            instruction_check_interval: SANDBOX_INSTRUCTION_CHECK_INTERVAL_DEFAULT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Named values injected as globals into the script scope. Nothing outside
/// this set (plus the restricted stdlib) is visible to the script.
pub struct ScriptBindings {
    pub globals: BTreeMap<String, serde_json::Value>,
}

impl ScriptBindings {
    pub fn with(mut self, name: &str, value: serde_json::Value) -> Self {
        self.globals.insert(name.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Execution request for the script sandbox.
pub struct ScriptExecutionRequest {
    pub source: String,
    pub bindings: ScriptBindings,
    pub limits: SandboxLimits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Successful execution report. `output` is `None` when the script produced
/// no printed lines and returned nothing.
pub struct ScriptExecutionReport {
    pub output: Option<String>,
    pub duration_ms: u64,
    pub output_truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Structured execution failure with a machine-readable reason code.
pub struct SandboxScriptError {
    pub reason_code: String,
    pub message: String,
}

impl SandboxScriptError {
    pub fn new(reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.to_string(),
            message: message.into(),
        }
    }

    /// True when the failure is a script-raised error with an empty payload,
    /// which scripts use to signal "intentionally no output".
    pub fn is_silent_sentinel(&self) -> bool {
        if self.reason_code != SANDBOX_REASON_SCRIPT_RUNTIME_ERROR {
            return false;
        }
        let payload = self.message.trim();
        payload.is_empty() || payload == "nil"
    }
}

impl fmt::Display for SandboxScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "({})", self.reason_code)
        } else {
            write!(f, "{} ({})", self.message, self.reason_code)
        }
    }
}

impl std::error::Error for SandboxScriptError {}

pub fn validate_limits(limits: &SandboxLimits) -> Result<(), SandboxScriptError> {
    if limits.timeout_ms == 0 {
        return Err(SandboxScriptError::new(
            SANDBOX_REASON_LIMIT_INVALID,
            "script timeout must be greater than 0",
        ));
    }
    if limits.memory_limit_bytes == 0 {
        return Err(SandboxScriptError::new(
            SANDBOX_REASON_LIMIT_INVALID,
            "script memory limit must be greater than 0",
        ));
    }
    if limits.max_output_bytes == 0 {
        return Err(SandboxScriptError::new(
            SANDBOX_REASON_LIMIT_INVALID,
            "script output limit must be greater than 0",
        ));
    }
    if limits.instruction_check_interval == 0 {
        return Err(SandboxScriptError::new(
            SANDBOX_REASON_LIMIT_INVALID,
            "instruction check interval must be greater than 0",
        ));
    }
    Ok(())
}

pub fn validate_bindings(bindings: &ScriptBindings) -> Result<(), SandboxScriptError> {
    for name in bindings.globals.keys() {
        if !is_valid_binding_name(name) {
            return Err(SandboxScriptError::new(
                SANDBOX_REASON_BINDING_INVALID,
                format!("binding name '{name}' is not a valid identifier"),
            ));
        }
    }
    Ok(())
}

fn is_valid_binding_name(name: &str) -> bool {
    let mut characters = name.chars();
    let Some(first) = characters.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    characters.all(|character| character.is_ascii_alphanumeric() || character == '_')
}
