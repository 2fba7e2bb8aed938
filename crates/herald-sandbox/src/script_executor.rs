use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, MultiValue, StdLib, Value as LuaValue};

use crate::sandbox_contract::{
    validate_bindings, validate_limits, SandboxScriptError, ScriptExecutionReport,
    ScriptExecutionRequest, SANDBOX_REASON_SCRIPT_COMPILE_ERROR,
    SANDBOX_REASON_SCRIPT_RESOURCE_EXCEEDED, SANDBOX_REASON_SCRIPT_RUNTIME_ERROR,
    SANDBOX_REASON_SCRIPT_TIMEOUT, SANDBOX_REASON_WORKER_FAILED,
};

// Grace on top of the script deadline before the submitting side gives up on
// the worker; the in-VM hook is the primary enforcement.
const WORKER_RECV_GRACE_MS: u64 = 500;

const REMOVED_BASE_GLOBALS: [&str; 6] = [
    "load",
    "loadstring",
    "dofile",
    "loadfile",
    "require",
    "collectgarbage",
];

#[derive(Debug, Default)]
struct OutputBuffer {
    lines: Vec<String>,
    bytes: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn push_line(&mut self, line: String, max_bytes: usize) {
        if self.truncated {
            return;
        }
        let remaining = max_bytes.saturating_sub(self.bytes);
        if line.len() > remaining {
            let mut cut = remaining;
            while cut > 0 && !line.is_char_boundary(cut) {
                cut = cut.saturating_sub(1);
            }
            if cut > 0 {
                self.bytes = self.bytes.saturating_add(cut);
                self.lines.push(line[..cut].to_string());
            }
            self.truncated = true;
            return;
        }
        self.bytes = self.bytes.saturating_add(line.len());
        self.lines.push(line);
    }
}

/// Executes a script on a dedicated worker thread with deadline enforcement.
/// The in-VM instruction hook aborts the script at the deadline, so the
/// worker terminates even when the submitting side has already timed out.
pub fn execute_script_sync(
    request: ScriptExecutionRequest,
) -> Result<ScriptExecutionReport, SandboxScriptError> {
    validate_limits(&request.limits)?;
    validate_bindings(&request.bindings)?;

    let timeout_ms = request.limits.timeout_ms;
    let (sender, receiver) = mpsc::sync_channel(1);
    std::thread::Builder::new()
        .name("herald-sandbox".to_string())
        .spawn(move || {
            let _ = sender.send(execute_script_blocking(&request));
        })
        .map_err(|error| {
            SandboxScriptError::new(
                SANDBOX_REASON_WORKER_FAILED,
                format!("failed to spawn sandbox worker: {error}"),
            )
        })?;

    match receiver.recv_timeout(Duration::from_millis(
        timeout_ms.saturating_add(WORKER_RECV_GRACE_MS),
    )) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(SandboxScriptError::new(
            SANDBOX_REASON_SCRIPT_TIMEOUT,
            format!("script exceeded the {timeout_ms} ms execution budget"),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(SandboxScriptError::new(
            SANDBOX_REASON_WORKER_FAILED,
            "sandbox worker terminated before returning a result",
        )),
    }
}

fn execute_script_blocking(
    request: &ScriptExecutionRequest,
) -> Result<ScriptExecutionReport, SandboxScriptError> {
    let started = Instant::now();
    let lua = provision_vm(request)?;

    let output = Arc::new(Mutex::new(OutputBuffer::default()));
    install_print_capture(&lua, &output, request.limits.max_output_bytes)?;
    inject_bindings(&lua, request)?;

    let deadline_hit = Arc::new(AtomicBool::new(false));
    install_deadline_hook(&lua, request, &deadline_hit, started);

    let evaluated = lua.load(request.source.as_str()).eval::<LuaValue>();
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match evaluated {
        Ok(value) => {
            let mut buffer = output
                .lock()
                .map_err(|_| internal_error("output buffer poisoned"))?;
            if !matches!(value, LuaValue::Nil) {
                let rendered = render_lua_value(&lua, value)
                    .map_err(|error| classify_lua_error(error, &deadline_hit))?;
                let max_bytes = request.limits.max_output_bytes;
                buffer.push_line(rendered, max_bytes);
            }
            let text = buffer.lines.join("\n");
            Ok(ScriptExecutionReport {
                output: if text.is_empty() { None } else { Some(text) },
                duration_ms,
                output_truncated: buffer.truncated,
            })
        }
        Err(error) => Err(classify_lua_error(error, &deadline_hit)),
    }
}

fn provision_vm(request: &ScriptExecutionRequest) -> Result<Lua, SandboxScriptError> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE,
        LuaOptions::default(),
    )
    .map_err(|error| internal_error(format!("failed to provision script vm: {error}")))?;

    lua.set_memory_limit(request.limits.memory_limit_bytes)
        .map_err(|error| internal_error(format!("failed to set script memory limit: {error}")))?;

    let globals = lua.globals();
    for name in REMOVED_BASE_GLOBALS {
        globals
            .set(name, LuaValue::Nil)
            .map_err(|error| internal_error(format!("failed to strip global '{name}': {error}")))?;
    }
    Ok(lua)
}

fn install_print_capture(
    lua: &Lua,
    output: &Arc<Mutex<OutputBuffer>>,
    max_output_bytes: usize,
) -> Result<(), SandboxScriptError> {
    let sink = Arc::clone(output);
    let print = lua
        .create_function(move |lua, values: MultiValue| {
            let mut rendered = Vec::new();
            for value in values {
                rendered.push(render_lua_value(lua, value)?);
            }
            let mut buffer = sink
                .lock()
                .map_err(|_| mlua::Error::RuntimeError("print sink poisoned".to_string()))?;
            buffer.push_line(rendered.join("\t"), max_output_bytes);
            Ok(())
        })
        .map_err(|error| internal_error(format!("failed to create print binding: {error}")))?;
    lua.globals()
        .set("print", print)
        .map_err(|error| internal_error(format!("failed to install print binding: {error}")))
}

fn inject_bindings(lua: &Lua, request: &ScriptExecutionRequest) -> Result<(), SandboxScriptError> {
    let globals = lua.globals();
    for (name, value) in &request.bindings.globals {
        let lua_value = lua
            .to_value(value)
            .map_err(|error| internal_error(format!("failed to convert binding '{name}': {error}")))?;
        globals
            .set(name.as_str(), lua_value)
            .map_err(|error| internal_error(format!("failed to inject binding '{name}': {error}")))?;
    }
    Ok(())
}

fn install_deadline_hook(
    lua: &Lua,
    request: &ScriptExecutionRequest,
    deadline_hit: &Arc<AtomicBool>,
    started: Instant,
) {
    let deadline = started + Duration::from_millis(request.limits.timeout_ms);
    let flag = Arc::clone(deadline_hit);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(request.limits.instruction_check_interval),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                flag.store(true, Ordering::SeqCst);
                Err(mlua::Error::RuntimeError(
                    "script deadline exceeded".to_string(),
                ))
            } else {
                Ok(())
            }
        },
    );
}

fn render_lua_value(lua: &Lua, value: LuaValue) -> mlua::Result<String> {
    match value {
        LuaValue::Nil => Ok("nil".to_string()),
        LuaValue::Boolean(flag) => Ok(flag.to_string()),
        other => match lua.coerce_string(other.clone())? {
            Some(text) => Ok(text.to_str()?.to_string()),
            None => Ok(format!("<{}>", other.type_name())),
        },
    }
}

fn classify_lua_error(error: mlua::Error, deadline_hit: &Arc<AtomicBool>) -> SandboxScriptError {
    if deadline_hit.load(Ordering::SeqCst) {
        return SandboxScriptError::new(
            SANDBOX_REASON_SCRIPT_TIMEOUT,
            "script exceeded its execution deadline",
        );
    }
    match error {
        mlua::Error::SyntaxError { message, .. } => SandboxScriptError::new(
            SANDBOX_REASON_SCRIPT_COMPILE_ERROR,
            strip_chunk_position(&message),
        ),
        mlua::Error::MemoryError(message) => SandboxScriptError::new(
            SANDBOX_REASON_SCRIPT_RESOURCE_EXCEEDED,
            format!("script exceeded its memory limit: {message}"),
        ),
        mlua::Error::RuntimeError(message) => SandboxScriptError::new(
            SANDBOX_REASON_SCRIPT_RUNTIME_ERROR,
            strip_chunk_position(&message),
        ),
        mlua::Error::CallbackError { cause, .. } => {
            classify_lua_error(cause.as_ref().clone(), deadline_hit)
        }
        other => SandboxScriptError::new(SANDBOX_REASON_SCRIPT_RUNTIME_ERROR, other.to_string()),
    }
}

/// Strips the `[string "…"]:N:` position prefix Lua prepends to raised string
/// errors, leaving the script's own payload.
fn strip_chunk_position(message: &str) -> String {
    let trimmed = message.trim();
    if let Some(rest) = trimmed.strip_prefix("[string ") {
        if let Some(close) = rest.find("\"]:") {
            let after_name = &rest[close + 3..];
            if let Some(colon) = after_name.find(": ") {
                let (line, payload) = after_name.split_at(colon);
                if line.chars().all(|character| character.is_ascii_digit()) {
                    return payload[2..].to_string();
                }
            }
        }
    }
    trimmed.to_string()
}

fn internal_error(message: impl Into<String>) -> SandboxScriptError {
    SandboxScriptError::new(SANDBOX_REASON_WORKER_FAILED, message)
}
