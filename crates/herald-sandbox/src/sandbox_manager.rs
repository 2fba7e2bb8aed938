use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{RwLock, Semaphore};

use crate::sandbox_contract::{
    SandboxLimits, SandboxScriptError, ScriptBindings, ScriptExecutionReport,
    ScriptExecutionRequest, SANDBOX_REASON_UNAVAILABLE, SANDBOX_REASON_WORKER_FAILED,
};
use crate::script_executor::execute_script_sync;

pub const SANDBOX_MAX_CONCURRENT_DEFAULT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `SandboxState` values.
pub enum SandboxState {
    Stopped,
    Starting,
    Running,
    Degraded,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Configuration for the sandbox manager.
pub struct SandboxManagerConfig {
    pub limits: SandboxLimits,
    pub max_concurrent_executions: usize,
}

impl Default for SandboxManagerConfig {
    fn default() -> Self {
        Self {
            limits: SandboxLimits::default(),
            max_concurrent_executions: SANDBOX_MAX_CONCURRENT_DEFAULT,
        }
    }
}

/// Owns the pool of isolated script-execution contexts. Callers submit
/// source text and receive a report or a reason-coded error; sandbox
/// instances themselves are never exposed.
pub struct SandboxManager {
    config: SandboxManagerConfig,
    state: Mutex<SandboxState>,
    run_slots: Semaphore,
    tenant_slots: Mutex<BTreeMap<String, Arc<Semaphore>>>,
    // Executions hold a read guard; `stop` takes the write side to drain.
    drain: RwLock<()>,
}

impl SandboxManager {
    pub fn new(config: SandboxManagerConfig) -> Self {
        let max_concurrent = config.max_concurrent_executions.max(1);
        Self {
            config,
            state: Mutex::new(SandboxState::Stopped),
            run_slots: Semaphore::new(max_concurrent),
            tenant_slots: Mutex::new(BTreeMap::new()),
            drain: RwLock::new(()),
        }
    }

    pub fn state(&self) -> SandboxState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(SandboxState::Degraded)
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.config.limits
    }

    /// Provisions the isolated execution context and transitions to
    /// `Running`. A provisioning failure leaves the manager `Stopped` and
    /// must be treated as fatal by the caller: running untrusted script
    /// without isolation is a security violation, not a degraded mode.
    pub fn start(&self) -> Result<(), SandboxScriptError> {
        self.transition(SandboxState::Stopped, SandboxState::Starting)?;

        let probe = ScriptExecutionRequest {
            source: "return 1 + 1".to_string(),
            bindings: ScriptBindings::default(),
            limits: SandboxLimits {
                timeout_ms: 1_000,
                ..self.config.limits.clone()
            },
        };
        match execute_script_sync(probe) {
            Ok(report) if report.output.as_deref() == Some("2") => {
                self.set_state(SandboxState::Running);
                tracing::info!(
                    max_concurrent = self.config.max_concurrent_executions,
                    timeout_ms = self.config.limits.timeout_ms,
                    "sandbox manager running"
                );
                Ok(())
            }
            Ok(report) => {
                self.set_state(SandboxState::Stopped);
                Err(SandboxScriptError::new(
                    SANDBOX_REASON_WORKER_FAILED,
                    format!("sandbox probe returned unexpected output {:?}", report.output),
                ))
            }
            Err(error) => {
                self.set_state(SandboxState::Stopped);
                Err(SandboxScriptError::new(
                    SANDBOX_REASON_WORKER_FAILED,
                    format!("sandbox probe failed: {error}"),
                ))
            }
        }
    }

    /// Executes `source` with only the supplied bindings visible. Fairness:
    /// a global concurrency cap bounds the pool, and a per-tenant
    /// single-flight permit keeps one tenant's long script from starving
    /// another tenant's submissions.
    pub async fn run_script(
        &self,
        tenant_id: &str,
        source: &str,
        bindings: ScriptBindings,
    ) -> Result<ScriptExecutionReport, SandboxScriptError> {
        self.ensure_running()?;

        let tenant_slot = self.tenant_slot(tenant_id)?;
        let _tenant_permit = tenant_slot
            .acquire_owned()
            .await
            .map_err(|_| self.unavailable_error())?;
        let _run_permit = self
            .run_slots
            .acquire()
            .await
            .map_err(|_| self.unavailable_error())?;
        let _in_flight = self.drain.read().await;
        // Re-check: a stop may have raced the permit acquisition.
        self.ensure_running()?;

        let request = ScriptExecutionRequest {
            source: source.to_string(),
            bindings,
            limits: self.config.limits.clone(),
        };
        let joined = tokio::task::spawn_blocking(move || execute_script_sync(request)).await;
        match joined {
            Ok(result) => result,
            Err(error) => {
                // A panicked execution task is an internal fault; degrade
                // rather than crash the host.
                self.set_state(SandboxState::Degraded);
                tracing::error!(%error, "sandbox execution task failed; manager degraded");
                Err(SandboxScriptError::new(
                    SANDBOX_REASON_UNAVAILABLE,
                    "sandbox degraded after an internal execution fault",
                ))
            }
        }
    }

    /// Tears down the pool. In-flight executions are drained before this
    /// returns; new submissions are rejected as soon as the state flips.
    pub async fn stop(&self) {
        self.set_state(SandboxState::Stopped);
        let _drained = self.drain.write().await;
        let mut tenant_slots = self
            .tenant_slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tenant_slots.clear();
        tracing::info!("sandbox manager stopped");
    }

    fn ensure_running(&self) -> Result<(), SandboxScriptError> {
        let state = self.state();
        if state == SandboxState::Running {
            return Ok(());
        }
        Err(SandboxScriptError::new(
            SANDBOX_REASON_UNAVAILABLE,
            format!("sandbox is {}; script submissions are rejected", state.as_str()),
        ))
    }

    fn unavailable_error(&self) -> SandboxScriptError {
        SandboxScriptError::new(
            SANDBOX_REASON_UNAVAILABLE,
            format!(
                "sandbox is {}; script submissions are rejected",
                self.state().as_str()
            ),
        )
    }

    fn tenant_slot(&self, tenant_id: &str) -> Result<Arc<Semaphore>, SandboxScriptError> {
        let mut tenant_slots = self
            .tenant_slots
            .lock()
            .map_err(|_| self.unavailable_error())?;
        Ok(Arc::clone(
            tenant_slots
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        ))
    }

    fn transition(
        &self,
        expected: SandboxState,
        next: SandboxState,
    ) -> Result<(), SandboxScriptError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| self.unavailable_error())?;
        if *state != expected {
            return Err(SandboxScriptError::new(
                SANDBOX_REASON_UNAVAILABLE,
                format!(
                    "sandbox cannot move to {} while {}",
                    next.as_str(),
                    state.as_str()
                ),
            ));
        }
        *state = next;
        Ok(())
    }

    fn set_state(&self, next: SandboxState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }
}
