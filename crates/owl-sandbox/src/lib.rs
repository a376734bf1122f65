//! Time-bounded execution of dynamic snippets.
//!
//! A snippet is parsed up front, so forbidden constructs never run. It then
//! executes on a blocking worker thread with its inputs copied in; the final
//! namespace is copied out. Every run has a wall-clock budget enforced from
//! both sides: the caller stops waiting and cancels, and the interpreter
//! checks the cancellation token and its own deadline as it steps.

pub mod script;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use owl_core::config::SandboxConfig;
use owl_core::error::SandboxFault;
use owl_core::types::FieldMap;

use script::{Interpreter, Limits, ScriptValue};

/// Lifecycle of one snippet run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Idle,
    Running,
    Completed,
    TimedOut,
    Faulted,
}

impl SandboxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Faulted)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Move to `next` unless a terminal state was already reached.
fn transition(tx: &watch::Sender<SandboxState>, next: SandboxState) {
    tx.send_if_modified(|state| {
        if state.is_terminal() {
            false
        } else {
            *state = next;
            true
        }
    });
}

/// Runs snippets under the configured limits and default timeout.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn limits(&self) -> Limits {
        Limits {
            max_string_len: self.config.max_string_len,
            max_collection_len: self.config.max_collection_len,
            max_alloc_bytes: self.config.max_alloc_bytes,
        }
    }

    /// Parse a snippet without running it.
    pub fn check(&self, source: &str) -> Result<(), SandboxFault> {
        script::parse(source)
            .map(|_| ())
            .map_err(|e| e.into_fault(self.config.timeout_ms))
    }

    /// Start a snippet on a blocking worker. Syntax errors are returned here.
    /// A security violation is found at parse time too, but is reported
    /// through a handle that is already `Faulted`, so no code ever runs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        &self,
        source: &str,
        inputs: &FieldMap,
        timeout: Option<Duration>,
    ) -> Result<SandboxHandle, SandboxFault> {
        let budget = timeout.unwrap_or_else(|| self.default_timeout());
        let budget_ms = budget.as_millis() as u64;
        let program = match script::parse(source) {
            Ok(program) => program,
            Err(e) => match e.into_fault(budget_ms) {
                fault @ SandboxFault::SecurityViolation(_) => {
                    warn!(%fault, "Sandbox snippet rejected");
                    return Ok(SandboxHandle::rejected(fault, budget));
                }
                fault => return Err(fault),
            },
        };

        let vars: BTreeMap<String, ScriptValue> = inputs
            .iter()
            .map(|(k, v)| (k.clone(), ScriptValue::from_json(v)))
            .collect();

        let (tx, rx) = watch::channel(SandboxState::Idle);
        let tx = Arc::new(tx);
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + budget;
        let limits = self.limits();

        let worker_tx = Arc::clone(&tx);
        let worker_cancel = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            transition(&worker_tx, SandboxState::Running);
            let result = Interpreter::new(vars, limits, worker_cancel, deadline)
                .run(&program)
                .map_err(|e| e.into_fault(budget_ms))
                .and_then(export);

            let next = match &result {
                Ok(_) => SandboxState::Completed,
                Err(SandboxFault::TimedOut { .. }) => SandboxState::TimedOut,
                Err(_) => SandboxState::Faulted,
            };
            transition(&worker_tx, next);
            result
        });

        debug!(budget_ms, "Sandbox snippet started");
        Ok(SandboxHandle {
            tx,
            rx,
            task,
            cancel,
            budget,
        })
    }

    /// Run a snippet to completion and return its final namespace.
    pub async fn execute(
        &self,
        source: &str,
        inputs: &FieldMap,
        timeout: Option<Duration>,
    ) -> Result<FieldMap, SandboxFault> {
        self.spawn(source, inputs, timeout)?.wait().await
    }
}

fn export(vars: BTreeMap<String, ScriptValue>) -> Result<FieldMap, SandboxFault> {
    vars.into_iter()
        .map(|(name, value)| {
            value
                .to_json()
                .map(|json| (name.clone(), json))
                .map_err(|e| SandboxFault::Faulted(format!("variable '{}': {}", name, e)))
        })
        .collect()
}

/// A running snippet. Dropping the handle cancels the run.
pub struct SandboxHandle {
    tx: Arc<watch::Sender<SandboxState>>,
    rx: watch::Receiver<SandboxState>,
    task: JoinHandle<Result<FieldMap, SandboxFault>>,
    cancel: CancellationToken,
    budget: Duration,
}

impl SandboxHandle {
    /// A handle for a snippet refused before it started.
    fn rejected(fault: SandboxFault, budget: Duration) -> Self {
        let (tx, rx) = watch::channel(SandboxState::Running);
        transition(&tx, SandboxState::Faulted);
        Self {
            tx: Arc::new(tx),
            rx,
            task: tokio::spawn(async move { Err(fault) }),
            cancel: CancellationToken::new(),
            budget,
        }
    }

    pub fn state(&self) -> SandboxState {
        *self.rx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<SandboxState> {
        self.rx.clone()
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Wait for the snippet, up to its budget.
    pub async fn wait(mut self) -> Result<FieldMap, SandboxFault> {
        let budget_ms = self.budget.as_millis() as u64;
        match tokio::time::timeout(self.budget, &mut self.task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                transition(&self.tx, SandboxState::Faulted);
                Err(SandboxFault::Faulted(format!("snippet worker failed: {}", e)))
            }
            Err(_) => {
                self.cancel.cancel();
                transition(&self.tx, SandboxState::TimedOut);
                warn!(budget_ms, "Sandbox snippet timed out");
                Err(SandboxFault::TimedOut { budget_ms })
            }
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owl_core::types::field_map;
    use serde_json::json;

    #[tokio::test]
    async fn adds_one_to_input() {
        let sandbox = Sandbox::default();
        let out = sandbox
            .execute("result = x + 1", &field_map([("x", json!(5))]), None)
            .await
            .unwrap();
        assert_eq!(out["result"], json!(6));
        assert_eq!(out["x"], json!(5));
    }

    #[tokio::test]
    async fn import_is_a_security_violation() {
        let sandbox = Sandbox::default();
        let err = sandbox
            .execute("import os", &FieldMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFault::SecurityViolation(_)));
    }

    #[tokio::test]
    async fn security_violation_handle_is_faulted() {
        let sandbox = Sandbox::default();
        let handle = sandbox
            .spawn("import os", &FieldMap::new(), None)
            .unwrap();
        assert_eq!(handle.state(), SandboxState::Faulted);

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, SandboxFault::SecurityViolation(_)));
    }

    #[tokio::test]
    async fn syntax_error_is_returned_by_spawn() {
        let sandbox = Sandbox::default();
        let err = sandbox.spawn("x = (", &FieldMap::new(), None).err().unwrap();
        assert!(matches!(err, SandboxFault::Faulted(_)));
    }

    #[tokio::test]
    async fn builtin_escape_hatches_are_rejected() {
        let sandbox = Sandbox::default();
        for src in [
            "open('/etc/passwd')",
            "x = __import__('os')",
            "eval('1 + 1')",
            "x = ''.__class__",
        ] {
            let err = sandbox.check(src).unwrap_err();
            assert!(
                matches!(err, SandboxFault::SecurityViolation(_)),
                "{} should be rejected, got {:?}",
                src,
                err
            );
        }
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let sandbox = Sandbox::default();
        let handle = sandbox
            .spawn(
                "while True:\n    pass\n",
                &FieldMap::new(),
                Some(Duration::from_millis(100)),
            )
            .unwrap();
        let rx = handle.subscribe();

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err, SandboxFault::TimedOut { budget_ms: 100 });
        assert_eq!(*rx.borrow(), SandboxState::TimedOut);
    }

    #[tokio::test]
    async fn runtime_error_faults() {
        let sandbox = Sandbox::default();
        let handle = sandbox
            .spawn("y = x / 0", &field_map([("x", json!(1))]), None)
            .unwrap();
        let rx = handle.subscribe();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, SandboxFault::Faulted(ref msg) if msg.contains("division by zero")));
        assert_eq!(*rx.borrow(), SandboxState::Faulted);
    }

    #[tokio::test]
    async fn completed_state_is_observable() {
        let sandbox = Sandbox::default();
        let handle = sandbox
            .spawn("words = len(text.split())", &field_map([("text", json!("a b c"))]), None)
            .unwrap();
        let rx = handle.subscribe();

        let out = handle.wait().await.unwrap();
        assert_eq!(out["words"], json!(3));
        assert_eq!(*rx.borrow(), SandboxState::Completed);
    }

    #[tokio::test]
    async fn non_finite_result_faults() {
        let sandbox = Sandbox::default();
        let err = sandbox
            .execute("x = float('inf')", &FieldMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFault::Faulted(_)));
    }

    #[tokio::test]
    async fn limits_follow_config() {
        let sandbox = Sandbox::new(SandboxConfig {
            max_collection_len: 10,
            ..SandboxConfig::default()
        });
        let err = sandbox
            .execute("xs = list(range(11))", &FieldMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFault::Faulted(ref msg) if msg.contains("resource limit")));

        let sandbox = Sandbox::new(SandboxConfig {
            max_alloc_bytes: 1024,
            ..SandboxConfig::default()
        });
        let err = sandbox
            .execute("s = 'x' * 2000", &FieldMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFault::Faulted(ref msg) if msg.contains("allocated")));
    }

    #[test]
    fn state_display() {
        assert_eq!(SandboxState::TimedOut.to_string(), "timed_out");
        assert!(SandboxState::Faulted.is_terminal());
        assert!(!SandboxState::Running.is_terminal());
    }
}
