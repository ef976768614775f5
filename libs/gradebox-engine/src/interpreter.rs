//! Embedded interpreter contract.
//!
//! The interpreter has no checkpoint/resume primitive: every `execute` call
//! runs the program from the top, feeding it the ordered list of inputs
//! supplied so far. A program that asks for more input than it was given
//! stops and reports the prompt it was about to show.

use async_trait::async_trait;
use gradebox_common::types::ErrorKind;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Result of one run-from-the-top
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Execution {
    pub stdout: String,
    pub stderr: String,
    /// Program ran to normal termination
    pub completed: bool,
    /// Program blocked on an input request with no recorded input left
    pub waiting_for_input: bool,
    pub input_prompt: Option<String>,
}

impl Execution {
    pub fn completed(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            completed: true,
            ..Default::default()
        }
    }

    pub fn waiting(stdout: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            waiting_for_input: true,
            input_prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn failed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    /// Neither finished nor paused: an uncaught error
    pub fn is_failure(&self) -> bool {
        !self.completed && !self.waiting_for_input
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterpreterError {
    #[error("interpreter is not ready: {0}")]
    NotReady(String),
    #[error("execution timed out after {0} ms")]
    Timeout(u64),
    #[error("interpreter failure: {0}")]
    Infrastructure(String),
}

impl InterpreterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InterpreterError::NotReady(_) => ErrorKind::InterpreterNotReady,
            InterpreterError::Timeout(_) => ErrorKind::InterpreterRuntime,
            InterpreterError::Infrastructure(_) => ErrorKind::InterpreterInfrastructure,
        }
    }
}

#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Expensive one-time start-up
    async fn initialize(&self) -> Result<(), InterpreterError>;

    fn is_ready(&self) -> bool;

    /// Clear interpreter-visible global state left by a previous run
    async fn reset_state(&self) -> Result<(), InterpreterError> {
        Ok(())
    }

    async fn execute(&self, source: &str, inputs: &[String]) -> Result<Execution, InterpreterError>;
}

/// Process-wide handle to the single interpreter instance
///
/// Cloned into every session. Initialization is lazy and happens at most
/// once successfully; concurrent callers wait on the same attempt.
#[derive(Clone)]
pub struct SharedInterpreter {
    inner: Arc<dyn Interpreter>,
    init_lock: Arc<Mutex<()>>,
}

impl SharedInterpreter {
    pub fn new<I: Interpreter + 'static>(interpreter: I) -> Self {
        Self::from_arc(Arc::new(interpreter))
    }

    pub fn from_arc(inner: Arc<dyn Interpreter>) -> Self {
        Self {
            inner,
            init_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    pub async fn ensure_ready(&self) -> Result<(), InterpreterError> {
        if self.inner.is_ready() {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.inner.is_ready() {
            return Ok(());
        }

        debug!("Initializing interpreter");
        self.inner.initialize().await?;
        info!("Interpreter ready");
        Ok(())
    }

    pub async fn reset_state(&self) -> Result<(), InterpreterError> {
        self.inner.reset_state().await
    }

    pub async fn execute(&self, source: &str, inputs: &[String]) -> Result<Execution, InterpreterError> {
        self.inner.execute(source, inputs).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_ensure_ready_initializes_once() {
        let fake = Arc::new(ScriptedInterpreter::new(vec![]));
        let shared = SharedInterpreter::from_arc(fake.clone());

        assert!(!shared.is_ready());
        shared.ensure_ready().await.unwrap();
        shared.ensure_ready().await.unwrap();
        shared.clone().ensure_ready().await.unwrap();

        assert!(shared.is_ready());
        assert_eq!(fake.init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_ready_surfaces_not_ready() {
        let shared = SharedInterpreter::new(ScriptedInterpreter::new(vec![]).failing_init(1));
        let err = shared.ensure_ready().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterpreterNotReady);
        shared.ensure_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_scripted_replay_consumes_inputs_in_order() {
        let fake = ScriptedInterpreter::new(vec![
            Step::Ask("a? ".to_string()),
            Step::PrintLastInput,
            Step::Ask("b? ".to_string()),
            Step::PrintLastInput,
        ]);

        let first = fake.execute("", &[]).await.unwrap();
        assert_eq!(first, Execution::waiting("", "a? "));

        let second = fake.execute("", &["1".to_string()]).await.unwrap();
        assert_eq!(second, Execution::waiting("1\n", "b? "));

        let third = fake.execute("", &["1".to_string(), "2".to_string()]).await.unwrap();
        assert_eq!(third, Execution::completed("1\n2\n"));
    }
}
