/// Python process interpreter
///
/// Every execution is a fresh `python3` child running a small bootstrap that:
/// - reads `{source, inputs, filename}` as JSON from stdin
/// - replaces `input()` so it consumes the recorded inputs in order
/// - when the inputs run out, flushes stdout, writes an input-request
///   sentinel carrying the prompt to stderr and exits with code 75
///
/// A fresh process per run means no interpreter globals survive between
/// sessions. Children are spawned with `kill_on_drop`, so dropping an
/// in-flight `execute` (session reset, timeout) kills the program.
use crate::diagnostics::PROGRAM_NAME;
use crate::interpreter::{Execution, Interpreter, InterpreterError};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit code the bootstrap uses for "blocked on input"
const INPUT_REQUEST_EXIT: i32 = 75;
const INPUT_SENTINEL: &str = "\u{1e}GRADEBOX_INPUT_REQUEST ";

const BOOTSTRAP: &str = r#"
import builtins, json, os, sys
_payload = json.loads(sys.stdin.read())
sys.stdin = open(os.devnull)
_inputs = list(_payload["inputs"])

def _gradebox_input(prompt=""):
    if _inputs:
        return _inputs.pop(0)
    sys.stdout.flush()
    sys.stderr.write("\x1eGRADEBOX_INPUT_REQUEST " + json.dumps(str(prompt)) + "\n")
    sys.stderr.flush()
    os._exit(75)

builtins.input = _gradebox_input
_code = compile(_payload["source"], _payload["filename"], "exec")
del _payload
exec(_code, {"__name__": "__main__", "__builtins__": builtins})
"#;

pub struct PythonInterpreter {
    command: String,
    timeout: Duration,
    ready: AtomicBool,
}

impl PythonInterpreter {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Interpreter for PythonInterpreter {
    async fn initialize(&self) -> Result<(), InterpreterError> {
        let probe = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(InterpreterError::NotReady(format!(
                    "failed to start '{}': {}",
                    self.command, e
                )))
            }
            Err(_) => return Err(InterpreterError::NotReady("startup probe timed out".to_string())),
        };

        if !output.status.success() {
            return Err(InterpreterError::NotReady(format!(
                "'{} --version' exited with {}",
                self.command, output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(command = %self.command, version = %version, "Python interpreter available");
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn reset_state(&self) -> Result<(), InterpreterError> {
        // Nothing is shared between child processes
        debug!("Interpreter state reset (fresh process per run)");
        Ok(())
    }

    #[tracing::instrument(skip(self, source, inputs), fields(inputs = inputs.len()))]
    async fn execute(&self, source: &str, inputs: &[String]) -> Result<Execution, InterpreterError> {
        if !self.is_ready() {
            return Err(InterpreterError::NotReady("interpreter not initialized".to_string()));
        }

        let payload = serde_json::json!({
            "source": source,
            "inputs": inputs,
            "filename": PROGRAM_NAME,
        })
        .to_string();

        let mut child = Command::new(&self.command)
            .arg("-u")
            .arg("-c")
            .arg(BOOTSTRAP)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InterpreterError::Infrastructure(format!("failed to spawn interpreter: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| InterpreterError::Infrastructure("interpreter stdin unavailable".to_string()))?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| InterpreterError::Infrastructure(format!("failed to send program: {}", e)))?;
        drop(stdin);

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(InterpreterError::Infrastructure(format!(
                    "failed to collect interpreter output: {}",
                    e
                )))
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Interpreter run timed out");
                return Err(InterpreterError::Timeout(self.timeout.as_millis() as u64));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Ok(interpret_output(output.status.code(), stdout, stderr))
    }
}

/// Turn exit code and captured streams into an [`Execution`]
fn interpret_output(exit_code: Option<i32>, stdout: String, stderr: String) -> Execution {
    if exit_code == Some(INPUT_REQUEST_EXIT) {
        if let Some((before, prompt)) = split_input_request(&stderr) {
            return Execution {
                stdout,
                stderr: before,
                completed: false,
                waiting_for_input: true,
                input_prompt: Some(prompt),
            };
        }
    }

    Execution {
        completed: exit_code == Some(0),
        stdout,
        stderr,
        waiting_for_input: false,
        input_prompt: None,
    }
}

/// Locate the sentinel line; returns stderr without it and the decoded prompt
fn split_input_request(stderr: &str) -> Option<(String, String)> {
    let start = stderr.rfind(INPUT_SENTINEL)?;
    let rest = &stderr[start + INPUT_SENTINEL.len()..];
    let line = rest.lines().next().unwrap_or("");
    let prompt: String = serde_json::from_str(line).ok()?;
    Some((stderr[..start].to_string(), prompt))
}
