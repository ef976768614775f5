/// Interactive Session Manager
///
/// Owns one suspendable execution of a learner program against the shared
/// interpreter.
///
/// **State machine:**
/// ```text
/// Idle -> Running -> { WaitingForInput <-> Running } -> { Completed | Failed }
/// ```
/// `reset()` is valid from anywhere and returns the session to Idle; a run
/// or resume interrupted by it reports `Aborted` to its caller.
///
/// **Resume by replay:**
/// The interpreter cannot checkpoint, so supplying input re-executes the
/// whole program with every input recorded so far. Output already shown is
/// suppressed and only the new tail is appended. Programs whose output
/// depends on randomness or external state may diverge on replay; the
/// session flags that in the transcript instead of hiding it.
///
/// **Stale responses:**
/// Every run and reset bumps an epoch. A response that arrives for an older
/// epoch is dropped, and the in-flight call itself is cancelled on reset.
use crate::classifier::{to_fragment, OutputFragment, RawOutputEvent};
use crate::diagnostics::{clean_error, PROGRAM_NAME};
use crate::interpreter::{Execution, InterpreterError, SharedInterpreter};
use crate::scaffold::{wrap, ScaffoldMapping};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const COMPLETED_MESSAGE: &str = "Program completed.";
pub const LOADING_MESSAGE: &str = "Interpreter is still loading, retrying...";
pub const DIVERGED_MESSAGE: &str =
    "Note: output changed when the program was replayed; it may depend on randomness or external state.";

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    WaitingForInput,
    Completed,
    Failed,
    /// Outcome of a run or resume that a reset interrupted
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is not waiting for input (state: {0:?})")]
    NotWaitingForInput(SessionState),
    #[error("session has finished ({0:?}); run it again to continue")]
    Terminal(SessionState),
}

/// Receives every classified fragment as it is appended
///
/// Called with the session lock held, so implementations must not call back
/// into the session.
pub trait OutputSink: Send + Sync {
    fn emit(&self, fragment: &OutputFragment);
}

impl<F> OutputSink for F
where
    F: Fn(&OutputFragment) + Send + Sync,
{
    fn emit(&self, fragment: &OutputFragment) {
        self(fragment)
    }
}

impl OutputSink for mpsc::UnboundedSender<OutputFragment> {
    fn emit(&self, fragment: &OutputFragment) {
        // A dropped receiver just stops listening
        let _ = self.send(fragment.clone());
    }
}

/// Point-in-time copy of a session for rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub output: Vec<OutputFragment>,
    pub pending_input: bool,
    pub pending_prompt: Option<String>,
    pub line_offset: usize,
    pub inputs_supplied: usize,
}

struct Inner {
    state: SessionState,
    epoch: u64,
    output: Vec<OutputFragment>,
    inputs: Vec<String>,
    pending_prompt: Option<String>,
    combined: String,
    mapping: ScaffoldMapping,
    /// Program stdout already appended to the transcript
    shown_stdout: String,
    cancel: CancellationToken,
    /// Last run, reset or appended fragment
    touched: Instant,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            epoch: 0,
            output: Vec::new(),
            inputs: Vec::new(),
            pending_prompt: None,
            combined: String::new(),
            mapping: ScaffoldMapping::default(),
            shown_stdout: String::new(),
            cancel: CancellationToken::new(),
            touched: Instant::now(),
        }
    }

    /// Start a new epoch, cancelling whatever the previous one had in flight
    fn next_epoch(&mut self) -> (u64, CancellationToken) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.epoch += 1;
        self.output.clear();
        self.inputs.clear();
        self.pending_prompt = None;
        self.shown_stdout.clear();
        self.touched = Instant::now();
        (self.epoch, self.cancel.clone())
    }
}

pub struct SessionManager {
    id: Uuid,
    interpreter: SharedInterpreter,
    retry_delay: Duration,
    inner: Mutex<Inner>,
    sinks: Mutex<Vec<Box<dyn OutputSink>>>,
}

impl SessionManager {
    pub fn new(interpreter: SharedInterpreter) -> Self {
        Self {
            id: Uuid::new_v4(),
            interpreter,
            retry_delay: DEFAULT_RETRY_DELAY,
            inner: Mutex::new(Inner::new()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Pause before the single automatic readiness retry
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Time since the session last did anything visible
    pub fn idle_for(&self) -> Duration {
        self.lock().touched.elapsed()
    }

    pub fn output(&self) -> Vec<OutputFragment> {
        self.lock().output.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            session_id: self.id,
            state: inner.state,
            output: inner.output.clone(),
            pending_input: inner.state == SessionState::WaitingForInput,
            pending_prompt: inner.pending_prompt.clone(),
            line_offset: inner.mapping.body_line_offset,
            inputs_supplied: inner.inputs.len(),
        }
    }

    /// Register a callback invoked once per appended fragment
    pub fn on_output<F>(&self, callback: F)
    where
        F: Fn(&OutputFragment) + Send + Sync + 'static,
    {
        self.add_sink(Box::new(callback));
    }

    /// Stream of fragments in append order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<OutputFragment> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_sink(Box::new(tx));
        rx
    }

    fn add_sink(&self, sink: Box<dyn OutputSink>) {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).push(sink);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append under the caller's lock so fragments keep interpreter order
    fn append(&self, inner: &mut Inner, event: RawOutputEvent) {
        let fragment = to_fragment(event);
        debug!(session_id = %self.id, epoch = inner.epoch, fragment = %fragment, "Output");
        {
            let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
            for sink in sinks.iter() {
                sink.emit(&fragment);
            }
        }
        inner.output.push(fragment);
        inner.touched = Instant::now();
    }

    /// Start the program from scratch, discarding any previous run
    #[tracing::instrument(skip_all, fields(session_id = %self.id))]
    pub async fn run(&self, header: &str, body: &str, footer: &str) -> SessionState {
        let (combined, mapping) = wrap(header, body, footer);

        let (epoch, token) = {
            let mut inner = self.lock();
            let (epoch, token) = inner.next_epoch();
            inner.state = SessionState::Running;
            inner.combined = combined.clone();
            inner.mapping = mapping;
            (epoch, token)
        };

        info!(
            epoch,
            body_line_offset = mapping.body_line_offset,
            source_size = combined.len(),
            "Session run started"
        );

        if let Err(outcome) = self.ensure_interpreter(epoch, &token).await {
            return outcome;
        }

        let reset = tokio::select! {
            _ = token.cancelled() => return SessionState::Aborted,
            result = self.interpreter.reset_state() => result,
        };
        if let Err(e) = reset {
            return self.fail(epoch, format!("Could not reset interpreter: {}", e));
        }

        self.drive(epoch, &token, &combined, Vec::new()).await
    }

    /// Answer the pending input request and continue the program
    #[tracing::instrument(skip_all, fields(session_id = %self.id))]
    pub async fn supply_input(&self, text: &str) -> Result<SessionState, SessionError> {
        let (epoch, token, combined, inputs) = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::WaitingForInput => {}
                state if state.is_terminal() => return Err(SessionError::Terminal(state)),
                state => return Err(SessionError::NotWaitingForInput(state)),
            }

            inner.pending_prompt = None;
            inner.inputs.push(text.to_string());
            inner.state = SessionState::Running;
            self.append(&mut inner, RawOutputEvent::echo(text));

            (
                inner.epoch,
                inner.cancel.clone(),
                inner.combined.clone(),
                inner.inputs.clone(),
            )
        };

        debug!(epoch, inputs = inputs.len(), "Replaying with recorded inputs");
        Ok(self.drive(epoch, &token, &combined, inputs).await)
    }

    /// Discard everything, cancelling any in-flight call. Safe at any time.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        inner.next_epoch();
        inner.state = SessionState::Idle;
        inner.combined.clear();
        inner.mapping = ScaffoldMapping::default();
        info!(session_id = %self.id, epoch = inner.epoch, previous = ?previous, "Session reset");
    }

    /// Make sure the interpreter is up, retrying once if it is still loading
    async fn ensure_interpreter(&self, epoch: u64, token: &CancellationToken) -> Result<(), SessionState> {
        let first = tokio::select! {
            _ = token.cancelled() => return Err(SessionState::Aborted),
            result = self.interpreter.ensure_ready() => result,
        };

        match first {
            Ok(()) => return Ok(()),
            Err(InterpreterError::NotReady(reason)) => {
                warn!(session_id = %self.id, reason = %reason, "Interpreter not ready, retrying once");
                if !self.append_if_current(epoch, RawOutputEvent::system(LOADING_MESSAGE)) {
                    return Err(SessionState::Aborted);
                }
            }
            Err(e) => return Err(self.fail(epoch, format!("Interpreter unavailable: {}", e))),
        }

        let second = tokio::select! {
            _ = token.cancelled() => return Err(SessionState::Aborted),
            result = async {
                tokio::time::sleep(self.retry_delay).await;
                self.interpreter.ensure_ready().await
            } => result,
        };

        second.map_err(|e| self.fail(epoch, format!("Interpreter unavailable: {}", e)))
    }

    fn append_if_current(&self, epoch: u64, event: RawOutputEvent) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        self.append(&mut inner, event);
        true
    }

    /// Terminal failure with a system message, unless the epoch moved on
    fn fail(&self, epoch: u64, message: String) -> SessionState {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return SessionState::Aborted;
        }
        warn!(session_id = %self.id, epoch, message = %message, "Session failed");
        self.append(&mut inner, RawOutputEvent::system(message));
        inner.state = SessionState::Failed;
        SessionState::Failed
    }

    /// Execute once and fold the outcome into the transcript
    async fn drive(
        &self,
        epoch: u64,
        token: &CancellationToken,
        combined: &str,
        inputs: Vec<String>,
    ) -> SessionState {
        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!(session_id = %self.id, epoch, "In-flight execution cancelled");
                return SessionState::Aborted;
            }
            result = self.interpreter.execute(combined, &inputs) => result,
        };

        let mut inner = self.lock();
        if inner.epoch != epoch {
            warn!(
                session_id = %self.id,
                stale_epoch = epoch,
                current_epoch = inner.epoch,
                "Discarding stale interpreter response"
            );
            return SessionState::Aborted;
        }

        let execution = match result {
            Ok(execution) => execution,
            Err(e) => {
                drop(inner);
                let message = match e {
                    InterpreterError::Timeout(ms) => format!("Execution timed out after {} ms", ms),
                    other => format!("Interpreter error: {}", other),
                };
                return self.fail(epoch, message);
            }
        };

        self.apply(&mut inner, execution)
    }

    fn apply(&self, inner: &mut Inner, execution: Execution) -> SessionState {
        let (tail, diverged) = output_tail(&inner.shown_stdout, &execution.stdout);
        if diverged {
            warn!(session_id = %self.id, epoch = inner.epoch, "Program output diverged on replay");
            self.append(inner, RawOutputEvent::system(DIVERGED_MESSAGE));
        }
        if !tail.is_empty() {
            let text = strip_one_newline(&tail).to_string();
            self.append(inner, RawOutputEvent::stdout(text));
        }
        inner.shown_stdout = execution.stdout.clone();

        if execution.waiting_for_input {
            let prompt = execution.input_prompt.unwrap_or_default();
            self.append(inner, RawOutputEvent::prompt(prompt.clone()));
            inner.pending_prompt = Some(prompt);
            inner.state = SessionState::WaitingForInput;
            debug!(session_id = %self.id, inputs = inner.inputs.len(), "Waiting for input");
        } else if execution.completed {
            let warnings = execution.stderr.trim();
            if !warnings.is_empty() {
                self.append(inner, RawOutputEvent::stderr(warnings));
            }
            self.append(inner, RawOutputEvent::system(COMPLETED_MESSAGE));
            inner.state = SessionState::Completed;
            info!(session_id = %self.id, inputs = inner.inputs.len(), "Session completed");
        } else {
            let cleaned = clean_error(&execution.stderr, &inner.mapping, PROGRAM_NAME);
            self.append(inner, RawOutputEvent::system(cleaned.to_string()));
            inner.state = SessionState::Failed;
            info!(session_id = %self.id, error = %cleaned, "Session failed");
        }

        inner.state
    }
}

/// New stdout since the last shown prefix; `true` when the replay diverged
fn output_tail(shown: &str, stdout: &str) -> (String, bool) {
    if let Some(tail) = stdout.strip_prefix(shown) {
        return (tail.to_string(), false);
    }

    let common = shown
        .char_indices()
        .zip(stdout.chars())
        .find(|((_, a), b)| a != b)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| shown.len().min(stdout.len()));
    (stdout[common..].to_string(), true)
}

fn strip_one_newline(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::OutputKind;
    use crate::interpreter::testing::{ScriptedInterpreter, Step};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn session_for(steps: Vec<Step>) -> (Arc<SessionManager>, Arc<ScriptedInterpreter>) {
        let fake = Arc::new(ScriptedInterpreter::new(steps));
        let session = SessionManager::new(SharedInterpreter::from_arc(fake.clone()))
            .with_retry_delay(Duration::from_millis(10));
        (Arc::new(session), fake)
    }

    fn frag(kind: OutputKind, text: &str) -> OutputFragment {
        OutputFragment::new(kind, text)
    }

    #[tokio::test]
    async fn test_program_without_input_completes() {
        let (session, _) = session_for(vec![Step::Print("hi".to_string())]);

        let state = session.run("", "print('hi')", "").await;

        assert_eq!(state, SessionState::Completed);
        assert_eq!(
            session.output(),
            vec![
                frag(OutputKind::ProgramOutput, "hi"),
                frag(OutputKind::SystemMessage, COMPLETED_MESSAGE),
            ]
        );
        assert!(!session.output().iter().any(|f| f.is_prompt()));
    }

    #[tokio::test]
    async fn test_print_input_transcript() {
        let (session, _) = session_for(vec![Step::Ask(String::new()), Step::PrintLastInput]);

        let state = session.run("", "print(input())", "").await;
        assert_eq!(state, SessionState::WaitingForInput);
        assert_eq!(session.snapshot().pending_prompt.as_deref(), Some(""));

        let state = session.supply_input("hello").await.unwrap();
        assert_eq!(state, SessionState::Completed);
        assert_eq!(
            session.output(),
            vec![
                frag(OutputKind::InputPrompt, ""),
                frag(OutputKind::InputEcho, "hello"),
                frag(OutputKind::ProgramOutput, "hello"),
                frag(OutputKind::SystemMessage, COMPLETED_MESSAGE),
            ]
        );
    }

    #[tokio::test]
    async fn test_k_prompts_each_followed_by_echo() {
        let (session, fake) = session_for(vec![
            Step::Print("start".to_string()),
            Step::Ask("a? ".to_string()),
            Step::Ask("b? ".to_string()),
            Step::Ask("c? ".to_string()),
            Step::PrintLastInput,
        ]);

        session.run("", "...", "").await;
        for answer in ["1", "2", "3"] {
            session.supply_input(answer).await.unwrap();
        }
        assert_eq!(session.state(), SessionState::Completed);

        let output = session.output();
        let prompts: Vec<usize> = output
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_prompt())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(prompts.len(), 3);
        for (i, answer) in prompts.iter().zip(["1", "2", "3"]) {
            assert_eq!(output[i + 1], frag(OutputKind::InputEcho, answer));
        }

        // replays never repeat already-shown output
        let starts = output.iter().filter(|f| f.text == "start").count();
        assert_eq!(starts, 1);
        assert_eq!(fake.exec_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_error_line_remapped_through_header() {
        let traceback = "Traceback (most recent call last):\n  File \"<learner>\", line 3, in <module>\nNameError: name 'y' is not defined\n";
        let (session, _) = session_for(vec![Step::Raise(traceback.to_string())]);

        let state = session.run("a = 1\nb = 2", "print(y)", "").await;

        assert_eq!(state, SessionState::Failed);
        assert_eq!(
            session.output().last(),
            Some(&frag(
                OutputKind::SystemMessage,
                "NameError: name 'y' is not defined on line 1"
            ))
        );
    }

    #[tokio::test]
    async fn test_supply_input_rejected_outside_waiting() {
        let (session, _) = session_for(vec![]);
        assert_eq!(
            session.supply_input("x").await,
            Err(SessionError::NotWaitingForInput(SessionState::Idle))
        );

        session.run("", "", "").await;
        assert_eq!(
            session.supply_input("x").await,
            Err(SessionError::Terminal(SessionState::Completed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_during_execution_discards_result() {
        let fake = Arc::new(
            ScriptedInterpreter::new(vec![Step::Print("late".to_string())])
                .with_delay(Duration::from_secs(5)),
        );
        let session = Arc::new(SessionManager::new(SharedInterpreter::from_arc(fake.clone())));

        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.run("", "print('late')", "").await })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(session.state(), SessionState::Running);

        session.reset();

        assert_eq!(running.await.unwrap(), SessionState::Aborted);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.output().is_empty());
        assert_eq!(fake.exec_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_from_every_state_returns_to_idle() {
        let (session, _) = session_for(vec![Step::Ask("?".to_string())]);

        session.reset();
        assert_eq!(session.state(), SessionState::Idle);

        session.run("", "", "").await;
        assert_eq!(session.state(), SessionState::WaitingForInput);
        session.reset();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.output().is_empty());
        assert!(session.snapshot().pending_prompt.is_none());

        session.run("", "", "").await;
        session.supply_input("x").await.unwrap();
        assert_eq!(session.state(), SessionState::Completed);
        session.reset();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.output().is_empty());
    }

    #[tokio::test]
    async fn test_new_run_replaces_previous_log() {
        let (session, fake) = session_for(vec![Step::Print("once".to_string())]);
        session.run("", "", "").await;
        session.run("", "", "").await;

        assert_eq!(session.output().len(), 2);
        assert_eq!(fake.reset_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_is_retried_once() {
        let fake = Arc::new(ScriptedInterpreter::new(vec![]).failing_init(1));
        let session = SessionManager::new(SharedInterpreter::from_arc(fake.clone()));

        let state = session.run("", "", "").await;

        assert_eq!(state, SessionState::Completed);
        assert_eq!(session.output()[0], frag(OutputKind::SystemMessage, LOADING_MESSAGE));
        assert_eq!(fake.init_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_twice_fails() {
        let fake = Arc::new(ScriptedInterpreter::new(vec![]).failing_init(2));
        let session = SessionManager::new(SharedInterpreter::from_arc(fake.clone()));

        let state = session.run("", "", "").await;

        assert_eq!(state, SessionState::Failed);
        assert_eq!(fake.init_calls.load(Ordering::SeqCst), 2);
        let last = session.output().pop().unwrap();
        assert!(last.text.starts_with("Interpreter unavailable"));
    }

    #[tokio::test]
    async fn test_subscribers_see_fragments_in_order() {
        let (session, _) = session_for(vec![
            Step::Print("one".to_string()),
            Step::Ask("name? ".to_string()),
            Step::PrintLastInput,
        ]);
        let mut rx = session.subscribe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            session.on_output(move |f: &OutputFragment| seen.lock().unwrap().push(f.kind));
        }

        session.run("", "", "").await;
        session.supply_input("bob").await.unwrap();

        let mut streamed = Vec::new();
        while let Ok(fragment) = rx.try_recv() {
            streamed.push(fragment);
        }
        assert_eq!(streamed, session.output());
        let kinds: Vec<OutputKind> = streamed.iter().map(|f| f.kind).collect();
        assert_eq!(*seen.lock().unwrap(), kinds);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_restarts_on_activity() {
        let (session, _) = session_for(vec![Step::Ask("?".to_string())]);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(session.idle_for() >= Duration::from_secs(90));

        session.run("", "", "").await;
        assert!(session.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn test_output_tail() {
        assert_eq!(output_tail("", "a\n"), ("a\n".to_string(), false));
        assert_eq!(output_tail("a\n", "a\nb\n"), ("b\n".to_string(), false));
        assert_eq!(output_tail("a\n", "a\n"), (String::new(), false));
        assert_eq!(output_tail("roll 4\n", "roll 2\nnext\n"), ("2\nnext\n".to_string(), true));
        assert_eq!(output_tail("abc", "ab"), (String::new(), true));
    }

    #[test]
    fn test_strip_one_newline() {
        assert_eq!(strip_one_newline("hello\n"), "hello");
        assert_eq!(strip_one_newline("hello\r\n"), "hello");
        assert_eq!(strip_one_newline("a\n\n"), "a\n");
        assert_eq!(strip_one_newline("\n"), "");
    }
}
