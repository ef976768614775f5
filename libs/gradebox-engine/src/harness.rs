/// Batch Test Harness
///
/// **Core Responsibility:**
/// Grade one program against an ordered list of test cases through a
/// [`Sandbox`], one case at a time.
///
/// **Guarantees:**
/// - Strictly sequential: case N+1 is never submitted before case N returned
/// - Every result is streamed to the observer as soon as it exists
/// - Cancellation stops submission immediately; an in-flight result that
///   returns after cancellation is dropped, never emitted
/// - Individual failures never stop the batch. Only a harness-level
///   infrastructure failure (the service cannot be reached or understood)
///   ends it early
///
/// The harness knows nothing about Redis, HTTP routes or progress storage.
///
/// The local deadline per case is [`submission_budget`] plus one more
/// [`SANDBOX_SLACK`], so a sandbox's own time-limit verdict always arrives
/// before the harness gives up on it.
use crate::diagnostics::clean_error;
use crate::sandbox::{
    submission_budget, EchoMode, ExecutionOutcome, Sandbox, SandboxError, SandboxRequest, SandboxResponse,
    SANDBOX_SLACK,
};
use crate::scaffold::{wrap, ScaffoldMapping};
use gradebox_common::types::{ErrorKind, GradeSummary, StopReason, TestCase, TestResult};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Progress { current: usize, total: usize },
    Result { index: usize, result: TestResult },
}

/// Receives harness events in order. Both methods default to no-ops.
pub trait BatchObserver: Send + Sync {
    fn on_progress(&self, _current: usize, _total: usize) {}
    fn on_result(&self, _index: usize, _result: &TestResult) {}
}

/// Observer that ignores everything
pub struct Silent;

impl BatchObserver for Silent {}

impl BatchObserver for mpsc::UnboundedSender<BatchEvent> {
    fn on_progress(&self, current: usize, total: usize) {
        let _ = self.send(BatchEvent::Progress { current, total });
    }

    fn on_result(&self, index: usize, result: &TestResult) {
        let _ = self.send(BatchEvent::Result {
            index,
            result: result.clone(),
        });
    }
}

/// Outcome of one `run_tests` invocation
#[derive(Debug, Clone)]
pub struct BatchRun {
    /// Results in original case order, one per processed case
    pub results: Vec<TestResult>,
    pub current: usize,
    pub total: usize,
    pub stopped: Option<StopReason>,
    pub cancellation: CancellationToken,
}

impl BatchRun {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Counts are against the full case list, so a cancelled run never scores 100%
    pub fn summary(&self) -> GradeSummary {
        GradeSummary::new(self.passed(), self.total)
    }

    pub fn was_cancelled(&self) -> bool {
        self.stopped == Some(StopReason::Cancelled)
    }
}

/// What happened to a single case
enum CaseOutcome {
    Finished(TestResult),
    /// Emitted, then the batch stops
    Fatal(TestResult),
    Cancelled,
}

pub struct BatchHarness {
    sandbox: Arc<dyn Sandbox>,
    echo_mode: EchoMode,
    current: Mutex<CancellationToken>,
}

impl BatchHarness {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            echo_mode: EchoMode::default(),
            current: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_echo_mode(mut self, echo_mode: EchoMode) -> Self {
        self.echo_mode = echo_mode;
        self
    }

    /// Abort the run in progress, if any
    pub fn cancel(&self) {
        if let Ok(token) = self.current.lock() {
            info!("Batch cancellation requested");
            token.cancel();
        }
    }

    /// Run against an already combined source
    pub async fn run_tests(
        &self,
        source: &str,
        test_cases: &[TestCase],
        timeout_ms: u64,
        observer: &dyn BatchObserver,
    ) -> BatchRun {
        self.run_with_token(
            source,
            &ScaffoldMapping::default(),
            test_cases,
            timeout_ms,
            observer,
            CancellationToken::new(),
        )
        .await
    }

    /// Wrap learner code first so error lines point into the learner's body
    pub async fn run_scaffolded(
        &self,
        header: &str,
        body: &str,
        footer: &str,
        test_cases: &[TestCase],
        timeout_ms: u64,
        observer: &dyn BatchObserver,
        token: CancellationToken,
    ) -> BatchRun {
        let (source, mapping) = wrap(header, body, footer);
        self.run_with_token(&source, &mapping, test_cases, timeout_ms, observer, token)
            .await
    }

    /// Core loop. `token` becomes the target of [`BatchHarness::cancel`] for
    /// the duration of the run, and may also be cancelled by its owner.
    #[tracing::instrument(skip_all, fields(cases = test_cases.len(), timeout_ms = timeout_ms))]
    pub async fn run_with_token(
        &self,
        source: &str,
        mapping: &ScaffoldMapping,
        test_cases: &[TestCase],
        timeout_ms: u64,
        observer: &dyn BatchObserver,
        token: CancellationToken,
    ) -> BatchRun {
        if let Ok(mut current) = self.current.lock() {
            *current = token.clone();
        }

        let total = test_cases.len();
        let mut run = BatchRun {
            results: Vec::with_capacity(total),
            current: 0,
            total,
            stopped: None,
            cancellation: token.clone(),
        };

        info!(total, "Starting batch run");
        observer.on_progress(0, total);

        for (index, case) in test_cases.iter().enumerate() {
            if token.is_cancelled() {
                run.stopped = Some(StopReason::Cancelled);
                break;
            }

            debug!(case = index + 1, total, "Submitting test case");
            let outcome = self
                .run_case(source, mapping, case, timeout_ms, &token)
                .await;

            let (result, fatal) = match outcome {
                CaseOutcome::Finished(result) => (result, false),
                CaseOutcome::Fatal(result) => (result, true),
                CaseOutcome::Cancelled => {
                    info!(case = index + 1, "In-flight result discarded after cancellation");
                    run.stopped = Some(StopReason::Cancelled);
                    break;
                }
            };

            info!(
                case = index + 1,
                total,
                passed = result.passed,
                error_kind = ?result.error_kind,
                "Test case finished"
            );

            observer.on_result(index, &result);
            run.results.push(result);
            run.current = index + 1;
            observer.on_progress(run.current, total);

            if fatal {
                warn!(case = index + 1, "Sandbox infrastructure failure; stopping batch");
                run.stopped = Some(StopReason::Infrastructure);
                break;
            }
        }

        let summary = run.summary();
        info!(
            passed = summary.passed,
            total = summary.total,
            score = summary.score,
            stopped = ?run.stopped,
            "Batch run finished"
        );
        run
    }

    async fn run_case(
        &self,
        source: &str,
        mapping: &ScaffoldMapping,
        case: &TestCase,
        timeout_ms: u64,
        token: &CancellationToken,
    ) -> CaseOutcome {
        let request = SandboxRequest {
            source: source.to_string(),
            stdin: case.input.clone(),
            expected_output: Some(case.expected_output.clone()),
            timeout_ms,
            echo_mode: self.echo_mode,
        };

        let started = Instant::now();
        let submission = tokio::time::timeout(
            submission_budget(timeout_ms) + SANDBOX_SLACK,
            self.sandbox.submit(request),
        );

        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => return CaseOutcome::Cancelled,
            reply = submission => reply,
        };

        // Result arrived while cancel() raced us
        if token.is_cancelled() {
            return CaseOutcome::Cancelled;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match reply {
            Err(_) => CaseOutcome::Finished(timed_out(case, timeout_ms)),
            Ok(Err(e)) => CaseOutcome::Fatal(infrastructure_failure(case, &e)),
            Ok(Ok(response)) => CaseOutcome::Finished(evaluate(
                case,
                response,
                mapping,
                self.sandbox.program_file(),
                timeout_ms,
                elapsed_ms,
            )),
        }
    }
}

fn base_result(case: &TestCase) -> TestResult {
    TestResult {
        input: case.input.clone(),
        expected_output: case.expected_output.clone(),
        actual_output: None,
        passed: false,
        error_kind: None,
        error_message: None,
        execution_time_ms: None,
        hidden: case.hidden,
    }
}

fn timed_out(case: &TestCase, timeout_ms: u64) -> TestResult {
    TestResult {
        error_kind: Some(ErrorKind::SandboxTimeout),
        error_message: Some(format!("Execution timed out after {} ms", timeout_ms)),
        execution_time_ms: Some(timeout_ms),
        ..base_result(case)
    }
}

fn infrastructure_failure(case: &TestCase, error: &SandboxError) -> TestResult {
    TestResult {
        error_kind: Some(ErrorKind::SandboxInfrastructure),
        error_message: Some(error.to_string()),
        ..base_result(case)
    }
}

/// Trimmed at both ends only; internal whitespace and case must match
fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

/// Map a sandbox reply onto a TestResult
fn evaluate(
    case: &TestCase,
    response: SandboxResponse,
    mapping: &ScaffoldMapping,
    program_file: &str,
    timeout_ms: u64,
    elapsed_ms: u64,
) -> TestResult {
    let execution_time_ms = Some(response.time_ms.unwrap_or(elapsed_ms));
    let description = response.status.description();

    match response.status.outcome() {
        ExecutionOutcome::Success => TestResult {
            passed: outputs_match(&response.stdout, &case.expected_output),
            actual_output: Some(response.stdout),
            execution_time_ms,
            ..base_result(case)
        },
        ExecutionOutcome::RuntimeError => {
            let message = if response.stderr.trim().is_empty() {
                description
            } else {
                clean_error(&response.stderr, mapping, program_file).to_string()
            };
            TestResult {
                actual_output: Some(response.stdout),
                error_kind: Some(ErrorKind::SandboxRuntime),
                error_message: Some(message),
                execution_time_ms,
                ..base_result(case)
            }
        }
        ExecutionOutcome::Timeout => TestResult {
            error_kind: Some(ErrorKind::SandboxTimeout),
            error_message: Some(format!("{} after {} ms", description, timeout_ms)),
            execution_time_ms,
            ..base_result(case)
        },
        ExecutionOutcome::InfraError => TestResult {
            error_kind: Some(ErrorKind::SandboxInfrastructure),
            error_message: Some(description),
            execution_time_ms,
            ..base_result(case)
        },
    }
}
